// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Errors detected while building the pipeline from its configuration. Any of them means the
/// pipeline refuses to start.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid extraction rate {rate} for {target}: rates must be within [0, 1]")]
    InvalidRate { target: String, rate: f64 },

    #[error("Invalid max events per second {0}: must be strictly positive")]
    InvalidMaxEps(f64),

    #[error("Invalid decay period {0:?}: must be strictly positive")]
    InvalidDecayPeriod(Duration),

    #[error("Invalid decay factor {0}: must be greater than 1")]
    InvalidDecayFactor(f64),

    #[error("Invalid stats bucket interval {0:?}: must be strictly positive")]
    InvalidBucketInterval(Duration),

    #[error("Invalid stats epsilon {0}: must be within (0, 1)")]
    InvalidEpsilon(f64),

    #[error("Unable to parse {key}: {reason}")]
    Parse { key: &'static str, reason: String },
}
