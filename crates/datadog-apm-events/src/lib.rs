// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! APM event extraction and sampling for the trace agent.
//!
//! Given a processed trace and the verdict of the trace-level priority engine, this crate decides
//! which individual spans get promoted to APM events, keeps the residual event throughput under a
//! process-wide events-per-second budget, and aggregates span stats into time buckets.
//!
//! ```text
//! ProcessedTrace -> Extractor -> candidate events -> BatchSampler(SamplerChain) -> emitted events
//!                                                          |
//!                                                 DecayingRateCounter
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod errors;
pub mod event_processor;
pub mod event_sampler;
pub mod extractor;
pub mod model;
pub mod rate_counter;
pub mod rate_sampler;
pub mod stats_bucket;
pub mod stats_concentrator_service;
pub mod summary;
pub mod tags;
