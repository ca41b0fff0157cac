// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Extraction of APM events out of processed traces.
//!
//! The policy is picked once from configuration: per-(service, operation) rates win over the
//! legacy per-service rates, and with neither configured nothing is extracted.

use std::collections::HashMap;

use tracing::debug;

use crate::config::{validate_rate, Config};
use crate::errors::ConfigError;
use crate::model::{ApmEvent, ProcessedTrace, WeightedSpan, PRIORITY_USER_KEEP};
use crate::rate_sampler::sample_by_rate;

#[derive(Debug, Clone, PartialEq)]
pub enum Extractor {
    Analyzed(AnalyzedExtractor),
    LegacyAnalyzed(LegacyAnalyzedExtractor),
    Disabled,
}

impl Extractor {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        if !config.analyzed_spans_by_service.is_empty() {
            debug!(
                "Extracting APM events for {} services by operation name",
                config.analyzed_spans_by_service.len()
            );
            return Ok(Extractor::Analyzed(AnalyzedExtractor::new(
                config.analyzed_spans_by_service.clone(),
                config.max_events_per_trace,
            )?));
        }
        if !config.analyzed_rate_by_service_legacy.is_empty() {
            debug!(
                "Extracting APM events for {} services using legacy per-service rates",
                config.analyzed_rate_by_service_legacy.len()
            );
            return Ok(Extractor::LegacyAnalyzed(LegacyAnalyzedExtractor::new(
                config.analyzed_rate_by_service_legacy.clone(),
                config.max_events_per_trace,
            )?));
        }
        debug!("APM event extraction disabled");
        Ok(Extractor::Disabled)
    }

    /// Extracts the events of a trace, in trace order. `trace_sampled` is the priority engine's
    /// verdict for the whole trace and is carried on every event.
    pub fn extract<'a>(&self, trace: &'a ProcessedTrace, trace_sampled: bool) -> Vec<ApmEvent<'a>> {
        match self {
            Extractor::Analyzed(extractor) => extractor.extract(trace, trace_sampled),
            Extractor::LegacyAnalyzed(extractor) => extractor.extract(trace, trace_sampled),
            Extractor::Disabled => Vec::new(),
        }
    }
}

fn cap_reached(max_events_per_trace: i64, extracted: usize) -> bool {
    max_events_per_trace >= 0 && extracted as u64 >= max_events_per_trace as u64
}

/// Extracts spans matching a (service, operation) pair at the pair's rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzedExtractor {
    analyzed_spans_by_service: HashMap<String, HashMap<String, f64>>,
    max_events_per_trace: i64,
}

impl AnalyzedExtractor {
    pub fn new(
        analyzed_spans_by_service: HashMap<String, HashMap<String, f64>>,
        max_events_per_trace: i64,
    ) -> Result<Self, ConfigError> {
        for (service, operations) in &analyzed_spans_by_service {
            for (operation, rate) in operations {
                validate_rate(&format!("{service}|{operation}"), *rate)?;
            }
        }
        Ok(Self {
            analyzed_spans_by_service,
            max_events_per_trace,
        })
    }

    pub fn extract<'a>(&self, trace: &'a ProcessedTrace, trace_sampled: bool) -> Vec<ApmEvent<'a>> {
        let priority = trace.sampling_priority();
        let mut events = Vec::new();

        for weighted_span in &trace.weighted_trace {
            if !self.should_analyze(weighted_span, priority) {
                continue;
            }
            if cap_reached(self.max_events_per_trace, events.len()) {
                break;
            }
            events.push(ApmEvent::new(&weighted_span.span, trace_sampled));
        }

        events
    }

    fn should_analyze(&self, weighted_span: &WeightedSpan, priority: Option<i32>) -> bool {
        let span = &weighted_span.span;
        let Some(rate) = self
            .analyzed_spans_by_service
            .get(&span.service)
            .and_then(|operations| operations.get(&span.name))
        else {
            return false;
        };
        // Manually kept traces keep every matching span
        let user_keep = priority.is_some_and(|p| p >= PRIORITY_USER_KEEP);
        user_keep || sample_by_rate(span.trace_id, *rate)
    }
}

/// Extracts top-level spans of the configured services at the service's rate. The sampling
/// priority is ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyAnalyzedExtractor {
    analyzed_rate_by_service: HashMap<String, f64>,
    max_events_per_trace: i64,
}

impl LegacyAnalyzedExtractor {
    pub fn new(
        analyzed_rate_by_service: HashMap<String, f64>,
        max_events_per_trace: i64,
    ) -> Result<Self, ConfigError> {
        for (service, rate) in &analyzed_rate_by_service {
            validate_rate(service, *rate)?;
        }
        Ok(Self {
            analyzed_rate_by_service,
            max_events_per_trace,
        })
    }

    pub fn extract<'a>(&self, trace: &'a ProcessedTrace, trace_sampled: bool) -> Vec<ApmEvent<'a>> {
        let mut events = Vec::new();

        for weighted_span in &trace.weighted_trace {
            // The cap is checked before eligibility here, unlike the analyzed extractor.
            if cap_reached(self.max_events_per_trace, events.len()) {
                break;
            }
            if self.should_analyze(weighted_span) {
                events.push(ApmEvent::new(&weighted_span.span, trace_sampled));
            }
        }

        events
    }

    fn should_analyze(&self, weighted_span: &WeightedSpan) -> bool {
        if !weighted_span.top_level {
            return false;
        }
        let span = &weighted_span.span;
        self.analyzed_rate_by_service
            .get(&span.service)
            .is_some_and(|rate| sample_by_rate(span.trace_id, *rate))
    }
}
