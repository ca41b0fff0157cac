// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace data model consumed by the extractor, the event samplers and the stats buckets.

use std::collections::{HashMap, HashSet};

/// Root span metric carrying the client-assigned sampling priority.
pub const SAMPLING_PRIORITY_KEY: &str = "_sampling_priority_v1";

/// Span metric carrying the client-side pre-sampling rate.
pub const SAMPLE_RATE_METRIC_KEY: &str = "_sample_rate";

/// Sampling priority at and above which the user asked for the trace to be kept.
pub const PRIORITY_USER_KEEP: i32 = 2;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Span {
    pub service: String,
    pub name: String,
    pub resource: String,
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_id: u64,
    /// Nanoseconds since epoch.
    pub start: i64,
    /// Nanoseconds.
    pub duration: i64,
    pub error: i32,
    pub meta: HashMap<String, String>,
    pub metrics: HashMap<String, f64>,
}

impl Span {
    pub fn is_error(&self) -> bool {
        self.error != 0
    }
}

/// A span together with the flags derived when the trace was processed.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedSpan {
    pub span: Span,
    /// Inverse of the client-side pre-sampling probability, always >= 1.
    pub weight: f64,
    pub top_level: bool,
}

impl WeightedSpan {
    pub fn new(span: Span, weight: f64, top_level: bool) -> Self {
        Self {
            span,
            weight,
            top_level,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedTrace {
    pub weighted_trace: Vec<WeightedSpan>,
    /// Index of the root span in `weighted_trace`.
    pub root: usize,
    pub env: String,
}

impl ProcessedTrace {
    /// Builds a processed trace out of the raw spans of a single trace, locating the root and
    /// computing top-level flags and weights.
    pub fn new(spans: Vec<Span>, env: impl Into<String>) -> Self {
        let root = root_span_index(&spans);
        let top_level = compute_top_level(&spans);
        let weighted_trace = spans
            .into_iter()
            .zip(top_level)
            .map(|(span, top_level)| {
                let weight = span_weight(&span);
                WeightedSpan::new(span, weight, top_level)
            })
            .collect();

        Self {
            weighted_trace,
            root,
            env: env.into(),
        }
    }

    pub fn root_span(&self) -> Option<&Span> {
        self.weighted_trace.get(self.root).map(|ws| &ws.span)
    }

    /// Returns the sampling priority set on the root span, if any.
    ///
    /// A missing priority is distinct from a priority of zero.
    pub fn sampling_priority(&self) -> Option<i32> {
        self.root_span()?
            .metrics
            .get(SAMPLING_PRIORITY_KEY)
            .map(|p| *p as i32)
    }

    pub fn weight(&self) -> f64 {
        self.weighted_trace
            .get(self.root)
            .map_or(1.0, |ws| ws.weight)
    }
}

/// A span promoted out of its trace for per-span downstream processing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ApmEvent<'a> {
    pub span: &'a Span,
    /// Whether the priority engine kept the enclosing trace.
    pub trace_sampled: bool,
}

impl<'a> ApmEvent<'a> {
    pub fn new(span: &'a Span, trace_sampled: bool) -> Self {
        Self {
            span,
            trace_sampled,
        }
    }

    pub fn trace_id(&self) -> u64 {
        self.span.trace_id
    }
}

/// Weight of a span given its client-side pre-sampling rate, 1 when the rate is unset or invalid.
pub fn span_weight(span: &Span) -> f64 {
    match span.metrics.get(SAMPLE_RATE_METRIC_KEY) {
        Some(&rate) if rate > 0.0 && rate <= 1.0 => 1.0 / rate,
        _ => 1.0,
    }
}

/// A span is top-level if it is a root, if its parent is not part of the trace, or if its parent
/// belongs to another service.
pub fn compute_top_level(spans: &[Span]) -> Vec<bool> {
    let service_by_span_id: HashMap<u64, &str> = spans
        .iter()
        .map(|span| (span.span_id, span.service.as_str()))
        .collect();

    spans
        .iter()
        .map(|span| {
            if span.parent_id == 0 {
                return true;
            }
            match service_by_span_id.get(&span.parent_id) {
                Some(parent_service) => *parent_service != span.service,
                None => true,
            }
        })
        .collect()
}

/// Index of the root span: the span without parent, else the first span whose parent is not in
/// the trace, else the last span.
pub fn root_span_index(spans: &[Span]) -> usize {
    if let Some(idx) = spans.iter().position(|span| span.parent_id == 0) {
        return idx;
    }
    let span_ids: HashSet<u64> = spans.iter().map(|span| span.span_id).collect();
    spans
        .iter()
        .position(|span| !span_ids.contains(&span.parent_id))
        .unwrap_or_else(|| spans.len().saturating_sub(1))
}


#[cfg(test)]
mod tests {
    use super::test_utils::create_test_span;
    use super::*;

    #[test]
    fn test_top_level_detection() {
        let spans = vec![
            create_test_span(1, 10, 0, "web"),
            create_test_span(1, 11, 10, "web"),
            create_test_span(1, 12, 11, "db"),
            create_test_span(1, 13, 99, "web"),
        ];
        assert_eq!(compute_top_level(&spans), vec![true, false, true, true]);
    }

    #[test]
    fn test_root_span_index() {
        let spans = vec![
            create_test_span(1, 11, 10, "web"),
            create_test_span(1, 10, 0, "web"),
        ];
        assert_eq!(root_span_index(&spans), 1);

        // Partial trace, the root is the span whose parent is missing
        let spans = vec![
            create_test_span(1, 12, 11, "web"),
            create_test_span(1, 11, 10, "web"),
        ];
        assert_eq!(root_span_index(&spans), 1);

        assert_eq!(root_span_index(&[]), 0);
    }

    #[test]
    fn test_span_weight() {
        let mut span = Span::default();
        assert_eq!(span_weight(&span), 1.0);

        span.metrics.insert(SAMPLE_RATE_METRIC_KEY.to_string(), 0.25);
        assert_eq!(span_weight(&span), 4.0);

        span.metrics.insert(SAMPLE_RATE_METRIC_KEY.to_string(), 0.0);
        assert_eq!(span_weight(&span), 1.0);

        span.metrics.insert(SAMPLE_RATE_METRIC_KEY.to_string(), 1.5);
        assert_eq!(span_weight(&span), 1.0);
    }

    #[test]
    fn test_sampling_priority() {
        let mut root = create_test_span(1, 10, 0, "web");
        let trace = ProcessedTrace::new(vec![root.clone()], "prod");
        assert_eq!(trace.sampling_priority(), None);

        root.metrics.insert(SAMPLING_PRIORITY_KEY.to_string(), 0.0);
        let trace = ProcessedTrace::new(vec![root.clone()], "prod");
        assert_eq!(trace.sampling_priority(), Some(0));

        root.metrics.insert(SAMPLING_PRIORITY_KEY.to_string(), 2.0);
        root.metrics.insert(SAMPLE_RATE_METRIC_KEY.to_string(), 0.5);
        let trace = ProcessedTrace::new(vec![root], "prod");
        assert_eq!(trace.sampling_priority(), Some(2));
        assert_eq!(trace.weight(), 2.0);
        assert_eq!(trace.env, "prod");
    }
}
