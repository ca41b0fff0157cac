// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use datadog_apm_events::model::{ProcessedTrace, Span, SAMPLING_PRIORITY_KEY};
use std::time::UNIX_EPOCH;

pub fn create_span(trace_id: u64, span_id: u64, parent_id: u64, service: &str, name: &str) -> Span {
    Span {
        service: service.to_string(),
        name: name.to_string(),
        resource: format!("{name} resource"),
        trace_id,
        span_id,
        parent_id,
        start: UNIX_EPOCH.elapsed().unwrap().as_nanos() as i64,
        duration: 5_000_000,
        ..Default::default()
    }
}

/// A `web` root calling a `db` child, both tagged with `priority` when set.
pub fn create_web_trace(trace_id: u64, priority: Option<i32>) -> ProcessedTrace {
    let mut root = create_span(trace_id, 1, 0, "web", "http.request");
    let mut child = create_span(trace_id, 2, 1, "db", "postgres.query");
    if let Some(priority) = priority {
        root.metrics
            .insert(SAMPLING_PRIORITY_KEY.to_string(), f64::from(priority));
        child
            .metrics
            .insert(SAMPLING_PRIORITY_KEY.to_string(), f64::from(priority));
    }
    ProcessedTrace::new(vec![root, child], "prod")
}
