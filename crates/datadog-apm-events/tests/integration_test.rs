// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use datadog_apm_events::{
    config::Config,
    event_processor::EventProcessor,
    model::ProcessedTrace,
    stats_concentrator_service::StatsConcentratorService,
};
use serial_test::serial;
use std::env;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod common;
use common::helpers::{create_span, create_web_trace};

const ENV_VARS: [&str; 4] = [
    "DD_APM_ANALYZED_SPANS",
    "DD_APM_ANALYZED_RATE_BY_SERVICE",
    "DD_APM_MAX_EPS",
    "DD_MAX_EPS",
];

fn clear_env() {
    for key in ENV_VARS {
        env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_events_from_env_config() {
    clear_env();
    env::set_var(
        "DD_APM_ANALYZED_SPANS",
        "web|http.request=1,db|postgres.query=1",
    );
    let config = Config::new().expect("config from env");
    clear_env();

    let processor = EventProcessor::from_config(&config).expect("processor");
    let trace = create_web_trace(11, None);
    let events = processor.process(&trace, true);

    let names: Vec<&str> = events.iter().map(|event| event.span.name.as_str()).collect();
    assert_eq!(names, vec!["http.request", "postgres.query"]);
    assert!(events.iter().all(|event| event.trace_sampled));
}

#[test]
#[serial]
fn test_legacy_events_only_for_top_level_spans() {
    clear_env();
    env::set_var("DD_APM_ANALYZED_RATE_BY_SERVICE", "web=1");
    let config = Config::new().expect("config from env");
    clear_env();

    let processor = EventProcessor::from_config(&config).expect("processor");
    // The child shares the root's service, so only the root is top-level
    let trace = ProcessedTrace::new(
        vec![
            create_span(12, 1, 0, "web", "http.request"),
            create_span(12, 2, 1, "web", "template.render"),
        ],
        "prod",
    );

    let events = processor.process(&trace, false);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].span.span_id, 1);
}

#[test]
#[serial]
fn test_invalid_env_config_refuses_to_start() {
    clear_env();
    env::set_var("DD_APM_ANALYZED_SPANS", "web|http.request=1.5");
    let result = Config::new();
    clear_env();
    assert!(result.is_err());
}

#[test]
fn test_max_eps_budget_applies_to_dropped_traces_only() {
    let config: Config = serde_json::from_str(
        r#"{
            "analyzed_spans_by_service": {"web": {"http.request": 1.0}},
            "max_eps": 1
        }"#,
    )
    .expect("config");
    let processor = EventProcessor::from_config(&config).expect("processor");

    let traces: Vec<ProcessedTrace> = (1..=2_000u64)
        .map(|i| create_web_trace(i.wrapping_mul(0x9e37_79b9_7f4a_7c15), None))
        .collect();

    let kept: usize = traces
        .iter()
        .map(|trace| processor.process(trace, false).len())
        .sum();
    // The budget starts throttling once the estimate goes over 1 event/s
    assert!(kept > 40, "kept {kept}");
    assert!(kept < 600, "kept {kept}");

    // Events of kept traces are never throttled, even with the budget exhausted
    let kept: usize = traces
        .iter()
        .map(|trace| processor.process(trace, true).len())
        .sum();
    assert_eq!(kept, traces.len());
}

#[test]
fn test_user_keep_overrides_extraction_rate() {
    let config: Config = serde_json::from_str(
        r#"{"analyzed_spans_by_service": {"web": {"http.request": 0.0}}}"#,
    )
    .expect("config");
    let processor = EventProcessor::from_config(&config).expect("processor");

    assert!(processor.process(&create_web_trace(13, None), true).is_empty());
    assert!(processor.process(&create_web_trace(13, Some(1)), true).is_empty());
    assert_eq!(processor.process(&create_web_trace(13, Some(2)), true).len(), 1);
}

#[tokio::test]
async fn test_stats_from_traces_to_json() {
    let config = Config::default();
    let (flushed_tx, _flushed_rx) = mpsc::channel(10);
    let cancel_token = CancellationToken::new();
    let (service, handle) =
        StatsConcentratorService::new(&config, flushed_tx, cancel_token.clone())
            .expect("stats service");
    let task = tokio::spawn(service.run());

    for trace_id in 1..=10 {
        handle.add_trace(&create_web_trace(trace_id, None));
    }
    let bucket = handle.flush().await.expect("flush");
    let json = serde_json::to_value(&bucket).expect("serialize bucket");

    assert_eq!(json["epsilon"], 0.01);
    assert!(json["duration"].as_i64().expect("duration") >= 0);

    let hits = json["counts"]
        .as_array()
        .expect("counts")
        .iter()
        .find(|count| count["key"] == "service:web|hits")
        .expect("web hits");
    assert_eq!(hits["value"], 10);

    let distributions = json["distributions"].as_array().expect("distributions");
    // {service} and {service, resource} for each of web and db
    assert_eq!(distributions.len(), 4);
    assert!(distributions
        .iter()
        .all(|distribution| distribution["summary"]["n"] == 10));

    cancel_token.cancel();
    task.await.expect("stats service task");
}

#[tokio::test]
async fn test_processor_lifecycle() {
    let processor = EventProcessor::from_config(&Config::default()).expect("processor");
    processor.start();
    processor.stop();
    processor.join().await;
    assert_eq!(processor.events_per_second(), 0.0);
}
