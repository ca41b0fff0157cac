// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-window aggregation of span statistics.
//!
//! Every span handed to a bucket is accounted under two tag sets, `{service}` and
//! `{service, resource}`. Each tag set gets `hits`, `errors` and `duration` counts and a
//! `duration` distribution, plus whatever custom metrics the bucket was built with.

use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::model::{ProcessedTrace, Span};
use crate::summary::GkSummary;
use crate::tags::{Tag, TagSet};

pub const HITS: &str = "hits";
pub const ERRORS: &str = "errors";
pub const DURATION: &str = "duration";

const DEFAULT_COUNTS: [&str; 3] = [HITS, ERRORS, DURATION];
const DEFAULT_DISTRIBUTIONS: [&str; 1] = [DURATION];

/// Current time in nanoseconds since the epoch.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or_default()
}

#[allow(clippy::panic)]
fn custom_metric(span: &Span, metric: &str) -> f64 {
    match span.metrics.get(metric) {
        Some(value) => *value,
        None => panic!(
            "Span {} does not carry the metric {metric} this stats bucket aggregates",
            span.span_id
        ),
    }
}

/// Built-in metrics followed by the extra ones, without duplicates.
fn metric_names(defaults: &[&str], extra: &[String]) -> Vec<String> {
    let mut names: Vec<String> = defaults.iter().map(ToString::to_string).collect();
    for name in extra {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names
}

/// One metric accumulated over a tag set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Count {
    pub key: String,
    pub name: String,
    pub tagset: TagSet,
    pub value: i64,
}

impl Count {
    fn new(key: String, name: &str, tagset: TagSet) -> Self {
        Self {
            key,
            name: name.to_string(),
            tagset,
            value: 0,
        }
    }

    fn add(&mut self, span: &Span) {
        self.value += match self.name.as_str() {
            HITS => 1,
            ERRORS => i64::from(span.is_error()),
            DURATION => span.duration,
            metric => custom_metric(span, metric) as i64,
        };
    }
}

/// Quantile summary of one metric over a tag set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Distribution {
    pub key: String,
    pub name: String,
    pub tagset: TagSet,
    pub summary: GkSummary,
}

impl Distribution {
    fn new(key: String, name: &str, tagset: TagSet, epsilon: f64) -> Self {
        Self {
            key,
            name: name.to_string(),
            tagset,
            summary: GkSummary::new(epsilon),
        }
    }

    fn add(&mut self, span: &Span) {
        let value = match self.name.as_str() {
            DURATION => span.duration as f64,
            metric => custom_metric(span, metric),
        };
        self.summary.insert(value, span.span_id);
    }
}

/// Statistics of the spans seen during one time window.
///
/// A bucket has a single writer. Once [`StatsBucket::close`] sets its duration it is frozen and
/// can be serialized.
#[derive(Debug, Clone)]
pub struct StatsBucket {
    start: i64,
    duration: Option<i64>,
    epsilon: f64,
    count_metrics: Vec<String>,
    distribution_metrics: Vec<String>,
    counts: HashMap<String, Count>,
    distributions: HashMap<String, Distribution>,
}

impl StatsBucket {
    /// Opens a bucket starting at `start` (nanoseconds since the epoch).
    pub fn new(start: i64, epsilon: f64) -> Self {
        Self::with_metrics(start, epsilon, &[], &[])
    }

    /// Opens a bucket that also aggregates the given span metrics. Every span handed to it must
    /// carry them. Names already aggregated, built-in or repeated, are only aggregated once.
    pub fn with_metrics(
        start: i64,
        epsilon: f64,
        extra_counts: &[String],
        extra_distributions: &[String],
    ) -> Self {
        let count_metrics = metric_names(&DEFAULT_COUNTS, extra_counts);
        let distribution_metrics = metric_names(&DEFAULT_DISTRIBUTIONS, extra_distributions);

        Self {
            start,
            duration: None,
            epsilon,
            count_metrics,
            distribution_metrics,
            counts: HashMap::new(),
            distributions: HashMap::new(),
        }
    }

    /// Opens an empty bucket over the same metrics, starting at `start`.
    pub fn next(&self, start: i64) -> Self {
        Self {
            start,
            duration: None,
            epsilon: self.epsilon,
            count_metrics: self.count_metrics.clone(),
            distribution_metrics: self.distribution_metrics.clone(),
            counts: HashMap::new(),
            distributions: HashMap::new(),
        }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn duration(&self) -> Option<i64> {
        self.duration
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn is_closed(&self) -> bool {
        self.duration.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn count(&self, key: &str) -> Option<&Count> {
        self.counts.get(key)
    }

    pub fn distribution(&self, key: &str) -> Option<&Distribution> {
        self.distributions.get(key)
    }

    pub fn counts(&self) -> impl Iterator<Item = &Count> {
        self.counts.values()
    }

    pub fn distributions(&self) -> impl Iterator<Item = &Distribution> {
        self.distributions.values()
    }

    #[allow(clippy::panic)]
    pub fn handle_span(&mut self, span: &Span) {
        if self.is_closed() {
            panic!(
                "Span {} added to the stats bucket started at {} after it was closed",
                span.span_id, self.start
            );
        }

        let service = Tag::new("service", span.service.as_str());
        let resource = Tag::new("resource", span.resource.as_str());
        let by_service = TagSet::new(vec![service.clone()]);
        let by_service_resource = TagSet::new(vec![service, resource]);

        self.add_to_tag_set(span, &by_service);
        self.add_to_tag_set(span, &by_service_resource);
    }

    pub fn handle_trace(&mut self, trace: &ProcessedTrace) {
        for weighted_span in &trace.weighted_trace {
            self.handle_span(&weighted_span.span);
        }
    }

    fn add_to_tag_set(&mut self, span: &Span, tagset: &TagSet) {
        for metric in &self.count_metrics {
            self.counts
                .entry(tagset.key(metric))
                .or_insert_with_key(|key| Count::new(key.clone(), metric, tagset.clone()))
                .add(span);
        }
        for metric in &self.distribution_metrics {
            let epsilon = self.epsilon;
            self.distributions
                .entry(tagset.key(metric))
                .or_insert_with_key(|key| {
                    Distribution::new(key.clone(), metric, tagset.clone(), epsilon)
                })
                .add(span);
        }
    }

    /// Closes the window at `now` and compacts the distributions for serialization.
    pub fn close(&mut self, now: i64) {
        self.duration = Some(now - self.start);
        for distribution in self.distributions.values_mut() {
            distribution.summary.encode();
        }
    }
}

impl Serialize for StatsBucket {
    #[allow(clippy::panic)]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Some(duration) = self.duration else {
            panic!(
                "Trying to serialize the stats bucket started at {} before it was closed",
                self.start
            );
        };

        let mut counts: Vec<&Count> = self.counts.values().collect();
        counts.sort_by(|a, b| a.key.cmp(&b.key));
        let mut distributions: Vec<&Distribution> = self.distributions.values().collect();
        distributions.sort_by(|a, b| a.key.cmp(&b.key));

        let mut state = serializer.serialize_struct("StatsBucket", 5)?;
        state.serialize_field("start", &self.start)?;
        state.serialize_field("duration", &duration)?;
        state.serialize_field("epsilon", &self.epsilon)?;
        state.serialize_field("counts", &counts)?;
        state.serialize_field("distributions", &distributions)?;
        state.end()
    }
}
