// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::errors::ConfigError;
use crate::event_sampler::{self, BatchSampler, SamplerChain};
use crate::extractor::Extractor;
use crate::model::{ApmEvent, ProcessedTrace};
use crate::rate_counter::{DecayingRateCounter, RateCounter};

/// Extracts APM events from processed traces and samples them against the events-per-second
/// budget.
///
/// The processor owns the rate counter shared by its samplers, so it is the one to start and stop
/// the decay task.
pub struct EventProcessor {
    extractor: Extractor,
    sampler: BatchSampler<SamplerChain>,
    rate_counter: Arc<DecayingRateCounter>,
}

impl EventProcessor {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let extractor = Extractor::from_config(config)?;
        let rate_counter = Arc::new(DecayingRateCounter::new(
            config.decay_period,
            config.decay_factor,
        )?);
        let sampler = event_sampler::from_config(config, rate_counter.clone())?;

        Ok(Self {
            extractor,
            sampler,
            rate_counter,
        })
    }

    pub fn start(&self) {
        self.rate_counter.start();
    }

    pub fn stop(&self) {
        self.rate_counter.stop();
    }

    /// Waits for the background work to exit after [`Self::stop`].
    pub async fn join(&self) {
        self.rate_counter.join().await;
    }

    /// Current estimate of the events per second offered to the max-EPS budget.
    pub fn events_per_second(&self) -> f64 {
        self.rate_counter.sampled_score()
    }

    /// Returns the events of `trace` that survived extraction and sampling, in trace order.
    pub fn process<'a>(&self, trace: &'a ProcessedTrace, trace_sampled: bool) -> Vec<ApmEvent<'a>> {
        let extracted = self.extractor.extract(trace, trace_sampled);
        if extracted.is_empty() {
            return extracted;
        }
        let kept = self.sampler.sample_batch(&extracted);
        debug!(
            "Kept {} of {} APM events extracted from trace {}",
            kept.len(),
            extracted.len(),
            trace.root_span().map(|span| span.trace_id).unwrap_or_default()
        );
        kept
    }
}
