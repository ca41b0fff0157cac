// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sampling of extracted APM events.
//!
//! Events whose trace was kept by the priority engine are always kept. The others share a
//! process-wide events-per-second budget enforced by [`MaxEpsSampler`].

use std::sync::Arc;

use derive_more::Display;
use tracing::trace;

use crate::config::Config;
use crate::errors::ConfigError;
use crate::model::ApmEvent;
use crate::rate_counter::{RateCounter, ReadOnlyRateCounter};
use crate::rate_sampler::sample_by_rate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SamplingDecision {
    #[display("sample")]
    Sample,
    #[display("drop")]
    Drop,
    /// Lets the next sampler of a chain decide.
    #[display("abstain")]
    Abstain,
}

/// Decides whether an APM event is kept.
pub trait EventSampler: Send + Sync {
    fn sample(&self, event: &ApmEvent<'_>) -> SamplingDecision;
}

/// Keeps every event of a trace the priority engine kept, abstains otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampledTraceSampler;

impl EventSampler for SampledTraceSampler {
    fn sample(&self, event: &ApmEvent<'_>) -> SamplingDecision {
        if event.trace_sampled {
            SamplingDecision::Sample
        } else {
            SamplingDecision::Abstain
        }
    }
}

/// Keeps events at a rate that brings the counted throughput down to `max_eps`.
///
/// The sampler only reads the shared counter; whoever owns the counter is responsible for feeding
/// it.
#[derive(Debug, Clone)]
pub struct MaxEpsSampler {
    max_eps: f64,
    rate_counter: ReadOnlyRateCounter,
}

impl MaxEpsSampler {
    pub fn new(max_eps: f64, rate_counter: ReadOnlyRateCounter) -> Result<Self, ConfigError> {
        if !max_eps.is_finite() || max_eps <= 0.0 {
            return Err(ConfigError::InvalidMaxEps(max_eps));
        }
        Ok(Self {
            max_eps,
            rate_counter,
        })
    }

    /// Rate currently applied to events, in [0, 1].
    pub fn current_rate(&self) -> f64 {
        let current_eps = self.rate_counter.sampled_score();
        if current_eps > self.max_eps {
            self.max_eps / current_eps
        } else {
            1.0
        }
    }
}

impl EventSampler for MaxEpsSampler {
    fn sample(&self, event: &ApmEvent<'_>) -> SamplingDecision {
        if sample_by_rate(event.trace_id(), self.current_rate()) {
            SamplingDecision::Sample
        } else {
            SamplingDecision::Drop
        }
    }
}

pub type DecisionCallback = Box<dyn Fn(SamplingDecision, &ApmEvent<'_>) + Send + Sync>;

/// Submits an event to a sequence of samplers and returns the first decision that is not
/// [`SamplingDecision::Abstain`]. The callback sees every such decision exactly once.
pub struct SamplerChain {
    samplers: Vec<Box<dyn EventSampler>>,
    callback: DecisionCallback,
}

impl SamplerChain {
    pub fn new(samplers: Vec<Box<dyn EventSampler>>, callback: DecisionCallback) -> Self {
        Self { samplers, callback }
    }
}

impl EventSampler for SamplerChain {
    fn sample(&self, event: &ApmEvent<'_>) -> SamplingDecision {
        for sampler in &self.samplers {
            let decision = sampler.sample(event);
            if decision != SamplingDecision::Abstain {
                (self.callback)(decision, event);
                return decision;
            }
        }
        SamplingDecision::Abstain
    }
}

/// Samples collections of events, keeping only those whose decision is
/// [`SamplingDecision::Sample`].
pub struct BatchSampler<S = SamplerChain> {
    sampler: S,
}

impl<S: EventSampler> BatchSampler<S> {
    pub fn new(sampler: S) -> Self {
        Self { sampler }
    }

    /// Returns the kept events, in input order.
    pub fn sample_batch<'a>(&self, events: &[ApmEvent<'a>]) -> Vec<ApmEvent<'a>> {
        let mut kept = Vec::with_capacity(events.len());
        for event in events {
            let decision = self.sampler.sample(event);
            trace!(
                trace_id = event.span.trace_id,
                span_id = event.span.span_id,
                %decision,
                "APM event sampling decision"
            );
            if decision == SamplingDecision::Sample {
                kept.push(*event);
            }
        }
        kept
    }
}

/// Builds the standard chain: events of kept traces first, then the max-EPS budget for the rest.
///
/// The chain callback is the only writer of `rate_counter`. It counts every event the max-EPS
/// sampler ruled on, dropped ones included, not only the events it kept. The counter thus tracks
/// the throughput offered to the budget and `max_eps / offered` keeps `max_eps` events per
/// second; counting kept events alone would settle at `sqrt(max_eps * offered)`.
pub fn event_sampler_chain(
    max_eps: f64,
    rate_counter: Arc<dyn RateCounter>,
) -> Result<SamplerChain, ConfigError> {
    let max_eps_sampler =
        MaxEpsSampler::new(max_eps, ReadOnlyRateCounter::new(Arc::clone(&rate_counter)))?;

    Ok(SamplerChain::new(
        vec![Box::new(SampledTraceSampler), Box::new(max_eps_sampler)],
        Box::new(move |_decision: SamplingDecision, event: &ApmEvent<'_>| {
            // Events of kept traces bypass the budget and are not counted against it
            if !event.trace_sampled {
                rate_counter.count();
            }
        }),
    ))
}

pub fn from_config(
    config: &Config,
    rate_counter: Arc<dyn RateCounter>,
) -> Result<BatchSampler<SamplerChain>, ConfigError> {
    Ok(BatchSampler::new(event_sampler_chain(
        config.max_eps,
        rate_counter,
    )?))
}
