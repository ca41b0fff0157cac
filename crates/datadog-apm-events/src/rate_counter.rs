// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-decayed estimate of a per-second rate.
//!
//! The estimate is an exponentially weighted count: every call to [`RateCounter::count`] adds one
//! to a score and a background task shrinks the score by `decay_factor` every `decay_period`.
//! Under a constant input rate `r` the score converges to
//! `r * decay_period * decay_factor / (decay_factor - 1)`, which is what
//! [`DecayingRateCounter::sampled_score`] divides out.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::errors::ConfigError;

pub const DEFAULT_DECAY_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_DECAY_FACTOR: f64 = 1.125;

/// Keeps track of a rate of occurrences per second.
pub trait RateCounter: Debug + Send + Sync {
    /// Starts the background work backing the estimate, if any.
    fn start(&self);
    /// Stops the background work. Idempotent.
    fn stop(&self);
    /// Records one occurrence.
    fn count(&self);
    /// Current estimate of occurrences per second.
    fn sampled_score(&self) -> f64;
}

/// An `f64` updated with compare-and-swap loops so concurrent adds and decays never lose updates.
#[derive(Debug, Default)]
struct AtomicScore(AtomicU64);

impl AtomicScore {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn update(&self, f: impl Fn(f64) -> f64) {
        // The closure always returns Some, so fetch_update cannot fail.
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(f(f64::from_bits(bits)).to_bits())
            });
    }

    fn decay(&self, factor: f64) {
        self.update(|score| score / factor);
    }
}

#[derive(Debug)]
pub struct DecayingRateCounter {
    score: Arc<AtomicScore>,
    decay_period: Duration,
    decay_factor: f64,
    cancel_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for DecayingRateCounter {
    fn default() -> Self {
        Self::build(DEFAULT_DECAY_PERIOD, DEFAULT_DECAY_FACTOR)
    }
}

impl DecayingRateCounter {
    pub fn new(decay_period: Duration, decay_factor: f64) -> Result<Self, ConfigError> {
        if decay_period.is_zero() {
            return Err(ConfigError::InvalidDecayPeriod(decay_period));
        }
        if !decay_factor.is_finite() || decay_factor <= 1.0 {
            return Err(ConfigError::InvalidDecayFactor(decay_factor));
        }
        Ok(Self::build(decay_period, decay_factor))
    }

    fn build(decay_period: Duration, decay_factor: f64) -> Self {
        Self {
            score: Arc::new(AtomicScore::default()),
            decay_period,
            decay_factor,
            cancel_token: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn decay_period(&self) -> Duration {
        self.decay_period
    }

    pub fn decay_factor(&self) -> f64 {
        self.decay_factor
    }

    /// Raw decayed score.
    pub fn score(&self) -> f64 {
        self.score.load()
    }

    /// Shrinks the score by `decay_factor`. Called by the decay task once per period.
    pub fn decay(&self) {
        self.score.decay(self.decay_factor);
    }

    /// Same quantity as [`Self::sampled_score`]; the value may overshoot the true rate by up to one
    /// period's worth of aliasing, which callers treating it as an upper bound accept.
    pub fn upper_sampled_score(&self) -> f64 {
        self.sampled_score()
    }

    /// Waits for the decay task to exit after [`RateCounter::stop`].
    pub async fn join(&self) {
        #[allow(clippy::expect_used)]
        let handle = self.task.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Decay task failed: {e}");
            }
        }
    }
}

impl RateCounter for DecayingRateCounter {
    fn start(&self) {
        #[allow(clippy::expect_used)]
        let mut task = self.task.lock().expect("lock poisoned");
        if task.is_some() {
            return;
        }
        if self.cancel_token.is_cancelled() {
            debug!("Rate counter already stopped, not starting the decay task");
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Unable to start the decay task outside of a tokio runtime: {e}");
                return;
            }
        };

        *task = Some(runtime.spawn(run_decay(
            Arc::clone(&self.score),
            self.decay_period,
            self.decay_factor,
            self.cancel_token.clone(),
        )));
    }

    fn stop(&self) {
        self.cancel_token.cancel();
    }

    fn count(&self) {
        self.score.update(|score| score + 1.0);
    }

    fn sampled_score(&self) -> f64 {
        let period_secs = self.decay_period.as_secs_f64();
        let steady_state_factor = self.decay_factor / (self.decay_factor - 1.0);
        self.score.load() / period_secs / steady_state_factor
    }
}

impl Drop for DecayingRateCounter {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn run_decay(
    score: Arc<AtomicScore>,
    decay_period: Duration,
    decay_factor: f64,
    cancel_token: CancellationToken,
) {
    debug!("Decay task started, period {decay_period:?}, factor {decay_factor}");
    let mut ticker = interval_at(Instant::now() + decay_period, decay_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => score.decay(decay_factor),
        }
    }
    debug!("Decay task stopped");
}

/// Read-only view over a counter: forwards the estimate, ignores counts and lifecycle calls.
#[derive(Debug, Clone)]
pub struct ReadOnlyRateCounter {
    inner: Arc<dyn RateCounter>,
}

impl ReadOnlyRateCounter {
    pub fn new(inner: Arc<dyn RateCounter>) -> Self {
        Self { inner }
    }
}

impl RateCounter for ReadOnlyRateCounter {
    fn start(&self) {}

    fn stop(&self) {}

    fn count(&self) {}

    fn sampled_score(&self) -> f64 {
        self.inner.sampled_score()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_rejects_invalid_decay_parameters() {
        assert!(matches!(
            DecayingRateCounter::new(Duration::ZERO, 1.125),
            Err(ConfigError::InvalidDecayPeriod(_))
        ));
        assert!(matches!(
            DecayingRateCounter::new(Duration::from_secs(5), 1.0),
            Err(ConfigError::InvalidDecayFactor(_))
        ));
        assert!(matches!(
            DecayingRateCounter::new(Duration::from_secs(5), f64::INFINITY),
            Err(ConfigError::InvalidDecayFactor(_))
        ));
        assert!(DecayingRateCounter::new(Duration::from_secs(1), 2.0).is_ok());
    }

    #[test]
    fn test_count_and_decay() {
        let counter = DecayingRateCounter::new(Duration::from_secs(1), 2.0).unwrap();
        for _ in 0..8 {
            counter.count();
        }
        assert_eq!(counter.score(), 8.0);
        counter.decay();
        assert_eq!(counter.score(), 4.0);
        // score / 1s / (2 / (2 - 1))
        assert_eq!(counter.sampled_score(), 2.0);
        assert_eq!(counter.upper_sampled_score(), counter.sampled_score());
    }

    #[test]
    fn test_sampled_score_converges_to_input_rate() {
        let period_secs = DEFAULT_DECAY_PERIOD.as_secs_f64();

        for rate in [1.0, 10.0, 250.0] {
            let counter = DecayingRateCounter::default();
            let per_period = (rate * period_secs) as usize;
            for _ in 0..60 {
                counter.decay();
                for _ in 0..per_period {
                    counter.count();
                }
            }
            let estimate = counter.sampled_score();
            assert!(
                (estimate - rate).abs() / rate < 0.1,
                "rate {rate}: estimate {estimate}"
            );
        }
    }

    #[test]
    fn test_concurrent_counts_are_not_lost() {
        let counter = Arc::new(DecayingRateCounter::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        counter.count();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.score(), 80_000.0);
    }

    #[test]
    fn test_concurrent_counts_and_decays() {
        const THREADS: usize = 4;
        const COUNTS_PER_THREAD: usize = 10_000;
        const DECAYS: i32 = 10;
        const INITIAL: f64 = 1_000.0;
        let factor: f64 = 1.125;

        let counter = Arc::new(DecayingRateCounter::new(Duration::from_secs(1), factor).unwrap());
        for _ in 0..INITIAL as usize {
            counter.count();
        }
        let barrier = Arc::new(std::sync::Barrier::new(THREADS + 1));

        let mut handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = Arc::clone(&counter);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..COUNTS_PER_THREAD {
                        counter.count();
                    }
                })
            })
            .collect();
        {
            let counter = Arc::clone(&counter);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..DECAYS {
                    counter.decay();
                    thread::yield_now();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let counts = (THREADS * COUNTS_PER_THREAD) as f64;
        let total_decay = factor.powi(DECAYS);
        // Every decay applied before any count, and every count applied before any decay
        let decays_first = INITIAL / total_decay + counts;
        let counts_first = (INITIAL + counts) / total_decay;
        let score = counter.score();
        assert!(
            score >= counts_first * (1.0 - 1e-9) && score <= decays_first * (1.0 + 1e-9),
            "score {score} outside [{counts_first}, {decays_first}]"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_decay_task_decays_every_period() {
        let counter = DecayingRateCounter::new(Duration::from_secs(5), 2.0).unwrap();
        counter.start();
        for _ in 0..16 {
            counter.count();
        }

        tokio::time::sleep(Duration::from_millis(5_001)).await;
        assert_eq!(counter.score(), 8.0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.score(), 4.0);

        counter.stop();
        counter.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_terminates_decay_task_within_one_period() {
        let counter = DecayingRateCounter::default();
        counter.start();
        // second start is a no-op
        counter.start();
        tokio::task::yield_now().await;

        counter.stop();
        counter.stop();
        let joined = tokio::time::timeout(DEFAULT_DECAY_PERIOD, counter.join()).await;
        assert!(joined.is_ok());

        // A stopped counter does not restart
        counter.start();
        assert!(counter.task.lock().unwrap().is_none());
    }

    #[test]
    fn test_start_outside_runtime_does_not_panic() {
        let counter = DecayingRateCounter::default();
        counter.start();
        assert!(counter.task.lock().unwrap().is_none());
    }

    #[test]
    fn test_read_only_view() {
        let counter = Arc::new(DecayingRateCounter::new(Duration::from_secs(1), 2.0).unwrap());
        let view = ReadOnlyRateCounter::new(counter.clone());

        view.count();
        view.start();
        view.stop();
        assert_eq!(counter.score(), 0.0);

        counter.count();
        counter.count();
        assert_eq!(view.sampled_score(), counter.sampled_score());
        assert_eq!(view.sampled_score(), 1.0);
    }
}
