// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Owner task of the open stats bucket.
//!
//! Handles send spans and flush requests over a bounded channel and the service applies them
//! one at a time, so the bucket only ever has one writer. Every `stats_bucket_interval` the
//! service closes the open bucket, opens the next one and forwards the closed bucket if it saw
//! any span.
//!
//! ```text
//! spans -> Handle -> (try_send) -> Service -> StatsBucket --(every interval)--> closed buckets
//! ```

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::errors::ConfigError;
use crate::model::{ProcessedTrace, Span};
use crate::stats_bucket::{now_nanos, StatsBucket};

const STATS_CHANNEL_BUFFER_SIZE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("Failed to send command to concentrator: {0}")]
    SendError(mpsc::error::SendError<ConcentratorCommand>),

    #[error("Failed to receive response from concentrator: {0}")]
    RecvError(oneshot::error::RecvError),
}

#[derive(Debug)]
pub enum ConcentratorCommand {
    Add(Vec<Span>),
    /// Closes the open bucket and returns it, opening the next one.
    Flush(oneshot::Sender<StatsBucket>),
}

#[derive(Debug, Clone)]
pub struct StatsConcentratorHandle {
    tx: mpsc::Sender<ConcentratorCommand>,
}

impl StatsConcentratorHandle {
    /// Queues spans for aggregation. When the service is behind and the channel is full the spans
    /// are dropped with a warning rather than blocking the caller.
    pub fn add(&self, spans: Vec<Span>) {
        if spans.is_empty() {
            return;
        }
        if let Err(e) = self.tx.try_send(ConcentratorCommand::Add(spans)) {
            warn!("Stats concentrator channel full, dropping spans for stats: {e}");
        }
    }

    pub fn add_trace(&self, trace: &ProcessedTrace) {
        self.add(
            trace
                .weighted_trace
                .iter()
                .map(|weighted_span| weighted_span.span.clone())
                .collect(),
        );
    }

    /// Closes the open bucket and returns it. Unlike [`Self::add`] this waits for room in the
    /// channel.
    pub async fn flush(&self) -> Result<StatsBucket, StatsError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(ConcentratorCommand::Flush(response_tx))
            .await
            .map_err(StatsError::SendError)?;
        response_rx.await.map_err(StatsError::RecvError)
    }
}

pub struct StatsConcentratorService {
    bucket: StatsBucket,
    bucket_interval: Duration,
    rx: mpsc::Receiver<ConcentratorCommand>,
    flushed_tx: mpsc::Sender<StatsBucket>,
    cancel_token: CancellationToken,
}

impl StatsConcentratorService {
    /// Creates the service and its handle. Closed buckets are forwarded on `flushed_tx`; the
    /// service exits once `cancel_token` is cancelled or every handle is dropped.
    pub fn new(
        config: &Config,
        flushed_tx: mpsc::Sender<StatsBucket>,
        cancel_token: CancellationToken,
    ) -> Result<(Self, StatsConcentratorHandle), ConfigError> {
        if config.stats_bucket_interval.is_zero() {
            return Err(ConfigError::InvalidBucketInterval(
                config.stats_bucket_interval,
            ));
        }
        if !(config.stats_epsilon > 0.0 && config.stats_epsilon < 1.0) {
            return Err(ConfigError::InvalidEpsilon(config.stats_epsilon));
        }

        let (tx, rx) = mpsc::channel(STATS_CHANNEL_BUFFER_SIZE);
        let service = Self {
            bucket: StatsBucket::new(now_nanos(), config.stats_epsilon),
            bucket_interval: config.stats_bucket_interval,
            rx,
            flushed_tx,
            cancel_token,
        };
        Ok((service, StatsConcentratorHandle { tx }))
    }

    pub async fn run(mut self) {
        debug!(
            "Stats concentrator started, bucket interval {:?}",
            self.bucket_interval
        );
        let mut ticker = interval_at(
            Instant::now() + self.bucket_interval,
            self.bucket_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let closed = self.rotate();
                    self.forward(closed).await;
                }
                command = self.rx.recv() => match command {
                    Some(ConcentratorCommand::Add(spans)) => {
                        for span in &spans {
                            self.bucket.handle_span(span);
                        }
                    }
                    Some(ConcentratorCommand::Flush(response_tx)) => {
                        let closed = self.rotate();
                        if response_tx.send(closed).is_err() {
                            error!("Failed to return stats bucket: flush requester went away");
                        }
                    }
                    None => break,
                },
            }
        }

        // Keep what the last window collected
        let closed = self.rotate();
        if !closed.is_empty() {
            if let Err(e) = self.flushed_tx.try_send(closed) {
                warn!("Dropping the last stats bucket on shutdown: {e}");
            }
        }
        debug!("Stats concentrator stopped");
    }

    /// Closes the open bucket now and opens the next one.
    fn rotate(&mut self) -> StatsBucket {
        let now = now_nanos();
        let next = self.bucket.next(now);
        let mut closed = std::mem::replace(&mut self.bucket, next);
        closed.close(now);
        closed
    }

    async fn forward(&self, bucket: StatsBucket) {
        if bucket.is_empty() {
            return;
        }
        debug!(
            "Flushing stats bucket started at {} with {} counts",
            bucket.start(),
            bucket.counts().count()
        );
        if let Err(e) = self.flushed_tx.send(bucket).await {
            error!("Failed to forward stats bucket: {e}");
        }
    }
}
