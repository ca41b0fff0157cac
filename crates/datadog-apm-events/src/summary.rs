// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Greenwald-Khanna ε-approximate quantile summary.
//!
//! The summary keeps a sorted list of entries `(value, g, delta)` where `g` is the rank gap to
//! the previous entry and `delta` the uncertainty on the entry's rank. As long as every entry
//! satisfies `g + delta <= 2εn`, any rank query is answered within `εn` of the true rank.
//! Values are ordered by `(value, id)` so equal values sort the same way on every run.

use std::cmp::Ordering;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Entry {
    #[serde(rename = "v")]
    value: f64,
    #[serde(skip)]
    id: u64,
    g: u64,
    delta: u64,
}

impl Entry {
    fn cmp_key(&self, value: f64, id: u64) -> Ordering {
        self.value.total_cmp(&value).then(self.id.cmp(&id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GkSummary {
    eps: f64,
    n: u64,
    entries: Vec<Entry>,
    #[serde(skip)]
    compress_interval: u64,
}

impl GkSummary {
    /// `eps` is expected within (0, 1); configuration validates it upstream.
    pub fn new(eps: f64) -> Self {
        let compress_interval = (1.0 / (2.0 * eps)).floor();
        Self {
            eps,
            n: 0,
            entries: Vec::new(),
            compress_interval: if compress_interval >= 1.0 {
                compress_interval as u64
            } else {
                1
            },
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.eps
    }

    /// Number of inserted values.
    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    fn band(&self) -> u64 {
        (2.0 * self.eps * self.n as f64).floor() as u64
    }

    pub fn insert(&mut self, value: f64, id: u64) {
        let idx = self
            .entries
            .partition_point(|entry| entry.cmp_key(value, id) == Ordering::Less);
        // New extremes are known exactly
        let delta = if idx == 0 || idx == self.entries.len() {
            0
        } else {
            self.band().saturating_sub(1)
        };
        self.entries.insert(
            idx,
            Entry {
                value,
                id,
                g: 1,
                delta,
            },
        );
        self.n += 1;

        if self.n % self.compress_interval == 0 {
            self.compress();
        }
    }

    /// Merges adjacent entries whose combined rank uncertainty stays within the error band.
    /// The minimum and the maximum are never merged away.
    fn compress(&mut self) {
        if self.entries.len() < 3 {
            return;
        }
        let band = self.band();
        let entries = std::mem::take(&mut self.entries);
        let mut merged: Vec<Entry> = Vec::with_capacity(entries.len());

        for (i, entry) in entries.into_iter().enumerate().rev() {
            if i > 0 {
                if let Some(next) = merged.last_mut() {
                    if entry.g + next.g + next.delta <= band {
                        next.g += entry.g;
                        continue;
                    }
                }
            }
            merged.push(entry);
        }

        merged.reverse();
        self.entries = merged;
    }

    /// Compacts the summary ahead of serialization.
    pub fn encode(&mut self) {
        self.compress();
    }

    /// Value whose rank is within `εn` of `ceil(q * n)`. `None` when the summary is empty or `q`
    /// lies outside [0, 1].
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.entries.is_empty() || !(0.0..=1.0).contains(&q) {
            return None;
        }
        let rank = ((q * self.n as f64).ceil() as u64).clamp(1, self.n);
        let bound = self.eps * self.n as f64;

        let mut rmin = 0;
        let mut previous: Option<&Entry> = None;
        for entry in &self.entries {
            rmin += entry.g;
            let rmax = rmin + entry.delta;
            if rmax as f64 > rank as f64 + bound {
                return Some(previous.unwrap_or(entry).value);
            }
            previous = Some(entry);
        }
        previous.map(|entry| entry.value)
    }
}
