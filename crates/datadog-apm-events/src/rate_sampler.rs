// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deterministic trace-id based sampling.

// Knuth multiplicative hashing factor, shared with the Datadog tracers so that every component
// keeps the same traces for the same rate.
const SAMPLER_HASHER: u64 = 1111111111111111111;

const MAX_TRACE_ID_FLOAT: f64 = u64::MAX as f64;

/// Returns whether to keep a trace given its id and a sampling rate.
///
/// The decision is a pure function of `(trace_id, rate)` and is monotonic in `rate`: a trace kept
/// at some rate is kept at every higher rate. This assumes trace ids are close to uniformly
/// distributed. Rates outside of [0, 1] are clamped.
pub fn sample_by_rate(trace_id: u64, rate: f64) -> bool {
    let rate = rate.clamp(0.0, 1.0);
    if rate < 1.0 {
        trace_id.wrapping_mul(SAMPLER_HASHER) < (rate * MAX_TRACE_ID_FLOAT) as u64
    } else {
        true
    }
}
