use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

use crate::config::TemperatureSettings;
use crate::error::Error;
use crate::registry::gateway_key;
use crate::time_util::epoch_ms;

/// A ping older than this contributes nothing to the score.
const PING_STALE_MS: u64 = 8 * 60 * 60 * 1000;

const DEFAULT_SCORE: f64 = 50.0;
const MIN_SCORE: f64 = 1.0;
const MAX_SCORE: f64 = 100.0;

// Dampened weights: no single bad probe or request can eject a gateway,
// and the floor of 1 keeps every gateway recoverable.
const SUCCESS_RATE_WEIGHT: f64 = 28.0;
const LATENCY_WEIGHT: f64 = 0.7;
const PING_WEIGHT: f64 = 0.5;

#[derive(Clone, Debug)]
struct TemperatureRecord {
    recent_latencies: VecDeque<u32>,
    success_count: u64,
    failure_count: u64,
    last_updated: u64,
    ping_latency_ms: Option<u32>,
    ping_updated_at: Option<u64>,
}

impl TemperatureRecord {
    fn fresh(now: u64) -> Self {
        Self {
            recent_latencies: VecDeque::new(),
            success_count: 0,
            failure_count: 0,
            last_updated: now,
            ping_latency_ms: None,
            ping_updated_at: None,
        }
    }

    /// A record untouched for a full window starts over; the ping survives
    /// with its own staleness horizon.
    fn refresh_if_stale(&mut self, now: u64, window_ms: u64) {
        if now.saturating_sub(self.last_updated) > window_ms {
            self.recent_latencies.clear();
            self.success_count = 0;
            self.failure_count = 0;
        }
    }

    fn avg_latency(&self) -> Option<f64> {
        if self.recent_latencies.is_empty() {
            return None;
        }
        let sum: u64 = self.recent_latencies.iter().map(|&l| l as u64).sum();
        Some(sum as f64 / self.recent_latencies.len() as f64)
    }

    fn success_rate(&self) -> Option<f64> {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return None;
        }
        Some(self.success_count as f64 / total as f64)
    }

    fn ping_is_fresh(&self, now: u64) -> bool {
        self.ping_updated_at
            .is_some_and(|at| now.saturating_sub(at) <= PING_STALE_MS)
    }
}

/// Per-gateway score exposed by the stats surface.
#[derive(Clone, Debug, Serialize)]
pub struct GatewayScore {
    pub gateway: String,
    pub score: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub ping_latency_ms: Option<u32>,
}

/// Sliding-window latency/success tracker with weighted scoring: the
/// "temperature" of a gateway, in [1, 100], higher is warmer.
pub struct TemperatureTracker {
    records: DashMap<String, TemperatureRecord>,
    settings: TemperatureSettings,
    last_prune_ms: AtomicU64,
}

impl TemperatureTracker {
    pub fn new(settings: TemperatureSettings) -> Self {
        Self {
            records: DashMap::new(),
            settings,
            last_prune_ms: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, gateway: &Url, latency_ms: u32) {
        let now = epoch_ms();
        self.touch(gateway, now, |record, max_samples| {
            record.success_count += 1;
            if record.recent_latencies.len() >= max_samples {
                record.recent_latencies.pop_front();
            }
            record.recent_latencies.push_back(latency_ms);
        });
        self.maybe_prune(now);
    }

    pub fn record_failure(&self, gateway: &Url) {
        let now = epoch_ms();
        self.touch(gateway, now, |record, _| {
            record.failure_count += 1;
        });
        self.maybe_prune(now);
    }

    pub fn record_ping(&self, gateway: &Url, latency_ms: u32) {
        let now = epoch_ms();
        self.touch(gateway, now, |record, _| {
            record.ping_latency_ms = Some(latency_ms);
            record.ping_updated_at = Some(now);
        });
        self.maybe_prune(now);
    }

    /// The score formula: start at 50, pull by success rate, nudge by
    /// request latency and (half-weighted) ping latency, clamp to [1, 100].
    pub fn score(&self, gateway: &Url) -> f64 {
        let key = gateway_key(gateway);
        let now = epoch_ms();
        let Some(record) = self.records.get(&key) else {
            return DEFAULT_SCORE;
        };
        score_record(&record, now)
    }

    pub fn avg_latency(&self, gateway: &Url) -> Option<f64> {
        self.records
            .get(&gateway_key(gateway))
            .and_then(|record| record.avg_latency())
    }

    /// Score-weighted random draw over `candidates`. Deterministic for a
    /// single candidate; an empty slate is an error.
    pub fn select_weighted(&self, candidates: &[Url]) -> Result<Url, Error> {
        match candidates {
            [] => Err(Error::NoHealthyGateways {
                message: "no gateways available for weighted selection".to_string(),
            }),
            [only] => Ok(only.clone()),
            _ => {
                let scores: Vec<f64> = candidates.iter().map(|g| self.score(g)).collect();
                let total: f64 = scores.iter().sum();
                let mut draw = rand::thread_rng().gen_range(0.0..total);
                for (gateway, score) in candidates.iter().zip(&scores) {
                    draw -= score;
                    if draw <= 0.0 {
                        return Ok(gateway.clone());
                    }
                }
                // Floating-point slack: the walk can overshoot by an ulp.
                Ok(candidates[candidates.len() - 1].clone())
            }
        }
    }

    pub fn all_scores(&self) -> Vec<GatewayScore> {
        let now = epoch_ms();
        self.records
            .iter()
            .map(|entry| {
                let record = entry.value();
                let latencies: Vec<u32> = record.recent_latencies.iter().copied().collect();
                GatewayScore {
                    gateway: entry.key().clone(),
                    score: score_record(record, now),
                    success_count: record.success_count,
                    failure_count: record.failure_count,
                    avg_latency_ms: record.avg_latency(),
                    p95_latency_ms: percentile(&latencies, 95.0),
                    ping_latency_ms: record.ping_latency_ms,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn touch<F: FnOnce(&mut TemperatureRecord, usize)>(&self, gateway: &Url, now: u64, apply: F) {
        let key = gateway_key(gateway);
        self.ensure_capacity(&key);
        let mut record = self
            .records
            .entry(key)
            .or_insert_with(|| TemperatureRecord::fresh(now));
        record.refresh_if_stale(now, self.settings.window_ms);
        apply(&mut record, self.settings.max_latency_samples);
        record.last_updated = now;
    }

    fn ensure_capacity(&self, key: &str) {
        if self.records.contains_key(key) || self.records.len() < self.settings.max_gateways {
            return;
        }
        let oldest = self
            .records
            .iter()
            .min_by_key(|entry| entry.value().last_updated)
            .map(|entry| entry.key().clone());
        if let Some(oldest) = oldest {
            self.records.remove(&oldest);
        }
    }

    /// Opportunistic GC, at most once per window: drop records older than
    /// two windows, then oldest-first down to `max_gateways`.
    fn maybe_prune(&self, now: u64) {
        let last = self.last_prune_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.settings.window_ms {
            return;
        }
        if self
            .last_prune_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let horizon = 2 * self.settings.window_ms;
        self.records
            .retain(|_, record| now.saturating_sub(record.last_updated) <= horizon);

        while self.records.len() > self.settings.max_gateways {
            let oldest = self
                .records
                .iter()
                .min_by_key(|entry| entry.value().last_updated)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.records.remove(&key);
                }
                None => break,
            }
        }
    }
}

fn score_record(record: &TemperatureRecord, now: u64) -> f64 {
    let mut score = DEFAULT_SCORE;
    if let Some(rate) = record.success_rate() {
        score += (rate - 0.5) * SUCCESS_RATE_WEIGHT;
    }
    if let Some(avg) = record.avg_latency() {
        score += latency_bonus(avg) * LATENCY_WEIGHT;
    }
    if record.ping_is_fresh(now) {
        if let Some(ping) = record.ping_latency_ms {
            score += latency_bonus(ping as f64) * PING_WEIGHT;
        }
    }
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Latency banding shared by request and ping latencies (milliseconds).
fn latency_bonus(latency_ms: f64) -> f64 {
    if latency_ms < 100.0 {
        30.0
    } else if latency_ms < 250.0 {
        15.0
    } else if latency_ms < 500.0 {
        0.0
    } else if latency_ms < 1000.0 {
        -15.0
    } else {
        -30.0
    }
}

/// p-th percentile (ceiling-index convention) of `values`; requires at
/// least five samples.
pub fn percentile(values: &[u32], p: f64) -> Option<f64> {
    if values.len() < 5 {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[index] as f64)
}
