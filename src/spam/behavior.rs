use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

const MAX_SAMPLES_PER_CALLER: usize = 32;

/// Signals derived from a caller's trailing call history.
#[derive(Debug, Clone, Default)]
pub struct BehaviorSignals {
    pub calls_in_window: usize,
    pub avg_duration_secs: f64,
    pub secs_since_last: Option<i64>,
}

#[derive(Debug, Clone)]
struct CallSample {
    at: DateTime<Utc>,
    duration_secs: u64,
}

#[derive(Debug, Default)]
struct CallerHistory {
    samples: VecDeque<CallSample>,
}

/// Per-number call history, tenant-scoped. Read-mostly; completed
/// calls append a sample.
pub struct BehaviorTracker {
    window: ChronoDuration,
    inner: RwLock<HashMap<(String, String), CallerHistory>>,
}

impl BehaviorTracker {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window: ChronoDuration::seconds(window_secs as i64),
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_call(&self, tenant_id: &str, number: &str, duration_secs: u64, at: DateTime<Utc>) {
        let key = (tenant_id.to_string(), super::rules::normalize_number(number));
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let history = map.entry(key).or_default();
        history.samples.push_back(CallSample { at, duration_secs });
        while history.samples.len() > MAX_SAMPLES_PER_CALLER {
            history.samples.pop_front();
        }
    }

    pub fn signals(&self, tenant_id: &str, number: &str, now: DateTime<Utc>) -> BehaviorSignals {
        let key = (tenant_id.to_string(), super::rules::normalize_number(number));
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(history) = map.get(&key) else {
            return BehaviorSignals::default();
        };
        let cutoff = now - self.window;
        let recent: Vec<&CallSample> = history.samples.iter().filter(|s| s.at >= cutoff).collect();
        if recent.is_empty() {
            return BehaviorSignals::default();
        }
        let total_secs: u64 = recent.iter().map(|s| s.duration_secs).sum();
        let last = recent.iter().map(|s| s.at).max().unwrap_or(cutoff);
        BehaviorSignals {
            calls_in_window: recent.len(),
            avg_duration_secs: total_secs as f64 / recent.len() as f64,
            secs_since_last: Some((now - last).num_seconds()),
        }
    }

    /// Behavior sub-score in [0, 1]. Each signal contributes a bounded
    /// increment: call frequency up to 0.4, short average duration up
    /// to 0.3, recency up to 0.3. Deterministic for a fixed history
    /// and `now`.
    pub fn score(&self, tenant_id: &str, number: &str, now: DateTime<Utc>) -> f64 {
        let signals = self.signals(tenant_id, number, now);
        let mut score = 0.0;

        if signals.calls_in_window >= 3 {
            let excess = (signals.calls_in_window - 2) as f64;
            score += (excess * 0.1).min(0.4);
        }
        if signals.calls_in_window >= 2 && signals.avg_duration_secs < 10.0 {
            score += 0.3;
        }
        if let Some(secs) = signals.secs_since_last {
            if secs < 60 && signals.calls_in_window >= 2 {
                score += 0.3;
            }
        }

        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: DateTime<Utc>, offset_secs: i64) -> DateTime<Utc> {
        base + ChronoDuration::seconds(offset_secs)
    }

    #[test]
    fn test_unknown_caller_scores_zero() {
        let tracker = BehaviorTracker::new(3600);
        assert_eq!(tracker.score("acme", "+15550100", Utc::now()), 0.0);
    }

    #[test]
    fn test_burst_of_short_calls_scores_high() {
        let tracker = BehaviorTracker::new(3600);
        let base = Utc::now();
        for i in 0..6 {
            tracker.record_call("acme", "+15550100", 4, at(base, i * 10));
        }
        let now = at(base, 70);
        let score = tracker.score("acme", "+15550100", now);
        // frequency (capped 0.4) + short duration (0.3) + recency (0.3)
        assert!(score > 0.9, "score was {}", score);
    }

    #[test]
    fn test_old_history_falls_out_of_window() {
        let tracker = BehaviorTracker::new(60);
        let base = Utc::now();
        for i in 0..6 {
            tracker.record_call("acme", "+15550100", 4, at(base, i));
        }
        let later = at(base, 600);
        assert_eq!(tracker.score("acme", "+15550100", later), 0.0);
    }

    #[test]
    fn test_single_long_call_is_benign() {
        let tracker = BehaviorTracker::new(3600);
        let base = Utc::now();
        tracker.record_call("acme", "+15550100", 300, base);
        let score = tracker.score("acme", "+15550100", at(base, 120));
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_history_is_tenant_scoped() {
        let tracker = BehaviorTracker::new(3600);
        let base = Utc::now();
        for i in 0..6 {
            tracker.record_call("acme", "+15550100", 4, at(base, i * 10));
        }
        assert_eq!(tracker.score("other", "+15550100", at(base, 70)), 0.0);
    }
}
