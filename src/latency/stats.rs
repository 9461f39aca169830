//! Percentile statistics and metric assertions over TTFA samples.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::request::SourceType;

// ---------------------------------------------------------------------------
// Percentiles
// ---------------------------------------------------------------------------

/// Nearest-rank percentile of `sorted` (ascending).  `0.0` when empty.
///
/// `percentile` is a fraction in `0.0..=1.0`.
pub fn percentile(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (percentile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn sorted_ms(samples: &[Duration]) -> Vec<f64> {
    let mut ms: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
    ms.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    ms
}

// ---------------------------------------------------------------------------
// Per-source stats
// ---------------------------------------------------------------------------

/// TTFA distribution for one source type over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    /// Completed requests.
    pub count: usize,
    /// Requests closed with [`fail`](super::LatencyMonitor::fail).
    pub failed: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub target_ms: f64,
    /// `failed / (count + failed)`, `0.0` with no traffic.
    pub error_rate: f64,
}

impl SourceStats {
    pub(crate) fn compute(completed: &[Duration], failed: usize, target: Duration) -> Self {
        let ms = sorted_ms(completed);
        let total = completed.len() + failed;
        Self {
            count: completed.len(),
            failed,
            p50_ms: percentile(&ms, 0.50),
            p95_ms: percentile(&ms, 0.95),
            p99_ms: percentile(&ms, 0.99),
            target_ms: target.as_secs_f64() * 1000.0,
            error_rate: if total == 0 { 0.0 } else { failed as f64 / total as f64 },
        }
    }

    /// Whether P95 exceeds the source's target.  Never true without samples.
    pub fn p95_breached(&self) -> bool {
        self.count > 0 && self.p95_ms > self.target_ms
    }
}

/// Snapshot returned by [`LatencyMonitor::stats`](super::LatencyMonitor::stats).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub window_secs: u64,
    pub by_source: BTreeMap<SourceType, SourceStats>,
    /// Requests begun but not yet closed.
    pub open: usize,
}

impl LatencyStats {
    pub fn total_completed(&self) -> usize {
        self.by_source.values().map(|s| s.count).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.by_source.values().map(|s| s.failed).sum()
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.total_completed() + self.total_failed();
        if total == 0 {
            0.0
        } else {
            self.total_failed() as f64 / total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LatencyAlert {
    /// Windowed P95 is above the source target.
    P95AboveTarget {
        source: SourceType,
        p95_ms: f64,
        target_ms: f64,
    },
    /// The most recent `count` completions in a row all missed the target.
    ConsecutiveBreaches { source: SourceType, count: u32 },
}

// ---------------------------------------------------------------------------
// Metric assertions
// ---------------------------------------------------------------------------

/// Pass/fail criteria posted by an operator or a load test.
///
/// `thresholds` maps a source-type name (`"chat"`, `"email_summary"`, ...)
/// to the maximum acceptable P95 in milliseconds.
///
/// ```
/// use inference_governor::latency::MetricsAssertion;
///
/// let a: MetricsAssertion = serde_json::from_str(
///     r#"{"thresholds": {"chat": 3000}, "min_samples": 20}"#,
/// ).unwrap();
/// assert_eq!(a.thresholds["chat"], 3000.0);
/// assert_eq!(a.max_error_rate, 0.05);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsAssertion {
    pub thresholds: HashMap<String, f64>,
    pub min_samples: usize,
    pub max_error_rate: f64,
}

impl Default for MetricsAssertion {
    fn default() -> Self {
        Self {
            thresholds: HashMap::new(),
            min_samples: 1,
            max_error_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub samples: usize,
    pub p95_ms: f64,
    pub threshold_ms: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionReport {
    pub passed: bool,
    pub metrics: BTreeMap<String, MetricResult>,
    pub error_rate: f64,
    pub failures: Vec<String>,
}

impl MetricsAssertion {
    /// Evaluate against a stats snapshot.
    pub fn evaluate(&self, stats: &LatencyStats) -> AssertionReport {
        let mut metrics = BTreeMap::new();
        let mut failures = Vec::new();

        let mut names: Vec<&String> = self.thresholds.keys().collect();
        names.sort();

        for name in names {
            let threshold_ms = self.thresholds[name];
            let Some(source) = SourceType::parse(name) else {
                failures.push(format!("{name}: unknown metric"));
                continue;
            };
            let (samples, p95_ms) = stats
                .by_source
                .get(&source)
                .map(|s| (s.count, s.p95_ms))
                .unwrap_or((0, 0.0));

            let mut passed = true;
            if samples < self.min_samples {
                passed = false;
                failures.push(format!(
                    "{name}: {samples} samples, need at least {}",
                    self.min_samples
                ));
            } else if p95_ms > threshold_ms {
                passed = false;
                failures.push(format!(
                    "{name}: p95 {p95_ms:.0}ms exceeds {threshold_ms:.0}ms"
                ));
            }

            metrics.insert(
                name.clone(),
                MetricResult {
                    samples,
                    p95_ms,
                    threshold_ms,
                    passed,
                },
            );
        }

        let error_rate = stats.error_rate();
        if error_rate > self.max_error_rate {
            failures.push(format!(
                "error rate {:.1}% exceeds {:.1}%",
                error_rate * 100.0,
                self.max_error_rate * 100.0
            ));
        }

        AssertionReport {
            passed: failures.is_empty(),
            metrics,
            error_rate,
            failures,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn nearest_rank_percentiles() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&sorted, 0.50), 50.0);
        assert_eq!(percentile(&sorted, 0.95), 95.0);
        assert_eq!(percentile(&sorted, 0.99), 99.0);
        assert_eq!(percentile(&sorted, 1.0), 100.0);
        assert_eq!(percentile(&sorted, 0.0), 1.0);
    }

    #[test]
    fn percentile_of_empty_is_zero() {
        assert_eq!(percentile(&[], 0.95), 0.0);
    }

    #[test]
    fn single_sample_is_every_percentile() {
        let s = SourceStats::compute(&[ms(1200)], 0, Duration::from_secs(3));
        assert_eq!(s.p50_ms, 1200.0);
        assert_eq!(s.p99_ms, 1200.0);
        assert!(!s.p95_breached());
    }

    #[test]
    fn unsorted_input_is_sorted() {
        let s = SourceStats::compute(&[ms(300), ms(100), ms(200)], 1, Duration::from_secs(3));
        assert_eq!(s.p50_ms, 200.0);
        assert_eq!(s.p95_ms, 300.0);
        assert_eq!(s.error_rate, 0.25);
    }

    fn stats_with(chat: SourceStats) -> LatencyStats {
        let mut by_source = BTreeMap::new();
        by_source.insert(SourceType::Chat, chat);
        LatencyStats {
            window_secs: 3600,
            by_source,
            open: 0,
        }
    }

    #[test]
    fn assertion_passes_within_threshold() {
        let samples: Vec<Duration> = (1..=20).map(|i| ms(i * 100)).collect();
        let stats = stats_with(SourceStats::compute(&samples, 0, Duration::from_secs(3)));

        let mut assertion = MetricsAssertion::default();
        assertion.thresholds.insert("chat".into(), 2500.0);
        let report = assertion.evaluate(&stats);

        assert!(report.passed, "{:?}", report.failures);
        assert_eq!(report.metrics["chat"].p95_ms, 1900.0);
    }

    #[test]
    fn assertion_lists_every_failure() {
        let samples: Vec<Duration> = (1..=20).map(|i| ms(i * 200)).collect();
        let stats = stats_with(SourceStats::compute(&samples, 5, Duration::from_secs(3)));

        let mut assertion = MetricsAssertion {
            min_samples: 5,
            ..MetricsAssertion::default()
        };
        assertion.thresholds.insert("chat".into(), 3000.0);
        assertion.thresholds.insert("email_summary".into(), 6000.0);
        assertion.thresholds.insert("sms".into(), 1000.0);
        let report = assertion.evaluate(&stats);

        assert!(!report.passed);
        assert!(!report.metrics["chat"].passed);
        assert!(!report.metrics["email_summary"].passed);
        assert_eq!(report.failures.len(), 4);
        assert!(report.failures.iter().any(|f| f.starts_with("sms: unknown")));
        assert!(report.failures.iter().any(|f| f.starts_with("error rate 20.0%")));
    }
}
