//! Time-to-first-audio tracking.
//!
//! Each request id is begun once and closed once, either by
//! [`record_ready`](LatencyMonitor::record_ready) or by
//! [`fail`](LatencyMonitor::fail).  Misuse is reported as a
//! [`LatencyError`]; it never disturbs the rest of the monitor.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::LatencyConfig;
use crate::latency::stats::{
    AssertionReport, LatencyAlert, LatencyStats, MetricsAssertion, SourceStats,
};
use crate::request::SourceType;

/// Reporting errors.  Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LatencyError {
    #[error("request {0} is already being tracked")]
    AlreadyTracking(String),

    #[error("request {0} was never begun")]
    UnknownRequest(String),

    #[error("request {0} was already closed")]
    AlreadyClosed(String),
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct OpenRecord {
    source: SourceType,
    text_chars: usize,
    started_at: Instant,
    stages: Vec<(String, Duration)>,
}

#[derive(Debug, Clone)]
struct Sample {
    source: SourceType,
    closed_at: Instant,
    /// `None` for a failed request.
    ttfa: Option<Duration>,
}

/// A closed request, as returned by [`LatencyMonitor::record_ready`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TtfaRecord {
    pub request_id: String,
    pub source_type: SourceType,
    pub text_chars: usize,
    pub ttfa: Duration,
    pub stages: Vec<(String, Duration)>,
    pub within_target: bool,
}

// ---------------------------------------------------------------------------
// LatencyMonitor
// ---------------------------------------------------------------------------

pub struct LatencyMonitor {
    config: LatencyConfig,
    open: HashMap<String, OpenRecord>,
    /// Recently closed ids, kept for the retention window so a second close
    /// is reported as such rather than as an unknown id.
    closed: HashMap<String, Instant>,
    samples: VecDeque<Sample>,
    consecutive: HashMap<SourceType, u32>,
}

impl LatencyMonitor {
    pub fn new(config: LatencyConfig) -> Self {
        Self {
            config,
            open: HashMap::new(),
            closed: HashMap::new(),
            samples: VecDeque::new(),
            consecutive: HashMap::new(),
        }
    }

    /// Begin tracking `request_id` at `now`.
    pub fn start_tracking(
        &mut self,
        request_id: &str,
        source: SourceType,
        text: &str,
        now: Instant,
    ) -> Result<(), LatencyError> {
        self.prune(now);
        if self.open.contains_key(request_id) || self.closed.contains_key(request_id) {
            return Err(LatencyError::AlreadyTracking(request_id.to_string()));
        }
        self.open.insert(
            request_id.to_string(),
            OpenRecord {
                source,
                text_chars: text.chars().count(),
                started_at: now,
                stages: Vec::new(),
            },
        );
        Ok(())
    }

    /// Attach a named stage duration (`"llm"`, `"tts"`, ...) to an open record.
    pub fn record_stage(
        &mut self,
        request_id: &str,
        stage: &str,
        duration: Duration,
    ) -> Result<(), LatencyError> {
        match self.open.get_mut(request_id) {
            Some(record) => {
                record.stages.push((stage.to_string(), duration));
                Ok(())
            }
            None => Err(self.missing(request_id)),
        }
    }

    /// Close `request_id` as ready: first audio is available at `now`.
    pub fn record_ready(&mut self, request_id: &str, now: Instant) -> Result<TtfaRecord, LatencyError> {
        let record = self
            .open
            .remove(request_id)
            .ok_or_else(|| self.missing(request_id))?;
        self.closed.insert(request_id.to_string(), now);

        let ttfa = now.saturating_duration_since(record.started_at);
        let target = self.config.targets.for_source(record.source);
        let within_target = ttfa <= target;

        self.samples.push_back(Sample {
            source: record.source,
            closed_at: now,
            ttfa: Some(ttfa),
        });

        let streak = self.consecutive.entry(record.source).or_insert(0);
        if within_target {
            *streak = 0;
        } else {
            *streak += 1;
            log::debug!(
                "latency: {request_id} ({}) missed target: {:.2}s > {:.2}s",
                record.source,
                ttfa.as_secs_f64(),
                target.as_secs_f64()
            );
            if *streak == self.config.consecutive_breach_alert {
                log::warn!(
                    "latency: {} consecutive {} requests over {:.1}s target",
                    streak,
                    record.source,
                    target.as_secs_f64()
                );
            }
        }

        Ok(TtfaRecord {
            request_id: request_id.to_string(),
            source_type: record.source,
            text_chars: record.text_chars,
            ttfa,
            stages: record.stages,
            within_target,
        })
    }

    /// Close `request_id` as failed.  Counts toward the error rate, not the
    /// percentiles.
    pub fn fail(&mut self, request_id: &str, now: Instant) -> Result<(), LatencyError> {
        let record = self
            .open
            .remove(request_id)
            .ok_or_else(|| self.missing(request_id))?;
        self.closed.insert(request_id.to_string(), now);
        self.samples.push_back(Sample {
            source: record.source,
            closed_at: now,
            ttfa: None,
        });
        Ok(())
    }

    /// Forget an open record without producing a sample.  Used for requests
    /// turned away after tracking began.
    pub fn discard(&mut self, request_id: &str) -> Result<(), LatencyError> {
        match self.open.remove(request_id) {
            Some(_) => Ok(()),
            None => Err(self.missing(request_id)),
        }
    }

    fn missing(&self, request_id: &str) -> LatencyError {
        if self.closed.contains_key(request_id) {
            LatencyError::AlreadyClosed(request_id.to_string())
        } else {
            LatencyError::UnknownRequest(request_id.to_string())
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Per-source percentiles over the `window` ending at `now`.  Every
    /// source type is present, with zeroes when it saw no traffic.
    pub fn stats(&self, window: Duration, now: Instant) -> LatencyStats {
        let mut completed: HashMap<SourceType, Vec<Duration>> = HashMap::new();
        let mut failed: HashMap<SourceType, usize> = HashMap::new();

        for sample in self
            .samples
            .iter()
            .filter(|s| now.saturating_duration_since(s.closed_at) <= window)
        {
            match sample.ttfa {
                Some(ttfa) => completed.entry(sample.source).or_default().push(ttfa),
                None => *failed.entry(sample.source).or_default() += 1,
            }
        }

        let by_source = SourceType::ALL
            .into_iter()
            .map(|source| {
                let stats = SourceStats::compute(
                    completed.get(&source).map(Vec::as_slice).unwrap_or(&[]),
                    failed.get(&source).copied().unwrap_or(0),
                    self.config.targets.for_source(source),
                );
                (source, stats)
            })
            .collect();

        LatencyStats {
            window_secs: window.as_secs(),
            by_source,
            open: self.open.len(),
        }
    }

    /// Stats over the configured retention window.
    pub fn stats_default(&self, now: Instant) -> LatencyStats {
        self.stats(self.config.retention(), now)
    }

    /// Current alert conditions over the retention window.
    pub fn alerts(&self, now: Instant) -> Vec<LatencyAlert> {
        let stats = self.stats_default(now);
        let mut alerts = Vec::new();

        for (source, s) in &stats.by_source {
            if s.p95_breached() {
                alerts.push(LatencyAlert::P95AboveTarget {
                    source: *source,
                    p95_ms: s.p95_ms,
                    target_ms: s.target_ms,
                });
            }
            let streak = self.consecutive.get(source).copied().unwrap_or(0);
            if self.config.consecutive_breach_alert > 0 && streak >= self.config.consecutive_breach_alert {
                alerts.push(LatencyAlert::ConsecutiveBreaches {
                    source: *source,
                    count: streak,
                });
            }
        }
        alerts
    }

    pub fn assert_metrics(&self, assertion: &MetricsAssertion, now: Instant) -> AssertionReport {
        assertion.evaluate(&self.stats_default(now))
    }

    /// Drop samples and closed ids older than the retention window.  Open
    /// records older than that are abandoned with a warning.
    pub fn prune(&mut self, now: Instant) {
        let retention = self.config.retention();
        let expired = |at: Instant| now.saturating_duration_since(at) > retention;

        while self.samples.front().is_some_and(|s| expired(s.closed_at)) {
            self.samples.pop_front();
        }
        self.closed.retain(|_, at| !expired(*at));

        let before = self.open.len();
        self.open.retain(|_, r| !expired(r.started_at));
        let dropped = before - self.open.len();
        if dropped > 0 {
            log::warn!("latency: abandoned {dropped} request(s) never marked ready");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
