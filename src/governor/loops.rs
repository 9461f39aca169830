//! Background loops: host resource sampling and backend health polling.
//!
//! Both loops feed the admission gate's hysteresis.  When a check pushes the
//! gate into an emergency it was not already in, the loop starts a recycle.
//! Both stop when the governor's cancellation token fires.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::admission::MetricsSource;
use crate::governor::service::Governor;

impl Governor {
    /// Sample `source` every `metrics_interval_secs` and feed the gate.
    pub fn spawn_metrics_sampler(self: &Arc<Self>, mut source: Box<dyn MetricsSource>) -> JoinHandle<()> {
        let governor = Arc::clone(self);
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = interval(governor.config.metrics_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let metrics = source.sample();
                let entered_emergency = {
                    let mut gate = governor.gate.lock();
                    let before = gate.in_emergency();
                    gate.observe(&metrics, Instant::now());
                    !before && gate.in_emergency()
                };

                if entered_emergency {
                    log::warn!(
                        "governor: sustained resource exhaustion (cpu {:.0}%, ram {:.0}%), recycling backend",
                        metrics.cpu_pct,
                        metrics.ram_pct
                    );
                    governor.spawn_recycle();
                }
            }
            log::debug!("governor: metrics sampler stopped");
        })
    }

    /// Poll both backends every `health_interval_secs`, updating the router
    /// flags.  A poll where neither backend answers counts as a failed gate
    /// check; healthy polls are not fed to the gate, so they cannot reset a
    /// resource-exhaustion streak built up by the sampler.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let governor = Arc::clone(self);
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = interval(governor.config.backends.health_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let health = tokio::select! {
                    _ = token.cancelled() => break,
                    h = governor.router.poll_health() => h,
                };

                // The supervisor owns the server while it is recycling.
                if health.any() || governor.supervisor.is_running() {
                    continue;
                }

                let entered_emergency = {
                    let mut gate = governor.gate.lock();
                    let before = gate.in_emergency();
                    gate.record_check(false, Instant::now());
                    !before && gate.in_emergency()
                };

                if entered_emergency {
                    log::warn!("governor: no backend healthy for the emergency window, recycling");
                    governor.spawn_recycle();
                }
            }
            log::debug!("governor: health monitor stopped");
        })
    }

    /// Start both loops.
    pub fn spawn_background(self: &Arc<Self>, source: Box<dyn MetricsSource>) -> Vec<JoinHandle<()>> {
        vec![self.spawn_metrics_sampler(source), self.spawn_health_monitor()]
    }
}
