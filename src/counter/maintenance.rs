//! Background counter maintenance.
//!
//! One timer task per registry drives two activities:
//! - snapshot rotation, on each service's own jittered period
//! - stale-endpoint cleanup, when a live-endpoint source is attached

use super::CounterRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Supplies the endpoints currently known to discovery for a service.
pub trait LiveEndpoints: Send + Sync {
    /// `None` means "unknown", which skips cleanup for that service.
    fn live_endpoints(&self, service: &str) -> Option<HashSet<String>>;
}

impl<F> LiveEndpoints for F
where
    F: Fn(&str) -> Option<HashSet<String>> + Send + Sync,
{
    fn live_endpoints(&self, service: &str) -> Option<HashSet<String>> {
        self(service)
    }
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub rotated_services: usize,
    pub evicted_endpoints: usize,
}

pub struct CounterMaintenance {
    registry: Arc<CounterRegistry>,
    live: Option<Arc<dyn LiveEndpoints>>,
}

impl CounterMaintenance {
    pub fn new(registry: Arc<CounterRegistry>) -> Self {
        Self {
            registry,
            live: None,
        }
    }

    pub fn with_live_endpoints(mut self, live: Arc<dyn LiveEndpoints>) -> Self {
        self.live = Some(live);
        self
    }

    /// Run one pass at `now`.
    pub fn run_once(&self, now: Instant) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let config = self.registry.config();
        for service in self.registry.services() {
            if service.rotate_if_due(now) {
                report.rotated_services += 1;
            }
            if let Some(live) = &self.live {
                if let Some(ids) = live.live_endpoints(service.name()) {
                    report.evicted_endpoints += service.try_cleanup(&ids, config, now);
                }
            }
        }
        report
    }

    /// Start the timer task on the current tokio runtime.
    pub fn spawn(self) -> MaintenanceHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tick = self.registry.config().tick();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let report = self.run_once(Instant::now());
                        if report != MaintenanceReport::default() {
                            debug!(
                                rotated = report.rotated_services,
                                evicted = report.evicted_endpoints,
                                "counter maintenance pass"
                            );
                        }
                    }
                }
            }
        });
        MaintenanceHandle { cancel, join }
    }
}

/// Handle to a running maintenance task.
pub struct MaintenanceHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Stop the task and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
