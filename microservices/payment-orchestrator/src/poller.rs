//! Background polling for pending payments whose callback never arrived

use crate::model::ReconcileOutcome;
use crate::orchestrator::PaymentOrchestrator;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

const BATCH_SIZE: usize = 100;

pub struct StatusPoller {
    orchestrator: PaymentOrchestrator,
    interval: Duration,
    callback_window: Duration,
}

/// Summary of one polling sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub polled: usize,
    pub applied: usize,
    pub unresolved: usize,
    pub errors: usize,
}

impl StatusPoller {
    pub fn new(
        orchestrator: PaymentOrchestrator,
        interval: Duration,
        callback_window: Duration,
    ) -> Self {
        Self {
            orchestrator,
            interval,
            callback_window,
        }
    }

    /// Run until `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            info!(
                interval_secs = self.interval.as_secs(),
                callback_window_secs = self.callback_window.as_secs(),
                "Status poller started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Status poller stopped");
        })
    }

    /// Poll every pending intent quiet for longer than the callback window
    pub async fn sweep(&self) -> SweepReport {
        let window =
            chrono::Duration::from_std(self.callback_window).unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - window;

        let stale = match self.orchestrator.stale_pending(cutoff, BATCH_SIZE).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "Could not list pending payments");
                return SweepReport {
                    errors: 1,
                    ..SweepReport::default()
                };
            }
        };

        let mut report = SweepReport::default();
        for intent in stale {
            report.polled += 1;
            match self.orchestrator.poll_status(&intent.merchant_reference).await {
                Ok((_, ReconcileOutcome::Applied { .. })) => report.applied += 1,
                Ok((_, ReconcileOutcome::Unresolved)) => report.unresolved += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(
                        merchant_reference = %intent.merchant_reference,
                        rail = %intent.rail,
                        error = %e,
                        "Status poll failed"
                    );
                }
            }
        }

        if report.polled > 0 {
            info!(
                polled = report.polled,
                applied = report.applied,
                unresolved = report.unresolved,
                errors = report.errors,
                "Status poll sweep"
            );
        } else {
            debug!("No stale pending payments");
        }
        report
    }
}
