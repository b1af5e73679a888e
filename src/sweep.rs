//! Background auto-release sweep
//!
//! Periodically walks confirmed bookings and releases the ones the policy
//! says are eligible. One booking's failure never aborts the sweep over the
//! rest; a failed release is simply retried on the next cycle.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::{
    models::BookingStatus,
    orchestrator::EscrowOrchestrator,
    policy::ReleasePolicy,
    store::BookingStore,
    EscrowResult,
};

/// Configuration for the release sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Seconds between sweep cycles
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

/// Outcome of one sweep cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub released: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// Periodic auto-release driver
pub struct ReleaseSweeper {
    config: SweeperConfig,
    store: Arc<dyn BookingStore>,
    orchestrator: Arc<EscrowOrchestrator>,
    policy: ReleasePolicy,
}

impl ReleaseSweeper {
    /// Create a new sweeper
    pub fn new(
        config: SweeperConfig,
        store: Arc<dyn BookingStore>,
        orchestrator: Arc<EscrowOrchestrator>,
        policy: ReleasePolicy,
    ) -> Self {
        Self {
            config,
            store,
            orchestrator,
            policy,
        }
    }

    /// Start the sweep loop in the background
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_secs);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(outcome) if outcome.released > 0 || outcome.failed > 0 => {
                        info!(
                            "Sweep cycle: {} released, {} skipped, {} failed",
                            outcome.released, outcome.skipped, outcome.failed
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("Sweep cycle failed to list bookings: {}", e),
                }
            }
        })
    }

    /// Run a single sweep cycle
    pub async fn run_once(&self) -> EscrowResult<SweepOutcome> {
        let now = Utc::now();
        let confirmed = self.store.list_by_status(BookingStatus::Confirmed).await?;

        let mut outcome = SweepOutcome::default();
        for booking in confirmed {
            if !self.policy.is_auto_release_eligible(&booking, now) {
                outcome.skipped += 1;
                continue;
            }

            match self.orchestrator.release(booking.id).await {
                Ok(_) => outcome.released += 1,
                Err(e) => {
                    error!("Sweep release of booking {} failed: {}", booking.id, e);
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }
}
