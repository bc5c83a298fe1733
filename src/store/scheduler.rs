//! Background maintenance scheduler
//!
//! Low-frequency timer: each tick runs retention cleanup and compaction on a
//! blocking thread. A failed tick is logged and the next one tries again.
//! Missed ticks are skipped, never bunched up.

use super::engine::CandleStore;
use super::maintenance::{CancelFlag, RetentionPolicy};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Maintenance scheduler task
///
/// Arguments:
/// - `store`: shared store handle
/// - `period`: time between runs (the first run happens one period in)
/// - `policy`: retention window applied on each run
/// - `shutdown`: flips to `true` to stop; an in-flight run is cancelled at
///   its next phase boundary
pub async fn maintenance_scheduler_task(
    store: Arc<CandleStore>,
    period: Duration,
    policy: RetentionPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!(
        "⏰ Starting maintenance scheduler (interval: {}s, retention: {} days)",
        period.as_secs(),
        policy.max_age_days
    );

    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // interval() fires immediately; the first run waits a full period
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let cancel = CancelFlag::new();
        let run_store = Arc::clone(&store);
        let run_cancel = cancel.clone();
        let mut run = tokio::task::spawn_blocking(move || run_store.run_maintenance(policy, &run_cancel));

        let result = tokio::select! {
            result = &mut run => result,
            _ = shutdown.changed() => {
                log::info!("🛑 Shutdown requested, cancelling maintenance run");
                cancel.cancel();
                let result = run.await;
                log_run(result);
                break;
            }
        };
        log_run(result);
    }

    log::info!("⏰ Maintenance scheduler stopped");
}

fn log_run(result: Result<Result<(), super::error::StoreError>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => log::debug!("✅ Scheduled maintenance complete"),
        Ok(Err(e)) => log::error!("❌ Scheduled maintenance failed: {}", e),
        Err(e) => log::error!("❌ Scheduled maintenance panicked: {}", e),
    }
}
