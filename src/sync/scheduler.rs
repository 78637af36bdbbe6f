//! One periodic task per sync target.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::engine::{CycleOutcome, SyncEngine};
use crate::session::SessionHandle;

/// Running tick tasks. Stopped explicitly, on drop, or when the session closes.
pub struct Scheduler {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(engine: Arc<SyncEngine>, session: SessionHandle, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let tasks = (0..engine.target_count())
            .map(|index| {
                tokio::spawn(run_target(
                    engine.clone(),
                    session.clone(),
                    index,
                    interval,
                    cancel.clone(),
                ))
            })
            .collect();
        Self { cancel, tasks }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && self.tasks.iter().any(|t| !t.is_finished())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_target(
    engine: Arc<SyncEngine>,
    session: SessionHandle,
    index: usize,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = session.closed() => break,
            _ = ticker.tick() => {}
        }

        match engine.try_cycle(&session, index).await {
            Ok(CycleOutcome::Started { .. }) => {}
            Ok(outcome) => debug!(target_index = index, ?outcome, "Tick skipped"),
            Err(e) => warn!(target_index = index, "Sync cycle failed to start: {:#}", e),
        }
    }
    debug!(target_index = index, "Scheduler stopped");
}
