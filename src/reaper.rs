//! Background task that kills the session once it has sat idle too long.

use crate::session::{ReapCheck, WeakSessionManager};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;
use uuid::Uuid;

/// Start a reaper for `session_id`. It exits on its own once that session is
/// reaped or replaced; the manager aborts it on terminate and shutdown.
pub(crate) fn spawn(manager: WeakSessionManager, session_id: Uuid, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            match manager.reap_if_idle(session_id).await {
                ReapCheck::Keep => {}
                ReapCheck::Reaped | ReapCheck::Gone => {
                    debug!(session_id = %session_id, "Idle reaper stopping");
                    return;
                }
            }
        }
    })
}
