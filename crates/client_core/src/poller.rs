use std::{sync::Arc, time::Duration};

use shared::domain::RoomId;
use tokio::{
    task::JoinHandle,
    time::{interval, timeout, MissedTickBehavior},
};

use crate::ChatSyncClient;

/// Fixed polling cadence, matching the source console's refresh interval.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Upper bound on any single fetch; an elapsed timeout is treated as a
/// failed fetch and retried on the next tick.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives one room's synchronization: an initial full fetch (no watermark
/// yet), then delta fetches on a fixed cadence. The task is tagged with the
/// epoch it was spawned under; every state mutation re-checks that epoch,
/// so a room switch both aborts the task and neutralizes any response that
/// is already in flight.
///
/// `MissedTickBehavior::Skip` plus the single task give the one-fetch-in-
/// flight rule for free: a tick that would fire while a fetch is
/// outstanding is skipped, never queued.
pub(crate) fn spawn_room_sync(
    client: Arc<ChatSyncClient>,
    room_id: RoomId,
    epoch: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            // The first tick completes immediately, giving the initial load.
            ticker.tick().await;
            if !client.run_sync_cycle(room_id, epoch).await {
                break;
            }
        }
    })
}

impl ChatSyncClient {
    /// One full or delta fetch followed by a merge. Returns `false` once
    /// the epoch is stale and the loop should stop.
    pub(crate) async fn run_sync_cycle(&self, room_id: RoomId, epoch: u64) -> bool {
        let since = {
            let guard = self.inner.lock().await;
            if guard.epoch != epoch {
                return false;
            }
            match guard.active.as_ref() {
                Some(active) if active.room.room_id == room_id => active.store.last_seen_id(),
                _ => return false,
            }
        };

        let fetched = match since {
            None => timeout(FETCH_TIMEOUT, self.backend.fetch_messages(room_id)).await,
            Some(id) => {
                timeout(FETCH_TIMEOUT, self.backend.fetch_messages_since(room_id, id)).await
            }
        };

        match fetched {
            Ok(Ok(records)) => self.apply_fetched_batch(room_id, epoch, records).await,
            Ok(Err(err)) => {
                self.note_fetch_failure(room_id, epoch, format!("fetch failed: {err}"))
                    .await
            }
            Err(_) => {
                self.note_fetch_failure(
                    room_id,
                    epoch,
                    format!("fetch for room {} timed out", room_id.0),
                )
                .await
            }
        }
    }
}
