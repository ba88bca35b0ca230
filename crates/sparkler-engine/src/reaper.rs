use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use sparkler_db::{Database, StoreError};
use sparkler_types::models::EndReason;

use crate::clock;
use crate::session::SessionEngine;

#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub interval: Duration,
    /// Waiting entries older than this are dropped.
    pub queue_ttl: Duration,
    /// Ended rooms are deleted this long after they ended.
    pub room_ttl: Duration,
    /// Active rooms older than this are ended as abandoned.
    pub abandoned_after: Duration,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            queue_ttl: Duration::from_secs(600),
            room_ttl: Duration::from_secs(600),
            abandoned_after: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub waiting: usize,
    pub abandoned: usize,
    pub rooms: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.waiting == 0 && self.abandoned == 0 && self.rooms == 0
    }
}

/// Reclaims queue entries left behind by clients that vanished without
/// cancelling, and rooms nobody will touch again.
pub struct Reaper {
    db: Arc<Database>,
    sessions: Arc<SessionEngine>,
    settings: ReaperSettings,
}

impl Reaper {
    pub fn new(db: Arc<Database>, sessions: Arc<SessionEngine>, settings: ReaperSettings) -> Self {
        Self {
            db,
            sessions,
            settings,
        }
    }

    pub fn settings(&self) -> &ReaperSettings {
        &self.settings
    }

    /// One pass as of `now`. Only records strictly older than each limit go.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let waiting = self
            .db
            .delete_waiting_before(cutoff(now, self.settings.queue_ttl))?;
        for participant in &waiting {
            debug!("Reaped stale queue entry for {}", participant);
        }

        let mut abandoned = 0;
        for room in self
            .db
            .active_rooms_created_before(cutoff(now, self.settings.abandoned_after))?
        {
            // Someone may have ended it since the read
            if let Some((room, discarded)) = self.db.end_room(&room.id, now)? {
                self.sessions
                    .mark_ended(&room, EndReason::Abandoned, discarded)
                    .await;
                abandoned += 1;
            }
        }

        let deleted = self
            .db
            .delete_ended_rooms_before(cutoff(now, self.settings.room_ttl))?;
        self.sessions.forget(&deleted).await;

        Ok(SweepReport {
            waiting: waiting.len(),
            abandoned,
            rooms: deleted.len(),
        })
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Background task running [`Reaper::sweep`] on the configured interval.
pub async fn run_reaper_loop(reaper: Arc<Reaper>) {
    let mut interval = tokio::time::interval(reaper.settings.interval);

    loop {
        interval.tick().await;

        match reaper.sweep(clock::now()).await {
            Ok(report) => {
                if !report.is_empty() {
                    info!(
                        "Reaper: {} queue entries, {} abandoned rooms ended, {} rooms deleted",
                        report.waiting, report.abandoned, report.rooms
                    );
                }
            }
            Err(e) => {
                warn!("Reaper error: {}", e);
            }
        }
    }
}
