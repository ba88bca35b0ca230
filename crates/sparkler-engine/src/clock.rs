//! Wall-clock helpers and the per-session tick loop.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use sparkler_types::models::RoomId;

use crate::error::SessionError;
use crate::session::{ClockHandle, SessionEngine};
use crate::timer::DecayMultiplier;

/// Current time at the store's millisecond resolution, so values read back
/// compare equal to the ones written.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Latest decay multiplier reported for each room, tagged with the session
/// generation it was reported for.
#[derive(Default)]
pub struct DecayBoard {
    rooms: RwLock<HashMap<RoomId, (u64, DecayMultiplier)>>,
}

impl DecayBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, room_id: &RoomId, generation: u64, decay: DecayMultiplier) {
        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(room_id.clone(), (generation, decay));
    }

    /// Neutral until something is reported for this generation.
    pub fn get(&self, room_id: &RoomId, generation: u64) -> DecayMultiplier {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .filter(|(g, _)| *g == generation)
            .map(|(_, decay)| *decay)
            .unwrap_or_default()
    }

    /// Leaves entries of any other generation alone.
    pub fn clear(&self, room_id: &RoomId, generation: u64) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if rooms.get(room_id).is_some_and(|(g, _)| *g == generation) {
            rooms.remove(room_id);
        }
    }
}

/// Tick `room_id` every `period` with the measured elapsed time and the
/// latest reported decay, until the session `clock` belongs to ends.
pub async fn run_session_clock(
    sessions: Arc<SessionEngine>,
    decay: Arc<DecayBoard>,
    room_id: RoomId,
    clock: ClockHandle,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    interval.tick().await;
    let mut last = Instant::now();

    debug!(
        "Session clock for {} started ({:?}, generation {})",
        room_id, period, clock.generation
    );
    loop {
        tokio::select! {
            biased;
            _ = clock.token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let multiplier = decay.get(&room_id, clock.generation).value();
        match sessions
            .tick_clock(&room_id, &clock, elapsed, multiplier)
            .await
        {
            Ok(tick) if tick.ended.is_some() => break,
            Ok(_) => {}
            Err(SessionError::Store(e)) if e.is_transient() => {
                warn!("Session clock for {}: transient store error: {}", room_id, e);
            }
            Err(SessionError::SessionEnded(_)) | Err(SessionError::NotFound(_)) => break,
            Err(e) => {
                warn!("Session clock for {} stopping: {}", room_id, e);
                break;
            }
        }
    }

    decay.clear(&room_id, clock.generation);
    debug!("Session clock for {} stopped", room_id);
}
