//! Live session state: both sides' burn timers for every active room.
//!
//! The registry is the single authority for timers. Clients never simulate
//! their own countdown; they render `TimerUpdate` events pushed from here.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sparkler_db::Database;
use sparkler_types::events::GatewayEvent;
use sparkler_types::models::{EndReason, ParticipantId, Room, RoomId, SessionSummary, Side};

use crate::clock;
use crate::dispatcher::Dispatcher;
use crate::error::{ChannelError, SessionError};
use crate::timer::{DecayMultiplier, ExtensionResult, MAX_DECAY, TimerSettings, TimerState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Ended(EndReason),
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub room_id: RoomId,
    /// Tells apart successive sessions of the same room.
    pub generation: u64,
    pub participants: [ParticipantId; 2],
    pub status: SessionStatus,
    /// Indexed by [`Side::index`].
    pub timers: [TimerState; 2],
}

impl SessionSnapshot {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Handed to the task driving one session's clock. The same two participants
/// always share a room id, so a later pairing reuses it; `generation` ties
/// the clock to the session it was started for.
#[derive(Debug, Clone)]
pub struct ClockHandle {
    pub generation: u64,
    /// Cancelled once that session ends or is replaced.
    pub token: CancellationToken,
}

/// Result of one tick.
#[derive(Debug, Clone)]
pub struct Tick {
    pub timers: [TimerState; 2],
    /// Set when this tick ended the session.
    pub ended: Option<SessionSummary>,
}

struct Session {
    room: Room,
    generation: u64,
    timers: [TimerState; 2],
    status: SessionStatus,
    started_at: chrono::DateTime<chrono::Utc>,
    token: CancellationToken,
    /// Whether a clock handle has been given out.
    clocked: bool,
}

impl Session {
    fn new(room: Room, settings: &TimerSettings, generation: u64) -> Self {
        Self {
            started_at: room.created_at,
            room,
            generation,
            timers: [TimerState::new(settings); 2],
            status: SessionStatus::Active,
            token: CancellationToken::new(),
            clocked: false,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            room_id: self.room.id.clone(),
            generation: self.generation,
            participants: self.room.participants.clone(),
            status: self.status.clone(),
            timers: self.timers,
        }
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Active => Ok(()),
            SessionStatus::Ended(_) => Err(SessionError::SessionEnded(self.room.id.clone())),
        }
    }

    fn extensions_used(&self) -> [u32; 2] {
        [self.timers[0].extensions_used, self.timers[1].extensions_used]
    }

    /// At most one clock per live session.
    fn claim_clock(&mut self) -> Option<ClockHandle> {
        if self.clocked || self.status != SessionStatus::Active {
            return None;
        }
        self.clocked = true;
        Some(ClockHandle {
            generation: self.generation,
            token: self.token.clone(),
        })
    }

    fn close(&mut self, reason: EndReason) -> Ending {
        self.status = SessionStatus::Ended(reason.clone());
        self.token.cancel();
        Ending {
            reason,
            started_at: self.started_at,
            extensions_used: self.extensions_used(),
        }
    }
}

/// Whatever a finished session contributes to its summary.
struct Ending {
    reason: EndReason,
    started_at: chrono::DateTime<chrono::Utc>,
    extensions_used: [u32; 2],
}

pub struct SessionEngine {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    settings: TimerSettings,
    sessions: RwLock<HashMap<RoomId, Session>>,
    generations: AtomicU64,
}

impl SessionEngine {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher, settings: TimerSettings) -> Self {
        Self {
            db,
            dispatcher,
            settings,
            sessions: RwLock::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &TimerSettings {
        &self.settings
    }

    /// Start tracking `room`. Idempotent for a live session; a session left
    /// over from an earlier, ended pairing of the same two participants is
    /// replaced.
    ///
    /// The first call for a live session also returns the handle its clock
    /// should run with; later calls get `None`.
    pub async fn open(&self, room: &Room) -> (SessionSnapshot, Option<ClockHandle>) {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get_mut(&room.id) {
            if existing.status == SessionStatus::Active {
                return (existing.snapshot(), existing.claim_clock());
            }
            existing.token.cancel();
        }

        let mut session = Session::new(room.clone(), &self.settings, self.next_generation());
        let clock = session.claim_clock();
        let snapshot = session.snapshot();
        sessions.insert(room.id.clone(), session);
        info!("Session {} opened (generation {})", room.id, snapshot.generation);
        (snapshot, clock)
    }

    pub async fn snapshot(&self, room_id: &RoomId) -> Result<SessionSnapshot, SessionError> {
        self.with_session(room_id, |s| s.snapshot()).await
    }

    pub async fn side_of(
        &self,
        room_id: &RoomId,
        participant: &ParticipantId,
    ) -> Result<Side, SessionError> {
        self.with_session(room_id, |s| {
            s.room
                .side_of(participant)
                .ok_or_else(|| SessionError::NotParticipant {
                    room_id: room_id.clone(),
                    participant: participant.clone(),
                })
        })
        .await?
    }

    /// Burn `elapsed × decay` off both sides and end the session if the
    /// termination policy says so.
    pub async fn tick(
        &self,
        room_id: &RoomId,
        elapsed: Duration,
        decay: f64,
    ) -> Result<Tick, SessionError> {
        self.advance(room_id, None, elapsed, decay).await
    }

    /// [`tick`](Self::tick) on behalf of a clock. A clock whose session has
    /// since been replaced sees `SessionEnded`.
    pub async fn tick_clock(
        &self,
        room_id: &RoomId,
        clock: &ClockHandle,
        elapsed: Duration,
        decay: f64,
    ) -> Result<Tick, SessionError> {
        self.advance(room_id, Some(clock.generation), elapsed, decay)
            .await
    }

    async fn advance(
        &self,
        room_id: &RoomId,
        generation: Option<u64>,
        elapsed: Duration,
        decay: f64,
    ) -> Result<Tick, SessionError> {
        let decay = DecayMultiplier::new(decay).ok_or(SessionError::InvalidDecay {
            value: decay,
            max: MAX_DECAY,
        })?;
        let termination = self.settings.termination;

        let (timers, ending) = self
            .with_session(room_id, |s| {
                if generation.is_some_and(|g| g != s.generation) {
                    return Err(SessionError::SessionEnded(room_id.clone()));
                }
                s.ensure_active()?;
                for timer in &mut s.timers {
                    timer.burn(elapsed, decay);
                }

                let ending = termination
                    .should_end(&s.timers)
                    .then(|| s.close(EndReason::TimeUp));
                Ok::<_, SessionError>((s.timers, ending))
            })
            .await??;

        self.broadcast_timers(room_id, &timers);

        let ended = match ending {
            Some(ending) => Some(self.finish(room_id, ending).await?),
            None => None,
        };
        Ok(Tick { timers, ended })
    }

    /// Try to extend `side`. Denials are ordinary outcomes, not errors.
    pub async fn request_extension(
        &self,
        room_id: &RoomId,
        side: Side,
    ) -> Result<ExtensionResult, SessionError> {
        let (result, timers) = self
            .with_session(room_id, |s| {
                s.ensure_active()?;
                let result = s.timers[side.index()].try_extend(&self.settings);
                Ok::<_, SessionError>((result, s.timers))
            })
            .await??;

        match result {
            ExtensionResult::Granted { added, .. } => {
                debug!("Session {} side {:?} extended by {:?}", room_id, side, added);
                self.broadcast_timers(room_id, &timers);
            }
            denied => debug!("Session {} side {:?} extension denied: {:?}", room_id, side, denied),
        }
        Ok(result)
    }

    /// End a live session regardless of the timers, discarding the room log.
    pub async fn end(
        &self,
        room_id: &RoomId,
        reason: EndReason,
    ) -> Result<SessionSummary, SessionError> {
        let ending = self
            .with_session(room_id, |s| {
                s.ensure_active()?;
                Ok::<_, SessionError>(s.close(reason))
            })
            .await??;

        self.finish(room_id, ending).await
    }

    /// Record that `room` was already ended in the store by someone else
    /// (a cancel or the reaper) and announce the summary.
    pub async fn mark_ended(
        &self,
        room: &Room,
        reason: EndReason,
        discarded: u64,
    ) -> SessionSummary {
        let mut sessions = self.sessions.write().await;
        let ending = match sessions.get_mut(&room.id) {
            Some(session) => session.close(reason),
            None => Ending {
                reason,
                started_at: room.created_at,
                extensions_used: [0, 0],
            },
        };
        drop(sessions);

        self.announce(&room.id, ending, discarded)
    }

    /// Drop sessions whose rooms no longer exist.
    pub async fn forget(&self, room_ids: &[RoomId]) {
        if room_ids.is_empty() {
            return;
        }
        let mut sessions = self.sessions.write().await;
        for id in room_ids {
            if let Some(session) = sessions.remove(id) {
                session.token.cancel();
            }
        }
    }

    /// Can `sender` post into `room_id` right now?
    pub async fn check_sender(
        &self,
        room_id: &RoomId,
        sender: &ParticipantId,
    ) -> Result<(), ChannelError> {
        let verdict = self
            .with_session(room_id, |s| {
                if s.ensure_active().is_err() {
                    return Err(ChannelError::SessionEnded(room_id.clone()));
                }
                let Some(side) = s.room.side_of(sender) else {
                    return Err(ChannelError::NotParticipant {
                        room_id: room_id.clone(),
                        participant: sender.clone(),
                    });
                };
                if s.timers[side.index()].is_exhausted() {
                    return Err(ChannelError::BurnedOut(sender.clone()));
                }
                Ok(())
            })
            .await;

        match verdict {
            Ok(verdict) => verdict,
            Err(SessionError::NotFound(id)) => Err(ChannelError::RoomNotFound(id)),
            Err(SessionError::SessionEnded(id)) => Err(ChannelError::SessionEnded(id)),
            Err(SessionError::Store(e)) => Err(ChannelError::Store(e)),
            Err(other) => {
                warn!("Unexpected session error on send check: {}", other);
                Err(ChannelError::RoomNotFound(room_id.clone()))
            }
        }
    }

    /// Run `f` on the session, loading an active room from the store when
    /// this process has not seen it yet (e.g. after a restart).
    async fn with_session<T>(
        &self,
        room_id: &RoomId,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Result<T, SessionError> {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(room_id) {
                return Ok(f(session));
            }
        }

        let room = self
            .db
            .get_room(room_id)?
            .ok_or_else(|| SessionError::NotFound(room_id.clone()))?;
        if !room.is_active() {
            return Err(SessionError::SessionEnded(room_id.clone()));
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(room_id.clone())
            .or_insert_with(|| Session::new(room, &self.settings, self.next_generation()));
        Ok(f(session))
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn finish(&self, room_id: &RoomId, ending: Ending) -> Result<SessionSummary, SessionError> {
        let discarded = match self.db.end_room(room_id, clock::now())? {
            Some((_, discarded)) => discarded,
            None => {
                debug!("Room {} was already ended in the store", room_id);
                0
            }
        };
        Ok(self.announce(room_id, ending, discarded))
    }

    fn announce(&self, room_id: &RoomId, ending: Ending, message_count: u64) -> SessionSummary {
        let duration = clock::now() - ending.started_at;
        let summary = SessionSummary {
            room_id: room_id.clone(),
            reason: ending.reason,
            duration_secs: u64::try_from(duration.num_seconds()).unwrap_or(0),
            message_count,
            extensions_used: ending.extensions_used,
        };

        info!(
            "Session {} ended ({:?}) after {}s, {} messages discarded",
            room_id, summary.reason, summary.duration_secs, message_count
        );
        self.dispatcher
            .broadcast(GatewayEvent::SessionEnded(summary.clone()));
        summary
    }

    fn broadcast_timers(&self, room_id: &RoomId, timers: &[TimerState; 2]) {
        self.dispatcher.broadcast(GatewayEvent::TimerUpdate {
            room_id: room_id.clone(),
            timers: [timers[0].view(), timers[1].view()],
        });
    }
}
