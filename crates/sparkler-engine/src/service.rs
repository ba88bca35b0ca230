use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures_util::Stream;
use tokio::sync::broadcast;
use tracing::{debug, info};

use sparkler_db::{Change, Database};
use sparkler_types::events::RoomCreated;
use sparkler_types::models::{EndReason, Message, ParticipantId, Room, RoomId, SessionSummary, Side};

use crate::channel::MessageChannel;
use crate::clock::{self, DecayBoard, run_session_clock};
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ChannelError, MatchError, SessionError};
use crate::matchmaker::{MatchOutcome, Matchmaker, Placement};
use crate::reaper::Reaper;
use crate::session::{SessionEngine, SessionSnapshot, Tick};
use crate::timer::{DecayMultiplier, ExtensionResult};

/// The engine as callers see it. Build one with [`Sparkler::new`] and clone
/// it freely; clones share state.
#[derive(Clone)]
pub struct Sparkler {
    inner: Arc<SparklerInner>,
}

struct SparklerInner {
    db: Arc<Database>,
    config: EngineConfig,
    dispatcher: Dispatcher,
    matchmaker: Matchmaker,
    sessions: Arc<SessionEngine>,
    channel: MessageChannel,
    reaper: Arc<Reaper>,
    decay: Arc<DecayBoard>,
}

impl Sparkler {
    pub fn new(db: Database, config: EngineConfig) -> Self {
        let db = Arc::new(db);
        let dispatcher = Dispatcher::new();
        let sessions = Arc::new(SessionEngine::new(
            db.clone(),
            dispatcher.clone(),
            config.timer.clone(),
        ));

        Self {
            inner: Arc::new(SparklerInner {
                matchmaker: Matchmaker::new(db.clone(), config.retry.clone()),
                channel: MessageChannel::new(db.clone(), config.max_message_len),
                reaper: Arc::new(Reaper::new(
                    db.clone(),
                    sessions.clone(),
                    config.reaper.clone(),
                )),
                decay: Arc::new(DecayBoard::new()),
                sessions,
                dispatcher,
                config,
                db,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Session events (timer updates, endings) for every room.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Committed store changes.
    pub fn changes(&self) -> broadcast::Receiver<Change> {
        self.inner.db.changes()
    }

    pub fn reaper(&self) -> Arc<Reaper> {
        self.inner.reaper.clone()
    }

    // -- Matchmaking --

    pub async fn enqueue(&self, participant: &ParticipantId) -> Result<MatchOutcome, MatchError> {
        let placement = self.inner.matchmaker.place(participant).await?;
        if let Placement::Matched(room) = &placement {
            self.attach(room).await;
        }
        Ok(placement.outcome())
    }

    /// Leave the queue, or the live room if already matched.
    pub async fn cancel(&self, participant: &ParticipantId) -> Result<(), MatchError> {
        if let Some((room, discarded)) = self.inner.matchmaker.cancel(participant).await? {
            self.inner
                .sessions
                .mark_ended(
                    &room,
                    EndReason::Cancelled {
                        by: participant.clone(),
                    },
                    discarded,
                )
                .await;
        }
        Ok(())
    }

    pub fn subscribe_to_match(
        &self,
        participant: &ParticipantId,
    ) -> impl Stream<Item = RoomCreated> + Send + use<> {
        self.inner.matchmaker.subscribe_to_match(participant)
    }

    // -- Messages --

    pub async fn send_message(
        &self,
        room_id: &RoomId,
        sender: &ParticipantId,
        text: &str,
    ) -> Result<Message, ChannelError> {
        self.inner.sessions.check_sender(room_id, sender).await?;
        self.inner.channel.append(room_id, sender, text)
    }

    /// Live messages of `room_id` after sequence `after` (0 for everything).
    pub fn subscribe_to_room(
        &self,
        room_id: &RoomId,
        after: u64,
    ) -> impl Stream<Item = Message> + Send + use<> {
        let messages = self.inner.channel.subscribe(room_id, after);
        let this = self.clone();
        let room_id = room_id.clone();

        stream! {
            // A room from before a restart gets its clock back on first attach
            if let Ok(Some(room)) = this.inner.db.get_room(&room_id) {
                this.attach(&room).await;
            }
            for await message in messages {
                yield message;
            }
        }
    }

    /// The messages `participant` should currently be shown, per the
    /// configured visibility policy.
    pub fn visible_messages(
        &self,
        room_id: &RoomId,
        participant: &ParticipantId,
    ) -> Result<Vec<Message>, ChannelError> {
        let room = self
            .inner
            .db
            .get_room(room_id)?
            .ok_or_else(|| ChannelError::RoomNotFound(room_id.clone()))?;
        if !room.contains(participant) {
            return Err(ChannelError::NotParticipant {
                room_id: room_id.clone(),
                participant: participant.clone(),
            });
        }
        if !room.is_active() {
            return Err(ChannelError::SessionEnded(room_id.clone()));
        }

        let log = self.inner.channel.history(room_id)?;
        Ok(self
            .inner
            .config
            .visibility
            .visible(&log, clock::now())
            .into_iter()
            .cloned()
            .collect())
    }

    // -- Sessions --

    pub async fn session(&self, room_id: &RoomId) -> Result<SessionSnapshot, SessionError> {
        self.inner.sessions.snapshot(room_id).await
    }

    pub async fn tick(
        &self,
        room_id: &RoomId,
        elapsed: Duration,
        decay: f64,
    ) -> Result<Tick, SessionError> {
        self.inner.sessions.tick(room_id, elapsed, decay).await
    }

    pub async fn request_extension(
        &self,
        room_id: &RoomId,
        side: Side,
    ) -> Result<ExtensionResult, SessionError> {
        self.inner.sessions.request_extension(room_id, side).await
    }

    /// Extend the side `participant` holds.
    pub async fn request_extension_for(
        &self,
        room_id: &RoomId,
        participant: &ParticipantId,
    ) -> Result<(Side, ExtensionResult), SessionError> {
        let side = self.inner.sessions.side_of(room_id, participant).await?;
        let result = self.inner.sessions.request_extension(room_id, side).await?;
        Ok((side, result))
    }

    /// Explicit exit by `participant`, independent of the timers.
    pub async fn end_session(
        &self,
        room_id: &RoomId,
        participant: &ParticipantId,
    ) -> Result<SessionSummary, SessionError> {
        self.inner.sessions.side_of(room_id, participant).await?;
        self.inner
            .sessions
            .end(
                room_id,
                EndReason::Exited {
                    by: participant.clone(),
                },
            )
            .await
    }

    /// Record device tilt for the room's session clock.
    pub async fn report_tilt(
        &self,
        room_id: &RoomId,
        participant: &ParticipantId,
        tilt: f64,
    ) -> Result<DecayMultiplier, SessionError> {
        self.inner.sessions.side_of(room_id, participant).await?;
        let snapshot = self.inner.sessions.snapshot(room_id).await?;
        if !snapshot.is_active() {
            return Err(SessionError::SessionEnded(room_id.clone()));
        }

        let decay = DecayMultiplier::from_tilt(tilt);
        self.inner.decay.set(room_id, snapshot.generation, decay);
        debug!("{} reported tilt {:.2} in {}", participant, tilt, room_id);
        Ok(decay)
    }

    /// Open the session for `room` and, the first time, start its clock.
    async fn attach(&self, room: &Room) {
        if !room.is_active() {
            return;
        }
        let Some(period) = self.inner.config.clock_period else {
            self.inner.sessions.open(room).await;
            return;
        };
        let (_, Some(clock)) = self.inner.sessions.open(room).await else {
            return;
        };
        info!(
            "Starting session clock for {} (generation {})",
            room.id, clock.generation
        );
        tokio::spawn(run_session_clock(
            self.inner.sessions.clone(),
            self.inner.decay.clone(),
            room.id.clone(),
            clock,
            period,
        ));
    }
}

#[cfg(test)]
mod tests {
    use sparkler_types::events::GatewayEvent;

    use super::*;
    use crate::visibility::VisibilityPolicy;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    fn service(config: EngineConfig) -> (Sparkler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("sparkler.db")).unwrap();
        (Sparkler::new(db, config), dir)
    }

    fn manual_clock() -> EngineConfig {
        EngineConfig {
            clock_period: None,
            ..EngineConfig::default()
        }
    }

    async fn matched(sparkler: &Sparkler, a: &str, b: &str) -> RoomId {
        assert_eq!(sparkler.enqueue(&pid(a)).await.unwrap(), MatchOutcome::Pending);
        match sparkler.enqueue(&pid(b)).await.unwrap() {
            MatchOutcome::Matched(room_id) => room_id,
            MatchOutcome::Pending => panic!("{b} should have claimed {a}"),
        }
    }

    #[tokio::test]
    async fn chat_then_exit() {
        let (sparkler, _dir) = service(manual_clock());
        let room_id = matched(&sparkler, "alice", "bob").await;

        for i in 0..8 {
            let sender = if i % 2 == 0 { "alice" } else { "bob" };
            sparkler
                .send_message(&room_id, &pid(sender), &format!("msg {}", i))
                .await
                .unwrap();
        }

        let visible = sparkler.visible_messages(&room_id, &pid("alice")).unwrap();
        let sequences: Vec<_> = visible.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5, 6, 7, 8]);

        let summary = sparkler.end_session(&room_id, &pid("bob")).await.unwrap();
        assert_eq!(summary.message_count, 8);
        assert_eq!(summary.reason, EndReason::Exited { by: pid("bob") });

        let err = sparkler
            .send_message(&room_id, &pid("alice"), "anyone?")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "session_ended");
        assert!(matches!(
            sparkler.end_session(&room_id, &pid("alice")).await,
            Err(SessionError::SessionEnded(_))
        ));
    }

    #[tokio::test]
    async fn room_subscription_follows_until_exit() {
        use futures_util::StreamExt;

        let (sparkler, _dir) = service(manual_clock());
        let room_id = matched(&sparkler, "a", "b").await;
        sparkler.send_message(&room_id, &pid("a"), "hello").await.unwrap();

        let mut stream = Box::pin(sparkler.subscribe_to_room(&room_id, 0));
        assert_eq!(stream.next().await.unwrap().content, "hello");

        sparkler.send_message(&room_id, &pid("b"), "hi").await.unwrap();
        assert_eq!(stream.next().await.unwrap().sequence, 2);

        sparkler.end_session(&room_id, &pid("a")).await.unwrap();
        let rest = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(rest.is_none());
    }

    #[tokio::test]
    async fn timed_visibility_uses_message_age() {
        let (sparkler, _dir) = service(EngineConfig {
            visibility: VisibilityPolicy::Timed {
                ttl: Duration::from_secs(60),
            },
            ..manual_clock()
        });
        let room_id = matched(&sparkler, "a", "b").await;
        for _ in 0..10 {
            sparkler.send_message(&room_id, &pid("a"), "hi").await.unwrap();
        }
        assert_eq!(sparkler.visible_messages(&room_id, &pid("b")).unwrap().len(), 10);
    }

    #[tokio::test]
    async fn cancel_in_a_live_room_ends_it_for_both() {
        let (sparkler, _dir) = service(manual_clock());
        let room_id = matched(&sparkler, "a", "b").await;
        let mut events = sparkler.dispatcher().subscribe();

        sparkler.cancel(&pid("a")).await.unwrap();

        match events.try_recv().unwrap() {
            GatewayEvent::SessionEnded(summary) => {
                assert_eq!(summary.room_id, room_id);
                assert_eq!(summary.reason, EndReason::Cancelled { by: pid("a") });
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!sparkler.session(&room_id).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn burned_out_side_is_muted_while_the_other_talks() {
        let (sparkler, _dir) = service(manual_clock());
        let room_id = matched(&sparkler, "alice", "bob").await;

        let (_, result) = sparkler
            .request_extension_for(&room_id, &pid("bob"))
            .await
            .unwrap();
        assert!(matches!(result, ExtensionResult::Granted { .. }));

        let tick = sparkler
            .tick(&room_id, Duration::from_secs(60), 1.0)
            .await
            .unwrap();
        assert!(tick.ended.is_none());

        let err = sparkler
            .send_message(&room_id, &pid("alice"), "wait")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "burned_out");
        sparkler
            .send_message(&room_id, &pid("bob"), "still here")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn outsiders_cannot_touch_a_session() {
        let (sparkler, _dir) = service(manual_clock());
        let room_id = matched(&sparkler, "a", "b").await;
        let eve = pid("eve");

        assert!(matches!(
            sparkler.end_session(&room_id, &eve).await,
            Err(SessionError::NotParticipant { .. })
        ));
        assert!(matches!(
            sparkler.report_tilt(&room_id, &eve, 0.5).await,
            Err(SessionError::NotParticipant { .. })
        ));
        assert!(matches!(
            sparkler.visible_messages(&room_id, &eve),
            Err(ChannelError::NotParticipant { .. })
        ));
    }

    #[tokio::test]
    async fn tilt_is_clamped_into_a_multiplier() {
        let (sparkler, _dir) = service(manual_clock());
        let room_id = matched(&sparkler, "a", "b").await;
        let decay = sparkler.report_tilt(&room_id, &pid("a"), 3.0).await.unwrap();
        assert_eq!(decay.value(), 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn rematched_pair_runs_on_a_single_clock() {
        let (sparkler, _dir) = service(EngineConfig::default());
        let room_id = matched(&sparkler, "a", "b").await;
        tokio::time::sleep(Duration::from_millis(1500)).await;

        sparkler.cancel(&pid("a")).await.unwrap();
        assert_eq!(matched(&sparkler, "a", "b").await, room_id);
        let decay = sparkler.report_tilt(&room_id, &pid("b"), 0.0).await.unwrap();
        assert_eq!(decay, DecayMultiplier::NEUTRAL);

        tokio::time::sleep(Duration::from_millis(20_200)).await;

        let snapshot = sparkler.session(&room_id).await.unwrap();
        assert!(snapshot.is_active());
        for timer in &snapshot.timers {
            assert!(
                timer.remaining >= Duration::from_secs(39),
                "burned {:?} in 20s",
                Duration::from_secs(60) - timer.remaining
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn matched_sessions_run_on_the_server_clock() {
        let (sparkler, _dir) = service(EngineConfig::default());
        let room_id = matched(&sparkler, "a", "b").await;
        let mut events = sparkler.dispatcher().subscribe();

        tokio::time::sleep(Duration::from_millis(61_500)).await;

        let snapshot = sparkler.session(&room_id).await.unwrap();
        assert!(!snapshot.is_active());
        let mut ended = false;
        while let Ok(event) = events.try_recv() {
            if let GatewayEvent::SessionEnded(summary) = event {
                assert_eq!(summary.reason, EndReason::TimeUp);
                ended = true;
            }
        }
        assert!(ended);
    }
}
