//! Pairs waiting participants into rooms.
//!
//! `enqueue` looks for someone else in the queue and tries to claim them: one
//! optimistic transaction re-reads the candidate's entry, deletes it and
//! creates the room. Losing that race aborts with no side effects and the
//! loop looks again, with bounded attempts and exponential backoff. With
//! nobody to claim, the participant joins the queue and waits for a
//! `RoomCreated` notification instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_stream::stream;
use futures_util::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sparkler_db::{Change, Database, StoreError};
use sparkler_types::events::RoomCreated;
use sparkler_types::models::{ParticipantId, Room, RoomId};

use crate::clock;
use crate::error::MatchError;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(RoomId),
    /// Queued; a `RoomCreated` notification will follow.
    Pending,
}

/// [`MatchOutcome`] with the room itself, as the claim or lookup produced it.
pub(crate) enum Placement {
    Matched(Room),
    Pending,
}

impl Placement {
    pub(crate) fn outcome(&self) -> MatchOutcome {
        match self {
            Placement::Matched(room) => MatchOutcome::Matched(room.id.clone()),
            Placement::Pending => MatchOutcome::Pending,
        }
    }
}

pub(crate) enum ClaimOutcome {
    Claimed(Room),
    /// The candidate's entry was gone at re-read.
    CandidateGone,
    /// The claimant's own entry was taken by someone else first.
    ClaimantTaken,
}

enum Step {
    Done(Placement),
    Queued,
    Retry(String),
}

/// An in-flight `enqueue` call.
struct Search {
    token: CancellationToken,
    /// Held for the duration of each attempt. `cancel` takes it too, so a
    /// cancel never interleaves with a half-finished attempt.
    gate: tokio::sync::Mutex<()>,
}

pub struct Matchmaker {
    db: Arc<Database>,
    policy: RetryPolicy,
    searches: Mutex<HashMap<ParticipantId, Arc<Search>>>,
    watches: Arc<Mutex<HashMap<ParticipantId, Watch>>>,
}

/// Live match watches of one participant, cancelled together by `cancel`.
struct Watch {
    token: CancellationToken,
    watchers: usize,
}

/// Unregisters one watcher when its stream finishes or is dropped.
struct WatchRegistration {
    watches: Arc<Mutex<HashMap<ParticipantId, Watch>>>,
    participant: ParticipantId,
    parent: CancellationToken,
}

impl Drop for WatchRegistration {
    fn drop(&mut self) {
        // A cancelled parent was already removed, possibly replaced by a newer one
        if self.parent.is_cancelled() {
            return;
        }
        let mut watches = lock(&self.watches);
        if let Some(watch) = watches.get_mut(&self.participant) {
            watch.watchers = watch.watchers.saturating_sub(1);
            if watch.watchers == 0 {
                watches.remove(&self.participant);
            }
        }
    }
}

/// Atomically take `candidate` out of the queue and create the room.
///
/// When the claimant is itself queued its own entry is validated and removed
/// in the same transaction, so nobody can be paired twice.
pub(crate) fn claim(
    db: &Database,
    claimant: &ParticipantId,
    candidate: &ParticipantId,
    claimant_queued: bool,
) -> Result<ClaimOutcome, StoreError> {
    let room = Room::pair(claimant, candidate, clock::now());
    db.run_transaction(|tx| {
        if claimant_queued && tx.get_waiting(claimant)?.is_none() {
            return Ok(ClaimOutcome::ClaimantTaken);
        }
        if tx.get_waiting(candidate)?.is_none() {
            return Ok(ClaimOutcome::CandidateGone);
        }

        tx.delete_waiting(candidate);
        if claimant_queued {
            tx.delete_waiting(claimant);
        }
        tx.put_room(room.clone());
        Ok(ClaimOutcome::Claimed(room))
    })
}

impl Matchmaker {
    pub fn new(db: Arc<Database>, policy: RetryPolicy) -> Self {
        Self {
            db,
            policy,
            searches: Mutex::new(HashMap::new()),
            watches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Claim a waiting partner, or queue up and return `Pending`.
    ///
    /// A participant already in an active room gets that room back.
    pub async fn enqueue(&self, me: &ParticipantId) -> Result<MatchOutcome, MatchError> {
        self.place(me).await.map(|placement| placement.outcome())
    }

    /// [`enqueue`](Self::enqueue), keeping hold of the room.
    pub(crate) async fn place(&self, me: &ParticipantId) -> Result<Placement, MatchError> {
        if !me.is_valid() {
            return Err(MatchError::InvalidParticipant);
        }

        let search = self.begin_search(me)?;
        let result = self.search(me, &search).await;
        self.end_search(me, &search);

        match &result {
            Ok(Placement::Matched(room)) => info!("{} matched into {}", me, room.id),
            Ok(Placement::Pending) => info!("{} queued, waiting for a partner", me),
            Err(e) => warn!("{} enqueue failed: {}", me, e),
        }
        result
    }

    /// Drop `me` from the queue, stop any in-flight search and watch, and end
    /// the active room `me` is in, if any. Returns that room once ended.
    ///
    /// Once this returns, no active room contains `me`: a claim that lost the
    /// race against the queue delete aborts, and one that won is ended here.
    pub async fn cancel(&self, me: &ParticipantId) -> Result<Option<(Room, u64)>, MatchError> {
        let search = lock(&self.searches).get(me).cloned();
        if let Some(search) = &search {
            search.token.cancel();
        }
        if let Some(watch) = lock(&self.watches).remove(me) {
            watch.token.cancel();
        }

        let _gate = match &search {
            Some(search) => Some(search.gate.lock().await),
            None => None,
        };

        let dequeued = self.db.delete_waiting(me)?;
        let ended = match self.db.active_room_for(me)? {
            Some(room) => self.db.end_room(&room.id, clock::now())?,
            None => None,
        };

        info!(
            "{} cancelled (dequeued: {}, ended room: {})",
            me,
            dequeued,
            ended.as_ref().map_or("none", |(room, _)| room.id.as_str())
        );
        Ok(ended)
    }

    /// Fires once with the first room containing `me`, then ends. Also ends,
    /// without an item, when `me` cancels.
    pub fn subscribe_to_match(
        &self,
        me: &ParticipantId,
    ) -> impl Stream<Item = RoomCreated> + Send + use<> {
        // Subscribe before the catch-up read so nothing slips in between
        let mut changes = self.db.changes();
        let registration = self.register_watch(me);
        let token = registration.parent.child_token();
        let db = self.db.clone();
        let me = me.clone();

        stream! {
            let _registration = registration;
            match db.active_room_for(&me) {
                Ok(Some(room)) => {
                    yield RoomCreated::from(&room);
                    return;
                }
                Ok(None) => {}
                Err(e) => warn!("match watch for {}: catch-up read failed: {}", me, e),
            }

            loop {
                let change = tokio::select! {
                    _ = token.cancelled() => break,
                    change = changes.recv() => change,
                };

                match change {
                    Ok(Change::RoomCreated(room)) if room.contains(&me) => {
                        yield RoomCreated::from(&room);
                        break;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!("match watch for {} lagged by {} changes", me, n);
                        if let Ok(Some(room)) = db.active_room_for(&me) {
                            yield RoomCreated::from(&room);
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("match watch for {} finished", me);
        }
    }

    fn register_watch(&self, me: &ParticipantId) -> WatchRegistration {
        let mut watches = lock(&self.watches);
        let watch = watches.entry(me.clone()).or_insert_with(|| Watch {
            token: CancellationToken::new(),
            watchers: 0,
        });
        watch.watchers += 1;
        WatchRegistration {
            watches: self.watches.clone(),
            participant: me.clone(),
            parent: watch.token.clone(),
        }
    }

    fn begin_search(&self, me: &ParticipantId) -> Result<Arc<Search>, MatchError> {
        let mut searches = lock(&self.searches);
        if searches.contains_key(me) {
            return Err(MatchError::AlreadySearching(me.clone()));
        }
        let search = Arc::new(Search {
            token: CancellationToken::new(),
            gate: tokio::sync::Mutex::new(()),
        });
        searches.insert(me.clone(), search.clone());
        Ok(search)
    }

    fn end_search(&self, me: &ParticipantId, search: &Arc<Search>) {
        let mut searches = lock(&self.searches);
        if searches.get(me).is_some_and(|current| Arc::ptr_eq(current, search)) {
            searches.remove(me);
        }
    }

    async fn search(&self, me: &ParticipantId, search: &Search) -> Result<Placement, MatchError> {
        let mut last_error: Option<String> = None;
        let mut queued_once = false;
        let mut attempt = 0;
        let mut backoff = false;

        while attempt < self.policy.max_attempts {
            if backoff {
                tokio::time::sleep(self.policy.delay_for(attempt)).await;
            }

            let step = {
                let _gate = search.gate.lock().await;
                if search.token.is_cancelled() {
                    return Err(MatchError::Cancelled);
                }
                self.attempt(me)
            };

            match step {
                Ok(Step::Done(outcome)) => return Ok(outcome),
                Ok(Step::Queued) if !queued_once => {
                    // Look once more right away: someone may have queued
                    // between our empty lookup and our insert.
                    queued_once = true;
                    backoff = false;
                    continue;
                }
                Ok(Step::Queued) => {
                    last_error = Some("queue entry vanished".into());
                }
                Ok(Step::Retry(reason)) => {
                    debug!("{} claim attempt {} lost: {}", me, attempt + 1, reason);
                    last_error = Some(reason);
                }
                Err(e) => {
                    warn!("{} attempt {} hit a store failure: {}", me, attempt + 1, e);
                    last_error = Some(e.to_string());
                }
            }

            attempt += 1;
            backoff = true;
        }

        Err(MatchError::MatchmakingUnavailable {
            attempts: self.policy.max_attempts,
            last_error: last_error.unwrap_or_else(|| "no attempts allowed".into()),
        })
    }

    fn attempt(&self, me: &ParticipantId) -> Result<Step, StoreError> {
        let queued = self.db.get_waiting(me)?.is_some();
        if !queued {
            if let Some(room) = self.db.active_room_for(me)? {
                return Ok(Step::Done(Placement::Matched(room)));
            }
        }

        let Some(candidate) = self.db.find_other_waiting(me)? else {
            if queued {
                return Ok(Step::Done(Placement::Pending));
            }
            self.db.insert_waiting(me, clock::now())?;
            return Ok(Step::Queued);
        };

        match claim(&self.db, me, &candidate.participant_id, queued) {
            Ok(ClaimOutcome::Claimed(room)) => Ok(Step::Done(Placement::Matched(room))),
            Ok(ClaimOutcome::CandidateGone) => Ok(Step::Retry(format!(
                "{} was claimed by someone else",
                candidate.participant_id
            ))),
            Ok(ClaimOutcome::ClaimantTaken) => Ok(Step::Retry("claimed while claiming".into())),
            Err(e) if e.is_conflict() => Ok(Step::Retry(e.to_string())),
            Err(e) => Err(e),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The maps stay consistent across a panic; every mutation is a single call
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    fn setup() -> (Arc<Database>, Matchmaker, tempfile::TempDir) {
        setup_with(RetryPolicy::default())
    }

    fn setup_with(policy: RetryPolicy) -> (Arc<Database>, Matchmaker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("match.db")).unwrap());
        let mm = Matchmaker::new(db.clone(), policy);
        (db, mm, dir)
    }

    #[tokio::test]
    async fn second_participant_claims_the_first() {
        let (db, mm, _dir) = setup();
        let (a, b) = (pid("alice"), pid("bob"));

        assert_eq!(mm.enqueue(&a).await.unwrap(), MatchOutcome::Pending);
        let mut watch = Box::pin(mm.subscribe_to_match(&a));

        let expected = RoomId::for_pair(&a, &b);
        assert_eq!(mm.enqueue(&b).await.unwrap(), MatchOutcome::Matched(expected.clone()));

        let created = tokio::time::timeout(Duration::from_secs(5), watch.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.room_id, expected);
        // Fires exactly once
        assert!(watch.next().await.is_none());

        assert!(db.get_waiting(&a).unwrap().is_none());
        assert!(db.get_waiting(&b).unwrap().is_none());
    }

    #[tokio::test]
    async fn placement_carries_the_claimed_room() {
        let (_db, mm, _dir) = setup();
        let (a, b) = (pid("alice"), pid("bob"));
        assert!(matches!(mm.place(&a).await.unwrap(), Placement::Pending));

        let Placement::Matched(room) = mm.place(&b).await.unwrap() else {
            panic!("bob should have claimed alice");
        };
        assert_eq!(room.id, RoomId::for_pair(&a, &b));
        assert!(room.is_active());
        assert!(room.contains(&a) && room.contains(&b));

        // Already matched: the active room comes back as is
        let Placement::Matched(again) = mm.place(&a).await.unwrap() else {
            panic!("alice is already in a room");
        };
        assert_eq!(again.id, room.id);
        assert_eq!(again.created_at, room.created_at);
    }

    #[tokio::test]
    async fn room_id_does_not_depend_on_arrival_order() {
        let (_db, mm, _dir) = setup();
        mm.enqueue(&pid("bob")).await.unwrap();
        let outcome = mm.enqueue(&pid("alice")).await.unwrap();
        assert_eq!(
            outcome,
            MatchOutcome::Matched(RoomId::for_pair(&pid("alice"), &pid("bob")))
        );
    }

    #[tokio::test]
    async fn watch_sees_room_created_before_subscribing() {
        let (_db, mm, _dir) = setup();
        mm.enqueue(&pid("a")).await.unwrap();
        mm.enqueue(&pid("b")).await.unwrap();

        let mut watch = Box::pin(mm.subscribe_to_match(&pid("a")));
        let created = watch.next().await.unwrap();
        assert!(created.participants.contains(&pid("b")));
    }

    #[tokio::test]
    async fn watches_unregister_when_done() {
        let (_db, mm, _dir) = setup();
        let first = Box::pin(mm.subscribe_to_match(&pid("a")));
        let mut second = Box::pin(mm.subscribe_to_match(&pid("a")));
        assert_eq!(lock(&mm.watches)[&pid("a")].watchers, 2);

        drop(first);
        assert!(lock(&mm.watches).contains_key(&pid("a")));

        mm.enqueue(&pid("a")).await.unwrap();
        mm.enqueue(&pid("b")).await.unwrap();
        assert!(second.next().await.is_some());
        assert!(second.next().await.is_none());
        assert!(!lock(&mm.watches).contains_key(&pid("a")));
    }

    #[tokio::test]
    async fn re_enqueue_while_pending_stays_pending() {
        let (db, mm, _dir) = setup();
        assert_eq!(mm.enqueue(&pid("a")).await.unwrap(), MatchOutcome::Pending);
        assert_eq!(mm.enqueue(&pid("a")).await.unwrap(), MatchOutcome::Pending);
        assert!(db.get_waiting(&pid("a")).unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_participant_is_rejected() {
        let (_db, mm, _dir) = setup();
        assert!(matches!(
            mm.enqueue(&pid("")).await,
            Err(MatchError::InvalidParticipant)
        ));
    }

    #[tokio::test]
    async fn cancel_leaves_queue_and_ends_watch() {
        let (db, mm, _dir) = setup();
        mm.enqueue(&pid("a")).await.unwrap();
        let mut watch = Box::pin(mm.subscribe_to_match(&pid("a")));

        assert!(mm.cancel(&pid("a")).await.unwrap().is_none());
        assert!(db.get_waiting(&pid("a")).unwrap().is_none());
        assert!(watch.next().await.is_none());

        // Nobody left to claim
        assert_eq!(mm.enqueue(&pid("b")).await.unwrap(), MatchOutcome::Pending);
    }

    #[tokio::test]
    async fn cancel_after_match_ends_the_room() {
        let (db, mm, _dir) = setup();
        mm.enqueue(&pid("a")).await.unwrap();
        mm.enqueue(&pid("b")).await.unwrap();

        let (room, _) = mm.cancel(&pid("a")).await.unwrap().unwrap();
        assert_eq!(room.id, RoomId::for_pair(&pid("a"), &pid("b")));
        assert!(db.active_room_for(&pid("a")).unwrap().is_none());
        assert!(db.active_room_for(&pid("b")).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_racing_a_claim_never_leaves_a_room() {
        let (db, mm, _dir) = setup();
        let mm = Arc::new(mm);

        for round in 0..20 {
            let a = pid(&format!("a{}", round));
            let b = pid(&format!("b{}", round));
            assert_eq!(mm.enqueue(&a).await.unwrap(), MatchOutcome::Pending);

            let claimer = {
                let mm = mm.clone();
                let b = b.clone();
                tokio::spawn(async move { mm.enqueue(&b).await })
            };
            let canceller = {
                let mm = mm.clone();
                let a = a.clone();
                tokio::spawn(async move { mm.cancel(&a).await })
            };

            canceller.await.unwrap().unwrap();
            assert!(
                db.active_room_for(&a).unwrap().is_none(),
                "round {}: room with cancelled participant survived",
                round
            );

            claimer.await.unwrap().unwrap();
            mm.cancel(&b).await.unwrap();
        }
    }

    #[test]
    fn exactly_one_concurrent_claim_wins() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("race.db")).unwrap());
        let target = pid("target");
        db.insert_waiting(&target, clock::now()).unwrap();

        const CLAIMANTS: usize = 8;
        let barrier = Arc::new(Barrier::new(CLAIMANTS));
        let handles: Vec<_> = (0..CLAIMANTS)
            .map(|i| {
                let db = db.clone();
                let barrier = barrier.clone();
                let target = target.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    claim(&db, &pid(&format!("claimant{}", i)), &target, false)
                })
            })
            .collect();

        let mut wins = 0;
        for handle in handles {
            match handle.join().unwrap() {
                Ok(ClaimOutcome::Claimed(room)) => {
                    assert!(room.contains(&target));
                    wins += 1;
                }
                Ok(ClaimOutcome::CandidateGone) => {}
                Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
                Ok(ClaimOutcome::ClaimantTaken) => panic!("claimants were not queued"),
            }
        }

        assert_eq!(wins, 1);
        assert!(db.get_waiting(&target).unwrap().is_none());
        assert!(db.active_room_for(&target).unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_pair_everyone_once() {
        let (db, mm, _dir) = setup_with(RetryPolicy {
            max_attempts: 50,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            jitter: true,
        });
        let mm = Arc::new(mm);

        let participants: Vec<_> = (0..10).map(|i| pid(&format!("p{}", i))).collect();
        let handles: Vec<_> = participants
            .iter()
            .cloned()
            .map(|p| {
                let mm = mm.clone();
                tokio::spawn(async move { mm.enqueue(&p).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Nobody should be both queued and in a room, and rooms are pairs
        let mut in_rooms = 0;
        for p in &participants {
            let queued = db.get_waiting(p).unwrap().is_some();
            let room = db.active_room_for(p).unwrap();
            assert!(!(queued && room.is_some()), "{} is queued and matched", p);
            if let Some(room) = room {
                let partner = room.participants.iter().find(|q| *q != p).unwrap();
                assert_eq!(db.active_room_for(partner).unwrap().unwrap().id, room.id);
                in_rooms += 1;
            }
        }
        assert_eq!(in_rooms % 2, 0);
        assert!(in_rooms >= 8, "only {} of 10 participants matched", in_rooms);
    }

    #[tokio::test]
    async fn persistent_store_failure_surfaces_as_unavailable() {
        let (db, mm, _dir) = setup_with(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        });
        db.with_conn_mut(|conn| {
            conn.execute_batch("DROP TABLE waiting_queue")?;
            Ok(())
        })
        .unwrap();

        match mm.enqueue(&pid("a")).await {
            Err(e @ MatchError::MatchmakingUnavailable { attempts: 3, .. }) => {
                assert_eq!(e.code(), "matchmaking_unavailable");
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
    }
}
