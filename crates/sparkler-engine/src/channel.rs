//! Per-room message log: append, history and live subscription.

use std::sync::Arc;

use async_stream::stream;
use futures_util::Stream;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use sparkler_db::queries::AppendOutcome;
use sparkler_db::{Change, Database};
use sparkler_types::models::{Message, ParticipantId, RoomId};

use crate::clock;
use crate::error::ChannelError;

pub struct MessageChannel {
    db: Arc<Database>,
    max_len: usize,
}

impl MessageChannel {
    pub fn new(db: Arc<Database>, max_len: usize) -> Self {
        Self { db, max_len }
    }

    /// Store `content` (trimmed) as the next message of `room_id`.
    ///
    /// Failures are returned to the caller and never retried here.
    pub fn append(
        &self,
        room_id: &RoomId,
        sender: &ParticipantId,
        content: &str,
    ) -> Result<Message, ChannelError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChannelError::EmptyMessage);
        }
        if content.chars().count() > self.max_len {
            return Err(ChannelError::TooLong { max: self.max_len });
        }

        match self
            .db
            .append_message(room_id, sender, content, clock::now())?
        {
            AppendOutcome::Appended(message) => {
                debug!(
                    "Message #{} appended to {} by {}",
                    message.sequence, room_id, sender
                );
                Ok(message)
            }
            AppendOutcome::RoomMissing => Err(ChannelError::RoomNotFound(room_id.clone())),
            AppendOutcome::RoomEnded => Err(ChannelError::SessionEnded(room_id.clone())),
            AppendOutcome::NotParticipant => Err(ChannelError::NotParticipant {
                room_id: room_id.clone(),
                participant: sender.clone(),
            }),
        }
    }

    /// The whole stored log in sequence order.
    pub fn history(&self, room_id: &RoomId) -> Result<Vec<Message>, ChannelError> {
        Ok(self.db.messages_after(room_id, 0)?)
    }

    /// Messages with `sequence > after`, backlog first, then live, strictly
    /// in sequence order. Ends when the room ends.
    pub fn subscribe(
        &self,
        room_id: &RoomId,
        after: u64,
    ) -> impl Stream<Item = Message> + Send + use<> {
        // Subscribe before reading the backlog; overlap is dropped by sequence
        let mut changes = self.db.changes();
        let db = self.db.clone();
        let room_id = room_id.clone();

        stream! {
            let mut last = after;

            match db.messages_after(&room_id, last) {
                Ok(backlog) => {
                    for message in backlog {
                        last = message.sequence;
                        yield message;
                    }
                }
                Err(e) => warn!("Backlog read for {} failed: {}", room_id, e),
            }

            match db.get_room(&room_id) {
                Ok(Some(room)) if room.is_active() => {}
                Ok(_) => return,
                Err(e) => {
                    warn!("Room lookup for {} failed: {}", room_id, e);
                    return;
                }
            }

            loop {
                let refill = match changes.recv().await {
                    Ok(Change::MessageAppended(message)) if message.room_id == room_id => {
                        if message.sequence <= last {
                            continue;
                        }
                        if message.sequence == last + 1 {
                            last = message.sequence;
                            yield message;
                            continue;
                        }
                        // Published out of order; the store has the gap
                        true
                    }
                    Ok(Change::RoomEnded(id)) if id == room_id => break,
                    Ok(_) => false,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Subscription to {} lagged by {} changes", room_id, n);
                        true
                    }
                    Err(RecvError::Closed) => break,
                };

                if refill {
                    match db.messages_after(&room_id, last) {
                        Ok(missing) => {
                            for message in missing {
                                last = message.sequence;
                                yield message;
                            }
                        }
                        Err(e) => warn!("Refill for {} failed: {}", room_id, e),
                    }
                }
            }
            debug!("Subscription to {} finished", room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use sparkler_types::models::Room;

    use super::*;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    fn setup() -> (Arc<Database>, MessageChannel, Room, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("channel.db")).unwrap());
        let room = Room::pair(&pid("a"), &pid("b"), clock::now());
        db.run_transaction(|tx| {
            tx.put_room(room.clone());
            Ok(())
        })
        .unwrap();
        let channel = MessageChannel::new(db.clone(), 500);
        (db, channel, room, dir)
    }

    #[test]
    fn append_assigns_consecutive_sequences() {
        let (_db, channel, room, _dir) = setup();
        for (i, text) in ["one", "two", "three"].into_iter().enumerate() {
            let message = channel.append(&room.id, &pid("a"), text).unwrap();
            assert_eq!(message.sequence, i as u64 + 1);
        }
        let history = channel.history(&room.id).unwrap();
        let texts: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn content_is_trimmed_and_validated() {
        let (_db, channel, room, _dir) = setup();
        let message = channel.append(&room.id, &pid("b"), "  hey \n").unwrap();
        assert_eq!(message.content, "hey");

        assert!(matches!(
            channel.append(&room.id, &pid("b"), "   "),
            Err(ChannelError::EmptyMessage)
        ));
        assert!(channel.append(&room.id, &pid("b"), &"é".repeat(500)).is_ok());
        assert!(matches!(
            channel.append(&room.id, &pid("b"), &"x".repeat(501)),
            Err(ChannelError::TooLong { max: 500 })
        ));
    }

    #[test]
    fn append_rejects_outsiders_and_dead_rooms() {
        let (db, channel, room, _dir) = setup();
        assert!(matches!(
            channel.append(&room.id, &pid("eve"), "hi"),
            Err(ChannelError::NotParticipant { .. })
        ));
        assert!(matches!(
            channel.append(&RoomId::new("room_nope"), &pid("a"), "hi"),
            Err(ChannelError::RoomNotFound(_))
        ));

        db.end_room(&room.id, clock::now()).unwrap();
        let err = channel.append(&room.id, &pid("a"), "hi").unwrap_err();
        assert_eq!(err.code(), "session_ended");
    }

    #[tokio::test]
    async fn subscribe_replays_backlog_then_follows_live() {
        let (db, channel, room, _dir) = setup();
        channel.append(&room.id, &pid("a"), "first").unwrap();
        channel.append(&room.id, &pid("b"), "second").unwrap();

        let mut stream = Box::pin(channel.subscribe(&room.id, 0));
        channel.append(&room.id, &pid("a"), "third").unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .unwrap();
            seen.push(message.sequence);
        }
        assert_eq!(seen, vec![1, 2, 3]);

        db.end_room(&room.id, clock::now()).unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn subscribe_resumes_after_a_known_sequence() {
        let (_db, channel, room, _dir) = setup();
        for text in ["1", "2", "3"] {
            channel.append(&room.id, &pid("a"), text).unwrap();
        }
        let mut stream = Box::pin(channel.subscribe(&room.id, 2));
        assert_eq!(stream.next().await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn subscribe_to_an_ended_room_yields_nothing() {
        let (db, channel, room, _dir) = setup();
        db.end_room(&room.id, clock::now()).unwrap();
        let mut stream = Box::pin(channel.subscribe(&room.id, 0));
        assert!(stream.next().await.is_none());
    }
}
