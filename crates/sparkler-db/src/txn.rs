//! Optimistic transactions.
//!
//! Reads go through the reader pool and record the revision they saw.
//! Writes are buffered. At commit the writer connection re-reads every
//! recorded revision inside one SQLite transaction; any difference aborts
//! the whole transaction with [`StoreError::Conflict`] and nothing is
//! written. The writer lock is only held for the validate-and-apply step.

use std::fmt;

use rusqlite::params;

use sparkler_types::models::{ParticipantId, Room, RoomId, WaitingEntry};

use crate::error::{Result, StoreError};
use crate::models::{RoomRow, WaitingRow};
use crate::queries::{new_revision, query_room, query_waiting};
use crate::{Change, Database};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Key {
    Waiting(ParticipantId),
    Room(RoomId),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting(id) => write!(f, "waiting_queue/{}", id),
            Self::Room(id) => write!(f, "rooms/{}", id),
        }
    }
}

struct ReadRecord {
    key: Key,
    /// `None` records that the key was absent.
    revision: Option<String>,
}

enum Write {
    DeleteWaiting(ParticipantId),
    PutRoom(Room),
}

pub struct Transaction<'db> {
    db: &'db Database,
    reads: Vec<ReadRecord>,
    writes: Vec<Write>,
}

impl<'db> Transaction<'db> {
    fn new(db: &'db Database) -> Self {
        Self {
            db,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    pub fn get_waiting(&mut self, participant: &ParticipantId) -> Result<Option<WaitingEntry>> {
        let row = self
            .db
            .with_conn(|conn| query_waiting(conn, participant.as_str()))?;
        self.record(
            Key::Waiting(participant.clone()),
            row.as_ref().map(|r| r.revision.clone()),
        );
        row.map(WaitingRow::into_model).transpose()
    }

    pub fn get_room(&mut self, id: &RoomId) -> Result<Option<Room>> {
        let row = self.db.with_conn(|conn| query_room(conn, id.as_str()))?;
        self.record(Key::Room(id.clone()), row.as_ref().map(|r| r.revision.clone()));
        row.map(RoomRow::into_model).transpose()
    }

    pub fn delete_waiting(&mut self, participant: &ParticipantId) {
        self.writes.push(Write::DeleteWaiting(participant.clone()));
    }

    /// Create the room, replacing an earlier incarnation with the same id and
    /// dropping whatever log it left behind.
    pub fn put_room(&mut self, room: Room) {
        self.writes.push(Write::PutRoom(room));
    }

    fn record(&mut self, key: Key, revision: Option<String>) {
        // The first observation is the one the caller's decisions were based on
        if !self.reads.iter().any(|r| r.key == key) {
            self.reads.push(ReadRecord { key, revision });
        }
    }

    fn commit(self) -> Result<Vec<Change>> {
        let Transaction { db, reads, writes } = self;
        if reads.is_empty() && writes.is_empty() {
            return Ok(Vec::new());
        }

        db.with_conn_mut(move |conn| {
            let tx = conn.unchecked_transaction()?;

            for read in &reads {
                let current = match &read.key {
                    Key::Waiting(id) => query_waiting(&tx, id.as_str())?.map(|r| r.revision),
                    Key::Room(id) => query_room(&tx, id.as_str())?.map(|r| r.revision),
                };
                if current != read.revision {
                    return Err(StoreError::Conflict(read.key.to_string()));
                }
            }

            let mut changes = Vec::with_capacity(writes.len());
            for write in writes {
                match write {
                    Write::DeleteWaiting(id) => {
                        let n = tx.execute(
                            "DELETE FROM waiting_queue WHERE participant_id = ?1",
                            [id.as_str()],
                        )?;
                        if n > 0 {
                            changes.push(Change::WaitingRemoved(id));
                        }
                    }
                    Write::PutRoom(room) => {
                        tx.execute("DELETE FROM messages WHERE room_id = ?1", [room.id.as_str()])?;
                        tx.execute(
                            "INSERT INTO rooms
                                (id, participant_a, participant_b, created_at, state, ended_at, revision)
                             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)
                             ON CONFLICT(id) DO UPDATE SET
                                participant_a = excluded.participant_a,
                                participant_b = excluded.participant_b,
                                created_at = excluded.created_at,
                                state = excluded.state,
                                ended_at = NULL,
                                revision = excluded.revision",
                            params![
                                room.id.as_str(),
                                room.participants[0].as_str(),
                                room.participants[1].as_str(),
                                room.created_at.timestamp_millis(),
                                room.state.as_str(),
                                new_revision()
                            ],
                        )?;
                        changes.push(Change::RoomCreated(room));
                    }
                }
            }

            tx.commit()?;
            Ok(changes)
        })
    }
}

impl Database {
    /// Run `f` as one optimistic transaction.
    ///
    /// If `f` returns an error nothing is written. If a value `f` read has
    /// changed by commit time the transaction aborts with
    /// [`StoreError::Conflict`]; retrying is the caller's decision.
    pub fn run_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut tx = Transaction::new(self);
        let value = f(&mut tx)?;
        for change in tx.commit()? {
            self.publish(change);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::testing::open_temp;

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::new(s)
    }

    #[test]
    fn commit_applies_buffered_writes() {
        let (db, _dir) = open_temp();
        db.insert_waiting(&pid("b"), Utc::now()).unwrap();
        let room = Room::pair(&pid("a"), &pid("b"), Utc::now());

        db.run_transaction(|tx| {
            assert!(tx.get_waiting(&pid("b"))?.is_some());
            tx.delete_waiting(&pid("b"));
            tx.put_room(room.clone());
            Ok(())
        })
        .unwrap();

        assert!(db.get_waiting(&pid("b")).unwrap().is_none());
        assert!(db.get_room(&room.id).unwrap().unwrap().is_active());
    }

    #[test]
    fn concurrent_delete_aborts_commit_without_side_effects() {
        let (db, _dir) = open_temp();
        db.insert_waiting(&pid("b"), Utc::now()).unwrap();
        let room = Room::pair(&pid("a"), &pid("b"), Utc::now());

        let result = db.run_transaction(|tx| {
            tx.get_waiting(&pid("b"))?;
            // Someone else removes the entry between our read and our commit
            db.delete_waiting(&pid("b"))?;
            tx.delete_waiting(&pid("b"));
            tx.put_room(room.clone());
            Ok(())
        });

        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(db.get_room(&room.id).unwrap().is_none());
    }

    #[test]
    fn refreshed_entry_counts_as_a_change() {
        let (db, _dir) = open_temp();
        db.insert_waiting(&pid("b"), Utc::now()).unwrap();

        let result = db.run_transaction(|tx| {
            tx.get_waiting(&pid("b"))?;
            db.insert_waiting(&pid("b"), Utc::now())?;
            tx.delete_waiting(&pid("b"));
            Ok(())
        });

        assert!(result.unwrap_err().is_conflict());
        assert!(db.get_waiting(&pid("b")).unwrap().is_some());
    }

    #[test]
    fn absent_read_conflicts_when_key_appears() {
        let (db, _dir) = open_temp();
        let result = db.run_transaction(|tx| {
            assert!(tx.get_waiting(&pid("late"))?.is_none());
            db.insert_waiting(&pid("late"), Utc::now())?;
            Ok(())
        });
        assert!(result.unwrap_err().is_transient());
    }

    #[test]
    fn put_room_reopens_an_ended_room() {
        let (db, _dir) = open_temp();
        let room = Room::pair(&pid("a"), &pid("b"), Utc::now());
        db.run_transaction(|tx| {
            tx.put_room(room.clone());
            Ok(())
        })
        .unwrap();
        db.end_room(&room.id, Utc::now()).unwrap();

        db.run_transaction(|tx| {
            tx.put_room(Room::pair(&pid("b"), &pid("a"), Utc::now()));
            Ok(())
        })
        .unwrap();

        let reopened = db.get_room(&room.id).unwrap().unwrap();
        assert!(reopened.is_active());
        assert!(reopened.ended_at.is_none());
    }
}
