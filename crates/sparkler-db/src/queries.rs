use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use sparkler_types::models::{Message, ParticipantId, Room, RoomId, RoomState, WaitingEntry};

use crate::error::Result;
use crate::models::{
    MESSAGE_COLUMNS, MessageRow, ROOM_COLUMNS, RoomRow, WAITING_COLUMNS, WaitingRow,
};
use crate::{Change, Database};

/// Result of appending to a room log.
#[derive(Debug)]
pub enum AppendOutcome {
    Appended(Message),
    RoomMissing,
    RoomEnded,
    NotParticipant,
}

impl Database {
    // -- Waiting queue --

    pub fn get_waiting(&self, participant: &ParticipantId) -> Result<Option<WaitingEntry>> {
        self.with_conn(|conn| query_waiting(conn, participant.as_str()))?
            .map(WaitingRow::into_model)
            .transpose()
    }

    /// Oldest waiting entry that does not belong to `exclude`.
    pub fn find_other_waiting(&self, exclude: &ParticipantId) -> Result<Option<WaitingEntry>> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {WAITING_COLUMNS} FROM waiting_queue
                         WHERE participant_id != ?1
                         ORDER BY enqueued_at ASC, participant_id ASC
                         LIMIT 1"
                    ),
                    [exclude.as_str()],
                    WaitingRow::from_row,
                )
                .optional()?;
            Ok(row)
        })?;
        row.map(WaitingRow::into_model).transpose()
    }

    /// Insert or refresh a waiting entry. A refreshed entry gets a new revision,
    /// so any transaction that read the old one will conflict.
    pub fn insert_waiting(
        &self,
        participant: &ParticipantId,
        enqueued_at: DateTime<Utc>,
    ) -> Result<WaitingEntry> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO waiting_queue (participant_id, enqueued_at, revision)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(participant_id) DO UPDATE
                 SET enqueued_at = excluded.enqueued_at, revision = excluded.revision",
                params![
                    participant.as_str(),
                    enqueued_at.timestamp_millis(),
                    new_revision()
                ],
            )?;
            Ok(())
        })?;

        let entry = WaitingEntry {
            participant_id: participant.clone(),
            enqueued_at,
        };
        self.publish(Change::WaitingAdded(entry.clone()));
        Ok(entry)
    }

    /// Returns true if an entry was removed.
    pub fn delete_waiting(&self, participant: &ParticipantId) -> Result<bool> {
        let removed = self.with_conn_mut(|conn| {
            let n = conn.execute(
                "DELETE FROM waiting_queue WHERE participant_id = ?1",
                [participant.as_str()],
            )?;
            Ok(n > 0)
        })?;

        if removed {
            self.publish(Change::WaitingRemoved(participant.clone()));
        }
        Ok(removed)
    }

    /// Delete every waiting entry enqueued strictly before `cutoff`.
    pub fn delete_waiting_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ParticipantId>> {
        let removed = self.with_conn_mut(|conn| {
            let mut stmt = conn.prepare(
                "DELETE FROM waiting_queue WHERE enqueued_at < ?1 RETURNING participant_id",
            )?;
            let ids = stmt
                .query_map([cutoff.timestamp_millis()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;

        let removed: Vec<ParticipantId> = removed.into_iter().map(ParticipantId::new).collect();
        for id in &removed {
            self.publish(Change::WaitingRemoved(id.clone()));
        }
        Ok(removed)
    }

    // -- Rooms --

    pub fn get_room(&self, id: &RoomId) -> Result<Option<Room>> {
        self.with_conn(|conn| query_room(conn, id.as_str()))?
            .map(RoomRow::into_model)
            .transpose()
    }

    /// Most recent active room containing `participant`.
    pub fn active_room_for(&self, participant: &ParticipantId) -> Result<Option<Room>> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {ROOM_COLUMNS} FROM rooms
                         WHERE state = 'active' AND (participant_a = ?1 OR participant_b = ?1)
                         ORDER BY created_at DESC
                         LIMIT 1"
                    ),
                    [participant.as_str()],
                    RoomRow::from_row,
                )
                .optional()?;
            Ok(row)
        })?;
        row.map(RoomRow::into_model).transpose()
    }

    pub fn active_rooms_created_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Room>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ROOM_COLUMNS} FROM rooms WHERE state = 'active' AND created_at < ?1"
            ))?;
            let rows = stmt
                .query_map([cutoff.timestamp_millis()], RoomRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(RoomRow::into_model).collect()
    }

    /// Mark a room ended and discard its message log.
    ///
    /// Returns the ended room and the number of discarded messages, or `None`
    /// if the room does not exist or had already ended.
    pub fn end_room(&self, id: &RoomId, ended_at: DateTime<Utc>) -> Result<Option<(Room, u64)>> {
        let ended = self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let Some(row) = query_room(&tx, id.as_str())? else {
                return Ok(None);
            };
            if row.state != RoomState::Active.as_str() {
                return Ok(None);
            }

            tx.execute(
                "UPDATE rooms SET state = 'ended', ended_at = ?2, revision = ?3 WHERE id = ?1",
                params![id.as_str(), ended_at.timestamp_millis(), new_revision()],
            )?;
            let discarded = tx.execute("DELETE FROM messages WHERE room_id = ?1", [id.as_str()])?;
            tx.commit()?;

            Ok(Some((row, discarded as u64)))
        })?;

        let Some((row, discarded)) = ended else {
            return Ok(None);
        };
        let mut room = row.into_model()?;
        room.state = RoomState::Ended;
        room.ended_at = Some(ended_at);

        self.publish(Change::RoomEnded(room.id.clone()));
        Ok(Some((room, discarded)))
    }

    /// Delete ended rooms whose `ended_at` is strictly before `cutoff`.
    pub fn delete_ended_rooms_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<RoomId>> {
        let ids = self.with_conn_mut(|conn| {
            let mut stmt = conn.prepare(
                "DELETE FROM rooms WHERE state = 'ended' AND ended_at < ?1 RETURNING id",
            )?;
            let ids = stmt
                .query_map([cutoff.timestamp_millis()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        Ok(ids.into_iter().map(RoomId::new).collect())
    }

    // -- Messages --

    /// Append to a room log, assigning the next sequence number.
    /// Room state and membership are checked in the same write transaction.
    pub fn append_message(
        &self,
        room_id: &RoomId,
        sender: &ParticipantId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<AppendOutcome> {
        let appended = self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let Some(room) = query_room(&tx, room_id.as_str())? else {
                return Ok(AppendOutcome::RoomMissing);
            };
            if room.state != RoomState::Active.as_str() {
                return Ok(AppendOutcome::RoomEnded);
            }
            if room.participant_a != sender.as_str() && room.participant_b != sender.as_str() {
                return Ok(AppendOutcome::NotParticipant);
            }

            let sequence: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE room_id = ?1",
                [room_id.as_str()],
                |row| row.get(0),
            )?;
            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO messages (id, room_id, sender_id, content, sequence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    room_id.as_str(),
                    sender.as_str(),
                    content,
                    sequence,
                    at.timestamp_millis()
                ],
            )?;
            tx.commit()?;

            let message = MessageRow {
                id: id.to_string(),
                room_id: room_id.as_str().to_string(),
                sender_id: sender.as_str().to_string(),
                content: content.to_string(),
                sequence,
                created_at: at.timestamp_millis(),
            }
            .into_model()?;
            Ok(AppendOutcome::Appended(message))
        })?;

        if let AppendOutcome::Appended(message) = &appended {
            self.publish(Change::MessageAppended(message.clone()));
        }
        Ok(appended)
    }

    /// Messages with `sequence > after`, in sequence order.
    pub fn messages_after(&self, room_id: &RoomId, after: u64) -> Result<Vec<Message>> {
        let after = i64::try_from(after).unwrap_or(i64::MAX);
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE room_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC"
            ))?;
            let rows = stmt
                .query_map(params![room_id.as_str(), after], MessageRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(MessageRow::into_model).collect()
    }

    pub fn message_count(&self, room_id: &RoomId) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE room_id = ?1",
                [room_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
    }
}

pub(crate) fn query_waiting(conn: &Connection, participant: &str) -> Result<Option<WaitingRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {WAITING_COLUMNS} FROM waiting_queue WHERE participant_id = ?1"),
            [participant],
            WaitingRow::from_row,
        )
        .optional()?;
    Ok(row)
}

pub(crate) fn query_room(conn: &Connection, id: &str) -> Result<Option<RoomRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?1"),
            [id],
            RoomRow::from_row,
        )
        .optional()?;
    Ok(row)
}

pub(crate) fn new_revision() -> String {
    Uuid::new_v4().to_string()
}
