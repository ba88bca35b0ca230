//! Database row types. These map directly to SQLite rows and stay
//! separate from the sparkler-types models the rest of the system uses.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use uuid::Uuid;

use sparkler_types::models::{Message, ParticipantId, Room, RoomId, RoomState, WaitingEntry};

use crate::error::{Result, StoreError};

pub struct WaitingRow {
    pub participant_id: String,
    pub enqueued_at: i64,
    pub revision: String,
}

pub struct RoomRow {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub created_at: i64,
    pub state: String,
    pub ended_at: Option<i64>,
    pub revision: String,
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    pub sequence: i64,
    pub created_at: i64,
}

pub(crate) const WAITING_COLUMNS: &str = "participant_id, enqueued_at, revision";
pub(crate) const ROOM_COLUMNS: &str =
    "id, participant_a, participant_b, created_at, state, ended_at, revision";
pub(crate) const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, content, sequence, created_at";

impl WaitingRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            participant_id: row.get(0)?,
            enqueued_at: row.get(1)?,
            revision: row.get(2)?,
        })
    }

    pub fn into_model(self) -> Result<WaitingEntry> {
        Ok(WaitingEntry {
            enqueued_at: from_millis(self.enqueued_at, &self.participant_id)?,
            participant_id: ParticipantId::new(self.participant_id),
        })
    }
}

impl RoomRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            participant_a: row.get(1)?,
            participant_b: row.get(2)?,
            created_at: row.get(3)?,
            state: row.get(4)?,
            ended_at: row.get(5)?,
            revision: row.get(6)?,
        })
    }

    pub fn into_model(self) -> Result<Room> {
        let state = RoomState::parse(&self.state)
            .ok_or_else(|| StoreError::Corrupt(format!("room {} has state '{}'", self.id, self.state)))?;
        let ended_at = self
            .ended_at
            .map(|ms| from_millis(ms, &self.id))
            .transpose()?;
        Ok(Room {
            created_at: from_millis(self.created_at, &self.id)?,
            id: RoomId::new(self.id),
            participants: [
                ParticipantId::new(self.participant_a),
                ParticipantId::new(self.participant_b),
            ],
            state,
            ended_at,
        })
    }
}

impl MessageRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            room_id: row.get(1)?,
            sender_id: row.get(2)?,
            content: row.get(3)?,
            sequence: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    pub fn into_model(self) -> Result<Message> {
        let id = self
            .id
            .parse::<Uuid>()
            .map_err(|e| StoreError::Corrupt(format!("message id '{}': {}", self.id, e)))?;
        let sequence = u64::try_from(self.sequence)
            .map_err(|_| StoreError::Corrupt(format!("message {} has sequence {}", self.id, self.sequence)))?;
        Ok(Message {
            timestamp: from_millis(self.created_at, &self.id)?,
            id,
            room_id: RoomId::new(self.room_id),
            sender_id: ParticipantId::new(self.sender_id),
            content: self.content,
            sequence,
        })
    }
}

fn from_millis(ms: i64, owner: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {} on '{}'", ms, owner)))
}
