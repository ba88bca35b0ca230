use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Longest accepted participant identifier, in bytes.
pub const MAX_PARTICIPANT_ID_LEN: usize = 128;

/// Opaque per-device identifier. The server never learns anything else about a participant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Non-empty, bounded, and free of control characters.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_PARTICIPANT_ID_LEN
            && !self.0.chars().any(char::is_control)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic room key for an unordered pair of participants.
    ///
    /// The pair is sorted before hashing, so `for_pair(a, b) == for_pair(b, a)`.
    /// Participant ids cannot contain NUL (control characters are rejected),
    /// which keeps the separator unambiguous.
    pub fn for_pair(a: &ParticipantId, b: &ParticipantId) -> Self {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = Sha256::new();
        hasher.update(first.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(second.as_str().as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(format!("room_{}", &digest[..32]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which end of a room a participant holds. `A` is the lexicographically
/// smaller participant id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    A,
    B,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::A, Side::B];

    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// A participant currently searching for a partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingEntry {
    pub participant_id: ParticipantId,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomState {
    Active,
    Ended,
}

impl RoomState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

/// Shared context of exactly two matched participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    /// Sorted; index 0 is [`Side::A`].
    pub participants: [ParticipantId; 2],
    pub created_at: DateTime<Utc>,
    pub state: RoomState,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Room {
    /// A fresh active room for the pair `{a, b}`.
    pub fn pair(a: &ParticipantId, b: &ParticipantId, created_at: DateTime<Utc>) -> Self {
        let mut participants = [a.clone(), b.clone()];
        participants.sort();
        Self {
            id: RoomId::for_pair(a, b),
            participants,
            created_at,
            state: RoomState::Active,
            ended_at: None,
        }
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.participants.iter().any(|p| p == participant)
    }

    pub fn side_of(&self, participant: &ParticipantId) -> Option<Side> {
        Side::BOTH
            .into_iter()
            .find(|side| &self.participants[side.index()] == participant)
    }

    pub fn participant(&self, side: Side) -> &ParticipantId {
        &self.participants[side.index()]
    }

    pub fn is_active(&self) -> bool {
        self.state == RoomState::Active
    }
}

/// An immutable entry of a room's message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub room_id: RoomId,
    pub sender_id: ParticipantId,
    pub content: String,
    /// Per-room logical clock, starting at 1.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// Wire view of one side's burn timer, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerView {
    pub remaining_ms: u64,
    pub max_ms: u64,
    pub cooldown_ms: u64,
    pub extensions_used: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndReason {
    /// The termination policy fired.
    TimeUp,
    /// A participant left explicitly.
    Exited { by: ParticipantId },
    /// A participant cancelled matchmaking while the room was live.
    Cancelled { by: ParticipantId },
    /// The room outlived the abandoned-room limit.
    Abandoned,
}

/// What remains of a session once it has ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub room_id: RoomId,
    pub reason: EndReason,
    pub duration_secs: u64,
    pub message_count: u64,
    pub extensions_used: [u32; 2],
}
