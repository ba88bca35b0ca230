use thiserror::Error;

use sparkler_db::StoreError;
use sparkler_types::models::{ParticipantId, RoomId};

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("invalid participant id")]
    InvalidParticipant,

    #[error("{0} already has a search in flight")]
    AlreadySearching(ParticipantId),

    #[error("search cancelled")]
    Cancelled,

    /// The retry budget ran out. This is the "gave up" signal; transient
    /// failures before it are only logged.
    #[error("matchmaking unavailable after {attempts} attempts: {last_error}")]
    MatchmakingUnavailable { attempts: u32, last_error: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl MatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParticipant => "invalid_participant",
            Self::AlreadySearching(_) => "already_searching",
            Self::Cancelled => "cancelled",
            Self::MatchmakingUnavailable { .. } => "matchmaking_unavailable",
            Self::Store(_) => "store_unavailable",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session for room {0}")]
    NotFound(RoomId),

    #[error("session {0} has ended")]
    SessionEnded(RoomId),

    #[error("{participant} is not part of room {room_id}")]
    NotParticipant {
        room_id: RoomId,
        participant: ParticipantId,
    },

    #[error("decay multiplier must be finite and within [0, {max}], got {value}")]
    InvalidDecay { value: f64, max: f64 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "session_not_found",
            Self::SessionEnded(_) => "session_ended",
            Self::NotParticipant { .. } => "not_participant",
            Self::InvalidDecay { .. } => "invalid_decay",
            Self::Store(_) => "store_unavailable",
        }
    }
}

/// Send failures are surfaced as-is and never retried here; resubmitting is
/// the caller's call, since a blind retry could duplicate a message.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("session {0} has ended")]
    SessionEnded(RoomId),

    #[error("{participant} is not part of room {room_id}")]
    NotParticipant {
        room_id: RoomId,
        participant: ParticipantId,
    },

    #[error("message is empty")]
    EmptyMessage,

    #[error("message exceeds {max} characters")]
    TooLong { max: usize },

    #[error("{0} has no burn time left")]
    BurnedOut(ParticipantId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl ChannelError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "room_not_found",
            Self::SessionEnded(_) => "session_ended",
            Self::NotParticipant { .. } => "not_participant",
            Self::EmptyMessage => "empty_message",
            Self::TooLong { .. } => "message_too_long",
            Self::BurnedOut(_) => "burned_out",
            Self::Store(_) => "store_unavailable",
        }
    }
}
