use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Message, ParticipantId, Room, RoomId, SessionSummary, TimerView};

/// Fired once per participant when a room containing them is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCreated {
    pub room_id: RoomId,
    pub participants: [ParticipantId; 2],
    pub created_at: DateTime<Utc>,
}

impl From<&Room> for RoomCreated {
    fn from(room: &Room) -> Self {
        Self {
            room_id: room.id.clone(),
            participants: room.participants.clone(),
            created_at: room.created_at,
        }
    }
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the connection is bound to a participant
    Ready { participant_id: ParticipantId },

    /// A room containing the connected participant was created
    RoomCreated(RoomCreated),

    /// A message was appended to a room log
    MessageCreate(Message),

    /// Both sides' burn timers after a tick or extension
    TimerUpdate {
        room_id: RoomId,
        timers: [TimerView; 2],
    },

    /// The session is over; the room log has been discarded
    SessionEnded(SessionSummary),

    /// A command could not be carried out
    Error { code: String, message: String },
}

impl GatewayEvent {
    /// Returns the room_id if this event is scoped to a specific room.
    /// Events that return `None` are addressed to the connection itself.
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::MessageCreate(message) => Some(&message.room_id),
            Self::TimerUpdate { room_id, .. } => Some(room_id),
            Self::SessionEnded(summary) => Some(&summary.room_id),
            Self::RoomCreated(created) => Some(&created.room_id),
            Self::Ready { .. } | Self::Error { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Bind the connection to a device identifier
    Identify { participant_id: ParticipantId },

    /// Wait for a room containing this participant; fires once
    WatchMatch,

    /// Stream a room's messages and session events.
    /// `after` resumes from a known sequence number.
    Subscribe {
        room_id: RoomId,
        #[serde(default)]
        after: Option<u64>,
    },

    /// Report device tilt in `[0, 1]`; scales the burn rate of the session
    ReportTilt { room_id: RoomId, tilt: f64 },
}
