use serde::{Deserialize, Serialize};

use crate::models::{Message, ParticipantId, RoomId, Side, TimerView};

// -- Matchmaking --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnqueueRequest {
    pub participant_id: ParticipantId,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum EnqueueResponse {
    Matched { room_id: RoomId },
    Pending,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub sender_id: ParticipantId,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub participant_id: ParticipantId,
}

#[derive(Debug, Serialize)]
pub struct MessagesResponse {
    pub room_id: RoomId,
    pub messages: Vec<Message>,
}

// -- Sessions --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParticipantRequest {
    pub participant_id: ParticipantId,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub room_id: RoomId,
    pub participants: [ParticipantId; 2],
    pub active: bool,
    pub timers: [TimerView; 2],
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ExtendResponse {
    Ok { side: Side, added_ms: u64, timer: TimerView },
    OnCooldown { side: Side, cooldown_ms: u64 },
    AtCapacity { side: Side },
    LimitReached { side: Side },
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
