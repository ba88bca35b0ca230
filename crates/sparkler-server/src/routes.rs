use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use tracing::error;

use sparkler_db::StoreError;
use sparkler_engine::timer::ExtensionResult;
use sparkler_engine::{ChannelError, MatchError, MatchOutcome, SessionError, Sparkler};
use sparkler_types::api::{
    EnqueueRequest, EnqueueResponse, ErrorBody, ExtendResponse, MessagesQuery, MessagesResponse,
    ParticipantRequest, SendMessageRequest, SessionResponse,
};
use sparkler_types::models::{Message, ParticipantId, RoomId, SessionSummary};

pub fn api_router() -> Router<Sparkler> {
    Router::new()
        .route("/health", get(health))
        .route("/queue", post(enqueue))
        .route("/queue/{participant_id}", delete(cancel))
        .route("/rooms/{room_id}/messages", get(get_messages).post(send_message))
        .route("/sessions/{room_id}", get(get_session))
        .route("/sessions/{room_id}/extend", post(extend))
        .route("/sessions/{room_id}/end", post(end_session))
}

/// An engine error rendered as `{ "code", "message" }` with a status.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl ToString) -> Self {
        Self {
            status,
            code,
            message: message.to_string(),
        }
    }

    fn store(code: &'static str, e: &StoreError) -> Self {
        error!("Store failure: {}", e);
        let status = if e.is_transient() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self::new(status, code, "storage failure")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<MatchError> for ApiError {
    fn from(e: MatchError) -> Self {
        let status = match &e {
            MatchError::InvalidParticipant => StatusCode::BAD_REQUEST,
            MatchError::AlreadySearching(_) | MatchError::Cancelled => StatusCode::CONFLICT,
            MatchError::MatchmakingUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            MatchError::Store(store) => return Self::store(e.code(), store),
        };
        Self::new(status, e.code(), &e)
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let status = match &e {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::SessionEnded(_) => StatusCode::GONE,
            SessionError::NotParticipant { .. } => StatusCode::FORBIDDEN,
            SessionError::InvalidDecay { .. } => StatusCode::BAD_REQUEST,
            SessionError::Store(store) => return Self::store(e.code(), store),
        };
        Self::new(status, e.code(), &e)
    }
}

impl From<ChannelError> for ApiError {
    fn from(e: ChannelError) -> Self {
        let status = match &e {
            ChannelError::RoomNotFound(_) => StatusCode::NOT_FOUND,
            ChannelError::SessionEnded(_) => StatusCode::GONE,
            ChannelError::NotParticipant { .. } => StatusCode::FORBIDDEN,
            ChannelError::EmptyMessage => StatusCode::BAD_REQUEST,
            ChannelError::TooLong { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ChannelError::BurnedOut(_) => StatusCode::CONFLICT,
            ChannelError::Store(store) => return Self::store(e.code(), store),
        };
        Self::new(status, e.code(), &e)
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn enqueue(
    State(sparkler): State<Sparkler>,
    Json(req): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let response = match sparkler.enqueue(&req.participant_id).await? {
        MatchOutcome::Matched(room_id) => EnqueueResponse::Matched { room_id },
        MatchOutcome::Pending => EnqueueResponse::Pending,
    };
    Ok(Json(response))
}

async fn cancel(
    State(sparkler): State<Sparkler>,
    Path(participant_id): Path<ParticipantId>,
) -> Result<StatusCode, ApiError> {
    sparkler.cancel(&participant_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn send_message(
    State(sparkler): State<Sparkler>,
    Path(room_id): Path<RoomId>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let message = sparkler
        .send_message(&room_id, &req.sender_id, &req.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn get_messages(
    State(sparkler): State<Sparkler>,
    Path(room_id): Path<RoomId>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let messages = sparkler.visible_messages(&room_id, &query.participant_id)?;
    Ok(Json(MessagesResponse { room_id, messages }))
}

async fn get_session(
    State(sparkler): State<Sparkler>,
    Path(room_id): Path<RoomId>,
) -> Result<Json<SessionResponse>, ApiError> {
    let snapshot = sparkler.session(&room_id).await?;
    Ok(Json(SessionResponse {
        active: snapshot.is_active(),
        timers: [snapshot.timers[0].view(), snapshot.timers[1].view()],
        room_id: snapshot.room_id,
        participants: snapshot.participants,
    }))
}

async fn extend(
    State(sparkler): State<Sparkler>,
    Path(room_id): Path<RoomId>,
    Json(req): Json<ParticipantRequest>,
) -> Result<Json<ExtendResponse>, ApiError> {
    let (side, result) = sparkler
        .request_extension_for(&room_id, &req.participant_id)
        .await?;

    let response = match result {
        ExtensionResult::Granted { added, state } => ExtendResponse::Ok {
            side,
            added_ms: u64::try_from(added.as_millis()).unwrap_or(u64::MAX),
            timer: state.view(),
        },
        ExtensionResult::OnCooldown { cooldown } => ExtendResponse::OnCooldown {
            side,
            cooldown_ms: u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
        },
        ExtensionResult::AtCapacity => ExtendResponse::AtCapacity { side },
        ExtensionResult::LimitReached => ExtendResponse::LimitReached { side },
    };
    Ok(Json(response))
}

async fn end_session(
    State(sparkler): State<Sparkler>,
    Path(room_id): Path<RoomId>,
    Json(req): Json<ParticipantRequest>,
) -> Result<Json<SessionSummary>, ApiError> {
    let summary = sparkler.end_session(&room_id, &req.participant_id).await?;
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use sparkler_db::Database;
    use sparkler_engine::EngineConfig;

    use super::*;

    fn app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("routes.db")).unwrap();
        let sparkler = Sparkler::new(
            db,
            EngineConfig {
                clock_period: None,
                ..EngineConfig::default()
            },
        );
        (api_router().with_state(sparkler), dir)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn matched_room(app: &Router) -> String {
        let (_, body) = call(app, Method::POST, "/queue", Some(json!({"participant_id": "a"}))).await;
        assert_eq!(body["status"], "pending");
        let (_, body) = call(app, Method::POST, "/queue", Some(json!({"participant_id": "b"}))).await;
        assert_eq!(body["status"], "matched");
        body["room_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_check() {
        let (app, _dir) = app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn queue_then_chat_over_http() {
        let (app, _dir) = app();
        let room = matched_room(&app).await;

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/rooms/{}/messages", room),
            Some(json!({"sender_id": "a", "content": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["sequence"], 1);

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/rooms/{}/messages?participant_id=b", room),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"][0]["content"], "hello");

        let (status, body) = call(&app, Method::GET, &format!("/sessions/{}", room), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], true);
        assert_eq!(body["timers"][0]["remaining_ms"], 60_000);
    }

    #[tokio::test]
    async fn extension_outcomes_are_not_errors() {
        let (app, _dir) = app();
        let room = matched_room(&app).await;
        let uri = format!("/sessions/{}/extend", room);

        let (status, body) = call(&app, Method::POST, &uri, Some(json!({"participant_id": "a"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "ok");
        assert_eq!(body["added_ms"], 30_000);

        let (status, body) = call(&app, Method::POST, &uri, Some(json!({"participant_id": "a"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "on_cooldown");
    }

    #[tokio::test]
    async fn ended_sessions_answer_gone() {
        let (app, _dir) = app();
        let room = matched_room(&app).await;

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/sessions/{}/end", room),
            Some(json!({"participant_id": "b"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["reason"]["kind"], "exited");

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/rooms/{}/messages", room),
            Some(json!({"sender_id": "a", "content": "still there?"})),
        )
        .await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["code"], "session_ended");
    }

    #[tokio::test]
    async fn cancel_and_bad_input() {
        let (app, _dir) = app();
        call(&app, Method::POST, "/queue", Some(json!({"participant_id": "solo"}))).await;
        let (status, _) = call(&app, Method::DELETE, "/queue/solo", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&app, Method::POST, "/queue", Some(json!({"participant_id": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_participant");

        let (status, body) = call(&app, Method::GET, "/sessions/room_unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "session_not_found");
    }
}
