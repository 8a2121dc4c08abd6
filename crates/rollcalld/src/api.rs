//! HTTP and WebSocket surface of the daemon.
//!
//! | route                                   | purpose                                  |
//! |-----------------------------------------|------------------------------------------|
//! | `GET /`                                 | health                                   |
//! | `POST /capture/start`                   | issue a capture token for a session      |
//! | `GET /capture/session/{token}`          | session bound to a token (mobile client) |
//! | `GET /capture/validate/{token}`         | token validity and remaining lifetime    |
//! | `DELETE /capture/session/{token}`       | close a token                            |
//! | `POST /capture/upload/{token}`          | push a photo to the proctor view         |
//! | `GET /ws/capture/{token}?side=`         | relay channel                            |
//! | `POST /capture/recognize/{token}`       | recognize and mark attendance            |
//! | `POST /attendance/mark`                 | same, with an explicit session           |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rollcall_core::imaging::{decode_payload, encode_payload};
use rollcall_core::types::ContextError;
use rollcall_core::{
    AttendanceOutcome, AttendanceRecorder, ExtractionError, FaceMatchingEngine, RecognitionError,
    SessionContext,
};
use rollcall_pairing::{
    ChannelHandle, IssuedToken, PairingError, RelayHub, RelayMessage, SessionBroker, Side,
    TokenStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;

pub struct AppState {
    pub broker: Arc<SessionBroker>,
    pub relay: Arc<RelayHub>,
    pub engine: Arc<FaceMatchingEngine>,
    pub recorder: Arc<AttendanceRecorder>,
    pub validation_timeout: Duration,
    pub started_at: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/capture/start", post(start_capture))
        .route("/capture/session/{token}", get(session_info).delete(close_session))
        .route("/capture/validate/{token}", get(validate_token))
        .route("/capture/upload/{token}", post(upload_capture))
        .route("/ws/capture/{token}", get(relay_socket))
        .route("/capture/recognize/{token}", post(recognize_capture))
        .route("/attendance/mark", post(mark_attendance))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "request failed");
        } else {
            tracing::debug!(status = %self.status, error = %self.message, "request rejected");
        }
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

impl From<PairingError> for ApiError {
    fn from(err: PairingError) -> Self {
        let status = match err {
            PairingError::InvalidSession(_) => StatusCode::BAD_REQUEST,
            PairingError::TokenInvalid => StatusCode::NOT_FOUND,
            PairingError::ChannelAlreadyBound { .. } => StatusCode::CONFLICT,
            PairingError::ChannelClosed => StatusCode::GONE,
            PairingError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        Self::new(status, err.to_string())
    }
}

impl From<ContextError> for ApiError {
    fn from(err: ContextError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, format!("invalid session: {err}"))
    }
}

impl From<ExtractionError> for ApiError {
    fn from(err: ExtractionError) -> Self {
        let status = match err {
            ExtractionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ExtractionError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, err.to_string())
    }
}

impl From<RecognitionError> for ApiError {
    fn from(err: RecognitionError) -> Self {
        if err.is_timeout() {
            return Self::new(StatusCode::GATEWAY_TIMEOUT, err.to_string());
        }
        match err {
            RecognitionError::Extraction(e) => e.into(),
            RecognitionError::RosterFetch { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Session identifiers arrive as strings or integers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SessionId {
    Text(String),
    Number(i64),
}

impl SessionId {
    fn into_string(self) -> String {
        match self {
            SessionId::Text(s) => s,
            SessionId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionPayload {
    #[serde(alias = "session_id")]
    pub id: SessionId,
    #[serde(default, alias = "name")]
    pub nom_seance: String,
    #[serde(default, alias = "Classe", alias = "class_id")]
    pub classe: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default, alias = "professor")]
    pub prof: Option<String>,
}

impl SessionPayload {
    pub fn into_context(self) -> Result<SessionContext, ContextError> {
        SessionContext::new(
            &self.id.into_string(),
            &self.nom_seance,
            &self.classe,
            self.date.as_deref(),
            self.prof.as_deref(),
        )
    }
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    id: String,
    nom_seance: String,
    classe: String,
    date: Option<String>,
    prof: Option<String>,
}

impl From<SessionContext> for SessionView {
    fn from(ctx: SessionContext) -> Self {
        Self {
            id: ctx.session_id,
            nom_seance: ctx.display_name,
            classe: ctx.class_id,
            date: ctx.date.map(|d| d.format("%Y-%m-%d").to_string()),
            prof: ctx.professor,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartCaptureRequest {
    pub session: SessionPayload,
}

#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    pub image: String,
}

#[derive(Debug, Deserialize)]
pub struct MarkRequest {
    pub image: String,
    pub session: SessionPayload,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    status: &'static str,
    delivered: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    live_tokens: usize,
    uptime_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    pub side: Side,
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: "rollcalld",
        version: env!("CARGO_PKG_VERSION"),
        live_tokens: state.broker.live_tokens().await,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn start_capture(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartCaptureRequest>,
) -> Result<Json<IssuedToken>, ApiError> {
    let session = req.session.into_context()?;
    Ok(Json(state.broker.issue(session)?))
}

async fn session_info(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    Ok(Json(state.broker.resolve(&token).await?.into()))
}

async fn validate_token(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> Result<Json<TokenStatus>, ApiError> {
    let status = state
        .broker
        .validate_within(&token, state.validation_timeout)
        .await?;
    Ok(Json(status))
}

async fn close_session(State(state): State<Arc<AppState>>, Path(token): Path<String>) -> StatusCode {
    state.broker.close(&token).await;
    StatusCode::NO_CONTENT
}

async fn upload_capture(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(req): Json<ImageRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    let bytes = decode_payload(&req.image)?;
    let delivered = state.relay.relay_frame(&token, bytes).await?;
    if !delivered {
        tracing::info!("upload received with no proctor attached");
    }
    Ok(Json(UploadResponse {
        status: "ok",
        delivered,
    }))
}

async fn recognize_capture(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(req): Json<ImageRequest>,
) -> Result<Json<AttendanceOutcome>, ApiError> {
    let status = state
        .broker
        .validate_within(&token, state.validation_timeout)
        .await?;
    if !status.valid {
        return Err(PairingError::TokenInvalid.into());
    }
    let session = state.broker.resolve(&token).await?;
    let outcome = recognize_and_record(&state, &session, &req.image).await?;

    // Unsuccessful captures keep the token so the student can retake.
    if outcome.success {
        if let Err(err) = state.broker.complete(&token).await {
            tracing::debug!(error = %err, "token retired during recognition");
        }
    }
    Ok(Json(outcome))
}

async fn mark_attendance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MarkRequest>,
) -> Result<Json<AttendanceOutcome>, ApiError> {
    let session = req.session.into_context()?;
    Ok(Json(recognize_and_record(&state, &session, &req.image).await?))
}

async fn recognize_and_record(
    state: &AppState,
    session: &SessionContext,
    image: &str,
) -> Result<AttendanceOutcome, ApiError> {
    let bytes = decode_payload(image)?;
    let result = state.engine.recognize(session, &bytes).await?;
    Ok(state.recorder.record(session, &bytes, &result).await)
}

async fn relay_socket(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Query(query): Query<RelayQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    // Bind before upgrading so token and side errors surface as HTTP statuses.
    let handle = state.relay.open(&token, query.side).await?;
    Ok(ws.on_upgrade(move |socket| pump(socket, handle)))
}

// =============================================================================
// Relay socket
// =============================================================================

/// Server-to-client relay message.
#[derive(Debug, Serialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    timestamp: DateTime<Utc>,
}

impl Envelope {
    fn from_relay(message: RelayMessage) -> Self {
        let (kind, image, message) = match message {
            RelayMessage::Opened => ("connected", None, Some("relay channel open".to_string())),
            RelayMessage::Frame(bytes) => ("image_received", Some(encode_payload(&bytes)), None),
            RelayMessage::Error(text) => ("error", None, Some(text)),
            RelayMessage::Closed => ("closed", None, None),
        };
        Self {
            kind,
            image,
            message,
            timestamp: Utc::now(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            kind: "error",
            image: None,
            message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }

    fn to_message(&self) -> Message {
        Message::Text(serde_json::to_string(self).unwrap_or_default().into())
    }
}

/// Client-to-server relay message. Anything else is a heartbeat.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Frame { image: String },
    Error { message: String },
}

impl ClientMessage {
    fn into_relay(self) -> Result<RelayMessage, ExtractionError> {
        match self {
            ClientMessage::Frame { image } => Ok(RelayMessage::Frame(decode_payload(&image)?)),
            ClientMessage::Error { message } => Ok(RelayMessage::Error(message)),
        }
    }
}

async fn pump(mut socket: WebSocket, mut handle: ChannelHandle) {
    let side = handle.side();
    tracing::info!(%side, "relay socket connected");

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Ok(parsed) = serde_json::from_str::<ClientMessage>(text.as_str()) else {
                        continue;
                    };
                    let reply = match parsed.into_relay() {
                        Ok(message) => match handle.send(message).await {
                            Ok(true) => None,
                            Ok(false) => Some(Envelope::error("peer not connected; message dropped")),
                            Err(_) => break,
                        },
                        Err(err) => Some(Envelope::error(err.to_string())),
                    };
                    if let Some(reply) = reply {
                        if socket.send(reply.to_message()).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(%side, error = %err, "relay socket error");
                    break;
                }
            },
            outgoing = handle.recv() => {
                let Some(message) = outgoing else { break };
                let closed = message == RelayMessage::Closed;
                if socket.send(Envelope::from_relay(message).to_message()).await.is_err() {
                    break;
                }
                if closed {
                    break;
                }
            }
        }
    }

    handle.close();
    let _ = socket.send(Message::Close(None)).await;
    tracing::info!(%side, "relay socket disconnected");
}
