use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::config::{AppConfig, DashboardAuthMode, PublicConfig};
use crate::database::{ChatMessage, Contact, ConversationStore};
use crate::error::StorageFault;
use crate::orchestrator::{BotEvent, ManualSender};
use crate::style::StyleProfile;

#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<ConversationStore>,
    pub style: Arc<StyleProfile>,
    pub config: PublicConfig,
    pub auth: DashboardAuth,
    pub manual: Option<ManualSender>,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Clone)]
pub struct DashboardAuth {
    mode: DashboardAuthMode,
    username: String,
    password: Option<String>,
}

impl DashboardAuth {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            mode: config.dashboard_auth_mode,
            username: config.dashboard_username.clone(),
            password: config
                .dashboard_password
                .as_ref()
                .filter(|p| !p.is_empty())
                .cloned(),
        }
    }
}

/// Everything the dashboard needs from the rest of the process.
pub struct Dashboard {
    pub store: Arc<ConversationStore>,
    pub style: Arc<StyleProfile>,
    pub config: AppConfig,
    /// Present only when the bot loop runs in the same process.
    pub manual: Option<ManualSender>,
    pub events: Option<flume::Receiver<BotEvent>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: String,
    pub emitted_at: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    bot_attached: bool,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    contact: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddExampleRequest {
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct ManualSendRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct ManualSendResponse {
    sent: bool,
}

pub async fn serve_dashboard(
    dashboard: Dashboard,
    bind_addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let auth = DashboardAuth::from_config(&dashboard.config);
    if auth.mode == DashboardAuthMode::Disabled {
        tracing::warn!("Dashboard auth mode is disabled; all API routes are unauthenticated");
    }

    let (ws_events, _) = broadcast::channel(512);
    if let Some(event_rx) = dashboard.events {
        spawn_event_bridge(event_rx, ws_events.clone());
    }

    let state = Arc::new(ServerState {
        store: dashboard.store,
        style: dashboard.style,
        config: dashboard.config.public_view(),
        auth,
        manual: dashboard.manual,
        ws_events,
        shutdown: shutdown.clone(),
    });

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind dashboard to {}", bind_addr))?;
    tracing::info!("Dashboard listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("Dashboard server failed")?;
    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/config", get(get_config))
        .route("/contacts", get(list_contacts))
        .route("/conversations", get(list_conversations))
        .route("/conversations/:contact", get(get_conversation))
        .route("/conversations/:contact/send", post(manual_send))
        .route("/style", get(get_style).post(update_style))
        .route("/style/examples", post(add_example))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new().nest("/api", protected)
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<BotEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let _ = ws_events.send(map_bot_event(event));
        }
    });
}

fn map_bot_event(event: BotEvent) -> ApiEventEnvelope {
    match event {
        BotEvent::MessageRecorded {
            contact,
            message_id,
            direction,
            origin,
        } => envelope(
            "message_recorded",
            serde_json::json!({
                "contact": contact,
                "message_id": message_id,
                "direction": direction,
                "origin": origin
            }),
        ),
        BotEvent::ReplySent {
            contact,
            message_id,
        } => envelope(
            "reply_sent",
            serde_json::json!({ "contact": contact, "message_id": message_id }),
        ),
        BotEvent::ReplyDiscarded { contact, reason } => envelope(
            "reply_discarded",
            serde_json::json!({ "contact": contact, "reason": reason }),
        ),
        BotEvent::ContactFailed { contact, error } => envelope(
            "contact_failed",
            serde_json::json!({ "contact": contact, "error": error }),
        ),
        BotEvent::TickFailed { error } => {
            envelope("tick_failed", serde_json::json!({ "error": error }))
        }
    }
}

fn envelope(event_type: &str, payload: Value) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event_type.to_string(),
        emitted_at: Utc::now(),
        payload,
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    match authorize(&headers, &state.auth) {
        Ok(()) => next.run(request).await,
        Err(status) => (
            status,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"digi.Me\"")],
        )
            .into_response(),
    }
}

fn authorize(headers: &HeaderMap, auth: &DashboardAuth) -> Result<(), StatusCode> {
    if auth.mode == DashboardAuthMode::Disabled {
        return Ok(());
    }

    let Some(password) = auth.password.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Some((username, supplied)) = parse_basic_credentials(auth_value) else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    if username != auth.username || supplied != password {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

fn parse_basic_credentials(value: &str) -> Option<(String, String)> {
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        bot_attached: state.manual.is_some(),
    })
}

async fn get_config(State(state): State<Arc<ServerState>>) -> Json<PublicConfig> {
    Json(state.config.clone())
}

async fn list_contacts(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<Contact>>, (StatusCode, String)> {
    state.store.list_contacts().map(Json).map_err(storage_error)
}

async fn list_conversations(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<BTreeMap<String, Vec<ChatMessage>>>, (StatusCode, String)> {
    let limit = clamp_limit(query.limit, 50, 1, 500);
    state
        .store
        .all_conversations(limit)
        .map(Json)
        .map_err(storage_error)
}

async fn get_conversation(
    State(state): State<Arc<ServerState>>,
    Path(contact): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ChatMessage>>, (StatusCode, String)> {
    let limit = clamp_limit(query.limit, 100, 1, 1000);
    state
        .store
        .recent(&contact, limit)
        .map(Json)
        .map_err(storage_error)
}

async fn manual_send(
    State(state): State<Arc<ServerState>>,
    Path(contact): Path<String>,
    Json(body): Json<ManualSendRequest>,
) -> Result<Json<ManualSendResponse>, (StatusCode, String)> {
    let Some(sender) = state.manual.as_ref() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "bot is not running in this process".to_string(),
        ));
    };
    if body.text.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "text cannot be empty".to_string()));
    }
    let sent = sender.send(&contact, &body.text).await;
    Ok(Json(ManualSendResponse { sent }))
}

async fn get_style(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state.style.document().map(Json).map_err(internal_error)
}

async fn update_style(
    State(state): State<Arc<ServerState>>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if !patch.is_object() {
        return Err((
            StatusCode::BAD_REQUEST,
            "style update must be a JSON object".to_string(),
        ));
    }
    state.style.apply_update(&patch).map_err(internal_error)?;
    tracing::info!("Chat style updated from dashboard");
    state.style.document().map(Json).map_err(internal_error)
}

async fn add_example(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<AddExampleRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let prompt = body.prompt.trim();
    let response = body.response.trim();
    if prompt.is_empty() || response.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "both prompt and response are required".to_string(),
        ));
    }
    state
        .style
        .add_example(prompt, response)
        .map_err(internal_error)?;
    Ok(StatusCode::CREATED)
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket, query.contact))
}

/// Streams loop events to one dashboard client, narrowed to `contact` when
/// given. The client gets a 1001 close frame when the dashboard stops.
async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket, contact: Option<String>) {
    let mut rx = state.ws_events.subscribe();
    let mut shutdown = state.shutdown.clone();
    let mut stopping = *shutdown.borrow();

    while !stopping {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !event_matches(&event, contact.as_deref()) {
                            continue;
                        }
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize {} event: {}", event.event_type, error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Dashboard client fell behind; {} event(s) skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => stopping = true,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    _ => {}
                }
            }
            changed = shutdown.changed() => {
                stopping = changed.is_err() || *shutdown.borrow();
            }
        }
    }

    let close = CloseFrame {
        code: close_code::AWAY,
        reason: "dashboard shutting down".into(),
    };
    if socket.send(Message::Close(Some(close))).await.is_err() {
        tracing::debug!("Dashboard client left before the close frame");
    }
}

/// Events without a contact (tick-wide failures) reach every client.
fn event_matches(event: &ApiEventEnvelope, contact: Option<&str>) -> bool {
    let Some(wanted) = contact else {
        return true;
    };
    match event.payload.get("contact").and_then(Value::as_str) {
        Some(event_contact) => event_contact == wanted,
        None => true,
    }
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn storage_error(error: StorageFault) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", error))
}
