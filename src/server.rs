//! HTTP and WebSocket front end for the routing agent.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Minimal chat page that talks to `/ws` |
//! | `GET`  | `/ws` | WebSocket: one text frame per user turn, events streamed back |
//! | `POST` | `/chat` | One turn as JSON, no streaming |
//! | `GET`  | `/health` | Health check (version, open conversations) |
//!
//! # WebSocket
//!
//! Each connection is one conversation. Its id is taken from the
//! `conversation_id` query parameter or generated. Events are sent as the
//! chat lines shown in the page (`👤: …`, `    🛠️ …`, `🤖: …`), or as tagged
//! JSON objects with `?format=json`. A failed turn sends an error event and
//! the connection stays open.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `agent_error` (502).

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::conversation::{AgentEvent, ChannelSink, ConversationHandler, EventSink, LogSink};
use crate::models::{InputMessage, OutputMessage};

const CHAT_PAGE: &str = r#"<!DOCTYPE html>
<html>
    <head>
        <title>Chat</title>
        <meta charset="utf-8">
    </head>
    <body>
        <h1>WebSocket Chat</h1>
        <form action="" onsubmit="sendMessage(event)">
            <input type="text" id="messageText" autocomplete="off"/>
            <button>Send</button>
        </form>
        <ul id="messages">
        </ul>
        <script>
            var scheme = location.protocol === "https:" ? "wss://" : "ws://";
            var ws = new WebSocket(scheme + location.host + "/ws");
            ws.onmessage = function(event) {
                var messages = document.getElementById("messages");
                var message = document.createElement("li");
                message.appendChild(document.createTextNode(event.data));
                messages.appendChild(message);
            };
            function sendMessage(event) {
                var input = document.getElementById("messageText");
                ws.send(input.value);
                input.value = "";
                event.preventDefault();
            }
        </script>
    </body>
</html>
"#;

/// Shared state of all handlers.
#[derive(Clone)]
pub struct AppState {
    handler: Arc<ConversationHandler>,
    /// User id attached to turns that don't carry one.
    user_id: String,
}

impl AppState {
    pub fn new(handler: Arc<ConversationHandler>, user_id: impl Into<String>) -> Self {
        Self {
            handler,
            user_id: user_id.into(),
        }
    }
}

/// Build the router with all routes, CORS and request tracing.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_index))
        .route("/ws", get(handle_ws))
        .route("/chat", post(handle_chat))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Build the agent from `config` and serve on `[server].bind` until the
/// process is terminated.
pub async fn run_server(config: &Config) -> Result<()> {
    let handler = ConversationHandler::from_config(config)?;
    let state = AppState::new(Arc::new(handler), config.agent.user_id.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(bind = %config.server.bind, "server listening");
    println!("Chat server listening on http://{}", config.server.bind);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// The model, embedding or vector store call behind a turn failed.
fn agent_error(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "agent_error".to_string(),
        message: format!("{:#}", err),
    }
}

// ============ GET / ============

async fn handle_index() -> Html<&'static str> {
    Html(CHAT_PAGE)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    conversations: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        conversations: state.handler.store().len(),
    })
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<OutputMessage>, AppError> {
    if req.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }

    let input = InputMessage::new(
        req.conversation_id.unwrap_or_else(new_conversation_id),
        req.user_id.unwrap_or_else(|| state.user_id.clone()),
        req.message,
    );
    let output = state
        .handler
        .handle(&input, &LogSink)
        .await
        .map_err(agent_error)?;
    Ok(Json(output))
}

// ============ GET /ws ============

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    #[serde(default)]
    conversation_id: Option<String>,
    /// `json` for tagged JSON events, anything else for text lines.
    #[serde(default)]
    format: Option<String>,
}

async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: AppState, params: WsParams) {
    let conversation_id = params.conversation_id.unwrap_or_else(new_conversation_id);
    let as_json = params.format.as_deref() == Some("json");
    info!(%conversation_id, "client connected");

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if sender.send(WsMessage::Text(render_event(&event, as_json).into())).await.is_err() {
                break;
            }
        }
    });

    let sink = ChannelSink::new(tx);
    while let Some(Ok(frame)) = receiver.next().await {
        let text = match frame {
            WsMessage::Text(t) => t.as_str().to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };
        if text.trim().is_empty() {
            continue;
        }

        let input = InputMessage::new(conversation_id.as_str(), state.user_id.as_str(), text);
        if let Err(e) = state.handler.handle(&input, &sink).await {
            error!(%conversation_id, "turn failed: {:#}", e);
            sink.send(&AgentEvent::Error {
                message: format!("{:#}", e),
            })
            .await;
        }
    }

    drop(sink);
    let _ = writer.await;
    info!(%conversation_id, "client disconnected");
}

fn render_event(event: &AgentEvent, as_json: bool) -> String {
    if as_json {
        serde_json::to_string(event).unwrap_or_else(|_| event.to_string())
    } else {
        event.to_string()
    }
}

fn new_conversation_id() -> String {
    Uuid::new_v4().simple().to_string()
}
