use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use std::time::Duration;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        FromRequest, Request, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use crate::{
    config::{ConfigUpdate, Tunables, validate_update},
    engine::{ActiveOrderView, EngineStatus, FullStatus},
    instrument::Symbol,
    state::AppState,
};

/// Seconds between dashboard state pushes.
const BROADCAST_INTERVAL: Duration = Duration::from_secs(2);

/// Settle time after a symbol switch before the engine restarts, so the
/// fresh subscription has a book to quote against.
const SWITCH_SETTLE: Duration = Duration::from_secs(1);

type ApiErr = (StatusCode, Json<serde_json::Value>);
fn err(status: StatusCode, msg: &str) -> ApiErr {
    (status, Json(json!({ "error": msg })))
}

/// Json extractor that logs rejected payloads before answering 422.
pub struct LoggedJson<T>(pub T);

impl<S, T> FromRequest<S> for LoggedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiErr;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let uri = req.uri().clone();
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| err(StatusCode::BAD_REQUEST, &e.to_string()))?;

        match serde_json::from_slice::<T>(&bytes) {
            Ok(val) => Ok(LoggedJson(val)),
            Err(e) => {
                let preview = String::from_utf8_lossy(&bytes);
                warn!(
                    error = %e,
                    uri = %uri,
                    body = %&preview[..preview.len().min(1024)],
                    "request body rejected"
                );
                Err(err(StatusCode::UNPROCESSABLE_ENTITY, &e.to_string()))
            }
        }
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub engine: FullStatus,
    pub authenticated: bool,
    pub wallet_address: String,
    pub supported_symbols: Vec<&'static str>,
}

#[derive(Serialize)]
pub struct OrdersResponse {
    pub orders: Vec<ActiveOrderView>,
    pub count: usize,
}

#[derive(Serialize)]
pub struct ConfigResponse {
    pub message: String,
    pub updated_fields: Vec<&'static str>,
    pub current_config: Tunables,
}

fn status_response(state: &AppState) -> StatusResponse {
    StatusResponse {
        engine: state.engine.get_full_status(),
        authenticated: state.creds.is_authenticated(),
        wallet_address: state.creds.wallet_address.clone(),
        supported_symbols: Symbol::supported().iter().map(|s| s.code()).collect(),
    }
}

/// `POST /api/start`
/// Spins up the quoting loop. 401 without a bearer token, 409 when the
/// engine is already running.
pub async fn start_bot(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiErr> {
    if !state.creds.is_authenticated() {
        return Err(err(
            StatusCode::UNAUTHORIZED,
            "not authenticated - set STANDX_JWT_TOKEN",
        ));
    }
    if state.engine.status() == EngineStatus::Running {
        return Err(err(StatusCode::CONFLICT, "engine already running"));
    }
    state.engine.start().await;
    Ok(Json(
        json!({ "message": "engine started", "status": state.engine.status() }),
    ))
}

/// `POST /api/stop`
/// Stops the loop and cancels every resting order.
pub async fn stop_bot(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiErr> {
    if state.engine.status() == EngineStatus::Stopped {
        return Err(err(StatusCode::CONFLICT, "engine already stopped"));
    }
    state.engine.stop().await;
    Ok(Json(
        json!({ "message": "engine stopped - all orders cancelled", "status": state.engine.status() }),
    ))
}

/// `POST /api/kill`
/// Emergency stop; behaves like stop but parks the engine in `killed`.
pub async fn kill_bot(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.engine.kill().await;
    Json(json!({ "message": "kill switch engaged", "status": state.engine.status() }))
}

/// `GET /api/status`
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(status_response(&state))
}

/// `GET /api/orders`
pub async fn get_orders(State(state): State<AppState>) -> Json<OrdersResponse> {
    let orders = state.engine.active_orders();
    Json(OrdersResponse {
        count: orders.len(),
        orders,
    })
}

/// `GET /api/uptime`
pub async fn get_uptime(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.uptime.stats())
}

/// `GET /api/book`
pub async fn get_book(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.book.top_levels(10))
}

/// `POST /api/config`
///
/// Parameter-only changes apply atomically. A symbol change runs the full
/// barrier: stop engine (if running) -> reset uptime -> switch the depth
/// subscription -> write config -> settle -> restart.
pub async fn update_config(
    State(state): State<AppState>,
    LoggedJson(update): LoggedJson<ConfigUpdate>,
) -> Result<Json<ConfigResponse>, ApiErr> {
    let _guard = state.config_lock.lock().await;

    if update.is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "no valid fields to update"));
    }
    // reject out-of-range values before touching the engine
    validate_update(&update).map_err(|e| err(StatusCode::BAD_REQUEST, &e.to_string()))?;

    let symbol_changed = update
        .symbol
        .map(|s| s != state.config.symbol())
        .unwrap_or(false);

    let updated_fields = if symbol_changed {
        let new_symbol = update.symbol.unwrap();
        let was_running = state.engine.status() == EngineStatus::Running;

        if was_running {
            state.engine.stop().await;
        }
        state.uptime.reset();
        state.feed.switch_symbol(new_symbol);
        let written = state
            .config
            .apply(&update)
            .map_err(|e| err(StatusCode::BAD_REQUEST, &e.to_string()))?;

        if was_running {
            tokio::time::sleep(SWITCH_SETTLE).await;
            state.engine.start().await;
        }
        info!(symbol = %new_symbol, "symbol switched");
        written
    } else {
        let written = state
            .config
            .apply(&update)
            .map_err(|e| err(StatusCode::BAD_REQUEST, &e.to_string()))?;
        info!(fields = ?written, "config updated");
        written
    };

    Ok(Json(ConfigResponse {
        message: if symbol_changed {
            "configuration updated (symbol switched)".to_string()
        } else {
            "configuration updated".to_string()
        },
        updated_fields,
        current_config: state.config.snapshot(),
    }))
}

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /ws`
/// Upgrades and then pushes the full engine state to the dashboard every
/// couple of seconds.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("dashboard client connected");
    let mut push_timer = tokio::time::interval(BROADCAST_INTERVAL);

    loop {
        tokio::select! {
            _ = push_timer.tick() => {
                let mut frame = match serde_json::to_value(status_response(&state)) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "status serialization failed");
                        continue;
                    }
                };
                frame["type"] = json!("state_update");
                if socket
                    .send(Message::Text(frame.to_string().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    // inbound payloads are ignored; the socket is push-only
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
    info!("dashboard client disconnected");
}

/// Constructs the application's `Router` with all routes and shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/start", post(start_bot))
        .route("/api/stop", post(stop_bot))
        .route("/api/kill", post(kill_bot))
        .route("/api/status", get(get_status))
        .route("/api/orders", get(get_orders))
        .route("/api/uptime", get(get_uptime))
        .route("/api/book", get(get_book))
        .route("/api/config", post(update_config))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .include_headers(false)
                        .level(tracing::Level::TRACE),
                )
                .on_response(DefaultOnResponse::new().level(tracing::Level::TRACE)),
        )
        .with_state(state)
}
