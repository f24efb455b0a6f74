use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use super::state::AppState;
use crate::events::{BellEvent, RingView};
use crate::scheduler::{DaySummary, SchedulerSnapshot};

/// GET /api/bell/next
/// The next ring today, or null when nothing is left
pub async fn get_next(
    State(state): State<AppState>,
) -> Result<Json<Option<RingView>>, StatusCode> {
    state.scheduler.next_ring().await.map(Json).map_err(|e| {
        error!("Failed to get next ring: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })
}

/// GET /api/bell/status
/// Scheduler phase and which timers are armed
pub async fn get_status(
    State(state): State<AppState>,
) -> Result<Json<SchedulerSnapshot>, StatusCode> {
    state.scheduler.snapshot().await.map(Json).map_err(|e| {
        error!("Failed to get scheduler status: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })
}

/// Body of a manual test fire. Every field is optional and so is the body.
#[derive(Debug, Default, Deserialize)]
pub struct FireRequest {
    pub duration_ms: Option<u64>,
}

impl FireRequest {
    fn from_body(body: &[u8]) -> Self {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Self::default();
        }
        serde_json::from_slice(body).unwrap_or_else(|e| {
            warn!("Ignoring malformed test-fire body: {}", e);
            Self::default()
        })
    }

    /// Requested pulse length; zero means "use the default"
    fn duration_ms(&self) -> Option<u64> {
        self.duration_ms.filter(|&ms| ms > 0)
    }
}

/// POST /api/bell/test-fire
/// Rings once, outside the schedule. Always acknowledges; the outcome is
/// visible in the bell log and in whether `bell:triggered` is emitted.
pub async fn test_fire(State(state): State<AppState>, body: Bytes) -> Json<Value> {
    let request = FireRequest::from_body(&body);

    match state.scheduler.fire_now(request.duration_ms()).await {
        Ok(result) => info!("Manual test fire finished: {}", result),
        Err(e) => error!("Manual test fire not performed: {}", e),
    }

    Json(json!({ "ok": true }))
}

/// GET /api/bell/today
/// Today's resolved schedule, past rings included
pub async fn get_today(State(state): State<AppState>) -> Result<Json<DaySummary>, StatusCode> {
    state.scheduler.today().await.map(Json).map_err(|e| {
        error!("Failed to resolve today's schedule: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// POST /api/bell/rehydrate
/// Recompute the schedule after templates, days or playlists changed
pub async fn rehydrate(
    State(state): State<AppState>,
) -> Result<Json<Option<RingView>>, StatusCode> {
    state.scheduler.rehydrate().await.map(Json).map_err(|e| {
        error!("Failed to rehydrate bell schedule: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })
}

/// WebSocket endpoint streaming bell events to displays
/// GET /ws/bell
pub async fn bell_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_bell_socket(socket, state))
}

/// Send one event; false once the client is gone
async fn send_event(socket: &mut WebSocket, event: &BellEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!("[WS] Failed to serialize {}: {}", event.name(), e);
            true
        }
    }
}

async fn handle_bell_socket(mut socket: WebSocket, state: AppState) {
    log::info!("[WS] New bell display connected");

    // Subscribe before reading the current state so nothing falls in between
    let mut receiver = state.events.subscribe();

    // New displays always learn the current next ring first
    match state.scheduler.next_ring().await {
        Ok(next) => {
            if !send_event(&mut socket, &BellEvent::Next(next)).await {
                log::info!("[WS] Client disconnected during handshake");
                return;
            }
        }
        Err(e) => {
            log::info!("[WS] Scheduler unavailable, closing connection: {}", e);
            return;
        }
    }

    loop {
        tokio::select! {
            result = receiver.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            log::info!("[WS] Client disconnected (send failed)");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[WS] Display lagged behind, {} event(s) skipped", skipped);
                    }
                    Err(RecvError::Closed) => {
                        log::info!("[WS] Event channel closed - closing connection");
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("[WS] Client initiated close");
                        break;
                    }
                    Some(Err(e)) => {
                        log::info!("[WS] Error receiving from client: {:?}", e);
                        break;
                    }
                    // Text keepalives and pings need no answer from us
                    _ => {}
                }
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_secs(30)) => {
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    log::info!("[WS] Keepalive ping failed - client disconnected");
                    break;
                }
            }
        }
    }
    log::info!("[WS] Bell display handler exiting");
}
