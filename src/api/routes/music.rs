use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use log::{error, warn};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct StartMusicRequest {
    #[serde(default)]
    pub force: bool,
}

/// POST /api/music/start
/// Start background music. Without `force` nothing starts close to a ring.
pub async fn start_music(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StartMusicRequest::default()
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|e| {
            warn!("Ignoring malformed music start body: {}", e);
            StartMusicRequest::default()
        })
    };

    match state.scheduler.start_music(request.force).await {
        Ok(playing) => Ok(Json(json!({ "playing": playing }))),
        Err(e) => {
            error!("Failed to start music: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// POST /api/music/stop
pub async fn stop_music(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.scheduler.stop_music("stopped from API").await {
        Ok(stopped) => Ok(Json(json!({ "stopped": stopped }))),
        Err(e) => {
            error!("Failed to stop music: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
