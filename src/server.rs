use axum::{
    http::StatusCode,
    response::Html,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::api;
use crate::api::state::AppState;
use crate::error::BellError;

pub struct WebServer {
    host: String,
    port: u16,
    state: AppState,
}

impl WebServer {
    pub fn new(host: String, port: u16, state: AppState) -> Self {
        Self { host, port, state }
    }

    pub async fn start(&self) -> Result<(), BellError> {
        let app = self.create_router();

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| BellError::Error(format!("Invalid address: {}", e)))?;

        println!("🔔 schoolbell server starting on http://{}", addr);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BellError::Error(format!("Failed to bind to {}: {}", addr, e)))?;

        let shutdown_signal = shutdown_signal();
        let scheduler = self.state.scheduler.clone();

        log::info!("Server ready to handle requests");

        // Start the server with graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal.await;
                log::info!("Shutdown signal received, stopping bell scheduler...");
                println!("\n🛑 Shutdown signal received - stopping server gracefully...");

                // Music off, timers cancelled, relay OFF
                if let Err(e) = scheduler.shutdown().await {
                    log::error!("Bell scheduler shutdown failed: {}", e);
                }

                log::info!("Server shutdown complete");
                println!("   Server stopped");
            })
            .await
            .map_err(|e| BellError::Error(format!("Server error: {}", e)))?;

        Ok(())
    }

    fn create_router(&self) -> Router {
        Router::new()
            // Health check
            .route("/health", get(health_check))

            // Bell control
            .route("/api/bell/next", get(api::bell::get_next))
            .route("/api/bell/today", get(api::bell::get_today))
            .route("/api/bell/status", get(api::bell::get_status))
            .route("/api/bell/test-fire", post(api::bell::test_fire))
            .route("/api/bell/rehydrate", post(api::bell::rehydrate))

            // Background music
            .route("/api/music/start", post(api::music::start_music))
            .route("/api/music/stop", post(api::music::stop_music))

            // WebSocket routes
            .route("/ws/bell", get(api::bell::bell_ws))

            // Add state for handlers
            .with_state(self.state.clone())
    }
}

async fn health_check() -> Result<(StatusCode, Html<String>), StatusCode> {
    Ok((
        StatusCode::OK,
        Html("<h1>schoolbell</h1><p>✅ Server is running</p>".to_string()),
    ))
}

/// Waits for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            log::info!("Received SIGTERM");
        },
    }
}
