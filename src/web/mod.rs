//! Web server module: REST API, event stream and WebSocket.

mod handlers;
mod sse;
mod ws;

pub use handlers::*;
pub use sse::*;
pub use ws::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::hub::Hub;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub hub: Arc<Hub>,
    pub shutdown: ShutdownSignal,
}

/// Tells long-lived connections (event streams, WebSockets) to finish.
#[derive(Clone)]
pub struct ShutdownSignal(Arc<watch::Sender<bool>>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once [`trigger`](Self::trigger) has been called.
    pub async fn wait(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP front end for the monitor.
pub struct WebServer {
    state: AppState,
}

impl WebServer {
    pub fn new(config: ServerConfig, store: Arc<Store>, scheduler: Arc<Scheduler>, hub: Arc<Hub>) -> Self {
        Self {
            state: AppState {
                config,
                store,
                scheduler,
                hub,
                shutdown: ShutdownSignal::new(),
            },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/servers", get(handle_get_servers).post(handle_create_server))
            .route(
                "/api/servers/{id}",
                put(handle_update_server).delete(handle_delete_server),
            )
            .route("/api/statuses", get(handle_get_statuses))
            .route("/api/pings", get(handle_get_pings))
            .route("/api/checks/run", post(handle_run_checks))
            .route("/api/metrics/overview", get(handle_metrics_overview))
            .route("/api/metrics/uptime", get(handle_metrics_uptime))
            .route("/api/metrics/response-times", get(handle_metrics_response_times))
            .route("/api/metrics/failures", get(handle_metrics_failures))
            .route("/api/hub", get(handle_hub_stats))
            // Live updates
            .route("/api/stream", get(handle_stream))
            .route("/ws", get(handle_ws))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Web server listening on {}", addr);

        self.serve(listener, shutdown).await
    }

    /// Serve on `listener`. Once `shutdown` resolves, open streams and
    /// sockets are ended so the graceful shutdown can complete.
    pub async fn serve<F>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let closing = self.state.shutdown.clone();
        axum::serve(listener, self.routes())
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!("Closing live connections");
                closing.trigger();
            })
            .await?;

        Ok(())
    }
}
