//! # Server - high-level wrapper around axum
//!
//! Routes are collected into a shared [`Router`] before [`Server::start`]
//! binds the listener. The server owns a [`CancellationToken`] that is
//! cancelled on Ctrl+C; long-lived handlers (audio streams, SSE feeds) should
//! watch it so graceful shutdown can complete.

use crate::logs::{LogState, create_logs_router, init_logging, log_dump, log_sse};
use anyhow::{Context, Result};
use axum::Router;
use axum::handler::Handler;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::Json;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::{signal, sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{info, warn};
use wrconfig::get_config;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_SERVER_NAME: &str = "WebRadio";

/// Serializable server description
#[derive(Clone, Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub base_url: String,
    pub http_port: u16,
}

/// HTTP server
pub struct Server {
    name: String,
    base_url: String,
    http_port: u16,
    router: Arc<RwLock<Router>>,
    static_dir: Option<PathBuf>,
    cors_origins: Vec<String>,
    join_handle: Option<JoinHandle<()>>,
    log_state: Option<LogState>,
    shutdown: CancellationToken,
}

impl Server {
    /// Creates a server that will listen on `0.0.0.0:<http_port>`
    ///
    /// ```rust
    /// # use wrserver::Server;
    /// let server = Server::new("MyRadio", "localhost", 3000);
    /// assert_eq!(server.info().http_port, 3000);
    /// ```
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, http_port: u16) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            http_port,
            router: Arc::new(RwLock::new(Router::new())),
            static_dir: None,
            cors_origins: Vec::new(),
            join_handle: None,
            log_state: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates a server from the `host` section of the global configuration
    pub fn new_configured() -> Self {
        ServerBuilder::new_configured().build()
    }

    async fn mount(&self, path: &str, route: Router) {
        let mut r = self.router.write().await;
        *r = if path == "/" {
            std::mem::take(&mut *r).merge(route)
        } else {
            std::mem::take(&mut *r).nest(path, route)
        };
    }

    /// Adds a GET route returning the JSON produced by `f`
    ///
    /// ```rust,no_run
    /// # use wrserver::Server;
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let mut server = Server::new("Test", "localhost", 3000);
    /// server.add_route("/api/status", || async {
    ///     serde_json::json!({ "status": "online" })
    /// }).await;
    /// # }
    /// ```
    pub async fn add_route<F, Fut, T>(&mut self, path: &str, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        let handler = move || {
            let f = f.clone();
            async move { Json(f().await) }
        };

        self.mount(path, Router::new().route("/", get(handler))).await;
    }

    /// Adds a GET handler with state
    pub async fn add_handler_with_state<H, T, S>(&mut self, path: &str, handler: H, state: S)
    where
        H: Handler<T, S> + Clone + 'static,
        T: 'static,
        S: Clone + Send + Sync + 'static,
    {
        let route = Router::new().route("/", get(handler)).with_state(state);
        self.mount(path, route).await;
    }

    /// Merges (`"/"`) or nests a sub-router
    pub async fn add_router(&mut self, path: &str, sub_router: Router) {
        if path == "/" {
            self.mount("/", sub_router).await;
        } else {
            let normalized = format!("/{}", path.trim_start_matches('/'));
            self.mount(&normalized, sub_router).await;
        }
    }

    /// Serves `dir` for every path no route matches (the static web UI)
    pub fn add_dir(&mut self, dir: impl Into<PathBuf>) {
        self.static_dir = Some(dir.into());
    }

    /// Restricts cross-origin requests to `origins`. An empty list disables CORS.
    pub fn set_cors_origins(&mut self, origins: Vec<String>) {
        self.cors_origins = origins;
    }

    /// Token cancelled when the server shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Requests a graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Returns the complete application router (routes, static dir, CORS)
    pub async fn router(&self) -> Router {
        let mut router = self.router.read().await.clone();

        if let Some(dir) = &self.static_dir {
            router = router.fallback_service(ServeDir::new(dir));
        }

        if let Some(cors) = cors_layer(&self.cors_origins) {
            router = router.layer(cors);
        }

        router
    }

    /// Binds the listener and serves in the background
    ///
    /// Fails if the port cannot be bound. Ctrl+C cancels the shutdown token;
    /// in-flight connections then get a short grace period before the serve
    /// task is aborted.
    pub async fn start(&mut self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.http_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Cannot bind HTTP port {}", self.http_port))?;

        info!(
            "Server {} running at http://{}:{}",
            self.name, self.base_url, self.http_port
        );

        let router = self.router().await;
        let token = self.shutdown.clone();
        let mut serve_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!("HTTP server stopped with error: {}", e);
            }
        });

        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                res = signal::ctrl_c() => {
                    match res {
                        Ok(()) => info!("Ctrl+C received, shutting down"),
                        Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
                    }
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });

        let token = self.shutdown.clone();
        self.join_handle = Some(tokio::spawn(async move {
            tokio::select! {
                _ = &mut serve_task => {}
                _ = async {
                    token.cancelled().await;
                    tokio::time::sleep(SHUTDOWN_GRACE).await;
                } => {
                    warn!("Open connections did not close in time, aborting");
                    serve_task.abort();
                }
            }
        }));

        Ok(())
    }

    /// Waits until the server has stopped
    pub async fn wait(&mut self) {
        if let Some(h) = self.join_handle.take() {
            let _ = h.await;
        }
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            base_url: self.base_url.clone(),
            http_port: self.http_port,
        }
    }

    /// Installs the tracing subscriber and registers `/log-sse`, `/log-dump`
    /// and `/api/log_setup`
    pub async fn init_logging(&mut self) -> LogState {
        let log_state = init_logging();

        self.add_handler_with_state("/log-sse", log_sse, log_state.clone())
            .await;
        self.add_handler_with_state("/log-dump", log_dump, log_state.clone())
            .await;
        self.add_router("/api", create_logs_router(log_state.clone()))
            .await;

        self.log_state = Some(log_state.clone());
        log_state
    }

    pub fn log_state(&self) -> Option<&LogState> {
        self.log_state.as_ref()
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any),
    )
}

/// Builder for [`Server`]
pub struct ServerBuilder {
    name: String,
    base_url: String,
    http_port: u16,
    cors_origins: Vec<String>,
}

impl ServerBuilder {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, http_port: u16) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            http_port,
            cors_origins: Vec::new(),
        }
    }

    /// Builder preloaded with the `host` configuration (port, base URL, CORS)
    pub fn new_configured() -> Self {
        let config = get_config();
        Self {
            name: DEFAULT_SERVER_NAME.to_string(),
            base_url: config.get_base_url(),
            http_port: config.get_http_port(),
            cors_origins: config.get_cors_allowed_origins(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }

    pub fn build(self) -> Server {
        let mut server = Server::new(self.name, self.base_url, self.http_port);
        server.set_cors_origins(self.cors_origins);
        server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_add_route_serves_json() {
        let mut server = ServerBuilder::new("Test", "localhost", 0).build();
        server
            .add_route("/api/ping", || async { serde_json::json!({ "pong": true }) })
            .await;

        let response = server
            .router()
            .await
            .oneshot(Request::get("/api/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], br#"{"pong":true}"#);
    }

    #[tokio::test]
    async fn test_handler_with_state() {
        async fn greet(axum::extract::State(name): axum::extract::State<String>) -> String {
            format!("on air: {name}")
        }

        let mut server = ServerBuilder::new("Test", "localhost", 0).build();
        server
            .add_handler_with_state("/api/on-air", greet, "Rádio".to_string())
            .await;

        let response = server
            .router()
            .await
            .oneshot(Request::get("/api/on-air").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], "on air: Rádio".as_bytes());
    }

    #[tokio::test]
    async fn test_cors_allow_list() {
        let server = ServerBuilder::new("Test", "localhost", 0)
            .cors_origins(vec!["https://allowed.example".into()])
            .build();
        let mut server = server;
        server.add_route("/health", || async { "ok" }).await;
        let router = server.router().await;

        let allowed = router
            .clone()
            .oneshot(
                Request::get("/health")
                    .header(header::ORIGIN, "https://allowed.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            allowed.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://allowed.example"
        );

        let denied = router
            .oneshot(
                Request::get("/health")
                    .header(header::ORIGIN, "https://evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(denied.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn test_static_dir_fallback() {
        let dir = std::env::temp_dir().join(format!("wrserver-static-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "<h1>radio</h1>").unwrap();

        let mut server = Server::new("Test", "localhost", 0);
        server.add_dir(&dir);
        let response = server
            .router()
            .await
            .oneshot(Request::get("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_shutdown_token_is_shared() {
        let server = Server::new("Test", "localhost", 0);
        let token = server.shutdown_token();
        assert!(!token.is_cancelled());
        server.shutdown();
        assert!(token.is_cancelled());
    }
}
