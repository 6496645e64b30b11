//! # wrserver - HTTP server for the WebRadio relay
//!
//! A thin layer over axum:
//!
//! - JSON routes, stateful handlers and sub-routers registered before start
//! - static web UI directory served as the fallback
//! - CORS allow-list taken from the configuration
//! - graceful shutdown driven by a [`tokio_util::sync::CancellationToken`]
//! - `tracing` setup with an in-memory buffer exposed at `/log-dump`,
//!   `/log-sse` and `/api/log_setup`
//!
//! ```rust,no_run
//! use wrserver::ServerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut server = ServerBuilder::new_configured().build();
//!     server.init_logging().await;
//!     server.add_route("/api/status", || async {
//!         serde_json::json!({ "status": "ok" })
//!     }).await;
//!
//!     server.start().await?;
//!     server.wait().await;
//!     Ok(())
//! }
//! ```

pub mod logs;
pub mod server;

pub use logs::{LogState, SseLayer, log_dump, log_sse};
pub use server::{Server, ServerBuilder, ServerInfo};
