//! Extension trait mounting the relay on a `wrserver::Server`
//!
//! ```no_run
//! use std::sync::Arc;
//! use wrconfig::get_config;
//! use wrrelay::{RadioConfigExt, RadioRelay, RadioServerExt};
//! use wrserver::ServerBuilder;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let mut server = ServerBuilder::new_configured().build();
//! let settings = get_config().get_radio_settings()?;
//! let relay = Arc::new(RadioRelay::from_settings(settings, server.shutdown_token())?);
//!
//! server.init_radio(relay.clone()).await;
//! server.start().await?;
//! relay.start().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use wrserver::Server;

use crate::relay::RadioRelay;

#[async_trait]
pub trait RadioServerExt {
    /// Registers `/stream`, `/message-stream/{id}`, `/health`, `/events`
    /// and the `/api/radio` and `/api/control` routes
    async fn init_radio(&mut self, relay: Arc<RadioRelay>);
}

#[async_trait]
impl RadioServerExt for Server {
    async fn init_radio(&mut self, relay: Arc<RadioRelay>) {
        self.add_router("/", relay.router()).await;
        info!(
            sources = relay.station().registry().len(),
            "Radio routes registered"
        );
    }
}
