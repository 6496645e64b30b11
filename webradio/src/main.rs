use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use wrconfig::get_config;
use wrrelay::{RadioConfigExt, RadioRelay, RadioServerExt};
use wrserver::ServerBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = get_config();
    let mut server = ServerBuilder::new_configured().name("WebRadio").build();
    server.init_logging().await;

    let settings = config
        .get_radio_settings()
        .context("Invalid radio configuration")?;
    let relay = Arc::new(
        RadioRelay::from_settings(settings, server.shutdown_token())
            .context("Cannot build the radio relay")?,
    );

    server.init_radio(relay.clone()).await;
    server
        .add_route("/info", || async {
            serde_json::json!({ "name": "webradio", "version": env!("CARGO_PKG_VERSION") })
        })
        .await;

    match config.get_public_dir() {
        Some(dir) if Path::new(&dir).is_dir() => {
            info!(dir = %dir, "Serving the web player");
            server.add_dir(dir);
        }
        Some(dir) => warn!(dir = %dir, "Public directory not found, web player disabled"),
        None => {}
    }

    server.start().await?;
    relay.start().await;

    let info = server.info();
    info!("Listen at http://{}:{}/stream", info.base_url, info.http_port);
    info!("Press Ctrl+C to stop...");

    server.wait().await;
    relay.shutdown();
    relay.join().await;
    Ok(())
}
