use std::fs;

use log::info;
use rustls::crypto::{CryptoProvider, ring};

use websocket_rails_client::config::Config;
use websocket_rails_client::{ConnectionState, WebsocketRails};

// ------------------------------------------------------------
// Demo entry point
// ------------------------------------------------------------
//
// A minimal WebsocketRails client runtime:
// - Initialize cryptography backend (rustls)
// - Load configuration
// - Connect and subscribe the configured channels
// - Log every watched event until interrupted
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // IMPORTANT:
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation. This must be executed exactly once and
    // as early as possible in the process lifecycle.
    //
    // Using the `ring` provider for performance and stability.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .expect("failed to install rustls CryptoProvider");

    let config: Config = load_config("config.json")?;

    // RUST_LOG still wins; the config flag only raises the default.
    let default_level = if config.debug.as_ref().and_then(|d| d.log).unwrap_or(false) {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let client = WebsocketRails::new(&config.server.url);
    if let Some(secs) = config.server.connect_timeout_secs {
        client.set_connect_timeout(secs);
    }

    client.on_open(|data| info!("connection open: {}", data));
    client.on_close(|data| info!("connection closed: {}", data));
    client.on_fail(|data| info!("connection failed: {}", data));

    for event_name in &config.watch {
        let name = event_name.clone();
        client.bind(event_name, move |data| {
            info!("event '{}': {}", name, data);
        });
    }

    if client.connect().await != ConnectionState::Connected {
        anyhow::bail!("could not connect to {}", config.server.url);
    }
    info!("connected to {} as '{}'", config.server.url, client.connection_id());

    // --------------------------------------------------------
    // Subscribe configured channels
    //
    // Channel events are logged the same way as global ones.
    // --------------------------------------------------------
    for channel_cfg in &config.channels {
        let channel = if channel_cfg.private {
            client.subscribe_private(&channel_cfg.name)
        } else {
            client.subscribe(&channel_cfg.name)
        };
        info!("subscribing channel '{}'", channel.name());

        for event_name in &channel_cfg.events {
            let channel_name = channel_cfg.name.clone();
            let name = event_name.clone();
            channel.bind(event_name, move |data| {
                info!("[{}] '{}': {}", channel_name, name, data);
            });
        }
    }

    // All traffic is handled on the connection worker task.
    // This future never resolves.
    futures_util::future::pending::<()>().await;

    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path)?;
    let cfg = serde_json::from_str(&data)?;
    Ok(cfg)
}
