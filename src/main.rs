mod auth;
mod config;
mod dispatch;
mod hub;
mod packet;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use config::{generate_config_template, Config};
use hub::{BoundedPool, Hub};
use packet::{HmacSha256Signer, PacketProtocol};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "linehub=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "linehub=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("linehub v{} starting", env!("CARGO_PKG_VERSION"));

    // Load or generate the session-token signing key
    std::fs::create_dir_all(&config.data_dir)?;
    let session_secret = auth::load_or_generate_session_secret(&config.data_dir)?;

    // Build the frame codec from [protocol] settings
    let protocol_settings = config.protocol.clone().unwrap_or_default();
    let mut protocol = PacketProtocol::new(Some(protocol_settings.marshaler()));
    if !protocol_settings.hmac_key_hex.is_empty() {
        let key = hex::decode(&protocol_settings.hmac_key_hex)?;
        protocol = protocol.with_signer(Arc::new(HmacSha256Signer::new(key)));
        tracing::info!("Frame signing enabled (HMAC-SHA256)");
    }

    // Build the hub on a bounded task pool
    let tuning = config.hub.clone().unwrap_or_default();
    let pool = BoundedPool::new(tuning.pool_capacity);
    let (hub, events) = Hub::new(tuning.to_hub_config(), pool)?;
    let hub::HubEvents {
        messages,
        mut registered,
        mut unregistered,
        mut errors,
    } = events;

    // Protocol decode/dispatch loop — business logic side of the hub
    tokio::spawn(dispatch::run_dispatcher(
        hub.clone(),
        protocol.clone(),
        messages,
    ));

    // Observe lifecycle and error events
    tokio::spawn(async move {
        loop {
            tokio::select! {
                line = registered.recv() => match line {
                    Some(line) => tracing::info!(
                        user_id = %line.user_id(),
                        line_id = %line.id(),
                        transport = line.transport().as_str(),
                        "Line registered"
                    ),
                    None => break,
                },
                line = unregistered.recv() => match line {
                    Some(line) => tracing::info!(
                        user_id = %line.user_id(),
                        line_id = %line.id(),
                        "Line unregistered"
                    ),
                    None => break,
                },
                err = errors.recv() => match err {
                    Some(err) => tracing::warn!(
                        user_id = %err.user_id,
                        line_id = %err.line_id,
                        error = %err.kind,
                        "Line error"
                    ),
                    None => break,
                },
            }
        }
    });

    // Build application state and router
    let app_state = state::AppState {
        hub,
        protocol,
        session_secret,
    };
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
