use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use chat_gateway::gateway::telemetry::{self, TracingOptions};
use chat_gateway::gateway::{
    CONFIG_FILE, Gateway, GatewayConfig, GatewayHttpState, MemoryGuardian, OllamaBackend, http,
};

/// Multi-tenant chat gateway in front of a local completion backend.
#[derive(Debug, Parser)]
#[command(name = "chat-gateway", version)]
struct Cli {
    /// Config file. Defaults to `config.json` inside the state directory.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the configured listen address.
    #[arg(long)]
    listen: Option<String>,
    /// Directory holding the key set, call statistics and resolved config.
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,
    /// Enables the admin routes.
    #[arg(long)]
    admin_token: Option<String>,
    #[arg(long)]
    json_logs: bool,
    #[arg(long)]
    otel: bool,
    #[arg(long)]
    otel_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let _telemetry = telemetry::init_tracing(
        "chat-gateway",
        &TracingOptions {
            json_logs: cli.json_logs,
            otel: cli.otel || cli.otel_endpoint.is_some(),
            otel_endpoint: cli.otel_endpoint.clone(),
        },
    )?;

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.state_dir.join(CONFIG_FILE));
    let mut config = GatewayConfig::load_or_default(&config_path);
    if let Some(listen) = cli.listen.clone() {
        config.listen = listen;
    }
    config.validate()?;
    if let Err(err) = config.save(cli.state_dir.join(CONFIG_FILE)) {
        tracing::warn!(error = %err, "failed to save resolved config");
    }

    let backend = OllamaBackend::new(config.base_url.clone(), config.request_timeout())?;
    let listen = config.listen.clone();
    let gateway = Arc::new(Gateway::new(config, backend).with_state_dir(&cli.state_dir));
    tracing::info!(
        keys = gateway.credentials().len(),
        backend = %gateway.config().base_url,
        "gateway state loaded"
    );

    match gateway.ping_backend().await {
        chat_gateway::gateway::ConnectionState::Disconnected { reason } => {
            tracing::warn!(%reason, "backend not reachable at startup");
        }
        state => tracing::info!(?state, "backend probe"),
    }

    let _guardian = MemoryGuardian::new(Arc::clone(&gateway)).spawn();

    let mut state = GatewayHttpState::new(gateway);
    if let Some(token) = cli.admin_token {
        state = state.with_admin_token(token);
    }
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await?;
    Ok(())
}
