//! Sandbox runner process for berth sessions.
//!
//! Each sandbox runs exactly one of these: the bridge keeps the session
//! holder connected to the local model server, and the gateway proxies
//! authenticated dev-tool traffic on an in-sandbox port.
//!
//! # Usage
//!
//! ```text
//! berth-runner --holder-url ws://platform/ws/runner/<session-id> \
//!     --token-file /run/berth/runner-token --listen 127.0.0.1:8443 \
//!     --jwt-secret-file /run/berth/gateway-secret
//! ```
//!
//! # Exit codes
//!
//! - `0` — superseded by a newer runner (normal rotation)
//! - `1` — runner token rotated away; the sandbox is orphaned

use berth_runner::bridge::{Bridge, BridgeConfig};
use berth_runner::gateway::{self, auth::SessionTokens, GatewayState, Upstreams};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "berth-runner", about = "Sandbox runner for berth sessions")]
struct Args {
    /// Holder WebSocket URL, ws://host/ws/runner/{session-id}.
    #[arg(long)]
    holder_url: String,

    /// Runner token (prefer --token-file; this leaks into ps output).
    #[arg(long, conflicts_with = "token_file")]
    token: Option<String>,

    /// File containing the runner token.
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Gateway listen address.
    #[arg(long, default_value = "127.0.0.1:8443")]
    listen: SocketAddr,

    /// File containing the gateway JWT secret.
    #[arg(long)]
    jwt_secret_file: Option<PathBuf>,

    /// Gateway JWT secret (prefer --jwt-secret-file).
    #[arg(long, conflicts_with = "jwt_secret_file")]
    jwt_secret: Option<String>,

    /// Local model server base URL.
    #[arg(long, default_value = "http://127.0.0.1:4096")]
    opencode_url: String,

    /// Code editor base URL.
    #[arg(long, default_value = "http://127.0.0.1:4097")]
    vscode_url: String,

    /// Remote desktop base URL.
    #[arg(long, default_value = "http://127.0.0.1:4098")]
    vnc_url: String,

    /// Terminal base URL.
    #[arg(long, default_value = "http://127.0.0.1:4099")]
    ttyd_url: String,
}

fn read_secret(inline: Option<String>, file: Option<PathBuf>, what: &str) -> anyhow::Result<String> {
    match (inline, file) {
        (Some(value), _) => Ok(value),
        (None, Some(path)) => Ok(std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("cannot read {what} from {}: {e}", path.display()))?
            .trim()
            .to_string()),
        (None, None) => Err(anyhow::anyhow!("missing {what}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let token = read_secret(args.token, args.token_file, "runner token")?;
    let jwt_secret = read_secret(args.jwt_secret, args.jwt_secret_file, "gateway JWT secret")?;

    tracing::info!(
        holder = %args.holder_url,
        listen = %args.listen,
        "starting berth runner"
    );

    let (bridge, handle, mut incoming) =
        Bridge::new(BridgeConfig::new(args.holder_url, token));

    let state: gateway::SharedState = Arc::new(GatewayState {
        bridge: handle,
        jwt_secret: jwt_secret.into_bytes(),
        sessions: SessionTokens::new(),
        upstreams: Upstreams {
            opencode: args.opencode_url,
            vscode: args.vscode_url,
            vnc: args.vnc_url,
            ttyd: args.ttyd_url,
        },
        client: reqwest::Client::new(),
    });

    // Holder frames that are not correlated responses go to the local
    // model-server loop; this binary only logs them. The agent loop
    // inside the sandbox consumes the same stream via the gateway's
    // /opencode proxy.
    tokio::spawn(async move {
        while let Some(frame) = incoming.recv().await {
            tracing::debug!(?frame, "holder frame");
        }
    });

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    let app = gateway::router(state)
        .into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("gateway server failed: {e}");
        }
    });

    // The bridge decides when this process dies.
    let reason = bridge.run().await;
    tracing::info!(?reason, "runner exiting");
    std::process::exit(reason.exit_code());
}
