//! Stand-alone WebSocket tunnel in front of guacd.
//!
//! Demonstrates:
//! - Loading `ServerConfig` from the environment
//! - Dialing guacd per connection with parameters from the query string
//! - Tracking live sessions with `SessionRegistry`
//! - Listing them as JSON on `GET /sessions/`
//! - Graceful shutdown of the accept loop on Ctrl+C
//!
//! Usage:
//!   cargo run --example guac_server
//!   cargo run --example guac_server -- --debug
//!   GUACD_ADDRESS=guacd:4822 LISTEN_ADDRESS=127.0.0.1:8080 cargo run --example guac_server
//!
//! Then point a Guacamole client at
//! `ws://127.0.0.1:4567/websocket-tunnel?scheme=vnc&hostname=...&port=5900`
//! and list live sessions with `curl http://127.0.0.1:4568/sessions/`
//! (`SESSIONS_ADDRESS` overrides the listing address).

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use guac_bridge::{
    ConnectRequest, Connector, Error, HandshakeConfig, Result, SOCKET_TIMEOUT, ServerConfig,
    SessionCount, SessionRegistry, SimpleTunnel, Stream, WebsocketServer,
};
use tokio::net::TcpListener;
use tracing::{debug, info, info_span};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Constants
// ============================================================================

const SESSION_REPORT_INTERVAL: Duration = Duration::from_secs(30);

const DEFAULT_SESSIONS_ADDRESS: &str = "127.0.0.1:4568";

// ============================================================================
// Connector
// ============================================================================

/// Opens one guacd session per browser connection.
struct Guacd {
    addr: String,
}

#[async_trait]
impl Connector for Guacd {
    type Tunnel = SimpleTunnel;

    async fn connect(&self, request: &ConnectRequest) -> Result<SimpleTunnel> {
        let config = HandshakeConfig::from_query(request.query());
        debug!(config = ?config.redacted(), "Connecting to guacd");

        let mut stream = Stream::connect(self.addr.as_str(), SOCKET_TIMEOUT).await?;
        stream.handshake(&config).await?;
        SimpleTunnel::new(stream)
    }
}

// ============================================================================
// Session Listing
// ============================================================================

async fn list_sessions(State(sessions): State<Arc<SessionRegistry>>) -> Json<Vec<SessionCount>> {
    Json(sessions.snapshot())
}

fn sessions_addr() -> Result<SocketAddr> {
    let addr = std::env::var("SESSIONS_ADDRESS")
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SESSIONS_ADDRESS.to_owned());

    addr.parse()
        .map_err(|e| Error::config(format!("Invalid SESSIONS_ADDRESS {addr:?}: {e}")))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let debug = std::env::args().any(|arg| arg == "--debug");
    init_logging(debug);

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = ServerConfig::from_env()?;
    info!(guacd = %config.guacd_addr, listen = %config.listen_addr, "Starting guac server");

    let sessions = Arc::new(SessionRegistry::new());
    let server = Arc::new(
        WebsocketServer::new(Guacd {
            addr: config.guacd_addr.clone(),
        })
        .listener(sessions.clone())
        .with_span(info_span!("guac_server")),
    );

    let reporter = {
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SESSION_REPORT_INTERVAL);
            loop {
                interval.tick().await;
                match sessions.to_json() {
                    Ok(json) => info!(active = sessions.len(), sessions = %json, "Session report"),
                    Err(e) => debug!(error = %e, "Session report failed"),
                }
            }
        })
    };

    let app = Router::new()
        .route("/sessions/", get(list_sessions))
        .with_state(Arc::clone(&sessions));
    let listing_addr = sessions_addr()?;
    let listing_listener = TcpListener::bind(listing_addr).await?;
    info!(addr = %listing_addr, "Serving session listing");
    let listing = tokio::spawn(async move {
        if let Err(e) = axum::serve(listing_listener, app).await {
            debug!(error = %e, "Session listing stopped");
        }
    });

    let listener = TcpListener::bind(config.listen_addr).await?;
    let serving = tokio::spawn(Arc::clone(&server).serve(listener));

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Unable to listen for Ctrl+C: {e}");
    }

    info!("Shutting down");
    server.shutdown();
    reporter.abort();
    listing.abort();
    let _ = serving.await;

    Ok(())
}

/// Installs a `fmt` subscriber; `RUST_LOG` takes precedence over `--debug`.
fn init_logging(debug: bool) {
    let default = if debug {
        "guac_bridge=debug,guac_server=debug"
    } else {
        "guac_bridge=info,guac_server=info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
