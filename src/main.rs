//! session-mitm
//!
//! Runs the MITM proxy with the sessions named in a config file or on the
//! command line.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌────────────────────────────────────────────────────────┐
//!                    │                      SESSION MITM                      │
//!   Browser          │  ┌──────────┐   ┌──────────┐   ┌───────────────────┐   │
//!   ─────────────────┼─▶│  proxy   │──▶│ handlers │──▶│ agent + pool      │───┼──▶ Origin
//!   (Basic user:id)  │  │ listeners│   │ request/ │   │ h1 sockets,       │   │
//!                    │  │ CONNECT  │   │ upgrade/ │   │ shared h2 sessions│   │
//!                    │  └────┬─────┘   │ push     │   └─────────┬─────────┘   │
//!                    │       │         └────┬─────┘             │             │
//!                    │       ▼              ▼                   ▼             │
//!                    │  ┌──────────┐   ┌──────────┐   ┌───────────────────┐   │
//!                    │  │ session  │   │ context  │   │ dns (DoT / system)│   │
//!                    │  │ registry │   │ cache    │   │ net (TLS, tunnel) │   │
//!                    │  └──────────┘   └──────────┘   └───────────────────┘   │
//!                    └────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use session_mitm::cache::ResponseCache;
use session_mitm::config::{load_config, ProxyConfig, SessionConfig};
use session_mitm::observability::{logging, metrics};
use session_mitm::proxy::{CertificateAuthority, MitmProxy};
use session_mitm::session::{RequestSession, SessionOptions};

#[derive(Debug, Parser)]
#[command(name = "session-mitm", version, about = "Session-aware MITM proxy for a controlled browser")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port of the plain HTTP listener (overrides `listener.bind_address`).
    #[arg(short, long)]
    port: Option<u16>,

    /// Register a session with this id (repeatable).
    #[arg(short, long = "session")]
    sessions: Vec<String>,

    /// Where to write the CA certificate browsers should trust.
    #[arg(long, default_value = "session-mitm-ca.pem")]
    ca_out: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(port) = args.port {
        let host = config
            .listener
            .bind_address
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        config.listener.bind_address = format!("{}:{}", host, port);
    }
    for id in &args.sessions {
        config.sessions.push(SessionConfig {
            id: id.clone(),
            upstream_proxy_url: None,
            upstream_proxy_use_system_dns: false,
            bypass_all_with_empty_response: false,
            isolated: false,
        });
    }

    logging::init_logging(config.observability.log_format);
    tracing::info!("session-mitm v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let authority = Arc::new(CertificateAuthority::from_config(config.ca.as_ref())?);
    authority.write_cert_pem(&args.ca_out)?;

    let proxy = MitmProxy::start(&config.listener, authority).await?;
    let cache = config.cache.enabled.then(ResponseCache::new);
    for session_config in &config.sessions {
        let session = RequestSession::new(
            session_config.id.clone(),
            SessionOptions::from(session_config),
            &config,
            cache.clone(),
        )
        .await?;
        proxy.register_session(session, session_config.isolated);
    }

    println!("http proxy:   {}", proxy.local_addr());
    println!("tls listener: {}", proxy.https_port());
    println!("h2 listener:  {}", proxy.http2_port());
    println!("CA cert:      {}", args.ca_out.display());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    proxy.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
