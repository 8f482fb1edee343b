//! # climate-server
//!
//! Server binary — wires settings, the session manager, the HTTP bridge,
//! and the optional tailnet listener together.

#![deny(unsafe_code)]

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use climate_codex::{ManagerConfig, SessionManager};
use climate_server::server::{router, AppState};
use climate_server::{supervisor, HeaderIdentity, TailnetIdentity};
use climate_settings::Settings;
use climate_tailnet::{PeerResolver, Tailnet, TailnetConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// CliMate server.
#[derive(Parser, Debug)]
#[command(
    name = "climate-server",
    about = "HTTP + SSE bridge for codex app-server, published over a tailnet"
)]
struct Cli {
    /// Config file path (default `~/.climate/config.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the codex binary.
    #[arg(long)]
    codex_bin: Option<PathBuf>,

    /// Loopback listener address.
    #[arg(long)]
    bind_ip: Option<IpAddr>,

    /// Port for both listeners.
    #[arg(long)]
    port: Option<u16>,

    /// Tailnet pre-auth key; providing one enables the tailnet listener.
    #[arg(long)]
    ts_auth_key: Option<String>,

    /// Hostname advertised to the tailnet.
    #[arg(long)]
    ts_hostname: Option<String>,

    /// Tailnet node state directory.
    #[arg(long)]
    ts_state_dir: Option<PathBuf>,

    /// Maximum concurrent codex sessions.
    #[arg(long)]
    max_sessions: Option<usize>,
}

/// Flags override whatever the config file and environment produced.
fn apply_flags(mut settings: Settings, args: &Cli) -> Settings {
    if let Some(bin) = &args.codex_bin {
        settings.codex_bin = bin.display().to_string();
    }
    if let Some(ip) = args.bind_ip {
        settings.bind_ip = ip.to_string();
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(key) = &args.ts_auth_key {
        settings.ts_auth_key = key.clone();
    }
    if let Some(host) = &args.ts_hostname {
        settings.ts_hostname = host.clone();
    }
    if let Some(dir) = &args.ts_state_dir {
        settings.ts_state_dir = dir.display().to_string();
    }
    if let Some(max) = args.max_sessions {
        settings.max_sessions = max;
    }
    settings
}

/// Initialize the global tracing subscriber (stderr, env-filter, compact).
/// Safe to call more than once.
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

/// The connect hint can be empty during early tailnet startup; retry in the
/// background for a while so the operator still gets a usable URL logged.
fn spawn_connect_hint_poll(node: Arc<Tailnet>, shutdown: CancellationToken) {
    drop(tokio::spawn(async move {
        for _ in 0..30 {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            if let Some(hint) = node.connect_hint().await {
                info!("- iOS base URL: {hint}");
                return;
            }
        }
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging();

    let settings = match &args.config {
        Some(path) => climate_settings::load_settings_from_path(path)?,
        None => climate_settings::load_settings()?,
    };
    let settings = apply_flags(settings, &args);

    let metrics_handle = Arc::new(climate_server::metrics::install_recorder());

    let manager = Arc::new(SessionManager::new(ManagerConfig {
        codex_bin: PathBuf::from(&settings.codex_bin),
        max_sessions: settings.max_sessions,
        idle_ttl: Duration::from_secs(settings.idle_ttl_secs),
        ring_capacity: settings.ring_capacity,
    }));

    let shutdown = CancellationToken::new();
    let _sweeper = manager.spawn_idle_sweeper(shutdown.clone());

    let bind_ip: IpAddr = settings
        .bind_ip
        .parse()
        .with_context(|| format!("invalid bind_ip: {}", settings.bind_ip))?;
    let local_addr = SocketAddr::new(bind_ip, settings.port);
    let local_listener = tokio::net::TcpListener::bind(local_addr)
        .await
        .with_context(|| format!("failed to bind http://{local_addr}"))?;

    let mut listeners = Vec::new();
    listeners.push((
        local_listener,
        router(AppState {
            manager: manager.clone(),
            identity: Arc::new(HeaderIdentity::default()),
            metrics_handle: metrics_handle.clone(),
        }),
    ));

    let tailnet = if settings.tailnet_enabled() {
        let node = Arc::new(
            Tailnet::start(TailnetConfig {
                auth_key: settings.ts_auth_key.clone(),
                hostname: settings.ts_hostname.clone(),
                state_dir: PathBuf::from(&settings.ts_state_dir),
                port: settings.port,
                ..TailnetConfig::default()
            })
            .await
            .context("failed to start the tailnet node")?,
        );
        let listener = node
            .bind()
            .await
            .context("failed to bind the tailnet listener")?;
        listeners.push((
            listener,
            router(AppState {
                manager: manager.clone(),
                identity: Arc::new(TailnetIdentity::new(
                    node.clone() as Arc<dyn PeerResolver>
                )),
                metrics_handle: metrics_handle.clone(),
            }),
        ));
        Some(node)
    } else {
        None
    };

    info!("CliMate server is up.");
    info!("- local http: http://{local_addr}");
    if let Some(node) = &tailnet {
        match node.connect_hint().await {
            Some(hint) => info!("- iOS base URL: {hint}"),
            None => {
                info!("- iOS base URL: http://100.x.y.z:{}", settings.port);
                spawn_connect_hint_poll(node.clone(), shutdown.clone());
            }
        }
        info!("- publish: tailnet listener enabled");
    } else {
        info!("- publish: local only (tailnet disabled)");
    }
    info!("Press Ctrl+C to stop.");

    {
        let shutdown = shutdown.clone();
        drop(tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            shutdown.cancel();
        }));
    }

    let served = supervisor::run(listeners, shutdown.clone()).await;
    shutdown.cancel();
    if let Some(node) = tailnet {
        node.close().await;
    }
    served.context("http server failed")?;

    info!("shutdown complete");
    Ok(())
}
