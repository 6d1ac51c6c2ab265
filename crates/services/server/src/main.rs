//! inferd server binary
//!
//! Wires the request-lifecycle engine to the enabled transports.
//!
//! # Usage
//!
//! ```bash
//! # stdio only (pipe-friendly)
//! inferd --stdio
//!
//! # HTTP on the default port plus TCP on a custom one
//! inferd --http --tcp=9400
//!
//! # with a configuration file
//! inferd --http --config /etc/inferd.toml
//!
//! # With logging
//! RUST_LOG=debug inferd --stdio
//! ```
//!
//! Exit codes: 0 success, 1 configuration error, 2 unrecoverable
//! runtime error.

use clap::Parser;
use inferd_core::accel::Accelerator;
use inferd_core::{Config, Engine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Grace period for workers to drain after a shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// The accelerator backend: the vendor library when this build links
/// it, the deterministic simulator otherwise.
#[cfg(feature = "vendor")]
fn accelerator() -> Arc<dyn Accelerator> {
    Arc::new(inferd_core::accel::vendor::VendorAccelerator::new())
}

#[cfg(not(feature = "vendor"))]
fn accelerator() -> Arc<dyn Accelerator> {
    Arc::new(inferd_core::accel::SimAccelerator::new())
}

#[derive(Parser, Debug)]
#[command(name = "inferd", version, about = "Multi-transport JSON-RPC front-end for the inference accelerator")]
struct Cli {
    /// Serve JSON-RPC over stdin/stdout
    #[arg(long)]
    stdio: bool,

    /// Serve length-prefixed JSON-RPC over TCP (optionally on PORT)
    #[arg(long, value_name = "PORT", num_args = 0..=1, require_equals = true, default_missing_value = "default")]
    tcp: Option<String>,

    /// Serve JSON-RPC datagrams over UDP (optionally on PORT)
    #[arg(long, value_name = "PORT", num_args = 0..=1, require_equals = true, default_missing_value = "default")]
    udp: Option<String>,

    /// Serve JSON-RPC over HTTP with SSE streaming (optionally on PORT)
    #[arg(long, value_name = "PORT", num_args = 0..=1, require_equals = true, default_missing_value = "default")]
    http: Option<String>,

    /// Serve JSON-RPC over WebSocket (optionally on PORT)
    #[arg(long, value_name = "PORT", num_args = 0..=1, require_equals = true, default_missing_value = "default")]
    websocket: Option<String>,

    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn parse_port(flag: &str, value: &Option<String>, default: u16) -> Result<Option<u16>, String> {
    match value.as_deref() {
        None => Ok(None),
        Some("default") => Ok(Some(default)),
        Some(raw) => raw
            .parse::<u16>()
            .map(Some)
            .map_err(|_| format!("--{flag} expects a port number, got \"{raw}\"")),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("configuration error: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let tcp_port = parse_port("tcp", &cli.tcp, config.transports.tcp.port);
    let udp_port = parse_port("udp", &cli.udp, config.transports.udp.port);
    let http_port = parse_port("http", &cli.http, config.transports.http.port);
    let ws_port = parse_port("websocket", &cli.websocket, config.transports.ws.port);
    let (tcp_port, udp_port, http_port, ws_port) =
        match (tcp_port, udp_port, http_port, ws_port) {
            (Ok(a), Ok(b), Ok(c), Ok(d)) => (a, b, c, d),
            (Err(e), ..) | (_, Err(e), ..) | (_, _, Err(e), _) | (_, _, _, Err(e)) => {
                error!("{e}");
                std::process::exit(1);
            }
        };

    if !cli.stdio
        && tcp_port.is_none()
        && udp_port.is_none()
        && http_port.is_none()
        && ws_port.is_none()
    {
        error!("no transport enabled; pass at least one of --stdio, --tcp, --udp, --http, --websocket");
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        stdio = cli.stdio,
        tcp = ?tcp_port,
        udp = ?udp_port,
        http = ?http_port,
        websocket = ?ws_port,
        "inferd starting"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("inferd")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to build runtime: {e}");
            std::process::exit(2);
        }
    };

    let exit_code = runtime.block_on(run(cli.stdio, tcp_port, udp_port, http_port, ws_port, config));
    std::process::exit(exit_code);
}

async fn run(
    stdio: bool,
    tcp_port: Option<u16>,
    udp_port: Option<u16>,
    http_port: Option<u16>,
    ws_port: Option<u16>,
    config: Config,
) -> i32 {
    let sweep_interval = Duration::from_secs(config.registry.sweep_interval_secs.max(1));
    let engine = Engine::new(config.clone(), accelerator());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut transports: Vec<tokio::task::JoinHandle<std::io::Result<()>>> = Vec::new();
    if stdio {
        transports.push(tokio::spawn(inferd_stdio::serve(
            Arc::clone(&engine),
            shutdown_rx.clone(),
        )));
    }
    if let Some(port) = tcp_port {
        transports.push(tokio::spawn(inferd_tcp::serve(
            Arc::clone(&engine),
            port,
            shutdown_rx.clone(),
        )));
    }
    if let Some(port) = udp_port {
        let mut udp_config = config.transports.udp.clone();
        udp_config.port = port;
        transports.push(tokio::spawn(inferd_udp::serve(
            Arc::clone(&engine),
            udp_config,
            shutdown_rx.clone(),
        )));
    }
    if let Some(port) = http_port {
        transports.push(tokio::spawn(inferd_http::serve(
            Arc::clone(&engine),
            port,
            shutdown_rx.clone(),
        )));
    }
    if let Some(port) = ws_port {
        let mut ws_config = config.transports.ws.clone();
        ws_config.port = port;
        transports.push(tokio::spawn(inferd_ws::serve(
            Arc::clone(&engine),
            ws_config,
            shutdown_rx.clone(),
        )));
    }

    // periodic registry expiry sweep
    let sweep_engine = Arc::clone(&engine);
    let mut sweep_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = sweep_shutdown.changed() => break,
                _ = ticker.tick() => sweep_engine.registry().sweep(),
            }
        }
    });

    info!("inferd ready");

    let (exit_code, finished_idx) = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            (0, None)
        }
        (finished, idx, _) = futures::future::select_all(&mut transports) => {
            let code = match finished {
                Ok(Ok(())) => {
                    info!("transport finished, shutting down");
                    0
                }
                Ok(Err(e)) => {
                    error!("transport failed: {e}");
                    2
                }
                Err(e) => {
                    error!("transport task panicked: {e}");
                    2
                }
            };
            (code, Some(idx))
        }
    };
    if let Some(idx) = finished_idx {
        transports.remove(idx);
    }

    // signal every loop, then give workers a bounded drain window
    let _ = shutdown_tx.send(true);
    let grace = tokio::time::timeout(
        SHUTDOWN_GRACE,
        futures::future::join_all(transports),
    )
    .await;
    if grace.is_err() {
        info!("grace period elapsed with transports still running");
    }

    let engine_for_shutdown = Arc::clone(&engine);
    let drained = tokio::task::spawn_blocking(move || engine_for_shutdown.shutdown());
    if tokio::time::timeout(SHUTDOWN_GRACE, drained).await.is_err() {
        info!("accelerator worker still busy after grace period, exiting anyway");
    }

    info!("inferd stopped");
    exit_code
}
