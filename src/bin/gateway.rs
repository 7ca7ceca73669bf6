//! OpenGate Gateway
//!
//! Loads configuration, starts the delivery recovery worker and serves the
//! WebSocket control plane until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use opengate::config::{apply_env_overrides, load_config, load_config_from_path, validate_config};
use opengate::gateway::{server, GatewayCore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "opengate-gateway",
    author = "OpenGate Contributors",
    version,
    about = "Resilient control gateway for AI agent backends"
)]
struct Args {
    /// Config file (JSON5 or TOML); defaults to the standard config path
    #[arg(long, short, env = "OPENGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address override
    #[arg(long)]
    bind: Option<String>,

    /// Port override
    #[arg(long, short)]
    port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "opengate=info,tower_http=warn".into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting OpenGate Gateway v{}", opengate::VERSION);

    let mut config = match &args.config {
        Some(path) => {
            let mut config = load_config_from_path(path)
                .with_context(|| format!("loading {}", path.display()))?;
            apply_env_overrides(&mut config);
            config
        }
        None => load_config().context("loading configuration")?,
    };
    if let Some(bind) = args.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }

    let validation = validate_config(&config);
    for issue in &validation.warnings {
        warn!("config: {}", issue);
    }
    if !validation.valid {
        for issue in &validation.errors {
            error!("config: {}", issue);
        }
        bail!("configuration has {} error(s)", validation.errors.len());
    }

    let core = Arc::new(GatewayCore::from_config(&config)?);
    info!(
        channels = ?core.channels.ids(),
        tools = core.tools.count(),
        state_dir = %config.resolved_state_dir().display(),
        "gateway core ready"
    );
    let _event_log = core.bus.log_events();

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(core.delivery.clone().run_worker(shutdown.clone()));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        signal.cancel();
    });

    let served = server::serve(core, shutdown.clone()).await;
    shutdown.cancel();
    let _ = worker.await;
    served?;
    Ok(())
}
