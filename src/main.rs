use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use transumate_gateway::config::{DEFAULT_CONFIG_FILE, load_config, resolve_secret};
use transumate_gateway::logging::init_logging;
use transumate_gateway::provisioning;
use transumate_gateway::worker::ProcessLauncher;
use transumate_gateway::{Gateway, GatewayHandle};

/// Local translation gateway.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Port to listen on (overrides the config file).
    #[arg(long)]
    port: Option<u16>,

    /// CPU allocation limit in percent (overrides the config file).
    #[arg(long)]
    cpu_limit: Option<f64>,

    /// Bearer secret clients must present (overrides the config file).
    #[arg(long, env = "TRANSUMATE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Start even if the worker script or model files are missing.
    #[arg(long)]
    skip_provisioning_check: bool,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = load_config(&cli.config);
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(limit) = cli.cpu_limit {
        config.cpu_allocation_limit = limit;
    }
    if let Some(secret) = cli.secret {
        config.auth_secret = Some(secret);
    }
    config.validate().context("invalid configuration")?;

    if cli.skip_provisioning_check {
        tracing::warn!("provisioning check skipped");
    } else {
        provisioning::verify(&config.model_dir, &config.worker)
            .context("setup has not completed; run the installer first")?;
    }

    let (secret, generated) = resolve_secret(&config);
    if generated {
        tracing::info!(secret = %secret, "generated bearer secret for this session");
    }

    let launcher = Arc::new(ProcessLauncher::new(config.worker.clone()));
    let gateway = Gateway::bind(&config, secret, launcher)?;
    actix_web::rt::spawn(control_signals(gateway.handle()));

    gateway.run().await.context("gateway terminated with an error")
}

/// SIGUSR1 pauses, SIGUSR2 resumes, SIGINT and SIGTERM stop the gateway.
#[cfg(unix)]
async fn control_signals(handle: GatewayHandle) {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    let install = |kind: SignalKind| -> Option<Signal> {
        signal(kind)
            .inspect_err(|e| tracing::warn!(error = %e, "failed to install signal handler"))
            .ok()
    };
    let (Some(mut pause), Some(mut resume), Some(mut interrupt), Some(mut terminate)) = (
        install(SignalKind::user_defined1()),
        install(SignalKind::user_defined2()),
        install(SignalKind::interrupt()),
        install(SignalKind::terminate()),
    ) else {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop().await;
        }
        return;
    };
    loop {
        tokio::select! {
            Some(()) = pause.recv() => handle.pause(),
            Some(()) = resume.recv() => handle.resume(),
            Some(()) = interrupt.recv() => break,
            Some(()) = terminate.recv() => break,
            else => break,
        }
    }
    handle.stop().await;
}

#[cfg(not(unix))]
async fn control_signals(handle: GatewayHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        handle.stop().await;
    }
}
