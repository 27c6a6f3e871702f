//! Sluice - on-device TLS-intercepting proxy.
//!
//! Loads the task configuration, makes sure the root CA exists, opens the
//! session database and serves the configured listeners until interrupted.
//! On Unix, `SIGHUP` restarts the listeners in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sluice_core::config::default_data_dir;
use sluice_core::{DefaultStrategy, HostRule, TaskConfig};
use sluice_proxy::{CaManager, CertificateAuthority, ProxyServer, Task};
use sluice_storage::{Database, DB_FILE};

/// Sluice - record HTTP(S) traffic from this device
#[derive(Parser, Debug)]
#[command(name = "sluice", version, about)]
struct Args {
    /// Config file (JSON). Defaults to <data-dir>/config.json
    #[arg(long)]
    config: Option<PathBuf>,

    /// Loopback listener port
    #[arg(long)]
    port: Option<u16>,

    /// LAN listener port
    #[arg(long)]
    lan_port: Option<u16>,

    /// Also listen on all interfaces
    #[arg(long)]
    lan: bool,

    /// Relay CONNECT tunnels without intercepting TLS
    #[arg(long)]
    no_intercept: bool,

    /// What host rules mean: "direct" skips matches, "copy" records only matches
    #[arg(long)]
    strategy: Option<DefaultStrategy>,

    /// Host rule pattern, may be repeated (e.g. "*.example.com")
    #[arg(long = "rule", value_name = "PATTERN")]
    rules: Vec<String>,

    /// Directory for the database, CA, captures and logs
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write the CA certificate to this path (PEM, or DER for .der/.cer) and exit
    #[arg(long, value_name = "PATH")]
    export_ca: Option<PathBuf>,
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args, log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sluice={},warn", log_level)));

    if std::fs::create_dir_all(log_dir).is_ok() {
        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(5)
            .filename_prefix("sluice")
            .filename_suffix("log")
            .build(log_dir)
            .ok();

        if let Some(appender) = file_appender {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            tracing::info!("Logging to {:?}", log_dir);
            return Some(guard);
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Layers command-line flags over the file configuration.
fn apply_args(mut config: TaskConfig, args: &Args) -> TaskConfig {
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(port) = args.lan_port {
        config = config.with_lan_port(port);
    }
    if args.lan {
        config = config.with_lan(true);
    }
    if args.no_intercept {
        config = config.with_intercept_tls(false);
    }
    if let Some(strategy) = args.strategy {
        config = config.with_strategy(strategy);
    }
    for pattern in &args.rules {
        config = config.with_rule(HostRule::new(pattern.as_str()));
    }
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    config
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let data_dir = args.data_dir.clone().unwrap_or_else(default_data_dir);

    let _log_guard = init_logging(&args, &data_dir.join("logs"));
    tracing::info!("Starting Sluice...");
    tracing::debug!("Args: {:?}", args);

    let config_path = args.config.clone().unwrap_or_else(|| data_dir.join("config.json"));
    let config = TaskConfig::load(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let config = apply_args(config, &args);
    config.validate()?;

    let ca_manager = CaManager::new(config.ca_dir_in(&data_dir));
    let bundle = ca_manager.ensure_ca()?;
    tracing::info!("CA certificate: {:?}", ca_manager.cert_path());

    if let Some(dest) = &args.export_ca {
        ca_manager.export_cert(dest)?;
        return Ok(());
    }

    let db = Database::with_path(data_dir.join(DB_FILE))?;
    let capture_dir = config.capture_dir_in(&data_dir);
    let workers = config.workers;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(workers) = workers {
        runtime.worker_threads(workers);
    }
    let runtime = runtime.build().context("building runtime")?;

    runtime.block_on(async move {
        let task = Task::builder(config)
            .authority(CertificateAuthority::from_bundle(&bundle)?)
            .store(Arc::new(db))
            .capture_dir(Some(capture_dir))
            .build()?;
        serve(task).await
    })?;

    tracing::info!("Sluice shutting down");
    Ok(())
}

/// Runs the listeners until Ctrl-C.
async fn serve(task: Arc<Task>) -> anyhow::Result<()> {
    let server = ProxyServer::new(task.clone());
    server.start()?;
    for status in server.statuses() {
        tracing::info!(
            "listener {} on {}: {}{}",
            status.name,
            status.local_addr.unwrap_or(status.address),
            status.state,
            status.note.map(|n| format!(" ({n})")).unwrap_or_default()
        );
    }

    wait_for_shutdown(&server).await;

    server.stop().await;
    task.recorder().flush().await;
    let counters = task.counters();
    tracing::info!(
        connections = counters.connections(),
        upload = counters.upload(),
        download = counters.download(),
        "traffic totals"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(server: &ProxyServer) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!("SIGHUP handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received, restarting listeners");
                if let Err(e) = server.restart().await {
                    tracing::error!("restart failed: {}", e);
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_server: &ProxyServer) {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_values() {
        let args = Args::parse_from([
            "sluice",
            "--port",
            "9000",
            "--lan",
            "--no-intercept",
            "--strategy",
            "copy",
            "--rule",
            "*.example.com",
            "--rule",
            "api.test",
            "--workers",
            "2",
        ]);
        let config = apply_args(TaskConfig::default(), &args);

        let loopback = config.listeners.iter().find(|l| l.name == "loopback").unwrap();
        assert_eq!(loopback.port, 9000);
        assert!(config.listeners.iter().find(|l| l.name == "lan").unwrap().enabled);
        assert!(!config.intercept_tls);
        assert_eq!(config.default_strategy, DefaultStrategy::Copy);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.workers, Some(2));
    }

    #[test]
    fn no_flags_keep_defaults() {
        let args = Args::parse_from(["sluice"]);
        assert_eq!(apply_args(TaskConfig::default(), &args), TaskConfig::default());
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        assert!(Args::try_parse_from(["sluice", "--strategy", "mirror"]).is_err());
    }
}
