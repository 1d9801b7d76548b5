//! ctme - MeterEye multi-camera monitoring service
//!
//! `ctme run` starts the camera workers, exporter fan-out, and supervisor;
//! `ctme migrate` converts a legacy JSON configuration to YAML.

use clap::{Parser, Subcommand};
use metereye::config;
use metereye::export::Exporters;
use metereye::registry::Registry;
use metereye::stream::FfmpegSource;
use metereye::supervisor::Supervisor;
use metereye::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Total time allowed for the graceful drain on shutdown
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_IO: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "ctme", about = "Multi-camera seven-segment meter monitoring", version)]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the monitoring service (default)
    Run,
    /// Convert a legacy JSON configuration to YAML
    Migrate {
        /// Path to the legacy JSON file (defaults to config.json next to
        /// the YAML config)
        #[arg(long)]
        json: Option<PathBuf>,
    },
}

fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "metereye=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Some(Command::Migrate { json }) => run_migrate(cli.config, json),
        Some(Command::Run) | None => run_service(cli.config),
    };
    std::process::exit(code);
}

fn run_migrate(config: Option<PathBuf>, json: Option<PathBuf>) -> i32 {
    let yaml_path = config.unwrap_or_else(config::default_config_path);
    let json_path = json.unwrap_or_else(|| {
        yaml_path
            .parent()
            .map(|dir| dir.join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    });

    match config::migrate::migrate_to_yaml(&json_path, &yaml_path) {
        Ok(migrated) => {
            tracing::info!(
                cameras = migrated.cameras.len(),
                path = %yaml_path.display(),
                "Migration completed"
            );
            EXIT_OK
        }
        Err(e) => {
            tracing::error!(error = %e, "Migration failed");
            exit_code_for(&e)
        }
    }
}

fn run_service(config: Option<PathBuf>) -> i32 {
    let config_path = config::resolve_config_path(config);
    let snapshot = match config::load(&config_path) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            return exit_code_for(&e);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start runtime");
            return EXIT_IO;
        }
    };

    runtime.block_on(serve(config_path, snapshot))
}

async fn serve(config_path: PathBuf, snapshot: config::AppConfig) -> i32 {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        cameras = snapshot.cameras.len(),
        "Starting MeterEye"
    );

    let registry = Arc::new(Registry::new(snapshot.clone()));
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let exporters = Exporters::start(&registry, &snapshot.export, stop_rx);
    let mut supervisor = Supervisor::new(FfmpegSource::new(), registry.clone(), config_path);
    supervisor.start().await;

    let interrupted = wait_for_shutdown(&mut supervisor).await;

    tracing::info!("Shutting down");
    supervisor.shutdown().await;
    let _ = stop_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_DRAIN, exporters.join()).await.is_err() {
        tracing::warn!("Exporter drain exceeded {}s, abandoning", SHUTDOWN_DRAIN.as_secs());
    }

    if interrupted {
        EXIT_INTERRUPTED
    } else {
        EXIT_OK
    }
}

/// Block until SIGINT/SIGTERM; SIGHUP triggers a config reload in place.
///
/// Returns true when the service was interrupted by a signal.
async fn wait_for_shutdown(supervisor: &mut Supervisor<FfmpegSource>) -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGHUP handler");
                let _ = tokio::signal::ctrl_c().await;
                return true;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return true;
            }
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return true,
                _ = terminate.recv() => return true,
                _ = hangup.recv() => {
                    match supervisor.reload().await {
                        Ok(()) => tracing::info!("Reload applied"),
                        Err(e) => tracing::error!(error = %e, "Reload failed, keeping previous configuration"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = supervisor;
        let _ = tokio::signal::ctrl_c().await;
        return true;
    }
}

fn exit_code_for(error: &Error) -> i32 {
    match error {
        Error::Io(_) => EXIT_IO,
        _ => EXIT_CONFIG,
    }
}
