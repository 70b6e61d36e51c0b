//! Command handlers for CLI subcommands.

use std::path::Path;

use comlink_connection::ConnectionInfo;
use comlink_core::{CoreError, Gateway, GatewayConfig, StatePaths};
use comlink_persistence::{read_json_optional, DeliveryStatus, QueueStore};
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands};

/// Result type for command operations.
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Exit code for a gateway stopped by an unavailable store.
pub const EXIT_STORAGE: i32 = 2;

/// Execute a CLI command; no command runs the gateway.
pub async fn execute(cli: &Cli) -> Result<()> {
    let paths = cli.paths();
    let config_file = cli.config_file();

    match &cli.command {
        None | Some(Commands::Run) => cmd_run(&config_file, paths).await,
        Some(Commands::Init { force }) => cmd_init(&config_file, &paths, *force),
        Some(Commands::Check) => cmd_check(&config_file),
        Some(Commands::Status { json }) => cmd_status(&paths, *json),
    }
}

async fn cmd_run(config_file: &Path, paths: StatePaths) -> Result<()> {
    let config = GatewayConfig::load(config_file)?;
    if config.connections.is_empty() {
        warn!(path = %config_file.display(), "no connections configured");
    }

    let mut gateway = Gateway::new(config, paths)?;
    gateway.start().await?;

    let fatal = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "cannot listen for ctrl-c");
            }
            info!("interrupted, shutting down");
            None
        }
        fatal = gateway.fatal() => fatal,
    };

    gateway.shutdown().await?;
    match fatal {
        Some(e) => {
            error!(error = %e, "gateway stopped");
            Err(e.into())
        }
        None => Ok(()),
    }
}

fn cmd_init(config_file: &Path, paths: &StatePaths, force: bool) -> Result<()> {
    if config_file.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            config_file.display()
        )
        .into());
    }
    paths.ensure()?;
    GatewayConfig::default().save(config_file)?;
    println!("Wrote {}", config_file.display());
    Ok(())
}

fn cmd_check(config_file: &Path) -> Result<()> {
    if !config_file.exists() {
        println!("{} not found, using defaults", config_file.display());
    }
    let config = GatewayConfig::load(config_file)?;

    println!("Connections:");
    for spec in &config.connections {
        println!("  {:<16} {}", spec.id, spec.transport.kind());
    }
    println!("Channels:");
    for channel in &config.channels {
        println!(
            "  {:<16} {:<10} via {}",
            channel.name,
            format!("{:?}", channel.kind).to_lowercase(),
            channel.connection
        );
        let targets = config.allowed_targets(&channel.name);
        if !targets.is_empty() {
            println!("  {:<16} -> {}", "", targets.join(", "));
        }
    }
    println!("Workers: {}", config.workers);
    println!("OK");
    Ok(())
}

fn cmd_status(paths: &StatePaths, json: bool) -> Result<()> {
    let connections: Vec<ConnectionInfo> =
        read_json_optional(&paths.connections_file())?.unwrap_or_default();

    let stored = QueueStore::new(paths.root()).list()?;
    let count = |status: DeliveryStatus| stored.iter().filter(|s| s.status == status).count();
    let (pending, in_flight, completed, failed) = (
        count(DeliveryStatus::Pending),
        count(DeliveryStatus::InFlight),
        count(DeliveryStatus::Completed),
        count(DeliveryStatus::Failed),
    );

    if json {
        let out = serde_json::json!({
            "connections": connections,
            "queue": {
                "pending": pending,
                "in_flight": in_flight,
                "completed": completed,
                "failed": failed,
            },
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if connections.is_empty() {
        println!("No connection snapshot in {}", paths.root().display());
    } else {
        println!("{:<16} {:<8} {:<14} ENDPOINT", "ID", "KIND", "STATE");
        for info in &connections {
            println!(
                "{:<16} {:<8} {:<14} {}",
                info.id.as_str(),
                info.kind.to_string(),
                info.state.to_string(),
                info.endpoint
            );
            if let Some(err) = &info.last_error {
                println!("{:<16} last error: {}", "", err);
            }
        }
    }
    println!(
        "Queue: {} pending, {} in flight, {} completed, {} failed",
        pending, in_flight, completed, failed
    );
    Ok(())
}

/// Whether `err` means the state directory could not be used.
pub fn is_storage_error(err: &(dyn std::error::Error + 'static)) -> bool {
    err.downcast_ref::<CoreError>()
        .is_some_and(CoreError::is_storage_unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn cli(dir: &Path, args: &[&str]) -> Cli {
        let state = dir.to_string_lossy().to_string();
        let mut argv = vec!["comlink", "--state-dir", state.as_str()];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[tokio::test]
    async fn test_init_writes_default_config_once() {
        let dir = tempdir().unwrap();
        let init = cli(dir.path(), &["init"]);
        execute(&init).await.unwrap();
        assert!(StatePaths::new(dir.path()).config_file().exists());

        assert!(execute(&init).await.is_err());
        execute(&cli(dir.path(), &["init", "--force"])).await.unwrap();
        execute(&cli(dir.path(), &["check"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_on_empty_state_dir() {
        let dir = tempdir().unwrap();
        execute(&cli(dir.path(), &["status"])).await.unwrap();
        execute(&cli(dir.path(), &["status", "--json"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("bad.json");
        std::fs::write(&file, r#"{"workers": 0}"#).unwrap();
        let path = file.to_string_lossy().to_string();
        assert!(execute(&cli(dir.path(), &["check", "-c", &path]))
            .await
            .is_err());
    }
}
