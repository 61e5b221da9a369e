mod engines;
mod ingress;
mod logging;
mod ports;
mod processor;
mod proxy;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use tye_core::config::TyeConfig;
use tye_core::supervisor::HostOptions;

use processor::ApplicationProcessor;

#[derive(Parser)]
#[command(name = "tye")]
#[command(about = "Run a multi-service application locally", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch every service and route traffic until Ctrl+C
    Run {
        /// Config file or directory to search from
        path: Option<PathBuf>,
        /// Skip the build step for project services
        #[arg(long)]
        no_build: bool,
        /// Do not run container services
        #[arg(long)]
        no_docker: bool,
        /// Seconds a replica gets to exit before it is killed
        #[arg(long, default_value_t = 5)]
        grace_period: u64,
        /// Log filter used when RUST_LOG is unset
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Load and validate the config without running anything
    Validate {
        /// Config file or directory to search from
        path: Option<PathBuf>,
        /// Print the resolved application as JSON
        #[arg(long)]
        json: bool,
    },
}

fn load(path: Option<PathBuf>) -> anyhow::Result<(PathBuf, TyeConfig)> {
    let start = match path {
        Some(p) => p,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    TyeConfig::discover(&start).with_context(|| format!("failed to load config from {}", start.display()))
}

/// Relative paths in the config resolve against its directory.
fn context_dir(file: &Path) -> anyhow::Result<PathBuf> {
    let dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::path::absolute(dir).with_context(|| format!("cannot resolve {}", dir.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path, json } => {
            let (file, config) = load(path)?;
            if json {
                let app = config.to_application(&context_dir(&file)?);
                println!("{}", serde_json::to_string_pretty(&app.snapshot())?);
                return Ok(());
            }
            println!(
                "{}: '{}' is valid ({} services, {} ingress)",
                file.display(),
                config.name.as_deref().unwrap_or("unnamed"),
                config.services.len(),
                config.ingress.len()
            );
            Ok(())
        }
        Commands::Run {
            path,
            no_build,
            no_docker,
            grace_period,
            log_level,
        } => {
            logging::init(&log_level);

            let (file, config) = load(path)?;
            info!(config = %file.display(), services = config.services.len(), "config loaded");
            let app = Arc::new(config.to_application(&context_dir(&file)?));

            let options = HostOptions {
                grace_period: Duration::from_secs(grace_period),
                build: !no_build,
                docker: !no_docker,
                ..HostOptions::default()
            };
            let running = ApplicationProcessor::new(options).start(app).await?;

            info!("press Ctrl+C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl+C")?;
            running.stop().await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_dir_is_absolute() {
        let dir = context_dir(Path::new("sub/tye.yaml")).unwrap();
        assert!(dir.is_absolute());
        assert!(dir.ends_with("sub"));

        let bare = context_dir(Path::new("tye.yaml")).unwrap();
        assert_eq!(bare, std::env::current_dir().unwrap());
    }
}
