//! Pirun - project sandbox with an HTTP API for editing and running scripts.
//!
//! Usage:
//!   pirun serve [--root DIR] [--addr 127.0.0.1:8080]   # Start HTTP server
//!   pirun init [--root DIR] [--name NAME]              # Write a default .pirun.yaml

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pirun::config::ProjectConfig;
use pirun::http_server::{self, ServerOptions};
use pirun::logging::{self, LogLevel};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pirun")]
#[command(about = "Project sandbox with HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Log level (overrides PIRUN_LOG)
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Project root directory
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Address to listen on (overrides server.addr)
        #[arg(long)]
        addr: Option<String>,

        /// Run timeout in milliseconds (overrides server.run_timeout_ms)
        #[arg(long)]
        run_timeout_ms: Option<u64>,
    },
    /// Write a default project config
    Init {
        /// Project root directory
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Project name
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_logging(args.log_level)?;

    match args.command {
        Commands::Serve {
            root,
            addr,
            run_timeout_ms,
        } => {
            let mut config = ProjectConfig::load(&root)
                .with_context(|| format!("loading config from {}", root.display()))?;
            if let Some(addr) = addr {
                config.server.addr = addr;
            }
            if let Some(ms) = run_timeout_ms {
                if ms == 0 {
                    bail!("--run-timeout-ms must be > 0");
                }
                config.server.run_timeout_ms = ms;
            }

            let state = pirun::build_state(&root, &config)?;
            info!(
                project = %config.name,
                root = %state.files.guard().root().display(),
                timeout_ms = config.server.run_timeout_ms,
                "project loaded"
            );

            let options = ServerOptions {
                max_upload_bytes: config.server.max_upload_bytes,
                request_timeout: config.request_timeout(),
                run_retention: config.run_retention(),
            };
            http_server::run_server(&config.server.addr, state, options).await
        }
        Commands::Init { root, name } => {
            let path = ProjectConfig::path_in(&root);
            if path.exists() {
                bail!("{} already exists", path.display());
            }
            let mut config = ProjectConfig::default();
            if let Some(name) = name {
                config.name = name;
            }
            config.save(&root)?;
            info!("Wrote {}", path.display());
            Ok(())
        }
    }
}
