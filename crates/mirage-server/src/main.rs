// Copyright 2026 Mirage Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use mirage::backend::ScriptedBackend;
use mirage::config::ConnectionTarget;
use mirage::{Engine, ServiceConfig};
use mirage_server::{router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "mirage",
    about = "Mirage: browser-backed extraction service",
    version,
    after_help = "Every flag falls back to its MIRAGE_* environment variable."
)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service
    Serve {
        /// Interface to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to bind
        #[arg(long, short)]
        port: Option<u16>,
        /// Public origin used in media URLs
        #[arg(long)]
        base_url: Option<String>,
        /// General session pool size
        #[arg(long)]
        pool_size: Option<usize>,
        /// Extra sessions reserved for slow lookups
        #[arg(long)]
        reserved_pool_size: Option<usize>,
        /// Connect to a remote browser over CDP instead of launching one
        #[arg(long, conflicts_with = "chromium_path")]
        browser_ws: Option<String>,
        /// Query option for the remote browser, as key=value (repeatable)
        #[arg(long = "browser-option", value_parser = parse_browser_option, requires = "browser_ws")]
        browser_options: Vec<(String, String)>,
        /// Chromium executable to launch
        #[arg(long)]
        chromium_path: Option<PathBuf>,
        /// Cookie jar applied to the browser at startup
        #[arg(long)]
        cookies: Option<PathBuf>,
        /// Launch a visible browser window
        #[arg(long)]
        headful: bool,
        /// Serve from an empty scripted backend (no browser)
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the resolved configuration as JSON
    Config,
    /// Generate shell completions
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            base_url,
            pool_size,
            reserved_pool_size,
            browser_ws,
            browser_options,
            chromium_path,
            cookies,
            headful,
            dry_run,
        } => {
            init_tracing(cli.log_format);

            let mut config = ServiceConfig::from_env();
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(base_url) = base_url {
                config.base_url = base_url.trim_end_matches('/').to_string();
            }
            if let Some(size) = pool_size {
                config.pool.capacity = size;
            }
            if let Some(size) = reserved_pool_size {
                config.pool.reserved_capacity = size;
            }
            if let Some(endpoint) = browser_ws {
                let options = if browser_options.is_empty() {
                    match config.browser.target {
                        ConnectionTarget::Remote { options, .. } => options,
                        ConnectionTarget::Local { .. } => Vec::new(),
                    }
                } else {
                    browser_options
                };
                config.browser.target = ConnectionTarget::Remote { endpoint, options };
            } else if chromium_path.is_some() || headful {
                config.browser.target = ConnectionTarget::Local {
                    executable: chromium_path,
                    headless: !headful,
                };
            }
            if cookies.is_some() {
                config.browser.cookies_path = cookies;
            }

            serve(config, dry_run).await
        }
        Commands::Config => {
            let config = ServiceConfig::from_env();
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "mirage", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn parse_browser_option(raw: &str) -> Result<(String, String), String> {
    mirage::config::parse_browser_option(raw).ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mirage=info,mirage_server=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn serve(config: ServiceConfig, dry_run: bool) -> Result<()> {
    info!("starting Mirage v{}", env!("CARGO_PKG_VERSION"));

    let engine = if dry_run {
        info!("dry run: using an empty scripted backend");
        Engine::with_backend(Arc::new(ScriptedBackend::new()), &config).await?
    } else {
        Engine::start(&config).await?
    };
    let engine = Arc::new(engine);
    let app = router(Arc::new(AppState::new(Arc::clone(&engine))));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
        })
        .await
        .context("server error")?;

    engine.shutdown().await?;
    info!("Mirage stopped");
    Ok(())
}
