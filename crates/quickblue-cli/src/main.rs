use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quickblue_core::{MethodCall, QuickBlue, ScanResult};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "quickblue")]
#[command(author, version, about = "Bridge BLE GATT operations over JSON lines", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (default: <config dir>/quickblue/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether a powered Bluetooth radio is available
    Available,

    /// Print advertisements as JSON lines
    Scan {
        /// Scan timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Only report devices advertising this service (e.g. 180f)
        #[arg(short, long)]
        service: Option<String>,
    },

    /// Read method calls from stdin and write replies and events to stdout, one JSON object per line
    Serve,
}

/// One line written by `serve`, besides connector events.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Output {
    /// A method call was accepted.
    Result {
        method: &'static str,
        value: serde_json::Value,
    },
    /// A method call was rejected.
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        method: Option<&'static str>,
        message: String,
    },
    /// An advertisement was received.
    ScanResult(ScanResult),
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(value).context("Failed to serialize output")?
    );
    Ok(())
}

async fn handle_line(bridge: &QuickBlue, line: &str) -> Output {
    let call = match MethodCall::from_json(line) {
        Ok(call) => call,
        Err(e) => {
            return Output::Error {
                method: None,
                message: e.to_string(),
            };
        }
    };
    let method = call.name();
    match bridge.handle_method_call(call).await {
        Ok(value) => Output::Result { method, value },
        Err(e) => Output::Error {
            method: Some(method),
            message: e.to_string(),
        },
    }
}

async fn serve(bridge: &QuickBlue) -> Result<()> {
    let mut events = bridge.subscribe();
    let mut results = bridge.subscribe_scan_results();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Serving method calls on stdin");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                print_json(&handle_line(bridge, &line).await)?;
            }
            event = events.recv() => match event {
                Ok(event) => print_json(&event)?,
                Err(RecvError::Lagged(n)) => warn!("Dropped {} events", n),
                Err(RecvError::Closed) => break,
            },
            result = results.recv() => match result {
                Ok(result) => print_json(&Output::ScanResult(result))?,
                Err(RecvError::Lagged(n)) => warn!("Dropped {} scan results", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("stdin closed, shutting down");
    bridge.shutdown().await;
    Ok(())
}

async fn scan(bridge: &QuickBlue, timeout: u64, service: Option<&str>) -> Result<()> {
    let mut results = bridge.subscribe_scan_results();
    bridge
        .start_scan(service)
        .await
        .context("Failed to start scan")?;
    info!("Scanning for {}s...", timeout);

    let deadline = tokio::time::sleep(Duration::from_secs(timeout));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            result = results.recv() => match result {
                Ok(result) => print_json(&result)?,
                Err(RecvError::Lagged(n)) => warn!("Dropped {} scan results", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    bridge.stop_scan().await.context("Failed to stop scan")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    // Initialize tracing
    // Logs go to stderr so stdout carries only JSON
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(config.log_level.as_deref().unwrap_or("info"))
        })
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let bridge = QuickBlue::btleplug(config.core.clone())
        .await
        .context("Failed to open Bluetooth adapter")?;

    match cli.command {
        Commands::Available => {
            println!("{}", bridge.is_available().await);
        }
        Commands::Scan { timeout, service } => {
            scan(&bridge, config.scan_timeout(timeout), service.as_deref()).await?;
        }
        Commands::Serve => {
            serve(&bridge).await?;
        }
    }

    Ok(())
}
