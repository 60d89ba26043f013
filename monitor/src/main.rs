//! Rotonde bus monitor
//!
//! Connects to a bus, logs the events it is told to watch and every
//! definition change, and optionally negotiates actions:
//!
//! Usage:
//!   rotonde-monitor --url ws://localhost:4224/ --event IMU
//!   rotonde-monitor --action 'LED={"on":true}' --expect LED_STATUS
//!
//! Runs until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use rotonde_client::RotondeClient;
use rotonde_monitor::{attach_loggers, format_event, negotiate, Args};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Rotonde monitor starting...");
    let client = RotondeClient::with_config(args.client_config());
    attach_loggers(&client, &args);

    client.connect();
    client
        .wait_connected()
        .await
        .with_context(|| format!("Failed to connect to {}", args.url))?;

    for event in negotiate(&client, &args).await? {
        info!("Awaited {}", format_event(&event));
    }

    println!("\n========================================");
    println!("  Rotonde Monitor Running");
    println!("========================================");
    println!("  Bus:     {}", args.url);
    println!("  Events:  {}", args.events.join(", "));
    println!("  Stop with Ctrl-C");
    println!("========================================\n");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    client.disconnect();
    Ok(())
}
