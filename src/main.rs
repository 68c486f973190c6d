//! FlowPay agent entrypoint.
//!
//! Fetches each URL given on the command line, paying for 402-priced
//! resources as negotiated, then closes any open payment streams and prints
//! a JSON report of outcomes, refunds, metrics and spending.
//!
//! Payments run against a simulated ledger seeded from the config file.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` names the config file
//! - `RUST_LOG` controls log verbosity
//! - `FLOWPAY_*` variables fill config fields left out of the file

use clap::Parser;
use dotenvy::dotenv;

use flowpay::config::{AgentConfig, CliArgs};
use flowpay::run::{self, Agent};
use flowpay::util::{SigDown, Telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let _telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let cli_args = CliArgs::parse();
    let config = AgentConfig::load(&cli_args)?;
    let urls = run::parse_urls(&cli_args.urls)?;

    if cli_args.dry_run {
        run::describe(&config, &urls);
        return Ok(());
    }

    let agent = Agent::from_config(&config)?;
    let sig_down = SigDown::try_new()?;
    let report = agent
        .run_batch(&urls, &sig_down.cancellation_token())
        .await;
    sig_down.disarm().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
