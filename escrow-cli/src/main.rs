//! Operator CLI for the escrow ledger
//!
//! `demo` drives a fresh in-process node through creation, release,
//! deadline refund and a rejected double resolution, then prints the audit
//! log as JSON lines. `config` prints the effective configuration.

use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use escrow_ledger::{
    clock::{Clock, ManualClock},
    config::NodeConfig,
    models::{Amount, Identity},
    node::{CreateEscrowRequest, EscrowNode},
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "escrow-cli", version, about = "Escrow ledger operator tooling")]
struct Cli {
    /// Configuration file (any format the config crate understands)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the escrow lifecycle against a fresh node and print its audit log
    Demo {
        /// Amount deposited per escrow, in whole units
        #[arg(long, default_value_t = 1)]
        amount: u64,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config =
        NodeConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .init();

    match cli.command {
        Command::Demo { amount } => run_demo(config, amount).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_demo(config: NodeConfig, whole_units: u64) -> Result<()> {
    let owner = config.ledger.owner.clone();
    let buyer = Identity::from("buyer");
    let seller = Identity::from("seller");
    let amount = Amount::from_whole(whole_units);

    let clock = Arc::new(ManualClock::starting_now());
    let node = EscrowNode::with_clock(config, clock.clone())
        .context("Failed to start escrow node")?;
    node.deposit(&buyer, Amount::from_whole(whole_units.saturating_mul(2)))
        .await?;

    // Released by the buyer
    let released = node
        .create_escrow(CreateEscrowRequest {
            buyer: buyer.clone(),
            seller: seller.clone(),
            deadline: clock.now() + Duration::days(1),
            amount,
        })
        .await?;
    node.release_funds(&buyer, released).await?;

    // Refunded by the owner once the deadline passes
    let refunded = node
        .create_escrow(CreateEscrowRequest {
            buyer: buyer.clone(),
            seller: seller.clone(),
            deadline: clock.now() + Duration::days(1),
            amount,
        })
        .await?;
    clock.advance(Duration::days(1) + Duration::seconds(10));
    node.fund_buyer(&owner, refunded).await?;

    match node.release_funds(&buyer, released).await {
        Ok(()) => anyhow::bail!("escrow {} resolved twice", released),
        Err(e) => warn!("Second release of escrow {} rejected: {}", released, e),
    }

    for entry in node.audit_log().entries().await {
        println!("{}", serde_json::to_string(&entry)?);
    }

    let health = node.health_check().await;
    info!(
        "Final balances: buyer={}, seller={}, custody={} (healthy: {})",
        node.balance_of(&buyer).await,
        node.balance_of(&seller).await,
        health.custody_balance,
        health.healthy
    );

    node.shutdown().await;
    Ok(())
}
