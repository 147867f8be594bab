//! CLI tool for browsing captured traffic
//!
//! Usage:
//!   https-proxy-history list [--json]
//!   https-proxy-history show <id>
//!   https-proxy-history replay <id>
//!   https-proxy-history scan <id>

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use https_proxy::database::{SqliteStore, TransactionStore};
use https_proxy::replay;
use https_proxy::scanner::{self, IndicatorProbe};
use https_proxy::Transaction;
use std::path::PathBuf;
use std::time::Duration;

/// Inspect, replay and scan transactions captured by https-proxy
#[derive(Parser, Debug)]
#[command(name = "https-proxy-history")]
#[command(author = "https-proxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Inspect, replay and scan captured transactions")]
struct Args {
    /// Database path
    #[arg(long, env = "DB_PATH", default_value = "./data/transactions.db")]
    db_path: PathBuf,

    /// Extra CA certificate (PEM) trusted when replaying
    #[arg(long, env = "UPSTREAM_CA")]
    upstream_ca: Option<PathBuf>,

    /// Request timeout in seconds for replays and probes
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List captured transactions, newest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one transaction as JSON
    Show {
        /// Transaction id
        id: String,
    },

    /// Send a captured request again and print the response
    Replay {
        /// Transaction id
        id: String,
    },

    /// Run the vulnerability scanners against a captured request
    Scan {
        /// Transaction id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let store = SqliteStore::new(&args.db_path)
        .with_context(|| format!("open {}", args.db_path.display()))?;

    match args.command {
        Commands::List { json } => {
            let transactions = store.list()?;

            if transactions.is_empty() {
                println!("No transactions found");
                return Ok(());
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&transactions)?);
            } else {
                println!(
                    "{:<36} {:<25} {:<7} {:<6} {}",
                    "ID", "CAPTURED", "METHOD", "STATUS", "URL"
                );
                println!("{}", "-".repeat(110));

                for transaction in &transactions {
                    print_row(transaction);
                }

                println!("\nTotal: {} transaction(s)", transactions.len());
            }
        }

        Commands::Show { id } => {
            let transaction = find(&store, &id)?;
            println!("{}", serde_json::to_string_pretty(&transaction)?);
            if !transaction.response.body.is_empty() {
                println!(
                    "\n{}",
                    String::from_utf8_lossy(&transaction.response.body)
                );
            }
        }

        Commands::Replay { id } => {
            let transaction = find(&store, &id)?;
            let client = replay::client(
                args.upstream_ca.as_deref(),
                Duration::from_secs(args.timeout_secs),
            )?;

            let response = replay::replay(&client, &transaction.request).await?;
            println!("{:?} {}", response.version(), response.status());
            for (name, value) in response.headers() {
                println!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
            }
            println!();
            println!("{}", response.text().await?);
        }

        Commands::Scan { id } => {
            let transaction = find(&store, &id)?;
            let client = replay::client(
                args.upstream_ca.as_deref(),
                Duration::from_secs(args.timeout_secs),
            )?;
            let probe = IndicatorProbe::new(client, scanner::DEFAULT_INDICATOR);

            let results =
                scanner::scan_all(&scanner::default_scanners(), &transaction.request, &probe)
                    .await;

            if results.is_empty() {
                println!("No vulnerabilities found");
            } else {
                for (name, findings) in &results {
                    println!("{}:", name);
                    for finding in findings {
                        println!("  {}", finding);
                    }
                }
            }
        }
    }

    Ok(())
}

fn find(store: &SqliteStore, id: &str) -> Result<Transaction> {
    match store.get_by_id(id)? {
        Some(transaction) => Ok(transaction),
        None => bail!("No transaction found with id {}", id),
    }
}

fn print_row(transaction: &Transaction) {
    let request = &transaction.request;
    let url = request
        .build_url()
        .map(|u| u.to_string())
        .unwrap_or_else(|_| format!("{}{}", request.host, request.path));

    println!(
        "{:<36} {:<25} {:<7} {:<6} {}",
        transaction.id.as_deref().unwrap_or("-"),
        transaction.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
        request.method,
        transaction.response.status,
        url
    );
}
