//! Minimal client for the coordinator surface.

use std::net::SocketAddr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use pact_store::client::CoordinatorClient;

#[derive(Parser)]
#[command(name = "pactctl")]
#[command(about = "Client for the pact-store coordinator", long_about = None)]
struct Args {
    /// Coordinator address (host:port).
    #[arg(long, default_value = "127.0.0.1:7170")]
    addr: SocketAddr,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a value under a key.
    Put { key: String, value: String },
    /// Fetch the value for a key.
    Get { key: String },
    /// Delete a key.
    Del { key: String },
    /// Liveness echo round trip.
    Ping { key: String },
    /// Show the coordinator's state for a transaction id.
    Status { tx_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = CoordinatorClient::new(args.addr);

    match args.command {
        Command::Put { key, value } => {
            client.put(&key, &value).await?;
            println!("ok");
        }
        Command::Get { key } => println!("{}", client.get(&key).await?),
        Command::Del { key } => {
            client.del(&key).await?;
            println!("ok");
        }
        Command::Ping { key } => println!("{}", client.ping(&key).await?),
        Command::Status { tx_id } => println!("{}", client.status(&tx_id).await?),
    }
    Ok(())
}
