//! Server binary: runs the two-phase commit coordinator or one participant
//! replica, selected by flag.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use pact_store::node::{self, Topology};

/// Replicated key-value store node driven by two-phase commit.
#[derive(Parser, Debug)]
#[command(name = "pact-store")]
struct Args {
    /// Run the coordinator (master) process.
    #[arg(long)]
    master: bool,

    /// Number of participant replicas the coordinator drives.
    #[arg(long, default_value_t = 0)]
    replica_count: usize,

    /// Run a participant (replica) process.
    #[arg(long)]
    replica: bool,

    /// Index of this participant, starting at 0.
    #[arg(long, default_value_t = 0)]
    replica_index: usize,

    /// Host the processes bind and dial on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// TCP port the coordinator listens on.
    #[arg(long, default_value_t = node::MASTER_PORT)]
    master_port: u16,

    /// First participant port; participant `i` listens on start + i.
    #[arg(long, default_value_t = node::REPLICA_PORT_START)]
    replica_port_start: u16,

    /// Directory holding `logs/` and `data/`.
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let topology = Topology {
        host: args.host,
        master_port: args.master_port,
        replica_port_start: args.replica_port_start,
        base_dir: args.base_dir,
    };

    if args.master {
        node::run_master(topology, args.replica_count).await
    } else if args.replica {
        node::run_replica(topology, args.replica_index).await
    } else {
        anyhow::bail!("pass --master or --replica")
    }
}
