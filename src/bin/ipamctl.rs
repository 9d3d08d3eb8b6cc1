//! IPAM block operator tool
//!
//! Offline helpers for working with allocation block records:
//!
//! ```bash
//! # Which block holds an address
//! ipamctl block-for 10.1.2.3
//!
//! # Check a CIDR is usable as a block
//! ipamctl validate 10.1.2.0/26
//!
//! # Print a fresh record claimed by a host
//! ipamctl new 10.1.2.0/26 --host node-a --strict
//!
//! # Decode, verify and summarize a stored record
//! ipamctl inspect block.json
//!
//! # Show the effective configuration
//! ipamctl --config ipam.toml config
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use ipamblock::{cidr, AllocationBlock, IpamClient, IpamConfig, MemoryStore};
use ipnet::IpNet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Inspect and build IPAM allocation blocks
#[derive(Parser, Debug)]
#[command(name = "ipamctl")]
#[command(version = ipamblock::VERSION)]
#[command(about = "Inspect and build IPAM allocation blocks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "IPAM_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); `RUST_LOG` adds directives
    #[arg(long, global = true, default_value = "warn", env = "IPAM_LOG_LEVEL")]
    log_level: tracing::Level,

    /// Also write daily rolling logs to this directory
    #[arg(long, global = true, env = "IPAM_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the block CIDR containing an address
    BlockFor {
        address: IpAddr,
    },

    /// Check that a CIDR can be used as a block
    Validate {
        cidr: IpNet,
    },

    /// Print a new, empty block record
    New {
        cidr: IpNet,

        /// Host claiming the block
        #[arg(long)]
        host: Option<String>,

        /// Only serve auto-assignment to the claiming host
        #[arg(long)]
        strict: bool,
    },

    /// Decode, verify and summarize a stored block record
    Inspect {
        file: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let config = IpamConfig::load(cli.config.as_deref()).context("loading configuration")?;
    debug!(?config, "Loaded configuration");

    match cli.command {
        Commands::BlockFor { address } => {
            let block = config.block_sizing.block_cidr_for_address(address)?;
            println!("{}", block);
            Ok(())
        }
        Commands::Validate { cidr } => validate_command(&config, cidr),
        Commands::New { cidr, host, strict } => new_command(config, cidr, host, strict).await,
        Commands::Inspect { file } => inspect_command(file),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Setup logging to stderr and optionally a rolling file
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let file_layer = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "ipamctl.log");
            Some(fmt::layer().with_writer(file_appender).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(cli.log_level.into()))
        .init();

    Ok(())
}

fn validate_command(config: &IpamConfig, cidr: IpNet) -> anyhow::Result<()> {
    if cidr != cidr.trunc() {
        anyhow::bail!("{} is not a network prefix (did you mean {}?)", cidr, cidr.trunc());
    }
    config.block_sizing.validate_block_cidr(&cidr)?;
    let size = cidr::block_size(&cidr)?;
    println!("{} is a valid block of {} addresses", cidr, size);
    Ok(())
}

/// Claim the block in a scratch store and print the stored record
async fn new_command(
    mut config: IpamConfig,
    cidr: IpNet,
    host: Option<String>,
    strict: bool,
) -> anyhow::Result<()> {
    config.strict_affinity = strict;
    let client = IpamClient::new(Arc::new(MemoryStore::new()), config);

    let block = match host {
        Some(host) => client.claim_block_affinity(cidr, &host).await?,
        None => {
            client.config().block_sizing.validate_block_cidr(&cidr)?;
            AllocationBlock::new(cidr, None, strict)?
        }
    };
    info!(cidr = %block.cidr(), affinity = ?block.host_affinity(), "Built block record");

    let record: serde_json::Value = serde_json::from_slice(&block.to_bytes()?)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn inspect_command(file: PathBuf) -> anyhow::Result<()> {
    let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    let block = AllocationBlock::from_bytes(&bytes)
        .with_context(|| format!("decoding {}", file.display()))?;

    println!("cidr:            {}", block.cidr());
    println!(
        "affinity:        {}",
        block.host_affinity().unwrap_or("<none>")
    );
    println!("strict affinity: {}", block.strict_affinity());
    println!(
        "addresses:       {} total, {} free",
        block.size(),
        block.count_free_addresses()
    );

    let ref_counts = block.attribute_ref_counts();
    println!("attributes:      {}", block.attributes().len());
    for (index, record) in block.attributes().iter() {
        let handle = record
            .handle_id
            .as_ref()
            .map(|h| h.to_string())
            .unwrap_or_else(|| "<no handle>".to_string());
        println!(
            "  {:>8}  {:<24} {:>5} addresses  {:?}",
            index.to_string(),
            handle,
            ref_counts.get(&index).copied().unwrap_or(0),
            record.secondary
        );
    }
    Ok(())
}
