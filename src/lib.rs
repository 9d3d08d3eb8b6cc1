// ipamblock - IPAM allocation block engine
// Tracks per-address assignments inside CIDR blocks stored as versioned records

#![warn(rust_2018_idioms)]

pub mod block;
pub mod cidr;
pub mod client;
pub mod config;
pub mod handle;
pub mod store;

// Re-exports for convenience
pub use block::{AllocationBlock, AttributeIndex, AttributeRecord, HandleId, Ordinal, Tags};
pub use cidr::BlockSizing;
pub use client::{AffinityClaim, AffinityRelease, IpamClient};
pub use config::IpamConfig;
pub use handle::AllocationHandle;
pub use store::{CasOutcome, KvStore, MemoryStore, Revision};

/// IPAM error types
pub mod error {
    use crate::block::IntegrityViolation;
    use ipnet::IpNet;
    use std::net::IpAddr;
    use thiserror::Error;

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        #[error("{address} is already assigned in block {cidr}")]
        AlreadyAssigned { address: IpAddr, cidr: IpNet },

        #[error("{address} is not assigned in block {cidr}")]
        AddressNotAssigned { address: IpAddr, cidr: IpNet },

        #[error("Block {cidr} host affinity is {affinity:?} (not {host})")]
        NoHostAffinity {
            cidr: IpNet,
            affinity: Option<String>,
            host: String,
        },

        #[error("Integrity violation: {0}")]
        Integrity(#[from] IntegrityViolation),

        #[error("Invalid block size: {cidr} is smaller than the minimum /{min_prefix_len}")]
        InvalidBlockSize { cidr: IpNet, min_prefix_len: u8 },

        #[error("Block error: {0}")]
        Block(String),

        #[error("Handle {handle} has {available} addresses in block {block}, cannot release {requested}")]
        AddressCountTooLow {
            handle: String,
            block: String,
            available: u64,
            requested: u64,
        },

        #[error("Block {cidr} is claimed by {owner:?}")]
        HostAffinityClaimed { cidr: IpNet, owner: Option<String> },

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Hit max retries ({attempts}) during {operation} on {key}")]
        RetriesExhausted {
            operation: &'static str,
            key: String,
            attempts: u32,
        },

        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
