//! CIDR helpers and block sizing policy
//!
//! Blocks are identified by prefix. Every address maps to exactly one block:
//! the address masked to the block prefix length of its family.

use crate::block::Ordinal;
use crate::error::{Error, Result};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Default host bits per block (64 addresses)
pub const BLOCK_SIZE_BITS: u8 = 6;

/// Default IPv4 block prefix length
pub const DEFAULT_IPV4_PREFIX_LEN: u8 = 32 - BLOCK_SIZE_BITS;

/// Default IPv6 block prefix length
pub const DEFAULT_IPV6_PREFIX_LEN: u8 = 128 - BLOCK_SIZE_BITS;

/// Largest block we hold in memory: 2^16 ordinals
pub const MAX_BLOCK_HOST_BITS: u8 = 16;

/// Block prefix lengths per address family
///
/// The prefix length is both the size new blocks are carved at and the
/// minimum size a claimed CIDR may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockSizing {
    pub ipv4_prefix_len: u8,
    pub ipv6_prefix_len: u8,
}

impl Default for BlockSizing {
    fn default() -> Self {
        Self {
            ipv4_prefix_len: DEFAULT_IPV4_PREFIX_LEN,
            ipv6_prefix_len: DEFAULT_IPV6_PREFIX_LEN,
        }
    }
}

impl BlockSizing {
    /// Check the prefix lengths fit their family and yield a block we can hold
    pub fn validate(&self) -> Result<()> {
        for (family, prefix_len, width) in [
            ("ipv4", self.ipv4_prefix_len, 32u8),
            ("ipv6", self.ipv6_prefix_len, 128u8),
        ] {
            if prefix_len > width {
                return Err(Error::Config(format!(
                    "{} block prefix /{} exceeds address width {}",
                    family, prefix_len, width
                )));
            }
            if width - prefix_len > MAX_BLOCK_HOST_BITS {
                return Err(Error::Config(format!(
                    "{} block prefix /{} gives more than 2^{} addresses per block",
                    family, prefix_len, MAX_BLOCK_HOST_BITS
                )));
            }
        }
        Ok(())
    }

    /// Block prefix length for the family of `address`
    pub fn prefix_len_for(&self, address: &IpAddr) -> u8 {
        match address {
            IpAddr::V4(_) => self.ipv4_prefix_len,
            IpAddr::V6(_) => self.ipv6_prefix_len,
        }
    }

    fn prefix_len_for_net(&self, cidr: &IpNet) -> u8 {
        match cidr {
            IpNet::V4(_) => self.ipv4_prefix_len,
            IpNet::V6(_) => self.ipv6_prefix_len,
        }
    }

    /// Minimum number of addresses a block of this family must span
    ///
    /// `None` when the prefix length does not fit the family, or the count
    /// does not fit a `u128`.
    pub fn min_address_count(&self, cidr: &IpNet) -> Option<u128> {
        let host_bits = cidr.max_prefix_len().checked_sub(self.prefix_len_for_net(cidr))?;
        1u128.checked_shl(u32::from(host_bits))
    }

    /// The block CIDR containing `address`
    pub fn block_cidr_for_address(&self, address: IpAddr) -> Result<IpNet> {
        let prefix_len = self.prefix_len_for(&address);
        IpNet::new(address, prefix_len)
            .map(|net| net.trunc())
            .map_err(|e| Error::Config(format!("Invalid block prefix /{}: {}", prefix_len, e)))
    }

    /// Fail unless `cidr` spans at least the minimum block size of its family
    pub fn validate_block_size(&self, cidr: &IpNet) -> Result<()> {
        let min_prefix_len = self.prefix_len_for_net(cidr);
        if cidr.prefix_len() > min_prefix_len {
            return Err(Error::InvalidBlockSize {
                cidr: *cidr,
                min_prefix_len,
            });
        }
        Ok(())
    }

    /// Fail unless `cidr` is exactly one block at this sizing
    ///
    /// Blocks are looked up by the block CIDR of an address, so a stored block
    /// of any other size would never be found again.
    pub fn validate_block_cidr(&self, cidr: &IpNet) -> Result<()> {
        self.validate_block_size(cidr)?;
        let prefix_len = self.prefix_len_for_net(cidr);
        if cidr.prefix_len() != prefix_len || *cidr != cidr.trunc() {
            return Err(Error::Block(format!(
                "{} is not a block: blocks are /{} network prefixes",
                cidr, prefix_len
            )));
        }
        Ok(())
    }

    /// The blocks making up `cidr`, which must be at least one block in size
    pub fn blocks_in(&self, cidr: &IpNet) -> Result<Vec<IpNet>> {
        self.validate_block_size(cidr)?;
        if *cidr != cidr.trunc() {
            return Err(Error::Block(format!("{} is not a network prefix", cidr)));
        }
        let prefix_len = self.prefix_len_for_net(cidr);
        if prefix_len - cidr.prefix_len() > MAX_BLOCK_HOST_BITS {
            return Err(Error::Block(format!(
                "{} covers more than 2^{} blocks",
                cidr, MAX_BLOCK_HOST_BITS
            )));
        }
        cidr.subnets(prefix_len)
            .map(|subnets| subnets.collect())
            .map_err(|e| Error::Config(format!("Invalid block prefix /{}: {}", prefix_len, e)))
    }
}

/// Block CIDR for `address` under the default sizing
pub fn block_cidr_for_address(address: IpAddr) -> IpNet {
    let prefix_len = BlockSizing::default().prefix_len_for(&address);
    // Default prefix lengths are always within the family width
    match address {
        IpAddr::V4(v4) => IpNet::V4(Ipv4Net::new_assert(v4, prefix_len).trunc()),
        IpAddr::V6(v6) => IpNet::V6(Ipv6Net::new_assert(v6, prefix_len).trunc()),
    }
}

/// Validate `cidr` against the default sizing
pub fn validate_block_size(cidr: &IpNet) -> Result<()> {
    BlockSizing::default().validate_block_size(cidr)
}

fn to_bits(address: IpAddr) -> u128 {
    match address {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Number of ordinals in a block, refusing blocks too large to hold
pub fn block_size(cidr: &IpNet) -> Result<usize> {
    let host_bits = cidr.max_prefix_len() - cidr.prefix_len();
    if host_bits > MAX_BLOCK_HOST_BITS {
        return Err(Error::Block(format!(
            "{} spans 2^{} addresses, more than a block may hold",
            cidr, host_bits
        )));
    }
    Ok(1usize << host_bits)
}

/// Ordinal of `address` within `cidr`, if it lies inside
pub fn ordinal_of(cidr: &IpNet, address: IpAddr) -> Option<Ordinal> {
    if !cidr.contains(&address) {
        return None;
    }
    let offset = to_bits(address) - to_bits(cidr.network());
    Ordinal::try_from(offset).ok()
}

/// Address at `ordinal` within `cidr`, if in range
pub fn address_at(cidr: &IpNet, ordinal: Ordinal) -> Option<IpAddr> {
    let size = block_size(cidr).ok()?;
    if ordinal as usize >= size {
        return None;
    }
    let bits = to_bits(cidr.network()) + ordinal as u128;
    Some(match cidr {
        IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
        IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
    })
}
