//! IPAM client
//!
//! Drives block and handle mutations against a [`KvStore`]. Every operation
//! is a read-mutate-CAS loop: read the record with its revision, apply the
//! block operation to the copy, then compare-and-swap. A lost CAS discards
//! the copy and starts over from a fresh read, bounded by
//! `IpamConfig::max_retries`.
//!
//! Handle records are bumped before the block write that allocates under
//! them, and rolled back if that write loses. A crash in between leaves the
//! handle overcounting, which release tolerates.

use crate::block::{AllocationBlock, AttributeRecord, HandleId, Tags};
use crate::config::IpamConfig;
use crate::error::{Error, Result};
use crate::handle::AllocationHandle;
use crate::store::{CasOutcome, KvStore};
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const BLOCK_KEY_PREFIX: &str = "/ipam/v2/assignment";
const HANDLE_KEY_PREFIX: &str = "/ipam/v2/handle";

/// Store key of the block record for `cidr`
pub fn block_key(cidr: &IpNet) -> String {
    let family = match cidr {
        IpNet::V4(_) => "ipv4",
        IpNet::V6(_) => "ipv6",
    };
    format!(
        "{}/{}/block/{}-{}",
        BLOCK_KEY_PREFIX,
        family,
        cidr.network(),
        cidr.prefix_len()
    )
}

/// Store key of the handle record for `handle_id`
pub fn handle_key(handle_id: &HandleId) -> String {
    format!("{}/{}", HANDLE_KEY_PREFIX, handle_id)
}

/// Outcome of claiming every block in a CIDR
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffinityClaim {
    pub claimed: Vec<IpNet>,
    /// Blocks another host already holds
    pub claimed_by_other: Vec<IpNet>,
}

/// Outcome of releasing every block in a CIDR
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffinityRelease {
    pub released: Vec<IpNet>,
    /// Blocks that did not exist
    pub not_claimed: Vec<IpNet>,
    pub claimed_by_other: Vec<IpNet>,
}

pub struct IpamClient<S: KvStore> {
    store: Arc<S>,
    config: IpamConfig,
}

impl<S: KvStore> IpamClient<S> {
    pub fn new(store: Arc<S>, config: IpamConfig) -> Self {
        Self { store, config }
    }

    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(store, IpamConfig::default())
    }

    pub fn config(&self) -> &IpamConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Read a block, failing with `NotFound` if it does not exist
    pub async fn read_block(&self, cidr: &IpNet) -> Result<AllocationBlock> {
        self.try_read_block(cidr)
            .await?
            .ok_or_else(|| Error::NotFound(format!("block {}", cidr)))
    }

    async fn try_read_block(&self, cidr: &IpNet) -> Result<Option<AllocationBlock>> {
        let Some(kv) = self.store.get(&block_key(cidr)).await? else {
            return Ok(None);
        };
        let mut block = AllocationBlock::from_bytes(&kv.value)?;
        if block.cidr() != *cidr {
            return Err(Error::Block(format!(
                "record at {} holds block {}",
                block_key(cidr),
                block.cidr()
            )));
        }
        block.set_revision(Some(kv.revision));
        Ok(Some(block))
    }

    /// Write `block` back at the revision it was read at
    async fn write_block(&self, block: &mut AllocationBlock) -> Result<CasOutcome> {
        let outcome = self
            .store
            .compare_and_swap(&block_key(&block.cidr()), block.to_bytes()?, block.revision())
            .await?;
        if let CasOutcome::Swapped(revision) = outcome {
            block.set_revision(Some(revision));
        }
        Ok(outcome)
    }

    async fn delete_block(&self, block: &AllocationBlock) -> Result<CasOutcome> {
        let Some(revision) = block.revision() else {
            return Err(Error::Block(format!("block {} was never stored", block.cidr())));
        };
        self.store.delete(&block_key(&block.cidr()), revision).await
    }

    /// Persist a block after a release, deleting it if nothing keeps it alive
    async fn commit_released_block(&self, block: &mut AllocationBlock) -> Result<CasOutcome> {
        if block.is_empty() && block.host_affinity().is_none() {
            debug!(cidr = %block.cidr(), "Deleting empty block with no affinity");
            self.delete_block(block).await
        } else {
            self.write_block(block).await
        }
    }

    fn exhausted(&self, operation: &'static str, key: String) -> Error {
        warn!(operation, key = %key, attempts = self.config.max_retries, "Hit max retries");
        Error::RetriesExhausted {
            operation,
            key,
            attempts: self.config.max_retries,
        }
    }

    /// Claim every block in `cidr` for `host`
    ///
    /// `cidr` is split into blocks of the configured size. Blocks held by
    /// another host are reported rather than failing the whole claim.
    #[instrument(skip(self), fields(cidr = %cidr))]
    pub async fn claim_affinity(&self, cidr: IpNet, host: &str) -> Result<AffinityClaim> {
        let mut outcome = AffinityClaim::default();
        for block in self.config.block_sizing.blocks_in(&cidr)? {
            match self.claim_block_affinity(block, host).await {
                Ok(_) => outcome.claimed.push(block),
                Err(Error::HostAffinityClaimed { .. }) => outcome.claimed_by_other.push(block),
                Err(e) => return Err(e),
            }
        }
        info!(
            cidr = %cidr,
            host,
            claimed = outcome.claimed.len(),
            claimed_by_other = outcome.claimed_by_other.len(),
            "Claimed affinity"
        );
        Ok(outcome)
    }

    /// Release `host`'s affinity to every block in `cidr`
    #[instrument(skip(self), fields(cidr = %cidr))]
    pub async fn release_affinity(&self, cidr: IpNet, host: &str) -> Result<AffinityRelease> {
        let mut outcome = AffinityRelease::default();
        for block in self.config.block_sizing.blocks_in(&cidr)? {
            match self.release_block_affinity(block, host).await {
                Ok(()) => outcome.released.push(block),
                Err(Error::NotFound(_)) => outcome.not_claimed.push(block),
                Err(Error::HostAffinityClaimed { .. }) => outcome.claimed_by_other.push(block),
                Err(e) => return Err(e),
            }
        }
        Ok(outcome)
    }

    /// Create `cidr` as a block owned by `host`
    ///
    /// `cidr` must be exactly one block of the configured size. Succeeds if
    /// the block already exists with affinity to `host`; fails with
    /// `HostAffinityClaimed` if anyone else holds it.
    #[instrument(skip(self), fields(cidr = %cidr))]
    pub async fn claim_block_affinity(&self, cidr: IpNet, host: &str) -> Result<AllocationBlock> {
        self.config.block_sizing.validate_block_cidr(&cidr)?;
        let mut block =
            AllocationBlock::new(cidr, Some(host.to_string()), self.config.strict_affinity)?;

        match self.write_block(&mut block).await? {
            CasOutcome::Swapped(_) => {
                info!(cidr = %cidr, host, "Claimed block");
                Ok(block)
            }
            CasOutcome::Conflict => {
                let existing = self.read_block(&cidr).await?;
                if existing.host_affinity() == Some(host) {
                    debug!(cidr = %cidr, host, "Block already claimed by us");
                    return Ok(existing);
                }
                Err(Error::HostAffinityClaimed {
                    cidr,
                    owner: existing.host_affinity().map(str::to_string),
                })
            }
        }
    }

    /// Give up `host`'s affinity to `cidr`
    ///
    /// An empty block is deleted; otherwise its affinity is cleared and the
    /// assigned addresses stay put.
    #[instrument(skip(self), fields(cidr = %cidr))]
    pub async fn release_block_affinity(&self, cidr: IpNet, host: &str) -> Result<()> {
        for attempt in 1..=self.config.max_retries {
            let mut block = self.read_block(&cidr).await?;
            if block.host_affinity() != Some(host) {
                info!(
                    cidr = %cidr,
                    host,
                    affinity = ?block.host_affinity(),
                    "Block is not ours, not releasing"
                );
                return Err(Error::HostAffinityClaimed {
                    cidr,
                    owner: block.host_affinity().map(str::to_string),
                });
            }

            let outcome = if block.is_empty() {
                debug!(cidr = %cidr, "Block is empty, deleting");
                self.delete_block(&block).await?
            } else {
                block.set_host_affinity(None);
                self.write_block(&mut block).await?
            };

            if outcome.is_swapped() {
                info!(cidr = %cidr, host, "Released block affinity");
                return Ok(());
            }
            debug!(cidr = %cidr, attempt, "CAS conflict releasing affinity, retrying");
        }
        Err(self.exhausted("release_block_affinity", block_key(&cidr)))
    }

    /// Assign up to `num` free addresses from an existing block
    ///
    /// Returns fewer than `num` (possibly none) when the block runs out.
    #[instrument(skip(self, tags), fields(cidr = %cidr))]
    pub async fn auto_assign_in_block(
        &self,
        cidr: IpNet,
        num: usize,
        handle_id: Option<&HandleId>,
        tags: &Tags,
        host: &str,
        affinity_check: bool,
    ) -> Result<Vec<IpAddr>> {
        for attempt in 1..=self.config.max_retries {
            let mut block = self.read_block(&cidr).await?;
            let addresses = block.auto_assign(num, handle_id, tags, host, affinity_check)?;
            if addresses.is_empty() {
                debug!(cidr = %cidr, "Block is full");
                return Ok(addresses);
            }

            let count = addresses.len() as u64;
            if let Some(handle_id) = handle_id {
                self.increment_handle(handle_id, cidr, count).await?;
            }

            match self.write_block(&mut block).await? {
                CasOutcome::Swapped(_) => {
                    info!(cidr = %cidr, host, count, "Auto-assigned addresses");
                    return Ok(addresses);
                }
                CasOutcome::Conflict => {
                    debug!(cidr = %cidr, attempt, "CAS conflict auto-assigning, retrying");
                    if let Some(handle_id) = handle_id {
                        self.decrement_handle(handle_id, cidr, count).await?;
                    }
                }
            }
        }
        Err(self.exhausted("auto_assign_in_block", block_key(&cidr)))
    }

    /// Assign a specific address, claiming its block for `host` if needed
    #[instrument(skip(self, tags))]
    pub async fn assign_ip(
        &self,
        address: IpAddr,
        handle_id: Option<&HandleId>,
        tags: &Tags,
        host: &str,
    ) -> Result<()> {
        let cidr = self.config.block_sizing.block_cidr_for_address(address)?;

        for attempt in 1..=self.config.max_retries {
            let Some(mut block) = self.try_read_block(&cidr).await? else {
                debug!(cidr = %cidr, "Block does not exist, claiming it");
                match self.claim_block_affinity(cidr, host).await {
                    Ok(_) | Err(Error::HostAffinityClaimed { .. }) => continue,
                    Err(e) => return Err(e),
                }
            };

            block.assign(address, handle_id, tags, host)?;
            if let Some(handle_id) = handle_id {
                self.increment_handle(handle_id, cidr, 1).await?;
            }

            match self.write_block(&mut block).await? {
                CasOutcome::Swapped(_) => {
                    info!(%address, cidr = %cidr, "Assigned address");
                    return Ok(());
                }
                CasOutcome::Conflict => {
                    debug!(cidr = %cidr, attempt, "CAS conflict assigning, retrying");
                    if let Some(handle_id) = handle_id {
                        self.decrement_handle(handle_id, cidr, 1).await?;
                    }
                }
            }
        }
        Err(self.exhausted("assign_ip", block_key(&cidr)))
    }

    /// Release addresses, returning those that were not allocated
    ///
    /// Addresses may span blocks and families. A block left empty with no
    /// host affinity is deleted.
    #[instrument(skip(self))]
    pub async fn release_ips(&self, addresses: &BTreeSet<IpAddr>) -> Result<BTreeSet<IpAddr>> {
        let mut by_block: BTreeMap<IpNet, BTreeSet<IpAddr>> = BTreeMap::new();
        for &address in addresses {
            let cidr = self.config.block_sizing.block_cidr_for_address(address)?;
            by_block.entry(cidr).or_default().insert(address);
        }

        let mut unallocated = BTreeSet::new();
        for (cidr, addresses) in by_block {
            unallocated.extend(self.release_ips_from_block(cidr, addresses).await?);
        }
        info!(
            requested = addresses.len(),
            already_free = unallocated.len(),
            "Released addresses"
        );
        Ok(unallocated)
    }

    async fn release_ips_from_block(
        &self,
        cidr: IpNet,
        addresses: BTreeSet<IpAddr>,
    ) -> Result<BTreeSet<IpAddr>> {
        for attempt in 1..=self.config.max_retries {
            let Some(mut block) = self.try_read_block(&cidr).await? else {
                debug!(cidr = %cidr, "Block does not exist, nothing to release");
                return Ok(addresses);
            };

            let outcome = block.release(&addresses)?;
            if outcome.unallocated.len() == addresses.len() {
                return Ok(addresses);
            }

            if self.commit_released_block(&mut block).await?.is_swapped() {
                for (handle_id, count) in &outcome.handles {
                    if let Some(handle_id) = handle_id {
                        self.decrement_handle(handle_id, cidr, *count).await?;
                    }
                }
                return Ok(outcome.unallocated);
            }
            debug!(cidr = %cidr, attempt, "CAS conflict releasing, retrying");
        }
        Err(self.exhausted("release_ips", block_key(&cidr)))
    }

    /// Read a handle record, failing with `NotFound` if it does not exist
    pub async fn read_handle(&self, handle_id: &HandleId) -> Result<AllocationHandle> {
        self.try_read_handle(handle_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("handle {}", handle_id)))
    }

    async fn try_read_handle(&self, handle_id: &HandleId) -> Result<Option<AllocationHandle>> {
        let Some(kv) = self.store.get(&handle_key(handle_id)).await? else {
            return Ok(None);
        };
        let mut handle = AllocationHandle::from_bytes(&kv.value)?;
        handle.set_revision(Some(kv.revision));
        Ok(Some(handle))
    }

    async fn increment_handle(&self, handle_id: &HandleId, cidr: IpNet, num: u64) -> Result<()> {
        for attempt in 1..=self.config.max_retries {
            let mut handle = self
                .try_read_handle(handle_id)
                .await?
                .unwrap_or_else(|| AllocationHandle::new(handle_id.clone()));
            handle.increment_block(cidr, num);

            let outcome = self
                .store
                .compare_and_swap(&handle_key(handle_id), handle.to_bytes()?, handle.revision())
                .await?;
            if outcome.is_swapped() {
                return Ok(());
            }
            debug!(handle = %handle_id, attempt, "CAS conflict incrementing handle, retrying");
        }
        Err(self.exhausted("increment_handle", handle_key(handle_id)))
    }

    async fn decrement_handle(&self, handle_id: &HandleId, cidr: IpNet, num: u64) -> Result<()> {
        for attempt in 1..=self.config.max_retries {
            let mut handle = self.read_handle(handle_id).await?;
            handle.decrement_block(cidr, num)?;

            let key = handle_key(handle_id);
            let outcome = match handle.revision() {
                Some(revision) if handle.is_empty() => self.store.delete(&key, revision).await?,
                revision => {
                    self.store
                        .compare_and_swap(&key, handle.to_bytes()?, revision)
                        .await?
                }
            };
            if outcome.is_swapped() {
                return Ok(());
            }
            debug!(handle = %handle_id, attempt, "CAS conflict decrementing handle, retrying");
        }
        Err(self.exhausted("decrement_handle", handle_key(handle_id)))
    }

    /// Addresses allocated under `handle_id`, across every block it lists
    #[instrument(skip(self))]
    pub async fn ip_assignments_by_handle(&self, handle_id: &HandleId) -> Result<Vec<IpAddr>> {
        let handle = self.read_handle(handle_id).await?;

        let mut addresses = Vec::new();
        for cidr in handle.blocks() {
            match self.try_read_block(&cidr).await? {
                Some(block) => addresses.extend(block.ip_assignments_by_handle(handle_id)),
                None => warn!(
                    cidr = %cidr,
                    handle = %handle_id,
                    "Handle references a block that does not exist"
                ),
            }
        }
        Ok(addresses)
    }

    /// Release every address allocated under `handle_id`, returning how many
    #[instrument(skip(self))]
    pub async fn release_ip_by_handle(&self, handle_id: &HandleId) -> Result<usize> {
        let handle = self.read_handle(handle_id).await?;

        let mut released = 0;
        for cidr in handle.blocks() {
            released += self.release_ip_by_handle_block(handle_id, cidr).await?;
        }
        info!(handle = %handle_id, released, "Released addresses by handle");
        Ok(released)
    }

    async fn release_ip_by_handle_block(&self, handle_id: &HandleId, cidr: IpNet) -> Result<usize> {
        for attempt in 1..=self.config.max_retries {
            // A missing block or one without our addresses means the handle
            // overcounts, which is expected after an interrupted allocation.
            let Some(mut block) = self.try_read_block(&cidr).await? else {
                return Ok(0);
            };
            let count = block.release_by_handle(handle_id)?;
            if count == 0 {
                return Ok(0);
            }

            if self.commit_released_block(&mut block).await?.is_swapped() {
                self.decrement_handle(handle_id, cidr, count as u64).await?;
                return Ok(count);
            }
            debug!(cidr = %cidr, attempt, "CAS conflict releasing by handle, retrying");
        }
        Err(self.exhausted("release_ip_by_handle", block_key(&cidr)))
    }

    /// Handle and tags an address was assigned with
    pub async fn assignment_attributes(&self, address: IpAddr) -> Result<AttributeRecord> {
        let cidr = self.config.block_sizing.block_cidr_for_address(address)?;
        let Some(block) = self.try_read_block(&cidr).await? else {
            warn!(%address, cidr = %cidr, "No block holds the requested address");
            return Err(Error::AddressNotAssigned { address, cidr });
        };
        block.attributes_for_ip(address).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn client() -> IpamClient<MemoryStore> {
        IpamClient::with_defaults(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_keys() {
        assert_eq!(
            block_key(&net("10.0.0.64/26")),
            "/ipam/v2/assignment/ipv4/block/10.0.0.64-26"
        );
        assert_eq!(
            block_key(&net("fd00::40/122")),
            "/ipam/v2/assignment/ipv6/block/fd00::40-122"
        );
        assert_eq!(handle_key(&HandleId::new("wl-1")), "/ipam/v2/handle/wl-1");
    }

    #[tokio::test]
    async fn test_claim_is_idempotent_per_host() -> Result<()> {
        let client = client();
        let cidr = net("10.0.0.0/26");

        let block = client.claim_block_affinity(cidr, "node-a").await?;
        assert_eq!(block.host_affinity(), Some("node-a"));
        assert!(block.revision().is_some());

        client.claim_block_affinity(cidr, "node-a").await?;
        let err = client.claim_block_affinity(cidr, "node-b").await.unwrap_err();
        assert_eq!(
            err,
            Error::HostAffinityClaimed {
                cidr,
                owner: Some("node-a".to_string())
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_rejects_small_block() {
        let client = client();
        let err = client
            .claim_block_affinity(net("10.0.0.0/27"), "node-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBlockSize { min_prefix_len: 26, .. }));
    }

    #[tokio::test]
    async fn test_claim_rejects_wide_block() {
        let client = client();
        let err = client
            .claim_block_affinity(net("10.0.0.0/24"), "node-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Block(_)));
        assert!(client.store().is_empty());
    }

    #[tokio::test]
    async fn test_claim_affinity_splits_into_blocks() -> Result<()> {
        let client = client();
        client.claim_block_affinity(net("10.0.0.64/26"), "node-b").await?;

        let claim = client.claim_affinity(net("10.0.0.0/24"), "node-a").await?;
        assert_eq!(
            claim.claimed,
            vec![net("10.0.0.0/26"), net("10.0.0.128/26"), net("10.0.0.192/26")]
        );
        assert_eq!(claim.claimed_by_other, vec![net("10.0.0.64/26")]);

        // Addresses in a claimed range are released through their own block
        let addresses = client
            .auto_assign_in_block(net("10.0.0.128/26"), 1, None, &Tags::new(), "node-a", true)
            .await?;
        assert_eq!(addresses, vec![ip("10.0.0.128")]);
        let already_free = client.release_ips(&addresses.iter().copied().collect()).await?;
        assert!(already_free.is_empty());
        assert!(client.read_block(&net("10.0.0.128/26")).await?.is_empty());

        // An address in the range is assigned in the existing block
        client.assign_ip(ip("10.0.0.5"), None, &Tags::new(), "node-a").await?;
        let err = client
            .assign_ip(ip("10.0.0.5"), None, &Tags::new(), "node-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyAssigned { .. }));

        let release = client.release_affinity(net("10.0.0.0/24"), "node-a").await?;
        assert_eq!(
            release.released,
            vec![net("10.0.0.0/26"), net("10.0.0.128/26"), net("10.0.0.192/26")]
        );
        assert_eq!(release.claimed_by_other, vec![net("10.0.0.64/26")]);
        assert!(release.not_claimed.is_empty());

        let release = client.release_affinity(net("10.0.0.128/25"), "node-a").await?;
        assert_eq!(release.not_claimed, vec![net("10.0.0.128/26"), net("10.0.0.192/26")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_auto_assign_records_handle() -> Result<()> {
        let client = client();
        let cidr = net("10.0.0.0/26");
        let handle = HandleId::new("h1");
        client.claim_block_affinity(cidr, "node-a").await?;

        let addresses = client
            .auto_assign_in_block(cidr, 3, Some(&handle), &Tags::new(), "node-a", true)
            .await?;
        assert_eq!(addresses, vec![ip("10.0.0.0"), ip("10.0.0.1"), ip("10.0.0.2")]);

        let record = client.read_handle(&handle).await?;
        assert_eq!(record.count_for(&cidr), 3);
        assert_eq!(client.ip_assignments_by_handle(&handle).await?, addresses);
        Ok(())
    }

    #[tokio::test]
    async fn test_auto_assign_affinity_check() -> Result<()> {
        let client = client();
        let cidr = net("10.0.0.0/26");
        client.claim_block_affinity(cidr, "node-a").await?;

        let err = client
            .auto_assign_in_block(cidr, 1, None, &Tags::new(), "node-b", true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoHostAffinity { .. }));

        let addresses = client
            .auto_assign_in_block(cidr, 1, None, &Tags::new(), "node-b", false)
            .await?;
        assert_eq!(addresses.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_assign_ip_claims_missing_block() -> Result<()> {
        let client = client();
        let address = ip("10.9.0.70");
        let mut tags = Tags::new();
        tags.insert("pod".into(), "db-0".into());

        client
            .assign_ip(address, Some(&HandleId::new("h1")), &tags, "node-a")
            .await?;

        let block = client.read_block(&net("10.9.0.64/26")).await?;
        assert_eq!(block.host_affinity(), Some("node-a"));
        let attrs = client.assignment_attributes(address).await?;
        assert_eq!(attrs.handle_id, Some(HandleId::new("h1")));
        assert_eq!(attrs.secondary, tags);

        let err = client
            .assign_ip(address, None, &Tags::new(), "node-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyAssigned { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_release_ips_reports_free_addresses() -> Result<()> {
        let client = client();
        let handle = HandleId::new("h1");
        client
            .assign_ip(ip("10.0.0.5"), Some(&handle), &Tags::new(), "node-a")
            .await?;

        let unallocated = client
            .release_ips(&[ip("10.0.0.5"), ip("10.0.0.6"), ip("10.8.0.1")].into())
            .await?;
        assert_eq!(unallocated, [ip("10.0.0.6"), ip("10.8.0.1")].into());

        // Affine block survives empty; the handle record is gone
        assert!(client.read_block(&net("10.0.0.0/26")).await?.is_empty());
        assert!(matches!(client.read_handle(&handle).await, Err(Error::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_release_deletes_empty_unowned_block() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let client = IpamClient::with_defaults(store.clone());
        let cidr = net("10.0.0.0/26");
        client.assign_ip(ip("10.0.0.1"), None, &Tags::new(), "node-a").await?;

        // Affinity cannot be dropped entirely while the block holds addresses
        client.release_block_affinity(cidr, "node-a").await?;
        assert_eq!(client.read_block(&cidr).await?.host_affinity(), None);

        client.release_ips(&[ip("10.0.0.1")].into()).await?;
        assert!(matches!(client.read_block(&cidr).await, Err(Error::NotFound(_))));
        assert!(store.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_release_block_affinity() -> Result<()> {
        let client = client();
        let cidr = net("10.0.0.0/26");

        assert!(matches!(
            client.release_block_affinity(cidr, "node-a").await,
            Err(Error::NotFound(_))
        ));

        client.claim_block_affinity(cidr, "node-a").await?;
        assert!(matches!(
            client.release_block_affinity(cidr, "node-b").await,
            Err(Error::HostAffinityClaimed { .. })
        ));

        client.release_block_affinity(cidr, "node-a").await?;
        assert!(matches!(client.read_block(&cidr).await, Err(Error::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_release_by_handle_across_blocks() -> Result<()> {
        let client = client();
        let handle = HandleId::new("wl-9");
        for address in ["10.0.0.1", "10.0.0.2", "10.0.1.1"] {
            client
                .assign_ip(ip(address), Some(&handle), &Tags::new(), "node-a")
                .await?;
        }
        client.assign_ip(ip("10.0.0.3"), None, &Tags::new(), "node-a").await?;

        assert_eq!(client.ip_assignments_by_handle(&handle).await?.len(), 3);
        assert_eq!(client.release_ip_by_handle(&handle).await?, 3);
        assert!(matches!(client.read_handle(&handle).await, Err(Error::NotFound(_))));

        let block = client.read_block(&net("10.0.0.0/26")).await?;
        assert_eq!(block.count_free_addresses(), 63);
        assert!(client.read_block(&net("10.0.1.0/26")).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_assignment_attributes_of_free_address() -> Result<()> {
        let client = client();
        let err = client.assignment_attributes(ip("10.0.0.1")).await.unwrap_err();
        assert!(matches!(err, Error::AddressNotAssigned { .. }));

        client.claim_block_affinity(net("10.0.0.0/26"), "node-a").await?;
        let err = client.assignment_attributes(ip("10.0.0.1")).await.unwrap_err();
        assert!(matches!(err, Error::AddressNotAssigned { .. }));
        Ok(())
    }
}
