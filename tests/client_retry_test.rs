//! Retry behaviour of the IPAM client under store write conflicts

use async_trait::async_trait;
use ipamblock::error::{Error, Result};
use ipamblock::store::KeyValue;
use ipamblock::{
    CasOutcome, HandleId, IpamClient, IpamConfig, KvStore, MemoryStore, Revision, Tags,
};
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Store that makes the next N block writes lose to a concurrent writer
///
/// A losing write bumps the stored record first, so the caller really is
/// holding a stale revision. Handle writes pass through untouched.
struct ContendedStore {
    inner: MemoryStore,
    conflicts: AtomicU32,
    block_writes: AtomicU32,
}

impl ContendedStore {
    fn new(conflicts: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            conflicts: AtomicU32::new(conflicts),
            block_writes: AtomicU32::new(0),
        }
    }

    fn set_conflicts(&self, conflicts: u32) {
        self.conflicts.store(conflicts, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> bool {
        self.conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KvStore for ContendedStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<Revision>,
    ) -> Result<CasOutcome> {
        if key.contains("/block/") {
            self.block_writes.fetch_add(1, Ordering::SeqCst);
            if expected.is_some() && self.take_conflict() {
                if let Some(current) = self.inner.get(key).await? {
                    self.inner
                        .compare_and_swap(key, current.value, Some(current.revision))
                        .await?;
                }
                return Ok(CasOutcome::Conflict);
            }
        }
        self.inner.compare_and_swap(key, value, expected).await
    }

    async fn delete(&self, key: &str, expected: Revision) -> Result<CasOutcome> {
        self.inner.delete(key, expected).await
    }
}

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn client_with(store: Arc<ContendedStore>, max_retries: u32) -> IpamClient<ContendedStore> {
    let config = IpamConfig {
        max_retries,
        ..Default::default()
    };
    IpamClient::new(store, config)
}

#[tokio::test]
async fn test_conflict_retries_to_single_assignment() -> Result<()> {
    let store = Arc::new(ContendedStore::new(0));
    let client = client_with(store.clone(), 10);
    let cidr = net("10.0.0.0/26");
    let handle = HandleId::new("h1");
    client.claim_block_affinity(cidr, "node-a").await?;

    store.set_conflicts(3);
    let addresses = client
        .auto_assign_in_block(cidr, 2, Some(&handle), &Tags::new(), "node-a", true)
        .await?;
    assert_eq!(addresses, vec![ip("10.0.0.0"), ip("10.0.0.1")]);

    let block = client.read_block(&cidr).await?;
    assert_eq!(block.count_free_addresses(), 62);
    assert!(block.verify().is_ok());

    // Lost attempts were rolled back from the handle
    assert_eq!(client.read_handle(&handle).await?.count_for(&cidr), 2);
    Ok(())
}

#[tokio::test]
async fn test_persistent_conflict_exhausts_retries() -> Result<()> {
    let store = Arc::new(ContendedStore::new(0));
    let client = client_with(store.clone(), 5);
    let cidr = net("10.0.0.0/26");
    let handle = HandleId::new("h1");
    client.claim_block_affinity(cidr, "node-a").await?;

    store.set_conflicts(u32::MAX);
    let before = store.block_writes.load(Ordering::SeqCst);
    let err = client
        .assign_ip(ip("10.0.0.9"), Some(&handle), &Tags::new(), "node-a")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::RetriesExhausted { operation: "assign_ip", attempts: 5, .. }
    ));
    assert_eq!(store.block_writes.load(Ordering::SeqCst) - before, 5);
    assert!(client.read_block(&cidr).await?.is_empty());
    // Every increment was matched by a rollback
    assert!(matches!(client.read_handle(&handle).await, Err(Error::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_release_retries_and_deletes_handle() -> Result<()> {
    let store = Arc::new(ContendedStore::new(0));
    let client = client_with(store.clone(), 10);
    let handle = HandleId::new("wl-1");
    for address in ["10.0.0.1", "10.0.0.2"] {
        client
            .assign_ip(ip(address), Some(&handle), &Tags::new(), "node-a")
            .await?;
    }

    store.set_conflicts(2);
    let unallocated = client
        .release_ips(&BTreeSet::from([ip("10.0.0.1"), ip("10.0.0.3")]))
        .await?;
    assert_eq!(unallocated, BTreeSet::from([ip("10.0.0.3")]));
    assert_eq!(client.read_handle(&handle).await?.count_for(&net("10.0.0.0/26")), 1);

    store.set_conflicts(2);
    assert_eq!(client.release_ip_by_handle(&handle).await?, 1);
    assert!(matches!(client.read_handle(&handle).await, Err(Error::NotFound(_))));
    assert!(client.read_block(&net("10.0.0.0/26")).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_clients_never_double_assign() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let cidr = net("10.0.0.0/26");
    IpamClient::with_defaults(store.clone())
        .claim_block_affinity(cidr, "node-a")
        .await?;

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let client = IpamClient::with_defaults(store.clone());
        tasks.push(tokio::spawn(async move {
            let handle = HandleId::new(format!("worker-{}", worker));
            client
                .auto_assign_in_block(cidr, 4, Some(&handle), &Tags::new(), "node-a", true)
                .await
        }));
    }

    let mut assigned = BTreeSet::new();
    for task in tasks {
        let addresses = task.await.expect("task panicked")?;
        assert_eq!(addresses.len(), 4);
        for address in addresses {
            assert!(assigned.insert(address), "{} assigned twice", address);
        }
    }

    let client = IpamClient::with_defaults(store);
    let block = client.read_block(&cidr).await?;
    assert_eq!(block.count_free_addresses(), 64 - 32);
    for worker in 0..8 {
        let handle = HandleId::new(format!("worker-{}", worker));
        assert_eq!(client.ip_assignments_by_handle(&handle).await?.len(), 4);
    }
    Ok(())
}
