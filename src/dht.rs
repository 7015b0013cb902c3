//! # Kademlia Routing Table
//!
//! - 256 k-buckets indexed by the highest differing bit of the XOR distance
//! - each bucket sits behind its own lock, so work on different buckets never contends
//! - full buckets resolve insertions with a liveness challenge (see below)
//! - iterative `FIND_NODE` lookups with α parallel queries per round
//! - rendezvous provider records (`ADD_PROVIDER` / `GET_PROVIDERS`)
//!
//! ## Liveness Challenge
//!
//! When a contact arrives for a full bucket, both the least-recently-seen
//! incumbent and the newcomer are pinged. The incumbent is evicted only if it
//! fails and the newcomer answers; in every other case the newcomer is dropped.
//! A bucket has at most one challenge in flight, so a burst of newcomers cannot
//! turn into a burst of pings.
//!
//! ## Maintenance
//!
//! | Task | Period | Effect |
//! |------|--------|--------|
//! | bucket refresh | `refresh_check_interval` | lookup a random id in buckets untouched for `bucket_stale_after` |
//! | staleness sweep | `sweep_interval` | ping contacts unseen for `stale_after`, remove the silent ones |
//! | provider expiry | `sweep_interval` | drop provider records past their TTL |

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::LookupTimeout;
use crate::identity::{Contact, Identity, distance_cmp};
use crate::protocols::{DhtNodeRpc, PeerSource};

/// 32-byte DHT key; rendezvous keys are `blake3(rendezvous string)`.
pub type Key = [u8; 32];

pub const DEFAULT_K: usize = 20;
pub const DEFAULT_ALPHA: usize = 3;

const NUM_BUCKETS: usize = 256;

/// Pings in flight during one staleness sweep.
const SWEEP_CONCURRENCY: usize = 16;

const MAX_PROVIDER_KEYS: usize = 1024;
const MAX_PROVIDERS_PER_KEY: usize = 64;

#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Bucket capacity and lookup result size.
    pub k: usize,
    /// Parallel queries per lookup round.
    pub alpha: usize,
    pub per_query_timeout: Duration,
    pub lookup_timeout: Duration,
    pub max_lookup_iterations: usize,
    /// Contacts unseen for this long are probed by the sweep.
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    /// Buckets untouched for this long are refreshed with a random lookup.
    pub bucket_stale_after: Duration,
    pub refresh_check_interval: Duration,
    pub provider_ttl: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            per_query_timeout: Duration::from_secs(3),
            lookup_timeout: Duration::from_secs(10),
            max_lookup_iterations: 20,
            stale_after: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            bucket_stale_after: Duration::from_secs(30 * 60),
            refresh_check_interval: Duration::from_secs(5 * 60),
            provider_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct RoutingBucket {
    /// Least-recently-seen first.
    contacts: Vec<Contact>,
    last_refresh: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Refreshed,
    /// Bucket full; the caller must resolve the challenge.
    Challenge(PendingChallenge),
    /// Self, invalid id, or a challenge is already running for the bucket.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    bucket_index: usize,
    pub incumbent: Contact,
    pub newcomer: Contact,
}

/// Newest addresses first, duplicates dropped, bounded.
fn merge_addrs(newer: &[String], older: &[String]) -> Vec<String> {
    const MAX_ADDRS: usize = 16;
    let mut out: Vec<String> = Vec::with_capacity(newer.len() + older.len());
    for addr in newer.iter().chain(older) {
        if out.len() == MAX_ADDRS {
            break;
        }
        if !out.contains(addr) {
            out.push(addr.clone());
        }
    }
    out
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn position(&self, id: &Identity) -> Option<usize> {
        self.contacts.iter().position(|c| &c.identity == id)
    }

    /// Move `id` to the most-recently-seen end and stamp it.
    fn mark_seen(&mut self, id: &Identity) -> bool {
        let Some(pos) = self.position(id) else {
            return false;
        };
        let mut existing = self.contacts.remove(pos);
        existing.touch();
        self.contacts.push(existing);
        self.last_refresh = Instant::now();
        true
    }

    fn remove(&mut self, id: &Identity) -> Option<Contact> {
        self.position(id).map(|pos| self.contacts.remove(pos))
    }
}

/// Highest differing bit between two ids, counting from the most significant; 255 if equal.
pub fn bucket_index(self_id: &Identity, other: &Identity) -> usize {
    let dist = self_id.xor_distance(other);
    dist.iter()
        .enumerate()
        .find(|(_, byte)| **byte != 0)
        .map(|(i, byte)| i * 8 + byte.leading_zeros() as usize)
        .unwrap_or(NUM_BUCKETS - 1)
}

/// A random id whose distance from `self_id` falls into `bucket_idx`.
fn random_id_for_bucket(self_id: &Identity, bucket_idx: usize) -> Identity {
    let mut distance = [0u8; 32];
    if getrandom::getrandom(&mut distance).is_err() {
        distance = *blake3::hash(&(bucket_idx as u64).to_le_bytes()).as_bytes();
    }

    let byte_idx = bucket_idx / 8;
    let target_bit = 0x80u8 >> (bucket_idx % 8);
    distance[..byte_idx].fill(0);
    distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

    let self_bytes = self_id.as_bytes();
    let mut target = [0u8; 32];
    for (i, byte) in target.iter_mut().enumerate() {
        *byte = self_bytes[i] ^ distance[i];
    }
    Identity::from_bytes(target)
}

fn sort_by_distance(contacts: &mut [Contact], target: &Identity) {
    contacts.sort_by(|a, b| {
        distance_cmp(&a.identity.xor_distance(target), &b.identity.xor_distance(target))
    });
}

/// Routing table with one lock per bucket.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: Identity,
    k: usize,
    buckets: Vec<RwLock<RoutingBucket>>,
    challenged: Mutex<HashSet<usize>>,
}

impl RoutingTable {
    pub fn new(self_id: Identity, k: usize) -> Self {
        Self {
            self_id,
            k: k.max(1),
            buckets: (0..NUM_BUCKETS).map(|_| RwLock::new(RoutingBucket::new())).collect(),
            challenged: Mutex::new(HashSet::new()),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn read(&self, idx: usize) -> RwLockReadGuard<'_, RoutingBucket> {
        self.buckets[idx].read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, idx: usize) -> RwLockWriteGuard<'_, RoutingBucket> {
        self.buckets[idx].write().unwrap_or_else(|e| e.into_inner())
    }

    fn challenged(&self) -> std::sync::MutexGuard<'_, HashSet<usize>> {
        self.challenged.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a contact that just proved itself alive.
    pub fn insert(&self, mut contact: Contact) -> InsertOutcome {
        if contact.identity == self.self_id || !contact.identity.is_valid() {
            return InsertOutcome::Rejected;
        }
        contact.touch();
        let idx = bucket_index(&self.self_id, &contact.identity);
        let mut bucket = self.write(idx);

        if let Some(pos) = bucket.position(&contact.identity) {
            let existing = bucket.contacts.remove(pos);
            contact.addrs = merge_addrs(&contact.addrs, &existing.addrs);
            bucket.contacts.push(contact);
            bucket.last_refresh = Instant::now();
            return InsertOutcome::Refreshed;
        }

        if bucket.contacts.len() < self.k {
            bucket.contacts.push(contact);
            bucket.last_refresh = Instant::now();
            return InsertOutcome::Inserted;
        }

        let Some(incumbent) = bucket.contacts.first().cloned() else {
            return InsertOutcome::Rejected;
        };
        drop(bucket);

        if !self.challenged().insert(idx) {
            return InsertOutcome::Rejected;
        }
        InsertOutcome::Challenge(PendingChallenge {
            bucket_index: idx,
            incumbent,
            newcomer: contact,
        })
    }

    /// Apply the outcome of a liveness challenge.
    pub fn resolve_challenge(&self, challenge: PendingChallenge, incumbent_alive: bool, newcomer_alive: bool) {
        let idx = challenge.bucket_index;
        {
            let mut bucket = self.write(idx);
            if incumbent_alive {
                bucket.mark_seen(&challenge.incumbent.identity);
            } else if newcomer_alive {
                bucket.remove(&challenge.incumbent.identity);
                if bucket.position(&challenge.newcomer.identity).is_none() && bucket.contacts.len() < self.k {
                    let mut newcomer = challenge.newcomer;
                    newcomer.touch();
                    bucket.contacts.push(newcomer);
                    bucket.last_refresh = Instant::now();
                }
            }
        }
        self.challenged().remove(&idx);
    }

    pub fn remove(&self, id: &Identity) -> Option<Contact> {
        if *id == self.self_id {
            return None;
        }
        self.write(bucket_index(&self.self_id, id)).remove(id)
    }

    pub fn mark_seen(&self, id: &Identity) -> bool {
        if *id == self.self_id {
            return false;
        }
        self.write(bucket_index(&self.self_id, id)).mark_seen(id)
    }

    pub fn get(&self, id: &Identity) -> Option<Contact> {
        if *id == self.self_id {
            return None;
        }
        let bucket = self.read(bucket_index(&self.self_id, id));
        bucket.position(id).map(|pos| bucket.contacts[pos].clone())
    }

    /// Up to `count` known contacts in non-decreasing XOR distance from `target`.
    pub fn lookup(&self, target: &Identity, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        struct ByDistance {
            dist: [u8; 32],
            contact: Contact,
        }
        impl PartialEq for ByDistance {
            fn eq(&self, other: &Self) -> bool {
                self.dist == other.dist
            }
        }
        impl Eq for ByDistance {}
        impl PartialOrd for ByDistance {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for ByDistance {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        // Max-heap of the best `count` so far; the root is the worst kept entry.
        let mut heap: BinaryHeap<ByDistance> = BinaryHeap::with_capacity(count + 1);
        for idx in 0..NUM_BUCKETS {
            let bucket = self.read(idx);
            for contact in &bucket.contacts {
                let dist = contact.identity.xor_distance(target);
                if heap.len() < count {
                    heap.push(ByDistance { dist, contact: contact.clone() });
                } else if heap.peek().is_some_and(|worst| distance_cmp(&dist, &worst.dist).is_lt()) {
                    heap.pop();
                    heap.push(ByDistance { dist, contact: contact.clone() });
                }
            }
        }

        heap.into_sorted_vec().into_iter().map(|e| e.contact).collect()
    }

    pub fn len(&self) -> usize {
        (0..NUM_BUCKETS).map(|idx| self.read(idx).contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contacts not seen within `stale_after`.
    pub fn stale_contacts(&self, stale_after: Duration) -> Vec<Contact> {
        let limit = stale_after.as_millis() as u64;
        (0..NUM_BUCKETS)
            .flat_map(|idx| {
                self.read(idx)
                    .contacts
                    .iter()
                    .filter(|c| c.age_ms() > limit)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        (0..NUM_BUCKETS)
            .filter(|&idx| {
                let bucket = self.read(idx);
                !bucket.contacts.is_empty() && bucket.last_refresh.elapsed() > threshold
            })
            .collect()
    }

    fn mark_bucket_refreshed(&self, idx: usize) {
        if idx < NUM_BUCKETS {
            self.write(idx).last_refresh = Instant::now();
        }
    }

    #[cfg(test)]
    fn bucket_len(&self, idx: usize) -> usize {
        self.read(idx).contacts.len()
    }
}

struct ProviderRecord {
    contact: Contact,
    expires: Instant,
}

/// Rendezvous provider records held on behalf of other peers.
#[derive(Default)]
struct ProviderStore {
    records: HashMap<Key, Vec<ProviderRecord>>,
}

impl ProviderStore {
    fn add(&mut self, key: Key, contact: Contact, ttl: Duration) {
        if !self.records.contains_key(&key) && self.records.len() >= MAX_PROVIDER_KEYS {
            warn!(key = %hex::encode(&key[..8]), "provider store full, dropping record");
            return;
        }
        let expires = Instant::now() + ttl;
        let entry = self.records.entry(key).or_default();
        if let Some(existing) = entry.iter_mut().find(|r| r.contact.identity == contact.identity) {
            existing.contact.addrs = merge_addrs(&contact.addrs, &existing.contact.addrs);
            existing.expires = expires;
            return;
        }
        if entry.len() >= MAX_PROVIDERS_PER_KEY {
            // Drop whichever record would expire first.
            if let Some(pos) = entry
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.expires)
                .map(|(i, _)| i)
            {
                entry.swap_remove(pos);
            }
        }
        entry.push(ProviderRecord { contact, expires });
    }

    fn get(&self, key: &Key) -> Vec<Contact> {
        let now = Instant::now();
        self.records
            .get(key)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.expires > now)
                    .map(|r| r.contact.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn expire(&mut self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.records.retain(|_, records| {
            let before = records.len();
            records.retain(|r| r.expires > now);
            removed += before - records.len();
            !records.is_empty()
        });
        removed
    }
}

enum LookupMode {
    Nodes,
    Providers(Key),
}

struct LookupOutcome {
    closest: Vec<Contact>,
    providers: Vec<Contact>,
}

enum RoundResult {
    Done(Vec<(Contact, anyhow::Result<(Vec<Contact>, Vec<Contact>)>)>),
    TimedOut,
    Cancelled,
}

struct DhtInner<N> {
    self_contact: Contact,
    network: N,
    routing: RoutingTable,
    providers: Mutex<ProviderStore>,
    config: DhtConfig,
}

pub struct DhtNode<N: DhtNodeRpc> {
    inner: Arc<DhtInner<N>>,
}

impl<N: DhtNodeRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<N: DhtNodeRpc> DhtNode<N> {
    pub fn new(self_contact: Contact, network: N, config: DhtConfig) -> Self {
        let routing = RoutingTable::new(self_contact.identity, config.k);
        Self {
            inner: Arc::new(DhtInner {
                self_contact,
                network,
                routing,
                providers: Mutex::new(ProviderStore::default()),
                config,
            }),
        }
    }

    pub fn identity(&self) -> Identity {
        self.inner.self_contact.identity
    }

    pub fn contact(&self) -> Contact {
        self.inner.self_contact.clone()
    }

    pub fn network(&self) -> &N {
        &self.inner.network
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    fn providers(&self) -> std::sync::MutexGuard<'_, ProviderStore> {
        self.inner.providers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a contact that just completed an exchange with us.
    pub async fn observe_contact(&self, contact: Contact) {
        if !contact.validate_structure() {
            trace!(peer = %contact.identity.short(), "ignoring malformed contact");
            return;
        }
        match self.inner.routing.insert(contact) {
            InsertOutcome::Challenge(challenge) => self.spawn_challenge(challenge),
            InsertOutcome::Inserted => trace!("routing table grew to {}", self.inner.routing.len()),
            InsertOutcome::Refreshed | InsertOutcome::Rejected => {}
        }
    }

    fn spawn_challenge(&self, challenge: PendingChallenge) {
        let node = self.clone();
        tokio::spawn(async move {
            let (incumbent_alive, newcomer_alive) =
                tokio::join!(node.probe(&challenge.incumbent), node.probe(&challenge.newcomer));
            debug!(
                incumbent = %challenge.incumbent.identity.short(),
                newcomer = %challenge.newcomer.identity.short(),
                incumbent_alive,
                newcomer_alive,
                "bucket challenge resolved"
            );
            node.inner
                .routing
                .resolve_challenge(challenge, incumbent_alive, newcomer_alive);
        });
    }

    /// Ping with the per-query timeout.
    pub async fn probe(&self, contact: &Contact) -> bool {
        matches!(
            tokio::time::timeout(self.inner.config.per_query_timeout, self.inner.network.ping(contact)).await,
            Ok(Ok(()))
        )
    }

    pub fn remove(&self, id: &Identity) -> Option<Contact> {
        self.inner.routing.remove(id)
    }

    /// Up to `count` known contacts closest to `target`.
    pub fn lookup(&self, target: &Identity, count: usize) -> Vec<Contact> {
        self.inner.routing.lookup(target, count)
    }

    pub fn get_contact(&self, id: &Identity) -> Option<Contact> {
        self.inner.routing.get(id)
    }

    pub async fn handle_find_node_request(&self, from: &Contact, target: Identity) -> Vec<Contact> {
        self.observe_contact(from.clone()).await;
        self.lookup(&target, self.inner.config.k)
    }

    pub async fn handle_add_provider(&self, from: &Contact, key: Key) {
        self.observe_contact(from.clone()).await;
        if from.addrs.is_empty() {
            return;
        }
        let ttl = self.inner.config.provider_ttl;
        self.providers().add(key, from.clone(), ttl);
    }

    pub async fn handle_get_providers(&self, from: &Contact, key: Key) -> (Vec<Contact>, Vec<Contact>) {
        self.observe_contact(from.clone()).await;
        let providers = self.providers().get(&key);
        let closer = self.lookup(&Identity::from_bytes(key), self.inner.config.k);
        (providers, closer)
    }

    /// Iterative FIND_NODE toward `target`.
    ///
    /// Always returns the best contacts found so far; a timeout or cancellation
    /// only shortens the search.
    pub async fn iterative_find_node(&self, target: Identity, cancel: &CancellationToken) -> Vec<Contact> {
        self.iterative_lookup(target, LookupMode::Nodes, Vec::new(), cancel)
            .await
            .closest
    }

    /// Self-lookup seeded with contacts that may not be in the routing table yet.
    pub async fn lookup_with_seeds(&self, seeds: Vec<Contact>, cancel: &CancellationToken) -> Vec<Contact> {
        let target = self.identity();
        self.iterative_lookup(target, LookupMode::Nodes, seeds, cancel)
            .await
            .closest
    }

    /// Advertise this node under `key` on the peers closest to it. Returns how many accepted.
    pub async fn add_provider(&self, key: Key, cancel: &CancellationToken) -> usize {
        let ttl = self.inner.config.provider_ttl;
        self.providers().add(key, self.contact(), ttl);

        let closest = self.iterative_find_node(Identity::from_bytes(key), cancel).await;
        let mut join_set = JoinSet::new();
        for contact in closest {
            let node = self.clone();
            join_set.spawn(async move {
                let fut = node.inner.network.add_provider(&contact, key);
                matches!(
                    tokio::time::timeout(node.inner.config.per_query_timeout, fut).await,
                    Ok(Ok(()))
                )
            });
        }

        let mut stored = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                joined = join_set.join_next() => match joined {
                    Some(Ok(true)) => stored += 1,
                    Some(_) => {}
                    None => break,
                },
            }
        }
        debug!(key = %hex::encode(&key[..8]), stored, "provider record announced");
        stored
    }

    /// Providers for `key` from the local store and the peers closest to it, self excluded.
    pub async fn get_providers(&self, key: Key, cancel: &CancellationToken) -> Vec<Contact> {
        let outcome = self
            .iterative_lookup(Identity::from_bytes(key), LookupMode::Providers(key), Vec::new(), cancel)
            .await;

        let mut seen = HashSet::new();
        self.providers()
            .get(&key)
            .into_iter()
            .chain(outcome.providers)
            .filter(|c| c.identity != self.identity() && seen.insert(c.identity))
            .collect()
    }

    async fn iterative_lookup(
        &self,
        target: Identity,
        mode: LookupMode,
        seeds: Vec<Contact>,
        cancel: &CancellationToken,
    ) -> LookupOutcome {
        let config = &self.inner.config;
        let self_id = self.identity();
        let started = Instant::now();
        let deadline = started + config.lookup_timeout;

        let mut shortlist = self.lookup(&target, config.k);
        let mut seen: HashSet<Identity> = shortlist.iter().map(|c| c.identity).collect();
        for seed in seeds {
            if seed.identity != self_id && seen.insert(seed.identity) {
                shortlist.push(seed);
            }
        }
        sort_by_distance(&mut shortlist, &target);

        let mut queried: HashSet<Identity> = HashSet::new();
        let mut providers: Vec<Contact> = Vec::new();
        let mut provider_ids: HashSet<Identity> = HashSet::new();
        let mut best = shortlist
            .first()
            .map(|c| c.identity.xor_distance(&target))
            .unwrap_or([0xff; 32]);

        for iteration in 0..config.max_lookup_iterations {
            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.identity))
                .take(config.alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            queried.extend(candidates.iter().map(|c| c.identity));

            let mut join_set = JoinSet::new();
            for contact in candidates {
                let network_node = self.clone();
                let key = match mode {
                    LookupMode::Nodes => None,
                    LookupMode::Providers(key) => Some(key),
                };
                let per_query = config.per_query_timeout;
                join_set.spawn(async move {
                    let net = &network_node.inner.network;
                    let query = async {
                        match key {
                            None => net.find_node(&contact, target).await.map(|n| (n, Vec::new())),
                            Some(key) => net.get_providers(&contact, key).await.map(|(p, closer)| (closer, p)),
                        }
                    };
                    let result = match tokio::time::timeout(per_query, query).await {
                        Ok(r) => r,
                        Err(_) => Err(anyhow::anyhow!("query timed out")),
                    };
                    (contact, result)
                });
            }

            let collect = async {
                let mut out = Vec::new();
                while let Some(joined) = join_set.join_next().await {
                    if let Ok(r) = joined {
                        out.push(r);
                    }
                }
                out
            };
            let round = tokio::select! {
                biased;
                _ = cancel.cancelled() => RoundResult::Cancelled,
                r = tokio::time::timeout_at(deadline, collect) => match r {
                    Ok(results) => RoundResult::Done(results),
                    Err(_) => RoundResult::TimedOut,
                },
            };

            let results = match round {
                RoundResult::Done(results) => results,
                RoundResult::TimedOut => {
                    let timeout = LookupTimeout {
                        elapsed: started.elapsed(),
                        partial: shortlist.len(),
                    };
                    debug!(target = %target.short(), "{timeout}");
                    break;
                }
                RoundResult::Cancelled => {
                    trace!(target = %target.short(), "lookup cancelled");
                    break;
                }
            };

            let mut failed: HashSet<Identity> = HashSet::new();
            for (contact, result) in results {
                match result {
                    Ok((nodes, found_providers)) => {
                        self.observe_contact(contact).await;
                        for n in nodes {
                            if n.identity != self_id && n.identity.is_valid() && seen.insert(n.identity) {
                                shortlist.push(n);
                            }
                        }
                        for p in found_providers {
                            if provider_ids.insert(p.identity) {
                                providers.push(p);
                            }
                        }
                    }
                    Err(e) => {
                        trace!(peer = %contact.identity.short(), error = %e, "lookup query failed");
                        failed.insert(contact.identity);
                    }
                }
            }

            shortlist.retain(|c| !failed.contains(&c.identity));
            sort_by_distance(&mut shortlist, &target);
            shortlist.truncate(config.k);

            let Some(first) = shortlist.first() else {
                break;
            };
            let new_best = first.identity.xor_distance(&target);
            if distance_cmp(&new_best, &best).is_lt() {
                best = new_best;
            } else {
                trace!(target = %target.short(), iteration, "lookup converged");
                break;
            }
        }

        debug!(
            target = %target.short(),
            found = shortlist.len(),
            queried = queried.len(),
            providers = providers.len(),
            "iterative lookup finished"
        );
        LookupOutcome {
            closest: shortlist,
            providers,
        }
    }

    /// Spawn bucket refresh, staleness sweep and provider expiry, all tied to `cancel`.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) {
        let node = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.inner.config.refresh_check_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => node.refresh_stale_buckets(&token).await,
                }
            }
        });

        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.inner.config.sweep_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        node.sweep_stale_contacts().await;
                        let expired = node.providers().expire();
                        if expired > 0 {
                            debug!(expired, "expired provider records");
                        }
                    }
                }
            }
        });
    }

    async fn refresh_stale_buckets(&self, cancel: &CancellationToken) {
        let stale = self
            .inner
            .routing
            .stale_bucket_indices(self.inner.config.bucket_stale_after);
        if stale.is_empty() {
            return;
        }
        debug!(count = stale.len(), "refreshing stale buckets");
        for idx in stale {
            if cancel.is_cancelled() {
                return;
            }
            let target = random_id_for_bucket(&self.identity(), idx);
            self.iterative_find_node(target, cancel).await;
            self.inner.routing.mark_bucket_refreshed(idx);
        }
    }

    /// Ping contacts not seen recently and drop the ones that stay silent.
    pub async fn sweep_stale_contacts(&self) -> usize {
        let stale = self.inner.routing.stale_contacts(self.inner.config.stale_after);
        if stale.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for chunk in stale.chunks(SWEEP_CONCURRENCY) {
            let mut join_set = JoinSet::new();
            for contact in chunk.iter().cloned() {
                let node = self.clone();
                join_set.spawn(async move {
                    let alive = node.probe(&contact).await;
                    (contact, alive)
                });
            }
            while let Some(joined) = join_set.join_next().await {
                let Ok((contact, alive)) = joined else { continue };
                if alive {
                    self.inner.routing.mark_seen(&contact.identity);
                } else if self.inner.routing.remove(&contact.identity).is_some() {
                    debug!(peer = %contact.identity.short(), "removed unresponsive contact");
                    removed += 1;
                }
            }
        }
        removed
    }
}

impl<N: DhtNodeRpc> PeerSource for DhtNode<N> {
    fn candidates(&self, count: usize) -> Vec<Contact> {
        self.lookup(&self.identity(), count)
    }
}
