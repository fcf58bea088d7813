use crate::dns::DnsClient;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// A concrete peer: resolved address plus the host name it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub ip: IpAddr,
    pub port: u16,
    pub hostname: String,
}

/// Ring membership change, delivered to the installed callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingAction {
    Added,
    Removed,
}

pub type RingCallback = Box<dyn Fn(RingAction, &PeerAddr) + Send + Sync>;

#[derive(Debug)]
pub enum RingError {
    NoPeersAvailable,
    Internal(String),
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingError::NoPeersAvailable => write!(f, "No peers are available"),
            RingError::Internal(msg) => write!(f, "ring error: {}", msg),
        }
    }
}

impl std::error::Error for RingError {}

#[derive(Debug, Clone)]
struct Host {
    name: String,
    port: u16,
    weight: u32,
}

/// Immutable wheel snapshot. Mutations rebuild and swap it whole;
/// `get_peer` reads are lock-free.
struct WheelState {
    hosts: Vec<Host>,
    /// slot → index into `hosts`. Deterministically permuted.
    wheel: Vec<u32>,
}

type HostKey = (String, u16);

/// Weighted consistent-hash ring over (host, port, weight) assignments.
///
/// Host names resolve through the injected DNS client: literal addresses
/// materialise on add, hostnames materialise lazily at selection time
/// (authoritative on a first attempt, cache-only on retries). Identical
/// inputs — wheel size, permutation seed, and add/remove sequence —
/// produce an identical wheel on every worker.
pub struct Ring {
    wheel_size: u32,
    seed: u64,
    dns: Arc<dyn DnsClient>,
    state: ArcSwap<WheelState>,
    /// Mutation source of truth. Critical sections are short and never
    /// cross an await.
    hosts: Mutex<Vec<Host>>,
    addresses: DashMap<HostKey, Arc<PeerAddr>>,
    health: DashMap<(IpAddr, u16), bool>,
    rr_counter: AtomicU64,
    callback: RwLock<Option<RingCallback>>,
}

impl Ring {
    pub fn new(wheel_size: u32, seed: u64, dns: Arc<dyn DnsClient>) -> Self {
        Self {
            wheel_size: wheel_size.max(1),
            seed,
            dns,
            state: ArcSwap::from_pointee(WheelState {
                hosts: Vec::new(),
                wheel: Vec::new(),
            }),
            hosts: Mutex::new(Vec::new()),
            addresses: DashMap::new(),
            health: DashMap::new(),
            rr_counter: AtomicU64::new(0),
            callback: RwLock::new(None),
        }
    }

    /// Installs the membership callback. Addresses materialised from this
    /// point on are announced; earlier ones are not replayed.
    pub fn set_callback(&self, callback: RingCallback) {
        *self.callback.write().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    fn notify(&self, action: RingAction, addr: &PeerAddr) {
        let guard = self.callback.read().unwrap_or_else(|e| e.into_inner());
        if let Some(cb) = guard.as_ref() {
            cb(action, addr);
        }
    }

    /// Adds (or re-weights) a host. Literal-IP hosts materialise their
    /// address immediately.
    pub fn add_host(&self, name: &str, port: u16, weight: u32) -> Result<(), RingError> {
        {
            let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
            match hosts.iter_mut().find(|h| h.name == name && h.port == port) {
                Some(host) => host.weight = weight,
                None => hosts.push(Host {
                    name: name.to_string(),
                    port,
                    weight,
                }),
            }
            self.rebuild_locked(&hosts);
        }

        if let Ok(ip) = name.parse::<IpAddr>() {
            let key = (name.to_string(), port);
            if !self.addresses.contains_key(&key) {
                let addr = Arc::new(PeerAddr {
                    ip,
                    port,
                    hostname: name.to_string(),
                });
                self.addresses.insert(key, addr.clone());
                self.notify(RingAction::Added, &addr);
            }
        }
        Ok(())
    }

    /// Removes a host. Removing an unknown (name, port) is a no-op.
    pub fn remove_host(&self, name: &str, port: u16) -> Result<(), RingError> {
        {
            let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
            let before = hosts.len();
            hosts.retain(|h| !(h.name == name && h.port == port));
            if hosts.len() == before {
                return Ok(());
            }
            self.rebuild_locked(&hosts);
        }

        if let Some((_, addr)) = self.addresses.remove(&(name.to_string(), port)) {
            self.health.remove(&(addr.ip, addr.port));
            self.notify(RingAction::Removed, &addr);
        }
        Ok(())
    }

    fn rebuild_locked(&self, hosts: &[Host]) {
        let wheel = build_wheel(hosts, self.wheel_size, self.seed);
        self.state.store(Arc::new(WheelState {
            hosts: hosts.to_vec(),
            wheel,
        }));
    }

    /// Selects a peer. A hash pins the start slot (consistent mapping);
    /// without one a round-robin counter walks the wheel. `try_count`
    /// advances to the next distinct host past the one a previous attempt
    /// failed on, and selects the DNS mode for hostname materialisation.
    pub async fn get_peer(
        &self,
        hash: Option<u32>,
        try_count: u32,
        cache_only: bool,
    ) -> Result<Arc<PeerAddr>, RingError> {
        let state = self.state.load_full();
        if state.wheel.is_empty() {
            return Err(RingError::NoPeersAvailable);
        }

        let base = match hash {
            Some(h) => h as u64,
            None => self.rr_counter.fetch_add(1, Ordering::Relaxed),
        };
        let len = state.wheel.len() as u64;
        let start = (base % len) as usize;

        // Distinct candidate hosts in wheel-walk order from the start slot.
        let mut candidates: Vec<u32> = Vec::new();
        for offset in 0..state.wheel.len() {
            let host_idx = state.wheel[(start + offset) % state.wheel.len()];
            if !candidates.contains(&host_idx) {
                candidates.push(host_idx);
            }
        }

        let skip = try_count as usize % candidates.len();
        for &host_idx in candidates.iter().cycle().skip(skip).take(candidates.len()) {
            let host = &state.hosts[host_idx as usize];
            let addr = match self.materialize(host, cache_only).await {
                Some(addr) => addr,
                None => continue,
            };
            if self.is_healthy(addr.ip, addr.port) {
                return Ok(addr);
            }
        }

        Err(RingError::NoPeersAvailable)
    }

    async fn materialize(&self, host: &Host, cache_only: bool) -> Option<Arc<PeerAddr>> {
        let key = (host.name.clone(), host.port);
        if let Some(addr) = self.addresses.get(&key) {
            return Some(addr.clone());
        }

        match self.dns.resolve(&host.name, host.port, cache_only).await {
            Ok((ip, port)) => {
                let addr = Arc::new(PeerAddr {
                    ip,
                    port,
                    hostname: host.name.clone(),
                });
                let (addr, inserted) = match self.addresses.entry(key) {
                    dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), false),
                    dashmap::mapref::entry::Entry::Vacant(e) => {
                        e.insert(addr.clone());
                        (addr, true)
                    }
                };
                if inserted {
                    self.notify(RingAction::Added, &addr);
                }
                Some(addr)
            }
            Err(e) => {
                debug!(
                    "ring: resolution skipped, host={}:{}, cache_only={}, error={}",
                    host.name, host.port, cache_only, e
                );
                None
            }
        }
    }

    /// Marks a peer healthy or unhealthy. Unknown peers default healthy.
    pub fn set_peer_status(&self, healthy: bool, ip: IpAddr, port: u16, _hostname: &str) {
        self.health.insert((ip, port), healthy);
    }

    pub fn is_healthy(&self, ip: IpAddr, port: u16) -> bool {
        self.health.get(&(ip, port)).map(|v| *v).unwrap_or(true)
    }

    /// Currently materialised addresses with their host weights — the
    /// seed set for a health checker.
    pub fn addresses(&self) -> Vec<(u32, Arc<PeerAddr>)> {
        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts
            .iter()
            .filter_map(|h| {
                self.addresses
                    .get(&(h.name.clone(), h.port))
                    .map(|a| (h.weight, a.clone()))
            })
            .collect()
    }

    /// (name, port, weight) triples in insertion order. Test and
    /// inspection surface.
    pub fn host_weights(&self) -> Vec<(String, u16, u32)> {
        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts
            .iter()
            .map(|h| (h.name.clone(), h.port, h.weight))
            .collect()
    }

    pub fn wheel_size(&self) -> u32 {
        self.wheel_size
    }
}

/// Largest-remainder apportionment of wheel slots over host weights,
/// followed by a seeded shuffle. Same inputs, same wheel.
fn build_wheel(hosts: &[Host], wheel_size: u32, seed: u64) -> Vec<u32> {
    let weighted: Vec<(usize, u64)> = hosts
        .iter()
        .enumerate()
        .filter(|(_, h)| h.weight > 0)
        .map(|(i, h)| (i, h.weight as u64))
        .collect();
    let total: u64 = weighted.iter().map(|(_, w)| w).sum();
    if total == 0 {
        return Vec::new();
    }

    let size = wheel_size as u64;
    let mut shares: Vec<(usize, u64, u64)> = weighted
        .iter()
        .map(|&(i, w)| (i, size * w / total, size * w % total))
        .collect();

    let assigned: u64 = shares.iter().map(|(_, base, _)| base).sum();
    let mut leftover = size - assigned;
    // Distribute the remainder to the largest fractional parts, ties by
    // host position.
    shares.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
    for share in shares.iter_mut() {
        if leftover == 0 {
            break;
        }
        share.1 += 1;
        leftover -= 1;
    }
    shares.sort_by_key(|s| s.0);

    let mut wheel = Vec::with_capacity(wheel_size as usize);
    for (host_idx, slots, _) in shares {
        for _ in 0..slots {
            wheel.push(host_idx as u32);
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    wheel.shuffle(&mut rng);
    wheel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDns;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    fn ring(wheel_size: u32, seed: u64) -> Ring {
        Ring::new(wheel_size, seed, FakeDns::new(&[]))
    }

    #[tokio::test]
    async fn test_empty_ring_has_no_peers() {
        let r = ring(10, 0);
        let err = r.get_peer(None, 0, false).await.unwrap_err();
        assert!(matches!(err, RingError::NoPeersAvailable));
        assert_eq!(err.to_string(), "No peers are available");
    }

    #[tokio::test]
    async fn test_weighted_distribution() {
        let r = ring(3000, 7);
        r.add_host("10.0.0.1", 80, 10).unwrap();
        r.add_host("10.0.0.2", 80, 20).unwrap();

        let mut counts: HashMap<IpAddr, u32> = HashMap::new();
        for _ in 0..3000 {
            let peer = r.get_peer(None, 0, false).await.unwrap();
            *counts.entry(peer.ip).or_insert(0) += 1;
        }
        let a = counts[&"10.0.0.1".parse::<IpAddr>().unwrap()];
        let b = counts[&"10.0.0.2".parse::<IpAddr>().unwrap()];
        assert_eq!(a, 1000);
        assert_eq!(b, 2000);
    }

    #[tokio::test]
    async fn test_hash_is_consistent() {
        let r = ring(100, 3);
        r.add_host("10.0.0.1", 80, 1).unwrap();
        r.add_host("10.0.0.2", 80, 1).unwrap();
        r.add_host("10.0.0.3", 80, 1).unwrap();

        let first = r.get_peer(Some(0xDEAD), 0, false).await.unwrap();
        for _ in 0..50 {
            let again = r.get_peer(Some(0xDEAD), 0, false).await.unwrap();
            assert_eq!(again.ip, first.ip);
        }
    }

    #[tokio::test]
    async fn test_identical_inputs_build_identical_wheels() {
        let build = || {
            let r = ring(64, 99);
            r.add_host("10.0.0.1", 80, 5).unwrap();
            r.add_host("10.0.0.2", 80, 10).unwrap();
            r.add_host("10.0.0.3", 80, 1).unwrap();
            r
        };
        let r1 = build();
        let r2 = build();
        for hash in 0..64u32 {
            let p1 = r1.get_peer(Some(hash), 0, false).await.unwrap();
            let p2 = r2.get_peer(Some(hash), 0, false).await.unwrap();
            assert_eq!(p1.ip, p2.ip, "hash {} diverged", hash);
        }
    }

    #[tokio::test]
    async fn test_unhealthy_peer_is_skipped() {
        let r = ring(10, 0);
        r.add_host("10.0.0.1", 80, 1).unwrap();
        r.add_host("10.0.0.2", 80, 1).unwrap();

        let bad: IpAddr = "10.0.0.1".parse().unwrap();
        r.set_peer_status(false, bad, 80, "10.0.0.1");
        for _ in 0..20 {
            let peer = r.get_peer(None, 0, false).await.unwrap();
            assert_ne!(peer.ip, bad);
        }

        r.set_peer_status(true, bad, 80, "10.0.0.1");
        let mut seen = false;
        for _ in 0..20 {
            if r.get_peer(None, 0, false).await.unwrap().ip == bad {
                seen = true;
            }
        }
        assert!(seen);
    }

    #[tokio::test]
    async fn test_all_unhealthy_is_no_peers() {
        let r = ring(10, 0);
        r.add_host("10.0.0.1", 80, 1).unwrap();
        r.set_peer_status(false, "10.0.0.1".parse().unwrap(), 80, "10.0.0.1");
        assert!(matches!(
            r.get_peer(None, 0, false).await.unwrap_err(),
            RingError::NoPeersAvailable
        ));
    }

    #[tokio::test]
    async fn test_remove_unknown_host_is_noop() {
        let r = ring(10, 0);
        r.add_host("10.0.0.1", 80, 1).unwrap();
        r.remove_host("10.9.9.9", 80).unwrap();
        assert_eq!(r.host_weights().len(), 1);
    }

    #[tokio::test]
    async fn test_readd_updates_weight() {
        let r = ring(100, 0);
        r.add_host("10.0.0.1", 80, 1).unwrap();
        r.add_host("10.0.0.1", 80, 50).unwrap();
        assert_eq!(r.host_weights(), vec![("10.0.0.1".to_string(), 80, 50)]);
    }

    #[tokio::test]
    async fn test_callbacks_on_add_and_remove() {
        let r = ring(10, 0);
        let log: Arc<Mutex<Vec<(RingAction, IpAddr)>>> = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        r.set_callback(Box::new(move |action, addr| {
            log2.lock().unwrap().push((action, addr.ip));
        }));

        r.add_host("10.0.0.1", 80, 1).unwrap();
        r.remove_host("10.0.0.1", 80).unwrap();

        let events = log.lock().unwrap().clone();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(
            events,
            vec![(RingAction::Added, ip), (RingAction::Removed, ip)]
        );
    }

    #[tokio::test]
    async fn test_hostname_materializes_lazily_and_fires_callback() {
        let dns = FakeDns::new(&[("app.internal", "10.5.0.1")]);
        let r = Ring::new(10, 0, dns.clone());
        let added = Arc::new(AtomicU32::new(0));
        let added2 = added.clone();
        r.set_callback(Box::new(move |action, _| {
            if action == RingAction::Added {
                added2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        r.add_host("app.internal", 80, 1).unwrap();
        assert_eq!(added.load(Ordering::SeqCst), 0);

        let peer = r.get_peer(None, 0, false).await.unwrap();
        assert_eq!(peer.ip, "10.5.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(peer.hostname, "app.internal");
        assert_eq!(added.load(Ordering::SeqCst), 1);

        // Second pick reuses the materialised address.
        r.get_peer(None, 0, false).await.unwrap();
        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(dns.authoritative_queries(), 1);
    }

    #[tokio::test]
    async fn test_cache_only_never_queries_authoritatively() {
        let dns = FakeDns::new(&[("app.internal", "10.5.0.1")]);
        let r = Ring::new(10, 0, dns.clone());
        r.add_host("app.internal", 80, 1).unwrap();

        // Retry before any first attempt resolved: nothing cached, so the
        // host is unusable rather than re-queried.
        let err = r.get_peer(None, 1, true).await.unwrap_err();
        assert!(matches!(err, RingError::NoPeersAvailable));
        assert_eq!(dns.authoritative_queries(), 0);
    }

    #[tokio::test]
    async fn test_try_count_moves_off_failed_peer() {
        let r = ring(16, 5);
        r.add_host("10.0.0.1", 80, 1).unwrap();
        r.add_host("10.0.0.2", 80, 1).unwrap();

        let hash = Some(11u32);
        let first = r.get_peer(hash, 0, false).await.unwrap();
        let second = r.get_peer(hash, 1, false).await.unwrap();
        assert_ne!(first.ip, second.ip);

        // Wraps back around once candidates are exhausted.
        let third = r.get_peer(hash, 2, false).await.unwrap();
        assert_eq!(third.ip, first.ip);
    }

    #[test]
    fn test_wheel_apportionment_is_exact() {
        let hosts = vec![
            Host {
                name: "a".into(),
                port: 80,
                weight: 10,
            },
            Host {
                name: "b".into(),
                port: 80,
                weight: 20,
            },
            Host {
                name: "c".into(),
                port: 80,
                weight: 0,
            },
        ];
        let wheel = build_wheel(&hosts, 30, 1);
        assert_eq!(wheel.len(), 30);
        let a = wheel.iter().filter(|&&i| i == 0).count();
        let b = wheel.iter().filter(|&&i| i == 1).count();
        let c = wheel.iter().filter(|&&i| i == 2).count();
        assert_eq!(a, 10);
        assert_eq!(b, 20);
        assert_eq!(c, 0);
    }
}
