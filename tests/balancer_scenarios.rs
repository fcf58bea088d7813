//! End-to-end scenarios for the balancing core, driven entirely through
//! its public API over in-process collaborators.
//!
//! Run with: `cargo test --test balancer_scenarios`

use async_trait::async_trait;
use compass_gateway::balancer::{BalancerCore, CrudOp, RequestContext, RequestTarget};
use compass_gateway::cache::MemoryCache;
use compass_gateway::config::CoreConfig;
use compass_gateway::dns::{DnsClient, DnsError};
use compass_gateway::error::ExecuteError;
use compass_gateway::events::{EventBus, HealthEventKind, HealthTarget, WorkerEvents};
use compass_gateway::store::{
    HashOn, HealthCheckConfig, MemoryStore, Target, Upstream,
};
use compass_gateway::upstream::HEALTH_EVENT_SOURCE;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Scripted resolver: known names resolve and are cached, everything
/// else is NXDOMAIN.
struct ScriptedDns {
    records: DashMap<String, IpAddr>,
    cached: DashMap<String, IpAddr>,
}

impl ScriptedDns {
    fn new(entries: &[(&str, &str)]) -> Arc<Self> {
        let records = DashMap::new();
        for (name, ip) in entries {
            records.insert(name.to_string(), ip.parse().unwrap());
        }
        Arc::new(Self {
            records,
            cached: DashMap::new(),
        })
    }
}

#[async_trait]
impl DnsClient for ScriptedDns {
    async fn resolve(
        &self,
        host: &str,
        port: u16,
        cache_only: bool,
    ) -> Result<(IpAddr, u16), DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok((ip, port));
        }
        if let Some(ip) = self.cached.get(host) {
            return Ok((*ip, port));
        }
        if cache_only {
            return Err(DnsError::Other(format!("no cached record for {}", host)));
        }
        match self.records.get(host) {
            Some(ip) => {
                self.cached.insert(host.to_string(), *ip);
                Ok((*ip, port))
            }
            None => Err(DnsError::NameError),
        }
    }
}

struct Harness {
    core: BalancerCore,
    store: Arc<MemoryStore>,
    bus: Arc<WorkerEvents>,
}

/// One-time subscriber install so `RUST_LOG=debug cargo test` shows the
/// core's trace output. `try_init` because every test builds a harness.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness(dns_entries: &[(&str, &str)]) -> Harness {
    init_tracing();
    let store = MemoryStore::new();
    let bus = WorkerEvents::new();
    let core = BalancerCore::new(
        store.clone(),
        MemoryCache::new(),
        bus.clone(),
        ScriptedDns::new(dns_entries),
        CoreConfig::default(),
    );
    Harness { core, store, bus }
}

fn upstream(id: u128, name: &str, slots: u32) -> Upstream {
    Upstream {
        id: Uuid::from_u128(id),
        name: name.to_string(),
        slots,
        orderlist: id as u64,
        hash_on: HashOn::None,
        hash_fallback: HashOn::None,
        hash_on_header: None,
        hash_fallback_header: None,
        healthchecks: HealthCheckConfig::default(),
    }
}

fn target(upstream_id: u128, id: u128, created_at: i64, raw: &str, weight: u32) -> Target {
    Target {
        upstream_id: Uuid::from_u128(upstream_id),
        id: Uuid::from_u128(id),
        created_at,
        target: raw.to_string(),
        weight,
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[tokio::test]
async fn s1_literal_ip_passthrough() {
    let h = harness(&[]);
    let mut t = RequestTarget::new("10.0.0.5", Some(8080));

    h.core.execute(&mut t, &RequestContext::default()).await.unwrap();

    assert_eq!(t.ip, Some(ip("10.0.0.5")));
    assert_eq!(t.port, Some(8080));
    assert_eq!(t.hostname.as_deref(), Some("10.0.0.5"));
    // No balancer lookup happened.
    assert!(t.balancer.is_none());
}

#[tokio::test]
async fn s2_unknown_name_falls_back_to_dns() {
    let h = harness(&[("example.com", "93.184.216.34")]);
    let mut t = RequestTarget::new("example.com", Some(443));

    h.core.execute(&mut t, &RequestContext::default()).await.unwrap();

    assert_eq!(t.ip, Some(ip("93.184.216.34")));
    assert_eq!(t.port, Some(443));
    assert_eq!(t.hostname.as_deref(), Some("example.com"));
}

#[tokio::test]
async fn s3_balanced_upstream_weight_bias() {
    let h = harness(&[("a", "10.0.1.1"), ("b", "10.0.1.2")]);
    h.store.upsert_upstream(upstream(1, "svc", 3000));
    h.store.append_target(target(1, 11, 100, "a:80", 10));
    h.store.append_target(target(1, 12, 200, "b:80", 20));

    let mut counts: HashMap<IpAddr, u32> = HashMap::new();
    for _ in 0..3000 {
        let mut t = RequestTarget::new("svc", Some(80));
        h.core.execute(&mut t, &RequestContext::default()).await.unwrap();
        *counts.entry(t.ip.unwrap()).or_insert(0) += 1;
    }

    // 1:2 weight bias, exact because the wheel is walked uniformly.
    assert_eq!(counts[&ip("10.0.1.1")], 1000);
    assert_eq!(counts[&ip("10.0.1.2")], 2000);
}

#[tokio::test]
async fn s4_weight_zero_target_is_a_delete() {
    let h = harness(&[("a", "10.0.1.1"), ("b", "10.0.1.2")]);
    h.store.upsert_upstream(upstream(1, "svc", 30));
    h.store.append_target(target(1, 11, 100, "a:80", 10));
    h.store.append_target(target(1, 12, 200, "b:80", 20));

    // Warm the balancer.
    let mut t = RequestTarget::new("svc", Some(80));
    h.core.execute(&mut t, &RequestContext::default()).await.unwrap();

    let tombstone = target(1, 13, 300, "a:80", 0);
    h.store.append_target(tombstone.clone());
    h.core.on_target_event(CrudOp::Update, &tombstone).await;

    for _ in 0..30 {
        let mut t = RequestTarget::new("svc", Some(80));
        h.core.execute(&mut t, &RequestContext::default()).await.unwrap();
        assert_eq!(t.ip, Some(ip("10.0.1.2")));
    }
}

#[tokio::test]
async fn s5_history_divergence_forces_rebuild() {
    let h = harness(&[]);
    let u = upstream(1, "svc", 30);
    h.store.upsert_upstream(u.clone());
    h.store.append_target(target(1, 11, 100, "10.0.0.1:80", 10));
    h.store.append_target(target(1, 12, 200, "10.0.0.2:80", 20));

    let old = h.core.get_balancer("svc", false).await.unwrap().unwrap();

    // Edit the second entry in place: common prefix shrinks to 1.
    let edited = target(1, 99, 250, "10.0.0.9:80", 20);
    h.store.set_targets(
        u.id,
        vec![target(1, 11, 100, "10.0.0.1:80", 10), edited.clone()],
    );
    h.core.on_target_event(CrudOp::Update, &edited).await;

    let rebuilt = h.core.get_balancer("svc", true).await.unwrap().unwrap();
    assert!(!Arc::ptr_eq(&rebuilt, &old));
    assert!(old.health_checker().is_none());
    assert_eq!(
        rebuilt.ring().host_weights(),
        vec![
            ("10.0.0.1".to_string(), 80, 10),
            ("10.0.0.9".to_string(), 80, 20),
        ]
    );
}

#[tokio::test]
async fn s6_health_event_propagation() {
    let h = harness(&[]);
    h.store.upsert_upstream(upstream(1, "svc", 20));
    h.store.append_target(target(1, 11, 100, "10.0.0.1:80", 10));
    h.store.append_target(target(1, 12, 200, "10.0.0.2:80", 10));

    let balancer = h.core.get_balancer("svc", false).await.unwrap().unwrap();
    let bad = HealthTarget {
        ip: ip("10.0.0.1"),
        port: 80,
        hostname: "10.0.0.1".to_string(),
    };

    // An unhealthy verdict on the bus flips peer status through the
    // bound callback; get_peer stops returning that peer.
    h.bus.post(HEALTH_EVENT_SOURCE, HealthEventKind::Unhealthy, &bad);
    for _ in 0..20 {
        let mut t = RequestTarget::new("svc", Some(80));
        h.core.execute(&mut t, &RequestContext::default()).await.unwrap();
        assert_ne!(t.ip, Some(bad.ip));
    }

    // A healthy event flips it back.
    h.bus.post(HEALTH_EVENT_SOURCE, HealthEventKind::Healthy, &bad);
    let mut seen = false;
    for _ in 0..20 {
        let mut t = RequestTarget::new("svc", Some(80));
        h.core.execute(&mut t, &RequestContext::default()).await.unwrap();
        if t.ip == Some(bad.ip) {
            seen = true;
        }
    }
    assert!(seen);

    // All peers down: 503 with the documented message.
    h.bus.post(HEALTH_EVENT_SOURCE, HealthEventKind::Unhealthy, &bad);
    h.bus.post(
        HEALTH_EVENT_SOURCE,
        HealthEventKind::Unhealthy,
        &HealthTarget {
            ip: ip("10.0.0.2"),
            port: 80,
            hostname: "10.0.0.2".to_string(),
        },
    );
    let mut t = RequestTarget::new("svc", Some(80));
    let err = h
        .core
        .execute(&mut t, &RequestContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecuteError::NoPeersAvailable));
    assert_eq!(err.status(), 503);
}

#[tokio::test]
async fn consistent_hash_sticks_across_requests() {
    let h = harness(&[]);
    let mut u = upstream(1, "svc", 100);
    u.hash_on = HashOn::Ip;
    h.store.upsert_upstream(u);
    h.store.append_target(target(1, 11, 100, "10.0.0.1:80", 10));
    h.store.append_target(target(1, 12, 200, "10.0.0.2:80", 10));
    h.store.append_target(target(1, 13, 300, "10.0.0.3:80", 10));

    let ctx = RequestContext {
        remote_addr: Some(ip("172.16.4.4")),
        ..Default::default()
    };

    let mut first = RequestTarget::new("svc", Some(80));
    h.core.execute(&mut first, &ctx).await.unwrap();
    for _ in 0..30 {
        let mut t = RequestTarget::new("svc", Some(80));
        h.core.execute(&mut t, &ctx).await.unwrap();
        assert_eq!(t.ip, first.ip);
    }
}

#[tokio::test]
async fn retry_moves_to_the_next_peer() {
    let h = harness(&[]);
    let mut u = upstream(1, "svc", 40);
    u.hash_on = HashOn::Ip;
    h.store.upsert_upstream(u);
    h.store.append_target(target(1, 11, 100, "10.0.1.1:80", 10));
    h.store.append_target(target(1, 12, 200, "10.0.1.2:80", 10));

    let ctx = RequestContext {
        remote_addr: Some(ip("172.16.4.4")),
        ..Default::default()
    };

    // First attempt pins the balancer and the hash on the target.
    let mut t = RequestTarget::new("svc", Some(80));
    h.core.execute(&mut t, &ctx).await.unwrap();
    let first_ip = t.ip.unwrap();
    assert!(t.balancer.is_some());

    // The retry keeps the captured balancer and hash but lands on the
    // other peer.
    t.try_count = 1;
    h.core.execute(&mut t, &ctx).await.unwrap();
    assert_ne!(t.ip, Some(first_ip));
}

#[tokio::test]
async fn upstream_lifecycle_round_trip() {
    let h = harness(&[]);
    let u = upstream(1, "svc", 40);
    h.store.upsert_upstream(u.clone());
    h.store.append_target(target(1, 11, 100, "10.0.0.1:80", 10));
    h.core.on_upstream_event(CrudOp::Create, &u).await;

    let first = h.core.get_balancer("svc", true).await.unwrap().unwrap();
    let hosts = first.ring().host_weights();

    h.store.remove_upstream(u.id);
    h.core.on_upstream_event(CrudOp::Delete, &u).await;
    assert!(matches!(
        h.core.get_balancer("svc", true).await,
        Ok(None) | Err(_)
    ));

    // Re-create with the same history: the address set comes back.
    h.store.upsert_upstream(u.clone());
    h.store.append_target(target(1, 11, 100, "10.0.0.1:80", 10));
    h.core.on_upstream_event(CrudOp::Create, &u).await;
    let second = h.core.get_balancer("svc", true).await.unwrap().unwrap();
    assert_eq!(second.ring().host_weights(), hosts);
}
