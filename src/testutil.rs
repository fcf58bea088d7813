//! Shared fakes for unit tests.

use crate::dns::{DnsClient, DnsError};
use crate::store::{HashOn, HealthCheckConfig, Target, Upstream};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Scripted resolver: known names resolve, everything else is NXDOMAIN.
/// Tracks authoritative query counts so tests can assert the
/// `cache_only` retry contract.
pub(crate) struct FakeDns {
    records: DashMap<String, IpAddr>,
    cached: DashMap<String, IpAddr>,
    authoritative_queries: AtomicU32,
}

impl FakeDns {
    pub(crate) fn new(entries: &[(&str, &str)]) -> Arc<Self> {
        let records = DashMap::new();
        for (name, ip) in entries {
            records.insert(name.to_string(), ip.parse().unwrap());
        }
        Arc::new(Self {
            records,
            cached: DashMap::new(),
            authoritative_queries: AtomicU32::new(0),
        })
    }

    pub(crate) fn authoritative_queries(&self) -> u32 {
        self.authoritative_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsClient for FakeDns {
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
        self.authoritative_queries.fetch_add(1, Ordering::SeqCst);
        match self.records.get(host) {
            Some(ip) => {
                self.cached.insert(host.to_string(), *ip);
                Ok((*ip, port))
            }
            None => Err(DnsError::NameError),
        }
    }
}

pub(crate) fn upstream(id: u128, name: &str, slots: u32) -> Upstream {
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

pub(crate) fn target(upstream_id: u128, id: u128, created_at: i64, raw: &str, weight: u32) -> Target {
    Target {
        upstream_id: Uuid::from_u128(upstream_id),
        id: Uuid::from_u128(id),
        created_at,
        target: raw.to_string(),
        weight,
    }
}
