use super::hash::{create_hash, RequestContext};
use super::{Balancer, BalancerCore};
use crate::dns::DnsError;
use crate::error::ExecuteError;
use crate::upstream::ring::RingError;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// How the request pipeline parsed the target host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKind {
    #[default]
    Name,
    Ipv4,
    Ipv6,
}

/// Mutable per-request target record, threaded through the pipeline.
/// `host`/`port`/`kind` are inputs; `ip`, `port`, and `hostname` are
/// filled by `execute`; `balancer` and `hash_value` are captured on the
/// first attempt and reused on retries.
#[derive(Clone, Default)]
pub struct RequestTarget {
    pub host: String,
    pub port: Option<u16>,
    pub kind: HostKind,
    /// 0 on the first attempt, ≥1 on retries.
    pub try_count: u32,
    pub balancer: Option<Arc<Balancer>>,
    pub hash_value: Option<u32>,
    pub ip: Option<IpAddr>,
    pub hostname: Option<String>,
}

impl RequestTarget {
    /// Builds a target, classifying the host as literal IPv4/IPv6 or a
    /// name to balance or resolve.
    pub fn new(host: &str, port: Option<u16>) -> Self {
        let kind = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => HostKind::Ipv4,
            Ok(IpAddr::V6(_)) => HostKind::Ipv6,
            Err(_) => HostKind::Name,
        };
        Self {
            host: host.to_string(),
            port,
            kind,
            ..Default::default()
        }
    }
}

impl BalancerCore {
    /// The hot path: fills `ip`/`port`/`hostname` on the target.
    ///
    /// Literal addresses pass straight through. Named hosts either belong
    /// to an upstream (ring balancer selection, consistent hash from the
    /// request context) or fall back to plain DNS. Retries reuse the
    /// balancer captured on the first attempt and only consult cached DNS
    /// records.
    pub async fn execute(
        &self,
        target: &mut RequestTarget,
        ctx: &RequestContext,
    ) -> Result<(), ExecuteError> {
        if target.kind != HostKind::Name {
            let ip = target
                .host
                .parse::<IpAddr>()
                .map_err(|e| ExecuteError::Internal(format!("invalid literal address: {}", e)))?;
            target.ip = Some(ip);
            target.port = Some(target.port.unwrap_or(self.config.execute.default_port));
            target.hostname = Some(target.host.clone());
            return Ok(());
        }

        // On retries the DNS answer the request already balanced on must
        // be reused, never re-queried authoritatively.
        let dns_cache_only = target.try_count != 0;

        let balancer = if target.try_count == 0 {
            match self.get_balancer(&target.host, false).await {
                Ok(Some(balancer)) => {
                    target.balancer = Some(balancer.clone());
                    if target.hash_value.is_none() {
                        target.hash_value = create_hash(balancer.upstream(), ctx);
                    }
                    Some(balancer)
                }
                Ok(None) => None,
                Err(e) => return Err(ExecuteError::Internal(e.to_string())),
            }
        } else {
            target.balancer.clone()
        };

        if let Some(balancer) = balancer {
            let peer = balancer
                .ring()
                .get_peer(target.hash_value, target.try_count, dns_cache_only)
                .await
                .map_err(|e| match e {
                    RingError::NoPeersAvailable => ExecuteError::NoPeersAvailable,
                    other => ExecuteError::Internal(other.to_string()),
                })?;

            debug!(
                "execute: peer selected, upstream={}, peer={}:{}, try={}",
                balancer.upstream().name,
                peer.ip,
                peer.port,
                target.try_count
            );
            target.ip = Some(peer.ip);
            target.port = Some(peer.port);
            target.hostname = Some(peer.hostname.clone());
            return Ok(());
        }

        let port = target.port.unwrap_or(self.config.execute.default_port);
        match self.dns.resolve(&target.host, port, dns_cache_only).await {
            Ok((ip, port)) => {
                target.ip = Some(ip);
                target.port = Some(port);
                target.hostname = Some(target.host.clone());
                Ok(())
            }
            Err(DnsError::NameError) => Err(ExecuteError::NameResolution),
            Err(DnsError::Other(msg)) => Err(ExecuteError::Internal(msg)),
        }
    }
}
