use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// DNS failures. `NameError` is NXDOMAIN and renders as the resolver's
/// sentinel string; callers match on the variant, not the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    NameError,
    Other(String),
}

impl fmt::Display for DnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsError::NameError => write!(f, "dns server error: 3 name error"),
            DnsError::Other(msg) => write!(f, "dns error: {}", msg),
        }
    }
}

impl std::error::Error for DnsError {}

/// Narrow resolution interface. `cache_only` is the retry contract: a
/// retrying request must reuse the record it already balanced on, never
/// trigger a fresh authoritative query.
#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn resolve(
        &self,
        host: &str,
        port: u16,
        cache_only: bool,
    ) -> Result<(IpAddr, u16), DnsError>;
}

/// System resolver with a per-process record cache backing `cache_only`
/// lookups.
#[derive(Default)]
pub struct SystemDns {
    records: DashMap<String, IpAddr>,
}

impl SystemDns {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DnsClient for SystemDns {
    async fn resolve(
        &self,
        host: &str,
        port: u16,
        cache_only: bool,
    ) -> Result<(IpAddr, u16), DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok((ip, port));
        }

        if let Some(ip) = self.records.get(host) {
            return Ok((*ip, port));
        }
        if cache_only {
            return Err(DnsError::Other(format!("no cached record for {}", host)));
        }

        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => DnsError::NameError,
                _ => DnsError::Other(e.to_string()),
            })?;

        match addrs.next() {
            Some(addr) => {
                debug!("dns: resolved, host={}, ip={}", host, addr.ip());
                self.records.insert(host.to_string(), addr.ip());
                Ok((addr.ip(), port))
            }
            None => Err(DnsError::NameError),
        }
    }
}
