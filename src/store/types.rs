use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named logical pool of backends, addressed collectively by using its
/// name in place of a host. Created/updated/deleted only through config
/// events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    pub id: Uuid,

    /// Unique name; requests whose host matches it take the balancer path.
    pub name: String,

    /// Ring wheel size. Larger wheels smooth weight apportionment.
    #[serde(default = "default_slots")]
    pub slots: u32,

    /// Seed for the deterministic slot permutation. Identical seeds (and
    /// identical target histories) produce identical wheels on every worker.
    #[serde(default)]
    pub orderlist: u64,

    #[serde(default)]
    pub hash_on: HashOn,

    #[serde(default)]
    pub hash_fallback: HashOn,

    #[serde(default)]
    pub hash_on_header: Option<String>,

    #[serde(default)]
    pub hash_fallback_header: Option<String>,

    #[serde(default)]
    pub healthchecks: HealthCheckConfig,
}

fn default_slots() -> u32 {
    10000
}

/// What request attribute feeds the consistent hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashOn {
    #[default]
    None,
    Consumer,
    Ip,
    Header,
}

/// One entry in an upstream's append-only change log. A `weight` of 0
/// marks deletion of a previously added (host, port).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub upstream_id: Uuid,
    pub id: Uuid,

    /// Epoch milliseconds. Combined with `id` this gives a total ordering
    /// that is stable across workers.
    pub created_at: i64,

    /// Raw `host:port` string as stored.
    pub target: String,

    #[serde(default = "default_target_weight")]
    pub weight: u32,
}

fn default_target_weight() -> u32 {
    100
}

/// Port assumed when the raw target string carries none.
pub const DEFAULT_TARGET_PORT: u16 = 8000;

impl Target {
    /// Splits the raw `target` into host name and numeric port and
    /// synthesises the `order` key. Fails on an unparsable port.
    pub fn normalize(&self) -> Result<NormalizedTarget, String> {
        let (name, port) = split_host_port(&self.target)?;
        Ok(NormalizedTarget {
            name,
            port,
            weight: self.weight,
            order: format!("{}:{}", self.created_at, self.id),
            created_at: self.created_at,
            id: self.id,
        })
    }
}

fn split_host_port(raw: &str) -> Result<(String, u16), String> {
    // Bracketed IPv6: "[::1]:80" or "[::1]".
    if let Some(rest) = raw.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("unbalanced brackets in target: {}", raw))?;
        return match tail.strip_prefix(':') {
            Some(p) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in target: {}", raw))?;
                Ok((host.to_string(), port))
            }
            None if tail.is_empty() => Ok((host.to_string(), DEFAULT_TARGET_PORT)),
            None => Err(format!("trailing garbage in target: {}", raw)),
        };
    }

    match raw.rsplit_once(':') {
        Some((host, p)) if !host.contains(':') => {
            let port = p
                .parse::<u16>()
                .map_err(|_| format!("invalid port in target: {}", raw))?;
            Ok((host.to_string(), port))
        }
        // More than one colon without brackets: bare IPv6 address.
        Some(_) => Ok((raw.to_string(), DEFAULT_TARGET_PORT)),
        None => Ok((raw.to_string(), DEFAULT_TARGET_PORT)),
    }
}

/// A target after normalisation: split host/port plus the synthetic
/// `order` identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTarget {
    pub name: String,
    pub port: u16,
    pub weight: u32,
    pub order: String,
    pub created_at: i64,
    pub id: Uuid,
}

/// The ordered change log of one upstream, ascending by `(created_at, id)`.
pub type TargetHistory = Vec<NormalizedTarget>;

/// Health-checker configuration carried by an upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub active: Option<ActiveHealthCheck>,

    #[serde(default)]
    pub passive: Option<PassiveHealthCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHealthCheck {
    /// Seconds between probe rounds.
    #[serde(default = "default_hc_interval")]
    pub interval: u64,

    #[serde(default = "default_hc_path")]
    pub path: String,

    /// Override port for probes (when the health endpoint runs on a
    /// separate management port).
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_healthy_statuses")]
    pub healthy_statuses: Vec<u16>,

    #[serde(default = "default_hc_threshold")]
    pub healthy_threshold: u32,

    #[serde(default = "default_hc_threshold")]
    pub unhealthy_threshold: u32,

    /// Per-probe timeout in seconds.
    #[serde(default = "default_hc_timeout")]
    pub timeout: u64,

    /// Prevents probe storms on upstreams with many targets.
    #[serde(default = "default_hc_concurrency")]
    pub concurrency: usize,
}

impl Default for ActiveHealthCheck {
    fn default() -> Self {
        Self {
            interval: default_hc_interval(),
            path: default_hc_path(),
            port: None,
            healthy_statuses: default_healthy_statuses(),
            healthy_threshold: default_hc_threshold(),
            unhealthy_threshold: default_hc_threshold(),
            timeout: default_hc_timeout(),
            concurrency: default_hc_concurrency(),
        }
    }
}

fn default_hc_interval() -> u64 {
    10
}

fn default_hc_path() -> String {
    "/health".to_string()
}

fn default_healthy_statuses() -> Vec<u16> {
    vec![200]
}

fn default_hc_threshold() -> u32 {
    3
}

fn default_hc_timeout() -> u64 {
    3
}

fn default_hc_concurrency() -> usize {
    64
}

/// Passive (traffic-derived) health signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassiveHealthCheck {
    /// Response statuses counted as failures.
    #[serde(default = "default_unhealthy_statuses")]
    pub unhealthy_statuses: Vec<u16>,

    /// Consecutive bad statuses before the peer goes unhealthy.
    #[serde(default = "default_http_failures")]
    pub http_failures: u32,

    /// Consecutive connect failures before the peer goes unhealthy.
    #[serde(default = "default_tcp_failures")]
    pub tcp_failures: u32,
}

impl Default for PassiveHealthCheck {
    fn default() -> Self {
        Self {
            unhealthy_statuses: default_unhealthy_statuses(),
            http_failures: default_http_failures(),
            tcp_failures: default_tcp_failures(),
        }
    }
}

fn default_unhealthy_statuses() -> Vec<u16> {
    vec![500, 502, 503]
}

fn default_http_failures() -> u32 {
    3
}

fn default_tcp_failures() -> u32 {
    2
}
