use std::net::IpAddr;

/// Per-balancer health checker. Combines active probes and passive
/// traffic signals into per-peer verdicts and broadcasts them on the
/// event bus. Internal failures are logged and swallowed; nothing here
/// may break request flow.
pub trait HealthChecker: Send + Sync {
    /// Event-bus source this checker publishes verdicts under.
    fn event_source(&self) -> &str;

    fn add_target(&self, ip: IpAddr, port: u16, hostname: &str);

    fn remove_target(&self, ip: IpAddr, port: u16);

    /// Already-known verdict for a peer, if any. Used to seed a freshly
    /// built balancer with consensus that predates it.
    fn target_status(&self, ip: IpAddr, port: u16) -> Option<bool>;

    /// Passive signal: observed response status of a real request.
    fn report_http_status(&self, ip: IpAddr, port: u16, status: u16);

    /// Passive signal: connect failure of a real request.
    fn report_tcp_failure(&self, ip: IpAddr, port: u16);

    /// Externally supplied verdict (health posting API). Takes effect
    /// immediately and is broadcast like any probe verdict.
    fn set_target_status(&self, ip: IpAddr, port: u16, healthy: bool);

    /// Clears state and stops probing. Idempotent.
    fn stop(&self);
}
