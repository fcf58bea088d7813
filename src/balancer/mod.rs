pub mod events;
pub mod execute;
pub mod hash;
pub mod history;
pub mod loader;


pub use events::CrudOp;
pub use execute::{HostKind, RequestTarget};
pub use hash::RequestContext;
pub use history::ReplayedTarget;

use crate::cache::SharedCache;
use crate::config::CoreConfig;
use crate::dns::DnsClient;
use crate::error::BalancerError;
use crate::events::{EventBus, HealthCallback, HealthEventKind, SubscriptionId};
use crate::store::{ConfigStore, TargetHistory, Upstream};
use crate::upstream::checker::ActiveHealthChecker;
use crate::upstream::health::HealthChecker;
use crate::upstream::ring::{Ring, RingAction};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One upstream's live balancer: the ring, the history it replayed, and
/// the health checker whose lifetime is bound to it. Auxiliary state is a
/// direct member, so dropping the balancer reclaims the checker and the
/// bus callback automatically.
pub struct Balancer {
    upstream: Upstream,
    ring: Ring,
    replayed: Mutex<Vec<ReplayedTarget>>,
    checker: Mutex<Option<Arc<dyn HealthChecker>>>,
    /// Strong callback handle; the bus only holds a `Weak` to it.
    bus_callback: Mutex<Option<(Arc<HealthCallback>, SubscriptionId, String)>>,
    bus: Arc<dyn EventBus>,
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("upstream", &self.upstream)
            .field("ring", &self.ring.wheel_size())
            .finish()
    }
}

impl Balancer {
    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn upstream_id(&self) -> Uuid {
        self.upstream.id
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Snapshot of the compact records replayed onto this ring.
    pub fn replayed_history(&self) -> Vec<ReplayedTarget> {
        self.replayed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn push_replayed(&self, record: ReplayedTarget) {
        self.replayed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    pub fn health_checker(&self) -> Option<Arc<dyn HealthChecker>> {
        self.checker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Passive-signal hook: response status observed by a real request.
    pub fn report_http_status(&self, ip: IpAddr, port: u16, status: u16) {
        if let Some(checker) = self.health_checker() {
            checker.report_http_status(ip, port, status);
        }
    }

    /// Passive-signal hook: connect failure observed by a real request.
    pub fn report_tcp_failure(&self, ip: IpAddr, port: u16) {
        if let Some(checker) = self.health_checker() {
            checker.report_tcp_failure(ip, port);
        }
    }

    /// Stops the checker and unregisters its bus subscription. Safe when
    /// no checker is bound.
    pub fn stop_healthchecker(&self) {
        if let Some(checker) = self
            .checker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            checker.stop();
        }
        if let Some((_cb, id, source)) = self
            .bus_callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            self.bus.unregister(&source, id);
        }
    }
}

impl Drop for Balancer {
    fn drop(&mut self) {
        self.stop_healthchecker();
    }
}

/// The load-balancing core: registry of ring balancers, entity loaders,
/// event handlers, and the per-request execute path. One instance per
/// worker; every collaborator is constructor-injected.
pub struct BalancerCore {
    pub(crate) store: Arc<dyn ConfigStore>,
    pub(crate) cache: Arc<dyn SharedCache>,
    pub(crate) bus: Arc<dyn EventBus>,
    pub(crate) dns: Arc<dyn DnsClient>,
    pub(crate) config: CoreConfig,
    balancers: DashMap<Uuid, Arc<Balancer>>,
    /// Per-upstream mutation locks: one logical writer per id, and
    /// single-flight lazy creation.
    locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl BalancerCore {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        cache: Arc<dyn SharedCache>,
        bus: Arc<dyn EventBus>,
        dns: Arc<dyn DnsClient>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            dns,
            config,
            balancers: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Pre-warms the registry with one balancer per stored upstream so
    /// the first request does not pay creation latency. Per-upstream
    /// failures are logged, not fatal.
    pub async fn init(&self) -> Result<(), BalancerError> {
        let upstreams = self.get_all_upstreams().await?;
        info!("balancer: initializing, upstreams={}", upstreams.len());

        for (name, id) in upstreams {
            let upstream = match self.get_upstream_by_id(id).await {
                Ok(Some(upstream)) => upstream,
                Ok(None) => {
                    warn!("balancer: init: upstream disappeared, name={}, id={}", name, id);
                    continue;
                }
                Err(e) => {
                    error!("balancer: init: load failed, name={}, error={}", name, e);
                    continue;
                }
            };

            let lock = self.lock_for(id);
            let _guard = lock.lock().await;
            if self.balancers.contains_key(&id) {
                continue;
            }
            if let Err(e) = self.create_balancer(&upstream, None, 0).await {
                error!(
                    "balancer: init: creation failed, name={}, error={}",
                    upstream.name, e
                );
            }
        }
        Ok(())
    }

    pub(crate) fn lock_for(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    pub fn balancer_by_id(&self, id: Uuid) -> Option<Arc<Balancer>> {
        self.balancers.get(&id).map(|e| e.value().clone())
    }

    #[cfg(test)]
    pub(crate) fn balancer_count(&self) -> usize {
        self.balancers.len()
    }

    /// Builds a balancer for `upstream` and publishes it into the
    /// registry only once ring, replay, and checker binding have all
    /// succeeded. Callers serialize per-id through `lock_for`.
    pub(crate) async fn create_balancer(
        &self,
        upstream: &Upstream,
        history: Option<TargetHistory>,
        start: usize,
    ) -> Result<Arc<Balancer>, BalancerError> {
        let ring = Ring::new(upstream.slots, upstream.orderlist, self.dns.clone());
        let balancer = Arc::new(Balancer {
            upstream: upstream.clone(),
            ring,
            replayed: Mutex::new(Vec::new()),
            checker: Mutex::new(None),
            bus_callback: Mutex::new(None),
            bus: self.bus.clone(),
        });

        let history = match history {
            Some(history) => history,
            None => self.fetch_target_history(upstream).await?,
        };
        history::apply_history(&balancer, &history, start)?;

        self.attach_healthchecker(&balancer);

        self.balancers.insert(upstream.id, balancer.clone());
        metrics::gauge!("gateway_balancers_total").set(self.balancers.len() as f64);
        info!(
            "balancer: created, upstream={}, id={}, targets={}",
            upstream.name,
            upstream.id,
            history.len()
        );
        Ok(balancer)
    }

    /// Creates the checker, seeds it from the replayed ring, wires the
    /// bus subscription and the ring membership callback. The membership
    /// callback is installed only after the initial replay, so replay
    /// itself never double-adds.
    fn attach_healthchecker(&self, balancer: &Arc<Balancer>) {
        let checker = ActiveHealthChecker::new(
            &balancer.upstream.name,
            balancer.upstream.healthchecks.clone(),
            self.bus.clone(),
        );

        self.populate_healthchecker(checker.as_ref(), balancer);

        // Verdict events → peer status. The balancer is captured weakly:
        // once it is dropped the callback is unreachable and the bus
        // prunes the registration.
        let weak_balancer = Arc::downgrade(balancer);
        let callback: Arc<HealthCallback> = Arc::new(move |kind, target| {
            if let Some(balancer) = weak_balancer.upgrade() {
                let healthy = kind == HealthEventKind::Healthy;
                balancer
                    .ring()
                    .set_peer_status(healthy, target.ip, target.port, &target.hostname);
                debug!(
                    "balancer: peer status from event, upstream={}, target={}:{}, healthy={}",
                    balancer.upstream.name, target.ip, target.port, healthy
                );
            }
        });
        let source = checker.event_source().to_string();
        let subscription = self.bus.register_weak(&source, Arc::downgrade(&callback));
        *balancer
            .bus_callback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some((callback, subscription, source));

        // Ring membership → checker targets.
        let weak_checker: Weak<ActiveHealthChecker> = Arc::downgrade(&checker);
        balancer.ring().set_callback(Box::new(move |action, addr| {
            let Some(checker) = weak_checker.upgrade() else {
                return;
            };
            match action {
                RingAction::Added => checker.add_target(addr.ip, addr.port, &addr.hostname),
                RingAction::Removed => checker.remove_target(addr.ip, addr.port),
            }
        }));

        *balancer.checker.lock().unwrap_or_else(|e| e.into_inner()) = Some(checker);
    }

    /// Seeds the checker with every active address currently in the ring,
    /// then pulls any already-known verdict back into the ring so health
    /// consensus survives balancer re-creation.
    fn populate_healthchecker(&self, checker: &dyn HealthChecker, balancer: &Arc<Balancer>) {
        for (weight, addr) in balancer.ring().addresses() {
            if weight == 0 {
                continue;
            }
            checker.add_target(addr.ip, addr.port, &addr.hostname);
            if let Some(known) = checker.target_status(addr.ip, addr.port) {
                balancer
                    .ring()
                    .set_peer_status(known, addr.ip, addr.port, &addr.hostname);
            }
        }
    }

    /// Looks up the balancer responsible for `host_name`.
    ///
    /// Returns `Ok(None)` when no upstream has that name — the caller
    /// takes the plain-DNS path. When the upstream exists but no balancer
    /// is registered: with `no_create` this is an error, otherwise one is
    /// created lazily.
    pub async fn get_balancer(
        &self,
        host_name: &str,
        no_create: bool,
    ) -> Result<Option<Arc<Balancer>>, BalancerError> {
        let Some(upstream) = self.get_upstream_by_name(host_name).await? else {
            return Ok(None);
        };

        if let Some(balancer) = self.balancer_by_id(upstream.id) {
            return Ok(Some(balancer));
        }
        if no_create {
            return Err(BalancerError::NotCreated(host_name.to_string()));
        }

        let lock = self.lock_for(upstream.id);
        let _guard = lock.lock().await;
        if let Some(balancer) = self.balancer_by_id(upstream.id) {
            return Ok(Some(balancer));
        }
        let balancer = self.create_balancer(&upstream, None, 0).await?;
        Ok(Some(balancer))
    }

    /// Removes the registry entry and stops its checker. Requests that
    /// already captured the balancer keep using their reference.
    pub(crate) fn remove_balancer(&self, id: Uuid) -> Option<Arc<Balancer>> {
        let removed = self.balancers.remove(&id).map(|(_, b)| b);
        if let Some(balancer) = &removed {
            balancer.stop_healthchecker();
            metrics::gauge!("gateway_balancers_total").set(self.balancers.len() as f64);
        }
        removed
    }

    /// Pushes an externally determined health verdict into the checker of
    /// the upstream's balancer. The checker broadcasts it on the bus,
    /// which updates peer status on every bound balancer.
    pub fn post_health(
        &self,
        upstream: &Upstream,
        ip: IpAddr,
        port: u16,
        is_healthy: bool,
    ) -> Result<(), BalancerError> {
        let balancer = self
            .balancer_by_id(upstream.id)
            .ok_or_else(|| BalancerError::NotCreated(upstream.name.clone()))?;
        let checker = balancer
            .health_checker()
            .ok_or_else(|| BalancerError::NoHealthChecker(upstream.name.clone()))?;
        checker.set_target_status(ip, port, is_healthy);
        Ok(())
    }
}
