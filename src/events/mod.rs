use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Health verdict carried by bus events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEventKind {
    Healthy,
    Unhealthy,
}

/// Event payload: the peer the verdict applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTarget {
    pub ip: IpAddr,
    pub port: u16,
    pub hostname: String,
}

pub type HealthCallback = dyn Fn(HealthEventKind, &HealthTarget) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// The cross-worker event bus. Callbacks are registered weakly: the bus
/// holds a `Weak` handle, so a subscriber that drops its `Arc` stops
/// receiving events without an explicit unregister.
pub trait EventBus: Send + Sync {
    fn register_weak(&self, source: &str, callback: Weak<HealthCallback>) -> SubscriptionId;
    fn unregister(&self, source: &str, id: SubscriptionId);
    fn post(&self, source: &str, event: HealthEventKind, target: &HealthTarget);
}

/// In-process bus. Worker replication, when present, sits behind the same
/// interface.
#[derive(Default)]
pub struct WorkerEvents {
    subscribers: DashMap<String, Vec<(u64, Weak<HealthCallback>)>>,
    next_id: AtomicU64,
}

impl WorkerEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[cfg(test)]
    fn subscriber_count(&self, source: &str) -> usize {
        self.subscribers.get(source).map(|v| v.len()).unwrap_or(0)
    }
}

impl EventBus for WorkerEvents {
    fn register_weak(&self, source: &str, callback: Weak<HealthCallback>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(source.to_string())
            .or_default()
            .push((id, callback));
        SubscriptionId(id)
    }

    fn unregister(&self, source: &str, id: SubscriptionId) {
        if let Some(mut subs) = self.subscribers.get_mut(source) {
            subs.retain(|(sub_id, _)| *sub_id != id.0);
        }
    }

    fn post(&self, source: &str, event: HealthEventKind, target: &HealthTarget) {
        let callbacks: Vec<Arc<HealthCallback>> = {
            let Some(mut subs) = self.subscribers.get_mut(source) else {
                return;
            };
            // Prune subscriptions whose owner has been dropped.
            subs.retain(|(_, weak)| weak.strong_count() > 0);
            subs.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };

        for callback in callbacks {
            callback(event, target);
        }
    }
}
