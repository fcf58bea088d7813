use super::{history, Balancer, BalancerCore};
use crate::cache;
use crate::error::BalancerError;
use crate::store::{Target, Upstream};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Config-store CRUD operation carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrudOp {
    Create,
    Update,
    Delete,
}

impl fmt::Display for CrudOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrudOp::Create => write!(f, "create"),
            CrudOp::Update => write!(f, "update"),
            CrudOp::Delete => write!(f, "delete"),
        }
    }
}

impl BalancerCore {
    /// Reacts to a target CRUD event. Always invalidates the cached
    /// history; then reconciles the balancer, if one exists. Errors are
    /// logged and swallowed so the event is acknowledged regardless.
    pub async fn on_target_event(&self, op: CrudOp, target: &Target) {
        let upstream_id = target.upstream_id;
        debug!(
            "events: target {} received, upstream={}, target={}",
            op, upstream_id, target.target
        );
        self.cache.invalidate_local(&cache::targets_key(upstream_id));

        let lock = self.lock_for(upstream_id);
        let _guard = lock.lock().await;

        let upstream = match self.get_upstream_by_id(upstream_id).await {
            Ok(Some(upstream)) => upstream,
            Ok(None) => {
                info!(
                    "events: target event for unknown upstream, id={}",
                    upstream_id
                );
                return;
            }
            Err(e) => {
                error!(
                    "events: failed loading upstream for target event, id={}, error={}",
                    upstream_id, e
                );
                return;
            }
        };

        let Some(balancer) = self.balancer_by_id(upstream_id) else {
            info!(
                "events: target event for upstream without balancer, name={}",
                upstream.name
            );
            return;
        };

        if let Err(e) = self.check_target_history(&upstream, &balancer).await {
            error!(
                "events: target history reconciliation failed, name={}, error={}",
                upstream.name, e
            );
        }
    }

    /// Compares the freshly fetched history against what the balancer
    /// replayed. Unchanged histories are a no-op; a strict extension is
    /// replayed forward onto the existing ring; a diverged history (an
    /// entry edited or reordered) cannot be unwound in place, so the
    /// checker is stopped and the balancer rebuilt from scratch.
    pub(crate) async fn check_target_history(
        &self,
        upstream: &Upstream,
        balancer: &Arc<Balancer>,
    ) -> Result<(), BalancerError> {
        let new_history = self.fetch_target_history(upstream).await?;
        let old_history = balancer.replayed_history();

        if history::unchanged(&old_history, &new_history) {
            debug!("events: history unchanged, name={}", upstream.name);
            return Ok(());
        }

        let last_equal = history::last_equal_index(&old_history, &new_history);
        if last_equal == old_history.len() {
            info!(
                "events: history extended, name={}, applied={}..{}",
                upstream.name,
                last_equal,
                new_history.len()
            );
            return history::apply_history(balancer, &new_history, last_equal);
        }

        info!(
            "events: history diverged, name={}, common_prefix={}, rebuilding",
            upstream.name, last_equal
        );
        balancer.stop_healthchecker();
        self.create_balancer(upstream, Some(new_history), 0).await?;
        Ok(())
    }

    /// Reacts to an upstream CRUD event: invalidates the affected cache
    /// keys and creates, recreates, or removes the balancer. Errors are
    /// logged and swallowed.
    pub async fn on_upstream_event(&self, op: CrudOp, upstream: &Upstream) {
        debug!(
            "events: upstream {} received, name={}, id={}",
            op, upstream.name, upstream.id
        );

        let lock = self.lock_for(upstream.id);
        let _guard = lock.lock().await;

        match op {
            CrudOp::Create => {
                self.cache.invalidate_local(&cache::upstreams_key());
                if let Err(e) = self.create_balancer(upstream, None, 0).await {
                    error!(
                        "events: balancer creation failed, name={}, error={}",
                        upstream.name, e
                    );
                }
            }
            CrudOp::Update => {
                self.invalidate_upstream_keys(upstream);
                if let Some(existing) = self.balancer_by_id(upstream.id) {
                    existing.stop_healthchecker();
                }
                if let Err(e) = self.create_balancer(upstream, None, 0).await {
                    error!(
                        "events: balancer recreation failed, name={}, error={}",
                        upstream.name, e
                    );
                }
            }
            CrudOp::Delete => {
                self.invalidate_upstream_keys(upstream);
                if self.remove_balancer(upstream.id).is_some() {
                    info!("events: balancer removed, name={}", upstream.name);
                }
            }
        }
    }

    fn invalidate_upstream_keys(&self, upstream: &Upstream) {
        self.cache.invalidate_local(&cache::upstreams_key());
        self.cache
            .invalidate_local(&cache::upstream_key(upstream.id));
        self.cache
            .invalidate_local(&cache::targets_key(upstream.id));
    }
}
