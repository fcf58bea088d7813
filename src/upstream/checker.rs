use crate::events::{EventBus, HealthEventKind, HealthTarget};
use crate::store::{HealthCheckConfig, PassiveHealthCheck};
use crate::upstream::health::HealthChecker;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Event-bus source health verdicts are published under.
pub const HEALTH_EVENT_SOURCE: &str = "balancer-healthchecker";

const VERDICT_UNKNOWN: u8 = 0;
const VERDICT_HEALTHY: u8 = 1;
const VERDICT_UNHEALTHY: u8 = 2;

struct TargetState {
    hostname: String,
    verdict: AtomicU8,
    success_streak: AtomicU32,
    failure_streak: AtomicU32,
}

impl TargetState {
    fn verdict(&self) -> Option<bool> {
        match self.verdict.load(Ordering::Acquire) {
            VERDICT_HEALTHY => Some(true),
            VERDICT_UNHEALTHY => Some(false),
            _ => None,
        }
    }
}

/// Health checker combining an active HTTP probe loop with passive
/// traffic accounting. Verdict flips are broadcast on the event bus;
/// the balancer binding turns them into peer status updates.
pub struct ActiveHealthChecker {
    upstream_name: String,
    config: HealthCheckConfig,
    bus: Arc<dyn EventBus>,
    targets: DashMap<(IpAddr, u16), Arc<TargetState>>,
    client: reqwest::Client,
    shutdown: watch::Sender<bool>,
    probe_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ActiveHealthChecker {
    pub fn new(
        upstream_name: &str,
        config: HealthCheckConfig,
        bus: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        let probe_timeout = config
            .active
            .as_ref()
            .map(|a| a.timeout)
            .unwrap_or(3);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(probe_timeout))
            .no_proxy()
            .build()
            .unwrap_or_default();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let checker = Arc::new(Self {
            upstream_name: upstream_name.to_string(),
            config,
            bus,
            targets: DashMap::new(),
            client,
            shutdown,
            probe_task: Mutex::new(None),
        });

        if checker.config.active.is_some() {
            // The loop holds a Weak handle so dropping the last owner
            // ends probing even without an explicit stop().
            let weak = Arc::downgrade(&checker);
            let handle = tokio::spawn(probe_loop(weak, shutdown_rx));
            *checker.probe_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }

        checker
    }

    fn apply_verdict(&self, ip: IpAddr, port: u16, state: &TargetState, healthy: bool) {
        let new = if healthy {
            VERDICT_HEALTHY
        } else {
            VERDICT_UNHEALTHY
        };
        let old = state.verdict.swap(new, Ordering::AcqRel);
        if old == new {
            return;
        }

        metrics::gauge!(
            "gateway_upstream_health_status",
            "upstream" => self.upstream_name.clone(),
            "target" => format!("{}:{}", ip, port),
        )
        .set(if healthy { 1.0 } else { 0.0 });
        if healthy {
            info!(
                "health: target marked healthy, upstream={}, target={}:{}",
                self.upstream_name, ip, port
            );
        } else {
            warn!(
                "health: target marked unhealthy, upstream={}, target={}:{}",
                self.upstream_name, ip, port
            );
        }

        let kind = if healthy {
            HealthEventKind::Healthy
        } else {
            HealthEventKind::Unhealthy
        };
        self.bus.post(
            HEALTH_EVENT_SOURCE,
            kind,
            &HealthTarget {
                ip,
                port,
                hostname: state.hostname.clone(),
            },
        );
    }

    fn record_success(&self, ip: IpAddr, port: u16, threshold: u32) {
        let Some(state) = self.targets.get(&(ip, port)).map(|e| e.value().clone()) else {
            return;
        };
        state.failure_streak.store(0, Ordering::Release);
        let streak = state.success_streak.fetch_add(1, Ordering::AcqRel) + 1;
        if streak >= threshold && state.verdict() != Some(true) {
            self.apply_verdict(ip, port, &state, true);
        }
    }

    fn record_failure(&self, ip: IpAddr, port: u16, threshold: u32) {
        let Some(state) = self.targets.get(&(ip, port)).map(|e| e.value().clone()) else {
            return;
        };
        state.success_streak.store(0, Ordering::Release);
        let streak = state.failure_streak.fetch_add(1, Ordering::AcqRel) + 1;
        if streak >= threshold && state.verdict() != Some(false) {
            self.apply_verdict(ip, port, &state, false);
        }
    }

    fn passive(&self) -> Option<&PassiveHealthCheck> {
        self.config.passive.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn target_count(&self) -> usize {
        self.targets.len()
    }
}

impl HealthChecker for ActiveHealthChecker {
    fn event_source(&self) -> &str {
        HEALTH_EVENT_SOURCE
    }

    fn add_target(&self, ip: IpAddr, port: u16, hostname: &str) {
        self.targets
            .entry((ip, port))
            .or_insert_with(|| {
                debug!(
                    "health: target added, upstream={}, target={}:{}, hostname={}",
                    self.upstream_name, ip, port, hostname
                );
                Arc::new(TargetState {
                    hostname: hostname.to_string(),
                    verdict: AtomicU8::new(VERDICT_UNKNOWN),
                    success_streak: AtomicU32::new(0),
                    failure_streak: AtomicU32::new(0),
                })
            });
    }

    fn remove_target(&self, ip: IpAddr, port: u16) {
        if self.targets.remove(&(ip, port)).is_some() {
            debug!(
                "health: target removed, upstream={}, target={}:{}",
                self.upstream_name, ip, port
            );
        }
    }

    fn target_status(&self, ip: IpAddr, port: u16) -> Option<bool> {
        self.targets.get(&(ip, port)).and_then(|s| s.verdict())
    }

    fn report_http_status(&self, ip: IpAddr, port: u16, status: u16) {
        let Some(passive) = self.passive() else {
            return;
        };
        if passive.unhealthy_statuses.contains(&status) {
            self.record_failure(ip, port, passive.http_failures);
        } else {
            // A good response ends any failure streak.
            if let Some(state) = self.targets.get(&(ip, port)) {
                state.failure_streak.store(0, Ordering::Release);
            }
        }
    }

    fn report_tcp_failure(&self, ip: IpAddr, port: u16) {
        let Some(passive) = self.passive() else {
            return;
        };
        self.record_failure(ip, port, passive.tcp_failures);
    }

    fn set_target_status(&self, ip: IpAddr, port: u16, healthy: bool) {
        let state = self
            .targets
            .entry((ip, port))
            .or_insert_with(|| {
                Arc::new(TargetState {
                    hostname: ip.to_string(),
                    verdict: AtomicU8::new(VERDICT_UNKNOWN),
                    success_streak: AtomicU32::new(0),
                    failure_streak: AtomicU32::new(0),
                })
            })
            .value()
            .clone();
        state.success_streak.store(0, Ordering::Release);
        state.failure_streak.store(0, Ordering::Release);
        self.apply_verdict(ip, port, &state, healthy);
    }

    fn stop(&self) {
        self.targets.clear();
        let _ = self.shutdown.send(true);
        if let Some(handle) = self
            .probe_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl Drop for ActiveHealthChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn probe_loop(checker: Weak<ActiveHealthChecker>, mut shutdown: watch::Receiver<bool>) {
    let interval_secs = {
        let Some(checker) = checker.upgrade() else {
            return;
        };
        checker
            .config
            .active
            .as_ref()
            .map(|a| a.interval)
            .unwrap_or(10)
    };
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        let Some(checker) = checker.upgrade() else {
            return;
        };
        probe_round(&checker).await;
    }
}

/// One active probe round over every known target, bounded by the
/// configured concurrency.
async fn probe_round(checker: &Arc<ActiveHealthChecker>) {
    let Some(active) = checker.config.active.clone() else {
        return;
    };

    let targets: Vec<(IpAddr, u16)> = checker.targets.iter().map(|e| *e.key()).collect();
    if targets.is_empty() {
        return;
    }

    stream::iter(targets)
        .map(|(ip, port)| {
            let checker = checker.clone();
            let active = active.clone();
            async move {
                let probe_port = active.port.unwrap_or(port);
                let host = match ip {
                    IpAddr::V4(v4) => v4.to_string(),
                    IpAddr::V6(v6) => format!("[{}]", v6),
                };
                let url = format!("http://{}:{}{}", host, probe_port, active.path);

                let healthy = match checker.client.get(&url).send().await {
                    Ok(resp) => active.healthy_statuses.contains(&resp.status().as_u16()),
                    Err(e) => {
                        debug!(
                            "health: probe failed, upstream={}, target={}:{}, error={}",
                            checker.upstream_name, ip, port, e
                        );
                        false
                    }
                };

                metrics::counter!(
                    "gateway_health_check_total",
                    "upstream" => checker.upstream_name.clone(),
                    "result" => if healthy { "success" } else { "failure" },
                )
                .increment(1);

                if healthy {
                    checker.record_success(ip, port, active.healthy_threshold);
                } else {
                    checker.record_failure(ip, port, active.unhealthy_threshold);
                }
            }
        })
        .buffer_unordered(active.concurrency.max(1))
        .collect::<()>()
        .await;
}
