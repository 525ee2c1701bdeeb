//! Instance pool: at most one running container per cached image, with
//! all requests to an instance serialized through its execution lock.
//!
//! The creator of an instance takes the execution lock before the entry
//! becomes visible, so concurrent requests for the same image block until
//! the cold start finishes and then reuse the warm container.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use runner_common::{Result, RunnerError};
use serde::Serialize;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::{CachedImage, ImageCache};
use crate::config::EngineConfig;
use crate::ports::PortAllocator;
use crate::runtime::{wait_for_ready, ContainerRuntime, LaunchSpec, AGENT_PORT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Container is being launched; the creator holds the execution lock.
    Starting,
    /// Idle and healthy, execution lock free.
    Ready,
    /// A request holds the execution lock.
    Serving,
    /// Broken; will be removed from the pool.
    Failed,
    /// Teardown in progress or complete.
    Stopping,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Starting => "starting",
            InstanceState::Ready => "ready",
            InstanceState::Serving => "serving",
            InstanceState::Failed => "failed",
            InstanceState::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

/// Whether an acquisition launched a container or reused a warm one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Cold,
    Warm,
}

impl std::fmt::Display for StartMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartMode::Cold => write!(f, "cold"),
            StartMode::Warm => write!(f, "warm"),
        }
    }
}

struct InstanceInner {
    state: InstanceState,
    container_id: Option<String>,
    last_active: Instant,
    retired: bool,
}

pub struct Instance {
    cache_key: String,
    port: u16,
    image: CachedImage,
    inner: StdMutex<InstanceInner>,
    exec_lock: Arc<TokioMutex<()>>,
}

impl Instance {
    pub fn state(&self) -> InstanceState {
        self.lock_inner().state
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, InstanceInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: InstanceState) {
        let mut inner = self.lock_inner();
        inner.state = state;
        inner.last_active = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.lock_inner().last_active.elapsed()
    }

    fn last_active_at(&self) -> Instant {
        self.lock_inner().last_active
    }
}

#[derive(Default)]
struct PoolStats {
    cold_starts: AtomicU64,
    warm_acquisitions: AtomicU64,
    reaped_idle: AtomicU64,
    evicted_capacity: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatsSnapshot {
    pub cold_starts: u64,
    pub warm_acquisitions: u64,
    pub reaped_idle: u64,
    pub evicted_capacity: u64,
    pub failed: u64,
    pub active_instances: usize,
    pub available_ports: usize,
}

struct PoolInner {
    runtime: Arc<dyn ContainerRuntime>,
    cache: ImageCache,
    ports: PortAllocator,
    config: EngineConfig,
    instances: StdMutex<HashMap<String, Arc<Instance>>>,
    stats: PoolStats,
}

#[derive(Clone)]
pub struct InstancePool {
    inner: Arc<PoolInner>,
}

enum Plan {
    Create {
        instance: Arc<Instance>,
        guard: OwnedMutexGuard<()>,
    },
    Wait(Arc<Instance>),
}

impl InstancePool {
    /// Creates the pool and spawns its reaper. The reaper stops once the
    /// last pool handle is dropped.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        cache: ImageCache,
        ports: PortAllocator,
        config: EngineConfig,
    ) -> InstancePool {
        // tokio::time::interval panics on a zero period.
        let period = config.reap_interval.max(Duration::from_millis(10));
        let pool = InstancePool {
            inner: Arc::new(PoolInner {
                runtime,
                cache,
                ports,
                config,
                instances: StdMutex::new(HashMap::new()),
                stats: PoolStats::default(),
            }),
        };

        let weak = Arc::downgrade(&pool.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                InstancePool { inner }.reap().await;
            }
        });

        pool
    }

    /// Acquires exclusive access to the instance for `image`, launching a
    /// container when none is running. Blocks behind in-flight requests to
    /// the same instance, bounded by `deadline`.
    pub async fn acquire(&self, image: &CachedImage, deadline: Duration) -> Result<Lease> {
        let started = Instant::now();
        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(RunnerError::deadline("instance_acquire"));
            }

            let plan = {
                let mut map = self.lock_instances();
                match map.get(&image.key) {
                    Some(instance) => Plan::Wait(instance.clone()),
                    None => {
                        let port = self.inner.ports.allocate()?;
                        let retained = match self.inner.cache.retain(&image.key) {
                            Ok(retained) => retained,
                            Err(e) => {
                                self.inner.ports.release(port);
                                return Err(e);
                            }
                        };
                        let exec_lock = Arc::new(TokioMutex::new(()));
                        let guard = match exec_lock.clone().try_lock_owned() {
                            Ok(guard) => guard,
                            Err(_) => {
                                self.inner.ports.release(port);
                                self.inner.cache.release(&image.key);
                                return Err(RunnerError::Internal(
                                    "fresh execution lock already held".to_string(),
                                ));
                            }
                        };
                        let instance = Arc::new(Instance {
                            cache_key: image.key.clone(),
                            port,
                            image: retained,
                            inner: StdMutex::new(InstanceInner {
                                state: InstanceState::Starting,
                                container_id: None,
                                last_active: Instant::now(),
                                retired: false,
                            }),
                            exec_lock,
                        });
                        map.insert(image.key.clone(), instance.clone());
                        Plan::Create { instance, guard }
                    }
                }
            };

            match plan {
                Plan::Create { instance, guard } => {
                    return self.cold_start(instance, guard, remaining).await;
                }
                Plan::Wait(instance) => {
                    let guard =
                        match timeout(remaining, instance.exec_lock.clone().lock_owned()).await {
                            Err(_) => return Err(RunnerError::deadline("instance_acquire")),
                            Ok(guard) => guard,
                        };
                    match instance.state() {
                        InstanceState::Ready => {
                            instance.set_state(InstanceState::Serving);
                            self.inner
                                .stats
                                .warm_acquisitions
                                .fetch_add(1, Ordering::Relaxed);
                            debug!(key = %instance.cache_key, port = instance.port, "reusing warm instance");
                            return Ok(Lease {
                                pool: self.clone(),
                                instance,
                                _guard: guard,
                                start_mode: StartMode::Warm,
                                settled: false,
                            });
                        }
                        InstanceState::Serving => {
                            return Err(RunnerError::Internal(
                                "execution lock acquired while instance was serving".to_string(),
                            ));
                        }
                        state => {
                            // Starting with a free lock means the creator was
                            // cancelled; Failed and Stopping are stale entries.
                            debug!(key = %instance.cache_key, %state, "clearing stale instance");
                            self.retire(&instance, "stale instance").await;
                            drop(guard);
                        }
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            cold_starts: self.inner.stats.cold_starts.load(Ordering::Relaxed),
            warm_acquisitions: self.inner.stats.warm_acquisitions.load(Ordering::Relaxed),
            reaped_idle: self.inner.stats.reaped_idle.load(Ordering::Relaxed),
            evicted_capacity: self.inner.stats.evicted_capacity.load(Ordering::Relaxed),
            failed: self.inner.stats.failed.load(Ordering::Relaxed),
            active_instances: self.lock_instances().len(),
            available_ports: self.inner.ports.available(),
        }
    }

    fn lock_instances(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Instance>>> {
        self.inner
            .instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    async fn cold_start(
        &self,
        instance: Arc<Instance>,
        guard: OwnedMutexGuard<()>,
        budget: Duration,
    ) -> Result<Lease> {
        let started = Instant::now();
        info!(
            key = %instance.cache_key,
            port = instance.port,
            repo_tag = %instance.image.repo_tag,
            "cold starting instance"
        );

        let spec = LaunchSpec {
            cache_key: instance.cache_key.clone(),
            repo_tag: instance.image.repo_tag.clone(),
            archive_path: instance.image.archive_path.clone(),
            host_port: instance.port,
            container_port: AGENT_PORT,
            runtime: self.inner.config.container_runtime.clone(),
        };

        // The launch runs in its own task so a caller that times out or
        // disappears cannot cancel it halfway. The task records the
        // container id on success, and stops the container itself if the
        // instance was retired while it was still coming up.
        let start_task = {
            let runtime = self.inner.runtime.clone();
            let instance = instance.clone();
            tokio::spawn(async move {
                let container = runtime.start(spec).await?;
                let orphaned = {
                    let mut inner = instance.lock_inner();
                    if inner.retired {
                        true
                    } else {
                        inner.container_id = Some(container.container_id.clone());
                        inner.last_active = Instant::now();
                        false
                    }
                };
                if orphaned {
                    warn!(
                        key = %instance.cache_key,
                        container_id = %container.container_id,
                        "instance retired during start, stopping late container"
                    );
                    if let Err(e) = runtime.stop(container.container_id).await {
                        warn!(error = %e, "failed to stop late container");
                    }
                    return Err(RunnerError::Internal(
                        "instance retired during start".to_string(),
                    ));
                }
                Ok(())
            })
        };
        let start_result = match timeout(budget, start_task).await {
            Err(_) => Err(RunnerError::deadline("instance_start")),
            Ok(Err(e)) => Err(RunnerError::Internal(format!("start task: {e}"))),
            Ok(Ok(result)) => result,
        };
        if let Err(e) = start_result {
            self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            self.retire(&instance, "container start failed").await;
            return Err(e);
        }

        // Readiness waits for the configured limit or the request deadline,
        // whichever is shorter.
        let remaining = budget.saturating_sub(started.elapsed());
        let readiness_limit = self.inner.config.readiness_timeout;
        let deadline_bound = remaining < readiness_limit;
        let ready = wait_for_ready(
            instance.port,
            self.inner.config.readiness_poll_interval,
            readiness_limit.min(remaining),
        )
        .await;
        if let Err(e) = ready {
            self.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            self.retire(&instance, "readiness probe failed").await;
            let e = match e {
                RunnerError::ReadinessTimeout(_) if deadline_bound => {
                    RunnerError::deadline("instance_start")
                }
                other => other,
            };
            return Err(e);
        }

        instance.set_state(InstanceState::Serving);
        self.inner.stats.cold_starts.fetch_add(1, Ordering::Relaxed);
        info!(
            key = %instance.cache_key,
            port = instance.port,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "instance ready"
        );
        Ok(Lease {
            pool: self.clone(),
            instance,
            _guard: guard,
            start_mode: StartMode::Cold,
            settled: false,
        })
    }

    /// Stops the container and returns the instance's port and image
    /// reference. Safe to call more than once per instance.
    async fn retire(&self, instance: &Arc<Instance>, reason: &str) {
        let container_id = {
            let mut inner = instance.lock_inner();
            if inner.retired {
                return;
            }
            inner.retired = true;
            inner.state = InstanceState::Stopping;
            inner.container_id.take()
        };
        self.remove_if_same(instance);
        info!(key = %instance.cache_key, port = instance.port, reason, "retiring instance");
        if let Some(id) = container_id {
            if let Err(e) = self.inner.runtime.stop(id.clone()).await {
                warn!(container_id = %id, error = %e, "failed to stop container");
            }
        }
        self.inner.ports.release(instance.port);
        self.inner.cache.release(&instance.cache_key);
    }

    fn remove_if_same(&self, instance: &Arc<Instance>) {
        let mut map = self.lock_instances();
        if let Some(current) = map.get(&instance.cache_key) {
            if Arc::ptr_eq(current, instance) {
                map.remove(&instance.cache_key);
            }
        }
    }

    /// One maintenance sweep: retire instances idle past the timeout, then
    /// trim the pool back under its instance budget, oldest first. Busy
    /// instances are skipped in both passes.
    async fn reap(&self) {
        let idle_timeout = self.inner.config.idle_timeout;
        let mut idle: Vec<(Arc<Instance>, OwnedMutexGuard<()>)> = Vec::new();
        {
            let map = self.lock_instances();
            for instance in map.values() {
                if instance.state() == InstanceState::Ready && instance.idle_for() > idle_timeout {
                    if let Ok(guard) = instance.exec_lock.clone().try_lock_owned() {
                        idle.push((instance.clone(), guard));
                    }
                }
            }
        }
        for (instance, guard) in idle {
            if instance.state() != InstanceState::Ready {
                continue;
            }
            self.inner.stats.reaped_idle.fetch_add(1, Ordering::Relaxed);
            self.retire(&instance, "idle timeout").await;
            drop(guard);
        }

        loop {
            let victim = {
                let map = self.lock_instances();
                if map.len() <= self.inner.config.max_instances {
                    break;
                }
                map.values()
                    .filter(|instance| instance.state() == InstanceState::Ready)
                    .min_by_key(|instance| instance.last_active_at())
                    .cloned()
            };
            let Some(instance) = victim else { break };
            let Ok(guard) = instance.exec_lock.clone().try_lock_owned() else {
                break;
            };
            if instance.state() != InstanceState::Ready {
                drop(guard);
                continue;
            }
            self.inner
                .stats
                .evicted_capacity
                .fetch_add(1, Ordering::Relaxed);
            self.retire(&instance, "over instance capacity").await;
            drop(guard);
        }
    }
}

/// Exclusive access to one instance for the duration of a request. The
/// execution lock is held until the lease is released or dropped.
pub struct Lease {
    pool: InstancePool,
    instance: Arc<Instance>,
    _guard: OwnedMutexGuard<()>,
    start_mode: StartMode,
    settled: bool,
}

impl Lease {
    pub fn port(&self) -> u16 {
        self.instance.port
    }

    pub fn start_mode(&self) -> StartMode {
        self.start_mode
    }

    /// Returns the instance to the pool healthy and ready for reuse.
    pub fn release_ok(mut self) {
        self.settled = true;
        self.instance.set_state(InstanceState::Ready);
    }

    /// Marks the instance broken and tears it down before returning.
    pub async fn release_failed(mut self) {
        self.settled = true;
        self.instance.set_state(InstanceState::Failed);
        self.pool.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
        let pool = self.pool.clone();
        let instance = self.instance.clone();
        pool.retire(&instance, "request failed").await;
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("cache_key", &self.instance.cache_key)
            .field("port", &self.instance.port)
            .field("start_mode", &self.start_mode)
            .field("settled", &self.settled)
            .finish_non_exhaustive()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Dropped without a verdict: the agent may still be mid-request,
        // so the container cannot be trusted for reuse.
        warn!(key = %self.instance.cache_key, "execution lease dropped mid-request, retiring instance");
        self.instance.set_state(InstanceState::Failed);
        self.pool.inner.stats.failed.fetch_add(1, Ordering::Relaxed);
        let pool = self.pool.clone();
        let instance = self.instance.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                pool.retire(&instance, "lease dropped mid-request").await;
            });
        }
    }
}
