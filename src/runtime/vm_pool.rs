// src/runtime/vm_pool.rs
//! Pool of reusable isolated VM instances
//!
//! Instead of booting a fresh instance for every run, finished instances are
//! reset and parked per image so the next lease skips the boot.
//!
//! # Architecture
//!
//! ```text
//! VmPool
//! ├─ Bucket "python"  ── Semaphore(pool_capacity)   (leases for this image)
//! │                   └─ Idle: [vm-a, vm-b]         (front = least recently used)
//! ├─ Bucket "node"    ── ...
//! └─ Leases: { vm-c → session, holder task, mount } (busy instances)
//! ```
//!
//! Each bucket has its own semaphore and idle lock, so leasing one image never
//! contends with another. Only the global instance cap is shared: when it is
//! reached, the least recently used idle instance of *any* image is torn down
//! to make room. With nothing idle, a boot waits for a release or teardown
//! until the lease deadline.

use crate::dispatcher::task::TaskId;
use crate::runtime::micro_vm::VmBackend;
use crate::utils::config::{MicroConfig, MicroImageConfig};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identity and location of one instance, as seen by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    pub id: String,
    pub image: String,
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Idle,
    Busy,
    Terminating,
}

/// Public view of a pool entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub vm_id: String,
    pub image: String,
    pub status: VmStatus,
    pub booted_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub executions: u64,
    pub mount: Option<PathBuf>,
}

/// Pool statistics for one image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub image: String,
    pub capacity: usize,
    pub idle: usize,
    pub busy: usize,
    pub booted: u64,
    pub reused: u64,
    pub evicted: u64,
}

/// Result of a successful lease
#[derive(Debug, Clone)]
pub struct LeasedVm {
    pub handle: VmHandle,

    /// Booted for this lease rather than taken from the idle list
    pub fresh: bool,
}

/// A leased instance checked out for one execution
#[derive(Debug, Clone)]
pub struct ActiveVm {
    pub handle: VmHandle,
    pub mount: Option<PathBuf>,
    pub exec_lock: Arc<tokio::sync::Mutex<()>>,
}

struct IdleVm {
    handle: VmHandle,
    booted_at: DateTime<Utc>,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    executions: u64,
}

struct Lease {
    handle: VmHandle,
    booted_at: DateTime<Utc>,
    executions: u64,
    session_id: String,

    /// Task currently operating the instance
    holder: Option<TaskId>,
    mount: Option<PathBuf>,
    tainted: bool,
    last_active: Instant,
    last_active_at: DateTime<Utc>,
    exec_lock: Arc<tokio::sync::Mutex<()>>,
    _permit: OwnedSemaphorePermit,
}

struct Bucket {
    image: MicroImageConfig,
    capacity: usize,
    leases: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleVm>>,
    booted: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
}

/// VM pool, owned by the MicroVM engine
pub struct VmPool {
    root: PathBuf,
    max_instances: usize,
    lease_timeout: Duration,
    backend: Arc<dyn VmBackend>,
    buckets: HashMap<String, Arc<Bucket>>,
    leases: DashMap<String, Lease>,
    instances: AtomicUsize,

    /// Signalled when an instance is parked idle or torn down
    slot_freed: Notify,
}

impl VmPool {
    pub fn new(config: &MicroConfig, backend: Arc<dyn VmBackend>) -> Result<Self> {
        if config.pool_capacity == 0 || config.max_instances == 0 {
            return Err(EngineError::ConfigError(
                "micro pool capacity and max_instances must be greater than 0".into(),
            ));
        }

        let mut buckets = HashMap::new();
        for image in &config.images {
            let bucket = Arc::new(Bucket {
                image: image.clone(),
                capacity: config.pool_capacity,
                leases: Arc::new(Semaphore::new(config.pool_capacity)),
                idle: Mutex::new(VecDeque::new()),
                booted: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
            });
            if buckets.insert(image.name.clone(), bucket).is_some() {
                return Err(EngineError::ConfigError(format!(
                    "duplicate micro image '{}'",
                    image.name
                )));
            }
        }

        info!(
            images = buckets.len(),
            capacity = config.pool_capacity,
            max_instances = config.max_instances,
            backend = %backend.description(),
            "vm pool initialized"
        );

        Ok(Self {
            root: config.root.clone(),
            max_instances: config.max_instances,
            lease_timeout: Duration::from_millis(config.lease_timeout_ms),
            backend,
            buckets,
            leases: DashMap::new(),
            instances: AtomicUsize::new(0),
            slot_freed: Notify::new(),
        })
    }

    pub fn image(&self, name: &str) -> Option<&MicroImageConfig> {
        self.buckets.get(name).map(|bucket| &bucket.image)
    }

    fn bucket(&self, image: &str) -> Result<&Arc<Bucket>> {
        self.buckets
            .get(image)
            .ok_or_else(|| EngineError::InvalidParameters(format!("unknown micro image '{}'", image)))
    }

    /// Lease an instance of `image`: reuse an idle one or boot a new one.
    ///
    /// Waits up to the lease timeout, in total, for a bucket permit and for
    /// room under the global instance cap.
    pub async fn lease(
        &self,
        image: &str,
        session_id: &str,
        holder: TaskId,
        mount: Option<PathBuf>,
    ) -> Result<LeasedVm> {
        let bucket = Arc::clone(self.bucket(image)?);
        let deadline = tokio::time::Instant::now() + self.lease_timeout;

        let permit = tokio::time::timeout_at(deadline, Arc::clone(&bucket.leases).acquire_owned())
            .await
            .map_err(|_| {
                EngineError::PoolExhausted(format!(
                    "no '{}' instance became available within {:?}",
                    image, self.lease_timeout
                ))
            })?
            .map_err(|_| EngineError::Internal("vm pool closed".into()))?;

        // Most recently used first: it is the warmest.
        let mut reused = None;
        loop {
            let candidate = bucket.idle.lock().pop_back();
            let Some(vm) = candidate else { break };
            if self.backend.healthy(&vm.handle).await {
                reused = Some(vm);
                break;
            }
            warn!(vm_id = %vm.handle.id, "idle instance unhealthy, tearing down");
            self.destroy(&bucket, &vm.handle).await;
        }

        let (handle, booted_at, executions, fresh) = match reused {
            Some(vm) => {
                bucket.reused.fetch_add(1, Ordering::Relaxed);
                debug!(vm_id = %vm.handle.id, image, "reusing pooled instance");
                (vm.handle, vm.booted_at, vm.executions, false)
            }
            None => {
                let handle = self.boot(&bucket, deadline).await?;
                (handle, Utc::now(), 0, true)
            }
        };

        let now = Utc::now();
        self.leases.insert(
            handle.id.clone(),
            Lease {
                handle: handle.clone(),
                booted_at,
                executions,
                session_id: session_id.to_string(),
                holder: Some(holder),
                mount,
                tainted: false,
                last_active: Instant::now(),
                last_active_at: now,
                exec_lock: Arc::new(tokio::sync::Mutex::new(())),
                _permit: permit,
            },
        );
        Ok(LeasedVm { handle, fresh })
    }

    async fn boot(&self, bucket: &Bucket, deadline: tokio::time::Instant) -> Result<VmHandle> {
        self.reserve_instance_slot(deadline).await?;

        let id = format!("vm-{}", ulid::Ulid::new().to_string().to_lowercase());
        let handle = VmHandle {
            root: self.root.join(&id),
            id,
            image: bucket.image.name.clone(),
        };

        let started = Instant::now();
        if let Err(err) = self.backend.boot(&handle, &bucket.image).await {
            self.instances.fetch_sub(1, Ordering::AcqRel);
            let _ = self.backend.destroy(&handle).await;
            return Err(err);
        }

        bucket.booted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sandbox_vm_pool_boots_total", "image" => bucket.image.name.clone())
            .increment(1);
        info!(vm_id = %handle.id, image = %handle.image, elapsed = ?started.elapsed(), "booted instance");
        Ok(handle)
    }

    /// Claim room under the global instance cap, evicting an idle LRU instance if needed
    async fn reserve_instance_slot(&self, deadline: tokio::time::Instant) -> Result<()> {
        loop {
            // Registered before the check so a release in between is not missed.
            let freed = self.slot_freed.notified();
            let reserved = self
                .instances
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < self.max_instances).then_some(n + 1)
                })
                .is_ok();
            if reserved {
                return Ok(());
            }
            if self.evict_lru_idle().await {
                continue;
            }
            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                return Err(EngineError::PoolExhausted(format!(
                    "all {} instances stayed leased for {:?}",
                    self.max_instances, self.lease_timeout
                )));
            }
        }
    }

    /// Tear down the least recently used idle instance across all images
    async fn evict_lru_idle(&self) -> bool {
        let oldest = self
            .buckets
            .values()
            .filter_map(|bucket| {
                bucket
                    .idle
                    .lock()
                    .front()
                    .map(|vm| (vm.last_used, Arc::clone(bucket)))
            })
            .min_by_key(|(last_used, _)| *last_used);

        let Some((_, bucket)) = oldest else {
            return false;
        };
        let victim = bucket.idle.lock().pop_front();
        match victim {
            Some(vm) => {
                debug!(vm_id = %vm.handle.id, "evicting least recently used instance");
                self.destroy(&bucket, &vm.handle).await;
                true
            }
            // Raced with a lease; the caller retries the reservation.
            None => true,
        }
    }

    /// Check out a leased instance for an execution by `holder`
    pub fn checkout(&self, vm_id: &str, session_id: &str, holder: TaskId) -> Result<ActiveVm> {
        let mut lease = self
            .leases
            .get_mut(vm_id)
            .filter(|lease| lease.session_id == session_id)
            .ok_or_else(|| EngineError::NotFound(format!("vm '{}'", vm_id)))?;
        if lease.tainted {
            return Err(EngineError::ExecutionFailed(format!(
                "vm '{}' is unhealthy and must be stopped",
                vm_id
            )));
        }
        lease.holder = Some(holder);
        Ok(ActiveVm {
            handle: lease.handle.clone(),
            mount: lease.mount.clone(),
            exec_lock: Arc::clone(&lease.exec_lock),
        })
    }

    /// Record the end of an operation by `holder`
    pub fn finish(&self, vm_id: &str, holder: TaskId, executed: bool, tainted: bool) {
        if let Some(mut lease) = self.leases.get_mut(vm_id) {
            if lease.holder == Some(holder) {
                lease.holder = None;
            }
            if executed {
                lease.executions += 1;
            }
            lease.tainted |= tainted;
            lease.last_active = Instant::now();
            lease.last_active_at = Utc::now();
        }
    }

    /// End a lease. Healthy instances are reset and parked; others are torn down.
    ///
    /// Returns whether the instance went back to the pool.
    pub async fn release(&self, vm_id: &str, session_id: &str) -> Result<bool> {
        let (_, lease) = self
            .leases
            .remove_if(vm_id, |_, lease| lease.session_id == session_id)
            .ok_or_else(|| EngineError::NotFound(format!("vm '{}'", vm_id)))?;
        Ok(self.recycle(lease).await)
    }

    async fn recycle(&self, lease: Lease) -> bool {
        let Some(bucket) = self.buckets.get(&lease.handle.image).cloned() else {
            return false;
        };

        let reusable = !lease.tainted
            && self.backend.healthy(&lease.handle).await
            && match self.backend.reset(&lease.handle).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(vm_id = %lease.handle.id, error = %err, "instance reset failed");
                    false
                }
            };

        if !reusable {
            self.destroy(&bucket, &lease.handle).await;
            return false;
        }

        bucket.idle.lock().push_back(IdleVm {
            handle: lease.handle,
            booted_at: lease.booted_at,
            last_used: Instant::now(),
            last_used_at: Utc::now(),
            executions: lease.executions,
        });
        self.slot_freed.notify_waiters();
        // The lease permit is dropped here, waking one waiter.
        true
    }

    /// Tear down every lease `holder` is still operating.
    ///
    /// Called when a task ends without completing, so an aborted operation
    /// never leaves an instance leased to nobody.
    pub async fn release_held_by(&self, holder: TaskId) -> usize {
        let held: Vec<String> = self
            .leases
            .iter()
            .filter(|lease| lease.holder == Some(holder))
            .map(|lease| lease.key().clone())
            .collect();

        let mut released = 0;
        for vm_id in held {
            if let Some((_, mut lease)) = self.leases.remove(&vm_id) {
                lease.tainted = true;
                warn!(vm_id = %vm_id, task_id = %holder, "force-releasing lease of aborted task");
                self.recycle(lease).await;
                released += 1;
            }
        }
        released
    }

    /// Tear down idle instances, and abandoned leases, unused for longer than `ttl`
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let mut evicted = 0;
        for bucket in self.buckets.values() {
            let expired: Vec<IdleVm> = {
                let mut idle = bucket.idle.lock();
                let mut expired = Vec::new();
                while idle.front().is_some_and(|vm| vm.last_used.elapsed() >= ttl) {
                    if let Some(vm) = idle.pop_front() {
                        expired.push(vm);
                    }
                }
                expired
            };
            for vm in expired {
                self.destroy(bucket, &vm.handle).await;
                evicted += 1;
            }
        }

        let abandoned: Vec<String> = self
            .leases
            .iter()
            .filter(|lease| lease.holder.is_none() && lease.last_active.elapsed() >= ttl)
            .map(|lease| lease.key().clone())
            .collect();
        for vm_id in abandoned {
            let removed = self
                .leases
                .remove_if(&vm_id, |_, lease| lease.holder.is_none() && lease.last_active.elapsed() >= ttl);
            if let Some((_, lease)) = removed {
                info!(vm_id = %vm_id, session = %lease.session_id, "reclaiming abandoned lease");
                if let Some(bucket) = self.buckets.get(&lease.handle.image) {
                    self.destroy(bucket, &lease.handle).await;
                }
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(evicted, "idle eviction pass");
        }
        evicted
    }

    /// Periodically evict idle instances until `shutdown` fires
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        ttl: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.evict_idle(ttl).await;
                    }
                }
            }
        })
    }

    /// Tear down every instance
    pub async fn shutdown(&self) {
        let leased: Vec<String> = self.leases.iter().map(|lease| lease.key().clone()).collect();
        for vm_id in leased {
            if let Some((_, lease)) = self.leases.remove(&vm_id) {
                if let Some(bucket) = self.buckets.get(&lease.handle.image) {
                    self.destroy(bucket, &lease.handle).await;
                }
            }
        }
        for bucket in self.buckets.values() {
            let idle: Vec<IdleVm> = bucket.idle.lock().drain(..).collect();
            for vm in idle {
                self.destroy(bucket, &vm.handle).await;
            }
        }
        info!("vm pool shut down");
    }

    async fn destroy(&self, bucket: &Bucket, handle: &VmHandle) {
        if let Err(err) = self.backend.destroy(handle).await {
            warn!(vm_id = %handle.id, error = %err, "instance teardown failed");
        }
        self.instances.fetch_sub(1, Ordering::AcqRel);
        self.slot_freed.notify_waiters();
        bucket.evicted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sandbox_vm_pool_evictions_total", "image" => bucket.image.name.clone())
            .increment(1);
    }

    pub fn info(&self, vm_id: &str) -> Option<VmInfo> {
        if let Some(lease) = self.leases.get(vm_id) {
            return Some(VmInfo {
                vm_id: lease.handle.id.clone(),
                image: lease.handle.image.clone(),
                status: VmStatus::Busy,
                booted_at: lease.booted_at,
                last_used: lease.last_active_at,
                lease_owner: Some(lease.session_id.clone()),
                executions: lease.executions,
                mount: lease.mount.clone(),
            });
        }
        self.buckets.values().find_map(|bucket| {
            bucket.idle.lock().iter().find(|vm| vm.handle.id == vm_id).map(|vm| VmInfo {
                vm_id: vm.handle.id.clone(),
                image: vm.handle.image.clone(),
                status: VmStatus::Idle,
                booted_at: vm.booted_at,
                last_used: vm.last_used_at,
                lease_owner: None,
                executions: vm.executions,
                mount: None,
            })
        })
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self
            .buckets
            .values()
            .map(|bucket| PoolStats {
                image: bucket.image.name.clone(),
                capacity: bucket.capacity,
                idle: bucket.idle.lock().len(),
                busy: bucket.capacity - bucket.leases.available_permits(),
                booted: bucket.booted.load(Ordering::Relaxed),
                reused: bucket.reused.load(Ordering::Relaxed),
                evicted: bucket.evicted.load(Ordering::Relaxed),
            })
            .collect();
        stats.sort_by(|a, b| a.image.cmp(&b.image));
        stats
    }

    /// Live instances across all images
    pub fn total_instances(&self) -> usize {
        self.instances.load(Ordering::Acquire)
    }
}
