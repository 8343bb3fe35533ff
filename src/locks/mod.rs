//! Distributed, TTL-bounded exclusive locks over typed resources.
//!
//! Lock keys take the form `lock:<type>:<id>` and are the unit of mutual
//! exclusion; there is no shared mode. The manager runs against one of two
//! backends chosen at startup: an in-process table, or a KV store using
//! atomic `SET NX` with the TTL as expiry. Wait queues are always
//! in-process; a restart invalidates pending acquisitions and clients
//! re-enqueue on retry.

use chrono::{DateTime, Duration, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus};
use crate::constants::LOCK_SWEEP_INTERVAL_SECS;
use crate::{KernelError, Result};

/// Closed set of lockable resource types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    File,
    Service,
    Database,
    Port,
    Terminal,
    Workspace,
    Portfolio,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::File => "file",
            ResourceType::Service => "service",
            ResourceType::Database => "database",
            ResourceType::Port => "port",
            ResourceType::Terminal => "terminal",
            ResourceType::Workspace => "workspace",
            ResourceType::Portfolio => "portfolio",
        }
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(ResourceType::File),
            "service" => Ok(ResourceType::Service),
            "database" => Ok(ResourceType::Database),
            "port" => Ok(ResourceType::Port),
            "terminal" => Ok(ResourceType::Terminal),
            "workspace" => Ok(ResourceType::Workspace),
            "portfolio" => Ok(ResourceType::Portfolio),
            _ => Err(format!("Unknown resource type: {s}")),
        }
    }
}

/// Key under which a (type, id) pair is locked.
pub fn lock_key(resource_type: ResourceType, resource_id: &str) -> String {
    format!("lock:{}:{}", resource_type.as_str(), resource_id)
}

/// An exclusive claim over one resource key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLock {
    pub id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl ResourceLock {
    pub fn key(&self) -> String {
        lock_key(self.resource_type, &self.resource_id)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Parameters of one acquisition attempt.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub owner_id: String,
    /// Defaults to the manager's configured TTL.
    pub ttl_seconds: Option<u64>,
    /// Queue preemption priority; unspecified behaves as 0.
    pub priority: Option<i32>,
    pub metadata: HashMap<String, String>,
}

impl LockRequest {
    pub fn new(
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.into(),
            owner_id: owner_id.into(),
            ttl_seconds: None,
            priority: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Result of a non-blocking acquire.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Acquired(ResourceLock),
    /// The key is held; the request joined the wait queue.
    Queued { wait_id: String, position: usize },
}

impl AcquireOutcome {
    pub fn lock(&self) -> Option<&ResourceLock> {
        match self {
            AcquireOutcome::Acquired(lock) => Some(lock),
            AcquireOutcome::Queued { .. } => None,
        }
    }
}

/// Observability snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockMetrics {
    pub active_locks: usize,
    pub locks_by_type: HashMap<String, usize>,
    pub queue_depth: HashMap<String, usize>,
}

#[derive(Debug)]
struct Waiter {
    wait_id: String,
    request: LockRequest,
    ttl_seconds: u64,
    enqueued_at: DateTime<Utc>,
}

enum LockBackend {
    InProcess(Mutex<HashMap<String, ResourceLock>>),
    Distributed(MultiplexedConnection),
}

fn backend_err(e: redis::RedisError) -> KernelError {
    KernelError::LockBackend {
        message: e.to_string(),
    }
}

/// The lock manager.
pub struct LockManager {
    backend: LockBackend,
    default_ttl_seconds: u64,
    queues: Mutex<HashMap<String, VecDeque<Waiter>>>,
    /// lock id -> key, for release-by-id.
    index: Mutex<HashMap<String, String>>,
    bus: EventBus,
}

impl LockManager {
    /// In-process mode: the lock table lives in this process only.
    pub fn in_process(default_ttl_seconds: u64, bus: EventBus) -> Self {
        Self {
            backend: LockBackend::InProcess(Mutex::new(HashMap::new())),
            default_ttl_seconds,
            queues: Mutex::new(HashMap::new()),
            index: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Distributed mode against a KV store. Expiry relies on the store's
    /// TTL eviction; there is no fallback to in-process when it fails.
    pub fn distributed(
        conn: MultiplexedConnection,
        default_ttl_seconds: u64,
        bus: EventBus,
    ) -> Self {
        Self {
            backend: LockBackend::Distributed(conn),
            default_ttl_seconds,
            queues: Mutex::new(HashMap::new()),
            index: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Attempt to acquire a lock. Never blocks: a held key queues the
    /// request and returns a wait token instead.
    pub async fn acquire(&self, request: LockRequest) -> Result<AcquireOutcome> {
        let key = lock_key(request.resource_type, &request.resource_id);
        let ttl_seconds = request.ttl_seconds.unwrap_or(self.default_ttl_seconds);

        // Read path: an expired holder is released (serving the queue)
        // before this request competes for the key.
        if let Some(existing) = self.get(&key).await? {
            if existing.is_expired() {
                self.expire_lock(&key, &existing).await?;
            }
        }

        let lock = ResourceLock {
            id: Uuid::new_v4().to_string(),
            resource_type: request.resource_type,
            resource_id: request.resource_id.clone(),
            owner_id: request.owner_id.clone(),
            acquired_at: Utc::now(),
            expires_at: Utc::now() + Duration::seconds(ttl_seconds as i64),
            metadata: request.metadata.clone(),
        };

        if self.try_insert(&key, &lock, ttl_seconds).await? {
            self.index.lock().await.insert(lock.id.clone(), key.clone());
            debug!(key = %key, owner = %lock.owner_id, "lock acquired");
            self.bus.publish(BusEvent::LockAcquired {
                key,
                lock_id: lock.id.clone(),
                owner_id: lock.owner_id.clone(),
            });
            return Ok(AcquireOutcome::Acquired(lock));
        }

        let (wait_id, position) = self.enqueue(key.clone(), request, ttl_seconds).await;
        debug!(key = %key, position, "lock held, request queued");
        Ok(AcquireOutcome::Queued { wait_id, position })
    }

    /// Release a lock by id. Idempotent: a second release of the same id
    /// returns `false` with no side effect.
    pub async fn release(&self, lock_id: &str) -> Result<bool> {
        let key = {
            let mut index = self.index.lock().await;
            index.remove(lock_id)
        };
        let key = match key {
            Some(key) => key,
            // Id unknown locally; in distributed mode the record may have
            // been acquired by an earlier incarnation of this process.
            None => match self.find_key_by_id(lock_id).await? {
                Some(key) => key,
                None => return Ok(false),
            },
        };

        let removed = self.remove_if_id(&key, lock_id).await?;
        if let Some(lock) = removed {
            info!(key = %key, owner = %lock.owner_id, "lock released");
            self.bus.publish(BusEvent::LockReleased {
                key: key.clone(),
                lock_id: lock_id.to_string(),
            });
            self.grant_next(&key).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Extend an active lock's expiry. Fails (returns `false`) once the
    /// lock has expired or been released.
    pub async fn extend(&self, lock_id: &str, additional_seconds: u64) -> Result<bool> {
        let key = {
            let index = self.index.lock().await;
            index.get(lock_id).cloned()
        };
        let Some(key) = key else {
            return Ok(false);
        };

        let Some(mut lock) = self.get(&key).await? else {
            return Ok(false);
        };
        if lock.id != lock_id || lock.is_expired() {
            return Ok(false);
        }

        lock.expires_at = lock.expires_at + Duration::seconds(additional_seconds as i64);
        self.overwrite(&key, &lock).await?;
        debug!(key = %key, expires_at = %lock.expires_at, "lock extended");
        Ok(true)
    }

    /// Whether a resource is currently locked. Side-effecting: an expired
    /// lock found here is released (and the queue served) first.
    pub async fn is_locked(&self, resource_type: ResourceType, resource_id: &str) -> Result<bool> {
        let key = lock_key(resource_type, resource_id);
        match self.get(&key).await? {
            None => Ok(false),
            Some(lock) if !lock.is_expired() => Ok(true),
            Some(lock) => {
                self.expire_lock(&key, &lock).await?;
                // The queue head, if any, holds the key now.
                Ok(self.get(&key).await?.is_some())
            }
        }
    }

    /// Release every lock held by an owner; returns the number released.
    pub async fn release_all_by_owner(&self, owner_id: &str) -> Result<usize> {
        let locks = self.active_locks().await?;
        let mut released = 0;
        for lock in locks.into_iter().filter(|l| l.owner_id == owner_id) {
            if self.release(&lock.id).await? {
                released += 1;
            }
        }
        if released > 0 {
            info!(owner_id, released, "released all locks for owner");
        }
        Ok(released)
    }

    /// Snapshot of all unexpired locks.
    pub async fn active_locks(&self) -> Result<Vec<ResourceLock>> {
        match &self.backend {
            LockBackend::InProcess(map) => {
                let map = map.lock().await;
                Ok(map.values().filter(|l| !l.is_expired()).cloned().collect())
            }
            LockBackend::Distributed(conn) => {
                let keys = {
                    let mut scan_conn = conn.clone();
                    let mut iter: redis::AsyncIter<String> = scan_conn
                        .scan_match("lock:*")
                        .await
                        .map_err(backend_err)?;
                    let mut keys = Vec::new();
                    while let Some(key) = iter.next_item().await {
                        keys.push(key);
                    }
                    keys
                };

                let mut locks = Vec::new();
                for key in keys {
                    if let Some(lock) = self.get(&key).await? {
                        if !lock.is_expired() {
                            locks.push(lock);
                        }
                    }
                }
                Ok(locks)
            }
        }
    }

    /// Active-lock count, counts grouped by type, and queue depth per key.
    pub async fn metrics(&self) -> Result<LockMetrics> {
        let locks = self.active_locks().await?;
        let mut metrics = LockMetrics {
            active_locks: locks.len(),
            ..Default::default()
        };
        for lock in &locks {
            *metrics
                .locks_by_type
                .entry(lock.resource_type.as_str().to_string())
                .or_insert(0) += 1;
        }

        let queues = self.queues.lock().await;
        for (key, queue) in queues.iter() {
            if !queue.is_empty() {
                metrics.queue_depth.insert(key.clone(), queue.len());
            }
        }
        Ok(metrics)
    }

    /// Periodic expiry sweep for in-process mode. Distributed mode relies on
    /// the store's TTL eviction and only needs queue service on release.
    pub fn spawn_sweep_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                LOCK_SWEEP_INTERVAL_SECS,
            ));
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = self.sweep_expired().await {
                    warn!(error = %e, "lock expiry sweep failed");
                }
            }
        })
    }

    /// Remove every expired lock, serving wait queues as keys free up.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let expired: Vec<(String, ResourceLock)> = match &self.backend {
            LockBackend::InProcess(map) => {
                let map = map.lock().await;
                map.iter()
                    .filter(|(_, l)| l.is_expired())
                    .map(|(k, l)| (k.clone(), l.clone()))
                    .collect()
            }
            // TTL eviction already removed the records; nothing to sweep.
            LockBackend::Distributed(_) => Vec::new(),
        };

        let count = expired.len();
        for (key, lock) in expired {
            self.expire_lock(&key, &lock).await?;
        }
        if count > 0 {
            debug!(count, "swept expired locks");
        }
        Ok(count)
    }

    // ---- queue handling ------------------------------------------------

    async fn enqueue(&self, key: String, request: LockRequest, ttl_seconds: u64) -> (String, usize) {
        let wait_id = Uuid::new_v4().to_string();
        let priority = request.priority.unwrap_or(0);
        let waiter = Waiter {
            wait_id: wait_id.clone(),
            request,
            ttl_seconds,
            enqueued_at: Utc::now(),
        };

        let mut queues = self.queues.lock().await;
        let queue = queues.entry(key).or_default();

        // Insert before the first entry with strictly lower priority; stable
        // within equal priority.
        let position = queue
            .iter()
            .position(|w| w.request.priority.unwrap_or(0) < priority)
            .unwrap_or(queue.len());
        queue.insert(position, waiter);
        (wait_id, position)
    }

    /// Grant the queue head a fresh lock with its original TTL.
    async fn grant_next(&self, key: &str) -> Result<()> {
        let waiter = {
            let mut queues = self.queues.lock().await;
            match queues.get_mut(key) {
                Some(queue) => {
                    let waiter = queue.pop_front();
                    if queue.is_empty() {
                        queues.remove(key);
                    }
                    waiter
                }
                None => None,
            }
        };
        let Some(waiter) = waiter else {
            return Ok(());
        };

        let lock = ResourceLock {
            id: Uuid::new_v4().to_string(),
            resource_type: waiter.request.resource_type,
            resource_id: waiter.request.resource_id.clone(),
            owner_id: waiter.request.owner_id.clone(),
            acquired_at: Utc::now(),
            expires_at: Utc::now() + Duration::seconds(waiter.ttl_seconds as i64),
            metadata: waiter.request.metadata.clone(),
        };

        if self.try_insert(key, &lock, waiter.ttl_seconds).await? {
            self.index
                .lock()
                .await
                .insert(lock.id.clone(), key.to_string());
            let waited = Utc::now() - waiter.enqueued_at;
            info!(
                key,
                owner = %lock.owner_id,
                wait_id = %waiter.wait_id,
                waited_ms = waited.num_milliseconds(),
                "lock granted from queue"
            );
            self.bus.publish(BusEvent::LockGrantedFromQueue {
                key: key.to_string(),
                lock_id: lock.id.clone(),
                owner_id: lock.owner_id.clone(),
            });
            return Ok(());
        }

        // A foreign holder won the key between release and grant (possible
        // in distributed mode). Put the waiter back at the head; the next
        // release serves it.
        warn!(key, "queue grant lost the key to a concurrent acquire");
        let mut queues = self.queues.lock().await;
        queues.entry(key.to_string()).or_default().push_front(waiter);
        Ok(())
    }

    // ---- backend primitives --------------------------------------------

    async fn get(&self, key: &str) -> Result<Option<ResourceLock>> {
        match &self.backend {
            LockBackend::InProcess(map) => Ok(map.lock().await.get(key).cloned()),
            LockBackend::Distributed(conn) => {
                let mut conn = conn.clone();
                let raw: Option<String> = conn.get(key).await.map_err(backend_err)?;
                match raw {
                    Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                    None => Ok(None),
                }
            }
        }
    }

    /// Atomically claim the key iff free (or held only by an expired lock).
    async fn try_insert(&self, key: &str, lock: &ResourceLock, ttl_seconds: u64) -> Result<bool> {
        match &self.backend {
            LockBackend::InProcess(map) => {
                let mut map = map.lock().await;
                match map.get(key) {
                    Some(existing) if !existing.is_expired() => Ok(false),
                    _ => {
                        map.insert(key.to_string(), lock.clone());
                        Ok(true)
                    }
                }
            }
            LockBackend::Distributed(conn) => {
                let mut conn = conn.clone();
                let json = serde_json::to_string(lock)?;
                // PX rather than EX so a zero-second TTL still round-trips.
                let ttl_ms = (ttl_seconds * 1000).max(1);
                let reply: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg(json)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend_err)?;
                Ok(reply.is_some())
            }
        }
    }

    /// Remove the key iff still held by the given lock id.
    async fn remove_if_id(&self, key: &str, lock_id: &str) -> Result<Option<ResourceLock>> {
        match &self.backend {
            LockBackend::InProcess(map) => {
                let mut map = map.lock().await;
                if map.get(key).map(|l| l.id == lock_id).unwrap_or(false) {
                    Ok(map.remove(key))
                } else {
                    Ok(None)
                }
            }
            LockBackend::Distributed(_) => {
                let current = self.get(key).await?;
                match current {
                    Some(lock) if lock.id == lock_id => {
                        self.delete(key).await?;
                        Ok(Some(lock))
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    async fn overwrite(&self, key: &str, lock: &ResourceLock) -> Result<()> {
        match &self.backend {
            LockBackend::InProcess(map) => {
                map.lock().await.insert(key.to_string(), lock.clone());
                Ok(())
            }
            LockBackend::Distributed(conn) => {
                let mut conn = conn.clone();
                let json = serde_json::to_string(lock)?;
                let remaining_ms = (lock.expires_at - Utc::now()).num_milliseconds().max(1);
                let _: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg(json)
                    .arg("XX")
                    .arg("PX")
                    .arg(remaining_ms)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend_err)?;
                Ok(())
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match &self.backend {
            LockBackend::InProcess(map) => {
                map.lock().await.remove(key);
                Ok(())
            }
            LockBackend::Distributed(conn) => {
                let mut conn = conn.clone();
                let _: i64 = conn.del(key).await.map_err(backend_err)?;
                Ok(())
            }
        }
    }

    /// Drop an expired lock, emit its release, and serve the queue.
    async fn expire_lock(&self, key: &str, lock: &ResourceLock) -> Result<()> {
        if self.remove_if_id(key, &lock.id).await?.is_some() {
            debug!(key, owner = %lock.owner_id, "lock expired");
            self.index.lock().await.remove(&lock.id);
            self.bus.publish(BusEvent::LockReleased {
                key: key.to_string(),
                lock_id: lock.id.clone(),
            });
            self.grant_next(key).await?;
        }
        Ok(())
    }

    async fn find_key_by_id(&self, lock_id: &str) -> Result<Option<String>> {
        Ok(self
            .active_locks()
            .await?
            .into_iter()
            .find(|l| l.id == lock_id)
            .map(|l| l.key()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<LockManager>, EventBus) {
        let bus = EventBus::new(64);
        (Arc::new(LockManager::in_process(300, bus.clone())), bus)
    }

    #[tokio::test]
    async fn acquire_then_release_restores_the_table() {
        let (locks, _bus) = manager();
        let outcome = locks
            .acquire(LockRequest::new(ResourceType::File, "/p/x", "owner-a"))
            .await
            .unwrap();
        let lock = outcome.lock().unwrap().clone();

        assert!(locks.is_locked(ResourceType::File, "/p/x").await.unwrap());
        assert!(locks.release(&lock.id).await.unwrap());
        assert!(!locks.is_locked(ResourceType::File, "/p/x").await.unwrap());
        assert!(locks.active_locks().await.unwrap().is_empty());

        // Second release is a no-op returning false.
        assert!(!locks.release(&lock.id).await.unwrap());
    }

    #[tokio::test]
    async fn held_key_queues_further_requests() {
        let (locks, _bus) = manager();
        let first = locks
            .acquire(LockRequest::new(ResourceType::Service, "db", "owner-a"))
            .await
            .unwrap();
        assert!(first.lock().is_some());

        let second = locks
            .acquire(LockRequest::new(ResourceType::Service, "db", "owner-b"))
            .await
            .unwrap();
        match second {
            AcquireOutcome::Queued { position, .. } => assert_eq!(position, 0),
            AcquireOutcome::Acquired(_) => panic!("expected queued"),
        }

        let metrics = locks.metrics().await.unwrap();
        assert_eq!(metrics.active_locks, 1);
        assert_eq!(
            metrics
                .queue_depth
                .get(&lock_key(ResourceType::Service, "db"))
                .copied(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn queue_grants_follow_priority_then_fifo() {
        let (locks, bus) = manager();
        let mut rx = bus.subscribe();

        let a = locks
            .acquire(LockRequest::new(ResourceType::File, "/p/x", "a").with_ttl(60))
            .await
            .unwrap();
        locks
            .acquire(LockRequest::new(ResourceType::File, "/p/x", "b").with_priority(5))
            .await
            .unwrap();
        locks
            .acquire(LockRequest::new(ResourceType::File, "/p/x", "c").with_priority(10))
            .await
            .unwrap();

        locks.release(&a.lock().unwrap().id).await.unwrap();

        // c preempted b in the queue, so c is granted first.
        let mut granted = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::LockGrantedFromQueue { owner_id, lock_id, .. } = event {
                granted.push((owner_id, lock_id));
            }
        }
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].0, "c");

        locks.release(&granted[0].1).await.unwrap();
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::LockGrantedFromQueue { owner_id, .. } = event {
                granted.push((owner_id, String::new()));
            }
        }
        assert_eq!(granted.len(), 2);
        assert_eq!(granted[1].0, "b");
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let (locks, bus) = manager();
        let mut rx = bus.subscribe();

        let a = locks
            .acquire(LockRequest::new(ResourceType::Workspace, "main", "a"))
            .await
            .unwrap();
        locks
            .acquire(LockRequest::new(ResourceType::Workspace, "main", "first").with_priority(3))
            .await
            .unwrap();
        locks
            .acquire(LockRequest::new(ResourceType::Workspace, "main", "second").with_priority(3))
            .await
            .unwrap();

        locks.release(&a.lock().unwrap().id).await.unwrap();

        let granted = loop {
            match rx.try_recv() {
                Ok(BusEvent::LockGrantedFromQueue { owner_id, .. }) => break owner_id,
                Ok(_) => continue,
                Err(e) => panic!("no grant event: {e:?}"),
            }
        };
        assert_eq!(granted, "first");
    }

    #[tokio::test]
    async fn zero_ttl_expires_at_the_next_read() {
        let (locks, _bus) = manager();
        let outcome = locks
            .acquire(LockRequest::new(ResourceType::Port, "8080", "a").with_ttl(0))
            .await
            .unwrap();
        assert!(outcome.lock().is_some());

        // The expired lock is released by the read itself.
        assert!(!locks.is_locked(ResourceType::Port, "8080").await.unwrap());
        assert!(locks.active_locks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn acquire_evicts_an_expired_holder() {
        let (locks, _bus) = manager();
        locks
            .acquire(LockRequest::new(ResourceType::Database, "users", "a").with_ttl(0))
            .await
            .unwrap();

        // a's lock is already past its TTL; b takes the key directly.
        let outcome = locks
            .acquire(LockRequest::new(ResourceType::Database, "users", "b"))
            .await
            .unwrap();
        assert!(outcome.lock().is_some());

        let active = locks.active_locks().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].owner_id, "b");
    }

    #[tokio::test]
    async fn expired_holder_hands_over_to_the_queue_on_read() {
        let (locks, _bus) = manager();
        locks
            .acquire(LockRequest::new(ResourceType::Database, "orders", "a").with_ttl(1))
            .await
            .unwrap();
        locks
            .acquire(LockRequest::new(ResourceType::Database, "orders", "b"))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        // Read path expires a's lock and grants b's queued request.
        assert!(locks.is_locked(ResourceType::Database, "orders").await.unwrap());
        let active = locks.active_locks().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].owner_id, "b");
    }

    #[tokio::test]
    async fn extend_works_only_while_active() {
        let (locks, _bus) = manager();
        let outcome = locks
            .acquire(LockRequest::new(ResourceType::Terminal, "tty1", "a").with_ttl(60))
            .await
            .unwrap();
        let lock = outcome.lock().unwrap().clone();

        assert!(locks.extend(&lock.id, 120).await.unwrap());
        let active = locks.active_locks().await.unwrap();
        assert!(active[0].expires_at > lock.expires_at);

        locks.release(&lock.id).await.unwrap();
        assert!(!locks.extend(&lock.id, 120).await.unwrap());
    }

    #[tokio::test]
    async fn release_all_by_owner_counts_releases() {
        let (locks, _bus) = manager();
        locks
            .acquire(LockRequest::new(ResourceType::File, "/a", "worker"))
            .await
            .unwrap();
        locks
            .acquire(LockRequest::new(ResourceType::File, "/b", "worker"))
            .await
            .unwrap();
        locks
            .acquire(LockRequest::new(ResourceType::File, "/c", "other"))
            .await
            .unwrap();

        assert_eq!(locks.release_all_by_owner("worker").await.unwrap(), 2);
        let remaining = locks.active_locks().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].owner_id, "other");
    }

    #[tokio::test]
    async fn sweep_releases_expired_locks_and_serves_queues() {
        let (locks, bus) = manager();
        let mut rx = bus.subscribe();

        locks
            .acquire(LockRequest::new(ResourceType::Service, "cache", "a").with_ttl(1))
            .await
            .unwrap();
        locks
            .acquire(LockRequest::new(ResourceType::Service, "cache", "b"))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let swept = locks.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);

        let mut saw_grant = false;
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::LockGrantedFromQueue { owner_id, .. } = event {
                assert_eq!(owner_id, "b");
                saw_grant = true;
            }
        }
        assert!(saw_grant);
    }
}
