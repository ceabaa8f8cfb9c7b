//! The slot pool.
//!
//! One mutex guards the slot tables and the resource counters; slot I/O
//! is lock-free once a holder owns a busy slot. Waiters are FIFO per
//! slot key, and capacity wakeups rotate across keys so a hot key cannot
//! starve the others.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use kiln_core::{ApiError, ApiResult};
use kiln_metrics::Registry;

use crate::driver::{ContainerDriver, ContainerHandle, ContainerSpec};
use crate::key::SlotKey;

/// Per-slot resource requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotResources {
    pub memory_mb: u64,
    pub cpu_shares: u64,
}

/// Pool-wide limits and tunables.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Total memory the pool may allocate, MiB.
    pub capacity_memory_mb: u64,
    /// Total CPU shares; 0 disables CPU accounting.
    pub capacity_cpu_shares: u64,
    /// Invocations served before a hot container is retired.
    pub max_slot_uses: u32,
    /// How long `drain` waits for busy slots before killing them.
    pub drain_wait: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity_memory_mb: 8 * 1024,
            capacity_cpu_shares: 0,
            max_slot_uses: 1024,
            drain_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SlotState {
    Starting,
    Idle { deadline: Instant },
    Busy,
    Draining,
}

struct SlotEntry {
    key: SlotKey,
    state: SlotState,
    resources: SlotResources,
    container: Option<Arc<dyn ContainerHandle>>,
    uses: u32,
    idle_timeout: Duration,
    /// Route path or fn name, for metrics.
    label: String,
}

enum Wake {
    /// A matching slot was handed to this waiter; it is already busy on
    /// the waiter's behalf.
    Slot(u64),
    /// Capacity freed up; re-run the acquire loop.
    Capacity,
    /// The pool is shutting down.
    Draining,
}

struct Waiter {
    id: u64,
    resources: SlotResources,
    tx: oneshot::Sender<Wake>,
}

struct State {
    mem_free: u64,
    cpu_free: u64,
    slots: HashMap<u64, SlotEntry>,
    idle: HashMap<SlotKey, VecDeque<u64>>,
    waiters: HashMap<SlotKey, VecDeque<Waiter>>,
    /// Rotation order for fair capacity wakeups across keys.
    waiter_keys: VecDeque<SlotKey>,
    next_id: u64,
    draining: bool,
}

/// The warm container pool. One per execution node.
pub struct SlotPool {
    driver: Arc<dyn ContainerDriver>,
    config: PoolConfig,
    state: Mutex<State>,
    /// Pokes the evictor when the nearest idle deadline may have moved.
    evictor: Notify,
    /// Signalled whenever a slot leaves the busy set; `drain` waits on it.
    released: Notify,
    metrics: Arc<Registry>,
}

impl SlotPool {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        config: PoolConfig,
        metrics: Arc<Registry>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            driver,
            state: Mutex::new(State {
                mem_free: config.capacity_memory_mb,
                cpu_free: config.capacity_cpu_shares,
                slots: HashMap::new(),
                idle: HashMap::new(),
                waiters: HashMap::new(),
                waiter_keys: VecDeque::new(),
                next_id: 0,
                draining: false,
            }),
            config,
            evictor: Notify::new(),
            released: Notify::new(),
            metrics,
        });
        tokio::spawn(run_evictor(Arc::downgrade(&pool)));
        pool
    }

    /// Acquire an exclusive slot for `key`, launching a container when a
    /// warm one is unavailable and capacity allows.
    ///
    /// Fails with `SlotTimeout` at `deadline`, `NodeDraining` once
    /// `drain` started, and the launch error when a container start
    /// fails.
    pub async fn acquire(
        self: &Arc<Self>,
        spec: &ContainerSpec,
        key: SlotKey,
        idle_timeout: Duration,
        label: &str,
        deadline: Instant,
        mut cancel: watch::Receiver<bool>,
    ) -> ApiResult<SlotHandle> {
        let resources = SlotResources {
            memory_mb: spec.memory_mb,
            cpu_shares: spec.cpu_shares,
        };
        if resources.memory_mb > self.config.capacity_memory_mb
            || (self.config.capacity_cpu_shares > 0
                && resources.cpu_shares > self.config.capacity_cpu_shares)
        {
            // Could never fit, no point queueing.
            return Err(ApiError::ResourceUnavailable);
        }

        loop {
            enum Action {
                Got(u64, Arc<dyn ContainerHandle>),
                Launch(u64),
                Wait(oneshot::Receiver<Wake>, u64),
            }

            let action = {
                let mut st = self.state.lock().await;
                if st.draining {
                    return Err(ApiError::NodeDraining);
                }
                if let Some(slot_id) = pop_idle(&mut st, &key) {
                    let entry = st.slots.get_mut(&slot_id).expect("idle slot exists");
                    entry.state = SlotState::Busy;
                    entry.uses += 1;
                    self.metrics
                        .idle_slots
                        .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                    let container = entry.container.clone().expect("idle slot has container");
                    Action::Got(slot_id, container)
                } else if self.fits(&st, &resources) {
                    st.mem_free -= resources.memory_mb;
                    if self.config.capacity_cpu_shares > 0 {
                        st.cpu_free -= resources.cpu_shares;
                    }
                    let id = st.next_id;
                    st.next_id += 1;
                    st.slots.insert(
                        id,
                        SlotEntry {
                            key: key.clone(),
                            state: SlotState::Starting,
                            resources,
                            container: None,
                            uses: 0,
                            idle_timeout,
                            label: label.to_string(),
                        },
                    );
                    self.metrics.pool_memory_mb.fetch_add(
                        resources.memory_mb as i64,
                        std::sync::atomic::Ordering::Relaxed,
                    );
                    Action::Launch(id)
                } else {
                    self.reclaim_idle_capacity(&mut st, resources.memory_mb);
                    let id = st.next_id;
                    st.next_id += 1;
                    let (tx, rx) = oneshot::channel();
                    st.waiters
                        .entry(key.clone())
                        .or_default()
                        .push_back(Waiter { id, resources, tx });
                    if !st.waiter_keys.contains(&key) {
                        st.waiter_keys.push_back(key.clone());
                    }
                    self.metrics
                        .slot_waiters
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    Action::Wait(rx, id)
                }
            };

            match action {
                Action::Got(slot_id, container) => {
                    debug!(slot = slot_id, key = %key, "reusing warm slot");
                    return Ok(SlotHandle::new(self.clone(), slot_id, container));
                }
                Action::Launch(id) => {
                    return self.launch_slot(id, spec, &key, label, deadline).await;
                }
                Action::Wait(mut rx, waiter_id) => {
                    tokio::select! {
                        wake = &mut rx => match wake {
                            Ok(Wake::Slot(slot_id)) => {
                                let container = self.busy_container(slot_id).await?;
                                debug!(slot = slot_id, key = %key, "woken with warm slot");
                                return Ok(SlotHandle::new(self.clone(), slot_id, container));
                            }
                            Ok(Wake::Capacity) => continue,
                            Ok(Wake::Draining) => return Err(ApiError::NodeDraining),
                            // Sender dropped without a wake; re-enter the loop.
                            Err(_) => continue,
                        },
                        _ = tokio::time::sleep_until(deadline) => {
                            self.abandon_wait(&key, waiter_id, &mut rx).await;
                            return Err(ApiError::SlotTimeout);
                        }
                        _ = cancelled(&mut cancel) => {
                            self.abandon_wait(&key, waiter_id, &mut rx).await;
                            return Err(ApiError::Internal("invocation cancelled".into()));
                        }
                    }
                }
            }
        }
    }

    /// Launch the container for a freshly reserved `Starting` slot.
    async fn launch_slot(
        self: &Arc<Self>,
        id: u64,
        spec: &ContainerSpec,
        key: &SlotKey,
        label: &str,
        deadline: Instant,
    ) -> ApiResult<SlotHandle> {
        let launched = tokio::time::timeout_at(deadline, self.driver.launch(spec)).await;
        match launched {
            Ok(Ok(container)) => {
                let container: Arc<dyn ContainerHandle> = Arc::from(container);
                {
                    let mut st = self.state.lock().await;
                    let entry = st.slots.get_mut(&id).expect("starting slot exists");
                    entry.container = Some(container.clone());
                    entry.state = SlotState::Busy;
                    entry.uses = 1;
                }
                self.metrics.container_launches.inc(label);
                debug!(slot = id, key = %key, "slot launched");
                Ok(SlotHandle::new(self.clone(), id, container))
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "container launch failed");
                self.discard_slot(id).await;
                Err(e)
            }
            Err(_) => {
                self.discard_slot(id).await;
                Err(ApiError::SlotTimeout)
            }
        }
    }

    /// Remove a slot that never became usable and return its capacity.
    async fn discard_slot(&self, id: u64) {
        let mut st = self.state.lock().await;
        if let Some(entry) = st.slots.remove(&id) {
            self.metrics.pool_memory_mb.fetch_sub(
                entry.resources.memory_mb as i64,
                std::sync::atomic::Ordering::Relaxed,
            );
            self.free_capacity(&mut st, &entry.resources);
            self.wake_capacity_waiters(&mut st);
        }
        self.released.notify_waiters();
    }

    /// Under capacity pressure, retire idle slots of other keys so a
    /// waiter is not stuck until their idle timers fire. Freed capacity
    /// arrives asynchronously and wakes capacity waiters.
    fn reclaim_idle_capacity(self: &Arc<Self>, st: &mut State, needed_mb: u64) {
        let mut reclaimed = 0u64;
        let idle_ids: Vec<u64> = st.idle.values().flatten().copied().collect();
        for id in idle_ids {
            if st.mem_free + reclaimed >= needed_mb {
                break;
            }
            let Some(entry) = st.slots.get_mut(&id) else {
                continue;
            };
            entry.state = SlotState::Draining;
            reclaimed += entry.resources.memory_mb;
            let key = entry.key.clone();
            let container = entry.container.clone().expect("idle has container");
            if let Some(queue) = st.idle.get_mut(&key) {
                queue.retain(|sid| *sid != id);
                if queue.is_empty() {
                    st.idle.remove(&key);
                }
            }
            self.metrics
                .idle_slots
                .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            debug!(slot = id, "retiring idle slot to reclaim capacity");
            let pool = self.clone();
            tokio::spawn(async move {
                pool.finish_drain(id, container).await;
            });
        }
    }

    /// Fetch the container of a slot that was handed to a waiter.
    async fn busy_container(&self, slot_id: u64) -> ApiResult<Arc<dyn ContainerHandle>> {
        let st = self.state.lock().await;
        st.slots
            .get(&slot_id)
            .and_then(|e| e.container.clone())
            .ok_or_else(|| ApiError::Internal("handed slot vanished".into()))
    }

    /// Drop out of a waiter queue; if a slot wake raced in, pass the
    /// slot along so it is not stranded busy.
    async fn abandon_wait(
        self: &Arc<Self>,
        key: &SlotKey,
        waiter_id: u64,
        rx: &mut oneshot::Receiver<Wake>,
    ) {
        let removed = {
            let mut st = self.state.lock().await;
            remove_waiter(&mut st, key, waiter_id)
        };
        if removed {
            self.metrics
                .slot_waiters
                .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        }
        if let Ok(Wake::Slot(slot_id)) = rx.try_recv() {
            self.release_slot(slot_id, true).await;
        }
    }

    /// Return a busy slot. Healthy and under budget → warm reuse;
    /// otherwise the container is drained and capacity returns once it
    /// confirmably exited.
    async fn release_slot(self: &Arc<Self>, slot_id: u64, healthy_hint: bool) {
        let mut st = self.state.lock().await;

        // Copy what the decision needs, ending the entry borrow before
        // the branches touch the rest of the state.
        let (key, container, idle_timeout, at_eol) = {
            let Some(entry) = st.slots.get_mut(&slot_id) else {
                debug_assert!(false, "release of unknown slot {slot_id}");
                error!(slot = slot_id, "release of unknown slot ignored");
                return;
            };
            if entry.state != SlotState::Busy {
                debug_assert!(false, "release of non-busy slot {slot_id}");
                error!(slot = slot_id, state = ?entry.state, "release of non-busy slot ignored");
                return;
            }
            (
                entry.key.clone(),
                entry.container.clone().expect("busy slot has container"),
                entry.idle_timeout,
                entry.uses >= self.config.max_slot_uses,
            )
        };
        let healthy = healthy_hint && container.healthy();

        if healthy && !at_eol && !st.draining {
            // A parked waiter gets the slot directly; it never touches
            // the idle set, so the hand-off is FIFO by construction.
            while let Some(waiter) = pop_front_waiter(&mut st, &key) {
                self.metrics
                    .slot_waiters
                    .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                if waiter.tx.send(Wake::Slot(slot_id)).is_ok() {
                    let entry = st.slots.get_mut(&slot_id).expect("slot still exists");
                    entry.uses += 1;
                    drop(st);
                    self.released.notify_waiters();
                    return;
                }
                // Receiver gave up; try the next one in line.
            }
            let entry = st.slots.get_mut(&slot_id).expect("slot still exists");
            entry.state = SlotState::Idle {
                deadline: Instant::now() + idle_timeout,
            };
            st.idle.entry(key).or_default().push_back(slot_id);
            self.metrics
                .idle_slots
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            drop(st);
            self.evictor.notify_one();
        } else {
            if let Some(entry) = st.slots.get_mut(&slot_id) {
                entry.state = SlotState::Draining;
            }
            drop(st);
            let pool = self.clone();
            tokio::spawn(async move {
                pool.finish_drain(slot_id, container).await;
            });
        }
        self.released.notify_waiters();
    }

    /// Terminate a draining slot's container and free its capacity.
    async fn finish_drain(self: &Arc<Self>, slot_id: u64, container: Arc<dyn ContainerHandle>) {
        container.terminate().await;
        let mut st = self.state.lock().await;
        if let Some(entry) = st.slots.remove(&slot_id) {
            self.metrics.pool_memory_mb.fetch_sub(
                entry.resources.memory_mb as i64,
                std::sync::atomic::Ordering::Relaxed,
            );
            let resources = entry.resources;
            self.free_capacity(&mut st, &resources);
            self.wake_capacity_waiters(&mut st);
            debug!(slot = slot_id, key = %entry.key, "slot drained");
        }
        drop(st);
        self.released.notify_waiters();
    }

    fn fits(&self, st: &State, resources: &SlotResources) -> bool {
        st.mem_free >= resources.memory_mb
            && (self.config.capacity_cpu_shares == 0 || st.cpu_free >= resources.cpu_shares)
    }

    fn free_capacity(&self, st: &mut State, resources: &SlotResources) {
        st.mem_free += resources.memory_mb;
        if self.config.capacity_cpu_shares > 0 {
            st.cpu_free += resources.cpu_shares;
        }
        debug_assert!(
            st.mem_free <= self.config.capacity_memory_mb,
            "freed more memory than the pool owns"
        );
        if st.mem_free > self.config.capacity_memory_mb {
            error!("capacity accounting over-freed; clamping");
            st.mem_free = self.config.capacity_memory_mb;
        }
    }

    /// Wake waiters that now fit, rotating across keys for fairness and
    /// preserving FIFO order within a key.
    fn wake_capacity_waiters(&self, st: &mut State) {
        let mut budget_mem = st.mem_free;
        let mut budget_cpu = st.cpu_free;
        let rounds = st.waiter_keys.len();
        for _ in 0..rounds {
            let Some(key) = st.waiter_keys.pop_front() else {
                break;
            };
            let Some(queue) = st.waiters.get_mut(&key) else {
                continue; // stale rotation entry
            };
            while let Some(front) = queue.front() {
                let fits_budget = front.resources.memory_mb <= budget_mem
                    && (self.config.capacity_cpu_shares == 0
                        || front.resources.cpu_shares <= budget_cpu);
                if !fits_budget {
                    break;
                }
                let waiter = queue.pop_front().expect("front exists");
                self.metrics
                    .slot_waiters
                    .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                if waiter.tx.send(Wake::Capacity).is_ok() {
                    budget_mem -= waiter.resources.memory_mb;
                    if self.config.capacity_cpu_shares > 0 {
                        budget_cpu -= waiter.resources.cpu_shares;
                    }
                    break; // one wake per key per round keeps the scan fair
                }
                // Dead waiter; keep budget, look at the next in line.
            }
            if queue.is_empty() {
                st.waiters.remove(&key);
            } else {
                st.waiter_keys.push_back(key);
            }
            if budget_mem == 0 {
                break;
            }
        }
    }

    /// Stop accepting acquires, evict idle slots, and wait for busy
    /// slots up to the configured drain timeout.
    pub async fn drain(self: &Arc<Self>) {
        info!("slot pool draining");
        let (idle_slots, waiters) = {
            let mut guard = self.state.lock().await;
            // Reborrow as a plain &mut State so disjoint fields can be
            // borrowed side by side.
            let st = &mut *guard;
            st.draining = true;

            let mut waiters = Vec::new();
            for (_, mut queue) in st.waiters.drain() {
                while let Some(w) = queue.pop_front() {
                    waiters.push(w);
                }
            }
            st.waiter_keys.clear();

            let mut idle_slots = Vec::new();
            for (_, mut queue) in st.idle.drain() {
                while let Some(id) = queue.pop_front() {
                    if let Some(entry) = st.slots.get_mut(&id) {
                        entry.state = SlotState::Draining;
                        idle_slots
                            .push((id, entry.container.clone().expect("idle has container")));
                    }
                }
            }
            (idle_slots, waiters)
        };

        let waiter_count = waiters.len() as i64;
        for waiter in waiters {
            let _ = waiter.tx.send(Wake::Draining);
        }
        self.metrics
            .slot_waiters
            .fetch_sub(waiter_count, std::sync::atomic::Ordering::Relaxed);
        self.metrics
            .idle_slots
            .store(0, std::sync::atomic::Ordering::Relaxed);

        for (id, container) in idle_slots {
            self.finish_drain(id, container).await;
        }

        // Busy slots finish their in-flight call and drain on release.
        let deadline = Instant::now() + self.config.drain_wait;
        loop {
            // Arm the release signal before inspecting state so a drain
            // finishing in between is not missed.
            let mut notified = std::pin::pin!(self.released.notified());
            notified.as_mut().enable();

            let (busy, remaining) = {
                let st = self.state.lock().await;
                let busy: Vec<(u64, Arc<dyn ContainerHandle>)> = st
                    .slots
                    .iter()
                    .filter(|(_, e)| {
                        matches!(e.state, SlotState::Busy | SlotState::Starting)
                    })
                    .filter_map(|(id, e)| e.container.clone().map(|c| (*id, c)))
                    .collect();
                (busy, st.slots.len())
            };
            if remaining == 0 {
                break;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(slots = remaining, "drain timeout, killing remaining containers");
                    for (id, container) in busy {
                        self.finish_drain(id, container).await;
                    }
                    break;
                }
            }
        }
        self.evictor.notify_one();
        info!("slot pool drained");
    }

    /// Whether an invocation of this shape could be admitted right now:
    /// either a warm slot exists for the key or free capacity covers a
    /// launch. Advisory — admission is still decided by `acquire`.
    pub async fn can_admit(&self, key: &SlotKey, memory_mb: u64) -> bool {
        let st = self.state.lock().await;
        if st.draining {
            return false;
        }
        if st.idle.get(key).is_some_and(|q| !q.is_empty()) {
            return true;
        }
        st.mem_free >= memory_mb
    }

    // ── Introspection (tests and metrics) ─────────────────────────

    pub async fn idle_count(&self) -> usize {
        let st = self.state.lock().await;
        st.idle.values().map(|q| q.len()).sum()
    }

    pub async fn waiter_count(&self) -> usize {
        let st = self.state.lock().await;
        st.waiters.values().map(|q| q.len()).sum()
    }

    pub async fn free_memory_mb(&self) -> u64 {
        let st = self.state.lock().await;
        st.mem_free
    }

    pub async fn live_slots(&self) -> usize {
        let st = self.state.lock().await;
        st.slots.len()
    }
}

/// Resolves only on a real cancellation. A dropped sender means the
/// invocation can no longer be cancelled, not that it was.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn pop_idle(st: &mut State, key: &SlotKey) -> Option<u64> {
    let queue = st.idle.get_mut(key)?;
    let id = queue.pop_front();
    if queue.is_empty() {
        st.idle.remove(key);
    }
    id
}

fn pop_front_waiter(st: &mut State, key: &SlotKey) -> Option<Waiter> {
    let queue = st.waiters.get_mut(key)?;
    let waiter = queue.pop_front();
    if queue.is_empty() {
        st.waiters.remove(key);
    }
    waiter
}

fn remove_waiter(st: &mut State, key: &SlotKey, waiter_id: u64) -> bool {
    let Some(queue) = st.waiters.get_mut(key) else {
        return false;
    };
    let before = queue.len();
    queue.retain(|w| w.id != waiter_id);
    let removed = queue.len() < before;
    if queue.is_empty() {
        st.waiters.remove(key);
    }
    removed
}

/// Background eviction of idle slots past their deadline.
async fn run_evictor(pool: Weak<SlotPool>) {
    loop {
        let Some(pool) = pool.upgrade() else {
            return;
        };

        let next_deadline = {
            let st = pool.state.lock().await;
            if st.draining && st.slots.is_empty() {
                return;
            }
            st.slots
                .values()
                .filter_map(|e| match e.state {
                    SlotState::Idle { deadline } => Some(deadline),
                    _ => None,
                })
                .min()
        };

        let notified = pool.evictor.notified();
        let expired: Vec<(u64, Arc<dyn ContainerHandle>, String)> = {
            tokio::select! {
                _ = notified => Vec::new(),
                _ = async {
                    match next_deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => {
                    let now = Instant::now();
                    let mut st = pool.state.lock().await;
                    let ids: Vec<u64> = st
                        .slots
                        .iter()
                        .filter(|(_, e)| matches!(e.state, SlotState::Idle { deadline } if deadline <= now))
                        .map(|(id, _)| *id)
                        .collect();
                    let mut expired = Vec::new();
                    for id in ids {
                        let entry = st.slots.get_mut(&id).expect("listed slot exists");
                        entry.state = SlotState::Draining;
                        let key = entry.key.clone();
                        let label = entry.label.clone();
                        let container = entry.container.clone().expect("idle has container");
                        if let Some(queue) = st.idle.get_mut(&key) {
                            queue.retain(|sid| *sid != id);
                            if queue.is_empty() {
                                st.idle.remove(&key);
                            }
                        }
                        expired.push((id, container, label));
                    }
                    expired
                }
            }
        };

        for (id, container, label) in expired {
            debug!(slot = id, "idle slot expired");
            pool.metrics.container_evictions.inc(&label);
            pool.metrics
                .idle_slots
                .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            pool.finish_drain(id, container).await;
        }
    }
}

/// Exclusive ownership of one busy slot.
///
/// Releasing consumes the handle, so a double release cannot compile.
/// Dropping without releasing drains the slot as unhealthy, which keeps
/// panic paths from leaking capacity.
pub struct SlotHandle {
    pool: Arc<SlotPool>,
    slot_id: u64,
    container: Arc<dyn ContainerHandle>,
    released: bool,
}

impl std::fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotHandle")
            .field("slot_id", &self.slot_id)
            .field("released", &self.released)
            .finish()
    }
}

impl SlotHandle {
    fn new(pool: Arc<SlotPool>, slot_id: u64, container: Arc<dyn ContainerHandle>) -> Self {
        Self {
            pool,
            slot_id,
            container,
            released: false,
        }
    }

    pub fn container(&self) -> Arc<dyn ContainerHandle> {
        self.container.clone()
    }

    /// Return the slot to the pool. `healthy` marks whether the holder
    /// still trusts the container.
    pub async fn release(mut self, healthy: bool) {
        self.released = true;
        let pool = self.pool.clone();
        let slot_id = self.slot_id;
        pool.release_slot(slot_id, healthy).await;
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        if !self.released {
            let pool = self.pool.clone();
            let slot_id = self.slot_id;
            tokio::spawn(async move {
                pool.release_slot(slot_id, false).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use kiln_core::models::Format;
    use std::collections::BTreeMap;

    fn spec(memory_mb: u64) -> ContainerSpec {
        ContainerSpec {
            image: "hello:v1".to_string(),
            memory_mb,
            cpu_shares: 0,
            format: Format::Json,
            env: BTreeMap::new(),
        }
    }

    fn key_for(spec: &ContainerSpec) -> SlotKey {
        SlotKey::derive(
            &spec.image,
            spec.memory_mb,
            spec.cpu_shares,
            30,
            30,
            spec.format,
            &spec.env,
        )
    }

    fn pool_with(
        driver: Arc<MockDriver>,
        capacity_mb: u64,
    ) -> (Arc<SlotPool>, Arc<Registry>) {
        let metrics = Registry::new();
        let pool = SlotPool::new(
            driver,
            PoolConfig {
                capacity_memory_mb: capacity_mb,
                capacity_cpu_shares: 0,
                max_slot_uses: 1024,
                drain_wait: Duration::from_millis(500),
            },
            metrics.clone(),
        );
        (pool, metrics)
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[tokio::test]
    async fn warm_reuse_launches_once() {
        let driver = Arc::new(MockDriver::new());
        let (pool, metrics) = pool_with(driver.clone(), 1024);
        let s = spec(128);
        let key = key_for(&s);

        let h1 = pool
            .acquire(&s, key.clone(), Duration::from_secs(30), "/hello", far_deadline(), no_cancel())
            .await
            .unwrap();
        h1.release(true).await;

        let h2 = pool
            .acquire(&s, key.clone(), Duration::from_secs(30), "/hello", far_deadline(), no_cancel())
            .await
            .unwrap();
        h2.release(true).await;

        assert_eq!(driver.launch_count(), 1);
        assert_eq!(metrics.container_launches.get("/hello"), 1);
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_share_slots() {
        let driver = Arc::new(MockDriver::new());
        let (pool, _) = pool_with(driver.clone(), 1024);
        let s1 = spec(128);
        let mut s2 = spec(128);
        s2.image = "other:v1".to_string();

        let h1 = pool
            .acquire(&s1, key_for(&s1), Duration::from_secs(30), "/a", far_deadline(), no_cancel())
            .await
            .unwrap();
        h1.release(true).await;

        let h2 = pool
            .acquire(&s2, key_for(&s2), Duration::from_secs(30), "/b", far_deadline(), no_cancel())
            .await
            .unwrap();
        h2.release(true).await;

        assert_eq!(driver.launch_count(), 2);
    }

    #[tokio::test]
    async fn capacity_is_never_exceeded() {
        let driver = Arc::new(MockDriver::new());
        let (pool, _) = pool_with(driver.clone(), 256);
        let s = spec(200);
        let key = key_for(&s);

        let h1 = pool
            .acquire(&s, key.clone(), Duration::from_secs(30), "/big", far_deadline(), no_cancel())
            .await
            .unwrap();
        assert_eq!(pool.free_memory_mb().await, 56);

        // Second acquire must wait; free memory never goes negative and
        // no second container launches while the first is busy.
        let pool2 = pool.clone();
        let s2 = s.clone();
        let key2 = key.clone();
        let second = tokio::spawn(async move {
            pool2
                .acquire(&s2, key2, Duration::from_secs(30), "/big", far_deadline(), no_cancel())
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.launch_count(), 1);
        assert_eq!(pool.waiter_count().await, 1);

        h1.release(true).await;
        let h2 = second.await.unwrap().unwrap();
        assert_eq!(pool.free_memory_mb().await, 56);
        h2.release(true).await;

        // The warm slot was handed over; still only one launch.
        assert_eq!(driver.launch_count(), 1);
    }

    #[tokio::test]
    async fn oversized_request_is_rejected_immediately() {
        let driver = Arc::new(MockDriver::new());
        let (pool, _) = pool_with(driver, 256);
        let s = spec(512);
        let err = pool
            .acquire(&s, key_for(&s), Duration::from_secs(30), "/x", far_deadline(), no_cancel())
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::ResourceUnavailable);
    }

    #[tokio::test]
    async fn waiter_times_out_with_slot_timeout() {
        let driver = Arc::new(MockDriver::new());
        let (pool, _) = pool_with(driver, 256);
        let s = spec(200);
        let key = key_for(&s);

        let _h1 = pool
            .acquire(&s, key.clone(), Duration::from_secs(30), "/x", far_deadline(), no_cancel())
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        let err = pool
            .acquire(&s, key, Duration::from_secs(30), "/x", deadline, no_cancel())
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::SlotTimeout);
        assert_eq!(pool.waiter_count().await, 0);
    }

    #[tokio::test]
    async fn waiters_are_fifo_per_key() {
        let driver = Arc::new(MockDriver::new());
        let (pool, _) = pool_with(driver, 256);
        let s = spec(200);
        let key = key_for(&s);

        let h1 = pool
            .acquire(&s, key.clone(), Duration::from_secs(30), "/x", far_deadline(), no_cancel())
            .await
            .unwrap();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            let s = s.clone();
            let key = key.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let h = pool
                    .acquire(&s, key, Duration::from_secs(30), "/x", far_deadline(), no_cancel())
                    .await
                    .unwrap();
                order.lock().unwrap().push(i);
                h.release(true).await;
            }));
            // Deterministic queue order.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        h1.release(true).await;
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn capacity_wakeups_rotate_across_keys() {
        let driver = Arc::new(MockDriver::new());
        let (pool, _) = pool_with(driver.clone(), 200);
        let s_a = spec(100);
        let mut s_b = spec(100);
        s_b.image = "other:v1".to_string();
        let big = spec(200);

        // Fill the node with one big slot.
        let h_big = pool
            .acquire(&big, key_for(&big), Duration::from_secs(30), "/big", far_deadline(), no_cancel())
            .await
            .unwrap();

        // One waiter on each of two different keys.
        let mut waits = Vec::new();
        for s in [s_a.clone(), s_b.clone()] {
            let pool = pool.clone();
            let key = key_for(&s);
            waits.push(tokio::spawn(async move {
                let h = pool
                    .acquire(&s, key, Duration::from_secs(30), "/w", far_deadline(), no_cancel())
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
                h.release(true).await;
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Freeing 200 MiB fits both 100 MiB waiters; the rotation wakes
        // one per key rather than two from the first key.
        h_big.release(false).await;
        for t in waits {
            t.await.unwrap();
        }
        assert_eq!(driver.launch_count(), 3);
    }

    #[tokio::test]
    async fn launch_failure_frees_capacity() {
        let driver = Arc::new(MockDriver::new());
        let (pool, _) = pool_with(driver.clone(), 256);
        driver.set_fail_launches(true);

        let s = spec(200);
        let err = pool
            .acquire(&s, key_for(&s), Duration::from_secs(30), "/x", far_deadline(), no_cancel())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ContainerError(_)));
        assert_eq!(pool.free_memory_mb().await, 256);
        assert_eq!(pool.live_slots().await, 0);

        // The node recovers once launches work again.
        driver.set_fail_launches(false);
        let h = pool
            .acquire(&s, key_for(&s), Duration::from_secs(30), "/x", far_deadline(), no_cancel())
            .await
            .unwrap();
        h.release(true).await;
    }

    #[tokio::test]
    async fn unhealthy_release_drains_and_relaunches() {
        let driver = Arc::new(MockDriver::new().with_single_use_containers());
        let (pool, _) = pool_with(driver.clone(), 1024);
        let s = spec(128);
        let key = key_for(&s);

        let h1 = pool
            .acquire(&s, key.clone(), Duration::from_secs(30), "/x", far_deadline(), no_cancel())
            .await
            .unwrap();
        h1.container()
            .invoke(bytes::Bytes::from_static(b"x"), far_deadline())
            .await
            .unwrap();
        h1.release(true).await;

        // Give the drain task a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.idle_count().await, 0);
        assert_eq!(driver.termination_count(), 1);
        assert_eq!(pool.free_memory_mb().await, 1024);

        let h2 = pool
            .acquire(&s, key, Duration::from_secs(30), "/x", far_deadline(), no_cancel())
            .await
            .unwrap();
        h2.release(true).await;
        assert_eq!(driver.launch_count(), 2);
    }

    #[tokio::test]
    async fn idle_slots_are_evicted_after_their_timeout() {
        let driver = Arc::new(MockDriver::new());
        let (pool, metrics) = pool_with(driver.clone(), 1024);
        let s = spec(128);
        let key = key_for(&s);

        let h = pool
            .acquire(&s, key, Duration::from_millis(50), "/hello", far_deadline(), no_cancel())
            .await
            .unwrap();
        h.release(true).await;
        assert_eq!(pool.idle_count().await, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.idle_count().await, 0);
        assert_eq!(pool.live_slots().await, 0);
        assert_eq!(driver.termination_count(), 1);
        assert_eq!(metrics.container_evictions.get("/hello"), 1);
        assert_eq!(pool.free_memory_mb().await, 1024);
    }

    #[tokio::test]
    async fn drain_rejects_new_acquires_and_wakes_waiters() {
        let driver = Arc::new(MockDriver::new());
        let (pool, _) = pool_with(driver, 256);
        let s = spec(200);
        let key = key_for(&s);

        let h = pool
            .acquire(&s, key.clone(), Duration::from_secs(30), "/x", far_deadline(), no_cancel())
            .await
            .unwrap();

        let pool2 = pool.clone();
        let s2 = s.clone();
        let key2 = key.clone();
        let waiter = tokio::spawn(async move {
            pool2
                .acquire(&s2, key2, Duration::from_secs(30), "/x", far_deadline(), no_cancel())
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let drainer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.drain().await })
        };
        // The parked waiter learns the node is going away.
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, ApiError::NodeDraining);

        // The busy slot finishes and is then drained, not idled.
        h.release(true).await;
        drainer.await.unwrap();
        assert_eq!(pool.live_slots().await, 0);
        assert_eq!(pool.free_memory_mb().await, 256);

        let err = pool
            .acquire(&s, key, Duration::from_secs(30), "/x", far_deadline(), no_cancel())
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::NodeDraining);
    }

    #[tokio::test]
    async fn acquire_sequence_respects_capacity_under_load() {
        // A randomized soak: many concurrent holders of mixed sizes;
        // at no point may allocated memory exceed the capacity.
        let driver = Arc::new(MockDriver::new());
        let (pool, _) = pool_with(driver, 512);

        let mut tasks = Vec::new();
        for i in 0..24u64 {
            let pool = pool.clone();
            let s = spec(if i % 3 == 0 { 256 } else { 128 });
            tasks.push(tokio::spawn(async move {
                let key = key_for(&s);
                let h = pool
                    .acquire(&s, key, Duration::from_millis(100), "/soak", far_deadline(), no_cancel())
                    .await
                    .unwrap();
                let free = pool.free_memory_mb().await;
                assert!(free <= 512, "free memory {free} exceeds capacity");
                tokio::time::sleep(Duration::from_millis(5)).await;
                h.release(true).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(pool.free_memory_mb().await, 512);
    }
}
