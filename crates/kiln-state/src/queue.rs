//! Message queue for async calls.
//!
//! Delivery is at-least-once: `pop` hands out a reservation, and a
//! consumer must `delete` the message once the call record reached a
//! terminal state. A reservation that is neither deleted nor nacked is
//! re-exposed after it lapses, which covers consumers that die
//! mid-execution. Pushes deduplicate by call id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use kiln_core::Call;

use crate::error::StoreResult;

/// How long a popped message stays reserved before redelivery.
pub const DEFAULT_RESERVATION: Duration = Duration::from_secs(60);

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a call. Pushing an id that is already queued, reserved,
    /// or delayed is a no-op.
    async fn push(&self, call: Call) -> StoreResult<()>;

    /// Pop one message, reserving it for the caller. `None` when empty.
    async fn pop(&self) -> StoreResult<Option<Call>>;

    /// Acknowledge completion; removes the message for good.
    async fn delete(&self, call_id: &str) -> StoreResult<bool>;

    /// Return a reserved message to the queue, delayed by `delay`.
    async fn nack(&self, call_id: &str, delay: Duration) -> StoreResult<()>;

    /// Messages currently awaiting delivery (ready + delayed).
    async fn depth(&self) -> usize;
}

struct Inner {
    ready: VecDeque<Call>,
    reserved: HashMap<String, (Call, Instant)>,
    delayed: Vec<(Call, Instant)>,
    /// Every id currently held anywhere in the queue.
    ids: HashSet<String>,
}

/// In-memory queue with reservation-based redelivery.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    reservation: Duration,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_reservation(DEFAULT_RESERVATION)
    }

    pub fn with_reservation(reservation: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                reserved: HashMap::new(),
                delayed: Vec::new(),
                ids: HashSet::new(),
            }),
            reservation,
        }
    }

    /// Move lapsed reservations and matured delays back to ready.
    fn sweep(inner: &mut Inner, now: Instant) {
        let lapsed: Vec<String> = inner
            .reserved
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in lapsed {
            if let Some((call, _)) = inner.reserved.remove(&id) {
                debug!(call_id = %id, "reservation lapsed, requeueing");
                inner.ready.push_back(call);
            }
        }

        let mut still_delayed = Vec::new();
        for (call, due) in inner.delayed.drain(..) {
            if due <= now {
                inner.ready.push_back(call);
            } else {
                still_delayed.push((call, due));
            }
        }
        inner.delayed = still_delayed;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn push(&self, call: Call) -> StoreResult<()> {
        let mut inner = self.lock();
        if !inner.ids.insert(call.id.clone()) {
            debug!(call_id = %call.id, "duplicate enqueue ignored");
            return Ok(());
        }
        inner.ready.push_back(call);
        Ok(())
    }

    async fn pop(&self) -> StoreResult<Option<Call>> {
        let now = Instant::now();
        let mut inner = self.lock();
        Self::sweep(&mut inner, now);
        let Some(call) = inner.ready.pop_front() else {
            return Ok(None);
        };
        inner
            .reserved
            .insert(call.id.clone(), (call.clone(), now + self.reservation));
        Ok(Some(call))
    }

    async fn delete(&self, call_id: &str) -> StoreResult<bool> {
        let mut inner = self.lock();
        if !inner.ids.remove(call_id) {
            return Ok(false);
        }
        inner.reserved.remove(call_id);
        inner.ready.retain(|c| c.id != call_id);
        inner.delayed.retain(|(c, _)| c.id != call_id);
        Ok(true)
    }

    async fn nack(&self, call_id: &str, delay: Duration) -> StoreResult<()> {
        let mut inner = self.lock();
        if let Some((call, _)) = inner.reserved.remove(call_id) {
            inner.delayed.push((call, Instant::now() + delay));
        }
        Ok(())
    }

    async fn depth(&self) -> usize {
        let mut inner = self.lock();
        Self::sweep(&mut inner, Instant::now());
        inner.ready.len() + inner.delayed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::models::CallStatus;

    fn test_call(id: &str) -> Call {
        Call {
            id: id.to_string(),
            app_id: "a-1".to_string(),
            app_name: "myapp".to_string(),
            path: Some("/hello".to_string()),
            fn_id: None,
            status: CallStatus::Queued,
            created_at: 1000,
            started_at: None,
            completed_at: None,
            error: None,
            stats: None,
            payload: None,
        }
    }

    #[tokio::test]
    async fn push_pop_delete_roundtrip() {
        let q = MemoryQueue::new();
        q.push(test_call("c-1")).await.unwrap();
        assert_eq!(q.depth().await, 1);

        let popped = q.pop().await.unwrap().unwrap();
        assert_eq!(popped.id, "c-1");
        assert_eq!(q.depth().await, 0);

        assert!(q.delete("c-1").await.unwrap());
        assert!(!q.delete("c-1").await.unwrap());
        assert!(q.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_push_is_ignored() {
        let q = MemoryQueue::new();
        q.push(test_call("c-1")).await.unwrap();
        q.push(test_call("c-1")).await.unwrap();
        assert_eq!(q.depth().await, 1);

        q.pop().await.unwrap().unwrap();
        assert!(q.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_is_fifo() {
        let q = MemoryQueue::new();
        for i in 0..3 {
            q.push(test_call(&format!("c-{i}"))).await.unwrap();
        }
        assert_eq!(q.pop().await.unwrap().unwrap().id, "c-0");
        assert_eq!(q.pop().await.unwrap().unwrap().id, "c-1");
        assert_eq!(q.pop().await.unwrap().unwrap().id, "c-2");
    }

    #[tokio::test]
    async fn lapsed_reservation_redelivers() {
        let q = MemoryQueue::with_reservation(Duration::from_millis(10));
        q.push(test_call("c-1")).await.unwrap();
        q.pop().await.unwrap().unwrap();

        // Consumer dies without deleting; after the reservation lapses
        // the message comes back.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let again = q.pop().await.unwrap().unwrap();
        assert_eq!(again.id, "c-1");
    }

    #[tokio::test]
    async fn nack_delays_redelivery() {
        let q = MemoryQueue::new();
        q.push(test_call("c-1")).await.unwrap();
        q.pop().await.unwrap().unwrap();
        q.nack("c-1", Duration::from_millis(30)).await.unwrap();

        assert!(q.pop().await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(q.pop().await.unwrap().unwrap().id, "c-1");
    }

    #[tokio::test]
    async fn delete_while_reserved_prevents_redelivery() {
        let q = MemoryQueue::with_reservation(Duration::from_millis(10));
        q.push(test_call("c-1")).await.unwrap();
        q.pop().await.unwrap().unwrap();
        assert!(q.delete("c-1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(q.pop().await.unwrap().is_none());
    }
}
