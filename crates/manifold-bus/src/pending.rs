//! Pending-request registry.
//!
//! Maps correlation ids to waiters until a correlated reply arrives, the
//! deadline passes, or the caller cancels. Each entry goes through exactly
//! one terminal transition; removal from the map decides the winner, so a
//! sweep racing a cancellation is safe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{BusResult, Error, ErrorKind};
use crate::message::{BoxedMessage, MessageType};
use crate::serializer::MessageDecoder;

/// Monotonic clock abstraction; injected so timeout behaviour is testable.
pub trait Clock: Send + Sync + 'static {
    /// Monotonic time since the clock's origin.
    fn now(&self) -> Duration;
}

/// Wall clock anchored at construction.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock anchored at now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Creates a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock.
    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute offset.
    pub fn set(&self, to: Duration) {
        self.now_ms.store(to.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(Ordering::SeqCst))
    }
}

/// Completion side of a pending request.
pub(crate) type ReplySink = oneshot::Sender<BusResult<BoxedMessage>>;

/// Waiter side of a pending request.
pub(crate) type ReplySlot = oneshot::Receiver<BusResult<BoxedMessage>>;

/// One registered request awaiting its correlated reply.
pub(crate) struct PendingEntry {
    pub message_type: MessageType,
    pub created_at: Duration,
    pub expires_at: Duration,
    pub decoder: MessageDecoder,
    pub sink: ReplySink,
}

/// Registry of requests awaiting correlated replies.
pub struct PendingRequests {
    entries: Mutex<HashMap<String, PendingEntry>>,
    clock: Arc<dyn Clock>,
    capacity: usize,
}

impl PendingRequests {
    /// Creates a registry bounded to `capacity` outstanding requests.
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            capacity,
        }
    }

    /// The injected clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Registers a new pending request and returns its waiter.
    ///
    /// Re-registration of a live correlation id is rejected, as is exceeding
    /// the capacity bound.
    pub(crate) fn register(
        &self,
        correlation_id: &str,
        timeout: Duration,
        message_type: MessageType,
        decoder: MessageDecoder,
    ) -> BusResult<ReplySlot> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            return Err(Error::producer(format!(
                "pending request capacity {} exceeded",
                self.capacity
            )));
        }
        if entries.contains_key(correlation_id) {
            return Err(Error::producer(format!(
                "correlation id {correlation_id} is already registered"
            )));
        }

        let (sink, slot) = oneshot::channel();
        let now = self.clock.now();
        entries.insert(
            correlation_id.to_string(),
            PendingEntry {
                message_type,
                created_at: now,
                expires_at: now + timeout,
                decoder,
                sink,
            },
        );
        Ok(slot)
    }

    /// Removes an entry without completing it; the caller owns the terminal
    /// transition. Returns `None` if another path already won.
    pub(crate) fn take(&self, correlation_id: &str) -> Option<PendingEntry> {
        self.entries.lock().remove(correlation_id)
    }

    /// Completes a pending request with a reply value.
    pub(crate) fn resolve(&self, correlation_id: &str, value: BoxedMessage) -> bool {
        match self.take(correlation_id) {
            Some(entry) => {
                let _ = entry.sink.send(Ok(value));
                true
            }
            None => false,
        }
    }

    /// Completes a pending request with a failure.
    pub(crate) fn fail(&self, correlation_id: &str, error: Error) -> bool {
        match self.take(correlation_id) {
            Some(entry) => {
                let _ = entry.sink.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fails every entry whose deadline has passed. Idempotent; completion
    /// happens outside the registry lock so waiters are never blocked on.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<(String, PendingEntry)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (id, entry) in expired {
            debug!(correlation_id = %id, message_type = %entry.message_type, "pending request timed out");
            let _ = entry.sink.send(Err(Error::with_context(
                ErrorKind::Timeout,
                format!("request {} timed out", entry.message_type),
            )));
        }
        count
    }

    /// Fails every outstanding entry; used on bus disposal.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(String, PendingEntry)> = {
            let mut entries = self.entries.lock();
            entries.drain().collect()
        };

        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.sink.send(Err(Error::disposed(format!(
                "bus disposed while request {} was pending",
                entry.message_type
            ))));
        }
        count
    }

    /// Number of outstanding requests.
    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("count", &self.count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reply {
        id: String,
    }
    crate::bus_message!(Reply);

    fn registry_with_clock() -> (Arc<ManualClock>, PendingRequests) {
        let clock = Arc::new(ManualClock::new());
        let registry = PendingRequests::new(clock.clone(), 64);
        (clock, registry)
    }

    fn register(registry: &PendingRequests, id: &str, timeout_secs: u64) -> ReplySlot {
        registry
            .register(
                id,
                Duration::from_secs(timeout_secs),
                MessageType::of::<Reply>(),
                MessageDecoder::of::<Reply>(),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn resolve_completes_the_waiter_and_evicts() {
        let (_clock, registry) = registry_with_clock();
        let slot = register(&registry, "r1", 5);
        assert_eq!(registry.count(), 1);

        assert!(registry.resolve("r1", Box::new(Reply { id: "x".into() })));
        assert_eq!(registry.count(), 0);

        let value = slot.await.unwrap().unwrap();
        assert_eq!(value.downcast::<Reply>().unwrap().id, "x");
    }

    #[tokio::test]
    async fn duplicate_correlation_id_is_rejected() {
        let (_clock, registry) = registry_with_clock();
        let _slot = register(&registry, "r1", 5);
        let err = registry
            .register(
                "r1",
                Duration::from_secs(5),
                MessageType::of::<Reply>(),
                MessageDecoder::of::<Reply>(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Producer);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn capacity_bound_is_enforced() {
        let clock = Arc::new(ManualClock::new());
        let registry = PendingRequests::new(clock, 1);
        let _slot = register(&registry, "r1", 5);
        let err = registry
            .register(
                "r2",
                Duration::from_secs(5),
                MessageType::of::<Reply>(),
                MessageDecoder::of::<Reply>(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Producer);
    }

    #[tokio::test]
    async fn sweep_fails_only_expired_entries() {
        // Mirrors the staggered-timeout scenario: one request with a short
        // deadline, one with a long one.
        let (clock, registry) = registry_with_clock();
        let short = register(&registry, "short", 5);
        let long = register(&registry, "long", 10);

        clock.advance(Duration::from_secs(6));
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.count(), 1);
        assert!(short.await.unwrap().unwrap_err().is_timeout());

        clock.advance(Duration::from_secs(5));
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.count(), 0);
        assert!(long.await.unwrap().unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let (clock, registry) = registry_with_clock();
        let _slot = register(&registry, "r1", 1);
        clock.advance(Duration::from_secs(2));
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.sweep(), 0);
    }

    #[tokio::test]
    async fn partial_late_reply_leaves_remaining_pending() {
        // r1 answered, r2 times out, r3 stays pending.
        let (clock, registry) = registry_with_clock();
        let r1 = register(&registry, "r1", 10);
        let r2 = register(&registry, "r2", 1);
        let _r3 = register(&registry, "r3", 10);

        assert!(registry.resolve("r1", Box::new(Reply { id: "one".into() })));
        clock.advance(Duration::from_secs(2));
        registry.sweep();

        assert_eq!(registry.count(), 1);
        assert_eq!(
            r1.await.unwrap().unwrap().downcast::<Reply>().unwrap().id,
            "one"
        );
        assert!(r2.await.unwrap().unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn first_terminal_transition_wins() {
        let (clock, registry) = registry_with_clock();
        let slot = register(&registry, "r1", 1);

        clock.advance(Duration::from_secs(2));
        registry.sweep();
        // The sweep already won; a late resolve and a late fail are no-ops.
        assert!(!registry.resolve("r1", Box::new(Reply { id: "late".into() })));
        assert!(!registry.fail("r1", Error::cancelled("late cancel")));

        assert!(slot.await.unwrap().unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn cancel_all_drains_with_disposed() {
        let (_clock, registry) = registry_with_clock();
        let a = register(&registry, "a", 5);
        let b = register(&registry, "b", 5);

        assert_eq!(registry.cancel_all(), 2);
        assert_eq!(registry.count(), 0);
        assert_eq!(a.await.unwrap().unwrap_err().kind(), ErrorKind::Disposed);
        assert_eq!(b.await.unwrap().unwrap_err().kind(), ErrorKind::Disposed);
    }
}
