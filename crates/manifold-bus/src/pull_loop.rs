//! Reference pull-consumer driver for queue-style transports.
//!
//! Scans its queues in insertion order with non-blocking pops, dispatches
//! each envelope to the queue's processors in order (continuing past an
//! individual processor failure), and backs off with a cancellable sleep
//! once it has been idle past the configured threshold.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{BusResult, Error};
use crate::transport::IncomingEnvelope;

/// Non-blocking source of inbound envelopes.
pub trait PollSource: Send + Sync + 'static {
    /// Queue name, used in logs.
    fn name(&self) -> &str;

    /// Pops one envelope if available.
    fn try_pop(&self) -> Option<IncomingEnvelope>;
}

/// Processes one inbound envelope.
#[async_trait]
pub trait EnvelopeProcessor: Send + Sync + 'static {
    /// Handles the envelope; a failure is isolated to this processor.
    async fn process(&self, envelope: IncomingEnvelope) -> BusResult<()>;
}

/// Pacing configuration for the loop.
#[derive(Debug, Clone)]
pub struct PullLoopConfig {
    /// Sleep applied once the loop has gone idle.
    pub poll_delay: Duration,
    /// Idle time after which the loop starts sleeping between scans.
    pub max_idle: Duration,
}

impl Default for PullLoopConfig {
    fn default() -> Self {
        Self {
            poll_delay: Duration::from_millis(25),
            max_idle: Duration::from_millis(100),
        }
    }
}

struct PullQueue {
    source: Arc<dyn PollSource>,
    processors: Vec<Arc<dyn EnvelopeProcessor>>,
}

/// Poll-based consumer driver.
pub struct PullLoop {
    queues: Mutex<Vec<PullQueue>>,
    config: PullLoopConfig,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl PullLoop {
    /// Creates a stopped loop.
    pub fn new(config: PullLoopConfig) -> Self {
        Self {
            queues: Mutex::new(Vec::new()),
            config,
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Registers a queue with its processor list. Queues are scanned in
    /// registration order.
    pub fn add_queue(
        &self,
        source: Arc<dyn PollSource>,
        processors: Vec<Arc<dyn EnvelopeProcessor>>,
    ) {
        self.queues.lock().push(PullQueue { source, processors });
    }

    /// Starts the single long-running loop task.
    pub fn start(&self) -> BusResult<()> {
        if self.tracker.is_closed() {
            return Err(Error::transport("pull loop is already running"));
        }

        let queues: Vec<(Arc<dyn PollSource>, Vec<Arc<dyn EnvelopeProcessor>>)> = self
            .queues
            .lock()
            .iter()
            .map(|queue| (queue.source.clone(), queue.processors.clone()))
            .collect();

        self.tracker.spawn(Self::run(
            queues,
            self.config.clone(),
            self.token.clone(),
        ));
        self.tracker.close();
        Ok(())
    }

    /// Whether the loop task is alive.
    pub fn is_running(&self) -> bool {
        self.tracker.is_closed() && !self.token.is_cancelled() && !self.tracker.is_empty()
    }

    /// Cancels the loop and awaits the task; registered processors are
    /// drained.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.wait().await;
        self.queues.lock().clear();
        debug!("pull loop shut down");
    }

    async fn run(
        queues: Vec<(Arc<dyn PollSource>, Vec<Arc<dyn EnvelopeProcessor>>)>,
        config: PullLoopConfig,
        token: CancellationToken,
    ) {
        let mut last_activity = Instant::now();

        loop {
            if token.is_cancelled() {
                break;
            }

            let mut busy = false;
            for (source, processors) in &queues {
                if let Some(envelope) = source.try_pop() {
                    busy = true;
                    for processor in processors {
                        if let Err(error) = processor.process(envelope.clone()).await {
                            warn!(
                                queue = source.name(),
                                %error,
                                "envelope processor failed"
                            );
                        }
                    }
                }
            }

            if busy {
                last_activity = Instant::now();
            } else if last_activity.elapsed() >= config.max_idle {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(config.poll_delay) => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        }

        debug!("pull loop exited");
    }
}

impl std::fmt::Debug for PullLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullLoop")
            .field("queues", &self.queues.lock().len())
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use crate::headers::HeaderMap;

    struct QueueOfTwo {
        items: Mutex<VecDeque<IncomingEnvelope>>,
    }

    impl QueueOfTwo {
        fn with(paths: &[&str]) -> Arc<Self> {
            let items = paths
                .iter()
                .map(|path| IncomingEnvelope {
                    payload: Bytes::new(),
                    headers: HeaderMap::new(),
                    path: (*path).to_string(),
                })
                .collect();
            Arc::new(Self {
                items: Mutex::new(items),
            })
        }
    }

    impl PollSource for QueueOfTwo {
        fn name(&self) -> &str {
            "test-queue"
        }

        fn try_pop(&self) -> Option<IncomingEnvelope> {
            self.items.lock().pop_front()
        }
    }

    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EnvelopeProcessor for Recording {
        async fn process(&self, envelope: IncomingEnvelope) -> BusResult<()> {
            self.seen.lock().push(envelope.path);
            Ok(())
        }
    }

    struct AlwaysFailing {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EnvelopeProcessor for AlwaysFailing {
        async fn process(&self, _envelope: IncomingEnvelope) -> BusResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::handler("processor exploded"))
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn envelopes_reach_processors_in_order() {
        let source = QueueOfTwo::with(&["a", "b"]);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let pull = PullLoop::new(PullLoopConfig::default());
        pull.add_queue(source, vec![Arc::new(Recording { seen: seen.clone() })]);
        pull.start().unwrap();

        wait_until(|| seen.lock().len() == 2).await;
        assert_eq!(*seen.lock(), vec!["a".to_string(), "b".to_string()]);
        pull.shutdown().await;
    }

    #[tokio::test]
    async fn a_failing_processor_does_not_starve_the_next() {
        let source = QueueOfTwo::with(&["a", "b"]);
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let pull = PullLoop::new(PullLoopConfig::default());
        pull.add_queue(
            source,
            vec![
                Arc::new(AlwaysFailing {
                    calls: failures.clone(),
                }),
                Arc::new(Recording { seen: seen.clone() }),
            ],
        );
        pull.start().unwrap();

        wait_until(|| seen.lock().len() == 2).await;
        assert_eq!(failures.load(Ordering::SeqCst), 2);
        pull.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_and_drains_queues() {
        let pull = PullLoop::new(PullLoopConfig::default());
        pull.add_queue(QueueOfTwo::with(&[]), Vec::new());
        pull.start().unwrap();
        assert!(pull.is_running());

        pull.shutdown().await;
        assert!(!pull.is_running());
        assert_eq!(pull.queues.lock().len(), 0);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let pull = PullLoop::new(PullLoopConfig::default());
        pull.start().unwrap();
        assert!(pull.start().is_err());
        pull.shutdown().await;
    }
}
