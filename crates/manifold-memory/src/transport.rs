//! The in-memory transport: a queue per path, drained by the core's pull
//! loop and fed back into the consumer pipeline. Replies produced by the
//! pipeline land on the reply-path queue like any other produce.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use manifold_bus::pull_loop::{EnvelopeProcessor, PollSource, PullLoop, PullLoopConfig};
use manifold_bus::settings::ProducerAttachments;
use manifold_bus::transport::{InboundDispatcher, IncomingEnvelope, TopologySpec, Transport};
use manifold_bus::{BusResult, HeaderMap};

use crate::error::Error;

type Queues = Mutex<HashMap<String, VecDeque<IncomingEnvelope>>>;

/// One produced envelope, captured for test assertions.
#[derive(Debug, Clone)]
pub struct ProducedRecord {
    /// Destination path.
    pub path: String,
    /// Payload bytes.
    pub payload: Bytes,
    /// Wire headers.
    pub headers: HeaderMap,
}

/// Options for the in-memory transport.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransportOptions {
    /// Pacing of the pull loop.
    pub poll: PullLoopConfig,
}

struct MemoryTransportInner {
    queues: Arc<Queues>,
    consume_paths: Mutex<Vec<String>>,
    dispatcher: RwLock<Option<Arc<dyn InboundDispatcher>>>,
    pull: tokio::sync::Mutex<Option<PullLoop>>,
    produced: Mutex<Vec<ProducedRecord>>,
    options: MemoryTransportOptions,
    started: AtomicBool,
    disposed: AtomicBool,
}

/// An in-memory transport.
pub struct MemoryTransport {
    inner: Arc<MemoryTransportInner>,
}

impl Clone for MemoryTransport {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(MemoryTransportOptions::default())
    }
}

impl MemoryTransport {
    /// Creates a transport with the given options.
    pub fn new(options: MemoryTransportOptions) -> Self {
        Self {
            inner: Arc::new(MemoryTransportInner {
                queues: Arc::new(Mutex::new(HashMap::new())),
                consume_paths: Mutex::new(Vec::new()),
                dispatcher: RwLock::new(None),
                pull: tokio::sync::Mutex::new(None),
                produced: Mutex::new(Vec::new()),
                options,
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Every envelope produced so far, in order.
    pub fn produced(&self) -> Vec<ProducedRecord> {
        self.inner.produced.lock().clone()
    }

    /// Number of envelopes currently queued on a path.
    pub fn queued(&self, path: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(path)
            .map_or(0, VecDeque::len)
    }

    fn ensure_queue(&self, path: &str) {
        self.inner
            .queues
            .lock()
            .entry(path.to_string())
            .or_default();
    }
}

struct QueueSource {
    path: String,
    queues: Arc<Queues>,
}

impl PollSource for QueueSource {
    fn name(&self) -> &str {
        &self.path
    }

    fn try_pop(&self) -> Option<IncomingEnvelope> {
        self.queues.lock().get_mut(&self.path)?.pop_front()
    }
}

struct DispatchProcessor {
    dispatcher: Arc<dyn InboundDispatcher>,
}

#[async_trait]
impl EnvelopeProcessor for DispatchProcessor {
    async fn process(&self, envelope: IncomingEnvelope) -> BusResult<()> {
        let outcome = self.dispatcher.dispatch(envelope).await;
        match outcome.error {
            // A failed envelope is dropped; at-most-once is the contract of
            // this transport.
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> BusResult<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed.into());
        }
        let dispatcher = self
            .inner
            .dispatcher
            .read()
            .clone()
            .ok_or(Error::NotBound)?;
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let pull = PullLoop::new(self.inner.options.poll.clone());
        for path in self.inner.consume_paths.lock().iter() {
            pull.add_queue(
                Arc::new(QueueSource {
                    path: path.clone(),
                    queues: self.inner.queues.clone(),
                }),
                vec![Arc::new(DispatchProcessor {
                    dispatcher: dispatcher.clone(),
                })],
            );
        }
        pull.start()?;

        *self.inner.pull.lock().await = Some(pull);
        debug!("memory transport started");
        Ok(())
    }

    async fn stop(&self) -> BusResult<()> {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(pull) = self.inner.pull.lock().await.take() {
            pull.shutdown().await;
        }
        debug!("memory transport stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    async fn provision_topology(&self, topology: &TopologySpec) -> BusResult<()> {
        for path in &topology.produce_paths {
            self.ensure_queue(path);
        }

        let mut consume_paths = self.inner.consume_paths.lock();
        consume_paths.clear();
        for spec in &topology.consume_paths {
            self.ensure_queue(&spec.path);
            if !consume_paths.contains(&spec.path) {
                consume_paths.push(spec.path.clone());
            }
            if spec.instances > 1 {
                // A single in-process loop drains each queue; the hint only
                // matters to transports with real partition fan-out.
                debug!(path = %spec.path, instances = spec.instances, "instances hint ignored");
            }
        }
        if let Some(reply_path) = &topology.reply_path {
            self.ensure_queue(reply_path);
            if !consume_paths.contains(reply_path) {
                consume_paths.push(reply_path.clone());
            }
        }

        Ok(())
    }

    async fn produce(
        &self,
        path: &str,
        payload: Bytes,
        headers: HeaderMap,
        _attachments: Option<&ProducerAttachments>,
    ) -> BusResult<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed.into());
        }

        self.inner.produced.lock().push(ProducedRecord {
            path: path.to_string(),
            payload: payload.clone(),
            headers: headers.clone(),
        });

        self.inner
            .queues
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(IncomingEnvelope {
                payload,
                headers,
                path: path.to_string(),
            });

        Ok(())
    }

    fn bind(&self, dispatcher: Arc<dyn InboundDispatcher>) {
        *self.inner.dispatcher.write() = Some(dispatcher);
    }

    async fn dispose(&self) -> BusResult<()> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop().await?;
        self.inner.queues.lock().clear();
        debug!("memory transport disposed");
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("queues", &self.inner.queues.lock().len())
            .field("started", &self.is_started())
            .finish()
    }
}
