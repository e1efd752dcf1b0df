//! Master bus skeleton.
//!
//! Owns the settings tree, type registry, pending-request registry and
//! transport handle. `start`/`stop` are idempotent and safe to call
//! concurrently; disposal implies stop, cancels outstanding requests and
//! releases the transport.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::consumer::ConsumeOutcome;
use crate::error::{BusResult, Error};
use crate::interceptor::{InterceptorRegistry, ProduceLink};
use crate::message::{BoxedMessage, BusMessage, MessageType, RequestMessage};
use crate::pending::PendingRequests;
use crate::producer::{PublishOptions, SendOptions};
use crate::registry::TypeRegistry;
use crate::resolver::DependencyResolver;
use crate::settings::BusSettings;
use crate::transport::{InboundDispatcher, IncomingEnvelope, TopologySpec, Transport};

/// A producer declaration surfaced for composite routing.
#[derive(Debug, Clone)]
pub struct ProducerDescriptor {
    /// The declared message type.
    pub message_type: MessageType,
    /// Whether the producer expects correlated replies.
    pub is_request: bool,
    /// Whether derived types inherit this producer.
    pub polymorphic: bool,
}

/// Object-safe bus surface consumed by composite routers.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Bus name.
    fn name(&self) -> &str;

    /// Starts consumer drivers. Idempotent.
    async fn start(&self) -> BusResult<()>;

    /// Stops consumer drivers. Idempotent.
    async fn stop(&self) -> BusResult<()>;

    /// Whether every consumer driver is running.
    fn is_started(&self) -> bool;

    /// Tears the bus down. Implies stop; idempotent.
    async fn dispose(&self) -> BusResult<()>;

    /// Declared producers, for routing.
    fn producers(&self) -> Vec<ProducerDescriptor>;

    /// Publishes a type-erased message.
    async fn publish_boxed(&self, message: BoxedMessage, options: PublishOptions)
        -> BusResult<()>;

    /// Sends a type-erased request and awaits its reply.
    async fn send_boxed(
        &self,
        message: BoxedMessage,
        options: SendOptions,
    ) -> BusResult<BoxedMessage>;
}

struct LifecycleState {
    started: bool,
    sweeper_token: Option<CancellationToken>,
    sweeper_tracker: Option<TaskTracker>,
}

/// Shared state behind a [`MessageBus`] handle.
pub(crate) struct BusInner {
    pub(crate) settings: BusSettings,
    pub(crate) registry: TypeRegistry,
    pub(crate) pending: Arc<PendingRequests>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) resolver: Arc<dyn DependencyResolver>,
    pub(crate) interceptors: InterceptorRegistry,
    pub(crate) publish_chains: RwLock<HashMap<TypeId, Arc<Vec<Arc<dyn ProduceLink>>>>>,
    pub(crate) send_chains: RwLock<HashMap<TypeId, Arc<Vec<Arc<dyn ProduceLink>>>>>,
    /// Cancelled on disposal; parent of every per-operation token.
    pub(crate) shutdown: CancellationToken,
    lifecycle: tokio::sync::Mutex<LifecycleState>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl BusInner {
    pub(crate) fn new(
        settings: BusSettings,
        registry: TypeRegistry,
        pending: Arc<PendingRequests>,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn DependencyResolver>,
        interceptors: InterceptorRegistry,
    ) -> Self {
        Self {
            settings,
            registry,
            pending,
            transport,
            resolver,
            interceptors,
            publish_chains: RwLock::new(HashMap::new()),
            send_chains: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            lifecycle: tokio::sync::Mutex::new(LifecycleState {
                started: false,
                sweeper_token: None,
                sweeper_tracker: None,
            }),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_live(&self) -> BusResult<()> {
        if self.is_disposed() {
            Err(Error::disposed(format!(
                "bus {} is disposed",
                self.settings.name
            )))
        } else {
            Ok(())
        }
    }

    fn topology_spec(&self) -> TopologySpec {
        let produce_paths = self
            .registry
            .producers()
            .filter_map(|producer| producer.default_path().map(str::to_string))
            .collect();
        let consume_paths = self
            .registry
            .consumers()
            .iter()
            .map(|consumer| crate::transport::ConsumePathSpec {
                path: consumer.path().to_string(),
                group: consumer.group().map(str::to_string),
                instances: consumer.instances(),
            })
            .collect();
        let reply_path = self
            .settings
            .request_response
            .as_ref()
            .map(|rr| rr.reply_path.clone());

        TopologySpec {
            produce_paths,
            consume_paths,
            reply_path,
        }
    }
}

#[async_trait]
impl InboundDispatcher for BusInner {
    async fn dispatch(&self, envelope: IncomingEnvelope) -> ConsumeOutcome {
        self.dispatch_inbound(envelope).await
    }
}

/// A single bus over one concrete transport.
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Clone for MessageBus {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl MessageBus {
    pub(crate) fn from_inner(inner: Arc<BusInner>) -> Self {
        Self { inner }
    }

    /// Bus name.
    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    /// Number of outstanding pending requests.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.count()
    }

    /// Sweeps timed-out pending requests now, in addition to the periodic
    /// tick and the per-reply sweep.
    pub fn sweep_pending(&self) -> usize {
        self.inner.pending.sweep()
    }

    /// Starts the bus: provisions topology, binds and starts the transport,
    /// and launches the timeout sweeper. Idempotent and concurrency-safe.
    pub async fn start(&self) -> BusResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.ensure_live()?;
        if lifecycle.started {
            return Ok(());
        }

        let topology = self.inner.topology_spec();
        self.inner.transport.provision_topology(&topology).await?;
        let dispatcher: Arc<dyn InboundDispatcher> = self.inner.clone();
        self.inner.transport.bind(dispatcher);
        self.inner.transport.start().await?;

        let sweeper_token = self.inner.shutdown.child_token();
        let sweeper_tracker = TaskTracker::new();
        sweeper_tracker.spawn(run_sweeper(
            self.inner.pending.clone(),
            self.inner.settings.sweep_interval,
            sweeper_token.clone(),
        ));
        sweeper_tracker.close();
        lifecycle.sweeper_token = Some(sweeper_token);
        lifecycle.sweeper_tracker = Some(sweeper_tracker);

        lifecycle.started = true;
        self.inner.started.store(true, Ordering::SeqCst);
        info!(bus = %self.inner.settings.name, "bus started");
        Ok(())
    }

    /// Stops the bus's consumer drivers. Idempotent and concurrency-safe.
    pub async fn stop(&self) -> BusResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !lifecycle.started {
            return Ok(());
        }

        self.inner.transport.stop().await?;

        if let Some(token) = lifecycle.sweeper_token.take() {
            token.cancel();
        }
        if let Some(tracker) = lifecycle.sweeper_tracker.take() {
            tracker.wait().await;
        }

        lifecycle.started = false;
        self.inner.started.store(false, Ordering::SeqCst);
        info!(bus = %self.inner.settings.name, "bus stopped");
        Ok(())
    }

    /// Whether every consumer driver is running.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && self.inner.transport.is_started()
    }

    /// Tears the bus down: stops drivers, cancels outstanding requests and
    /// releases the transport. Idempotent.
    pub async fn dispose(&self) -> BusResult<()> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.stop().await?;
        self.inner.shutdown.cancel();
        let cancelled = self.inner.pending.cancel_all();
        if cancelled > 0 {
            debug!(
                bus = %self.inner.settings.name,
                cancelled,
                "cancelled pending requests on disposal"
            );
        }
        self.inner.transport.dispose().await?;
        info!(bus = %self.inner.settings.name, "bus disposed");
        Ok(())
    }

    /// Publishes a message to its resolved path.
    pub async fn publish<M: BusMessage>(&self, message: M) -> BusResult<()> {
        self.inner
            .publish_boxed(Box::new(message), PublishOptions::default())
            .await
    }

    /// Publishes a message with caller-side overrides.
    pub async fn publish_with<M: BusMessage>(
        &self,
        message: M,
        options: PublishOptions,
    ) -> BusResult<()> {
        self.inner.publish_boxed(Box::new(message), options).await
    }

    /// Sends a request and awaits its typed reply.
    pub async fn send<R: RequestMessage>(&self, request: R) -> BusResult<R::Response> {
        self.send_with(request, SendOptions::default()).await
    }

    /// Sends a request with caller-side overrides.
    pub async fn send_with<R: RequestMessage>(
        &self,
        request: R,
        options: SendOptions,
    ) -> BusResult<R::Response> {
        let response = self.inner.send_boxed(Box::new(request), options).await?;
        let runtime_type = MessageType::of::<R>();
        response.downcast::<R::Response>().ok_or_else(|| {
            Error::serialization(format!(
                "reply for {runtime_type} was not of the declared response type"
            ))
        })
    }

    /// Runs one inbound envelope through the consumer pipeline. Exposed for
    /// adapters and test harnesses that drive the bus directly.
    pub async fn dispatch_inbound(&self, envelope: IncomingEnvelope) -> ConsumeOutcome {
        self.inner.dispatch_inbound(envelope).await
    }
}

#[async_trait]
impl Bus for MessageBus {
    fn name(&self) -> &str {
        MessageBus::name(self)
    }

    async fn start(&self) -> BusResult<()> {
        MessageBus::start(self).await
    }

    async fn stop(&self) -> BusResult<()> {
        MessageBus::stop(self).await
    }

    fn is_started(&self) -> bool {
        MessageBus::is_started(self)
    }

    async fn dispose(&self) -> BusResult<()> {
        MessageBus::dispose(self).await
    }

    fn producers(&self) -> Vec<ProducerDescriptor> {
        self.inner
            .registry
            .producers()
            .map(|settings| ProducerDescriptor {
                message_type: settings.message_type(),
                is_request: settings.is_request(),
                polymorphic: settings.is_polymorphic(),
            })
            .collect()
    }

    async fn publish_boxed(
        &self,
        message: BoxedMessage,
        options: PublishOptions,
    ) -> BusResult<()> {
        self.inner.publish_boxed(message, options).await
    }

    async fn send_boxed(
        &self,
        message: BoxedMessage,
        options: SendOptions,
    ) -> BusResult<BoxedMessage> {
        self.inner.send_boxed(message, options).await
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("name", &self.inner.settings.name)
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .field("disposed", &self.inner.is_disposed())
            .field("pending", &self.inner.pending.count())
            .finish()
    }
}

/// Coarse periodic sweep; the fine-grained sweep rides on inbound replies.
async fn run_sweeper(
    pending: Arc<PendingRequests>,
    interval: std::time::Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                let expired = pending.sweep();
                if expired > 0 {
                    debug!(expired, "sweeper expired pending requests");
                }
            }
        }
    }
}
