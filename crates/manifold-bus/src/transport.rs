//! Transport port.
//!
//! The byte-level surface the core consumes from a concrete transport
//! adapter, and the dispatch surface the adapter calls back into.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::consumer::ConsumeOutcome;
use crate::error::BusResult;
use crate::headers::HeaderMap;
use crate::settings::ProducerAttachments;

/// Inbound envelope delivered by a transport adapter.
#[derive(Debug, Clone)]
pub struct IncomingEnvelope {
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// Wire headers.
    pub headers: HeaderMap,
    /// Path the envelope arrived on.
    pub path: String,
}

/// One consumed path with its group and parallelism hint.
#[derive(Debug, Clone)]
pub struct ConsumePathSpec {
    /// Source path.
    pub path: String,
    /// Consumer group, if any.
    pub group: Option<String>,
    /// Parallelism hint.
    pub instances: usize,
}

/// Paths and groups a transport should reconcile before the bus starts.
#[derive(Debug, Clone, Default)]
pub struct TopologySpec {
    /// Paths the bus produces to.
    pub produce_paths: Vec<String>,
    /// Paths the bus consumes from.
    pub consume_paths: Vec<ConsumePathSpec>,
    /// Reply path for request/response, if configured.
    pub reply_path: Option<String>,
}

/// Core→adapter port for one concrete transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts the transport's consumer drivers.
    async fn start(&self) -> BusResult<()>;

    /// Stops the transport's consumer drivers.
    async fn stop(&self) -> BusResult<()>;

    /// Whether the transport's consumer drivers are running.
    fn is_started(&self) -> bool;

    /// Reconciles required paths and groups.
    async fn provision_topology(&self, topology: &TopologySpec) -> BusResult<()>;

    /// Produces an envelope to a path.
    async fn produce(
        &self,
        path: &str,
        payload: Bytes,
        headers: HeaderMap,
        attachments: Option<&ProducerAttachments>,
    ) -> BusResult<()>;

    /// Wires the adapter→core inbound direction. Called before `start`.
    fn bind(&self, dispatcher: Arc<dyn InboundDispatcher>);

    /// Releases transport resources. Implies stop; idempotent.
    async fn dispose(&self) -> BusResult<()>;
}

/// Adapter→core dispatch surface: the consumer pipeline.
#[async_trait]
pub trait InboundDispatcher: Send + Sync + 'static {
    /// Runs one inbound envelope through the consumer pipeline.
    async fn dispatch(&self, envelope: IncomingEnvelope) -> ConsumeOutcome;
}
