//! Declarative settings trees consumed by the runtime.
//!
//! Populated by the builder, owned by the bus. Producer settings resolve
//! through the type registry (polymorphism included); consumer settings
//! drive inbound dispatch.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::consumer::ErasedConsumer;
use crate::error::BusResult;
use crate::headers::{self, HeaderMap};
use crate::interceptor::{ConsumeLink, ProduceLink};
use crate::message::{MessageType, MessageTypeResolver};
use crate::resolver::DependencyResolver;
use crate::serializer::{MessageDecoder, SerializationFormat};

/// Fired after a message was handed to the transport.
pub struct ProducedEvent<'a> {
    /// Name of the producing bus.
    pub bus_name: &'a str,
    /// The declared producer type the settings were resolved for.
    pub declared_type: MessageType,
    /// The runtime type of the produced value.
    pub runtime_type: MessageType,
    /// Destination path.
    pub path: &'a str,
}

/// Fired after an inbound message was handled successfully.
pub struct ConsumedEvent<'a> {
    /// Name of the consuming bus.
    pub bus_name: &'a str,
    /// The declared consumer type.
    pub message_type: MessageType,
    /// Source path.
    pub path: &'a str,
}

/// Produced-event hook.
pub type ProducedCallback = Arc<dyn Fn(&ProducedEvent<'_>) + Send + Sync>;

/// Consumed-event hook.
pub type ConsumedCallback = Arc<dyn Fn(&ConsumedEvent<'_>) + Send + Sync>;

/// Mutates outbound headers before the interceptor chain runs.
pub type HeaderModifier = Arc<dyn Fn(&mut HeaderMap, MessageType) + Send + Sync>;

/// Transport-specific opaque attachments keyed by name (key providers,
/// partition providers and the like). Interpreted by adapters only.
pub type ProducerAttachments = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// Factory producing the user consumer from a (possibly per-message)
/// dependency scope.
pub type ConsumerFactory =
    Arc<dyn Fn(&dyn DependencyResolver) -> BusResult<Arc<dyn ErasedConsumer>> + Send + Sync>;

/// Resolver-side interceptor discovery for a produce type, minted at
/// declaration time where the static type is known.
pub(crate) type ProduceDiscoverFn =
    Arc<dyn Fn(&dyn DependencyResolver) -> DiscoveredProduceLinks + Send + Sync>;

/// Resolver-side interceptor discovery for a consume type.
pub(crate) type ConsumeDiscoverFn =
    Arc<dyn Fn(&dyn DependencyResolver) -> Vec<Arc<dyn ConsumeLink>> + Send + Sync>;

/// Interceptors discovered through the dependency resolver.
#[derive(Default)]
pub(crate) struct DiscoveredProduceLinks {
    pub producer: Vec<Arc<dyn ProduceLink>>,
    pub publish: Vec<Arc<dyn ProduceLink>>,
    pub send: Vec<Arc<dyn ProduceLink>>,
}

/// How a given message type is produced.
#[derive(Clone)]
pub struct ProducerSettings {
    pub(crate) message_type: MessageType,
    pub(crate) default_path: Option<String>,
    pub(crate) default_timeout: Option<Duration>,
    pub(crate) response_type: Option<MessageType>,
    /// Decoder for the reply payload; present iff this is a request producer.
    pub(crate) response_decoder: Option<MessageDecoder>,
    pub(crate) polymorphic: bool,
    pub(crate) on_message_produced: Option<ProducedCallback>,
    pub(crate) attachments: ProducerAttachments,
    pub(crate) discover: ProduceDiscoverFn,
}

impl ProducerSettings {
    /// The declared message type.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Default destination path, if declared.
    pub fn default_path(&self) -> Option<&str> {
        self.default_path.as_deref()
    }

    /// Default request timeout. Only meaningful for request types.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Response type for request producers, `None` for pub/sub.
    pub fn response_type(&self) -> Option<MessageType> {
        self.response_type
    }

    /// Whether this producer is a request producer.
    pub fn is_request(&self) -> bool {
        self.response_type.is_some()
    }

    /// Whether derived types inherit this producer.
    pub fn is_polymorphic(&self) -> bool {
        self.polymorphic
    }

    /// Named opaque attachments for the transport adapter.
    pub fn attachments(&self) -> &ProducerAttachments {
        &self.attachments
    }
}

impl std::fmt::Debug for ProducerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerSettings")
            .field("message_type", &self.message_type)
            .field("default_path", &self.default_path)
            .field("default_timeout", &self.default_timeout)
            .field("response_type", &self.response_type)
            .field("polymorphic", &self.polymorphic)
            .finish_non_exhaustive()
    }
}

/// How a given message type is consumed or handled.
#[derive(Clone)]
pub struct ConsumerSettings {
    pub(crate) message_type: MessageType,
    pub(crate) response_type: Option<MessageType>,
    pub(crate) path: String,
    pub(crate) group: Option<String>,
    pub(crate) instances: usize,
    pub(crate) decoder: MessageDecoder,
    pub(crate) factory: ConsumerFactory,
    pub(crate) on_message_consumed: Option<ConsumedCallback>,
    pub(crate) discover_consumer: ConsumeDiscoverFn,
    pub(crate) discover_handler: Option<ConsumeDiscoverFn>,
    /// Interceptor chain, assembled once at build time.
    pub(crate) chain: Vec<Arc<dyn ConsumeLink>>,
}

impl ConsumerSettings {
    /// The declared message type.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Response type for request handlers, `None` for pub/sub consumers.
    pub fn response_type(&self) -> Option<MessageType> {
        self.response_type
    }

    /// Whether this consumer responds to requests.
    pub fn is_responder(&self) -> bool {
        self.response_type.is_some()
    }

    /// Source path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Consumer group, if any.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Parallelism hint for the transport adapter.
    pub fn instances(&self) -> usize {
        self.instances
    }
}

impl std::fmt::Debug for ConsumerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerSettings")
            .field("message_type", &self.message_type)
            .field("response_type", &self.response_type)
            .field("path", &self.path)
            .field("group", &self.group)
            .field("instances", &self.instances)
            .finish_non_exhaustive()
    }
}

/// Bus-level request/response configuration.
#[derive(Debug, Clone)]
pub struct RequestResponseSettings {
    /// Path replies to this bus's requests are delivered on.
    pub reply_path: String,
    /// Consumer group for the reply consumer.
    pub group: Option<String>,
    /// Timeout applied when neither the caller nor the producer sets one.
    pub default_timeout: Duration,
    /// Header carrying the correlation id.
    pub correlation_header: String,
    /// Header carrying the originator bus name.
    pub originator_header: String,
}

impl RequestResponseSettings {
    /// Creates settings for the given reply path with default header names
    /// and a 20 second default timeout.
    pub fn new(reply_path: impl Into<String>) -> Self {
        Self {
            reply_path: reply_path.into(),
            group: None,
            default_timeout: Duration::from_secs(20),
            correlation_header: headers::CORRELATION_ID.to_string(),
            originator_header: headers::ORIGINATOR.to_string(),
        }
    }

    /// Sets the reply consumer group.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets the bus-level default timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Root of the settings tree owned by one bus.
pub struct BusSettings {
    /// Bus name; stamped as the originator on outbound messages.
    pub name: String,
    /// Wire format for declared types.
    pub format: SerializationFormat,
    /// Request/response configuration, if the bus sends requests.
    pub request_response: Option<RequestResponseSettings>,
    /// Whether a child dependency scope wraps each inbound message.
    pub per_message_scope: bool,
    /// Whether consumers start when the bus is built.
    pub auto_start: bool,
    /// Cadence of the coarse periodic timeout sweep.
    pub sweep_interval: Duration,
    /// Bound on outstanding pending requests.
    pub pending_capacity: usize,
    /// Mapping between declared type names and the wire-level type header.
    pub message_type_resolver: Arc<dyn MessageTypeResolver>,
    /// Hook applied to every outbound header map.
    pub header_modifier: Option<HeaderModifier>,
    /// Bus-level produced-event hook.
    pub on_message_produced: Option<ProducedCallback>,
    /// Bus-level consumed-event hook.
    pub on_message_consumed: Option<ConsumedCallback>,
}

impl std::fmt::Debug for BusSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSettings")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("request_response", &self.request_response)
            .field("per_message_scope", &self.per_message_scope)
            .field("auto_start", &self.auto_start)
            .field("sweep_interval", &self.sweep_interval)
            .field("pending_capacity", &self.pending_capacity)
            .finish_non_exhaustive()
    }
}
