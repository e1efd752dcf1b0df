//! Transport-agnostic message bus runtime.
//!
//! One in-process API for publish/subscribe and request/response messaging
//! that federates over pluggable transports. Applications declare, per
//! message type, a producer side (publish or request) and/or a consumer side
//! (consume or handle); the runtime routes, serializes, correlates,
//! intercepts and delivers.

/// Builder / configuration model.
pub mod builder;

/// Master bus skeleton and the object-safe bus surface.
pub mod bus;

/// Consumer pipeline: decode, intercept, invoke, reply.
pub mod consumer;

/// Error classification for every surfaced failure.
pub mod error;

/// Transport-neutral headers and well-known keys.
pub mod headers;

/// Ordered middleware around produce and consume.
pub mod interceptor;

/// Message identity and type-erased values.
pub mod message;

/// Pending-request registry and clock abstraction.
pub mod pending;

/// Producer pipeline: resolve, intercept, serialize, dispatch.
pub mod producer;

/// Reference pull-consumer driver for queue-style transports.
pub mod pull_loop;

/// Message-type to settings resolution.
pub mod registry;

/// Dependency-resolver port and the type-map implementation.
pub mod resolver;

/// Serialization port.
pub mod serializer;

/// Declarative settings trees.
pub mod settings;

/// Transport port.
pub mod transport;

pub use builder::{ConsumerConfig, MessageBusBuilder, ProducerConfig};
pub use bus::{Bus, MessageBus, ProducerDescriptor};
pub use consumer::{ConsumeContext, ConsumeOutcome, Consumer, RequestHandler};
pub use error::{BusResult, Error, ErrorKind};
pub use headers::{HeaderMap, HeaderValue};
pub use interceptor::{
    ConsumerInterceptor, HandlerInterceptor, Next, ProducerInterceptor, PublishInterceptor,
    SendInterceptor,
};
pub use message::{
    AnyMessage, BoxedMessage, BusMessage, DefaultMessageTypeResolver, MessageType,
    MessageTypeResolver, RequestMessage,
};
pub use pending::{Clock, ManualClock, PendingRequests, SystemClock};
pub use producer::{ProduceContext, PublishOptions, SendOptions};
pub use pull_loop::{EnvelopeProcessor, PollSource, PullLoop, PullLoopConfig};
pub use resolver::{DependencyResolver, TypeMap};
pub use serializer::SerializationFormat;
pub use settings::{
    ConsumedEvent, ProducedEvent, ProducerAttachments, RequestResponseSettings,
};
pub use transport::{
    ConsumePathSpec, InboundDispatcher, IncomingEnvelope, TopologySpec, Transport,
};
