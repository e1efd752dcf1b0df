//! Builder / configuration model.
//!
//! Fluent accumulation into the settings tree the bus consumes. Validations
//! run at build time: duplicate producers, missing transport, request
//! producers without request/response settings, empty consumer paths.

use std::any::TypeId;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::bus::{BusInner, MessageBus};
use crate::consumer::{
    Consumer, ConsumerAdapter, ErasedConsumer, HandlerAdapter, RequestHandler,
};
use crate::error::{BusResult, Error};
use crate::interceptor::{
    ConsumeLink, ConsumerInterceptor, ConsumerLinkAdapter, HandlerInterceptor,
    HandlerLinkAdapter, InterceptorRegistry, ProduceLink, ProducerInterceptor,
    ProducerLinkAdapter, PublishInterceptor, PublishLinkAdapter, SendInterceptor,
    SendLinkAdapter,
};
use crate::message::{
    BusMessage, DefaultMessageTypeResolver, MessageType, MessageTypeResolver, RequestMessage,
};
use crate::pending::{Clock, PendingRequests, SystemClock};
use crate::registry::TypeRegistry;
use crate::resolver::{DependencyResolver, TypeMap};
use crate::serializer::{MessageDecoder, SerializationFormat};
use crate::settings::{
    BusSettings, ConsumedCallback, ConsumerFactory, ConsumerSettings, DiscoveredProduceLinks,
    HeaderModifier, ProducedCallback, ProducerAttachments, ProducerSettings,
    RequestResponseSettings,
};
use crate::transport::Transport;

/// Declarative configuration for one producer.
#[derive(Default)]
pub struct ProducerConfig {
    path: Option<String>,
    timeout: Option<Duration>,
    polymorphic: bool,
    attachments: ProducerAttachments,
    on_produced: Option<ProducedCallback>,
}

impl ProducerConfig {
    /// Creates a config with the given default path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            timeout: None,
            polymorphic: true,
            attachments: ProducerAttachments::default(),
            on_produced: None,
        }
    }

    /// Creates a config with no default path; callers must supply one.
    pub fn without_path() -> Self {
        Self {
            polymorphic: true,
            ..Self::default()
        }
    }

    /// Default timeout. Only meaningful for request producers.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether derived types inherit this producer. On by default.
    pub fn polymorphic(mut self, polymorphic: bool) -> Self {
        self.polymorphic = polymorphic;
        self
    }

    /// Attaches a named opaque value for the transport adapter (key
    /// provider, partition provider, ...).
    pub fn attachment(
        mut self,
        name: impl Into<String>,
        value: Arc<dyn std::any::Any + Send + Sync>,
    ) -> Self {
        self.attachments.insert(name.into(), value);
        self
    }

    /// Per-producer produced-event hook.
    pub fn on_message_produced(mut self, hook: ProducedCallback) -> Self {
        self.on_produced = Some(hook);
        self
    }
}

/// Declarative configuration for one consumer or handler.
pub struct ConsumerConfig {
    path: String,
    group: Option<String>,
    instances: usize,
    on_consumed: Option<ConsumedCallback>,
}

impl ConsumerConfig {
    /// Creates a config consuming from the given path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            group: None,
            instances: 1,
            on_consumed: None,
        }
    }

    /// Consumer group name.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Parallelism hint for the transport adapter.
    pub fn instances(mut self, instances: usize) -> Self {
        self.instances = instances.max(1);
        self
    }

    /// Per-consumer consumed-event hook.
    pub fn on_message_consumed(mut self, hook: ConsumedCallback) -> Self {
        self.on_consumed = Some(hook);
        self
    }
}

/// Fluent builder for a [`MessageBus`].
pub struct MessageBusBuilder {
    name: String,
    format: SerializationFormat,
    format_set: bool,
    transport: Option<Arc<dyn Transport>>,
    resolver: Option<Arc<dyn DependencyResolver>>,
    message_type_resolver: Arc<dyn MessageTypeResolver>,
    clock: Option<Arc<dyn Clock>>,
    producers: Vec<ProducerSettings>,
    consumers: Vec<ConsumerSettings>,
    request_response: Option<RequestResponseSettings>,
    interceptors: InterceptorRegistry,
    header_modifier: Option<HeaderModifier>,
    per_message_scope: bool,
    auto_start: bool,
    sweep_interval: Duration,
    pending_capacity: usize,
    on_message_produced: Option<ProducedCallback>,
    on_message_consumed: Option<ConsumedCallback>,
}

impl MessageBusBuilder {
    /// Creates a builder for a bus with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: SerializationFormat::default(),
            format_set: false,
            transport: None,
            resolver: None,
            message_type_resolver: Arc::new(DefaultMessageTypeResolver),
            clock: None,
            producers: Vec::new(),
            consumers: Vec::new(),
            request_response: None,
            interceptors: InterceptorRegistry::default(),
            header_modifier: None,
            per_message_scope: false,
            auto_start: false,
            sweep_interval: Duration::from_secs(1),
            pending_capacity: 4096,
            on_message_produced: None,
            on_message_consumed: None,
        }
    }

    /// Declares a pub/sub producer for `M`.
    pub fn produce<M: BusMessage>(mut self, config: ProducerConfig) -> Self {
        self.producers
            .push(Self::producer_settings::<M>(config, None, None));
        self
    }

    /// Declares a request producer for `R`.
    pub fn produce_request<R: RequestMessage>(mut self, config: ProducerConfig) -> Self {
        let mut settings = Self::producer_settings::<R>(
            config,
            Some(MessageType::of::<R::Response>()),
            Some(MessageDecoder::of::<R::Response>()),
        );
        // Send-stage discovery needs the request bound, so it replaces the
        // pub/sub discovery closure.
        settings.discover = Arc::new(|resolver: &dyn DependencyResolver| {
            let mut links = DiscoveredProduceLinks::default();
            if let Some(list) = resolver.resolve::<Vec<Arc<dyn ProducerInterceptor<R>>>>() {
                links.producer.extend(list.iter().cloned().map(|interceptor| {
                    Arc::new(ProducerLinkAdapter::<R>(interceptor)) as Arc<dyn ProduceLink>
                }));
            }
            if let Some(list) = resolver.resolve::<Vec<Arc<dyn PublishInterceptor<R>>>>() {
                links.publish.extend(list.iter().cloned().map(|interceptor| {
                    Arc::new(PublishLinkAdapter::<R>(interceptor)) as Arc<dyn ProduceLink>
                }));
            }
            if let Some(list) = resolver.resolve::<Vec<Arc<dyn SendInterceptor<R>>>>() {
                links.send.extend(list.iter().cloned().map(|interceptor| {
                    Arc::new(SendLinkAdapter::<R>(interceptor)) as Arc<dyn ProduceLink>
                }));
            }
            links
        });
        self.producers.push(settings);
        self
    }

    fn producer_settings<M: BusMessage>(
        config: ProducerConfig,
        response_type: Option<MessageType>,
        response_decoder: Option<MessageDecoder>,
    ) -> ProducerSettings {
        ProducerSettings {
            message_type: MessageType::of::<M>(),
            default_path: config.path,
            default_timeout: config.timeout,
            response_type,
            response_decoder,
            polymorphic: config.polymorphic,
            on_message_produced: config.on_produced,
            attachments: config.attachments,
            discover: Arc::new(|resolver: &dyn DependencyResolver| {
                let mut links = DiscoveredProduceLinks::default();
                if let Some(list) = resolver.resolve::<Vec<Arc<dyn ProducerInterceptor<M>>>>() {
                    links.producer.extend(list.iter().cloned().map(|interceptor| {
                        Arc::new(ProducerLinkAdapter::<M>(interceptor)) as Arc<dyn ProduceLink>
                    }));
                }
                if let Some(list) = resolver.resolve::<Vec<Arc<dyn PublishInterceptor<M>>>>() {
                    links.publish.extend(list.iter().cloned().map(|interceptor| {
                        Arc::new(PublishLinkAdapter::<M>(interceptor)) as Arc<dyn ProduceLink>
                    }));
                }
                links
            }),
        }
    }

    /// Declares a pub/sub consumer for `M` with a ready instance.
    pub fn consume<M, C>(mut self, consumer: Arc<C>, config: ConsumerConfig) -> Self
    where
        M: BusMessage + DeserializeOwned + Clone,
        C: Consumer<M>,
    {
        let invoker: Arc<dyn ErasedConsumer> = Arc::new(ConsumerAdapter::<M, C> {
            consumer,
            _marker: PhantomData,
        });
        let factory: ConsumerFactory = Arc::new(move |_resolver| Ok(invoker.clone()));
        self.consumers
            .push(Self::consumer_settings::<M>(config, None, factory, None));
        self
    }

    /// Declares a pub/sub consumer for `M` resolved from the (per-message)
    /// dependency scope.
    pub fn consume_resolved<M, C>(mut self, config: ConsumerConfig) -> Self
    where
        M: BusMessage + DeserializeOwned + Clone,
        C: Consumer<M>,
    {
        let factory: ConsumerFactory = Arc::new(|resolver: &dyn DependencyResolver| {
            let consumer = resolver.resolve::<C>().ok_or_else(|| {
                Error::configuration(format!(
                    "consumer {} is not registered with the resolver",
                    std::any::type_name::<C>()
                ))
            })?;
            Ok(Arc::new(ConsumerAdapter::<M, C> {
                consumer,
                _marker: PhantomData,
            }) as Arc<dyn ErasedConsumer>)
        });
        self.consumers
            .push(Self::consumer_settings::<M>(config, None, factory, None));
        self
    }

    /// Declares a request handler for `R` with a ready instance.
    pub fn handle<R, H>(mut self, handler: Arc<H>, config: ConsumerConfig) -> Self
    where
        R: RequestMessage + DeserializeOwned + Clone,
        H: RequestHandler<R>,
    {
        let invoker: Arc<dyn ErasedConsumer> = Arc::new(HandlerAdapter::<R, H> {
            handler,
            _marker: PhantomData,
        });
        let factory: ConsumerFactory = Arc::new(move |_resolver| Ok(invoker.clone()));
        self.consumers.push(Self::consumer_settings::<R>(
            config,
            Some(MessageType::of::<R::Response>()),
            factory,
            Some(Self::handler_discovery::<R>()),
        ));
        self
    }

    /// Declares a request handler for `R` resolved from the (per-message)
    /// dependency scope.
    pub fn handle_resolved<R, H>(mut self, config: ConsumerConfig) -> Self
    where
        R: RequestMessage + DeserializeOwned + Clone,
        H: RequestHandler<R>,
    {
        let factory: ConsumerFactory = Arc::new(|resolver: &dyn DependencyResolver| {
            let handler = resolver.resolve::<H>().ok_or_else(|| {
                Error::configuration(format!(
                    "handler {} is not registered with the resolver",
                    std::any::type_name::<H>()
                ))
            })?;
            Ok(Arc::new(HandlerAdapter::<R, H> {
                handler,
                _marker: PhantomData,
            }) as Arc<dyn ErasedConsumer>)
        });
        self.consumers.push(Self::consumer_settings::<R>(
            config,
            Some(MessageType::of::<R::Response>()),
            factory,
            Some(Self::handler_discovery::<R>()),
        ));
        self
    }

    fn consumer_settings<M: BusMessage + DeserializeOwned>(
        config: ConsumerConfig,
        response_type: Option<MessageType>,
        factory: ConsumerFactory,
        discover_handler: Option<crate::settings::ConsumeDiscoverFn>,
    ) -> ConsumerSettings {
        ConsumerSettings {
            message_type: MessageType::of::<M>(),
            response_type,
            path: config.path,
            group: config.group,
            instances: config.instances,
            decoder: MessageDecoder::of::<M>(),
            factory,
            on_message_consumed: config.on_consumed,
            discover_consumer: Arc::new(|resolver: &dyn DependencyResolver| {
                let mut links: Vec<Arc<dyn ConsumeLink>> = Vec::new();
                if let Some(list) = resolver.resolve::<Vec<Arc<dyn ConsumerInterceptor<M>>>>() {
                    links.extend(list.iter().cloned().map(|interceptor| {
                        Arc::new(ConsumerLinkAdapter::<M>(interceptor)) as Arc<dyn ConsumeLink>
                    }));
                }
                links
            }),
            discover_handler,
            chain: Vec::new(),
        }
    }

    fn handler_discovery<R: RequestMessage>() -> crate::settings::ConsumeDiscoverFn {
        Arc::new(|resolver: &dyn DependencyResolver| {
            let mut links: Vec<Arc<dyn ConsumeLink>> = Vec::new();
            if let Some(list) = resolver.resolve::<Vec<Arc<dyn HandlerInterceptor<R>>>>() {
                links.extend(list.iter().cloned().map(|interceptor| {
                    Arc::new(HandlerLinkAdapter::<R>(interceptor)) as Arc<dyn ConsumeLink>
                }));
            }
            links
        })
    }

    /// Configures the reply path and defaults for request/response.
    pub fn expect_request_responses(mut self, settings: RequestResponseSettings) -> Self {
        self.request_response = Some(settings);
        self
    }

    /// Sets the wire format.
    pub fn with_serialization_format(mut self, format: SerializationFormat) -> Self {
        self.format = format;
        self.format_set = true;
        self
    }

    /// Sets the transport adapter.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the dependency resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sets the mapping between declared type names and the wire-level type
    /// header.
    pub fn with_message_type_resolver(
        mut self,
        resolver: Arc<dyn MessageTypeResolver>,
    ) -> Self {
        self.message_type_resolver = resolver;
        self
    }

    /// Sets the clock used for pending-request deadlines.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Hook applied to every outbound header map.
    pub fn with_header_modifier(mut self, modifier: HeaderModifier) -> Self {
        self.header_modifier = Some(modifier);
        self
    }

    /// Registers a producer interceptor for `M`.
    pub fn with_producer_interceptor<M: BusMessage>(
        mut self,
        interceptor: Arc<dyn ProducerInterceptor<M>>,
    ) -> Self {
        self.interceptors
            .producer
            .entry(TypeId::of::<M>())
            .or_default()
            .push(Arc::new(ProducerLinkAdapter::<M>(interceptor)));
        self
    }

    /// Registers a publish interceptor for `M`.
    pub fn with_publish_interceptor<M: BusMessage>(
        mut self,
        interceptor: Arc<dyn PublishInterceptor<M>>,
    ) -> Self {
        self.interceptors
            .publish
            .entry(TypeId::of::<M>())
            .or_default()
            .push(Arc::new(PublishLinkAdapter::<M>(interceptor)));
        self
    }

    /// Registers a send interceptor for `R`.
    pub fn with_send_interceptor<R: RequestMessage>(
        mut self,
        interceptor: Arc<dyn SendInterceptor<R>>,
    ) -> Self {
        self.interceptors
            .send
            .entry(TypeId::of::<R>())
            .or_default()
            .push(Arc::new(SendLinkAdapter::<R>(interceptor)));
        self
    }

    /// Registers a consumer interceptor for `M`.
    pub fn with_consumer_interceptor<M: BusMessage>(
        mut self,
        interceptor: Arc<dyn ConsumerInterceptor<M>>,
    ) -> Self {
        self.interceptors
            .consumer
            .entry(TypeId::of::<M>())
            .or_default()
            .push(Arc::new(ConsumerLinkAdapter::<M>(interceptor)));
        self
    }

    /// Registers a handler interceptor for `R`.
    pub fn with_handler_interceptor<R: RequestMessage>(
        mut self,
        interceptor: Arc<dyn HandlerInterceptor<R>>,
    ) -> Self {
        self.interceptors
            .handler
            .entry(TypeId::of::<R>())
            .or_default()
            .push(Arc::new(HandlerLinkAdapter::<R>(interceptor)));
        self
    }

    /// Whether the bus starts when built.
    pub fn auto_start_consumers(mut self, enabled: bool) -> Self {
        self.auto_start = enabled;
        self
    }

    /// Whether a child dependency scope wraps each inbound message.
    pub fn per_message_scope(mut self, enabled: bool) -> Self {
        self.per_message_scope = enabled;
        self
    }

    /// Cadence of the coarse periodic timeout sweep.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Bound on outstanding pending requests.
    pub fn pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity;
        self
    }

    /// Bus-level produced-event hook.
    pub fn on_message_produced(mut self, hook: ProducedCallback) -> Self {
        self.on_message_produced = Some(hook);
        self
    }

    /// Bus-level consumed-event hook.
    pub fn on_message_consumed(mut self, hook: ConsumedCallback) -> Self {
        self.on_message_consumed = Some(hook);
        self
    }

    /// Copies the parent's declarations and defaults for everything this
    /// builder has not set itself; used when configuring composite children.
    pub fn merge_from(mut self, parent: &MessageBusBuilder) -> Self {
        if !self.format_set && parent.format_set {
            self.format = parent.format;
        }
        if self.resolver.is_none() {
            self.resolver = parent.resolver.clone();
        }
        if self.request_response.is_none() {
            self.request_response = parent.request_response.clone();
        }
        if self.header_modifier.is_none() {
            self.header_modifier = parent.header_modifier.clone();
        }

        let declared: HashSet<TypeId> = self
            .producers
            .iter()
            .map(|producer| producer.message_type().id())
            .collect();
        for producer in &parent.producers {
            if !declared.contains(&producer.message_type().id()) {
                self.producers.push(producer.clone());
            }
        }

        let consumed: HashSet<TypeId> = self
            .consumers
            .iter()
            .map(|consumer| consumer.message_type().id())
            .collect();
        for consumer in &parent.consumers {
            if !consumed.contains(&consumer.message_type().id()) {
                self.consumers.push(consumer.clone());
            }
        }

        self
    }

    /// Validates the declarations and constructs the bus.
    pub async fn build(mut self) -> BusResult<MessageBus> {
        let transport = self
            .transport
            .take()
            .ok_or_else(|| Error::configuration("transport not set"))?;
        let resolver: Arc<dyn DependencyResolver> = self
            .resolver
            .take()
            .unwrap_or_else(|| Arc::new(TypeMap::new()));
        let clock: Arc<dyn Clock> = self
            .clock
            .take()
            .unwrap_or_else(|| Arc::new(SystemClock::new()));

        let mut declared = HashSet::new();
        for producer in &self.producers {
            if !declared.insert(producer.message_type().id()) {
                return Err(Error::configuration(format!(
                    "message type {} declared more than once",
                    producer.message_type()
                )));
            }
        }

        if self.producers.iter().any(ProducerSettings::is_request)
            && self.request_response.is_none()
        {
            return Err(Error::configuration(
                "a request producer is declared but request/response is not configured",
            ));
        }

        for consumer in &self.consumers {
            if consumer.path().is_empty() {
                return Err(Error::configuration(format!(
                    "consumer for message type {} has an empty path",
                    consumer.message_type()
                )));
            }
        }

        // Assemble each consumer's interceptor chain once: discovered links
        // first, registered links after, consumer stage wrapping the
        // handler stage.
        for consumer in &mut self.consumers {
            let key = consumer.message_type().id();
            let mut chain = (consumer.discover_consumer)(resolver.as_ref());
            chain.extend(self.interceptors.consumer_links(key));
            if let Some(discover_handler) = &consumer.discover_handler {
                chain.extend(discover_handler(resolver.as_ref()));
                chain.extend(self.interceptors.handler_links(key));
            }
            consumer.chain = chain;
        }

        let registry = TypeRegistry::new(
            self.producers.into_iter().map(Arc::new).collect(),
            self.consumers.into_iter().map(Arc::new).collect(),
        );
        let pending = Arc::new(PendingRequests::new(clock, self.pending_capacity));

        let settings = BusSettings {
            name: self.name,
            format: self.format,
            request_response: self.request_response,
            per_message_scope: self.per_message_scope,
            auto_start: self.auto_start,
            sweep_interval: self.sweep_interval,
            pending_capacity: self.pending_capacity,
            message_type_resolver: self.message_type_resolver,
            header_modifier: self.header_modifier,
            on_message_produced: self.on_message_produced,
            on_message_consumed: self.on_message_consumed,
        };

        let auto_start = settings.auto_start;
        let inner = Arc::new(BusInner::new(
            settings,
            registry,
            pending,
            transport,
            resolver,
            self.interceptors,
        ));
        let bus = MessageBus::from_inner(inner);

        if auto_start {
            bus.start().await?;
        }

        Ok(bus)
    }
}
