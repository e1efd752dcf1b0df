//! Composite-router behaviour over mock and real child buses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use manifold_bus::{
    bus_message, Bus, BusResult, ConsumeContext, ConsumerConfig, Error, ErrorKind,
    MessageBusBuilder, MessageType, ProducerConfig, ProducerDescriptor, PublishOptions,
    RequestHandler, RequestResponseSettings, SendOptions,
};
use manifold_bus::{BoxedMessage, BusMessage, Consumer};
use manifold_hybrid::{HybridBusBuilder, PublishExecutionMode};
use manifold_memory::MemoryTransport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SomeMessage {
    seq: u32,
}
bus_message!(SomeMessage);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SomeDerivedMessage {
    seq: u32,
}
bus_message!(SomeDerivedMessage, parent = SomeMessage);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResponseX {
    id: String,
}
bus_message!(ResponseX);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RequestX {
    id: String,
}
bus_message!(RequestX, response = ResponseX);

/// A scripted child bus recording what reaches it.
struct MockBus {
    name: String,
    descriptors: Vec<ProducerDescriptor>,
    publish_latency: Duration,
    fail_publish: bool,
    published: Mutex<Vec<&'static str>>,
    started: AtomicBool,
    dispose_order: Arc<Mutex<Vec<String>>>,
}

impl MockBus {
    fn bare(name: &str, descriptors: Vec<ProducerDescriptor>) -> Self {
        Self {
            name: name.to_string(),
            descriptors,
            publish_latency: Duration::ZERO,
            fail_publish: false,
            published: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            dispose_order: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn new(name: &str, descriptors: Vec<ProducerDescriptor>) -> Arc<Self> {
        Arc::new(Self::bare(name, descriptors))
    }

    fn with_latency(
        name: &str,
        descriptors: Vec<ProducerDescriptor>,
        latency: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            publish_latency: latency,
            ..Self::bare(name, descriptors)
        })
    }

    fn failing(name: &str, descriptors: Vec<ProducerDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            fail_publish: true,
            ..Self::bare(name, descriptors)
        })
    }

    fn with_dispose_recorder(
        name: &str,
        descriptors: Vec<ProducerDescriptor>,
        recorder: Arc<Mutex<Vec<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispose_order: recorder,
            ..Self::bare(name, descriptors)
        })
    }
}

fn publish_descriptor<M: BusMessage>(polymorphic: bool) -> ProducerDescriptor {
    ProducerDescriptor {
        message_type: MessageType::of::<M>(),
        is_request: false,
        polymorphic,
    }
}

fn request_descriptor<M: BusMessage>() -> ProducerDescriptor {
    ProducerDescriptor {
        message_type: MessageType::of::<M>(),
        is_request: true,
        polymorphic: false,
    }
}

#[async_trait]
impl Bus for MockBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> BusResult<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> BusResult<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn dispose(&self) -> BusResult<()> {
        self.dispose_order.lock().push(self.name.clone());
        Ok(())
    }

    fn producers(&self) -> Vec<ProducerDescriptor> {
        self.descriptors.clone()
    }

    async fn publish_boxed(
        &self,
        message: BoxedMessage,
        _options: PublishOptions,
    ) -> BusResult<()> {
        if !self.publish_latency.is_zero() {
            tokio::time::sleep(self.publish_latency).await;
        }
        if self.fail_publish {
            return Err(Error::transport(format!("{} rejected the publish", self.name)));
        }
        self.published.lock().push(message.message_type().name());
        Ok(())
    }

    async fn send_boxed(
        &self,
        message: BoxedMessage,
        _options: SendOptions,
    ) -> BusResult<BoxedMessage> {
        let request = message
            .downcast::<RequestX>()
            .ok_or_else(|| Error::producer("mock only answers RequestX"))?;
        Ok(Box::new(ResponseX { id: request.id }))
    }
}

#[tokio::test]
async fn duplicate_request_producer_is_rejected_naming_the_type() {
    let left = MockBus::new("left", vec![request_descriptor::<RequestX>()]);
    let right = MockBus::new("right", vec![request_descriptor::<RequestX>()]);

    let err = HybridBusBuilder::new()
        .add_child_bus("left", left)
        .add_child_bus("right", right)
        .build()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("RequestX"));
}

#[tokio::test]
async fn duplicate_child_name_is_rejected() {
    let a = MockBus::new("same", vec![publish_descriptor::<SomeMessage>(true)]);
    let b = MockBus::new("same", vec![publish_descriptor::<RequestX>(true)]);

    let err = HybridBusBuilder::new()
        .add_child_bus("same", a)
        .add_child_bus("same", b)
        .build()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn unrouted_type_fails_with_configuration() {
    let child = MockBus::new("only", vec![publish_descriptor::<RequestX>(false)]);
    let hybrid = HybridBusBuilder::new()
        .add_child_bus("only", child)
        .build()
        .unwrap();

    let err = hybrid.publish(SomeMessage { seq: 1 }).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn derived_types_route_through_a_polymorphic_base_producer() {
    let child = MockBus::new("events", vec![publish_descriptor::<SomeMessage>(true)]);
    let hybrid = HybridBusBuilder::new()
        .add_child_bus("events", child.clone())
        .build()
        .unwrap();

    hybrid.publish(SomeDerivedMessage { seq: 1 }).await.unwrap();
    assert_eq!(*child.published.lock(), vec!["SomeDerivedMessage"]);
}

#[tokio::test(start_paused = true)]
async fn parallel_fanout_completes_in_max_of_latencies() {
    let slow = MockBus::with_latency(
        "slow",
        vec![publish_descriptor::<SomeMessage>(true)],
        Duration::from_millis(50),
    );
    let slower = MockBus::with_latency(
        "slower",
        vec![publish_descriptor::<SomeMessage>(true)],
        Duration::from_millis(50),
    );

    let hybrid = HybridBusBuilder::new()
        .add_child_bus("slow", slow.clone())
        .add_child_bus("slower", slower.clone())
        .publish_execution_mode(PublishExecutionMode::Parallel)
        .build()
        .unwrap();

    let begin = tokio::time::Instant::now();
    hybrid.publish(SomeMessage { seq: 1 }).await.unwrap();
    let elapsed = begin.elapsed();

    assert!(elapsed < Duration::from_millis(90), "took {elapsed:?}");
    assert_eq!(slow.published.lock().len(), 1);
    assert_eq!(slower.published.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn sequential_fanout_sums_latencies_and_preserves_order() {
    let first = MockBus::with_latency(
        "first",
        vec![publish_descriptor::<SomeMessage>(true)],
        Duration::from_millis(50),
    );
    let second = MockBus::with_latency(
        "second",
        vec![publish_descriptor::<SomeMessage>(true)],
        Duration::from_millis(50),
    );

    let hybrid = HybridBusBuilder::new()
        .add_child_bus("first", first.clone())
        .add_child_bus("second", second.clone())
        .publish_execution_mode(PublishExecutionMode::Sequential)
        .build()
        .unwrap();

    let begin = tokio::time::Instant::now();
    hybrid.publish(SomeMessage { seq: 1 }).await.unwrap();
    let elapsed = begin.elapsed();

    assert!(elapsed >= Duration::from_millis(100), "took {elapsed:?}");
}

#[tokio::test]
async fn sequential_fanout_aborts_on_first_failure() {
    let failing = MockBus::failing("failing", vec![publish_descriptor::<SomeMessage>(true)]);
    let untouched = MockBus::new("untouched", vec![publish_descriptor::<SomeMessage>(true)]);

    let hybrid = HybridBusBuilder::new()
        .add_child_bus("failing", failing)
        .add_child_bus("untouched", untouched.clone())
        .publish_execution_mode(PublishExecutionMode::Sequential)
        .build()
        .unwrap();

    let err = hybrid.publish(SomeMessage { seq: 1 }).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(untouched.published.lock().is_empty());
}

#[tokio::test]
async fn parallel_fanout_surfaces_a_failure_after_all_complete() {
    let failing = MockBus::failing("failing", vec![publish_descriptor::<SomeMessage>(true)]);
    let healthy = MockBus::new("healthy", vec![publish_descriptor::<SomeMessage>(true)]);

    let hybrid = HybridBusBuilder::new()
        .add_child_bus("failing", failing)
        .add_child_bus("healthy", healthy.clone())
        .publish_execution_mode(PublishExecutionMode::Parallel)
        .build()
        .unwrap();

    let err = hybrid.publish(SomeMessage { seq: 1 }).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    // The healthy child still saw the message.
    assert_eq!(healthy.published.lock().len(), 1);
}

#[tokio::test]
async fn send_routes_to_the_sole_owner() {
    let owner = MockBus::new("owner", vec![request_descriptor::<RequestX>()]);
    let other = MockBus::new("other", vec![publish_descriptor::<SomeMessage>(true)]);

    let hybrid = HybridBusBuilder::new()
        .add_child_bus("owner", owner)
        .add_child_bus("other", other)
        .build()
        .unwrap();

    let response = hybrid.send(RequestX { id: "x".into() }).await.unwrap();
    assert_eq!(response.id, "x");
}

#[tokio::test]
async fn lifecycle_fans_out_and_dispose_walks_in_reverse_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let a = MockBus::with_dispose_recorder(
        "a",
        vec![publish_descriptor::<SomeMessage>(true)],
        order.clone(),
    );
    let b = MockBus::with_dispose_recorder(
        "b",
        vec![publish_descriptor::<RequestX>(true)],
        order.clone(),
    );

    let hybrid = HybridBusBuilder::new()
        .add_child_bus("a", a.clone())
        .add_child_bus("b", b.clone())
        .build()
        .unwrap();

    assert!(!hybrid.is_started());
    hybrid.start().await.unwrap();
    assert!(hybrid.is_started());
    hybrid.stop().await.unwrap();
    assert!(!hybrid.is_started());

    hybrid.dispose().await.unwrap();
    hybrid.dispose().await.unwrap();
    assert_eq!(*order.lock(), vec!["b".to_string(), "a".to_string()]);

    let err = hybrid.publish(SomeMessage { seq: 1 }).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Disposed);
}

// Real children: one memory bus carrying events, another carrying requests.

#[derive(Default)]
struct CountingConsumer {
    seen: Mutex<Vec<SomeMessage>>,
}

#[async_trait]
impl Consumer<SomeMessage> for CountingConsumer {
    async fn on_message(&self, message: SomeMessage, _ctx: &ConsumeContext) -> BusResult<()> {
        self.seen.lock().push(message);
        Ok(())
    }
}

struct EchoHandler;

#[async_trait]
impl RequestHandler<RequestX> for EchoHandler {
    async fn on_request(&self, request: RequestX, _ctx: &ConsumeContext) -> BusResult<ResponseX> {
        Ok(ResponseX { id: request.id })
    }
}

#[tokio::test]
async fn federates_two_real_memory_buses() {
    let consumer = Arc::new(CountingConsumer::default());

    let events_bus = MessageBusBuilder::new("events")
        .produce::<SomeMessage>(ProducerConfig::new("some-messages"))
        .consume::<SomeMessage, _>(consumer.clone(), ConsumerConfig::new("some-messages"))
        .with_transport(Arc::new(MemoryTransport::default()))
        .build()
        .await
        .unwrap();

    let requests_bus = MessageBusBuilder::new("requests")
        .produce_request::<RequestX>(ProducerConfig::new("requests-x"))
        .handle::<RequestX, _>(Arc::new(EchoHandler), ConsumerConfig::new("requests-x"))
        .expect_request_responses(RequestResponseSettings::new("replies"))
        .with_transport(Arc::new(MemoryTransport::default()))
        .build()
        .await
        .unwrap();

    let hybrid = HybridBusBuilder::new()
        .add_child_bus("events", Arc::new(events_bus))
        .add_child_bus("requests", Arc::new(requests_bus))
        .build()
        .unwrap();

    hybrid.start().await.unwrap();

    hybrid.publish(SomeMessage { seq: 7 }).await.unwrap();
    let response = hybrid.send(RequestX { id: "42".into() }).await.unwrap();
    assert_eq!(response.id, "42");

    for _ in 0..400 {
        if !consumer.seen.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(consumer.seen.lock()[0].seq, 7);

    hybrid.dispose().await.unwrap();
}
