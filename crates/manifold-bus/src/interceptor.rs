//! Ordered middleware around produce and consume.
//!
//! Interceptors compose into a next-call chain around a terminal action.
//! Awaiting [`Next::invoke`] runs the rest of the chain; dropping the `next`
//! without invoking it short-circuits (downstream stages never execute — a
//! publish is not transmitted, a consume never reaches the handler).
//! Producer interceptors are outermost, then the direction-specific
//! publish/send interceptors, then the terminal action. Chains are assembled
//! once per message type and memoised.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::consumer::ConsumeContext;
use crate::error::{BusResult, Error};
use crate::message::{AnyMessage, BoxedMessage, BusMessage, RequestMessage};
use crate::producer::ProduceContext;

/// Continuation of an interceptor chain.
pub struct Next<'a> {
    inner: BoxFuture<'a, BusResult<Option<BoxedMessage>>>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(inner: BoxFuture<'a, BusResult<Option<BoxedMessage>>>) -> Self {
        Self { inner }
    }

    /// Runs the remainder of the chain and returns the downstream value
    /// (`None` for publish/consume stages, the response for send/handle
    /// stages).
    pub async fn invoke(self) -> BusResult<Option<BoxedMessage>> {
        self.inner.await
    }
}

/// Wraps every produce of `M`, publish and send alike.
#[async_trait]
pub trait ProducerInterceptor<M: BusMessage>: Send + Sync + 'static {
    /// Called with the message about to be produced.
    async fn on_handle(
        &self,
        message: &M,
        ctx: &ProduceContext,
        next: Next<'_>,
    ) -> BusResult<Option<BoxedMessage>>;
}

/// Wraps publishes of `M` only.
#[async_trait]
pub trait PublishInterceptor<M: BusMessage>: Send + Sync + 'static {
    /// Called with the message about to be published.
    async fn on_handle(
        &self,
        message: &M,
        ctx: &ProduceContext,
        next: Next<'_>,
    ) -> BusResult<Option<BoxedMessage>>;
}

/// Wraps sends of `R`; the downstream value is the typed response.
#[async_trait]
pub trait SendInterceptor<R: RequestMessage>: Send + Sync + 'static {
    /// Called with the request about to be sent.
    async fn on_handle(
        &self,
        request: &R,
        ctx: &ProduceContext,
        next: Next<'_>,
    ) -> BusResult<Option<BoxedMessage>>;
}

/// Wraps every consume of `M`.
#[async_trait]
pub trait ConsumerInterceptor<M: BusMessage>: Send + Sync + 'static {
    /// Called with the inbound message before the consumer runs.
    async fn on_handle(
        &self,
        message: &M,
        ctx: &ConsumeContext,
        next: Next<'_>,
    ) -> BusResult<Option<BoxedMessage>>;
}

/// Wraps request handling of `R`; the downstream value is the response.
#[async_trait]
pub trait HandlerInterceptor<R: RequestMessage>: Send + Sync + 'static {
    /// Called with the inbound request before the handler runs.
    async fn on_handle(
        &self,
        request: &R,
        ctx: &ConsumeContext,
        next: Next<'_>,
    ) -> BusResult<Option<BoxedMessage>>;
}

/// Type-erased produce-side chain link.
pub(crate) trait ProduceLink: Send + Sync {
    fn handle<'a>(
        &'a self,
        message: &'a dyn AnyMessage,
        ctx: &'a ProduceContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, BusResult<Option<BoxedMessage>>>;
}

/// Type-erased consume-side chain link.
pub(crate) trait ConsumeLink: Send + Sync {
    fn handle<'a>(
        &'a self,
        message: &'a dyn AnyMessage,
        ctx: &'a ConsumeContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, BusResult<Option<BoxedMessage>>>;
}

macro_rules! produce_link_adapter {
    ($adapter:ident, $trait:ident, $bound:ident) => {
        pub(crate) struct $adapter<M: $bound>(pub(crate) Arc<dyn $trait<M>>);

        impl<M: $bound> ProduceLink for $adapter<M> {
            fn handle<'a>(
                &'a self,
                message: &'a dyn AnyMessage,
                ctx: &'a ProduceContext,
                next: Next<'a>,
            ) -> BoxFuture<'a, BusResult<Option<BoxedMessage>>> {
                Box::pin(async move {
                    let typed = message.as_any().downcast_ref::<M>().ok_or_else(|| {
                        Error::producer(format!(
                            "interceptor for {} received a mismatched message",
                            std::any::type_name::<M>()
                        ))
                    })?;
                    self.0.on_handle(typed, ctx, next).await
                })
            }
        }
    };
}

macro_rules! consume_link_adapter {
    ($adapter:ident, $trait:ident, $bound:ident) => {
        pub(crate) struct $adapter<M: $bound>(pub(crate) Arc<dyn $trait<M>>);

        impl<M: $bound> ConsumeLink for $adapter<M> {
            fn handle<'a>(
                &'a self,
                message: &'a dyn AnyMessage,
                ctx: &'a ConsumeContext,
                next: Next<'a>,
            ) -> BoxFuture<'a, BusResult<Option<BoxedMessage>>> {
                Box::pin(async move {
                    let typed = message.as_any().downcast_ref::<M>().ok_or_else(|| {
                        Error::consumer(format!(
                            "interceptor for {} received a mismatched message",
                            std::any::type_name::<M>()
                        ))
                    })?;
                    self.0.on_handle(typed, ctx, next).await
                })
            }
        }
    };
}

produce_link_adapter!(ProducerLinkAdapter, ProducerInterceptor, BusMessage);
produce_link_adapter!(PublishLinkAdapter, PublishInterceptor, BusMessage);
produce_link_adapter!(SendLinkAdapter, SendInterceptor, RequestMessage);
consume_link_adapter!(ConsumerLinkAdapter, ConsumerInterceptor, BusMessage);
consume_link_adapter!(HandlerLinkAdapter, HandlerInterceptor, RequestMessage);

/// Per-type interceptor registrations, erased at registration time.
#[derive(Default)]
pub(crate) struct InterceptorRegistry {
    pub producer: HashMap<TypeId, Vec<Arc<dyn ProduceLink>>>,
    pub publish: HashMap<TypeId, Vec<Arc<dyn ProduceLink>>>,
    pub send: HashMap<TypeId, Vec<Arc<dyn ProduceLink>>>,
    pub consumer: HashMap<TypeId, Vec<Arc<dyn ConsumeLink>>>,
    pub handler: HashMap<TypeId, Vec<Arc<dyn ConsumeLink>>>,
}

impl InterceptorRegistry {
    fn links_for(
        map: &HashMap<TypeId, Vec<Arc<dyn ProduceLink>>>,
        key: TypeId,
    ) -> Vec<Arc<dyn ProduceLink>> {
        map.get(&key).cloned().unwrap_or_default()
    }

    pub(crate) fn producer_links(&self, key: TypeId) -> Vec<Arc<dyn ProduceLink>> {
        Self::links_for(&self.producer, key)
    }

    pub(crate) fn publish_links(&self, key: TypeId) -> Vec<Arc<dyn ProduceLink>> {
        Self::links_for(&self.publish, key)
    }

    pub(crate) fn send_links(&self, key: TypeId) -> Vec<Arc<dyn ProduceLink>> {
        Self::links_for(&self.send, key)
    }

    pub(crate) fn consumer_links(&self, key: TypeId) -> Vec<Arc<dyn ConsumeLink>> {
        self.consumer.get(&key).cloned().unwrap_or_default()
    }

    pub(crate) fn handler_links(&self, key: TypeId) -> Vec<Arc<dyn ConsumeLink>> {
        self.handler.get(&key).cloned().unwrap_or_default()
    }
}

/// Runs a produce-side chain around a terminal action.
pub(crate) fn run_produce_chain<'a>(
    links: &'a [Arc<dyn ProduceLink>],
    message: &'a dyn AnyMessage,
    ctx: &'a ProduceContext,
    terminal: BoxFuture<'a, BusResult<Option<BoxedMessage>>>,
) -> BoxFuture<'a, BusResult<Option<BoxedMessage>>> {
    match links.split_first() {
        None => terminal,
        Some((head, rest)) => {
            let next = Next::new(run_produce_chain(rest, message, ctx, terminal));
            head.handle(message, ctx, next)
        }
    }
}

/// Runs a consume-side chain around a terminal action.
pub(crate) fn run_consume_chain<'a>(
    links: &'a [Arc<dyn ConsumeLink>],
    message: &'a dyn AnyMessage,
    ctx: &'a ConsumeContext,
    terminal: BoxFuture<'a, BusResult<Option<BoxedMessage>>>,
) -> BoxFuture<'a, BusResult<Option<BoxedMessage>>> {
    match links.split_first() {
        None => terminal,
        Some((head, rest)) => {
            let next = Next::new(run_consume_chain(rest, message, ctx, terminal));
            head.handle(message, ctx, next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use crate::message::MessageType;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }
    crate::bus_message!(Ping);

    struct Counting {
        calls: Arc<AtomicUsize>,
        call_next: bool,
    }

    #[async_trait]
    impl ProducerInterceptor<Ping> for Counting {
        async fn on_handle(
            &self,
            _message: &Ping,
            _ctx: &ProduceContext,
            next: Next<'_>,
        ) -> BusResult<Option<BoxedMessage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.call_next {
                next.invoke().await
            } else {
                Ok(None)
            }
        }
    }

    fn test_ctx() -> ProduceContext {
        ProduceContext {
            bus_name: "test".into(),
            declared_type: MessageType::of::<Ping>(),
            runtime_type: MessageType::of::<Ping>(),
            path: "pings".into(),
            headers: crate::headers::HeaderMap::new(),
            is_request: false,
            cancellation: CancellationToken::new(),
        }
    }

    fn chain_of(interceptors: Vec<Counting>) -> Vec<Arc<dyn ProduceLink>> {
        interceptors
            .into_iter()
            .map(|i| {
                Arc::new(ProducerLinkAdapter::<Ping>(Arc::new(i))) as Arc<dyn ProduceLink>
            })
            .collect()
    }

    #[tokio::test]
    async fn chain_runs_in_order_down_to_the_terminal() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let terminal_runs = Arc::new(AtomicUsize::new(0));

        let links = chain_of(vec![
            Counting {
                calls: first.clone(),
                call_next: true,
            },
            Counting {
                calls: second.clone(),
                call_next: true,
            },
        ]);

        let message = Ping { n: 1 };
        let ctx = test_ctx();
        let terminal_counter = terminal_runs.clone();
        let terminal: BoxFuture<'_, BusResult<Option<BoxedMessage>>> = Box::pin(async move {
            terminal_counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });

        let result = run_produce_chain(&links, &message, &ctx, terminal)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(terminal_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_next_short_circuits_downstream() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let terminal_runs = Arc::new(AtomicUsize::new(0));

        let links = chain_of(vec![
            Counting {
                calls: first.clone(),
                call_next: false,
            },
            Counting {
                calls: second.clone(),
                call_next: true,
            },
        ]);

        let message = Ping { n: 1 };
        let ctx = test_ctx();
        let terminal_counter = terminal_runs.clone();
        let terminal: BoxFuture<'_, BusResult<Option<BoxedMessage>>> = Box::pin(async move {
            terminal_counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });

        run_produce_chain(&links, &message, &ctx, terminal)
            .await
            .unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(terminal_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn interceptor_error_aborts_the_chain() {
        struct Failing;

        #[async_trait]
        impl ProducerInterceptor<Ping> for Failing {
            async fn on_handle(
                &self,
                _message: &Ping,
                _ctx: &ProduceContext,
                _next: Next<'_>,
            ) -> BusResult<Option<BoxedMessage>> {
                Err(Error::handler("interceptor refused the message"))
            }
        }

        let links: Vec<Arc<dyn ProduceLink>> =
            vec![Arc::new(ProducerLinkAdapter::<Ping>(Arc::new(Failing)))];
        let message = Ping { n: 1 };
        let ctx = test_ctx();
        let terminal: BoxFuture<'_, BusResult<Option<BoxedMessage>>> =
            Box::pin(async move { Ok(None) });

        let err = run_produce_chain(&links, &message, &ctx, terminal)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Handler);
    }
}
