//! Consumer pipeline.
//!
//! Decodes inbound envelopes, runs the consumer/handler interceptor chain,
//! invokes the user consumer, and produces the reply for request messages.
//! Reply-path envelopes are routed straight into the pending-request
//! registry. The structured [`ConsumeOutcome`] tells the transport adapter
//! what happened so it can decide its ack/retry policy.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::BusInner;
use crate::error::{BusResult, Error, ErrorKind};
use crate::headers::{self, HeaderMap};
use crate::interceptor::run_consume_chain;
use crate::message::{AnyMessage, BoxedMessage, BusMessage, MessageType, RequestMessage};
use crate::settings::{ConsumedEvent, ConsumerSettings, RequestResponseSettings};
use crate::transport::IncomingEnvelope;

/// Consume-side context visible to interceptors and consumers.
#[derive(Debug, Clone)]
pub struct ConsumeContext {
    /// Name of the consuming bus.
    pub bus_name: String,
    /// Path the message arrived on.
    pub path: String,
    /// Wire headers of the inbound envelope.
    pub headers: HeaderMap,
    /// The declared consumer type.
    pub message_type: MessageType,
    /// Cooperative cancellation signal, cancelled on bus shutdown.
    pub cancellation: CancellationToken,
}

/// Structured outcome returned to the transport adapter.
#[derive(Debug, Default)]
pub struct ConsumeOutcome {
    /// The failure, if the envelope was not handled cleanly.
    pub error: Option<Error>,
    /// Serialized response bytes, for request messages.
    pub response: Option<Bytes>,
    /// Whether the message reached (or was deliberately filtered before)
    /// its consumer.
    pub consumed: bool,
}

impl ConsumeOutcome {
    pub(crate) fn failed(error: Error) -> Self {
        Self {
            error: Some(error),
            response: None,
            consumed: false,
        }
    }

    pub(crate) fn consumed() -> Self {
        Self {
            error: None,
            response: None,
            consumed: true,
        }
    }
}

/// User consumer for pub/sub messages.
#[async_trait]
pub trait Consumer<M: BusMessage>: Send + Sync + 'static {
    /// Handles one inbound message.
    async fn on_message(&self, message: M, ctx: &ConsumeContext) -> BusResult<()>;
}

/// User handler for request messages; returns the response.
#[async_trait]
pub trait RequestHandler<R: RequestMessage>: Send + Sync + 'static {
    /// Handles one inbound request.
    async fn on_request(&self, request: R, ctx: &ConsumeContext) -> BusResult<R::Response>;
}

/// Type-erased invoker wrapping a user consumer or handler.
#[async_trait]
pub trait ErasedConsumer: Send + Sync {
    /// Invokes the user code; returns the response for handlers.
    async fn invoke(
        &self,
        message: &dyn AnyMessage,
        ctx: &ConsumeContext,
    ) -> BusResult<Option<BoxedMessage>>;
}

pub(crate) struct ConsumerAdapter<M, C> {
    pub(crate) consumer: Arc<C>,
    pub(crate) _marker: std::marker::PhantomData<fn(M)>,
}

#[async_trait]
impl<M, C> ErasedConsumer for ConsumerAdapter<M, C>
where
    M: BusMessage + Clone,
    C: Consumer<M>,
{
    async fn invoke(
        &self,
        message: &dyn AnyMessage,
        ctx: &ConsumeContext,
    ) -> BusResult<Option<BoxedMessage>> {
        let typed = message
            .downcast_ref::<M>()
            .ok_or_else(|| Error::consumer("consumer received a mismatched payload type"))?;
        self.consumer.on_message(typed.clone(), ctx).await?;
        Ok(None)
    }
}

pub(crate) struct HandlerAdapter<R, H> {
    pub(crate) handler: Arc<H>,
    pub(crate) _marker: std::marker::PhantomData<fn(R)>,
}

#[async_trait]
impl<R, H> ErasedConsumer for HandlerAdapter<R, H>
where
    R: RequestMessage + Clone,
    H: RequestHandler<R>,
{
    async fn invoke(
        &self,
        message: &dyn AnyMessage,
        ctx: &ConsumeContext,
    ) -> BusResult<Option<BoxedMessage>> {
        let typed = message
            .downcast_ref::<R>()
            .ok_or_else(|| Error::consumer("handler received a mismatched payload type"))?;
        let response = self.handler.on_request(typed.clone(), ctx).await?;
        Ok(Some(Box::new(response) as BoxedMessage))
    }
}

impl BusInner {
    /// Runs one inbound envelope through the consumer pipeline.
    pub(crate) async fn dispatch_inbound(&self, envelope: IncomingEnvelope) -> ConsumeOutcome {
        if self.is_disposed() {
            return ConsumeOutcome::failed(Error::disposed("bus is disposed"));
        }

        if let Some(rr) = &self.settings.request_response {
            if envelope.path == rr.reply_path {
                return self.handle_reply(&envelope, rr);
            }
        }

        let type_name = envelope
            .headers
            .get_str(headers::MESSAGE_TYPE)
            .and_then(|wire_name| self.settings.message_type_resolver.to_declared(wire_name));
        let settings = match self
            .registry
            .resolve_consumer(type_name.as_deref(), &envelope.path)
        {
            Some(settings) => settings,
            None => {
                return ConsumeOutcome::failed(Error::consumer(format!(
                    "no consumer declared for message type {} on path {}",
                    type_name.as_deref().unwrap_or("<unknown>"),
                    envelope.path
                )));
            }
        };

        let message = match settings.decoder.decode(self.settings.format, &envelope.payload) {
            Ok(message) => message,
            Err(error) => return ConsumeOutcome::failed(error),
        };

        // Per-message scope, released when it drops at the end of dispatch.
        let scope = if self.settings.per_message_scope {
            self.resolver.create_scope()
        } else {
            self.resolver.clone()
        };
        let consumer = match (settings.factory)(scope.as_ref()) {
            Ok(consumer) => consumer,
            Err(error) => return ConsumeOutcome::failed(error),
        };

        let ctx = ConsumeContext {
            bus_name: self.settings.name.clone(),
            path: envelope.path.clone(),
            headers: envelope.headers.clone(),
            message_type: settings.message_type(),
            cancellation: self.shutdown.child_token(),
        };

        let invoker = consumer.clone();
        let message_ref: &dyn AnyMessage = message.as_ref();
        let ctx_ref = &ctx;
        let terminal: BoxFuture<'_, BusResult<Option<BoxedMessage>>> =
            Box::pin(async move { invoker.invoke(message_ref, ctx_ref).await });

        let result = run_consume_chain(&settings.chain, message_ref, &ctx, terminal).await;

        match result {
            Ok(response) => {
                self.fire_consumed_events(&settings, &envelope.path);
                if settings.is_responder() {
                    self.reply_to_request(&settings, &envelope, response).await
                } else {
                    ConsumeOutcome::consumed()
                }
            }
            Err(error) => {
                warn!(
                    bus = %self.settings.name,
                    message_type = %settings.message_type(),
                    %error,
                    "consumer failed"
                );
                if settings.is_responder() {
                    self.reply_with_error(&envelope, &error).await;
                }
                ConsumeOutcome::failed(error)
            }
        }
    }

    /// Completes a pending request from a reply-path envelope.
    fn handle_reply(
        &self,
        envelope: &IncomingEnvelope,
        rr: &RequestResponseSettings,
    ) -> ConsumeOutcome {
        // Expired entries are collected on every inbound reply in addition
        // to the periodic tick.
        self.pending.sweep();

        let correlation_id = match envelope.headers.get_str(&rr.correlation_header) {
            Some(id) => id,
            None => {
                return ConsumeOutcome::failed(Error::consumer(
                    "reply envelope is missing its correlation id",
                ));
            }
        };

        if let Some(message) = envelope.headers.get_str(headers::ERROR_MESSAGE) {
            let kind = envelope
                .headers
                .get_str(headers::ERROR_KIND)
                .and_then(ErrorKind::from_tag)
                .unwrap_or(ErrorKind::Handler);
            let completed = self
                .pending
                .fail(correlation_id, Error::with_context(kind, message.to_string()));
            return ConsumeOutcome {
                error: None,
                response: None,
                consumed: completed,
            };
        }

        match self.pending.take(correlation_id) {
            None => {
                debug!(correlation_id, "reply without a matching pending request");
                ConsumeOutcome::failed(Error::consumer(format!(
                    "no pending request for correlation id {correlation_id}"
                )))
            }
            Some(entry) => match entry.decoder.decode(self.settings.format, &envelope.payload) {
                Ok(value) => {
                    let _ = entry.sink.send(Ok(value));
                    ConsumeOutcome::consumed()
                }
                Err(error) => {
                    let _ = entry.sink.send(Err(error));
                    ConsumeOutcome::failed(Error::serialization(format!(
                        "reply for correlation id {correlation_id} failed to decode"
                    )))
                }
            },
        }
    }

    /// Serializes and produces the response for a handled request.
    async fn reply_to_request(
        &self,
        settings: &ConsumerSettings,
        envelope: &IncomingEnvelope,
        response: Option<BoxedMessage>,
    ) -> ConsumeOutcome {
        let (reply_to, correlation_id) = match self.reply_address(envelope) {
            Some(address) => address,
            None => {
                warn!(
                    bus = %self.settings.name,
                    message_type = %settings.message_type(),
                    "request envelope has no reply address; response dropped"
                );
                return ConsumeOutcome::consumed();
            }
        };

        // An interceptor that filtered the request produced no response;
        // the requester's own timeout covers it.
        let response = match response {
            Some(response) => response,
            None => return ConsumeOutcome::consumed(),
        };

        let payload = match response.encode(self.settings.format) {
            Ok(payload) => payload,
            Err(error) => {
                return ConsumeOutcome {
                    error: Some(error),
                    response: None,
                    consumed: true,
                };
            }
        };

        let mut reply_headers = HeaderMap::new();
        reply_headers.insert(headers::CORRELATION_ID, correlation_id);
        reply_headers.insert(
            headers::MESSAGE_TYPE,
            self.settings
                .message_type_resolver
                .to_name(response.message_type().name()),
        );
        reply_headers.insert(headers::ORIGINATOR, self.settings.name.as_str());

        if let Err(error) = self
            .transport
            .produce(&reply_to, payload.clone(), reply_headers, None)
            .await
        {
            return ConsumeOutcome {
                error: Some(error),
                response: Some(payload),
                consumed: true,
            };
        }

        ConsumeOutcome {
            error: None,
            response: Some(payload),
            consumed: true,
        }
    }

    /// Produces a header-only error reply for a failed request handler.
    async fn reply_with_error(&self, envelope: &IncomingEnvelope, error: &Error) {
        let (reply_to, correlation_id) = match self.reply_address(envelope) {
            Some(address) => address,
            None => return,
        };

        let mut reply_headers = HeaderMap::new();
        reply_headers.insert(headers::CORRELATION_ID, correlation_id);
        reply_headers.insert(headers::ERROR_MESSAGE, error.to_string());
        reply_headers.insert(headers::ERROR_KIND, error.kind().as_str());
        reply_headers.insert(headers::ORIGINATOR, self.settings.name.as_str());

        if let Err(produce_error) = self
            .transport
            .produce(&reply_to, Bytes::new(), reply_headers, None)
            .await
        {
            warn!(%produce_error, "failed to produce error reply");
        }
    }

    fn reply_address(&self, envelope: &IncomingEnvelope) -> Option<(String, String)> {
        let reply_to = envelope.headers.get_str(headers::REPLY_TO)?;
        let correlation_id = envelope.headers.get_str(headers::CORRELATION_ID)?;
        Some((reply_to.to_string(), correlation_id.to_string()))
    }

    fn fire_consumed_events(&self, settings: &ConsumerSettings, path: &str) {
        let event = ConsumedEvent {
            bus_name: &self.settings.name,
            message_type: settings.message_type(),
            path,
        };
        if let Some(hook) = &settings.on_message_consumed {
            hook(&event);
        }
        if let Some(hook) = &self.settings.on_message_consumed {
            hook(&event);
        }
    }
}
