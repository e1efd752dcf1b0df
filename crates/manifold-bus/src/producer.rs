//! Producer pipeline.
//!
//! Resolves producer settings (polymorphic base-type fallback included),
//! builds outbound headers, runs the interceptor chain and hands the encoded
//! envelope to the transport. Sends additionally register a pending request
//! before producing and await the correlated reply inside the terminal
//! action, so send interceptors observe the typed response.

use std::any::TypeId;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::bus::BusInner;
use crate::error::{BusResult, Error};
use crate::headers::{self, HeaderMap};
use crate::interceptor::{run_produce_chain, ProduceLink};
use crate::message::{AnyMessage, BoxedMessage, MessageType};
use crate::pending::ReplySlot;
use crate::settings::{ProducedEvent, ProducerSettings};

/// Produce-side context visible to interceptors.
#[derive(Debug, Clone)]
pub struct ProduceContext {
    /// Name of the producing bus.
    pub bus_name: String,
    /// The declared producer type the settings were resolved for.
    pub declared_type: MessageType,
    /// The runtime type of the value being produced.
    pub runtime_type: MessageType,
    /// Effective destination path.
    pub path: String,
    /// Outbound headers, finalized before the chain runs.
    pub headers: HeaderMap,
    /// Whether this produce is a request send.
    pub is_request: bool,
    /// Cooperative cancellation signal.
    pub cancellation: CancellationToken,
}

/// Caller-side options for a publish.
#[derive(Clone, Default)]
pub struct PublishOptions {
    /// Overrides the producer's default path.
    pub path: Option<String>,
    /// Initial outbound headers.
    pub headers: Option<HeaderMap>,
    /// Cancellation signal; defaults to a bus-scoped token.
    pub cancellation: Option<CancellationToken>,
}

/// Caller-side options for a send.
#[derive(Clone, Default)]
pub struct SendOptions {
    /// Overrides the producer's default path.
    pub path: Option<String>,
    /// Initial outbound headers.
    pub headers: Option<HeaderMap>,
    /// Overrides the producer and bus default timeouts.
    pub timeout: Option<Duration>,
    /// Cancellation signal; defaults to a bus-scoped token.
    pub cancellation: Option<CancellationToken>,
}

impl BusInner {
    /// Publishes a type-erased message.
    pub(crate) async fn publish_boxed(
        &self,
        message: BoxedMessage,
        options: PublishOptions,
    ) -> BusResult<()> {
        self.ensure_live()?;

        let runtime_type = message.message_type();
        let ancestry = message.ancestry();
        let settings = self.registry.resolve_producer(runtime_type, &ancestry)?;
        let path = self.effective_path(options.path, &settings)?;

        let mut header_map = options.headers.unwrap_or_default();
        self.apply_outbound_headers(&mut header_map, settings.message_type());

        let ctx = ProduceContext {
            bus_name: self.settings.name.clone(),
            declared_type: settings.message_type(),
            runtime_type,
            path,
            headers: header_map,
            is_request: false,
            cancellation: options
                .cancellation
                .unwrap_or_else(|| self.shutdown.child_token()),
        };

        let chain = self.publish_chain_for(runtime_type.id(), &settings);
        let message_ref: &dyn AnyMessage = message.as_ref();
        let ctx_ref = &ctx;
        let settings_ref = &settings;
        let inner = self;
        let terminal: BoxFuture<'_, BusResult<Option<BoxedMessage>>> = Box::pin(async move {
            let payload = message_ref.encode(inner.settings.format)?;
            inner
                .transport
                .produce(
                    &ctx_ref.path,
                    payload,
                    ctx_ref.headers.clone(),
                    Some(settings_ref.attachments()),
                )
                .await?;
            inner.fire_produced_events(settings_ref, ctx_ref);
            Ok(None)
        });

        run_produce_chain(&chain, message_ref, &ctx, terminal).await?;
        Ok(())
    }

    /// Sends a type-erased request and awaits its correlated reply.
    pub(crate) async fn send_boxed(
        &self,
        message: BoxedMessage,
        options: SendOptions,
    ) -> BusResult<BoxedMessage> {
        self.ensure_live()?;

        let runtime_type = message.message_type();
        let ancestry = message.ancestry();
        let settings = self.registry.resolve_producer(runtime_type, &ancestry)?;
        let response_decoder = settings.response_decoder.clone().ok_or_else(|| {
            Error::producer(format!(
                "{runtime_type} is not declared as a request producer"
            ))
        })?;
        let rr = self.settings.request_response.as_ref().ok_or_else(|| {
            Error::configuration("request/response is not configured on this bus")
        })?;

        let path = self.effective_path(options.path, &settings)?;
        let timeout = options
            .timeout
            .or_else(|| settings.default_timeout())
            .unwrap_or(rr.default_timeout);
        let cancellation = options
            .cancellation
            .unwrap_or_else(|| self.shutdown.child_token());

        // A signal observed before dispatch must not leak a pending entry.
        if cancellation.is_cancelled() {
            return Err(Error::cancelled(format!(
                "send of {runtime_type} cancelled before dispatch"
            )));
        }

        let correlation_id = Uuid::new_v4().to_string();
        let mut header_map = options.headers.unwrap_or_default();
        self.apply_outbound_headers(&mut header_map, settings.message_type());
        header_map.insert(rr.correlation_header.clone(), correlation_id.as_str());
        header_map.insert(headers::REPLY_TO, rr.reply_path.as_str());
        header_map.insert(rr.originator_header.clone(), self.settings.name.as_str());
        header_map.insert(headers::EXPIRES, expiry_epoch_ms(timeout));

        let ctx = ProduceContext {
            bus_name: self.settings.name.clone(),
            declared_type: settings.message_type(),
            runtime_type,
            path,
            headers: header_map,
            is_request: true,
            cancellation: cancellation.clone(),
        };

        let slot = self
            .pending
            .register(&correlation_id, timeout, runtime_type, response_decoder)?;
        debug!(
            bus = %self.settings.name,
            message_type = %runtime_type,
            correlation_id = %correlation_id,
            "registered pending request"
        );

        let chain = self.send_chain_for(runtime_type.id(), &settings);
        let message_ref: &dyn AnyMessage = message.as_ref();
        let ctx_ref = &ctx;
        let settings_ref = &settings;
        let inner = self;
        let terminal_correlation = correlation_id.clone();
        let terminal_cancellation = cancellation.clone();
        let terminal: BoxFuture<'_, BusResult<Option<BoxedMessage>>> = Box::pin(async move {
            let payload = message_ref.encode(inner.settings.format)?;
            if let Err(error) = inner
                .transport
                .produce(
                    &ctx_ref.path,
                    payload,
                    ctx_ref.headers.clone(),
                    Some(settings_ref.attachments()),
                )
                .await
            {
                // The pending entry is unregistered immediately with the
                // transport error.
                inner.pending.take(&terminal_correlation);
                return Err(error);
            }
            inner.fire_produced_events(settings_ref, ctx_ref);
            let value = inner
                .await_reply(slot, &terminal_correlation, terminal_cancellation)
                .await?;
            Ok(Some(value))
        });

        let result = run_produce_chain(&chain, message_ref, &ctx, terminal).await;
        match result {
            Ok(Some(response)) => Ok(response),
            Ok(None) => {
                // The chain never reached the terminal action.
                self.pending.take(&correlation_id);
                Err(Error::producer(format!(
                    "send of {runtime_type} was short-circuited by an interceptor"
                )))
            }
            Err(error) => {
                self.pending.take(&correlation_id);
                Err(error)
            }
        }
    }

    /// Awaits the correlated reply, racing the caller's cancellation.
    /// Removal from the registry decides the terminal transition; whichever
    /// side loses the race becomes a no-op.
    async fn await_reply(
        &self,
        mut slot: ReplySlot,
        correlation_id: &str,
        cancellation: CancellationToken,
    ) -> BusResult<BoxedMessage> {
        tokio::select! {
            biased;
            () = cancellation.cancelled() => {
                if self.pending.take(correlation_id).is_some() {
                    return Err(Error::cancelled(format!(
                        "request {correlation_id} cancelled by caller"
                    )));
                }
                // The entry already went through its terminal transition;
                // surface that result instead.
                match slot.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::cancelled(format!(
                        "request {correlation_id} cancelled by caller"
                    ))),
                }
            }
            result = &mut slot => match result {
                Ok(result) => result,
                Err(_) => Err(Error::disposed(format!(
                    "waiter for request {correlation_id} was dropped"
                ))),
            }
        }
    }

    fn effective_path(
        &self,
        caller_path: Option<String>,
        settings: &ProducerSettings,
    ) -> BusResult<String> {
        caller_path
            .or_else(|| settings.default_path().map(str::to_string))
            .filter(|path| !path.is_empty())
            .ok_or_else(|| {
                Error::configuration(format!(
                    "no path declared or supplied for message type {}",
                    settings.message_type()
                ))
            })
    }

    fn apply_outbound_headers(&self, header_map: &mut HeaderMap, declared_type: MessageType) {
        if let Some(modifier) = &self.settings.header_modifier {
            modifier(header_map, declared_type);
        }
        header_map.insert(
            headers::MESSAGE_TYPE,
            self.settings
                .message_type_resolver
                .to_name(declared_type.name()),
        );
        header_map.insert(headers::ORIGINATOR, self.settings.name.as_str());
    }

    fn fire_produced_events(&self, settings: &ProducerSettings, ctx: &ProduceContext) {
        let event = ProducedEvent {
            bus_name: &ctx.bus_name,
            declared_type: ctx.declared_type,
            runtime_type: ctx.runtime_type,
            path: &ctx.path,
        };
        if let Some(hook) = &settings.on_message_produced {
            hook(&event);
        }
        if let Some(hook) = &self.settings.on_message_produced {
            hook(&event);
        }
    }

    /// Publish chain for a runtime type: discovered links (when the type is
    /// itself declared), then registered links; producer stage outermost.
    fn publish_chain_for(
        &self,
        runtime_id: TypeId,
        settings: &ProducerSettings,
    ) -> Arc<Vec<Arc<dyn ProduceLink>>> {
        if let Some(chain) = self.publish_chains.read().get(&runtime_id) {
            return chain.clone();
        }

        let discovered = if settings.message_type().id() == runtime_id {
            (settings.discover)(self.resolver.as_ref())
        } else {
            Default::default()
        };

        let mut links = Vec::new();
        links.extend(discovered.producer);
        links.extend(self.interceptors.producer_links(runtime_id));
        links.extend(discovered.publish);
        links.extend(self.interceptors.publish_links(runtime_id));

        let chain = Arc::new(links);
        self.publish_chains.write().insert(runtime_id, chain.clone());
        chain
    }

    /// Send chain for a runtime type; same layering with the send stage.
    fn send_chain_for(
        &self,
        runtime_id: TypeId,
        settings: &ProducerSettings,
    ) -> Arc<Vec<Arc<dyn ProduceLink>>> {
        if let Some(chain) = self.send_chains.read().get(&runtime_id) {
            return chain.clone();
        }

        let discovered = if settings.message_type().id() == runtime_id {
            (settings.discover)(self.resolver.as_ref())
        } else {
            Default::default()
        };

        let mut links = Vec::new();
        links.extend(discovered.producer);
        links.extend(self.interceptors.producer_links(runtime_id));
        links.extend(discovered.send);
        links.extend(self.interceptors.send_links(runtime_id));

        let chain = Arc::new(links);
        self.send_chains.write().insert(runtime_id, chain.clone());
        chain
    }
}

fn expiry_epoch_ms(timeout: Duration) -> i64 {
    let expiry = SystemTime::now() + timeout;
    expiry
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as i64)
        .unwrap_or_default()
}
