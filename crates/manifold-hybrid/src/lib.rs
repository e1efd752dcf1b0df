//! Composite router multiplexing one logical bus over N child buses.
//!
//! At construction the producers of every child are collected and grouped by
//! message type. Publishes fan out to every declaring child (in parallel or
//! sequentially, per policy); a request type must be declared by exactly one
//! child, so sends route to its sole owner. Children are started explicitly
//! by [`HybridBus::start`] and disposed in reverse creation order with
//! per-child error isolation.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info, warn};

use manifold_bus::{
    Bus, BusMessage, BusResult, Error, MessageType, ProducerDescriptor, PublishOptions,
    RequestMessage, SendOptions,
};

/// Fan-out policy for publishes routed to more than one child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PublishExecutionMode {
    /// Await all children concurrently; a failure surfaces once all
    /// complete.
    #[default]
    Parallel,
    /// Iterate children in declaration order; the first failure aborts the
    /// remainder.
    Sequential,
}

struct Route {
    /// Child index plus the descriptor that put it in this group.
    targets: Vec<(usize, ProducerDescriptor)>,
}

/// Builder for a [`HybridBus`].
#[derive(Default)]
pub struct HybridBusBuilder {
    children: Vec<(String, Arc<dyn Bus>)>,
    mode: PublishExecutionMode,
}

impl HybridBusBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named child bus. Children keep their creation order for
    /// lifecycle and disposal.
    pub fn add_child_bus(mut self, name: impl Into<String>, bus: Arc<dyn Bus>) -> Self {
        self.children.push((name.into(), bus));
        self
    }

    /// Fan-out policy for multi-child publishes.
    pub fn publish_execution_mode(mut self, mode: PublishExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Validates the composition and builds the router.
    pub fn build(self) -> BusResult<HybridBus> {
        if self.children.is_empty() {
            return Err(Error::configuration("hybrid bus has no child buses"));
        }

        let mut seen_names = std::collections::HashSet::new();
        for (name, _) in &self.children {
            if !seen_names.insert(name.clone()) {
                return Err(Error::configuration(format!(
                    "child bus name {name} added more than once"
                )));
            }
        }

        let mut routes: HashMap<TypeId, Route> = HashMap::new();
        let mut names: HashMap<TypeId, MessageType> = HashMap::new();
        for (index, (_, bus)) in self.children.iter().enumerate() {
            for descriptor in bus.producers() {
                names.insert(descriptor.message_type.id(), descriptor.message_type);
                routes
                    .entry(descriptor.message_type.id())
                    .or_insert_with(|| Route {
                        targets: Vec::new(),
                    })
                    .targets
                    .push((index, descriptor));
            }
        }

        // A request type must have exactly one owner across the composite.
        for (type_id, route) in &routes {
            let is_request = route
                .targets
                .iter()
                .any(|(_, descriptor)| descriptor.is_request);
            if is_request && route.targets.len() > 1 {
                let message_type = names[type_id];
                return Err(Error::configuration(format!(
                    "request message type {message_type} is declared by multiple child buses"
                )));
            }
        }

        Ok(HybridBus {
            children: self.children,
            routes,
            mode: self.mode,
            disposed: AtomicBool::new(false),
        })
    }
}

/// One logical bus federating multiple child buses.
pub struct HybridBus {
    children: Vec<(String, Arc<dyn Bus>)>,
    /// Immutable after construction.
    routes: HashMap<TypeId, Route>,
    mode: PublishExecutionMode,
    disposed: AtomicBool,
}

impl HybridBus {
    /// The configured fan-out policy.
    pub fn publish_execution_mode(&self) -> PublishExecutionMode {
        self.mode
    }

    /// Child bus names in creation order.
    pub fn child_names(&self) -> Vec<&str> {
        self.children.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn ensure_live(&self) -> BusResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(Error::disposed("hybrid bus is disposed"))
        } else {
            Ok(())
        }
    }

    /// Resolves the child buses a message type routes to,
    /// inheritance-aware.
    fn route(
        &self,
        runtime_type: MessageType,
        ancestry: &[MessageType],
    ) -> BusResult<Vec<Arc<dyn Bus>>> {
        if let Some(route) = self.routes.get(&runtime_type.id()) {
            return Ok(route
                .targets
                .iter()
                .map(|(index, _)| self.children[*index].1.clone())
                .collect());
        }

        for ancestor in ancestry {
            if let Some(route) = self.routes.get(&ancestor.id()) {
                let buses: Vec<Arc<dyn Bus>> = route
                    .targets
                    .iter()
                    .filter(|(_, descriptor)| descriptor.polymorphic)
                    .map(|(index, _)| self.children[*index].1.clone())
                    .collect();
                if !buses.is_empty() {
                    return Ok(buses);
                }
            }
        }

        Err(Error::configuration(format!(
            "no child bus declares a producer for message type {runtime_type}"
        )))
    }

    /// Publishes to every child declaring the message type.
    pub async fn publish<M: BusMessage + Clone>(&self, message: M) -> BusResult<()> {
        self.publish_with(message, PublishOptions::default()).await
    }

    /// Publishes with caller-side overrides.
    pub async fn publish_with<M: BusMessage + Clone>(
        &self,
        message: M,
        options: PublishOptions,
    ) -> BusResult<()> {
        self.ensure_live()?;
        let buses = self.route(MessageType::of::<M>(), &M::ancestors())?;

        if buses.len() == 1 {
            return buses[0]
                .publish_boxed(Box::new(message), options)
                .await;
        }

        match self.mode {
            PublishExecutionMode::Parallel => {
                let results = join_all(buses.iter().map(|bus| {
                    bus.publish_boxed(Box::new(message.clone()), options.clone())
                }))
                .await;

                let mut first_error = None;
                for result in results {
                    if let Err(err) = result {
                        if first_error.is_none() {
                            first_error = Some(err);
                        } else {
                            warn!(%err, "additional child publish failure");
                        }
                    }
                }
                match first_error {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            PublishExecutionMode::Sequential => {
                for bus in &buses {
                    bus.publish_boxed(Box::new(message.clone()), options.clone())
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Sends a request to its sole owning child and forwards the typed
    /// response unchanged.
    pub async fn send<R: RequestMessage>(&self, request: R) -> BusResult<R::Response> {
        self.send_with(request, SendOptions::default()).await
    }

    /// Sends with caller-side overrides.
    pub async fn send_with<R: RequestMessage>(
        &self,
        request: R,
        options: SendOptions,
    ) -> BusResult<R::Response> {
        self.ensure_live()?;
        let runtime_type = MessageType::of::<R>();
        let buses = self.route(runtime_type, &R::ancestors())?;
        debug_assert_eq!(buses.len(), 1);

        let response = buses[0].send_boxed(Box::new(request), options).await?;
        response.downcast::<R::Response>().ok_or_else(|| {
            Error::serialization(format!(
                "reply for {runtime_type} was not of the declared response type"
            ))
        })
    }

    /// Starts every child; awaits all of them.
    pub async fn start(&self) -> BusResult<()> {
        self.ensure_live()?;
        let results = join_all(
            self.children
                .iter()
                .map(|(_, bus)| async move { bus.start().await }),
        )
        .await;
        self.collect_lifecycle_errors(results, "start")
    }

    /// Stops every child; awaits all of them.
    pub async fn stop(&self) -> BusResult<()> {
        let results = join_all(
            self.children
                .iter()
                .map(|(_, bus)| async move { bus.stop().await }),
        )
        .await;
        self.collect_lifecycle_errors(results, "stop")
    }

    /// Whether every child is started.
    pub fn is_started(&self) -> bool {
        self.children.iter().all(|(_, bus)| bus.is_started())
    }

    /// Disposes children sequentially in reverse creation order. A failing
    /// child is logged and does not block the rest. Idempotent.
    pub async fn dispose(&self) -> BusResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for (name, bus) in self.children.iter().rev() {
            if let Err(err) = bus.dispose().await {
                error!(child = %name, %err, "child bus failed to dispose");
            }
        }
        info!("hybrid bus disposed");
        Ok(())
    }

    fn collect_lifecycle_errors(
        &self,
        results: Vec<BusResult<()>>,
        operation: &str,
    ) -> BusResult<()> {
        let mut failures = Vec::new();
        for ((name, _), result) in self.children.iter().zip(results) {
            if let Err(err) = result {
                error!(child = %name, %err, "child bus lifecycle failure");
                failures.push(format!("{name}: {err}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::transport(format!(
                "failed to {operation} child buses: {}",
                failures.join(", ")
            )))
        }
    }
}

impl std::fmt::Debug for HybridBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridBus")
            .field("children", &self.child_names())
            .field("routes", &self.routes.len())
            .field("mode", &self.mode)
            .finish()
    }
}
