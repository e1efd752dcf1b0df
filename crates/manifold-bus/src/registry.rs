//! Type registry.
//!
//! Fast lookup from a runtime message type to the nearest declared producer
//! or consumer settings. Producer resolution walks the type's ancestor chain
//! once and caches the result (hit or miss) for the lifetime of the bus.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{BusResult, Error};
use crate::message::MessageType;
use crate::settings::{ConsumerSettings, ProducerSettings};

/// Registry of declared producers and consumers for one bus.
pub struct TypeRegistry {
    producers: HashMap<TypeId, Arc<ProducerSettings>>,
    consumers: Vec<Arc<ConsumerSettings>>,
    consumers_by_name: HashMap<&'static str, Vec<usize>>,
    consumers_by_path: HashMap<String, Vec<usize>>,
    /// Read-mostly resolution cache; misses are cached too.
    producer_cache: RwLock<HashMap<TypeId, Option<Arc<ProducerSettings>>>>,
}

impl TypeRegistry {
    pub(crate) fn new(
        producers: Vec<Arc<ProducerSettings>>,
        consumers: Vec<Arc<ConsumerSettings>>,
    ) -> Self {
        let producers: HashMap<TypeId, Arc<ProducerSettings>> = producers
            .into_iter()
            .map(|settings| (settings.message_type().id(), settings))
            .collect();

        let mut consumers_by_name: HashMap<&'static str, Vec<usize>> = HashMap::new();
        let mut consumers_by_path: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, settings) in consumers.iter().enumerate() {
            consumers_by_name
                .entry(settings.message_type().name())
                .or_default()
                .push(index);
            consumers_by_path
                .entry(settings.path().to_string())
                .or_default()
                .push(index);
        }

        Self {
            producers,
            consumers,
            consumers_by_name,
            consumers_by_path,
            producer_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves the producer settings for a runtime type.
    ///
    /// An exact declaration wins; otherwise the nearest ancestor whose
    /// producer permits inheritance is used. A miss is a Producer error.
    pub fn resolve_producer(
        &self,
        runtime_type: MessageType,
        ancestry: &[MessageType],
    ) -> BusResult<Arc<ProducerSettings>> {
        if let Some(cached) = self.producer_cache.read().get(&runtime_type.id()) {
            return cached
                .clone()
                .ok_or_else(|| Self::producer_miss(runtime_type));
        }

        let resolved = self.walk_producer(runtime_type, ancestry);
        self.producer_cache
            .write()
            .insert(runtime_type.id(), resolved.clone());

        resolved.ok_or_else(|| Self::producer_miss(runtime_type))
    }

    fn walk_producer(
        &self,
        runtime_type: MessageType,
        ancestry: &[MessageType],
    ) -> Option<Arc<ProducerSettings>> {
        if let Some(settings) = self.producers.get(&runtime_type.id()) {
            return Some(settings.clone());
        }
        for ancestor in ancestry {
            if let Some(settings) = self.producers.get(&ancestor.id()) {
                if settings.is_polymorphic() {
                    return Some(settings.clone());
                }
            }
        }
        None
    }

    fn producer_miss(runtime_type: MessageType) -> Error {
        Error::producer(format!(
            "no producer declared for message type {runtime_type}"
        ))
    }

    /// Resolves consumer settings for an inbound envelope, by type-name
    /// header first and by path as the fallback. Among same-name candidates
    /// the one declared for the envelope's path wins.
    pub fn resolve_consumer(
        &self,
        type_name: Option<&str>,
        path: &str,
    ) -> Option<Arc<ConsumerSettings>> {
        if let Some(name) = type_name {
            if let Some(indexes) = self.consumers_by_name.get(name) {
                let by_path = indexes
                    .iter()
                    .find(|&&i| self.consumers[i].path() == path)
                    .or_else(|| indexes.first());
                if let Some(&index) = by_path {
                    return Some(self.consumers[index].clone());
                }
            }
        }
        self.consumers_by_path
            .get(path)
            .and_then(|indexes| indexes.first())
            .map(|&index| self.consumers[index].clone())
    }

    /// All declared producers.
    pub fn producers(&self) -> impl Iterator<Item = &Arc<ProducerSettings>> {
        self.producers.values()
    }

    /// All declared consumers.
    pub fn consumers(&self) -> &[Arc<ConsumerSettings>] {
        &self.consumers
    }

    /// Whether any declared producer is a request producer.
    pub fn has_request_producers(&self) -> bool {
        self.producers.values().any(|p| p.is_request())
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("producers", &self.producers.len())
            .field("consumers", &self.consumers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    use crate::message::BusMessage;
    use crate::settings::DiscoveredProduceLinks;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SomeMessage;
    crate::bus_message!(SomeMessage);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SomeDerivedMessage;
    crate::bus_message!(SomeDerivedMessage, parent = SomeMessage);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct UnrelatedMessage;
    crate::bus_message!(UnrelatedMessage);

    fn producer_for(
        message_type: MessageType,
        path: &str,
        polymorphic: bool,
    ) -> Arc<ProducerSettings> {
        Arc::new(ProducerSettings {
            message_type,
            default_path: Some(path.to_string()),
            default_timeout: None,
            response_type: None,
            response_decoder: None,
            polymorphic,
            on_message_produced: None,
            attachments: Default::default(),
            discover: Arc::new(|_| DiscoveredProduceLinks::default()),
        })
    }

    #[test]
    fn exact_declaration_resolves() {
        let registry = TypeRegistry::new(
            vec![producer_for(MessageType::of::<SomeMessage>(), "some-messages", true)],
            Vec::new(),
        );

        let settings = registry
            .resolve_producer(MessageType::of::<SomeMessage>(), &SomeMessage::ancestors())
            .unwrap();
        assert_eq!(settings.message_type(), MessageType::of::<SomeMessage>());
    }

    #[test]
    fn derived_type_inherits_polymorphic_base_producer() {
        let registry = TypeRegistry::new(
            vec![producer_for(MessageType::of::<SomeMessage>(), "some-messages", true)],
            Vec::new(),
        );

        let settings = registry
            .resolve_producer(
                MessageType::of::<SomeDerivedMessage>(),
                &SomeDerivedMessage::ancestors(),
            )
            .unwrap();
        assert_eq!(settings.message_type(), MessageType::of::<SomeMessage>());
        assert_eq!(settings.default_path(), Some("some-messages"));
    }

    #[test]
    fn explicit_derived_declaration_wins_over_base() {
        let registry = TypeRegistry::new(
            vec![
                producer_for(MessageType::of::<SomeMessage>(), "base-path", true),
                producer_for(MessageType::of::<SomeDerivedMessage>(), "derived-path", true),
            ],
            Vec::new(),
        );

        let settings = registry
            .resolve_producer(
                MessageType::of::<SomeDerivedMessage>(),
                &SomeDerivedMessage::ancestors(),
            )
            .unwrap();
        assert_eq!(settings.default_path(), Some("derived-path"));
    }

    #[test]
    fn non_polymorphic_base_does_not_cover_derived() {
        let registry = TypeRegistry::new(
            vec![producer_for(MessageType::of::<SomeMessage>(), "some-messages", false)],
            Vec::new(),
        );

        let err = registry
            .resolve_producer(
                MessageType::of::<SomeDerivedMessage>(),
                &SomeDerivedMessage::ancestors(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Producer);
    }

    #[test]
    fn misses_are_cached_and_stable() {
        let registry = TypeRegistry::new(Vec::new(), Vec::new());

        for _ in 0..2 {
            let err = registry
                .resolve_producer(
                    MessageType::of::<UnrelatedMessage>(),
                    &UnrelatedMessage::ancestors(),
                )
                .unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Producer);
        }
        assert_eq!(registry.producer_cache.read().len(), 1);
    }
}
