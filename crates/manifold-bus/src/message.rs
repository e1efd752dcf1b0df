//! Message identity and type-erased message values.
//!
//! A message type's runtime identity is a [`MessageType`] token. The typed
//! world ([`BusMessage`], [`RequestMessage`]) carries the static information
//! the serializers and interceptors need; the dynamic world ([`AnyMessage`],
//! [`BoxedMessage`]) is what flows through the pipelines and across the
//! composite router.

use std::any::{Any, TypeId};
use std::fmt;

use bytes::Bytes;
use serde::Serialize;

use crate::error::BusResult;
use crate::serializer::SerializationFormat;

/// Runtime identity of a declared message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    /// Returns the token for a message type.
    pub fn of<M: BusMessage>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: M::type_name(),
        }
    }

    /// The underlying type id.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The wire name carried in the `MessageType` header.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A message that can travel over the bus.
///
/// Every wire message serializes; deserialization is only required where a
/// type is declared for consumption (or as a request's response).
pub trait BusMessage: Serialize + Send + Sync + 'static {
    /// Wire name used in the `MessageType` header.
    fn type_name() -> &'static str
    where
        Self: Sized;

    /// Ancestor chain for polymorphic producer resolution, nearest first.
    ///
    /// A producer declared for an ancestor with the polymorphism flag set
    /// also covers this type.
    fn ancestors() -> Vec<MessageType>
    where
        Self: Sized,
    {
        Vec::new()
    }
}

/// A message that expects a correlated reply.
pub trait RequestMessage: BusMessage {
    /// The reply type delivered on the reply path.
    type Response: BusMessage + serde::de::DeserializeOwned;
}

/// Object-safe facade over a [`BusMessage`] value.
pub trait AnyMessage: Any + Send + Sync {
    /// Runtime type token of the value.
    fn message_type(&self) -> MessageType;

    /// Ancestor chain of the value's type, nearest first.
    fn ancestry(&self) -> Vec<MessageType>;

    /// Encodes the value with the given wire format.
    fn encode(&self, format: SerializationFormat) -> BusResult<Bytes>;

    /// Borrows the value for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Consumes the value for downcasting.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<M: BusMessage> AnyMessage for M {
    fn message_type(&self) -> MessageType {
        MessageType::of::<M>()
    }

    fn ancestry(&self) -> Vec<MessageType> {
        M::ancestors()
    }

    fn encode(&self, format: SerializationFormat) -> BusResult<Bytes> {
        format.serialize(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

/// A type-erased message value.
pub type BoxedMessage = Box<dyn AnyMessage>;

/// Maps declared type names to and from the wire-level `MessageType` header,
/// so buses written against other naming schemes can interoperate.
pub trait MessageTypeResolver: Send + Sync + 'static {
    /// Header value for a declared type name.
    fn to_name(&self, declared: &str) -> String;

    /// Declared type name for an inbound header value, or `None` if the
    /// name is not recognised.
    fn to_declared(&self, wire_name: &str) -> Option<String>;
}

/// Identity mapping; declared names go on the wire as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMessageTypeResolver;

impl MessageTypeResolver for DefaultMessageTypeResolver {
    fn to_name(&self, declared: &str) -> String {
        declared.to_string()
    }

    fn to_declared(&self, wire_name: &str) -> Option<String> {
        Some(wire_name.to_string())
    }
}

impl fmt::Debug for dyn AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMessage")
            .field("message_type", &self.message_type())
            .finish()
    }
}

impl dyn AnyMessage {
    /// Downcasts a borrowed message to its concrete type.
    pub fn downcast_ref<M: BusMessage>(&self) -> Option<&M> {
        self.as_any().downcast_ref::<M>()
    }

    /// Downcasts an owned message to its concrete type.
    pub fn downcast<M: BusMessage>(self: Box<Self>) -> Option<M> {
        self.into_any().downcast::<M>().ok().map(|boxed| *boxed)
    }
}

/// Implements [`BusMessage`] (and optionally [`RequestMessage`]) for a type.
///
/// ```
/// use manifold_bus::bus_message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderPlaced {
///     id: String,
/// }
/// bus_message!(OrderPlaced);
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct BigOrderPlaced {
///     id: String,
/// }
/// bus_message!(BigOrderPlaced, parent = OrderPlaced);
/// ```
#[macro_export]
macro_rules! bus_message {
    ($ty:ty) => {
        impl $crate::message::BusMessage for $ty {
            fn type_name() -> &'static str {
                stringify!($ty)
            }
        }
    };
    ($ty:ty, parent = $parent:ty) => {
        impl $crate::message::BusMessage for $ty {
            fn type_name() -> &'static str {
                stringify!($ty)
            }

            fn ancestors() -> ::std::vec::Vec<$crate::message::MessageType> {
                let mut chain = vec![$crate::message::MessageType::of::<$parent>()];
                chain.extend(<$parent as $crate::message::BusMessage>::ancestors());
                chain
            }
        }
    };
    ($ty:ty, response = $resp:ty) => {
        $crate::bus_message!($ty);

        impl $crate::message::RequestMessage for $ty {
            type Response = $resp;
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct BaseEvent {
        seq: u64,
    }
    bus_message!(BaseEvent);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct DerivedEvent {
        seq: u64,
    }
    bus_message!(DerivedEvent, parent = BaseEvent);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct LeafEvent {
        seq: u64,
    }
    bus_message!(LeafEvent, parent = DerivedEvent);

    #[test]
    fn type_tokens_are_distinct() {
        assert_ne!(MessageType::of::<BaseEvent>(), MessageType::of::<DerivedEvent>());
        assert_eq!(MessageType::of::<BaseEvent>().name(), "BaseEvent");
    }

    #[test]
    fn ancestry_chains_through_parents() {
        let chain = LeafEvent::ancestors();
        assert_eq!(
            chain,
            vec![
                MessageType::of::<DerivedEvent>(),
                MessageType::of::<BaseEvent>()
            ]
        );
        assert!(BaseEvent::ancestors().is_empty());
    }

    #[test]
    fn boxed_messages_downcast() {
        let boxed: BoxedMessage = Box::new(BaseEvent { seq: 7 });
        assert_eq!(boxed.message_type(), MessageType::of::<BaseEvent>());
        assert!(boxed.downcast_ref::<DerivedEvent>().is_none());
        let value = boxed.downcast::<BaseEvent>().unwrap();
        assert_eq!(value.seq, 7);
    }
}
