//! Serialization port.
//!
//! Encode/decode of declared message types to and from opaque byte buffers.
//! The target type is always passed explicitly (as the generic parameter) so
//! no dispatch by value tag is needed. Decoders for the dynamic half of the
//! runtime are minted per declared type ([`MessageDecoder`]), since serde
//! deserialization needs the static type.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BusResult, Error, ErrorKind};
use crate::message::{BoxedMessage, BusMessage, MessageType};

/// Wire format used to encode declared message types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SerializationFormat {
    /// CBOR via `ciborium`. The default wire format.
    #[default]
    Cbor,
    /// JSON via `serde_json`.
    Json,
}

impl SerializationFormat {
    /// Content-type tag advertised to transports.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Cbor => "application/cbor",
            Self::Json => "application/json",
        }
    }

    /// Encodes a value of a declared type to wire bytes.
    pub fn serialize<M: Serialize + ?Sized>(&self, value: &M) -> BusResult<Bytes> {
        match self {
            Self::Cbor => {
                let mut buf = Vec::new();
                ciborium::ser::into_writer(value, &mut buf)
                    .map_err(|e| Error::with_source(ErrorKind::Serialization, "cbor encode failed", e))?;
                Ok(Bytes::from(buf))
            }
            Self::Json => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| Error::with_source(ErrorKind::Serialization, "json encode failed", e)),
        }
    }

    /// Decodes wire bytes into a value of a declared type.
    pub fn deserialize<M: DeserializeOwned>(&self, payload: &[u8]) -> BusResult<M> {
        match self {
            Self::Cbor => ciborium::de::from_reader(payload)
                .map_err(|e| Error::with_source(ErrorKind::Serialization, "cbor decode failed", e)),
            Self::Json => serde_json::from_slice(payload)
                .map_err(|e| Error::with_source(ErrorKind::Serialization, "json decode failed", e)),
        }
    }
}

/// Monomorphised decoder minted when a type is declared on the bus.
#[derive(Clone)]
pub struct MessageDecoder {
    message_type: MessageType,
    decode: Arc<dyn Fn(SerializationFormat, &[u8]) -> BusResult<BoxedMessage> + Send + Sync>,
}

impl MessageDecoder {
    /// Creates the decoder for a declared type.
    pub fn of<M: BusMessage + DeserializeOwned>() -> Self {
        Self {
            message_type: MessageType::of::<M>(),
            decode: Arc::new(|format, payload| {
                let value: M = format.deserialize(payload)?;
                Ok(Box::new(value) as BoxedMessage)
            }),
        }
    }

    /// The declared type this decoder produces.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Decodes a payload into the declared type.
    pub fn decode(&self, format: SerializationFormat, payload: &[u8]) -> BusResult<BoxedMessage> {
        (self.decode)(format, payload)
    }
}

impl fmt::Debug for MessageDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDecoder")
            .field("message_type", &self.message_type)
            .finish_non_exhaustive()
    }
}
