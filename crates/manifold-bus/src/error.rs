//! Error types for the bus runtime.

use std::fmt;

/// Result type for bus operations.
pub type BusResult<T> = Result<T, Error>;

/// Main error type for the bus runtime.
///
/// Every surfaced failure carries a classification [`ErrorKind`] and a
/// human-readable context.
#[derive(Debug)]
pub struct Error {
    /// Error kind
    kind: ErrorKind,
    /// Error context
    context: ErrorContext,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Create error with a source error chained below it
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            context: ErrorContext::Chain {
                message: message.into(),
                source: Box::new(source),
            },
        }
    }

    /// Get error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get error context
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Configuration, msg)
    }

    /// Create a producer error
    pub fn producer(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Producer, msg)
    }

    /// Create a consumer error
    pub fn consumer(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Consumer, msg)
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Serialization, msg)
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Transport, msg)
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Timeout, msg)
    }

    /// Create a cancelled error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Cancelled, msg)
    }

    /// Create a disposed error
    pub fn disposed(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Disposed, msg)
    }

    /// Create a handler error
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Handler, msg)
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{}: {}", self.kind, msg),
            ErrorContext::Chain { message, source } => {
                write!(f, "{}: {} (caused by: {})", self.kind, message, source)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.context {
            ErrorContext::Chain { source, .. } => Some(source.as_ref()),
            ErrorContext::Message(_) => None,
        }
    }
}

/// Error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid declaration detected at build or construction; fatal to startup
    Configuration,
    /// No producer declared for the type, or path resolution failed
    Producer,
    /// No consumer declared for an inbound message
    Consumer,
    /// Encode or decode failure
    Serialization,
    /// Produce or subscribe I/O failure
    Transport,
    /// Pending request deadline exceeded
    Timeout,
    /// Caller's cancellation signal fired
    Cancelled,
    /// Operation on a torn-down bus
    Disposed,
    /// User consumer or handler failed
    Handler,
}

impl ErrorKind {
    /// Stable tag used on wire-level error envelopes.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "Configuration",
            ErrorKind::Producer => "Producer",
            ErrorKind::Consumer => "Consumer",
            ErrorKind::Serialization => "Serialization",
            ErrorKind::Transport => "Transport",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Disposed => "Disposed",
            ErrorKind::Handler => "Handler",
        }
    }

    /// Parse a wire-level tag back into a kind.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "Configuration" => Some(ErrorKind::Configuration),
            "Producer" => Some(ErrorKind::Producer),
            "Consumer" => Some(ErrorKind::Consumer),
            "Serialization" => Some(ErrorKind::Serialization),
            "Transport" => Some(ErrorKind::Transport),
            "Timeout" => Some(ErrorKind::Timeout),
            "Cancelled" => Some(ErrorKind::Cancelled),
            "Disposed" => Some(ErrorKind::Disposed),
            "Handler" => Some(ErrorKind::Handler),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "Configuration error"),
            ErrorKind::Producer => write!(f, "Producer error"),
            ErrorKind::Consumer => write!(f, "Consumer error"),
            ErrorKind::Serialization => write!(f, "Serialization error"),
            ErrorKind::Transport => write!(f, "Transport error"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::Cancelled => write!(f, "Cancelled"),
            ErrorKind::Disposed => write!(f, "Disposed"),
            ErrorKind::Handler => write!(f, "Handler error"),
        }
    }
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message
    Message(String),
    /// Error chain with source
    Chain {
        /// Error message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::with_source(ErrorKind::Transport, "task join failed", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_and_message() {
        let err = Error::configuration("transport not set");
        assert_eq!(err.to_string(), "Configuration error: transport not set");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn chained_source_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "broken pipe");
        let err = Error::with_source(ErrorKind::Transport, "produce failed", io);
        assert!(err.to_string().contains("broken pipe"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            ErrorKind::Configuration,
            ErrorKind::Producer,
            ErrorKind::Consumer,
            ErrorKind::Serialization,
            ErrorKind::Transport,
            ErrorKind::Timeout,
            ErrorKind::Cancelled,
            ErrorKind::Disposed,
            ErrorKind::Handler,
        ] {
            assert_eq!(ErrorKind::from_tag(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_tag("Unknown"), None);
    }
}
