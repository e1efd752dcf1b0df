use thiserror::Error;

/// Errors local to the in-memory transport.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport used before `bind`.
    #[error("transport is not bound to a dispatcher")]
    NotBound,

    /// Transport used after disposal.
    #[error("transport is disposed")]
    Disposed,
}

impl From<Error> for manifold_bus::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::NotBound => manifold_bus::Error::transport(error.to_string()),
            Error::Disposed => manifold_bus::Error::disposed(error.to_string()),
        }
    }
}
