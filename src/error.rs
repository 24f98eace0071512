//! Error taxonomy for the queue coordinator.
//!
//! Mirrors the four kinds distinguished in the design: retryable transport,
//! retryable API, benign not-found, and fatal/client errors. The resource
//! client is responsible for retrying the first two; the coordinator only
//! ever sees a `Client` error (raised immediately, before any side effect)
//! or an `Api`/`Network`/`InvalidResponseBody` error that has already
//! exhausted retries.

use thiserror::Error;

/// Error surface shared by the resource client and the coordinator.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote service returned a non-2xx response that isn't a benign
    /// not-found (see [`is_not_found`]).
    #[error("API error {status} ({kind}) on attempt {attempt}: {message}")]
    Api {
        status: u16,
        kind: String,
        message: String,
        attempt: u32,
    },

    /// The response body was not parseable JSON, or didn't match the
    /// expected shape. Retryable by the transport layer.
    #[error("invalid response body: {0}")]
    InvalidResponseBody(String),

    /// Network or timeout error. Retryable by the transport layer.
    #[error("network error: {0}")]
    Network(String),

    /// Programmer error: invalid argument, missing required field, etc.
    /// Never retried, always surfaced immediately.
    #[error("invalid argument: {0}")]
    Client(String),

    /// Local on-disk emulator I/O failure.
    #[error("local storage error: {0}")]
    LocalStorage(String),
}

impl Error {
    pub fn client(msg: impl Into<String>) -> Self {
        Error::Client(msg.into())
    }

    /// True for a 404 whose body `type` is one of the two benign
    /// not-found markers the design calls out.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Api { status: 404, kind, .. }
                if kind == "record-not-found" || kind == "record-or-token-not-found"
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Translate a benign not-found into `Ok(None)`; re-raise everything else.
///
/// This is the only error-handling the coordinator itself performs — the
/// resource client is assumed to have already applied retry/backoff to
/// anything retryable.
pub fn or_not_found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
