//! Error types for the collaborator contracts.

use thiserror::Error;

/// Failure to serialize or deserialize a request, response, or updater
/// blob. Non-retryable for the batch it occurred in.
#[derive(Debug, Error)]
pub enum MarshalError {
    /// The marshaller failed to encode a value into its wire
    /// representation.
    #[error("failed to marshal value: {0}")]
    Encode(Box<dyn std::error::Error + Send + Sync>),

    /// The marshaller failed to decode a wire payload back into a value.
    #[error("failed to unmarshal value: {0}")]
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

/// Network transport failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The destination node is not alive, or pings to it failed.
    /// The Per-Node Buffer turns this into a retryable `NodeLeft`.
    #[error("node is not reachable")]
    NodeUnreachable,

    /// Any other transport-level failure while the destination was
    /// still believed alive; not automatically retryable.
    #[error("send failed: {0}")]
    SendFailed(Box<dyn std::error::Error + Send + Sync>),
}

/// Outcome of running the updater directly against the local worker
/// pool, mirroring what a remote `LoadResponse` carries.
#[derive(Debug, Error)]
pub enum LocalExecError {
    /// The entries or updater blob could not be marshalled/unmarshalled.
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// The updater itself rejected the batch; carries the opaque,
    /// still-marshalled error blob for the caller to decode.
    #[error("updater rejected the batch")]
    Application(bytes::Bytes),
}
