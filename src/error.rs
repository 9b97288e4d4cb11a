use thiserror::Error;

/// Errors surfaced by the transport core to its embedder.
///
/// Protocol-internal anomalies (a bad chunk sequence, a version mismatch) are not
/// represented here — they drive a state transition in [`crate::control::Control`]
/// and are logged via `tracing`. Only conditions a caller must react to reach this enum.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("object is not JSON-serializable: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("object encodes to {len} bytes, exceeding the 31-bit chunk length field")]
    PayloadTooLarge { len: usize },

    #[error("invalid listener: {0}")]
    InvalidListener(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
