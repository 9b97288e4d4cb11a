//! Reliable, chunked, JSON-object messaging core layered over an unreliable
//! small-MTU key/value transport between a host runtime and a remote device.
//!
//! [`transport::Transport`] is the single entry point: construct it with a
//! [`transport::LowerTransport`] and a [`transport::Scheduler`], drive it with
//! `on_ready`/`on_appmessage`/`on_send_outcome`/`on_retry_timer` as the lower
//! transport reports activity, and call `post_message`/`on`/`off` from
//! application code.

mod control;
mod error;
mod events;
mod receiver;
mod sender;
mod transport;
mod wire;

pub use control::State as SessionState;
pub use error::{Result, TransportError};
pub use events::{Event, EventBus, HandlerId, Message};
pub use transport::{LowerTransport, ManualScheduler, Scheduler, SystemScheduler, Transport};
pub use wire::{
    LocalCapabilities, KEY_CHUNK, KEY_RESET_COMPLETE, KEY_RESET_REQUEST, KEY_UNSUPPORTED_ERROR,
};

/// Protocol constants and retry policy, grouped so an embedder can see (and
/// in principle override, though the wire format is only defined for the
/// defaults) the whole negotiable surface at a glance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub capabilities: LocalCapabilities,
    pub max_failures: u8,
    pub retry_backoff_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            capabilities: LocalCapabilities::default(),
            max_failures: wire::MAX_FAILURES,
            retry_backoff_ms: wire::RETRY_BACKOFF_MS,
        }
    }
}
