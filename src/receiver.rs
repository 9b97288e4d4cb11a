//! Inbound chunk validation and reassembly.
//!
//! A [`Receiver`] holds at most one in-progress reassembly buffer. Every
//! chunk is checked against the sequence rules in the module docs before its
//! payload is appended; any violation clears the buffer and is reported to
//! the caller so [`crate::control::Control`] can drive the session back into
//! renegotiation.

use serde_json::Value;
use tracing::{debug, warn};

use crate::wire::ChunkHeader;

#[derive(Default)]
struct Buffer {
    total_size: usize,
    accumulated: Vec<u8>,
}

#[derive(Default)]
pub struct Receiver {
    buffer: Option<Buffer>,
}

/// Outcome of feeding one chunk into the receiver.
#[derive(Debug, PartialEq)]
pub enum ReceiveOutcome {
    /// More chunks are needed before the object is complete.
    Incomplete,
    /// The object was fully reassembled and parsed.
    Message(Value),
    /// The final payload decoded but did not parse as JSON (or was not
    /// UTF-8, or was missing its terminator); the partial object is dropped.
    Malformed,
    /// The chunk violated the sequencing rules; the reassembly buffer is
    /// cleared and the session must renegotiate.
    ProtocolViolation,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_chunk(&mut self, raw: &[u8]) -> ReceiveOutcome {
        let Some((header, payload)) = ChunkHeader::decode(raw) else {
            warn!(len = raw.len(), "chunk too short to contain a header");
            self.buffer = None;
            return ReceiveOutcome::ProtocolViolation;
        };

        let expecting_first = self.buffer.is_none();
        if header.is_first != expecting_first {
            warn!(
                expecting_first,
                got_first = header.is_first,
                "chunk is_first mismatch"
            );
            self.buffer = None;
            return ReceiveOutcome::ProtocolViolation;
        }

        if header.is_first {
            self.buffer = Some(Buffer {
                total_size: header.n as usize,
                accumulated: Vec::with_capacity(header.n as usize),
            });
        } else {
            let buffer = self.buffer.as_ref().expect("checked by expecting_first");
            if header.n as usize != buffer.accumulated.len() {
                warn!(
                    expected_offset = buffer.accumulated.len(),
                    got_offset = header.n,
                    "chunk offset mismatch"
                );
                self.buffer = None;
                return ReceiveOutcome::ProtocolViolation;
            }
        }

        let buffer = self.buffer.as_ref().expect("just populated above");
        if buffer.accumulated.len() + payload.len() > buffer.total_size {
            warn!("chunk payload overruns declared total size");
            self.buffer = None;
            return ReceiveOutcome::ProtocolViolation;
        }

        let buffer = self.buffer.as_mut().expect("just populated above");
        buffer.accumulated.extend_from_slice(payload);

        if buffer.accumulated.len() < buffer.total_size {
            return ReceiveOutcome::Incomplete;
        }

        let Buffer { accumulated, .. } = self.buffer.take().unwrap();
        Self::finish(accumulated)
    }

    fn finish(mut accumulated: Vec<u8>) -> ReceiveOutcome {
        if accumulated.pop() != Some(0) {
            warn!("reassembled message missing zero terminator");
            return ReceiveOutcome::Malformed;
        }
        let Ok(text) = String::from_utf8(accumulated) else {
            warn!("reassembled message is not valid UTF-8");
            return ReceiveOutcome::Malformed;
        };
        match serde_json::from_str(&text) {
            Ok(value) => {
                debug!("reassembled message parsed");
                ReceiveOutcome::Message(value)
            }
            Err(e) => {
                warn!(error = %e, "reassembled message failed to parse as JSON");
                ReceiveOutcome::Malformed
            }
        }
    }
}
