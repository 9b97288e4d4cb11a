//! Outbound dual-priority queue: control messages strictly precede objects,
//! at most one send is ever outstanding, and both control messages and
//! individual chunks are retried up to [`wire::MAX_FAILURES`] times on a
//! fixed backoff before being abandoned.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::{debug, warn};

use crate::control::ControlMessage;
use crate::error::{Result, TransportError};
use crate::wire::{self, ChunkHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutgoingKind {
    Control,
    Object,
}

struct PendingControl {
    message: ControlMessage,
    failure_count: u8,
}

struct PendingObject {
    json: String,
    bytes: Vec<u8>,
    offset: usize,
    failure_count: u8,
}

/// A unit handed to the owner to pass to [`crate::transport::LowerTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Control(ControlMessage),
    Chunk(Vec<u8>),
}

/// What the owner must do in response to a failure being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderEvent {
    /// Schedule a retry of the same unit after [`wire::RETRY_BACKOFF_MS`].
    ScheduleRetry,
    /// A control message exhausted its retries and was dropped.
    ControlExhausted,
    /// An object exhausted its retries and was dropped; carries the original
    /// JSON so the caller can surface it on the `error` event.
    ObjectExhausted { json: String },
}

/// What [`Sender::next`] produced: a unit to hand to the lower transport, or
/// a failure that was never attempted (the session isn't open) and must be
/// handled exactly like a reported transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextOutcome {
    Send(Outgoing),
    Failed(SenderEvent),
}

pub struct Sender {
    control_queue: VecDeque<PendingControl>,
    object_queue: VecDeque<PendingObject>,
    in_flight: Option<OutgoingKind>,
    pending_chunk_len: usize,
    max_failures: u8,
}

impl Default for Sender {
    fn default() -> Self {
        Self::new(wire::MAX_FAILURES)
    }
}

impl Sender {
    pub fn new(max_failures: u8) -> Self {
        Self {
            control_queue: VecDeque::new(),
            object_queue: VecDeque::new(),
            in_flight: None,
            pending_chunk_len: 0,
            max_failures,
        }
    }

    pub fn queue_control(&mut self, message: ControlMessage) {
        self.control_queue.push_back(PendingControl {
            message,
            failure_count: 0,
        });
    }

    /// Serialize and enqueue `obj`. Fails synchronously if `obj` is not
    /// JSON-serializable or its encoded length cannot fit the 31-bit chunk
    /// length field.
    pub fn queue_object(&mut self, obj: &Value) -> Result<()> {
        let json = serde_json::to_string(obj)?;
        let mut bytes = json.clone().into_bytes();
        bytes.push(0);
        if bytes.len() as u64 > wire::MAX_CHUNK_N as u64 {
            return Err(TransportError::PayloadTooLarge { len: bytes.len() });
        }
        self.object_queue.push_back(PendingObject {
            json,
            bytes,
            offset: 0,
            failure_count: 0,
        });
        Ok(())
    }

    pub fn is_sending(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Implements `sendNext`: produce the next unit to transmit, or a
    /// `Failed` event if the head object can't be sent because the session
    /// isn't open, or `None` if nothing is queued or a send is already
    /// outstanding. A closed-session failure counts as one attempt, exactly
    /// like a reported transport failure, so the caller must schedule the
    /// usual backoff (or surface the `error` event) rather than retrying the
    /// rest of the object's budget in the same call.
    pub fn next(&mut self, session_open: bool, tx_chunk_size: u16) -> Option<NextOutcome> {
        if self.in_flight.is_some() {
            return None;
        }

        if let Some(control) = self.control_queue.front() {
            if let Some(obj) = self.object_queue.front_mut() {
                if obj.offset != 0 {
                    debug!("preempted by control message, object restarts at offset 0");
                    obj.offset = 0;
                    obj.failure_count = 0;
                }
            }
            self.in_flight = Some(OutgoingKind::Control);
            return Some(NextOutcome::Send(Outgoing::Control(control.message.clone())));
        }

        let obj = self.object_queue.front_mut()?;

        if !session_open {
            warn!("session not open, failing queued object chunk synthetically");
            obj.offset = 0;
            self.in_flight = Some(OutgoingKind::Object);
            return self.on_failure().map(NextOutcome::Failed);
        }

        let obj = self.object_queue.front().expect("checked above");
        let payload_len = (tx_chunk_size as usize).min(obj.bytes.len() - obj.offset);
        let is_first = obj.offset == 0;
        let n = if is_first {
            obj.bytes.len() as u32
        } else {
            obj.offset as u32
        };
        let header = ChunkHeader { is_first, n };
        let mut wire_bytes = Vec::with_capacity(4 + payload_len);
        header.encode(&mut wire_bytes);
        wire_bytes.extend_from_slice(&obj.bytes[obj.offset..obj.offset + payload_len]);

        self.in_flight = Some(OutgoingKind::Object);
        self.pending_chunk_len = payload_len;
        Some(NextOutcome::Send(Outgoing::Chunk(wire_bytes)))
    }

    /// The in-flight unit was delivered successfully.
    pub fn on_success(&mut self) {
        match self.in_flight.take() {
            Some(OutgoingKind::Control) => {
                self.control_queue.pop_front();
            }
            Some(OutgoingKind::Object) => {
                let done = match self.object_queue.front_mut() {
                    Some(obj) => {
                        obj.offset += self.pending_chunk_len;
                        obj.failure_count = 0;
                        obj.offset == obj.bytes.len()
                    }
                    None => true,
                };
                if done {
                    self.object_queue.pop_front();
                }
            }
            None => {}
        }
    }

    /// The in-flight unit failed (or, for a closed session, is synthetically
    /// failed without ever having been handed to the lower transport).
    pub fn on_failure(&mut self) -> Option<SenderEvent> {
        match self.in_flight.take() {
            Some(OutgoingKind::Control) => {
                let exhausted = match self.control_queue.front_mut() {
                    Some(control) => {
                        control.failure_count += 1;
                        control.failure_count > self.max_failures
                    }
                    None => true,
                };
                if exhausted {
                    self.control_queue.pop_front();
                    Some(SenderEvent::ControlExhausted)
                } else {
                    Some(SenderEvent::ScheduleRetry)
                }
            }
            Some(OutgoingKind::Object) => {
                let outcome = match self.object_queue.front_mut() {
                    Some(obj) => {
                        obj.failure_count += 1;
                        if obj.failure_count > self.max_failures {
                            Some(obj.json.clone())
                        } else {
                            None
                        }
                    }
                    None => None,
                };
                match outcome {
                    Some(json) => {
                        self.object_queue.pop_front();
                        Some(SenderEvent::ObjectExhausted { json })
                    }
                    None => {
                        if self.object_queue.is_empty() {
                            None
                        } else {
                            Some(SenderEvent::ScheduleRetry)
                        }
                    }
                }
            }
            None => None,
        }
    }
}
