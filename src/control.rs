//! Session handshake state machine.
//!
//! `Control` is a small reducer: every external event (the lower transport
//! becoming ready, an inbound control/chunk message, a reported send failure,
//! a receiver protocol violation) is fed in through one of its `on_*` methods,
//! which mutate `state`/`params` and return the [`Action`]s the owner
//! ([`crate::transport::Transport`]) must perform. Control never sends
//! anything itself — it has no reference to the lower transport — which keeps
//! the state machine trivially unit-testable.

use tracing::{debug, warn};

use crate::wire::{self, LocalCapabilities};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    AwaitingResetCompleteRemoteInitiated,
    AwaitingResetCompleteLocalInitiated,
    SessionOpen,
}

/// Negotiated session parameters. Zero in every state except `SessionOpen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionParams {
    pub version: u8,
    pub tx_chunk_size: u16,
    pub rx_chunk_size: u16,
}

/// A parsed inbound control-plane message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    ResetRequest,
    ResetComplete(LocalCapabilities),
    Chunk(Vec<u8>),
    UnsupportedError,
}

/// An outbound control-plane message Control wants the [`crate::sender::Sender`]
/// to queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    ResetRequest,
    ResetComplete(LocalCapabilities),
    UnsupportedError,
}

/// A side effect for the owner to carry out. Control performs none of these
/// itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendControl(ControlMessage),
    EmitConnected,
    EmitDisconnected,
    /// Hand a reassembled chunk payload to the receiver.
    ForwardChunk(Vec<u8>),
    /// A fatal, non-recoverable protocol condition; propagate to the host.
    EmitError(String),
}

pub struct Control {
    state: State,
    params: SessionParams,
    local_caps: LocalCapabilities,
}

impl Control {
    pub fn new(local_caps: LocalCapabilities) -> Self {
        Self {
            state: State::Disconnected,
            params: SessionParams::default(),
            local_caps,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn params(&self) -> SessionParams {
        self.params
    }

    pub fn is_open(&self) -> bool {
        self.state == State::SessionOpen
    }

    /// The lower transport has signalled readiness. Only meaningful from
    /// `Disconnected`.
    pub fn on_ready(&mut self) -> Vec<Action> {
        if self.state == State::Disconnected {
            self.enter(State::AwaitingResetCompleteLocalInitiated)
        } else {
            debug!(?self.state, "on_ready ignored outside Disconnected");
            Vec::new()
        }
    }

    /// The sender exhausted retries on a queued control message. A control
    /// message can only be lost this badly if the lower transport itself is
    /// gone, so there is no narrower state to fall back to than a full
    /// renegotiation from scratch.
    pub fn on_control_send_exhausted(&mut self) -> Vec<Action> {
        warn!("control message retries exhausted, forcing Disconnected");
        self.enter(State::Disconnected)
    }

    /// The receiver detected a chunk sequence violation.
    pub fn on_receiver_protocol_violation(&mut self) -> Vec<Action> {
        warn!(?self.state, "receiver protocol violation");
        self.enter(State::AwaitingResetCompleteLocalInitiated)
    }

    /// Dispatch an inbound control/chunk message per the state x key table.
    pub fn on_message(&mut self, inbound: Inbound) -> Vec<Action> {
        match (self.state, inbound) {
            (State::Disconnected, _) => Vec::new(),

            (State::AwaitingResetCompleteRemoteInitiated, Inbound::ResetRequest) => {
                self.enter(State::AwaitingResetCompleteRemoteInitiated)
            }
            (State::AwaitingResetCompleteRemoteInitiated, Inbound::ResetComplete(remote)) => {
                self.accept_or_reject(remote, true)
            }
            (State::AwaitingResetCompleteRemoteInitiated, Inbound::Chunk(_)) => {
                self.enter(State::AwaitingResetCompleteLocalInitiated)
            }
            (State::AwaitingResetCompleteRemoteInitiated, Inbound::UnsupportedError) => {
                warn!("remote rejected our protocol version while we awaited its ResetComplete");
                let mut actions = self.enter(State::AwaitingResetCompleteLocalInitiated);
                actions.push(Action::EmitError(
                    "remote rejected our protocol version".to_string(),
                ));
                actions
            }

            (State::AwaitingResetCompleteLocalInitiated, Inbound::ResetRequest) => Vec::new(),
            (State::AwaitingResetCompleteLocalInitiated, Inbound::ResetComplete(remote)) => {
                self.accept_or_reject(remote, false)
            }
            (State::AwaitingResetCompleteLocalInitiated, Inbound::Chunk(_)) => Vec::new(),
            (State::AwaitingResetCompleteLocalInitiated, Inbound::UnsupportedError) => Vec::new(),

            (State::SessionOpen, Inbound::ResetRequest) => {
                self.enter(State::AwaitingResetCompleteRemoteInitiated)
            }
            (State::SessionOpen, Inbound::ResetComplete(_)) => Vec::new(),
            (State::SessionOpen, Inbound::Chunk(bytes)) => vec![Action::ForwardChunk(bytes)],
            (State::SessionOpen, Inbound::UnsupportedError) => {
                self.enter(State::AwaitingResetCompleteLocalInitiated)
            }
        }
    }

    /// Validate a remote `ResetComplete` and either open the session or
    /// reject it. `reply_with_reset_complete` controls whether we must echo
    /// our own `ResetComplete` back (true from `RI`, where our copy already
    /// went out on entry and a reply is never sent again; false from `LI`,
    /// where we must send it now to complete the handshake).
    fn accept_or_reject(&mut self, remote: LocalCapabilities, already_sent_ours: bool) -> Vec<Action> {
        match self.local_caps.negotiate(&remote) {
            Some((version, tx_chunk_size, rx_chunk_size)) => {
                let mut actions = Vec::new();
                if !already_sent_ours {
                    actions.push(Action::SendControl(ControlMessage::ResetComplete(
                        self.local_caps,
                    )));
                }
                self.params = SessionParams {
                    version,
                    tx_chunk_size,
                    rx_chunk_size,
                };
                actions.extend(self.enter(State::SessionOpen));
                actions
            }
            None => {
                warn!(?remote, "version negotiation failed");
                if self.state == State::AwaitingResetCompleteLocalInitiated {
                    vec![Action::SendControl(ControlMessage::UnsupportedError)]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn enter(&mut self, new_state: State) -> Vec<Action> {
        let previous = self.state;
        let mut actions = Vec::new();

        if previous == State::SessionOpen && new_state != State::SessionOpen {
            actions.push(Action::EmitDisconnected);
        }

        match new_state {
            State::Disconnected => {
                self.params = SessionParams::default();
            }
            State::AwaitingResetCompleteRemoteInitiated => {
                self.params = SessionParams::default();
                actions.push(Action::SendControl(ControlMessage::ResetComplete(
                    self.local_caps,
                )));
            }
            State::AwaitingResetCompleteLocalInitiated => {
                self.params = SessionParams::default();
                if previous != State::AwaitingResetCompleteLocalInitiated {
                    actions.push(Action::SendControl(ControlMessage::ResetRequest));
                }
            }
            State::SessionOpen => {
                actions.push(Action::EmitConnected);
            }
        }

        debug!(?previous, new = ?new_state, "control state transition");
        self.state = new_state;
        actions
    }
}

impl ControlMessage {
    pub fn key(&self) -> &'static str {
        match self {
            ControlMessage::ResetRequest => wire::KEY_RESET_REQUEST,
            ControlMessage::ResetComplete(_) => wire::KEY_RESET_COMPLETE,
            ControlMessage::UnsupportedError => wire::KEY_UNSUPPORTED_ERROR,
        }
    }
}
