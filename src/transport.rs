//! Public API and the glue between [`Control`], [`Sender`], [`Receiver`], and
//! [`EventBus`].
//!
//! This module, not any single component above it, owns the rule that ties
//! them together: an inbound dict is dispatched to `Control`, whose resulting
//! [`control::Action`]s are applied here (queueing outbound control messages,
//! emitting events, handing chunk payloads to the `Receiver`); an outbound
//! send is always requested from `Sender` and handed to [`LowerTransport`].
//!
//! Retry timing is modelled sans-IO, in the style of state machines like
//! `rustls`/`quinn-proto`: [`Scheduler::schedule`] only *requests* a callback
//! after a delay, and it is the embedder's job to call
//! [`Transport::on_retry_timer`] once that delay elapses, rather than this
//! crate holding a self-referential callback into its own state.

use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::control::{self, Control, ControlMessage, Inbound};
use crate::error::Result;
use crate::events::{Event, EventBus, HandlerId, Message};
use crate::receiver::{ReceiveOutcome, Receiver};
use crate::sender::{NextOutcome, Outgoing, Sender, SenderEvent};
use crate::wire::{self, LocalCapabilities};

/// The pre-existing best-effort key/value channel this core rides on.
///
/// Exactly one [`Transport::on_send_outcome`] call must eventually follow
/// each `send`, reporting whether the lower transport delivered it.
pub trait LowerTransport {
    fn send(&mut self, dict: HashMap<String, Value>);

    /// Register a handler for an event name this core does not itself
    /// recognize (anything other than `message`/`connected`/`disconnected`/
    /// `error`), forwarded straight through to the lower transport's own
    /// native listener API. Lower transports with no native event surface of
    /// their own can leave the default no-op.
    fn on_passthrough(&mut self, name: &str, handler: Box<dyn FnMut() + Send>) {
        let _ = (name, handler);
    }

    /// Remove a passthrough handler previously registered with the same name.
    fn off_passthrough(&mut self, name: &str) {
        let _ = name;
    }
}

/// An injectable delay capability, so retry backoff can be driven
/// deterministically in tests instead of through wall-clock sleeps.
pub trait Scheduler {
    /// Request that [`Transport::on_retry_timer`] be called once `delay` has
    /// elapsed. Implementations never call back into this crate directly.
    fn schedule(&mut self, delay: Duration);
}

/// Production scheduler: spawns a one-shot thread per request that signals
/// a channel after sleeping. The embedder drains that channel (e.g. once per
/// event loop tick) and calls [`Transport::on_retry_timer`] for each signal.
pub struct SystemScheduler {
    fired: mpsc::Sender<()>,
}

impl SystemScheduler {
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        (Self { fired: tx }, rx)
    }
}

impl Scheduler for SystemScheduler {
    fn schedule(&mut self, delay: Duration) {
        let tx = self.fired.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let _ = tx.send(());
        });
    }
}

/// Test scheduler: records requested delays but never fires on its own.
/// Tests call [`Transport::on_retry_timer`] directly to advance retries
/// without waiting on a real clock.
#[derive(Default)]
pub struct ManualScheduler {
    pub requested: Vec<Duration>,
}

impl Scheduler for ManualScheduler {
    fn schedule(&mut self, delay: Duration) {
        self.requested.push(delay);
    }
}

pub struct Transport<L: LowerTransport, S: Scheduler> {
    control: Control,
    sender: Sender,
    receiver: Receiver,
    events: EventBus,
    lower: L,
    scheduler: S,
    retry_backoff_ms: u64,
}

impl<L: LowerTransport, S: Scheduler> Transport<L, S> {
    pub fn new(lower: L, scheduler: S) -> Self {
        Self::with_config(lower, scheduler, crate::TransportConfig::default())
    }

    pub fn with_config(lower: L, scheduler: S, config: crate::TransportConfig) -> Self {
        Self {
            control: Control::new(config.capabilities),
            sender: Sender::new(config.max_failures),
            receiver: Receiver::new(),
            events: EventBus::new(),
            lower,
            scheduler,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    /// A direct "send an arbitrary app message" capability is deliberately
    /// absent; this lets embedders feature-detect it the way application
    /// code upstream of this core is expected to.
    pub const fn has_raw_send() -> bool {
        false
    }

    pub fn on(&mut self, event: Event, callback: Box<dyn FnMut(&Message) + Send>) -> HandlerId {
        self.events.on(event, callback)
    }

    pub fn off(&mut self, event: Event, id: HandlerId) -> bool {
        self.events.off(event, id)
    }

    /// `on`/`off` for any event name outside `message`/`connected`/
    /// `disconnected`/`error`: forwarded unchanged to the lower transport's
    /// own native listener API rather than handled here.
    pub fn on_passthrough(&mut self, name: &str, handler: Box<dyn FnMut() + Send>) {
        self.lower.on_passthrough(name, handler);
    }

    pub fn off_passthrough(&mut self, name: &str) {
        self.lower.off_passthrough(name);
    }

    /// Queue a JSON-serializable object for reliable delivery.
    pub fn post_message(&mut self, obj: &Value) -> Result<()> {
        self.sender.queue_object(obj)?;
        self.pump();
        Ok(())
    }

    /// The lower transport signalled readiness.
    pub fn on_ready(&mut self) {
        let actions = self.control.on_ready();
        self.apply(actions);
        self.pump();
    }

    /// An inbound key/value dict arrived from the lower transport.
    pub fn on_appmessage(&mut self, dict: &HashMap<String, Value>) {
        let Some(inbound) = decode_inbound(dict) else {
            warn!("dropping appmessage with no recognized key");
            return;
        };
        let actions = self.control.on_message(inbound);
        self.apply(actions);
        self.pump();
    }

    /// The lower transport reported the outcome of the most recent `send`.
    pub fn on_send_outcome(&mut self, success: bool) {
        if success {
            self.sender.on_success();
            self.pump();
            return;
        }
        match self.sender.on_failure() {
            Some(event) => self.handle_sender_event(event),
            None => self.pump(),
        }
    }

    /// A previously requested [`Scheduler::schedule`] delay has elapsed.
    pub fn on_retry_timer(&mut self) {
        self.pump();
    }

    pub fn state(&self) -> control::State {
        self.control.state()
    }

    /// Access the embedder-supplied lower transport, e.g. to inspect what
    /// has been sent in tests or to reach methods specific to a concrete
    /// implementation.
    pub fn lower(&self) -> &L {
        &self.lower
    }

    pub fn lower_mut(&mut self) -> &mut L {
        &mut self.lower
    }

    fn apply(&mut self, actions: Vec<control::Action>) {
        for action in actions {
            match action {
                control::Action::SendControl(message) => self.sender.queue_control(message),
                control::Action::EmitConnected => {
                    self.events.emit(Event::Connected, Message::Connected)
                }
                control::Action::EmitDisconnected => {
                    self.events.emit(Event::Disconnected, Message::Disconnected)
                }
                control::Action::ForwardChunk(bytes) => self.handle_chunk(&bytes),
                control::Action::EmitError(reason) => self.events.emit(
                    Event::Error,
                    Message::Error {
                        json: String::new(),
                        reason,
                    },
                ),
            }
        }
    }

    fn handle_chunk(&mut self, bytes: &[u8]) {
        match self.receiver.on_chunk(bytes) {
            ReceiveOutcome::Incomplete => {}
            ReceiveOutcome::Message(value) => {
                debug!("message received");
                self.events.emit(Event::Message, Message::Object(value));
            }
            ReceiveOutcome::Malformed => {}
            ReceiveOutcome::ProtocolViolation => {
                let actions = self.control.on_receiver_protocol_violation();
                self.apply(actions);
            }
        }
    }

    fn pump(&mut self) {
        let session_open = self.control.is_open();
        let tx_chunk_size = self.control.params().tx_chunk_size;
        match self.sender.next(session_open, tx_chunk_size) {
            Some(NextOutcome::Send(outgoing)) => self.lower.send(encode_outgoing(&outgoing)),
            Some(NextOutcome::Failed(event)) => self.handle_sender_event(event),
            None => {}
        }
    }

    /// Shared handling for a reported send failure and a synthetic one
    /// (the session closed before a queued object could be sent) — both
    /// consume exactly one unit of retry budget the same way.
    fn handle_sender_event(&mut self, event: SenderEvent) {
        match event {
            SenderEvent::ScheduleRetry => {
                self.scheduler
                    .schedule(Duration::from_millis(self.retry_backoff_ms));
            }
            SenderEvent::ControlExhausted => {
                let actions = self.control.on_control_send_exhausted();
                self.apply(actions);
                self.pump();
            }
            SenderEvent::ObjectExhausted { json } => {
                self.events.emit(
                    Event::Error,
                    Message::Error {
                        json,
                        reason: "Too many failed transfer attempts".to_string(),
                    },
                );
                self.pump();
            }
        }
    }
}

fn encode_outgoing(outgoing: &Outgoing) -> HashMap<String, Value> {
    let mut dict = HashMap::new();
    match outgoing {
        Outgoing::Control(ControlMessage::ResetRequest) => {
            dict.insert(wire::KEY_RESET_REQUEST.to_string(), Value::from(0));
        }
        Outgoing::Control(ControlMessage::ResetComplete(caps)) => {
            dict.insert(
                wire::KEY_RESET_COMPLETE.to_string(),
                Value::from(caps.encode().to_vec()),
            );
        }
        Outgoing::Control(ControlMessage::UnsupportedError) => {
            dict.insert(wire::KEY_UNSUPPORTED_ERROR.to_string(), Value::from(0));
        }
        Outgoing::Chunk(bytes) => {
            dict.insert(wire::KEY_CHUNK.to_string(), Value::from(bytes.clone()));
        }
    }
    dict
}

fn decode_inbound(dict: &HashMap<String, Value>) -> Option<Inbound> {
    if dict.contains_key(wire::KEY_RESET_REQUEST) {
        return Some(Inbound::ResetRequest);
    }
    if let Some(value) = dict.get(wire::KEY_RESET_COMPLETE) {
        let bytes = value_to_bytes(value)?;
        return LocalCapabilities::decode(&bytes).map(Inbound::ResetComplete);
    }
    if let Some(value) = dict.get(wire::KEY_CHUNK) {
        return value_to_bytes(value).map(Inbound::Chunk);
    }
    if dict.contains_key(wire::KEY_UNSUPPORTED_ERROR) {
        return Some(Inbound::UnsupportedError);
    }
    None
}

fn value_to_bytes(value: &Value) -> Option<Vec<u8>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeLowerTransport {
        sent: Vec<HashMap<String, Value>>,
        passthrough_registered: Vec<String>,
        passthrough_removed: Vec<String>,
    }

    impl LowerTransport for FakeLowerTransport {
        fn send(&mut self, dict: HashMap<String, Value>) {
            self.sent.push(dict);
        }

        fn on_passthrough(&mut self, name: &str, mut handler: Box<dyn FnMut() + Send>) {
            handler();
            self.passthrough_registered.push(name.to_string());
        }

        fn off_passthrough(&mut self, name: &str) {
            self.passthrough_removed.push(name.to_string());
        }
    }

    fn remote_caps() -> HashMap<String, Value> {
        let mut dict = HashMap::new();
        dict.insert(
            wire::KEY_RESET_COMPLETE.to_string(),
            json!(LocalCapabilities::default().encode().to_vec()),
        );
        dict
    }

    #[test]
    fn full_handshake_reaches_session_open_and_emits_connected() {
        let mut transport =
            Transport::new(FakeLowerTransport::default(), ManualScheduler::default());
        let connected = Arc::new(Mutex::new(false));
        let c = connected.clone();
        transport.on(
            Event::Connected,
            Box::new(move |_| *c.lock().unwrap() = true),
        );

        transport.on_ready();
        assert_eq!(transport.lower.sent.len(), 1);
        assert!(transport.lower.sent[0].contains_key(wire::KEY_RESET_REQUEST));

        transport.on_send_outcome(true);
        transport.on_appmessage(&remote_caps());

        assert_eq!(transport.state(), control::State::SessionOpen);
        assert!(*connected.lock().unwrap());
        // our own ResetComplete must have gone out as the second send
        assert_eq!(transport.lower.sent.len(), 2);
        assert!(transport.lower.sent[1].contains_key(wire::KEY_RESET_COMPLETE));
    }

    #[test]
    fn post_message_after_open_sends_a_chunk() {
        let mut transport =
            Transport::new(FakeLowerTransport::default(), ManualScheduler::default());
        transport.on_ready();
        transport.on_send_outcome(true);
        transport.on_appmessage(&remote_caps());
        transport.on_send_outcome(true);

        transport.post_message(&json!({"a": 1})).unwrap();
        let last = transport.lower.sent.last().unwrap();
        assert!(last.contains_key(wire::KEY_CHUNK));
    }

    #[test]
    fn control_failure_schedules_retry_and_retries_on_timer() {
        let mut transport =
            Transport::new(FakeLowerTransport::default(), ManualScheduler::default());
        transport.on_ready();
        let sent_before = transport.lower.sent.len();
        transport.on_send_outcome(false);
        assert_eq!(transport.scheduler.requested.len(), 1);
        transport.on_retry_timer();
        assert_eq!(transport.lower.sent.len(), sent_before + 1);
        assert!(transport.lower.sent.last().unwrap().contains_key(wire::KEY_RESET_REQUEST));
    }

    #[test]
    fn has_raw_send_is_false() {
        assert!(!Transport::<FakeLowerTransport, ManualScheduler>::has_raw_send());
    }

    #[test]
    fn unrecognized_event_names_pass_through_to_the_lower_transport() {
        let mut transport =
            Transport::new(FakeLowerTransport::default(), ManualScheduler::default());
        let fired = Arc::new(Mutex::new(false));
        let f = fired.clone();
        transport.on_passthrough("accelData", Box::new(move || *f.lock().unwrap() = true));
        assert!(*fired.lock().unwrap());
        assert_eq!(transport.lower.passthrough_registered, vec!["accelData"]);

        transport.off_passthrough("accelData");
        assert_eq!(transport.lower.passthrough_removed, vec!["accelData"]);
    }

    #[test]
    fn remote_unsupported_error_while_ri_emits_a_fatal_error_event() {
        let mut transport =
            Transport::new(FakeLowerTransport::default(), ManualScheduler::default());
        transport.on_ready();
        transport.on_send_outcome(true);
        transport.on_appmessage(&remote_caps());
        transport.on_send_outcome(true);
        assert_eq!(transport.state(), control::State::SessionOpen);

        let mut reset_request = HashMap::new();
        reset_request.insert(wire::KEY_RESET_REQUEST.to_string(), json!(0));
        transport.on_appmessage(&reset_request);
        assert_eq!(
            transport.state(),
            control::State::AwaitingResetCompleteRemoteInitiated
        );

        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        transport.on(
            Event::Error,
            Box::new(move |m| {
                if let Message::Error { reason, .. } = m {
                    e.lock().unwrap().push(reason.clone());
                }
            }),
        );

        let mut unsupported = HashMap::new();
        unsupported.insert(wire::KEY_UNSUPPORTED_ERROR.to_string(), json!(0));
        transport.on_appmessage(&unsupported);

        assert_eq!(
            transport.state(),
            control::State::AwaitingResetCompleteLocalInitiated
        );
        assert_eq!(
            errors.lock().unwrap().as_slice(),
            &["remote rejected our protocol version".to_string()]
        );
    }
}
