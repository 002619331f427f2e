//! Scriptable channel implementations and recording handlers for tests.
//!
//! [`ScriptedOutputChannel`] and [`ScriptedInputChannel`] stand in for a
//! real transport: tests script connectivity failures and fire transport
//! events by hand, then assert on what was sent through the channel.
//! [`RecordingOutputHandler`] and [`RecordingInputHandler`] capture every
//! delivered event in order.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::channel::{
    ConnectionEvent, InputChannelHandler, InputDuplexChannel, MessageEvent, OutputChannelHandler,
    OutputDuplexChannel,
};
use crate::codec::MessageData;
use crate::error::{ChannelError, ChannelResult};

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An output-role channel whose connectivity is scripted by the test.
///
/// `open_connection` succeeds unless open failures have been scripted, and
/// `send_message` records payloads unless send failures are switched on.
/// Transport-initiated events (drops, responses) are fired explicitly via
/// the `fire_*` methods.
pub struct ScriptedOutputChannel {
    channel_id: String,
    response_receiver_id: String,
    state: Mutex<ScriptedOutputState>,
}

struct ScriptedOutputState {
    connected: bool,
    open_failures_remaining: usize,
    fail_sends: bool,
    sent: Vec<MessageData>,
    open_attempts: usize,
    handler: Option<Arc<dyn OutputChannelHandler>>,
}

impl ScriptedOutputChannel {
    /// Channel for the given address with a fresh receiver id.
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            response_receiver_id: crate::channel::new_response_receiver_id(),
            state: Mutex::new(ScriptedOutputState {
                connected: false,
                open_failures_remaining: 0,
                fail_sends: false,
                sent: Vec::new(),
                open_attempts: 0,
                handler: None,
            }),
        }
    }

    /// Make the next `count` calls to `open_connection` fail.
    pub fn fail_next_opens(&self, count: usize) {
        lock_or_recover(&self.state).open_failures_remaining = count;
    }

    /// Switch send failures on or off.
    pub fn set_fail_sends(&self, fail: bool) {
        lock_or_recover(&self.state).fail_sends = fail;
    }

    /// Payloads successfully sent so far, oldest first.
    pub fn sent_messages(&self) -> Vec<MessageData> {
        lock_or_recover(&self.state).sent.clone()
    }

    /// How many times `open_connection` has been called.
    pub fn open_attempts(&self) -> usize {
        lock_or_recover(&self.state).open_attempts
    }

    /// Simulate the transport dropping the connection.
    ///
    /// Marks the channel disconnected and notifies the registered handler.
    pub fn fire_connection_closed(&self) {
        let handler = {
            let mut state = lock_or_recover(&self.state);
            state.connected = false;
            state.handler.clone()
        };
        if let Some(handler) = handler {
            handler.on_connection_closed(self.connection_event());
        }
    }

    /// Deliver a response from the input side to the registered handler.
    pub fn fire_response(&self, data: MessageData) {
        let handler = lock_or_recover(&self.state).handler.clone();
        if let Some(handler) = handler {
            handler.on_response_received(MessageEvent {
                channel_id: self.channel_id.clone(),
                response_receiver_id: self.response_receiver_id.clone(),
                data,
            });
        }
    }

    fn connection_event(&self) -> ConnectionEvent {
        ConnectionEvent {
            channel_id: self.channel_id.clone(),
            response_receiver_id: self.response_receiver_id.clone(),
        }
    }
}

#[async_trait]
impl OutputDuplexChannel for ScriptedOutputChannel {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn response_receiver_id(&self) -> &str {
        &self.response_receiver_id
    }

    async fn open_connection(&self) -> ChannelResult<()> {
        let handler = {
            let mut state = lock_or_recover(&self.state);
            state.open_attempts += 1;
            if state.open_failures_remaining > 0 {
                state.open_failures_remaining -= 1;
                return Err(ChannelError::Transport("scripted open failure".into()));
            }
            if state.connected {
                return Err(ChannelError::AlreadyConnected);
            }
            state.connected = true;
            state.handler.clone()
        };
        if let Some(handler) = handler {
            handler.on_connection_opened(self.connection_event());
        }
        Ok(())
    }

    async fn close_connection(&self) {
        lock_or_recover(&self.state).connected = false;
    }

    fn is_connected(&self) -> bool {
        lock_or_recover(&self.state).connected
    }

    async fn send_message(&self, data: MessageData) -> ChannelResult<()> {
        let mut state = lock_or_recover(&self.state);
        if !state.connected {
            return Err(ChannelError::NotConnected);
        }
        if state.fail_sends {
            return Err(ChannelError::Transport("scripted send failure".into()));
        }
        state.sent.push(data);
        Ok(())
    }

    fn set_event_handler(&self, handler: Option<Arc<dyn OutputChannelHandler>>) {
        lock_or_recover(&self.state).handler = handler;
    }
}

/// An input-role channel whose clients are scripted by the test.
///
/// Receiver connects, disconnects and inbound messages are fired explicitly
/// via the `fire_*` methods; responses sent through the channel are
/// recorded per receiver id.
pub struct ScriptedInputChannel {
    channel_id: String,
    state: Mutex<ScriptedInputState>,
}

struct ScriptedInputState {
    listening: bool,
    start_delay: Option<Duration>,
    failing_receivers: HashSet<String>,
    sent: Vec<(String, MessageData)>,
    forced_disconnects: Vec<String>,
    handler: Option<Arc<dyn InputChannelHandler>>,
}

impl ScriptedInputChannel {
    /// Channel listening at the given address.
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            state: Mutex::new(ScriptedInputState {
                listening: false,
                start_delay: None,
                failing_receivers: HashSet::new(),
                sent: Vec::new(),
                forced_disconnects: Vec::new(),
                handler: None,
            }),
        }
    }

    /// Make `start_listening` pause for `delay` before binding, so tests
    /// can interleave other calls with a startup in flight.
    pub fn set_start_delay(&self, delay: Duration) {
        lock_or_recover(&self.state).start_delay = Some(delay);
    }

    /// Whether an event handler is currently attached.
    pub fn has_event_handler(&self) -> bool {
        lock_or_recover(&self.state).handler.is_some()
    }

    /// Make sends to the given receiver id fail (or succeed again).
    pub fn set_send_failure(&self, response_receiver_id: &str, fail: bool) {
        let mut state = lock_or_recover(&self.state);
        if fail {
            state.failing_receivers.insert(response_receiver_id.to_string());
        } else {
            state.failing_receivers.remove(response_receiver_id);
        }
    }

    /// Responses successfully sent so far, as `(receiver id, payload)`
    /// pairs, oldest first.
    pub fn sent_responses(&self) -> Vec<(String, MessageData)> {
        lock_or_recover(&self.state).sent.clone()
    }

    /// Receiver ids passed to `disconnect_response_receiver`.
    pub fn forced_disconnects(&self) -> Vec<String> {
        lock_or_recover(&self.state).forced_disconnects.clone()
    }

    /// Simulate a receiver connecting.
    pub fn fire_receiver_connected(&self, response_receiver_id: &str) {
        let handler = lock_or_recover(&self.state).handler.clone();
        if let Some(handler) = handler {
            handler.on_response_receiver_connected(self.connection_event(response_receiver_id));
        }
    }

    /// Simulate a receiver's transport connection dropping.
    pub fn fire_receiver_disconnected(&self, response_receiver_id: &str) {
        let handler = lock_or_recover(&self.state).handler.clone();
        if let Some(handler) = handler {
            handler.on_response_receiver_disconnected(self.connection_event(response_receiver_id));
        }
    }

    /// Deliver an inbound message from the given receiver to the handler.
    pub fn fire_message(&self, response_receiver_id: &str, data: MessageData) {
        let handler = lock_or_recover(&self.state).handler.clone();
        if let Some(handler) = handler {
            handler.on_message_received(MessageEvent {
                channel_id: self.channel_id.clone(),
                response_receiver_id: response_receiver_id.to_string(),
                data,
            });
        }
    }

    fn connection_event(&self, response_receiver_id: &str) -> ConnectionEvent {
        ConnectionEvent {
            channel_id: self.channel_id.clone(),
            response_receiver_id: response_receiver_id.to_string(),
        }
    }
}

#[async_trait]
impl InputDuplexChannel for ScriptedInputChannel {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    async fn start_listening(&self) -> ChannelResult<()> {
        let delay = {
            let state = lock_or_recover(&self.state);
            if state.listening {
                return Err(ChannelError::AlreadyListening);
            }
            state.start_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = lock_or_recover(&self.state);
        if state.listening {
            return Err(ChannelError::AlreadyListening);
        }
        state.listening = true;
        Ok(())
    }

    async fn stop_listening(&self) {
        lock_or_recover(&self.state).listening = false;
    }

    fn is_listening(&self) -> bool {
        lock_or_recover(&self.state).listening
    }

    async fn send_response_message(
        &self,
        response_receiver_id: &str,
        data: MessageData,
    ) -> ChannelResult<()> {
        let mut state = lock_or_recover(&self.state);
        if !state.listening {
            return Err(ChannelError::NotListening);
        }
        if state.failing_receivers.contains(response_receiver_id) {
            return Err(ChannelError::Transport("scripted send failure".into()));
        }
        state.sent.push((response_receiver_id.to_string(), data));
        Ok(())
    }

    async fn disconnect_response_receiver(&self, response_receiver_id: &str) -> ChannelResult<()> {
        lock_or_recover(&self.state)
            .forced_disconnects
            .push(response_receiver_id.to_string());
        Ok(())
    }

    fn set_event_handler(&self, handler: Option<Arc<dyn InputChannelHandler>>) {
        lock_or_recover(&self.state).handler = handler;
    }
}

/// One event observed by a [`RecordingOutputHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRecord {
    /// `on_connection_opened` fired.
    Opened(ConnectionEvent),
    /// `on_connection_closed` fired.
    Closed(ConnectionEvent),
    /// `on_response_received` fired.
    Response(MessageEvent),
}

/// Output handler that records every event it receives, in order.
#[derive(Default)]
pub struct RecordingOutputHandler {
    records: Mutex<Vec<OutputRecord>>,
}

impl RecordingOutputHandler {
    /// Fresh handler with no recorded events.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events recorded so far, oldest first.
    pub fn records(&self) -> Vec<OutputRecord> {
        lock_or_recover(&self.records).clone()
    }

    /// Payloads from recorded `Response` events, oldest first.
    pub fn responses(&self) -> Vec<MessageData> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                OutputRecord::Response(event) => Some(event.data),
                _ => None,
            })
            .collect()
    }
}

impl OutputChannelHandler for RecordingOutputHandler {
    fn on_connection_opened(&self, event: ConnectionEvent) {
        lock_or_recover(&self.records).push(OutputRecord::Opened(event));
    }

    fn on_connection_closed(&self, event: ConnectionEvent) {
        lock_or_recover(&self.records).push(OutputRecord::Closed(event));
    }

    fn on_response_received(&self, event: MessageEvent) {
        lock_or_recover(&self.records).push(OutputRecord::Response(event));
    }
}

/// One event observed by a [`RecordingInputHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRecord {
    /// `on_message_received` fired.
    Message(MessageEvent),
    /// `on_response_receiver_connected` fired.
    Connected(ConnectionEvent),
    /// `on_response_receiver_disconnected` fired.
    Disconnected(ConnectionEvent),
}

/// Input handler that records every event it receives, in order.
#[derive(Default)]
pub struct RecordingInputHandler {
    records: Mutex<Vec<InputRecord>>,
}

impl RecordingInputHandler {
    /// Fresh handler with no recorded events.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events recorded so far, oldest first.
    pub fn records(&self) -> Vec<InputRecord> {
        lock_or_recover(&self.records).clone()
    }

    /// Payloads from recorded `Message` events, oldest first.
    pub fn messages(&self) -> Vec<MessageData> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                InputRecord::Message(event) => Some(event.data),
                _ => None,
            })
            .collect()
    }
}

impl InputChannelHandler for RecordingInputHandler {
    fn on_message_received(&self, event: MessageEvent) {
        lock_or_recover(&self.records).push(InputRecord::Message(event));
    }

    fn on_response_receiver_connected(&self, event: ConnectionEvent) {
        lock_or_recover(&self.records).push(InputRecord::Connected(event));
    }

    fn on_response_receiver_disconnected(&self, event: ConnectionEvent) {
        lock_or_recover(&self.records).push(InputRecord::Disconnected(event));
    }
}
