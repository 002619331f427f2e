//! Buffered output channel with automatic reconnection and message queuing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::channel::{
    ConnectionEvent, MessageEvent, OutputChannelHandler, OutputDuplexChannel,
};
use crate::codec::MessageData;
use crate::error::{ChannelError, ChannelResult};
use crate::provider::{Providers, TaskProvider, TimeProvider};

use super::{join_bounded, BufferConfig};

/// Connection state of a buffered output channel.
///
/// `Opening` covers both the initial connect and any mid-life reconnect:
/// the channel accepts sends in that state, it just has not confirmed the
/// underlying transport yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Closed,
    Opening,
    Open,
}

/// Events queued for asynchronous, in-order delivery to the handler.
enum OutputEvent {
    Opened,
    Closed,
    Response(MessageEvent),
}

/// A resilient wrapper around a raw output-role channel.
///
/// Messages are appended to an ordered pending queue and drained by a
/// background sender task; connectivity is maintained by a background
/// reconnect task. Transient transport failures are absorbed silently for
/// up to [`BufferConfig::max_offline_time`], after which the channel closes
/// itself and fires `connectionClosed` exactly once.
///
/// Implements [`OutputDuplexChannel`] itself, so it substitutes one-for-one
/// for the raw channel it wraps.
pub struct BufferedOutputChannel<P: Providers> {
    inner: Arc<Inner<P>>,
}

struct Inner<P: Providers> {
    /// Weak self-reference so raw event callbacks (which only get `&self`)
    /// can hand an owned clone to spawned tasks.
    self_ref: Weak<Inner<P>>,
    raw: Arc<dyn OutputDuplexChannel>,
    providers: P,
    config: BufferConfig,
    state: Mutex<OutputState>,
}

struct OutputState {
    connection: ConnectionState,
    stop_requested: bool,

    /// Messages awaiting hand-off to the raw channel, oldest first.
    /// A message leaves only after a confirmed successful send.
    pending: VecDeque<MessageData>,

    /// At most one sender / reconnect / dispatch task runs at a time;
    /// these flags are flipped only under this mutex.
    sender_active: bool,
    reconnect_active: bool,
    dispatch_active: bool,

    events: VecDeque<OutputEvent>,
    handler: Option<Arc<dyn OutputChannelHandler>>,

    sender_handle: Option<JoinHandle<()>>,
    reconnect_handle: Option<JoinHandle<()>>,
}

impl<P: Providers> BufferedOutputChannel<P> {
    /// Wrap `raw` with buffering and reconnection per `config`.
    pub fn new(raw: Arc<dyn OutputDuplexChannel>, providers: P, config: BufferConfig) -> Self {
        Self {
            inner: Arc::new_cyclic(|self_ref| Inner {
                self_ref: self_ref.clone(),
                raw,
                providers,
                config,
                state: Mutex::new(OutputState {
                    connection: ConnectionState::Closed,
                    stop_requested: false,
                    pending: VecDeque::new(),
                    sender_active: false,
                    reconnect_active: false,
                    dispatch_active: false,
                    events: VecDeque::new(),
                    handler: None,
                    sender_handle: None,
                    reconnect_handle: None,
                }),
            }),
        }
    }

    /// Number of messages waiting for hand-off to the raw channel.
    pub fn pending_message_count(&self) -> usize {
        self.inner.lock_state().pending.len()
    }
}

#[async_trait]
impl<P: Providers> OutputDuplexChannel for BufferedOutputChannel<P> {
    fn channel_id(&self) -> &str {
        self.inner.raw.channel_id()
    }

    fn response_receiver_id(&self) -> &str {
        self.inner.raw.response_receiver_id()
    }

    async fn open_connection(&self) -> ChannelResult<()> {
        if self.inner.lock_state().connection != ConnectionState::Closed {
            return Err(ChannelError::AlreadyConnected);
        }

        // Attach to raw events before transitioning so a drop during the
        // very first connect is already observed.
        self.inner
            .raw
            .set_event_handler(Some(self.inner.clone() as Arc<dyn OutputChannelHandler>));

        {
            let mut state = self.inner.lock_state();
            if state.connection != ConnectionState::Closed {
                return Err(ChannelError::AlreadyConnected);
            }
            state.stop_requested = false;
            state.connection = ConnectionState::Opening;
            self.inner.spawn_reconnect_locked(&mut state);
        }
        tracing::debug!(
            channel_id = self.inner.raw.channel_id(),
            "output channel opened, reconnect task started"
        );
        Ok(())
    }

    async fn close_connection(&self) {
        let (reconnect_handle, sender_handle) = {
            let mut state = self.inner.lock_state();
            state.stop_requested = true;
            (state.reconnect_handle.take(), state.sender_handle.take())
        };

        let time = self.inner.providers.time();
        if let Some(handle) = reconnect_handle {
            join_bounded(time, self.inner.config.shutdown_timeout, "reconnect", handle).await;
        }
        if let Some(handle) = sender_handle {
            join_bounded(time, self.inner.config.shutdown_timeout, "sender", handle).await;
        }

        self.inner.raw.close_connection().await;
        self.inner.raw.set_event_handler(None);

        {
            let mut state = self.inner.lock_state();
            state.connection = ConnectionState::Closed;
            state.pending.clear();
            state.sender_active = false;
            state.reconnect_active = false;
            state.stop_requested = false;
        }
        tracing::debug!(
            channel_id = self.inner.raw.channel_id(),
            "output channel closed"
        );
    }

    fn is_connected(&self) -> bool {
        self.inner.lock_state().connection != ConnectionState::Closed
    }

    async fn send_message(&self, data: MessageData) -> ChannelResult<()> {
        let mut state = self.inner.lock_state();
        if state.connection == ConnectionState::Closed || state.stop_requested {
            return Err(ChannelError::NotConnected);
        }
        state.pending.push_back(data);
        tracing::debug!(
            queued = state.pending.len(),
            "message appended to pending queue"
        );
        self.inner.spawn_sender_locked(&mut state);
        Ok(())
    }

    fn set_event_handler(&self, handler: Option<Arc<dyn OutputChannelHandler>>) {
        self.inner.lock_state().handler = handler;
    }
}

impl<P: Providers> Inner<P> {
    fn lock_state(&self) -> MutexGuard<'_, OutputState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_reconnect_locked(&self, state: &mut OutputState) {
        if state.reconnect_active || state.stop_requested {
            return;
        }
        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };
        state.reconnect_active = true;
        let handle = self
            .providers
            .task()
            .spawn_task("output-reconnect", async move {
                inner.reconnect_task().await;
            });
        state.reconnect_handle = Some(handle);
    }

    fn spawn_sender_locked(&self, state: &mut OutputState) {
        if state.sender_active || state.stop_requested {
            return;
        }
        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };
        state.sender_active = true;
        let handle = self.providers.task().spawn_task("output-sender", async move {
            inner.sender_task().await;
        });
        state.sender_handle = Some(handle);
    }

    fn enqueue_event_locked(&self, state: &mut OutputState, event: OutputEvent) {
        state.events.push_back(event);
        if state.dispatch_active {
            return;
        }
        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };
        state.dispatch_active = true;
        let _ = self
            .providers
            .task()
            .spawn_task("output-dispatch", async move {
                inner.dispatch_task().await;
            });
    }

    /// Loops until the raw channel connects or the offline budget runs out.
    ///
    /// All transport errors along the way are absorbed; the only externally
    /// visible outcomes are `connectionOpened` (success) or a forced close
    /// with exactly one `connectionClosed` (budget exceeded).
    async fn reconnect_task(self: Arc<Self>) {
        let time = self.providers.time().clone();
        let started = time.now();

        loop {
            if self.lock_state().stop_requested {
                break;
            }

            match self.raw.open_connection().await {
                Ok(()) | Err(ChannelError::AlreadyConnected) => {
                    let mut state = self.lock_state();
                    state.reconnect_active = false;
                    if state.stop_requested || state.connection == ConnectionState::Closed {
                        return;
                    }
                    state.connection = ConnectionState::Open;
                    self.enqueue_event_locked(&mut state, OutputEvent::Opened);
                    if !state.pending.is_empty() {
                        self.spawn_sender_locked(&mut state);
                    }
                    tracing::debug!("raw channel connected");
                    return;
                }
                Err(e) => {
                    tracing::debug!("connect attempt failed, will retry: {}", e);
                }
            }

            if time.now().saturating_sub(started) >= self.config.max_offline_time {
                tracing::warn!(
                    "offline longer than {:?}, closing channel",
                    self.config.max_offline_time
                );
                self.force_close().await;
                return;
            }

            time.sleep(self.config.retry_interval).await;
        }

        self.lock_state().reconnect_active = false;
    }

    /// Offline-timeout close, run from inside the reconnect task.
    ///
    /// Unlike `close_connection` this must not join background tasks (it
    /// runs on one); the sender observes the `Closed` state and exits.
    async fn force_close(&self) {
        {
            let mut state = self.lock_state();
            state.reconnect_active = false;
            if state.connection == ConnectionState::Closed {
                return;
            }
            state.connection = ConnectionState::Closed;
            state.pending.clear();
            self.enqueue_event_locked(&mut state, OutputEvent::Closed);
        }
        self.raw.close_connection().await;
        self.raw.set_event_handler(None);
    }

    /// Drains the pending queue head-first while the raw channel is
    /// connected; retries the same head on failure. Never skips, never
    /// reorders. Exits once the queue is empty or the channel closes.
    async fn sender_task(self: Arc<Self>) {
        let time = self.providers.time().clone();

        loop {
            let head = {
                let mut state = self.lock_state();
                if state.stop_requested || state.connection == ConnectionState::Closed {
                    state.sender_active = false;
                    return;
                }
                match state.pending.front() {
                    Some(message) => message.clone(),
                    None => {
                        state.sender_active = false;
                        return;
                    }
                }
            };

            if self.raw.is_connected() {
                match self.raw.send_message(head).await {
                    Ok(()) => {
                        let mut state = self.lock_state();
                        state.pending.pop_front();
                        tracing::debug!(remaining = state.pending.len(), "message handed off");
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!("send failed, retrying same message: {}", e);
                    }
                }
            }

            time.sleep(self.config.retry_interval).await;
        }
    }

    /// Delivers queued events to the handler, one at a time, in order.
    /// Runs outside the state lock so a handler may call back into the
    /// channel (including `close_connection`) without deadlocking.
    async fn dispatch_task(self: Arc<Self>) {
        loop {
            let (event, handler) = {
                let mut state = self.lock_state();
                match state.events.pop_front() {
                    Some(event) => (event, state.handler.clone()),
                    None => {
                        state.dispatch_active = false;
                        return;
                    }
                }
            };

            let Some(handler) = handler else { continue };
            let connection_event = || ConnectionEvent {
                channel_id: self.raw.channel_id().to_string(),
                response_receiver_id: self.raw.response_receiver_id().to_string(),
            };
            match event {
                OutputEvent::Opened => handler.on_connection_opened(connection_event()),
                OutputEvent::Closed => handler.on_connection_closed(connection_event()),
                OutputEvent::Response(message) => handler.on_response_received(message),
            }
        }
    }
}

/// Bridge for the raw channel's events.
impl<P: Providers> OutputChannelHandler for Inner<P> {
    fn on_connection_opened(&self, _event: ConnectionEvent) {
        // The reconnect task owns the Opening -> Open transition and the
        // corresponding notification; a raw-level open on its own is noise.
        tracing::debug!("raw channel reported open");
    }

    fn on_connection_closed(&self, _event: ConnectionEvent) {
        let mut state = self.lock_state();
        match state.connection {
            ConnectionState::Closed => {
                if state.stop_requested {
                    self.enqueue_event_locked(&mut state, OutputEvent::Closed);
                }
            }
            ConnectionState::Opening | ConnectionState::Open => {
                if state.stop_requested {
                    self.enqueue_event_locked(&mut state, OutputEvent::Closed);
                } else {
                    tracing::debug!("raw channel dropped, starting reconnect");
                    state.connection = ConnectionState::Opening;
                    self.spawn_reconnect_locked(&mut state);
                }
            }
        }
    }

    fn on_response_received(&self, event: MessageEvent) {
        let mut state = self.lock_state();
        if state.connection == ConnectionState::Closed {
            return;
        }
        self.enqueue_event_locked(&mut state, OutputEvent::Response(event));
    }
}
