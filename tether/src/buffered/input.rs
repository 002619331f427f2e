//! Buffered input channel with per-identity response buffering and
//! offline-timeout-based forced disconnection.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::channel::{
    ConnectionEvent, InputChannelHandler, InputDuplexChannel, MessageEvent, BROADCAST_RECEIVER_ID,
};
use crate::codec::MessageData;
use crate::error::{ChannelError, ChannelResult};
use crate::provider::{Providers, TaskProvider, TimeProvider};

use super::{join_bounded, BufferConfig};

/// Events queued for asynchronous, in-order delivery to the handler.
enum InputEvent {
    Message(MessageEvent),
    Connected(String),
    Disconnected(String),
}

/// Bookkeeping for one tracked response receiver identity.
struct ReceiverContext {
    /// Whether the identity currently has a live transport connection.
    online: bool,

    /// Whether `responseReceiverConnected` has been delivered for this
    /// identity. Reconnects of a known identity are not re-announced, and
    /// an identity that never connected is expired silently.
    announced: bool,

    /// At most one flusher task drains this identity's buffer at a time.
    flush_active: bool,

    /// Responses awaiting delivery, oldest first. Every response for the
    /// identity flows through this queue, which is what keeps delivery
    /// ordered across reconnect drains.
    pending: VecDeque<MessageData>,

    /// Last observed inbound activity, for the offline timeout.
    last_activity: Duration,
}

impl ReceiverContext {
    fn offline_at(now: Duration) -> Self {
        Self {
            online: false,
            announced: false,
            flush_active: false,
            pending: VecDeque::new(),
            last_activity: now,
        }
    }
}

/// A resilient wrapper around a raw input-role channel.
///
/// Responses addressed to a receiver identity that is not currently
/// connected (not yet opened, or mid-reconnect) are buffered and flushed in
/// arrival order once that identity (re)connects. An identity idle for
/// longer than [`BufferConfig::max_offline_time`] is declared permanently
/// disconnected: its buffer is discarded and
/// `responseReceiverDisconnected` fires.
///
/// Implements [`InputDuplexChannel`] itself, so it substitutes one-for-one
/// for the raw channel it wraps.
pub struct BufferedInputChannel<P: Providers> {
    inner: Arc<Inner<P>>,
}

struct Inner<P: Providers> {
    self_ref: Weak<Inner<P>>,
    raw: Arc<dyn InputDuplexChannel>,
    providers: P,
    config: BufferConfig,
    state: Mutex<InputState>,
}

struct InputState {
    listening: bool,
    stop_requested: bool,

    /// All tracked identities, connected or mid-reconnect. The `"*"`
    /// broadcast sentinel never appears as a key.
    receivers: HashMap<String, ReceiverContext>,

    /// At most one offline-checker / dispatch task runs at a time.
    checker_active: bool,
    dispatch_active: bool,

    events: VecDeque<InputEvent>,
    handler: Option<Arc<dyn InputChannelHandler>>,

    /// Live flusher/checker handles, joined (bounded) on stop.
    task_handles: Vec<JoinHandle<()>>,
}

impl<P: Providers> BufferedInputChannel<P> {
    /// Wrap `raw` with response buffering per `config`.
    pub fn new(raw: Arc<dyn InputDuplexChannel>, providers: P, config: BufferConfig) -> Self {
        Self {
            inner: Arc::new_cyclic(|self_ref| Inner {
                self_ref: self_ref.clone(),
                raw,
                providers,
                config,
                state: Mutex::new(InputState {
                    listening: false,
                    stop_requested: false,
                    receivers: HashMap::new(),
                    checker_active: false,
                    dispatch_active: false,
                    events: VecDeque::new(),
                    handler: None,
                    task_handles: Vec::new(),
                }),
            }),
        }
    }

    /// Number of responses buffered for the given identity.
    pub fn buffered_response_count(&self, response_receiver_id: &str) -> usize {
        self.inner
            .lock_state()
            .receivers
            .get(response_receiver_id)
            .map(|ctx| ctx.pending.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl<P: Providers> InputDuplexChannel for BufferedInputChannel<P> {
    fn channel_id(&self) -> &str {
        self.inner.raw.channel_id()
    }

    async fn start_listening(&self) -> ChannelResult<()> {
        // Reserve the listening state before touching the raw channel, so a
        // concurrent second call fails here and cannot detach the handler
        // this call is about to attach.
        {
            let mut state = self.inner.lock_state();
            if state.listening {
                return Err(ChannelError::AlreadyListening);
            }
            state.listening = true;
            state.stop_requested = false;
        }

        self.inner
            .raw
            .set_event_handler(Some(self.inner.clone() as Arc<dyn InputChannelHandler>));

        if let Err(e) = self.inner.raw.start_listening().await {
            self.inner.raw.set_event_handler(None);
            self.inner.lock_state().listening = false;
            return Err(e);
        }
        Ok(())
    }

    async fn stop_listening(&self) {
        let handles = {
            let mut state = self.inner.lock_state();
            state.stop_requested = true;
            std::mem::take(&mut state.task_handles)
        };

        let time = self.inner.providers.time();
        for handle in handles {
            join_bounded(time, self.inner.config.shutdown_timeout, "input", handle).await;
        }

        self.inner.raw.stop_listening().await;
        self.inner.raw.set_event_handler(None);

        let mut state = self.inner.lock_state();
        state.listening = false;
        state.receivers.clear();
        state.checker_active = false;
        state.stop_requested = false;
        tracing::debug!("input channel stopped listening");
    }

    fn is_listening(&self) -> bool {
        self.inner.lock_state().listening
    }

    async fn send_response_message(
        &self,
        response_receiver_id: &str,
        data: MessageData,
    ) -> ChannelResult<()> {
        let now = self.inner.providers.time().now();
        let mut state = self.inner.lock_state();
        if !state.listening || state.stop_requested {
            return Err(ChannelError::NotListening);
        }

        if response_receiver_id == BROADCAST_RECEIVER_ID {
            // Fan out to currently connected identities only; the sentinel
            // itself is never tracked.
            let targets: Vec<String> = state
                .receivers
                .iter()
                .filter(|(_, ctx)| ctx.online)
                .map(|(id, _)| id.clone())
                .collect();
            for id in targets {
                if let Some(ctx) = state.receivers.get_mut(&id) {
                    ctx.pending.push_back(data.clone());
                }
                self.inner.spawn_flusher_locked(&mut state, &id);
            }
            return Ok(());
        }

        let ctx = state
            .receivers
            .entry(response_receiver_id.to_string())
            .or_insert_with(|| ReceiverContext::offline_at(now));
        ctx.pending.push_back(data);
        let online = ctx.online;
        tracing::debug!(
            response_receiver_id,
            buffered = state
                .receivers
                .get(response_receiver_id)
                .map(|c| c.pending.len())
                .unwrap_or(0),
            online,
            "response queued"
        );
        if online {
            self.inner
                .spawn_flusher_locked(&mut state, response_receiver_id);
        } else {
            // The identity is tracked but offline; make sure its buffer
            // expires if it never shows up.
            self.inner.spawn_checker_locked(&mut state);
        }
        Ok(())
    }

    async fn disconnect_response_receiver(&self, response_receiver_id: &str) -> ChannelResult<()> {
        {
            let mut state = self.inner.lock_state();
            if !state.listening {
                return Err(ChannelError::NotListening);
            }
            if let Some(ctx) = state.receivers.remove(response_receiver_id) {
                if ctx.announced {
                    self.inner.enqueue_event_locked(
                        &mut state,
                        InputEvent::Disconnected(response_receiver_id.to_string()),
                    );
                }
            }
        }
        self.inner
            .raw
            .disconnect_response_receiver(response_receiver_id)
            .await
    }

    fn set_event_handler(&self, handler: Option<Arc<dyn InputChannelHandler>>) {
        self.inner.lock_state().handler = handler;
    }
}

impl<P: Providers> Inner<P> {
    fn lock_state(&self) -> MutexGuard<'_, InputState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track_handle_locked(state: &mut InputState, handle: JoinHandle<()>) {
        state.task_handles.retain(|h| !h.is_finished());
        state.task_handles.push(handle);
    }

    fn spawn_flusher_locked(&self, state: &mut InputState, response_receiver_id: &str) {
        let Some(ctx) = state.receivers.get_mut(response_receiver_id) else {
            return;
        };
        if ctx.flush_active || ctx.pending.is_empty() || state.stop_requested {
            return;
        }
        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };
        ctx.flush_active = true;
        let id = response_receiver_id.to_string();
        let handle = self.providers.task().spawn_task("input-flush", async move {
            inner.flusher_task(id).await;
        });
        Self::track_handle_locked(state, handle);
    }

    fn spawn_checker_locked(&self, state: &mut InputState) {
        if state.checker_active || state.stop_requested {
            return;
        }
        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };
        state.checker_active = true;
        let handle = self
            .providers
            .task()
            .spawn_task("input-offline-check", async move {
                inner.checker_task().await;
            });
        Self::track_handle_locked(state, handle);
    }

    fn enqueue_event_locked(&self, state: &mut InputState, event: InputEvent) {
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
            .spawn_task("input-dispatch", async move {
                inner.dispatch_task().await;
            });
    }

    /// Drains one identity's response buffer head-first while it is online.
    ///
    /// Exits when the buffer is empty, the identity goes offline (messages
    /// stay buffered for the next reconnect), or the channel stops.
    async fn flusher_task(self: Arc<Self>, response_receiver_id: String) {
        loop {
            let next = {
                let mut state = self.lock_state();
                if state.stop_requested || !state.listening {
                    if let Some(ctx) = state.receivers.get_mut(&response_receiver_id) {
                        ctx.flush_active = false;
                    }
                    return;
                }
                let Some(ctx) = state.receivers.get_mut(&response_receiver_id) else {
                    return;
                };
                if !ctx.online {
                    ctx.flush_active = false;
                    return;
                }
                match ctx.pending.pop_front() {
                    Some(message) => message,
                    None => {
                        ctx.flush_active = false;
                        return;
                    }
                }
            };

            match self
                .raw
                .send_response_message(&response_receiver_id, next.clone())
                .await
            {
                Ok(()) => continue,
                Err(e) => {
                    tracing::warn!(
                        response_receiver_id = response_receiver_id.as_str(),
                        "response send failed, keeping it buffered: {}",
                        e
                    );
                    let now = self.providers.time().now();
                    let mut state = self.lock_state();
                    if let Some(ctx) = state.receivers.get_mut(&response_receiver_id) {
                        // Put the message back at the head and treat the
                        // identity as offline until the transport proves
                        // otherwise.
                        ctx.pending.push_front(next);
                        ctx.online = false;
                        ctx.last_activity = now;
                        ctx.flush_active = false;
                        self.spawn_checker_locked(&mut state);
                    }
                    return;
                }
            }
        }
    }

    /// Expires identities that stayed offline longer than the configured
    /// budget. Runs only while at least one identity is offline, sleeping
    /// until the nearest expiry deadline.
    async fn checker_task(self: Arc<Self>) {
        let time = self.providers.time().clone();

        loop {
            let sleep_for = {
                let mut state = self.lock_state();
                if state.stop_requested || !state.listening {
                    state.checker_active = false;
                    return;
                }

                let now = time.now();
                let expired: Vec<String> = state
                    .receivers
                    .iter()
                    .filter(|(_, ctx)| {
                        !ctx.online
                            && now.saturating_sub(ctx.last_activity) >= self.config.max_offline_time
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in expired {
                    tracing::debug!(
                        response_receiver_id = id.as_str(),
                        "identity exceeded max offline time, discarding its buffer"
                    );
                    if let Some(ctx) = state.receivers.remove(&id) {
                        if ctx.announced {
                            self.enqueue_event_locked(&mut state, InputEvent::Disconnected(id));
                        }
                    }
                }

                let next_deadline = state
                    .receivers
                    .values()
                    .filter(|ctx| !ctx.online)
                    .map(|ctx| ctx.last_activity + self.config.max_offline_time)
                    .min();
                match next_deadline {
                    Some(deadline) => deadline
                        .saturating_sub(now)
                        .max(Duration::from_millis(10)),
                    None => {
                        state.checker_active = false;
                        return;
                    }
                }
            };

            time.sleep(sleep_for).await;
        }
    }

    /// Delivers queued events to the handler, one at a time, in order.
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
            let connection_event = |id: String| ConnectionEvent {
                channel_id: self.raw.channel_id().to_string(),
                response_receiver_id: id,
            };
            match event {
                InputEvent::Message(message) => handler.on_message_received(message),
                InputEvent::Connected(id) => {
                    handler.on_response_receiver_connected(connection_event(id))
                }
                InputEvent::Disconnected(id) => {
                    handler.on_response_receiver_disconnected(connection_event(id))
                }
            }
        }
    }

    /// Mark an identity online, announce it if new, and kick its flusher.
    fn mark_online_locked(&self, state: &mut InputState, id: &str, now: Duration) {
        let ctx = state
            .receivers
            .entry(id.to_string())
            .or_insert_with(|| ReceiverContext::offline_at(now));
        ctx.online = true;
        ctx.last_activity = now;
        let announce = !ctx.announced;
        ctx.announced = true;
        if announce {
            self.enqueue_event_locked(state, InputEvent::Connected(id.to_string()));
        }
        self.spawn_flusher_locked(state, id);
    }
}

/// Bridge for the raw channel's events.
impl<P: Providers> InputChannelHandler for Inner<P> {
    fn on_message_received(&self, event: MessageEvent) {
        let now = self.providers.time().now();
        let mut state = self.lock_state();
        if !state.listening || state.stop_requested {
            return;
        }
        self.mark_online_locked(&mut state, &event.response_receiver_id, now);
        self.enqueue_event_locked(&mut state, InputEvent::Message(event));
    }

    fn on_response_receiver_connected(&self, event: ConnectionEvent) {
        let now = self.providers.time().now();
        let mut state = self.lock_state();
        if !state.listening || state.stop_requested {
            return;
        }
        self.mark_online_locked(&mut state, &event.response_receiver_id, now);
    }

    fn on_response_receiver_disconnected(&self, event: ConnectionEvent) {
        let now = self.providers.time().now();
        let mut state = self.lock_state();
        if !state.listening || state.stop_requested {
            return;
        }
        // Absorbed: the identity stays tracked with its buffer, and the
        // offline checker decides later whether this was permanent.
        if let Some(ctx) = state.receivers.get_mut(&event.response_receiver_id) {
            tracing::debug!(
                response_receiver_id = event.response_receiver_id.as_str(),
                "receiver dropped, holding its buffer until the offline deadline"
            );
            ctx.online = false;
            ctx.last_activity = now;
            self.spawn_checker_locked(&mut state);
        }
    }
}
