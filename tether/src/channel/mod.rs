//! Duplex channel identity contract.
//!
//! The minimal capability set any raw transport must expose for the
//! resilience layer to wrap it: an output role (the client side, owning a
//! stable response receiver id) and an input role (the listening side,
//! routing responses by receiver id).
//!
//! A *channel id* identifies **where** (a transport address); a *response
//! receiver id* identifies **who** (one logical client instance), and stays
//! stable across every reconnect of the underlying transport.
//!
//! Events are delivered through handler traits registered with
//! `set_event_handler`. Implementations must deliver events for one
//! response receiver id in the order they were generated, but may use any
//! thread to do so; consumers must not assume same-thread execution.

use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::MessageData;
use crate::error::ChannelResult;

/// Sentinel receiver id that broadcasts a response to every currently
/// connected receiver.
///
/// A routing convention, not a real identity: implementations fan the send
/// out and never track `"*"` as a client.
pub const BROADCAST_RECEIVER_ID: &str = "*";

/// Generate a fresh response receiver id.
///
/// Output channel implementations call this once, before their first
/// connection attempt, and reuse the id across every reconnect.
pub fn new_response_receiver_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A connection lifecycle event for one response receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Address of the channel the event occurred on.
    pub channel_id: String,
    /// Identity the event concerns.
    pub response_receiver_id: String,
}

/// A message or response delivery event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// Address of the channel the message arrived on.
    pub channel_id: String,
    /// Identity the message belongs to.
    pub response_receiver_id: String,
    /// The delivered payload.
    pub data: MessageData,
}

/// Events raised by an output-role channel.
///
/// Methods default to no-ops so implementors override only what they need.
pub trait OutputChannelHandler: Send + Sync {
    /// The connection was established (or re-established).
    fn on_connection_opened(&self, _event: ConnectionEvent) {}

    /// The connection was closed.
    fn on_connection_closed(&self, _event: ConnectionEvent) {}

    /// A response message arrived from the input side.
    fn on_response_received(&self, _event: MessageEvent) {}
}

/// Events raised by an input-role channel.
pub trait InputChannelHandler: Send + Sync {
    /// A message arrived from an output channel.
    fn on_message_received(&self, _event: MessageEvent) {}

    /// A response receiver connected.
    fn on_response_receiver_connected(&self, _event: ConnectionEvent) {}

    /// A response receiver disconnected.
    fn on_response_receiver_disconnected(&self, _event: ConnectionEvent) {}
}

/// Output role of a duplex channel: the client side.
///
/// Implementations own a stable channel id and response receiver id and
/// report connection state truthfully; the buffered wrapper layers queueing
/// and reconnection on top of exactly this surface, and implements it
/// itself so it substitutes one-for-one for a raw channel.
#[async_trait]
pub trait OutputDuplexChannel: Send + Sync {
    /// Transport address this channel connects to.
    fn channel_id(&self) -> &str;

    /// Stable identity of this client instance.
    fn response_receiver_id(&self) -> &str;

    /// Open the connection.
    ///
    /// # Errors
    ///
    /// [`crate::ChannelError::AlreadyConnected`] when already open;
    /// [`crate::ChannelError::Transport`] when the transport cannot connect.
    async fn open_connection(&self) -> ChannelResult<()>;

    /// Close the connection. Idempotent.
    async fn close_connection(&self);

    /// Whether the channel is currently open.
    fn is_connected(&self) -> bool;

    /// Send a message to the input side.
    ///
    /// # Errors
    ///
    /// [`crate::ChannelError::NotConnected`] when the channel is not open;
    /// [`crate::ChannelError::Transport`] when the transport send fails.
    async fn send_message(&self, data: MessageData) -> ChannelResult<()>;

    /// Register (or with `None`, detach) the event handler.
    fn set_event_handler(&self, handler: Option<Arc<dyn OutputChannelHandler>>);
}

/// Input role of a duplex channel: the listening side.
#[async_trait]
pub trait InputDuplexChannel: Send + Sync {
    /// Transport address this channel listens on.
    fn channel_id(&self) -> &str;

    /// Start listening for connecting output channels.
    ///
    /// # Errors
    ///
    /// [`crate::ChannelError::AlreadyListening`] when already listening;
    /// [`crate::ChannelError::Transport`] when the transport cannot bind.
    async fn start_listening(&self) -> ChannelResult<()>;

    /// Stop listening and disconnect every receiver. Idempotent.
    async fn stop_listening(&self);

    /// Whether the channel is currently listening.
    fn is_listening(&self) -> bool;

    /// Send a response to the receiver with the given id.
    ///
    /// The sentinel [`BROADCAST_RECEIVER_ID`] fans the response out to every
    /// currently connected receiver.
    ///
    /// # Errors
    ///
    /// [`crate::ChannelError::NotListening`] when not listening;
    /// [`crate::ChannelError::Transport`] when the transport send fails.
    async fn send_response_message(
        &self,
        response_receiver_id: &str,
        data: MessageData,
    ) -> ChannelResult<()>;

    /// Forcibly disconnect the receiver with the given id.
    async fn disconnect_response_receiver(&self, response_receiver_id: &str) -> ChannelResult<()>;

    /// Register (or with `None`, detach) the event handler.
    fn set_event_handler(&self, handler: Option<Arc<dyn InputChannelHandler>>);
}
