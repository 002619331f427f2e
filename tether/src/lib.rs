//! # Tether
//!
//! Resilient duplex messaging over replaceable transports.
//!
//! This crate provides:
//! - **Codec**: self-describing and compact wire formats for protocol frames
//! - **Channels**: the duplex channel contract any transport plugs into
//! - **Buffered wrappers**: message buffering with background reconnection
//! - **Providers**: injected time and task scheduling for deterministic tests

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// Buffered channel wrappers with reconnection and offline timeouts.
pub mod buffered;

/// Duplex channel traits and event types.
pub mod channel;

/// Protocol message model and wire formatters.
pub mod codec;

/// Error types for channel operations.
pub mod error;

/// Injected time and task-scheduling providers.
pub mod provider;

/// Scriptable channels and recording handlers for tests.
pub mod testing;

// =============================================================================
// Public API Re-exports
// =============================================================================

// Buffered exports
pub use buffered::{BufferConfig, BufferedInputChannel, BufferedOutputChannel};

// Channel exports
pub use channel::{
    BROADCAST_RECEIVER_ID, ConnectionEvent, InputChannelHandler, InputDuplexChannel, MessageEvent,
    OutputChannelHandler, OutputDuplexChannel, new_response_receiver_id,
};

// Codec exports
pub use codec::{
    CodecError, CompactFormatter, DecodedFrame, Endianness, MAX_FRAME_SIZE, MessageData,
    MessageKind, ProtocolFormatter, ProtocolMessage, SelfDescribingFormatter, TextEncoding,
};

// Error exports
pub use error::{ChannelError, ChannelResult};

// Provider exports
pub use provider::{
    Providers, TaskProvider, TimeError, TimeProvider, TokioProviders, TokioTaskProvider,
    TokioTimeProvider,
};
