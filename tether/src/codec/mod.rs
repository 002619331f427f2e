//! Protocol message model and wire-framing codecs.
//!
//! A [`ProtocolFormatter`] translates logical [`ProtocolMessage`]s to and
//! from a byte stream. Two interchangeable formats are provided:
//!
//! - [`SelfDescribingFormatter`]: tagged frames that carry their own
//!   endianness and text-encoding flags, plus explicit open/close/poll
//!   frames. Works over any byte transport.
//! - [`CompactFormatter`]: data frames only, with a fixed configured
//!   endianness. Intended for transports with native connection semantics.
//!
//! Decoding never fails across the codec boundary: a malformed frame yields
//! a message of kind [`MessageKind::Unknown`] (and a `warn` log) so that one
//! corrupted frame cannot abort a read loop shared by other frames or
//! clients. A clean end-of-stream yields [`DecodedFrame::EndOfStream`].

use std::io::{Read, Write};

pub mod compact;
pub mod self_describing;

pub use compact::CompactFormatter;
pub use self_describing::{SelfDescribingFormatter, TextEncoding};

/// Maximum accepted frame body size (16 MiB).
///
/// Bounds allocations when a garbage length field is decoded; a frame
/// declaring a larger body decodes to [`MessageKind::Unknown`].
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Wire flag for a raw-bytes payload.
pub(crate) const DATA_BYTES_FLAG: u8 = 10;

/// Wire flag for a text payload.
pub(crate) const DATA_TEXT_FLAG: u8 = 20;

/// Byte order used for multi-byte integers in encoded frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Little-endian (wire flag 10).
    #[default]
    Little,
    /// Big-endian (wire flag 20).
    Big,
}

impl Endianness {
    pub(crate) fn write_u32(&self, value: u32, out: &mut Vec<u8>) {
        match self {
            Endianness::Little => out.extend_from_slice(&value.to_le_bytes()),
            Endianness::Big => out.extend_from_slice(&value.to_be_bytes()),
        }
    }

    pub(crate) fn read_u32(&self, bytes: [u8; 4]) -> u32 {
        match self {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        }
    }
}

/// Logical kind of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Decode failure sentinel. Never encoded; carries no payload.
    Unknown,
    /// A client announces its response receiver id (wire value 10).
    OpenConnectionRequest,
    /// A client withdraws its response receiver id (wire value 20).
    CloseConnectionRequest,
    /// A client polls for buffered responses (wire value 30).
    PollRequest,
    /// A data message (wire value 40).
    MessageReceived,
}

impl MessageKind {
    /// Wire byte for this kind, or `None` for [`MessageKind::Unknown`].
    pub fn wire_value(&self) -> Option<u8> {
        match self {
            MessageKind::Unknown => None,
            MessageKind::OpenConnectionRequest => Some(10),
            MessageKind::CloseConnectionRequest => Some(20),
            MessageKind::PollRequest => Some(30),
            MessageKind::MessageReceived => Some(40),
        }
    }

    /// Parse a wire byte into a kind.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            10 => Some(MessageKind::OpenConnectionRequest),
            20 => Some(MessageKind::CloseConnectionRequest),
            30 => Some(MessageKind::PollRequest),
            40 => Some(MessageKind::MessageReceived),
            _ => None,
        }
    }
}

/// Payload of a data message: raw bytes or text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageData {
    /// Opaque binary payload.
    Bytes(Vec<u8>),
    /// Text payload, encoded per the formatter's text encoding.
    Text(String),
}

impl MessageData {
    /// Payload length in bytes; text is measured as UTF-8 bytes.
    pub fn len(&self) -> usize {
        match self {
            MessageData::Bytes(b) => b.len(),
            MessageData::Text(s) => s.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u8>> for MessageData {
    fn from(bytes: Vec<u8>) -> Self {
        MessageData::Bytes(bytes)
    }
}

impl From<String> for MessageData {
    fn from(text: String) -> Self {
        MessageData::Text(text)
    }
}

impl From<&str> for MessageData {
    fn from(text: &str) -> Self {
        MessageData::Text(text.to_string())
    }
}

/// A logical protocol message exchanged between duplex channel endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    /// What the message means.
    pub kind: MessageKind,
    /// Identity of the client the message belongs to.
    pub response_receiver_id: String,
    /// Payload, present only for [`MessageKind::MessageReceived`].
    pub data: Option<MessageData>,
}

impl ProtocolMessage {
    /// An open-connection request for the given receiver id.
    pub fn open_connection(response_receiver_id: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::OpenConnectionRequest,
            response_receiver_id: response_receiver_id.into(),
            data: None,
        }
    }

    /// A close-connection request for the given receiver id.
    pub fn close_connection(response_receiver_id: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::CloseConnectionRequest,
            response_receiver_id: response_receiver_id.into(),
            data: None,
        }
    }

    /// A poll request for the given receiver id.
    pub fn poll_request(response_receiver_id: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::PollRequest,
            response_receiver_id: response_receiver_id.into(),
            data: None,
        }
    }

    /// A data message carrying `data` for the given receiver id.
    pub fn message(response_receiver_id: impl Into<String>, data: MessageData) -> Self {
        Self {
            kind: MessageKind::MessageReceived,
            response_receiver_id: response_receiver_id.into(),
            data: Some(data),
        }
    }

    /// The decode-failure sentinel.
    pub fn unknown() -> Self {
        Self {
            kind: MessageKind::Unknown,
            response_receiver_id: String::new(),
            data: None,
        }
    }
}

/// Outcome of one decode call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    /// A frame was read. Malformed frames surface here with kind
    /// [`MessageKind::Unknown`], not as errors.
    Message(ProtocolMessage),
    /// The peer closed the stream cleanly before the next frame.
    EndOfStream,
}

impl DecodedFrame {
    /// Whether this is the end-of-stream marker.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, DecodedFrame::EndOfStream)
    }
}

/// Errors raised while encoding a protocol message.
///
/// Decoding is infallible by contract and has no error type.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Payload exceeds [`MAX_FRAME_SIZE`].
    #[error("payload too large: {size} bytes (max {MAX_FRAME_SIZE})")]
    PayloadTooLarge {
        /// Offending payload size in bytes.
        size: usize,
    },

    /// [`MessageKind::Unknown`] has no wire representation.
    #[error("message kind has no wire representation")]
    UnencodableKind,

    /// Writing to the output stream failed.
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Stateless translation between protocol messages and wire bytes.
///
/// Implementations are pure: `encode` has no side effect beyond writing to
/// the supplied stream, and `decode` consumes exactly one frame.
pub trait ProtocolFormatter: Send + Sync {
    /// Encode `message` into `writer`.
    ///
    /// Returns `Ok(true)` when a frame was written, and `Ok(false)` when the
    /// format defines no frame for the message kind (the compact format has
    /// no open/close/poll frames); callers should skip the send in that
    /// case.
    ///
    /// # Errors
    ///
    /// Fails only for oversized payloads, an attempt to encode
    /// [`MessageKind::Unknown`], or a writer I/O failure.
    fn encode(
        &self,
        message: &ProtocolMessage,
        writer: &mut dyn Write,
    ) -> Result<bool, CodecError>;

    /// Decode one frame from `reader`.
    ///
    /// Never panics and never returns an error: malformed input yields a
    /// message of kind [`MessageKind::Unknown`], a clean end-of-stream
    /// yields [`DecodedFrame::EndOfStream`].
    fn decode(&self, reader: &mut dyn Read) -> DecodedFrame;
}

/// Read the first byte of a frame, distinguishing clean EOF from data.
///
/// Returns `Ok(None)` when the stream ended before the frame started.
pub(crate) fn read_frame_start(reader: &mut dyn Read) -> std::io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => Err(e)?,
        }
    }
}

/// Read a length-prefixed block, applying the [`MAX_FRAME_SIZE`] cap.
pub(crate) fn read_length_prefixed(
    reader: &mut dyn Read,
    endianness: Endianness,
) -> Result<Vec<u8>, std::io::Error> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = endianness.read_u32(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("declared length {} exceeds frame cap", len),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_data_len_counts_bytes() {
        assert_eq!(MessageData::Bytes(vec![1, 2, 3]).len(), 3);
        // Two chars, five UTF-8 bytes.
        assert_eq!(MessageData::Text("é世".into()).len(), 5);
        assert!(MessageData::Text(String::new()).is_empty());
    }

    #[test]
    fn test_message_kind_wire_values_roundtrip() {
        for kind in [
            MessageKind::OpenConnectionRequest,
            MessageKind::CloseConnectionRequest,
            MessageKind::PollRequest,
            MessageKind::MessageReceived,
        ] {
            let value = kind.wire_value().expect("wire value");
            assert_eq!(MessageKind::from_wire(value), Some(kind));
        }
        assert_eq!(MessageKind::Unknown.wire_value(), None);
        assert_eq!(MessageKind::from_wire(99), None);
    }
}
