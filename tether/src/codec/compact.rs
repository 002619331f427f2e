//! Minimal wire format for transports with native connection semantics.
//!
//! There are no open/close/poll frames: the transport's own
//! connect/disconnect events are the signal. A data frame is
//! `[payload kind: 10=bytes, 20=text][len:4][payload]` with a fixed,
//! configured endianness. Decoded messages carry an empty response receiver
//! id; the transport attributes frames to clients itself.

use std::io::{Read, Write};

use super::{
    read_frame_start, read_length_prefixed, CodecError, DecodedFrame, Endianness, MessageData,
    MessageKind, ProtocolFormatter, ProtocolMessage, DATA_BYTES_FLAG, DATA_TEXT_FLAG,
    MAX_FRAME_SIZE,
};

/// Formatter for the minimal data-frame-only format.
///
/// Both endpoints must agree on the endianness out of band; unlike
/// [`super::SelfDescribingFormatter`] frames carry no flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactFormatter {
    /// Byte order for the length prefix.
    pub endianness: Endianness,
}

impl CompactFormatter {
    /// Formatter with an explicit endianness.
    pub fn new(endianness: Endianness) -> Self {
        Self { endianness }
    }
}

impl ProtocolFormatter for CompactFormatter {
    fn encode(
        &self,
        message: &ProtocolMessage,
        writer: &mut dyn Write,
    ) -> Result<bool, CodecError> {
        match message.kind {
            MessageKind::Unknown => return Err(CodecError::UnencodableKind),
            // No wire frames for connection bookkeeping in this format.
            MessageKind::OpenConnectionRequest
            | MessageKind::CloseConnectionRequest
            | MessageKind::PollRequest => return Ok(false),
            MessageKind::MessageReceived => {}
        }

        let mut frame = Vec::with_capacity(16);
        match &message.data {
            Some(MessageData::Bytes(bytes)) => {
                if bytes.len() > MAX_FRAME_SIZE {
                    return Err(CodecError::PayloadTooLarge { size: bytes.len() });
                }
                frame.push(DATA_BYTES_FLAG);
                self.endianness.write_u32(bytes.len() as u32, &mut frame);
                frame.extend_from_slice(bytes);
            }
            Some(MessageData::Text(text)) => {
                let bytes = text.as_bytes();
                if bytes.len() > MAX_FRAME_SIZE {
                    return Err(CodecError::PayloadTooLarge { size: bytes.len() });
                }
                frame.push(DATA_TEXT_FLAG);
                self.endianness.write_u32(bytes.len() as u32, &mut frame);
                frame.extend_from_slice(bytes);
            }
            None => {
                frame.push(DATA_BYTES_FLAG);
                self.endianness.write_u32(0, &mut frame);
            }
        }

        writer.write_all(&frame)?;
        Ok(true)
    }

    fn decode(&self, reader: &mut dyn Read) -> DecodedFrame {
        match self.try_decode(reader) {
            Ok(frame) => frame,
            Err(reason) => {
                tracing::warn!("discarding malformed frame: {}", reason);
                DecodedFrame::Message(ProtocolMessage::unknown())
            }
        }
    }
}

impl CompactFormatter {
    fn try_decode(&self, reader: &mut dyn Read) -> Result<DecodedFrame, String> {
        let payload_flag = match read_frame_start(reader) {
            Ok(None) => return Ok(DecodedFrame::EndOfStream),
            Ok(Some(byte)) => byte,
            Err(e) => return Err(format!("read failed: {}", e)),
        };

        let payload_bytes = read_length_prefixed(reader, self.endianness)
            .map_err(|e| format!("malformed payload block: {}", e))?;

        let data = match payload_flag {
            DATA_BYTES_FLAG => MessageData::Bytes(payload_bytes),
            DATA_TEXT_FLAG => MessageData::Text(
                String::from_utf8(payload_bytes)
                    .map_err(|e| format!("undecodable text payload: {}", e))?,
            ),
            other => return Err(format!("unrecognized payload kind {}", other)),
        };

        Ok(DecodedFrame::Message(ProtocolMessage::message("", data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_data_frame_roundtrip() {
        let formatter = CompactFormatter::default();
        let mut out = Vec::new();
        let message = ProtocolMessage::message("ignored", MessageData::Bytes(vec![9, 8, 7]));
        assert!(formatter.encode(&message, &mut out).expect("encode"));

        let decoded = formatter.decode(&mut Cursor::new(&out));
        // Receiver id is not carried by this format.
        assert_eq!(
            decoded,
            DecodedFrame::Message(ProtocolMessage::message(
                "",
                MessageData::Bytes(vec![9, 8, 7])
            ))
        );
    }

    #[test]
    fn test_text_frame_roundtrip_big_endian() {
        let formatter = CompactFormatter::new(Endianness::Big);
        let mut out = Vec::new();
        formatter
            .encode(
                &ProtocolMessage::message("", MessageData::Text("héllo".into())),
                &mut out,
            )
            .expect("encode");

        assert_eq!(out[0], 20);
        assert_eq!(u32::from_be_bytes(out[1..5].try_into().expect("slice")) as usize, "héllo".len());
        assert_eq!(
            formatter.decode(&mut Cursor::new(&out)),
            DecodedFrame::Message(ProtocolMessage::message(
                "",
                MessageData::Text("héllo".into())
            ))
        );
    }

    #[test]
    fn test_control_kinds_emit_no_frame() {
        let formatter = CompactFormatter::default();
        for message in [
            ProtocolMessage::open_connection("a"),
            ProtocolMessage::close_connection("a"),
            ProtocolMessage::poll_request("a"),
        ] {
            let mut out = Vec::new();
            let written = formatter.encode(&message, &mut out).expect("encode");
            assert!(!written);
            assert!(out.is_empty());
        }
    }

    #[test]
    fn test_decode_empty_stream_is_end_of_stream() {
        let formatter = CompactFormatter::default();
        assert_eq!(
            formatter.decode(&mut Cursor::new(&[])),
            DecodedFrame::EndOfStream
        );
    }

    #[test]
    fn test_decode_truncated_or_garbage_yields_unknown() {
        let formatter = CompactFormatter::default();
        for bytes in [
            vec![10u8, 4, 0],                  // truncated length prefix
            vec![10, 4, 0, 0, 0, 1, 2],        // declared 4 bytes, carries 2
            vec![77, 0, 0, 0, 0],              // unrecognized payload kind
            vec![10, 255, 255, 255, 255],      // absurd length
        ] {
            let decoded = formatter.decode(&mut Cursor::new(&bytes));
            assert_eq!(decoded, DecodedFrame::Message(ProtocolMessage::unknown()));
        }
    }

    #[test]
    fn test_encode_unknown_kind_is_rejected() {
        let formatter = CompactFormatter::default();
        let result = formatter.encode(&ProtocolMessage::unknown(), &mut Vec::new());
        assert!(matches!(result, Err(CodecError::UnencodableKind)));
    }
}
