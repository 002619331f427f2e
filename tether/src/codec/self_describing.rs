//! Self-describing tagged wire format.
//!
//! Frame layout (multi-byte integers in the encoded endianness):
//!
//! ```text
//! [0..5]  "ENETER"                       ASCII magic
//! [6]     endianness flag: 10=little, 20=big
//! [7]     text-encoding flag: 10=UTF-8, 20=UTF-16
//! [8]     message kind: 10=open, 20=close, 30=poll, 40=message
//! [9..]   body:
//!   kinds 10/20/30: [len:4][response receiver id]
//!   kind 40:        [len:4][response receiver id]
//!                   [payload kind: 10=bytes, 20=text][len:4][payload]
//! ```
//!
//! Strings (receiver ids and text payloads) are encoded with the declared
//! text encoding; UTF-16 code units follow the frame's endianness flag.

use std::io::{Read, Write};

use super::{
    read_frame_start, read_length_prefixed, CodecError, DecodedFrame, Endianness, MessageData,
    MessageKind, ProtocolFormatter, ProtocolMessage, DATA_BYTES_FLAG, DATA_TEXT_FLAG,
    MAX_FRAME_SIZE,
};

/// ASCII magic tag opening every frame.
const MAGIC: &[u8; 6] = b"ENETER";

/// Wire flag for little-endian frames.
const ENDIAN_LITTLE_FLAG: u8 = 10;
/// Wire flag for big-endian frames.
const ENDIAN_BIG_FLAG: u8 = 20;
/// Wire flag for UTF-8 text.
const ENCODING_UTF8_FLAG: u8 = 10;
/// Wire flag for UTF-16 text.
const ENCODING_UTF16_FLAG: u8 = 20;

/// Text encoding used for strings inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    /// UTF-8 (wire flag 10).
    #[default]
    Utf8,
    /// UTF-16, code units ordered per the frame endianness (wire flag 20).
    Utf16,
}

/// Formatter for the self-describing tagged format.
///
/// The configured endianness and text encoding apply to encoding; decoding
/// honors whatever flags the incoming frame declares, so endpoints with
/// different configurations interoperate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfDescribingFormatter {
    /// Byte order written into outgoing frames.
    pub endianness: Endianness,
    /// Text encoding written into outgoing frames.
    pub text_encoding: TextEncoding,
}

impl SelfDescribingFormatter {
    /// Formatter with explicit endianness and text encoding.
    pub fn new(endianness: Endianness, text_encoding: TextEncoding) -> Self {
        Self {
            endianness,
            text_encoding,
        }
    }

    fn encode_text(&self, text: &str) -> Vec<u8> {
        encode_text(text, self.text_encoding, self.endianness)
    }

    fn write_string_block(&self, text: &str, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let bytes = self.encode_text(text);
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(CodecError::PayloadTooLarge { size: bytes.len() });
        }
        self.endianness.write_u32(bytes.len() as u32, out);
        out.extend_from_slice(&bytes);
        Ok(())
    }
}

fn encode_text(text: &str, encoding: TextEncoding, endianness: Endianness) -> Vec<u8> {
    match encoding {
        TextEncoding::Utf8 => text.as_bytes().to_vec(),
        TextEncoding::Utf16 => {
            let mut out = Vec::with_capacity(text.len() * 2);
            for unit in text.encode_utf16() {
                match endianness {
                    Endianness::Little => out.extend_from_slice(&unit.to_le_bytes()),
                    Endianness::Big => out.extend_from_slice(&unit.to_be_bytes()),
                }
            }
            out
        }
    }
}

fn decode_text(
    bytes: &[u8],
    encoding: TextEncoding,
    endianness: Endianness,
) -> Result<String, String> {
    match encoding {
        TextEncoding::Utf8 => String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string()),
        TextEncoding::Utf16 => {
            if bytes.len() % 2 != 0 {
                return Err(format!("odd UTF-16 byte length {}", bytes.len()));
            }
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| match endianness {
                    Endianness::Little => u16::from_le_bytes([pair[0], pair[1]]),
                    Endianness::Big => u16::from_be_bytes([pair[0], pair[1]]),
                })
                .collect();
            String::from_utf16(&units).map_err(|e| e.to_string())
        }
    }
}

impl ProtocolFormatter for SelfDescribingFormatter {
    fn encode(
        &self,
        message: &ProtocolMessage,
        writer: &mut dyn Write,
    ) -> Result<bool, CodecError> {
        let kind_byte = message.kind.wire_value().ok_or(CodecError::UnencodableKind)?;

        let mut frame = Vec::with_capacity(32);
        frame.extend_from_slice(MAGIC);
        frame.push(match self.endianness {
            Endianness::Little => ENDIAN_LITTLE_FLAG,
            Endianness::Big => ENDIAN_BIG_FLAG,
        });
        frame.push(match self.text_encoding {
            TextEncoding::Utf8 => ENCODING_UTF8_FLAG,
            TextEncoding::Utf16 => ENCODING_UTF16_FLAG,
        });
        frame.push(kind_byte);
        self.write_string_block(&message.response_receiver_id, &mut frame)?;

        if message.kind == MessageKind::MessageReceived {
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
                    frame.push(DATA_TEXT_FLAG);
                    self.write_string_block(text, &mut frame)?;
                }
                // A data frame with nothing to say still needs a payload block.
                None => {
                    frame.push(DATA_BYTES_FLAG);
                    self.endianness.write_u32(0, &mut frame);
                }
            }
        }

        writer.write_all(&frame)?;
        Ok(true)
    }

    fn decode(&self, reader: &mut dyn Read) -> DecodedFrame {
        match try_decode(reader) {
            Ok(frame) => frame,
            Err(reason) => {
                tracing::warn!("discarding malformed frame: {}", reason);
                DecodedFrame::Message(ProtocolMessage::unknown())
            }
        }
    }
}

/// Decode one frame, reporting malformed input as `Err(reason)`.
///
/// The caller turns every `Err` into the `Unknown` sentinel; only a clean
/// end-of-stream before the first byte becomes `EndOfStream`.
fn try_decode(reader: &mut dyn Read) -> Result<DecodedFrame, String> {
    let first = match read_frame_start(reader) {
        Ok(None) => return Ok(DecodedFrame::EndOfStream),
        Ok(Some(byte)) => byte,
        Err(e) => return Err(format!("read failed: {}", e)),
    };

    let mut rest_of_magic = [0u8; 5];
    reader
        .read_exact(&mut rest_of_magic)
        .map_err(|e| format!("truncated magic: {}", e))?;
    if first != MAGIC[0] || rest_of_magic != MAGIC[1..] {
        return Err("unrecognized magic tag".to_string());
    }

    let mut flags = [0u8; 3];
    reader
        .read_exact(&mut flags)
        .map_err(|e| format!("truncated header: {}", e))?;

    let endianness = match flags[0] {
        ENDIAN_LITTLE_FLAG => Endianness::Little,
        ENDIAN_BIG_FLAG => Endianness::Big,
        other => return Err(format!("unrecognized endianness flag {}", other)),
    };
    let encoding = match flags[1] {
        ENCODING_UTF8_FLAG => TextEncoding::Utf8,
        ENCODING_UTF16_FLAG => TextEncoding::Utf16,
        other => return Err(format!("unrecognized text-encoding flag {}", other)),
    };
    let kind = MessageKind::from_wire(flags[2])
        .ok_or_else(|| format!("unrecognized message kind {}", flags[2]))?;

    let id_bytes = read_length_prefixed(reader, endianness)
        .map_err(|e| format!("malformed receiver id block: {}", e))?;
    let response_receiver_id = decode_text(&id_bytes, encoding, endianness)
        .map_err(|e| format!("undecodable receiver id: {}", e))?;

    let message = match kind {
        MessageKind::MessageReceived => {
            let mut payload_flag = [0u8; 1];
            reader
                .read_exact(&mut payload_flag)
                .map_err(|e| format!("truncated payload flag: {}", e))?;
            let payload_bytes = read_length_prefixed(reader, endianness)
                .map_err(|e| format!("malformed payload block: {}", e))?;
            let data = match payload_flag[0] {
                DATA_BYTES_FLAG => MessageData::Bytes(payload_bytes),
                DATA_TEXT_FLAG => MessageData::Text(
                    decode_text(&payload_bytes, encoding, endianness)
                        .map_err(|e| format!("undecodable text payload: {}", e))?,
                ),
                other => return Err(format!("unrecognized payload kind {}", other)),
            };
            ProtocolMessage::message(response_receiver_id, data)
        }
        MessageKind::OpenConnectionRequest => ProtocolMessage::open_connection(response_receiver_id),
        MessageKind::CloseConnectionRequest => {
            ProtocolMessage::close_connection(response_receiver_id)
        }
        MessageKind::PollRequest => ProtocolMessage::poll_request(response_receiver_id),
        MessageKind::Unknown => unreachable!("from_wire never yields Unknown"),
    };

    Ok(DecodedFrame::Message(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_to_vec(formatter: &SelfDescribingFormatter, message: &ProtocolMessage) -> Vec<u8> {
        let mut out = Vec::new();
        let written = formatter.encode(message, &mut out).expect("encode");
        assert!(written);
        out
    }

    fn decode_one(formatter: &SelfDescribingFormatter, bytes: &[u8]) -> DecodedFrame {
        formatter.decode(&mut Cursor::new(bytes))
    }

    #[test]
    fn test_message_roundtrip_bytes_payload() {
        let formatter = SelfDescribingFormatter::default();
        let message = ProtocolMessage::message("client-1", MessageData::Bytes(vec![1, 2, 3, 255]));

        let bytes = encode_to_vec(&formatter, &message);
        let decoded = decode_one(&formatter, &bytes);

        assert_eq!(decoded, DecodedFrame::Message(message));
    }

    #[test]
    fn test_message_roundtrip_text_payload_non_ascii() {
        let formatter = SelfDescribingFormatter::default();
        let message = ProtocolMessage::message("client-1", MessageData::Text("héllo → 世界".into()));

        let bytes = encode_to_vec(&formatter, &message);
        let decoded = decode_one(&formatter, &bytes);

        assert_eq!(decoded, DecodedFrame::Message(message));
    }

    #[test]
    fn test_message_roundtrip_empty_payloads() {
        let formatter = SelfDescribingFormatter::default();
        for data in [MessageData::Bytes(vec![]), MessageData::Text(String::new())] {
            let message = ProtocolMessage::message("c", data);
            let bytes = encode_to_vec(&formatter, &message);
            assert_eq!(decode_one(&formatter, &bytes), DecodedFrame::Message(message));
        }
    }

    #[test]
    fn test_control_frames_roundtrip() {
        let formatter = SelfDescribingFormatter::default();
        for message in [
            ProtocolMessage::open_connection("receiver-a"),
            ProtocolMessage::close_connection("receiver-a"),
            ProtocolMessage::poll_request("receiver-a"),
        ] {
            let bytes = encode_to_vec(&formatter, &message);
            assert_eq!(decode_one(&formatter, &bytes), DecodedFrame::Message(message));
        }
    }

    #[test]
    fn test_roundtrip_big_endian_utf16() {
        let formatter = SelfDescribingFormatter::new(Endianness::Big, TextEncoding::Utf16);
        let message = ProtocolMessage::message("идентификатор", MessageData::Text("héllo".into()));

        let bytes = encode_to_vec(&formatter, &message);
        // A default (little-endian, UTF-8) decoder honors the frame's flags.
        let decoded = decode_one(&SelfDescribingFormatter::default(), &bytes);

        assert_eq!(decoded, DecodedFrame::Message(message));
    }

    #[test]
    fn test_frame_layout_matches_wire_contract() {
        let formatter = SelfDescribingFormatter::default();
        let bytes = encode_to_vec(
            &formatter,
            &ProtocolMessage::message("ab", MessageData::Bytes(vec![7, 8, 9])),
        );

        assert_eq!(&bytes[0..6], b"ENETER");
        assert_eq!(bytes[6], 10); // little-endian
        assert_eq!(bytes[7], 10); // UTF-8
        assert_eq!(bytes[8], 40); // message kind
        assert_eq!(u32::from_le_bytes(bytes[9..13].try_into().expect("slice")), 2);
        assert_eq!(&bytes[13..15], b"ab");
        assert_eq!(bytes[15], 10); // bytes payload
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().expect("slice")), 3);
        assert_eq!(&bytes[20..], &[7, 8, 9]);
    }

    #[test]
    fn test_decode_utf16be_text_message() {
        // Hand-built frame: big-endian, UTF-16, kind 40, id "id",
        // text payload "hello" (10 bytes of UTF-16BE).
        let mut frame = Vec::new();
        frame.extend_from_slice(b"ENETER");
        frame.push(20); // big-endian
        frame.push(20); // UTF-16
        frame.push(40); // message
        frame.extend_from_slice(&4u32.to_be_bytes());
        for unit in "id".encode_utf16() {
            frame.extend_from_slice(&unit.to_be_bytes());
        }
        frame.push(20); // text payload
        frame.extend_from_slice(&10u32.to_be_bytes());
        for unit in "hello".encode_utf16() {
            frame.extend_from_slice(&unit.to_be_bytes());
        }

        let decoded = decode_one(&SelfDescribingFormatter::default(), &frame);
        assert_eq!(
            decoded,
            DecodedFrame::Message(ProtocolMessage::message(
                "id",
                MessageData::Text("hello".into())
            ))
        );
    }

    #[test]
    fn test_decode_empty_stream_is_end_of_stream() {
        let decoded = decode_one(&SelfDescribingFormatter::default(), &[]);
        assert_eq!(decoded, DecodedFrame::EndOfStream);
    }

    #[test]
    fn test_decode_garbage_yields_unknown() {
        let decoded = decode_one(&SelfDescribingFormatter::default(), b"NOTAFRAME");
        assert_eq!(decoded, DecodedFrame::Message(ProtocolMessage::unknown()));
    }

    #[test]
    fn test_decode_truncated_frame_yields_unknown() {
        let formatter = SelfDescribingFormatter::default();
        let bytes = encode_to_vec(
            &formatter,
            &ProtocolMessage::message("client", MessageData::Bytes(vec![1, 2, 3, 4])),
        );

        for cut in 1..bytes.len() {
            let decoded = decode_one(&formatter, &bytes[..cut]);
            match decoded {
                DecodedFrame::Message(msg) => {
                    assert_eq!(msg.kind, MessageKind::Unknown, "cut at {}", cut);
                    assert!(msg.data.is_none(), "cut at {}", cut);
                }
                DecodedFrame::EndOfStream => panic!("cut at {} decoded as EOF", cut),
            }
        }
    }

    #[test]
    fn test_decode_bad_flags_yield_unknown() {
        let formatter = SelfDescribingFormatter::default();
        let good = encode_to_vec(&formatter, &ProtocolMessage::open_connection("x"));

        for (offset, bad) in [(6usize, 99u8), (7, 99), (8, 99)] {
            let mut frame = good.clone();
            frame[offset] = bad;
            assert_eq!(
                decode_one(&formatter, &frame),
                DecodedFrame::Message(ProtocolMessage::unknown())
            );
        }
    }

    #[test]
    fn test_decode_absurd_length_yields_unknown() {
        let mut frame = Vec::new();
        frame.extend_from_slice(b"ENETER");
        frame.extend_from_slice(&[10, 10, 10]);
        frame.extend_from_slice(&u32::MAX.to_le_bytes());

        let decoded = decode_one(&SelfDescribingFormatter::default(), &frame);
        assert_eq!(decoded, DecodedFrame::Message(ProtocolMessage::unknown()));
    }

    #[test]
    fn test_decode_consumes_one_frame_leaving_the_next() {
        let formatter = SelfDescribingFormatter::default();
        let mut stream = Vec::new();
        formatter
            .encode(&ProtocolMessage::open_connection("a"), &mut stream)
            .expect("encode");
        formatter
            .encode(
                &ProtocolMessage::message("a", MessageData::Text("next".into())),
                &mut stream,
            )
            .expect("encode");

        let mut cursor = Cursor::new(stream);
        assert_eq!(
            formatter.decode(&mut cursor),
            DecodedFrame::Message(ProtocolMessage::open_connection("a"))
        );
        assert_eq!(
            formatter.decode(&mut cursor),
            DecodedFrame::Message(ProtocolMessage::message(
                "a",
                MessageData::Text("next".into())
            ))
        );
        assert_eq!(formatter.decode(&mut cursor), DecodedFrame::EndOfStream);
    }

    #[test]
    fn test_encode_unknown_kind_is_rejected() {
        let formatter = SelfDescribingFormatter::default();
        let mut out = Vec::new();
        let result = formatter.encode(&ProtocolMessage::unknown(), &mut out);
        assert!(matches!(result, Err(CodecError::UnencodableKind)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_encode_oversized_payload_is_rejected() {
        let formatter = SelfDescribingFormatter::default();
        let message =
            ProtocolMessage::message("c", MessageData::Bytes(vec![0u8; MAX_FRAME_SIZE + 1]));
        let result = formatter.encode(&message, &mut Vec::new());
        assert!(matches!(result, Err(CodecError::PayloadTooLarge { .. })));
    }
}
