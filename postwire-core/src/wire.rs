//! Wire codec: one message per datagram, JSON payload, bounded size.

use crate::protocol::Message;

/// Default upper bound for one encoded message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024; // 1 MiB

/// Encode a message as JSON bytes. Fails if the encoding exceeds `max_len`.
pub fn encode_message(msg: &Message, max_len: usize) -> Result<Vec<u8>, EncodeError> {
    let payload = serde_json::to_vec(msg).map_err(EncodeError::Encode)?;
    if payload.len() > max_len {
        return Err(EncodeError::TooLarge {
            len: payload.len(),
            max: max_len,
        });
    }
    Ok(payload)
}

/// Error encoding a message (serde_json or size limit).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("message too large ({len} > {max} bytes)")]
    TooLarge { len: usize, max: usize },
}

/// Decode one message from a complete datagram.
pub fn decode_message(bytes: &[u8], max_len: usize) -> Result<Message, DecodeError> {
    if bytes.len() > max_len {
        return Err(DecodeError::TooLarge {
            len: bytes.len(),
            max: max_len,
        });
    }
    serde_json::from_slice(bytes).map_err(DecodeError::Decode)
}

/// Error decoding a message (too large, or not a postwire message).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("message too large ({len} > {max} bytes)")]
    TooLarge { len: usize, max: usize },
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AckMessage, RequestMessage};
    use serde_json::json;

    fn sample_request() -> Message {
        Message::Request(RequestMessage {
            hash: "ping_1".into(),
            name: "ping".into(),
            data: Some(json!({ "n": 5 })),
            fire_and_forget: false,
        })
    }

    #[test]
    fn roundtrip_request() {
        let msg = sample_request();
        let bytes = encode_message(&msg, DEFAULT_MAX_MESSAGE_BYTES).unwrap();
        let decoded = decode_message(&bytes, DEFAULT_MAX_MESSAGE_BYTES).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn encode_rejects_oversized() {
        let msg = sample_request();
        assert!(matches!(
            encode_message(&msg, 8),
            Err(EncodeError::TooLarge { max: 8, .. })
        ));
    }

    #[test]
    fn decode_rejects_oversized() {
        let bytes = encode_message(
            &Message::Ack(AckMessage {
                hash: "h".into(),
                name: "n".into(),
            }),
            DEFAULT_MAX_MESSAGE_BYTES,
        )
        .unwrap();
        assert!(matches!(
            decode_message(&bytes, 4),
            Err(DecodeError::TooLarge { .. })
        ));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let bytes = br#"{"type":"broadcast","hash":"h","name":"n"}"#;
        assert!(matches!(
            decode_message(bytes, DEFAULT_MAX_MESSAGE_BYTES),
            Err(DecodeError::Decode(_))
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_message(b"\x00\x01not json", DEFAULT_MAX_MESSAGE_BYTES),
            Err(DecodeError::Decode(_))
        ));
    }
}
