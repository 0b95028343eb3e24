// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The PPC outer frame.
//!
//! Layout (integers big-endian):
//!
//! ```text
//! offset  size  field
//! 0       1     version
//! 1       1     taskType
//! 2       1     algorithmType
//! 3       1     messageType
//! 4       4     seq
//! 8       2     taskIdLength
//! 10      L1    taskId
//! 10+L1   2     senderLength
//! ...     L2    sender
//! ...     2     ext
//! ...     1     uuidLength
//! ...     L3    uuid               (present iff L3 > 0)
//! ...     4     dataLength
//! ...     L4    data               (present iff L4 > 0)
//! ...     R     headerJson         (trailing UTF-8 JSON, possibly empty)
//! ```
//!
//! Anything shorter than the fixed-layout minimum, or shorter than the sum
//! of its declared variable lengths, is rejected as malformed.

use std::collections::BTreeMap;

use veil_types::PpcError;

/// The fixed-layout portion with all variable lengths zero.
pub const MESSAGE_MIN_LENGTH: usize = 1 + 1 + 1 + 1 + 4 + 2 + 2 + 2 + 1 + 4;

/// One gateway-level message frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PpcMessage {
    pub version: u8,
    pub task_type: u8,
    pub algorithm: u8,
    pub message_type: u8,
    pub seq: u32,
    pub task_id: String,
    pub sender: String,
    pub ext: u16,
    /// Request/response correlation id; at most 255 bytes on the wire.
    pub uuid: String,
    pub data: Vec<u8>,
    /// Session metadata forwarded between vendor deployments.
    pub header: BTreeMap<String, String>,
}

impl PpcMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(
            MESSAGE_MIN_LENGTH
                + self.task_id.len()
                + self.sender.len()
                + self.uuid.len()
                + self.data.len(),
        );
        buffer.push(self.version);
        buffer.push(self.task_type);
        buffer.push(self.algorithm);
        buffer.push(self.message_type);
        buffer.extend_from_slice(&self.seq.to_be_bytes());
        buffer.extend_from_slice(&(self.task_id.len() as u16).to_be_bytes());
        buffer.extend_from_slice(self.task_id.as_bytes());
        buffer.extend_from_slice(&(self.sender.len() as u16).to_be_bytes());
        buffer.extend_from_slice(self.sender.as_bytes());
        buffer.extend_from_slice(&self.ext.to_be_bytes());
        buffer.push(self.uuid.len() as u8);
        buffer.extend_from_slice(self.uuid.as_bytes());
        buffer.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buffer.extend_from_slice(&self.data);
        if !self.header.is_empty() {
            let json =
                serde_json::to_string(&self.header).expect("string map serialization is infallible");
            buffer.extend_from_slice(json.as_bytes());
        }
        buffer
    }

    /// Decode one frame. The frame owns the whole buffer: every byte after
    /// the data field is the trailing header JSON.
    pub fn decode(buffer: &[u8]) -> Result<PpcMessage, PpcError> {
        let mut required = MESSAGE_MIN_LENGTH;
        if buffer.len() < required {
            return Err(PpcError::DecodePpcMessage(format!(
                "message too short: {} < {}",
                buffer.len(),
                required
            )));
        }
        let mut message = PpcMessage {
            version: buffer[0],
            task_type: buffer[1],
            algorithm: buffer[2],
            message_type: buffer[3],
            seq: u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]),
            ..Default::default()
        };
        let mut cursor = 8;

        let task_id_len = u16::from_be_bytes([buffer[cursor], buffer[cursor + 1]]) as usize;
        cursor += 2;
        required += task_id_len;
        if buffer.len() < required {
            return Err(PpcError::DecodePpcMessage("truncated taskId".into()));
        }
        message.task_id = String::from_utf8_lossy(&buffer[cursor..cursor + task_id_len]).into_owned();
        cursor += task_id_len;

        let sender_len = u16::from_be_bytes([buffer[cursor], buffer[cursor + 1]]) as usize;
        cursor += 2;
        required += sender_len;
        if buffer.len() < required {
            return Err(PpcError::DecodePpcMessage("truncated sender".into()));
        }
        message.sender = String::from_utf8_lossy(&buffer[cursor..cursor + sender_len]).into_owned();
        cursor += sender_len;

        message.ext = u16::from_be_bytes([buffer[cursor], buffer[cursor + 1]]);
        cursor += 2;

        let uuid_len = buffer[cursor] as usize;
        cursor += 1;
        required += uuid_len;
        if buffer.len() < required {
            return Err(PpcError::DecodePpcMessage("truncated uuid".into()));
        }
        if uuid_len > 0 {
            message.uuid = String::from_utf8_lossy(&buffer[cursor..cursor + uuid_len]).into_owned();
            cursor += uuid_len;
        }

        let data_len = u32::from_be_bytes([
            buffer[cursor],
            buffer[cursor + 1],
            buffer[cursor + 2],
            buffer[cursor + 3],
        ]) as usize;
        cursor += 4;
        required += data_len;
        if buffer.len() < required {
            return Err(PpcError::DecodePpcMessage("truncated data".into()));
        }
        if data_len > 0 {
            message.data = buffer[cursor..cursor + data_len].to_vec();
            cursor += data_len;
        }

        if cursor < buffer.len() {
            let json = &buffer[cursor..];
            message.header = serde_json::from_slice(json)
                .map_err(|e| PpcError::DecodePpcMessage(format!("bad header json: {e}")))?;
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_message() -> PpcMessage {
        let mut header = BTreeMap::new();
        header.insert("x-http-session".to_string(), "111111".to_string());
        header.insert("x-http-request".to_string(), "2222222".to_string());
        PpcMessage {
            version: 1,
            task_type: 0,
            algorithm: 0,
            message_type: 4,
            seq: 5,
            task_id: "T_123456".into(),
            sender: "1001".into(),
            ext: 10,
            uuid: "uuid1245".into(),
            data: vec![b'a'; 10],
            header,
        }
    }

    #[test]
    fn encode_decode_identity_with_every_field() {
        let message = full_message();
        let encoded = message.encode();
        let decoded = PpcMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.header["x-http-session"], "111111");
        assert_eq!(decoded.header["x-http-request"], "2222222");
        // re-encoding reproduces the buffer byte for byte
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn encode_decode_identity_with_optional_fields_empty() {
        let message = PpcMessage {
            version: 1,
            message_type: 2,
            seq: 9,
            task_id: "t".into(),
            sender: "s".into(),
            ..Default::default()
        };
        let encoded = message.encode();
        let decoded = PpcMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, message);
        assert!(decoded.uuid.is_empty());
        assert!(decoded.header.is_empty());
    }

    #[test]
    fn short_buffers_are_rejected() {
        let encoded = full_message().encode();
        // the bare minimum minus one
        assert!(PpcMessage::decode(&encoded[..MESSAGE_MIN_LENGTH - 1]).is_err());
        // truncated inside the variable-length region
        assert!(PpcMessage::decode(&encoded[..MESSAGE_MIN_LENGTH + 3]).is_err());
        assert!(PpcMessage::decode(&[]).is_err());
    }

    #[test]
    fn fixed_field_layout_is_stable() {
        let message = full_message();
        let encoded = message.encode();
        assert_eq!(encoded[0], 1); // version
        assert_eq!(encoded[3], 4); // messageType
        assert_eq!(&encoded[4..8], &[0, 0, 0, 5]); // seq, big-endian
        assert_eq!(&encoded[8..10], &[0, 8]); // taskIdLength
        assert_eq!(&encoded[10..18], b"T_123456");
    }
}
