// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The PSI payload envelope carried inside `PpcMessage::data`.
//!
//! Encoded as CBOR: self-describing, versioned through the `version` field,
//! and stable across node builds. Routing context (task id, seq, sender,
//! uuid) lives on the outer frame and is re-attached after decode — it is
//! never serialized here.

use serde::{Deserialize, Serialize};
use veil_types::{PpcError, TaskStatus};

/// Outer-frame message types.
pub mod message_type {
    /// A PSI envelope follows in the data field.
    pub const PSI: u8 = 0x00;
    /// Peer liveness probe, empty payload.
    pub const PING_PEER: u8 = 0xfe;
    /// Peer-side failure notification.
    pub const ERROR_NOTIFICATION: u8 = 0xff;
}

/// Packet-type discriminators. The low range is shared framework traffic;
/// each engine claims a block of 100 upward.
pub mod packet {
    pub const CANCEL_TASK_NOTIFICATION: u32 = 0x01;
    pub const TASK_SYNC: u32 = 0x02;
    pub const HANDSHAKE_REQUEST: u32 = 0x03;
    pub const HANDSHAKE_RESPONSE: u32 = 0x04;
    pub const PSI_RESULT_SYNC: u32 = 0x05;
    pub const PSI_RESULT_SYNC_RESPONSE: u32 = 0x06;
    pub const HANDSHAKE_SUCCESS: u32 = 0x07;

    // ECDH-PSI
    pub const ECDH_EVALUATE_REQUEST: u32 = 100;
    pub const ECDH_EVALUATE_RESPONSE: u32 = 101;
    pub const ECDH_SERVER_BLINDED_DATA: u32 = 102;
    pub const ECDH_SYNC_DATA_BATCH_INFO: u32 = 103;

    // CM2020-PSI
    pub const CM_OT_POINT_A: u32 = 200;
    pub const CM_OT_POINT_B: u32 = 201;
    pub const CM_MATRIX: u32 = 202;
    pub const CM_HASHES: u32 = 203;
    pub const CM_RESULT_COUNT: u32 = 204;

    // Labeled-PSI
    pub const LABELED_PARAMS_REQUEST: u32 = 300;
    pub const LABELED_PARAMS_RESPONSE: u32 = 301;
    pub const LABELED_OPRF_REQUEST: u32 = 302;
    pub const LABELED_OPRF_RESPONSE: u32 = 303;
    pub const LABELED_QUERY: u32 = 304;
    pub const LABELED_QUERY_RESPONSE: u32 = 305;
}

/// Envelope bodies. Data-carrying packets share the `Data` shape; the rest
/// are small typed records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PsiBody {
    /// Length-prefixed byte strings plus the sender's total batch count
    /// (used by `SyncDataBatchInfo`; 0 elsewhere).
    Data {
        data: Vec<Vec<u8>>,
        batch_count: u32,
    },
    /// The curves and hashes the sender supports, preference-ordered.
    HandshakeRequest {
        curves: Vec<i8>,
        hashes: Vec<i8>,
    },
    /// The pair the responder selected; -1 means no common algorithm.
    HandshakeResponse {
        curve: i8,
        hash: i8,
        code: i32,
        message: String,
    },
    /// Cancel/ack packets: an error code plus diagnostic.
    Notification { code: i32, message: String },
    /// The sender's pending task ids, for peer-task reconciliation.
    TaskList {
        party: String,
        tasks: Vec<String>,
        #[serde(default)]
        statuses: Vec<TaskStatus>,
    },
}

impl PsiBody {
    pub fn empty_data() -> PsiBody {
        PsiBody::Data {
            data: Vec::new(),
            batch_count: 0,
        }
    }
}

/// One PSI engine message: the serialized envelope plus transient routing
/// context copied from the outer frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsiMessage {
    pub version: i32,
    pub packet_type: u32,
    #[serde(default)]
    pub party_id: String,
    #[serde(default)]
    pub resource_id: String,
    pub body: PsiBody,

    // transient routing context, never serialized
    #[serde(skip)]
    pub task_id: String,
    #[serde(skip)]
    pub seq: u32,
    #[serde(skip)]
    pub from: String,
    #[serde(skip)]
    pub uuid: String,
}

impl PsiMessage {
    pub fn new(packet_type: u32, body: PsiBody) -> Self {
        PsiMessage {
            version: 1,
            packet_type,
            party_id: String::new(),
            resource_id: String::new(),
            body,
            task_id: String::new(),
            seq: 0,
            from: String::new(),
            uuid: String::new(),
        }
    }

    pub fn data(packet_type: u32, data: Vec<Vec<u8>>) -> Self {
        PsiMessage::new(
            packet_type,
            PsiBody::Data {
                data,
                batch_count: 0,
            },
        )
    }

    pub fn notification(packet_type: u32, code: i32, message: impl Into<String>) -> Self {
        PsiMessage::new(
            packet_type,
            PsiBody::Notification {
                code,
                message: message.into(),
            },
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, PpcError> {
        let mut buffer = Vec::new();
        ciborium::into_writer(self, &mut buffer)
            .map_err(|e| PpcError::DecodePpcMessage(format!("encode psi message: {e}")))?;
        Ok(buffer)
    }

    /// Decode an envelope and re-attach the routing context of the frame it
    /// arrived in.
    pub fn decode(
        buffer: &[u8],
        task_id: &str,
        seq: u32,
        from: &str,
        uuid: &str,
    ) -> Result<PsiMessage, PpcError> {
        let mut message: PsiMessage = ciborium::from_reader(buffer)
            .map_err(|e| PpcError::DecodePpcMessage(format!("decode psi message: {e}")))?;
        message.task_id = task_id.to_string();
        message.seq = seq;
        message.from = from.to_string();
        message.uuid = uuid.to_string();
        Ok(message)
    }

    /// Take the byte strings out of a data body; empty for typed bodies.
    pub fn take_data(&mut self) -> Vec<Vec<u8>> {
        match &mut self.body {
            PsiBody::Data { data, .. } => std::mem::take(data),
            _ => Vec::new(),
        }
    }

    pub fn data_len(&self) -> usize {
        match &self.body {
            PsiBody::Data { data, .. } => data.len(),
            _ => 0,
        }
    }

    pub fn batch_count(&self) -> u32 {
        match &self.body {
            PsiBody::Data { batch_count, .. } => *batch_count,
            _ => 0,
        }
    }

    pub fn error_code(&self) -> i32 {
        match &self.body {
            PsiBody::Notification { code, .. } | PsiBody::HandshakeResponse { code, .. } => *code,
            _ => 0,
        }
    }

    pub fn error_message(&self) -> &str {
        match &self.body {
            PsiBody::Notification { message, .. }
            | PsiBody::HandshakeResponse { message, .. } => message,
            _ => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: &PsiMessage) -> PsiMessage {
        let bytes = message.encode().unwrap();
        PsiMessage::decode(&bytes, "T_1", 7, "1001", "u-1").unwrap()
    }

    #[test]
    fn data_body_roundtrip() {
        let mut message = PsiMessage::data(
            packet::ECDH_EVALUATE_REQUEST,
            vec![vec![1, 2, 3], vec![], vec![0xff; 32]],
        );
        message.resource_id = "res-1".into();
        let mut decoded = roundtrip(&message);
        assert_eq!(decoded.packet_type, packet::ECDH_EVALUATE_REQUEST);
        assert_eq!(decoded.resource_id, "res-1");
        assert_eq!(decoded.task_id, "T_1");
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.from, "1001");
        let data = decoded.take_data();
        assert_eq!(data.len(), 3);
        assert_eq!(data[2], vec![0xff; 32]);
        // a second take yields nothing
        assert_eq!(decoded.take_data().len(), 0);
    }

    #[test]
    fn handshake_bodies_roundtrip() {
        let request = PsiMessage::new(
            packet::HANDSHAKE_REQUEST,
            PsiBody::HandshakeRequest {
                curves: vec![0, 4],
                hashes: vec![0, 1],
            },
        );
        assert_eq!(roundtrip(&request).body, request.body);

        let response = PsiMessage::new(
            packet::HANDSHAKE_RESPONSE,
            PsiBody::HandshakeResponse {
                curve: -1,
                hash: 0,
                code: 0,
                message: "success".into(),
            },
        );
        let decoded = roundtrip(&response);
        assert_eq!(decoded.body, response.body);
    }

    #[test]
    fn notification_carries_code() {
        let message = PsiMessage::notification(
            packet::CANCEL_TASK_NOTIFICATION,
            -1010,
            "task not found",
        );
        let decoded = roundtrip(&message);
        assert_eq!(decoded.error_code(), -1010);
        assert_eq!(decoded.error_message(), "task not found");
    }

    #[test]
    fn batch_count_travels_in_data_body() {
        let message = PsiMessage::new(
            packet::ECDH_SYNC_DATA_BATCH_INFO,
            PsiBody::Data {
                data: Vec::new(),
                batch_count: 12,
            },
        );
        assert_eq!(roundtrip(&message).batch_count(), 12);
    }
}
