// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The node-wide error taxonomy.
//!
//! Every failure that can cross a task boundary (result callback, peer
//! notification packet, RPC response) carries one of these variants. The
//! numeric codes are wire-stable: `CancelTaskNotification` packets and RPC
//! results embed them, so peers running older builds must keep decoding them.

use thiserror::Error;

/// Wire-stable error codes. Grouped the way the protocol grew: transport
/// codes in the -1xx range, task/engine codes from -1000 down.
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const EXCEPTION: i32 = -100;
    pub const TIMEOUT: i32 = -101;
    pub const DECODE_PPC_MESSAGE_ERROR: i32 = -102;
    pub const NETWORK_ERROR: i32 = -103;

    pub const TASK_PARAMS_ERROR: i32 = -1000;
    pub const PEER_NODE_DOWN: i32 = -1001;
    pub const DUPLICATED_TASK: i32 = -1002;
    pub const LOAD_DATA_FAILED: i32 = -1003;
    pub const PEER_NOTIFY_FINISH: i32 = -1004;
    pub const DATA_RESOURCE_OCCUPIED: i32 = -1006;
    pub const UNKNOWN_PSI_PACKET_TYPE: i32 = -1009;
    pub const TASK_NOT_FOUND: i32 = -1010;
    pub const TASK_IN_PROCESSING: i32 = -1011;
    pub const ONLY_SUPPORT_ONE_PEER: i32 = -1012;
    pub const NOT_SPECIFY_INPUT_DATA_RESOURCE: i32 = -1014;
    pub const NOT_SPECIFY_OUTPUT_DATA_RESOURCE: i32 = -1015;
    pub const BLIND_DATA_ERROR: i32 = -1017;
    pub const NOT_SPECIFY_PEER_DATA_RESOURCE: i32 = -1019;
    pub const HANDSHAKE_FAILED: i32 = -1020;
    pub const SYNC_PSI_RESULT_FAILED: i32 = -1021;
    pub const HANDLE_TASK_ERROR: i32 = -1023;
    pub const TASK_NOT_READY: i32 = -1024;
    pub const TASK_IS_NOT_RUNNING: i32 = -1025;
    pub const ON_EXCEPTION: i32 = -1026;
    pub const TASK_EXISTS: i32 = -1027;
    pub const TASK_KILLED: i32 = -1028;
    pub const TASK_COUNT_REACH_MAX: i32 = -1029;
    pub const TASK_TIMEOUT: i32 = -1030;

    // I/O layer codes
    pub const OPEN_FILE_FAILED: i32 = -1100;
    pub const INVALID_MMAP_GRANULARITY: i32 = -1101;
    pub const MMAP_FAILED: i32 = -1102;
    pub const HDFS_OPEN_META_INFO_FAILED: i32 = -1103;
    pub const HDFS_READ_DATA_FAILED: i32 = -1104;
    pub const HDFS_WRITE_DATA_FAILED: i32 = -1105;
    pub const OPEN_FILE_LINE_WRITER_EXCEPTION: i32 = -1106;
    pub const UNSUPPORTED_DATA_RESOURCE: i32 = -1107;
    pub const INVALID_PARAM: i32 = -1108;
    pub const DATA_SCHEMA_NOT_SET: i32 = -1109;
    pub const UNSUPPORTED_DATA_SCHEMA: i32 = -1110;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PpcError {
    // ── transport ────────────────────────────────────────────────────────────
    #[error("timeout waiting for message")]
    Timeout,

    #[error("decode ppc message error: {0}")]
    DecodePpcMessage(String),

    #[error("network error: {0}")]
    Network(String),

    // ── task admission / lookup ──────────────────────────────────────────────
    #[error("task params error: {0}")]
    TaskParams(String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("task {0} already exists")]
    DuplicatedTask(String),

    #[error("task {0} is in-processing")]
    TaskInProcessing(String),

    #[error("data resource {0} is in-processing")]
    DataResourceOccupied(String),

    #[error("task count reaches max")]
    TaskCountReachMax,

    #[error("task exists")]
    TaskExists,

    // ── liveness / state ─────────────────────────────────────────────────────
    #[error("peer node is down: {0}")]
    PeerNodeDown(String),

    #[error("job participant sent an error")]
    PeerNotifyFinish,

    #[error("task is timeout")]
    TaskTimeout,

    #[error("task has been killed")]
    TaskKilled,

    #[error("task is not running")]
    TaskIsNotRunning,

    #[error("task {0} is not ready")]
    TaskNotReady(String),

    // ── protocol / crypto ────────────────────────────────────────────────────
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("unknown psi packet type: {0}")]
    UnknownPsiPacketType(u32),

    #[error("psi supports exactly one peer, got {0}")]
    OnlySupportOnePeer(usize),

    #[error("sync psi result failed: {0}")]
    SyncPsiResultFailed(String),

    #[error("blind data error: {0}")]
    BlindData(String),

    #[error("handle task error: {0}")]
    HandleTask(String),

    #[error("no input data resource specified for self party")]
    NotSpecifyInputDataResource,

    #[error("no output data resource specified for self party")]
    NotSpecifyOutputDataResource,

    #[error("no data resource specified for peer party")]
    NotSpecifyPeerDataResource,

    // ── I/O ──────────────────────────────────────────────────────────────────
    #[error("load data failed: {0}")]
    LoadDataFailed(String),

    #[error("open file failed: {0}")]
    OpenFileFailed(String),

    #[error("mmap granularity must be a multiple of the page size: {0}")]
    InvalidMmapGranularity(String),

    #[error("mmap failed: {0}")]
    MmapFailed(String),

    #[error("hdfs meta info unavailable: {0}")]
    HdfsOpenMetaInfoFailed(String),

    #[error("hdfs read failed: {0}")]
    HdfsReadDataFailed(String),

    #[error("hdfs write failed: {0}")]
    HdfsWriteDataFailed(String),

    #[error("open line writer failed: {0}")]
    OpenFileLineWriter(String),

    #[error("unsupported data resource: {0}")]
    UnsupportedDataResource(String),

    #[error("invalid param: {0}")]
    InvalidParam(String),

    #[error("data schema not set")]
    DataSchemaNotSet,

    #[error("unsupported data schema")]
    UnsupportedDataSchema,

    // ── catch-all ────────────────────────────────────────────────────────────
    #[error("{0}")]
    OnException(String),

    /// An error decoded from the wire whose code has no local variant.
    #[error("{message} (code {code})")]
    Remote { code: i32, message: String },
}

impl PpcError {
    /// The wire-stable code for this error.
    pub fn code(&self) -> i32 {
        use codes::*;
        match self {
            PpcError::Timeout => TIMEOUT,
            PpcError::DecodePpcMessage(_) => DECODE_PPC_MESSAGE_ERROR,
            PpcError::Network(_) => NETWORK_ERROR,
            PpcError::TaskParams(_) => TASK_PARAMS_ERROR,
            PpcError::TaskNotFound(_) => TASK_NOT_FOUND,
            PpcError::DuplicatedTask(_) => DUPLICATED_TASK,
            PpcError::TaskInProcessing(_) => TASK_IN_PROCESSING,
            PpcError::DataResourceOccupied(_) => DATA_RESOURCE_OCCUPIED,
            PpcError::TaskCountReachMax => TASK_COUNT_REACH_MAX,
            PpcError::TaskExists => TASK_EXISTS,
            PpcError::PeerNodeDown(_) => PEER_NODE_DOWN,
            PpcError::PeerNotifyFinish => PEER_NOTIFY_FINISH,
            PpcError::TaskTimeout => TASK_TIMEOUT,
            PpcError::TaskKilled => TASK_KILLED,
            PpcError::TaskIsNotRunning => TASK_IS_NOT_RUNNING,
            PpcError::TaskNotReady(_) => TASK_NOT_READY,
            PpcError::HandshakeFailed(_) => HANDSHAKE_FAILED,
            PpcError::UnknownPsiPacketType(_) => UNKNOWN_PSI_PACKET_TYPE,
            PpcError::OnlySupportOnePeer(_) => ONLY_SUPPORT_ONE_PEER,
            PpcError::SyncPsiResultFailed(_) => SYNC_PSI_RESULT_FAILED,
            PpcError::BlindData(_) => BLIND_DATA_ERROR,
            PpcError::HandleTask(_) => HANDLE_TASK_ERROR,
            PpcError::NotSpecifyInputDataResource => NOT_SPECIFY_INPUT_DATA_RESOURCE,
            PpcError::NotSpecifyOutputDataResource => NOT_SPECIFY_OUTPUT_DATA_RESOURCE,
            PpcError::NotSpecifyPeerDataResource => NOT_SPECIFY_PEER_DATA_RESOURCE,
            PpcError::LoadDataFailed(_) => LOAD_DATA_FAILED,
            PpcError::OpenFileFailed(_) => OPEN_FILE_FAILED,
            PpcError::InvalidMmapGranularity(_) => INVALID_MMAP_GRANULARITY,
            PpcError::MmapFailed(_) => MMAP_FAILED,
            PpcError::HdfsOpenMetaInfoFailed(_) => HDFS_OPEN_META_INFO_FAILED,
            PpcError::HdfsReadDataFailed(_) => HDFS_READ_DATA_FAILED,
            PpcError::HdfsWriteDataFailed(_) => HDFS_WRITE_DATA_FAILED,
            PpcError::OpenFileLineWriter(_) => OPEN_FILE_LINE_WRITER_EXCEPTION,
            PpcError::UnsupportedDataResource(_) => UNSUPPORTED_DATA_RESOURCE,
            PpcError::InvalidParam(_) => INVALID_PARAM,
            PpcError::DataSchemaNotSet => DATA_SCHEMA_NOT_SET,
            PpcError::UnsupportedDataSchema => UNSUPPORTED_DATA_SCHEMA,
            PpcError::OnException(_) => ON_EXCEPTION,
            PpcError::Remote { code, .. } => *code,
        }
    }

    /// Rebuild an error from a wire-carried `(code, message)` pair. Codes
    /// with a local variant map back to it so matching stays possible.
    pub fn from_code(code: i32, message: impl Into<String>) -> PpcError {
        let message = message.into();
        use codes::*;
        match code {
            TIMEOUT => PpcError::Timeout,
            NETWORK_ERROR => PpcError::Network(message),
            TASK_PARAMS_ERROR => PpcError::TaskParams(message),
            TASK_NOT_FOUND => PpcError::TaskNotFound(message),
            DUPLICATED_TASK => PpcError::DuplicatedTask(message),
            DATA_RESOURCE_OCCUPIED => PpcError::DataResourceOccupied(message),
            PEER_NODE_DOWN => PpcError::PeerNodeDown(message),
            PEER_NOTIFY_FINISH => PpcError::PeerNotifyFinish,
            TASK_TIMEOUT => PpcError::TaskTimeout,
            TASK_KILLED => PpcError::TaskKilled,
            TASK_IS_NOT_RUNNING => PpcError::TaskIsNotRunning,
            HANDSHAKE_FAILED => PpcError::HandshakeFailed(message),
            SYNC_PSI_RESULT_FAILED => PpcError::SyncPsiResultFailed(message),
            LOAD_DATA_FAILED => PpcError::LoadDataFailed(message),
            ON_EXCEPTION => PpcError::OnException(message),
            _ => PpcError::Remote { code, message },
        }
    }
}

impl From<std::io::Error> for PpcError {
    fn from(e: std::io::Error) -> Self {
        PpcError::OnException(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_survive_the_wire() {
        let original = PpcError::DataResourceOccupied("res-1".into());
        let decoded = PpcError::from_code(original.code(), original.to_string());
        assert_eq!(decoded.code(), original.code());
        assert!(matches!(decoded, PpcError::DataResourceOccupied(_)));
    }

    #[test]
    fn unknown_code_round_trips_verbatim() {
        let decoded = PpcError::from_code(-4242, "vendored failure");
        assert_eq!(decoded.code(), -4242);
        assert_eq!(decoded.to_string(), "vendored failure (code -4242)");
    }
}
