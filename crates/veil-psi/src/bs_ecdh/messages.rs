// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Request/response surface of the browser-assisted engine.
//!
//! These shapes are what the RPC front-end serializes verbatim, which is
//! why the field names carry their wire spelling.

use serde::{Deserialize, Serialize};
use veil_types::{DataResource, PpcError, TaskStatus};

/// Tasks idle past this are erased outright (one day, in ms).
pub const BS_VALIDITY_TERM_MS: u64 = 86_400_000;
/// Active operations needed to resume a paused task.
pub const MIN_BS_ACTIVE_COUNT: u64 = 3;
/// Idle time before a running task auto-pauses; also the cleaner cadence.
pub const PAUSE_THRESHOLD_MS: u64 = 60_000;
/// Concurrent browser-assisted tasks per node.
pub const MAX_TASK_COUNT: usize = 16;

pub const INDEX_FILE_SUFFIX: &str = ".index";
pub const EVIDENCE_FILE_SUFFIX: &str = ".evidence";

/// Where a task currently is, coarse enough for a progress bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStep {
    Initializing = 1,
    ProcessingSelfCiphers = 2,
    ProcessingPartnerCiphers = 3,
    ComputingResults = 4,
    DownloadIndex = 5,
}

impl TaskStep {
    pub fn from_u32(value: u32) -> TaskStep {
        match value {
            2 => TaskStep::ProcessingSelfCiphers,
            3 => TaskStep::ProcessingPartnerCiphers,
            4 => TaskStep::ComputingResults,
            5 => TaskStep::DownloadIndex,
            _ => TaskStep::Initializing,
        }
    }
}

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskRequest {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub data_resource: DataResource,
    #[serde(default)]
    pub enable_audit: bool,
    /// The partner's input count. 0 keeps the compatibility fallback: the
    /// first `sendPartnerCipher`'s `total` field is used instead.
    #[serde(default)]
    pub partner_inputs_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchCipherRequest {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEcdhCipherRequest {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub offset: u32,
    #[serde(default)]
    pub size: u32,
    pub ecdh_ciphers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPartnerCipherRequest {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub offset: u32,
    #[serde(default)]
    pub size: u32,
    /// Compatibility field; only consulted when the run request carried no
    /// partner size.
    #[serde(default)]
    pub total: u32,
    pub partner_ciphers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTaskStatusRequest {
    #[serde(rename = "taskID")]
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskStatusRequest {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillTaskRequest {
    #[serde(rename = "taskID")]
    pub task_id: String,
}

// ── Responses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchCipherResponse {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub offset: u32,
    pub size: u32,
    pub total: u32,
    pub ciphers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusResponse {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub intersections: u64,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub party0_size: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub party1_size: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub time_cost: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub step: u32,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub index: u32,
    #[serde(default)]
    pub progress: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result_file_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result_file_md5: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partner_index_file_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub partner_index_file_md5: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub evidence_file_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub evidence_file_md5: String,
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

fn is_zero_u64(value: &u64) -> bool {
    *value == 0
}

/// The uniform operation result: an optional error plus an optional typed
/// payload already serialized for the RPC layer.
#[derive(Debug, Clone)]
pub struct BsEcdhResult {
    pub task_id: String,
    pub error: Option<(i32, String)>,
    pub data: Option<serde_json::Value>,
}

impl BsEcdhResult {
    pub fn ok(task_id: impl Into<String>) -> Self {
        BsEcdhResult {
            task_id: task_id.into(),
            error: None,
            data: None,
        }
    }

    pub fn with_data(task_id: impl Into<String>, data: impl Serialize) -> Self {
        BsEcdhResult {
            task_id: task_id.into(),
            error: None,
            data: serde_json::to_value(data).ok(),
        }
    }

    pub fn with_error(task_id: impl Into<String>, error: &PpcError) -> Self {
        BsEcdhResult {
            task_id: task_id.into(),
            error: Some((error.code(), error.to_string())),
            data: None,
        }
    }

    pub fn failed_status(task_id: impl Into<String>, error: &PpcError) -> Self {
        let task_id = task_id.into();
        let response = TaskStatusResponse {
            task_id: task_id.clone(),
            status: TaskStatus::Failed.as_str().to_string(),
            ..Default::default()
        };
        BsEcdhResult {
            task_id,
            error: Some((error.code(), error.to_string())),
            data: serde_json::to_value(response).ok(),
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.as_ref().is_some_and(|(code, _)| *code != 0)
    }

    pub fn error_code(&self) -> i32 {
        self.error.as_ref().map(|(code, _)| *code).unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut response = match &self.error {
            Some((code, message)) if *code != 0 => serde_json::json!({
                "code": code,
                "message": message,
            }),
            _ => serde_json::json!({ "code": 0, "message": "success" }),
        };
        if let Some(data) = &self.data {
            response["data"] = data.clone();
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_json_uses_wire_names() {
        let json = r#"{"taskID":"T_1","offset":3,"size":10}"#;
        let request: FetchCipherRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.task_id, "T_1");
        assert_eq!(request.offset, 3);

        let json = r#"{"taskID":"T_1","offset":0,"total":50,"partnerCiphers":["YQ=="]}"#;
        let request: SendPartnerCipherRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.total, 50);
        assert_eq!(request.partner_ciphers.len(), 1);
    }

    #[test]
    fn result_json_carries_code_and_data() {
        let result = BsEcdhResult::with_data(
            "T_1",
            TaskStatusResponse {
                task_id: "T_1".into(),
                status: "RUNNING".into(),
                progress: 40,
                ..Default::default()
            },
        );
        let json = result.to_json();
        assert_eq!(json["code"], 0);
        assert_eq!(json["data"]["status"], "RUNNING");
        assert_eq!(json["data"]["progress"], 40);

        let error = BsEcdhResult::with_error("T_1", &PpcError::TaskNotFound("T_1".into()));
        assert!(error.is_err());
        assert_eq!(error.to_json()["code"], veil_types::codes::TASK_NOT_FOUND);
    }
}
