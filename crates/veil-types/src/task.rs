// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The task model: what a caller submits to the node and what it gets back.
//!
//! A `Task` is immutable once admitted by an engine; all mutable lifecycle
//! state lives in the engine's task state, never here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PpcError;
use crate::protocol::{
    DataResourceType, HdfsConnectionOption, PsiAlgorithm, SqlConnectionOption, TaskStatus,
    TaskType,
};

// ── Data resources ────────────────────────────────────────────────────────────

/// Where one side of a data resource lives and how to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataResourceDesc {
    #[serde(rename = "type")]
    pub resource_type: DataResourceType,
    /// File or HDFS path.
    #[serde(default)]
    pub path: String,
    /// SQL statement executed against the configured connection.
    #[serde(default)]
    pub access_command: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub file_md5: String,
    #[serde(default)]
    pub biz_seq_no: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_option: Option<SqlConnectionOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdfs_option: Option<HdfsConnectionOption>,
}

impl DataResourceDesc {
    pub fn file(path: impl Into<String>) -> Self {
        DataResourceDesc {
            resource_type: DataResourceType::File,
            path: path.into(),
            ..Default::default()
        }
    }
}

/// A party's input (and optional output) data, keyed by a resource id used
/// for mutual exclusion between concurrent tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataResource {
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<DataResourceDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_desc: Option<DataResourceDesc>,
    /// Inline rows supplied directly by the caller instead of a desc.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_data: Vec<Vec<String>>,
}

impl DataResource {
    pub fn new(resource_id: impl Into<String>) -> Self {
        DataResource {
            resource_id: resource_id.into(),
            ..Default::default()
        }
    }
}

// ── Parties ───────────────────────────────────────────────────────────────────

/// One participant of a task: its agency id, its role index in the protocol
/// and the data it contributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PartyResource {
    pub id: String,
    pub party_index: u16,
    #[serde(default)]
    pub desc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_resource: Option<DataResource>,
}

impl PartyResource {
    pub fn new(id: impl Into<String>, party_index: u16) -> Self {
        PartyResource {
            id: id.into(),
            party_index,
            ..Default::default()
        }
    }
}

// ── Task ──────────────────────────────────────────────────────────────────────

/// An admitted unit of work. Immutable after admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub algorithm: PsiAlgorithm,
    pub self_party: PartyResource,
    /// Peer parties keyed by agency id.
    #[serde(default)]
    pub peers: BTreeMap<String, PartyResource>,
    /// Algorithm parameters, opaque JSON.
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub sync_result_to_peer: bool,
    #[serde(default)]
    pub low_bandwidth: bool,
    #[serde(default)]
    pub receivers: Vec<String>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        algorithm: PsiAlgorithm,
        self_party: PartyResource,
    ) -> Self {
        Task {
            id: id.into(),
            task_type: TaskType::Psi,
            algorithm,
            self_party,
            peers: BTreeMap::new(),
            params: String::new(),
            sync_result_to_peer: false,
            low_bandwidth: false,
            receivers: Vec::new(),
        }
    }

    pub fn add_peer(&mut self, party: PartyResource) {
        self.peers.insert(party.id.clone(), party);
    }

    pub fn party_by_index(&self, index: u16) -> Option<&PartyResource> {
        if self.self_party.party_index == index {
            return Some(&self.self_party);
        }
        self.peers.values().find(|p| p.party_index == index)
    }

    pub fn self_resource(&self) -> Option<&DataResource> {
        self.self_party.data_resource.as_ref()
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("task serialization is infallible")
    }

    pub fn decode(data: &str) -> Result<Task, PpcError> {
        serde_json::from_str(data).map_err(|e| PpcError::TaskParams(e.to_string()))
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Metadata of an uploaded output file, filled by writers that publish to a
/// remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileInfo {
    pub path: String,
    pub biz_seq_no: String,
    pub file_id: String,
    pub file_md5: String,
}

/// The terminal outcome of a task, delivered exactly once per admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<(i32, String)>,
    /// Milliseconds from admission to completion.
    #[serde(default)]
    pub time_cost: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_info: Option<FileInfo>,
}

impl TaskResult {
    pub fn success(task_id: impl Into<String>) -> Self {
        TaskResult {
            task_id: task_id.into(),
            status: Some(TaskStatus::Completed),
            error: None,
            time_cost: 0,
            file_info: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: &PpcError) -> Self {
        TaskResult {
            task_id: task_id.into(),
            status: Some(TaskStatus::Failed),
            error: Some((error.code(), error.to_string())),
            time_cost: 0,
            file_info: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() || self.error.as_ref().is_some_and(|(code, _)| *code == 0)
    }

    pub fn set_error(&mut self, error: &PpcError) {
        self.status = Some(TaskStatus::Failed);
        self.error = Some((error.code(), error.to_string()));
    }

    pub fn take_error(&self) -> Option<PpcError> {
        self.error
            .as_ref()
            .filter(|(code, _)| *code != 0)
            .map(|(code, message)| PpcError::from_code(*code, message.clone()))
    }

    /// The RPC-facing JSON shape: `{taskID, code, message, status, timeCost}`
    /// plus the uploaded-file fields when present.
    pub fn to_json(&self) -> serde_json::Value {
        let mut response = serde_json::json!({ "taskID": self.task_id });
        match &self.error {
            Some((code, message)) => {
                response["code"] = (*code).into();
                response["message"] = message.clone().into();
            }
            None => {
                response["code"] = 0.into();
                response["message"] = "success".into();
            }
        }
        if let Some(status) = &self.status {
            response["status"] = status.as_str().into();
        }
        if self.time_cost > 0 {
            response["timeCost"] = format!("{}ms", self.time_cost).into();
        }
        if let Some(info) = &self.file_info {
            if !info.biz_seq_no.is_empty() {
                response["bizSeqNo"] = info.biz_seq_no.clone().into();
                response["fileID"] = info.file_id.clone().into();
                response["fileMd5"] = info.file_md5.clone().into();
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PARTY_CLIENT, PARTY_SERVER};

    fn sample_task() -> Task {
        let mut client = PartyResource::new("1001", PARTY_CLIENT);
        let mut resource = DataResource::new("res-client");
        resource.desc = Some(DataResourceDesc::file("/data/in.csv"));
        resource.output_desc = Some(DataResourceDesc::file("/data/out.csv"));
        client.data_resource = Some(resource);

        let mut task = Task::new("T_0001", PsiAlgorithm::EcdhPsi2Pc, client);
        let mut server = PartyResource::new("1002", PARTY_SERVER);
        server.data_resource = Some(DataResource::new("res-server"));
        task.add_peer(server);
        task.sync_result_to_peer = true;
        task
    }

    #[test]
    fn task_json_roundtrip() {
        let task = sample_task();
        let decoded = Task::decode(&task.encode()).unwrap();
        assert_eq!(decoded.id, "T_0001");
        assert_eq!(decoded.algorithm, PsiAlgorithm::EcdhPsi2Pc);
        assert_eq!(decoded.peers.len(), 1);
        assert!(decoded.sync_result_to_peer);
        assert_eq!(
            decoded.party_by_index(PARTY_SERVER).unwrap().id,
            "1002"
        );
    }

    #[test]
    fn result_json_carries_code_and_status() {
        let result = TaskResult::failed("T_0001", &PpcError::TaskNotFound("T_0001".into()));
        let json = result.to_json();
        assert_eq!(json["code"], crate::error::codes::TASK_NOT_FOUND);
        assert_eq!(json["status"], "FAILED");

        let ok = TaskResult::success("T_0001");
        assert_eq!(ok.to_json()["code"], 0);
        assert_eq!(ok.to_json()["message"], "success");
        assert!(ok.is_success());
    }
}
