// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire-stable protocol enumerations.
//!
//! Discriminant values travel inside `PpcMessage` headers and must never be
//! renumbered; new variants are appended with fresh values.

use serde::{Deserialize, Serialize};

// ── Task kind ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Psi = 0x00,
    Pir = 0x01,
}

impl TaskType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(TaskType::Psi),
            0x01 => Some(TaskType::Pir),
            _ => None,
        }
    }
}

/// The algorithm a task runs. One engine per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PsiAlgorithm {
    CmPsi2Pc = 0x00,
    RaPsi2Pc = 0x01,
    LabeledPsi2Pc = 0x02,
    EcdhPsi2Pc = 0x03,
    EcdhPsiMulti = 0x04,
    EcdhPsiConn = 0x05,
    BsEcdhPsi = 0x06,
    OtPir2Pc = 0x10,
}

impl PsiAlgorithm {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(PsiAlgorithm::CmPsi2Pc),
            0x01 => Some(PsiAlgorithm::RaPsi2Pc),
            0x02 => Some(PsiAlgorithm::LabeledPsi2Pc),
            0x03 => Some(PsiAlgorithm::EcdhPsi2Pc),
            0x04 => Some(PsiAlgorithm::EcdhPsiMulti),
            0x05 => Some(PsiAlgorithm::EcdhPsiConn),
            0x06 => Some(PsiAlgorithm::BsEcdhPsi),
            0x10 => Some(PsiAlgorithm::OtPir2Pc),
            _ => None,
        }
    }

    /// How many parties the protocol expects in total (self included).
    pub fn expected_parties(&self) -> usize {
        match self {
            PsiAlgorithm::EcdhPsiMulti => 3,
            _ => 2,
        }
    }
}

// ── Task lifecycle ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Pausing,
    Failed,
    Completed,
}

impl TaskStatus {
    /// Still admissible for further work (PENDING / RUNNING / PAUSING).
    pub fn is_executable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Pausing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Pausing => "PAUSING",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Completed => "COMPLETED",
        }
    }

    /// Unknown strings map to FAILED, matching the defensive decode of task
    /// status received from remote agencies.
    pub fn parse(value: &str) -> TaskStatus {
        match value {
            "PENDING" => TaskStatus::Pending,
            "RUNNING" => TaskStatus::Running,
            "PAUSING" => TaskStatus::Pausing,
            "COMPLETED" => TaskStatus::Completed,
            _ => TaskStatus::Failed,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Party roles ───────────────────────────────────────────────────────────────

/// Two-party role indices. The client receives the intersection.
pub const PARTY_CLIENT: u16 = 0;
pub const PARTY_SERVER: u16 = 1;

// ── Data resources ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataResourceType {
    #[default]
    File = 0,
    Sql = 1,
    Hdfs = 2,
}

/// Connection parameters for SQL-backed data resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SqlConnectionOption {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

/// Connection parameters for HDFS-backed data resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdfsConnectionOption {
    pub name_node: String,
    pub name_node_port: u16,
    pub user: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub replace_datanode_on_failure: bool,
    /// Milliseconds.
    #[serde(default = "default_hdfs_connection_timeout")]
    pub connection_timeout: u16,
}

fn default_hdfs_connection_timeout() -> u16 {
    1000
}

// ── Crypto suite enumerations ─────────────────────────────────────────────────

/// The curves a handshake may select from. Values are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EccCurve {
    Ed25519 = 0,
    Sm2 = 1,
    Secp256k1 = 2,
    P256 = 3,
    IppX25519 = 4,
}

impl EccCurve {
    pub fn from_i8(value: i8) -> Option<Self> {
        match value {
            0 => Some(EccCurve::Ed25519),
            1 => Some(EccCurve::Sm2),
            2 => Some(EccCurve::Secp256k1),
            3 => Some(EccCurve::P256),
            4 => Some(EccCurve::IppX25519),
            _ => None,
        }
    }
}

/// The hash functions a handshake may select from. Values are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HashAlg {
    Sha256 = 0,
    Sha512 = 1,
    Sm3 = 2,
    Md5 = 3,
    Blake2b = 4,
}

impl HashAlg {
    pub fn from_i8(value: i8) -> Option<Self> {
        match value {
            0 => Some(HashAlg::Sha256),
            1 => Some(HashAlg::Sha512),
            2 => Some(HashAlg::Sm3),
            3 => Some(HashAlg::Md5),
            4 => Some(HashAlg::Blake2b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_string_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Pausing,
            TaskStatus::Failed,
            TaskStatus::Completed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), status);
        }
        // unknown strings degrade to FAILED
        assert_eq!(TaskStatus::parse("EXPLODED"), TaskStatus::Failed);
    }

    #[test]
    fn algorithm_discriminants_are_wire_stable() {
        assert_eq!(PsiAlgorithm::from_u8(0x03), Some(PsiAlgorithm::EcdhPsi2Pc));
        assert_eq!(PsiAlgorithm::from_u8(0x06), Some(PsiAlgorithm::BsEcdhPsi));
        assert_eq!(PsiAlgorithm::from_u8(0x10), Some(PsiAlgorithm::OtPir2Pc));
        assert_eq!(PsiAlgorithm::from_u8(0x07), None);
        assert_eq!(PsiAlgorithm::EcdhPsi2Pc as u8, 0x03);
    }

    #[test]
    fn executable_statuses() {
        assert!(TaskStatus::Pausing.is_executable());
        assert!(!TaskStatus::Completed.is_executable());
        assert!(TaskStatus::Failed.is_terminal());
    }
}
