// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Node configuration: one YAML file selected with `-c/--config`.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use veil_psi::PsiConfig;
use veil_types::{HdfsConnectionOption, SqlConnectionOption};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's agency id.
    pub agency: String,
    /// Peer agencies reachable through the gateway.
    pub agencies: Vec<String>,
    /// Shared engine settings (suite registry, batch size, timeouts).
    pub psi: PsiConfig,
    /// Browser-assisted engine settings.
    pub bs_ecdh: BsEcdhConfig,
    /// mmap window for file readers; 0 keeps the built-in default.
    pub mmap_granularity: u64,
    /// Pull-buffer size for HDFS block reads, in bytes; 0 keeps the default.
    pub hdfs_buffer_size: u64,
    /// Default HDFS connection for resources that do not carry their own.
    pub hdfs: Option<HdfsConnectionOption>,
    /// Default SQL connection for resources that do not carry their own.
    pub sql: Option<SqlConnectionOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BsEcdhConfig {
    pub timeout_minutes: u32,
    pub enable_output_exists: bool,
}

impl Default for BsEcdhConfig {
    fn default() -> Self {
        BsEcdhConfig {
            timeout_minutes: 60,
            enable_output_exists: false,
        }
    }
}

/// Load the node configuration, falling back to defaults when no file was
/// given.
pub fn load(path: Option<&Path>) -> anyhow::Result<NodeConfig> {
    let Some(path) = path else {
        return Ok(NodeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut config: NodeConfig =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    // the engine config inherits the node identity unless set explicitly
    if config.psi.self_party.is_empty() {
        config.psi.self_party = config.agency.clone();
    }
    if config.psi.agencies.is_empty() {
        config.psi.agencies = config.agencies.clone();
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_file() {
        let config = load(None).unwrap();
        assert!(config.agency.is_empty());
        assert_eq!(config.bs_ecdh.timeout_minutes, 60);
    }

    #[test]
    fn engine_config_inherits_node_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "agency: \"1001\"\nagencies: [\"1001\", \"1002\"]\nbs_ecdh:\n  timeout_minutes: 5\n",
        )
        .unwrap();
        let config = load(Some(&path)).unwrap();
        assert_eq!(config.psi.self_party, "1001");
        assert_eq!(config.psi.agencies.len(), 2);
        assert_eq!(config.bs_ecdh.timeout_minutes, 5);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "agency: [not a string").unwrap();
        assert!(load(Some(&path)).is_err());
    }
}
