// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-engine configuration.
//!
//! The supported curve/hash lists form the process-wide suite registry: set
//! once at startup, passed into engines by value, never mutated afterwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use veil_types::{EccCurve, HashAlg, PsiAlgorithm};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PsiConfig {
    /// This node's agency id.
    pub self_party: String,
    pub algorithm: PsiAlgorithm,
    /// All peer agencies this node may talk to; drives task-info sync.
    pub agencies: Vec<String>,
    /// Preference-ordered suite registry announced in handshakes.
    pub supported_curves: Vec<EccCurve>,
    pub supported_hashes: Vec<HashAlg>,
    /// Prefer the SM suite when both sides support SM2 + SM3.
    pub prefer_sm_crypto: bool,
    /// Rows per blinding batch; SQL sources always load in one shot.
    pub data_batch_size: i64,
    /// Bounds both the late-message holding buffer and the network timeout.
    pub holding_message_minutes: u64,
    /// Tasks older than this may be cancelled when absent from every peer's
    /// sync list.
    pub task_expire: Duration,
    pub ping_interval: Duration,
    pub task_sync_interval: Duration,
    /// Soft cap on the per-engine subtask cache.
    pub max_cache_capacity: u64,
    /// Where auto-generated output descs point: `{result_dir}/{taskId}.result`.
    pub result_dir: String,
    /// Allow overwriting an existing output resource.
    pub enable_output_exists: bool,
}

impl Default for PsiConfig {
    fn default() -> Self {
        PsiConfig {
            self_party: String::new(),
            algorithm: PsiAlgorithm::EcdhPsi2Pc,
            agencies: Vec::new(),
            supported_curves: vec![EccCurve::Ed25519, EccCurve::IppX25519],
            supported_hashes: vec![HashAlg::Sha256, HashAlg::Sha512, HashAlg::Blake2b],
            prefer_sm_crypto: false,
            data_batch_size: 10_000,
            holding_message_minutes: 30,
            task_expire: Duration::from_secs(10),
            ping_interval: Duration::from_secs(60),
            task_sync_interval: Duration::from_secs(10),
            max_cache_capacity: 1024 * 1024 * 1024,
            result_dir: "result".into(),
            enable_output_exists: false,
        }
    }
}

impl PsiConfig {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.holding_message_minutes * 60)
    }
}
