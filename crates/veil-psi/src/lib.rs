// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The PSI core of the veil node.
//!
//! [`framework::PsiFramework`] carries everything the protocol engines
//! share: task admission and resource locking, the per-engine worker loop,
//! peer liveness, task-info synchronization, cancellation propagation and
//! result syncing. The engines plug in behind [`framework::PsiEngine`]:
//!
//! - [`ecdh`] — the two-party ECDH-PSI blinding pipeline;
//! - [`bs_ecdh`] — the stateful browser/server-assisted variant;
//! - [`cm2020`] / [`labeled`] — OPRF- and FHE-based engines whose crypto
//!   rounds live behind opaque capability traits.

pub mod bs_ecdh;
pub mod cm2020;
pub mod config;
pub mod ecdh;
pub mod framework;
pub mod labeled;
pub mod suite;
pub mod task_state;

pub use config::PsiConfig;
pub use framework::{PsiEngine, PsiFramework};
pub use suite::EcdhSuite;
pub use task_state::{TaskCallback, TaskState};
