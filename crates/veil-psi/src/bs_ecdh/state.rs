// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Liveness state of one browser-assisted task.
//!
//! The browser drives everything, so the only signal a task is alive is its
//! operations arriving. A running task that stops receiving them pauses
//! itself after `PAUSE_THRESHOLD_MS`; a paused one resumes after
//! `MIN_BS_ACTIVE_COUNT` operations. Once every cipher is in, the pause
//! threshold is stretched to the validity term so the final intersection
//! cannot be interrupted.

use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{info, warn};
use veil_types::{PpcError, TaskStatus};

use super::messages::{
    BsEcdhResult, BS_VALIDITY_TERM_MS, MIN_BS_ACTIVE_COUNT, PAUSE_THRESHOLD_MS,
};

struct LivenessInner {
    status: TaskStatus,
    result: Option<BsEcdhResult>,
    latest_active: Instant,
    auto_pause_threshold: Duration,
    active_count: u64,
}

pub struct BsEcdhTaskState {
    task_id: String,
    timeout: Duration,
    inner: RwLock<LivenessInner>,
    /// Serializes the status transitions that read-modify-write `inner`.
    transition: Mutex<()>,
}

impl BsEcdhTaskState {
    pub fn new(task_id: &str, status: TaskStatus, timeout_minutes: u32) -> Self {
        info!(task = task_id, timeout_minutes, "new browser-assisted task state");
        BsEcdhTaskState {
            task_id: task_id.to_string(),
            timeout: Duration::from_secs(timeout_minutes as u64 * 60),
            inner: RwLock::new(LivenessInner {
                status,
                result: None,
                latest_active: Instant::now(),
                auto_pause_threshold: Duration::from_millis(BS_VALIDITY_TERM_MS),
                active_count: 0,
            }),
            transition: Mutex::new(()),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.read().unwrap().status
    }

    pub fn update_status(&self, status: TaskStatus) {
        let _guard = self.transition.lock().unwrap();
        self.inner.write().unwrap().status = status;
    }

    pub fn result(&self) -> Option<BsEcdhResult> {
        self.inner.read().unwrap().result.clone()
    }

    pub fn set_result(&self, result: BsEcdhResult) {
        self.inner.write().unwrap().result = Some(result);
    }

    /// Pause a running task that went quiet.
    pub fn auto_pause_checking(&self) {
        let _guard = self.transition.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        if inner.status == TaskStatus::Running
            && inner.latest_active.elapsed() >= inner.auto_pause_threshold
        {
            Self::turn_to_pausing(&mut inner);
            info!(task = %self.task_id, "task is pausing");
        }
    }

    /// Fail an executable task that exceeded its timeout. Idempotent.
    pub fn is_timeout(&self) -> bool {
        let _guard = self.transition.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        let timeout = inner.status.is_executable() && inner.latest_active.elapsed() >= self.timeout;
        if timeout {
            warn!(task = %self.task_id, "task is timeout");
            inner.result = Some(BsEcdhResult::failed_status(
                &self.task_id,
                &PpcError::TaskTimeout,
            ));
            inner.status = TaskStatus::Failed;
        }
        timeout
    }

    pub fn is_expired(&self) -> bool {
        self.inner.read().unwrap().latest_active.elapsed()
            >= Duration::from_millis(BS_VALIDITY_TERM_MS)
    }

    /// Record one active operation; enough of them resume a paused task.
    pub fn active(&self) {
        let _guard = self.transition.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        if inner.status == TaskStatus::Pausing {
            inner.active_count += 1;
            if inner.active_count == MIN_BS_ACTIVE_COUNT {
                inner.active_count = 0;
                Self::turn_to_running(&mut inner);
            }
        }
        inner.latest_active = Instant::now();
    }

    /// Self ciphers are ready: the browser loop is on, arm auto-pause.
    pub fn setup_auto_pause(&self) {
        let _guard = self.transition.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        Self::turn_to_running(&mut inner);
    }

    /// All ciphers are in: the intersection must not be paused mid-flight.
    pub fn cancel_auto_pause(&self) {
        let _guard = self.transition.lock().unwrap();
        self.inner.write().unwrap().auto_pause_threshold =
            Duration::from_millis(BS_VALIDITY_TERM_MS);
    }

    pub fn pause_task(&self) {
        let _guard = self.transition.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        if inner.status == TaskStatus::Running {
            Self::turn_to_pausing(&mut inner);
        }
    }

    pub fn restart_task(&self) {
        let _guard = self.transition.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        if inner.status == TaskStatus::Pausing {
            Self::turn_to_running(&mut inner);
        }
    }

    fn turn_to_running(inner: &mut LivenessInner) {
        inner.status = TaskStatus::Running;
        inner.auto_pause_threshold = Duration::from_millis(PAUSE_THRESHOLD_MS);
        inner.latest_active = Instant::now();
    }

    fn turn_to_pausing(inner: &mut LivenessInner) {
        inner.status = TaskStatus::Pausing;
        inner.auto_pause_threshold = Duration::from_millis(BS_VALIDITY_TERM_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_active_operations_resume_a_paused_task() {
        let state = BsEcdhTaskState::new("T_1", TaskStatus::Pending, 60);
        state.setup_auto_pause();
        assert_eq!(state.status(), TaskStatus::Running);
        state.pause_task();
        assert_eq!(state.status(), TaskStatus::Pausing);
        state.active();
        state.active();
        assert_eq!(state.status(), TaskStatus::Pausing);
        state.active();
        assert_eq!(state.status(), TaskStatus::Running);
    }

    #[test]
    fn pause_and_restart_are_status_gated() {
        let state = BsEcdhTaskState::new("T_1", TaskStatus::Pending, 60);
        // restarting a PENDING task is a no-op
        state.restart_task();
        assert_eq!(state.status(), TaskStatus::Pending);
        state.setup_auto_pause();
        state.restart_task();
        assert_eq!(state.status(), TaskStatus::Running);
    }

    #[test]
    fn timeout_fails_the_task_once() {
        let state = BsEcdhTaskState::new("T_1", TaskStatus::Pending, 0);
        state.setup_auto_pause();
        assert!(state.is_timeout());
        assert_eq!(state.status(), TaskStatus::Failed);
        let result = state.result().unwrap();
        assert_eq!(result.error_code(), veil_types::codes::TASK_TIMEOUT);
        // terminal tasks never time out again
        assert!(!state.is_timeout());
    }

    #[test]
    fn fresh_tasks_are_not_expired() {
        let state = BsEcdhTaskState::new("T_1", TaskStatus::Pending, 60);
        assert!(!state.is_expired());
    }
}
