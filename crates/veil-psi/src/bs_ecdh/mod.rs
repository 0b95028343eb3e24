// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The browser/server-assisted ECDH-PSI engine.
//!
//! Unlike the gateway engines, this one is driven from outside: a browser
//! pulls ciphers, pushes doubly-blinded ones, and pushes the partner's
//! ciphers through the synchronous operations below. Liveness is therefore
//! inferred from those calls (auto-pause/resume), and a background cleaner
//! retires tasks that timed out or expired.

mod cache;
mod io;
mod messages;
mod state;

pub use cache::BsEcdhCache;
pub use io::BsEcdhIo;
pub use messages::{
    BsEcdhResult, FetchCipherRequest, FetchCipherResponse, GetTaskStatusRequest, KillTaskRequest,
    RunTaskRequest, SendEcdhCipherRequest, SendPartnerCipherRequest, TaskStatusResponse, TaskStep,
    UpdateTaskStatusRequest, BS_VALIDITY_TERM_MS, EVIDENCE_FILE_SUFFIX, INDEX_FILE_SUFFIX,
    MAX_TASK_COUNT, MIN_BS_ACTIVE_COUNT, PAUSE_THRESHOLD_MS,
};
pub use state::BsEcdhTaskState;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tracing::{info, warn};
use veil_io::DataResourceLoader;
use veil_types::{PpcError, TaskStatus};

pub struct BsEcdhPsi {
    loader: Arc<DataResourceLoader>,
    timeout_minutes: u32,
    enable_output_exists: bool,
    states: RwLock<HashMap<String, Arc<BsEcdhTaskState>>>,
    caches: RwLock<HashMap<String, Arc<BsEcdhCache>>>,
    started: AtomicBool,
    cleaner: Mutex<Option<tokio::task::JoinHandle<()>>>,
    weak: Weak<BsEcdhPsi>,
}

impl BsEcdhPsi {
    pub fn new(
        loader: Arc<DataResourceLoader>,
        timeout_minutes: u32,
        enable_output_exists: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| BsEcdhPsi {
            loader,
            timeout_minutes,
            enable_output_exists,
            states: RwLock::new(HashMap::new()),
            caches: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            cleaner: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Start the background cleaner. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("bs-ecdh-psi already started");
            return;
        }
        info!("start bs-ecdh-psi");
        let engine = self.weak.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(PAUSE_THRESHOLD_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(engine) = engine.upgrade() else { break };
                if !engine.started.load(Ordering::SeqCst) {
                    break;
                }
                engine.check_and_clean_tasks();
            }
        });
        *self.cleaner.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stop bs-ecdh-psi");
        if let Some(handle) = self.cleaner.lock().unwrap().take() {
            handle.abort();
        }
    }

    // ── Operations ───────────────────────────────────────────────────────────

    /// Admit a task and start its cipher preparation in the background.
    pub fn async_run_task(&self, request: RunTaskRequest) -> BsEcdhResult {
        let task_id = request.task_id.clone();
        if self.find_state(&task_id).is_some() {
            warn!(task = %task_id, "run request for an existing task");
            return BsEcdhResult::ok(&task_id);
        }
        if self.states.read().unwrap().len() >= MAX_TASK_COUNT {
            warn!(task = %task_id, "task count reached max");
            return BsEcdhResult::with_error(&task_id, &PpcError::TaskCountReachMax);
        }

        let state = Arc::new(BsEcdhTaskState::new(
            &task_id,
            TaskStatus::Pending,
            self.timeout_minutes,
        ));
        let cache = BsEcdhCache::new(
            &task_id,
            Arc::clone(&self.loader),
            request.data_resource,
            request.enable_audit,
            self.enable_output_exists,
            request.partner_inputs_size,
            self.ready_hook(&task_id, |state| state.setup_auto_pause()),
            self.ready_hook(&task_id, |state| state.cancel_auto_pause()),
            self.finish_hook(&task_id),
        );
        cache.start();

        self.states
            .write()
            .unwrap()
            .insert(task_id.clone(), state);
        self.caches.write().unwrap().insert(task_id.clone(), cache);
        info!(task = %task_id, "browser-assisted task admitted");
        BsEcdhResult::ok(&task_id)
    }

    pub fn fetch_cipher(&self, request: &FetchCipherRequest) -> BsEcdhResult {
        match self.check_task_request(&request.task_id) {
            Ok(cache) => cache.fetch_cipher(request),
            Err(result) => result,
        }
    }

    pub fn send_ecdh_cipher(&self, request: &SendEcdhCipherRequest) -> BsEcdhResult {
        match self.check_task_request(&request.task_id) {
            Ok(cache) => cache.on_ecdh_cipher_received(request),
            Err(result) => result,
        }
    }

    pub fn send_partner_cipher(&self, request: &SendPartnerCipherRequest) -> BsEcdhResult {
        match self.check_task_request(&request.task_id) {
            Ok(cache) => cache.on_partner_cipher_received(request),
            Err(result) => result,
        }
    }

    pub fn get_task_status(&self, request: &GetTaskStatusRequest) -> BsEcdhResult {
        let Some(state) = self.find_state(&request.task_id) else {
            return BsEcdhResult::with_error(
                &request.task_id,
                &PpcError::TaskNotFound(request.task_id.clone()),
            );
        };
        if state.status().is_terminal() {
            return state
                .result()
                .unwrap_or_else(|| BsEcdhResult::ok(&request.task_id));
        }
        self.prepare_status(&request.task_id, state.status())
    }

    /// Explicit pause/resume, gated by the current status.
    pub fn update_task_status(&self, request: &UpdateTaskStatusRequest) -> BsEcdhResult {
        info!(task = %request.task_id, status = %request.status, "update task status");
        let Some(state) = self.find_state(&request.task_id) else {
            return BsEcdhResult::with_error(
                &request.task_id,
                &PpcError::TaskNotFound(request.task_id.clone()),
            );
        };
        match TaskStatus::parse(&request.status) {
            TaskStatus::Running => state.restart_task(),
            TaskStatus::Pausing => state.pause_task(),
            _ => {}
        }
        if state.status().is_terminal() {
            return state
                .result()
                .unwrap_or_else(|| BsEcdhResult::ok(&request.task_id));
        }
        self.prepare_status(&request.task_id, state.status())
    }

    /// Fail an executable task and drop its cache.
    pub fn kill_task(&self, request: &KillTaskRequest) -> BsEcdhResult {
        info!(task = %request.task_id, "kill task");
        let Some(state) = self.find_state(&request.task_id) else {
            return BsEcdhResult::with_error(
                &request.task_id,
                &PpcError::TaskNotFound(request.task_id.clone()),
            );
        };
        if state.status().is_executable() {
            state.set_result(BsEcdhResult::failed_status(
                &request.task_id,
                &PpcError::TaskKilled,
            ));
            state.update_status(TaskStatus::Failed);
        }
        self.drop_cache(&request.task_id);
        BsEcdhResult::ok(&request.task_id)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn find_state(&self, task_id: &str) -> Option<Arc<BsEcdhTaskState>> {
        self.states.read().unwrap().get(task_id).cloned()
    }

    fn find_cache(&self, task_id: &str) -> Option<Arc<BsEcdhCache>> {
        self.caches.read().unwrap().get(task_id).cloned()
    }

    fn drop_cache(&self, task_id: &str) {
        if let Some(cache) = self.caches.write().unwrap().remove(task_id) {
            info!(task = task_id, "dropping task cipher cache");
            cache.clean();
        }
    }

    /// Gate every cipher operation: the task must exist and be servable.
    /// Each accepted operation counts as an activity ping.
    fn check_task_request(&self, task_id: &str) -> Result<Arc<BsEcdhCache>, BsEcdhResult> {
        let Some(state) = self.find_state(task_id) else {
            return Err(BsEcdhResult::with_error(
                task_id,
                &PpcError::TaskNotFound(task_id.to_string()),
            ));
        };
        // a completed task may still receive trailing cipher pages
        let status = state.status();
        if !matches!(
            status,
            TaskStatus::Running | TaskStatus::Pausing | TaskStatus::Completed
        ) {
            return Err(BsEcdhResult::with_error(task_id, &PpcError::TaskIsNotRunning));
        }
        let Some(cache) = self.find_cache(task_id) else {
            return Err(BsEcdhResult::with_error(
                task_id,
                &PpcError::TaskNotFound(format!("{task_id} cache not found")),
            ));
        };
        state.active();
        Ok(cache)
    }

    fn prepare_status(&self, task_id: &str, status: TaskStatus) -> BsEcdhResult {
        let mut response = TaskStatusResponse {
            task_id: task_id.to_string(),
            status: status.as_str().to_string(),
            ..Default::default()
        };
        if let Some(cache) = self.find_cache(task_id) {
            response.step = cache.step() as u32;
            response.index = cache.index();
            response.progress = cache.progress();
        }
        BsEcdhResult::with_data(task_id, response)
    }

    fn check_and_clean_tasks(&self) {
        let snapshot: Vec<(String, Arc<BsEcdhTaskState>)> = {
            let states = self.states.read().unwrap();
            states
                .iter()
                .map(|(id, state)| (id.clone(), Arc::clone(state)))
                .collect()
        };
        for (task_id, state) in snapshot {
            state.auto_pause_checking();
            if state.status().is_terminal() || state.is_timeout() || state.is_expired() {
                self.drop_cache(&task_id);
            }
            if state.is_expired() {
                info!(task = %task_id, "erasing expired task");
                self.states.write().unwrap().remove(&task_id);
            }
        }
    }

    // ── Hook builders ────────────────────────────────────────────────────────

    fn ready_hook(
        &self,
        task_id: &str,
        action: fn(&BsEcdhTaskState),
    ) -> Box<dyn Fn() + Send + Sync + 'static> {
        let engine: Weak<BsEcdhPsi> = self.weak.clone();
        let task_id = task_id.to_string();
        Box::new(move || {
            if let Some(engine) = engine.upgrade() {
                if let Some(state) = engine.find_state(&task_id) {
                    action(&state);
                }
            }
        })
    }

    fn finish_hook(
        &self,
        task_id: &str,
    ) -> Box<dyn Fn(TaskStatus, BsEcdhResult) + Send + Sync + 'static> {
        let engine: Weak<BsEcdhPsi> = self.weak.clone();
        let task_id = task_id.to_string();
        Box::new(move |status, result| {
            info!(task = %task_id, status = %status, "browser-assisted task finished");
            if let Some(engine) = engine.upgrade() {
                if let Some(state) = engine.find_state(&task_id) {
                    state.update_status(status);
                    state.set_result(result);
                }
            }
        })
    }
}
