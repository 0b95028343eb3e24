// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Mutable per-task lifecycle state.
//!
//! Invariants:
//! - every allocated subtask seq sits in the outstanding set exactly once
//!   between allocation and erasure, and its erasure bumps exactly one of
//!   the success/failure counters;
//! - the result callback fires at most once, guarded by the `done` flag;
//! - a task is completable only when its input is exhausted (`finished`)
//!   and the outstanding set is empty.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use tracing::{info, warn};
use veil_io::{DataBatch, DataResourceLoader, DataSchema, LineReader, LineWriter};
use veil_types::{
    DataResourceDesc, DataResourceType, PpcError, Task, TaskResult,
};

pub type TaskCallback = Box<dyn FnOnce(TaskResult) + Send + 'static>;
type Hook = std::sync::Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct SeqAccounting {
    outstanding: BTreeSet<u32>,
    success: u64,
    failed: u64,
}

pub struct TaskState {
    task: Task,
    only_self_run: bool,
    start: Instant,
    result_dir: String,

    peer_id: RwLock<String>,
    callback: Mutex<Option<TaskCallback>>,

    current_seq: AtomicU32,
    seqs: Mutex<SeqAccounting>,

    /// Input exhausted; no further subtask will be allocated.
    finished: AtomicBool,
    /// The result callback has fired (or is about to).
    done: AtomicBool,

    worker: Mutex<Option<Hook>>,
    finalize: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    on_sub_task_finished: Mutex<Option<Hook>>,

    reader: Mutex<Option<LineReader>>,
    reader_param: AtomicI64,
    sql_reader: AtomicBool,
    writer: Mutex<Option<LineWriter>>,
    output_override: Mutex<Option<DataResourceDesc>>,
    uploaded: AtomicBool,
}

impl TaskState {
    pub fn new(task: Task, callback: TaskCallback, only_self_run: bool, result_dir: &str) -> Self {
        TaskState {
            task,
            only_self_run,
            start: Instant::now(),
            result_dir: result_dir.to_string(),
            peer_id: RwLock::new(String::new()),
            callback: Mutex::new(Some(callback)),
            current_seq: AtomicU32::new(0),
            seqs: Mutex::new(SeqAccounting::default()),
            finished: AtomicBool::new(false),
            done: AtomicBool::new(false),
            worker: Mutex::new(None),
            finalize: Mutex::new(None),
            on_sub_task_finished: Mutex::new(None),
            reader: Mutex::new(None),
            reader_param: AtomicI64::new(-1),
            sql_reader: AtomicBool::new(false),
            writer: Mutex::new(None),
            output_override: Mutex::new(None),
            uploaded: AtomicBool::new(false),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn only_self_run(&self) -> bool {
        self.only_self_run
    }

    pub fn peer_id(&self) -> String {
        self.peer_id.read().unwrap().clone()
    }

    pub fn set_peer_id(&self, peer: &str) {
        *self.peer_id.write().unwrap() = peer.to_string();
    }

    pub fn pending_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    // ── Reader / writer ──────────────────────────────────────────────────────

    pub fn set_reader(&self, reader: LineReader, reader_param: i64) {
        self.sql_reader.store(reader.is_one_shot(), Ordering::SeqCst);
        self.reader_param.store(reader_param, Ordering::SeqCst);
        *self.reader.lock().unwrap() = Some(reader);
    }

    pub fn reader(&self) -> &Mutex<Option<LineReader>> {
        &self.reader
    }

    pub fn reader_param(&self) -> i64 {
        self.reader_param.load(Ordering::SeqCst)
    }

    pub fn sql_reader(&self) -> bool {
        self.sql_reader.load(Ordering::SeqCst)
    }

    pub fn set_writer(&self, writer: LineWriter) {
        *self.writer.lock().unwrap() = Some(writer);
    }

    /// The effective output desc: the task's own, or the generated default.
    pub fn output_desc(&self) -> Option<DataResourceDesc> {
        if let Some(resource) = self.task.self_resource() {
            if let Some(desc) = &resource.output_desc {
                return Some(desc.clone());
            }
        }
        self.output_override.lock().unwrap().clone()
    }

    /// Generate `result/{taskId}.result` when no output desc was given.
    pub fn generate_default_output_desc(&self) -> DataResourceDesc {
        if let Some(desc) = self.output_desc() {
            return desc;
        }
        let desc = DataResourceDesc {
            resource_type: DataResourceType::File,
            path: format!("{}/{}.result", self.result_dir, self.task.id),
            ..Default::default()
        };
        info!(task = %self.task.id, path = %desc.path, "generated default output desc");
        *self.output_override.lock().unwrap() = Some(desc.clone());
        desc
    }

    /// Append result rows through the task writer. Rows are serialized —
    /// callers may store from concurrent subtasks.
    pub fn store_result(
        &self,
        loader: &DataResourceLoader,
        rows: &[Vec<u8>],
    ) -> Result<(), PpcError> {
        let mut writer = self.writer.lock().unwrap();
        if writer.is_none() {
            let desc = self.generate_default_output_desc();
            *writer = Some(loader.load_writer(&desc, true)?);
        }
        let out = writer.as_mut().expect("writer created above");
        let batch = DataBatch::from_bytes(rows.to_vec());
        out.write_line(&batch, DataSchema::Bytes, "\n")?;
        out.flush()
    }

    // ── Subtask seq accounting ───────────────────────────────────────────────

    /// Allocate the next subtask seq; starts at 1 and strictly increases.
    pub fn allocate_seq(&self) -> u32 {
        let seq = self.current_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.seqs.lock().unwrap().outstanding.insert(seq);
        seq
    }

    /// Erase one finished seq, bumping the success or failure counter.
    /// Erasing an unknown seq is a no-op.
    pub fn erase_finished_seq(&self, seq: u32, success: bool) {
        {
            let mut seqs = self.seqs.lock().unwrap();
            if !seqs.outstanding.remove(&seq) {
                return;
            }
            if success {
                seqs.success += 1;
            } else {
                seqs.failed += 1;
            }
            info!(
                task = %self.task.id, seq, success,
                outstanding = seqs.outstanding.len(),
                ok = seqs.success, failed = seqs.failed,
                "subtask finished"
            );
        }
        let hook = self.on_sub_task_finished.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn outstanding_seqs(&self) -> usize {
        self.seqs.lock().unwrap().outstanding.len()
    }

    pub fn failed_count(&self) -> u64 {
        self.seqs.lock().unwrap().failed
    }

    pub fn success_count(&self) -> u64 {
        self.seqs.lock().unwrap().success
    }

    // ── Lifecycle flags ──────────────────────────────────────────────────────

    pub fn set_finished(&self, finished: bool) {
        self.finished.store(finished, Ordering::SeqCst);
    }

    pub fn load_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Input exhausted and all subtasks drained.
    pub fn completable(&self) -> bool {
        self.load_finished() && self.seqs.lock().unwrap().outstanding.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    // ── Hooks ────────────────────────────────────────────────────────────────

    pub fn set_worker(&self, worker: impl Fn() + Send + Sync + 'static) {
        *self.worker.lock().unwrap() = Some(std::sync::Arc::new(worker));
    }

    /// Invoke the worker closure once. Must stay non-blocking and bounded.
    pub fn execute_work(&self) {
        let worker = self.worker.lock().unwrap().clone();
        if let Some(worker) = worker {
            worker();
        }
    }

    /// The finalize handler runs exactly once, success or failure, before
    /// the result callback. It releases engine caches and gateway routing.
    pub fn register_finalize_handler(&self, handler: impl FnOnce() + Send + 'static) {
        *self.finalize.lock().unwrap() = Some(Box::new(handler));
    }

    /// Invoked on every seq completion, success or failure.
    pub fn register_sub_task_finished_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.on_sub_task_finished.lock().unwrap() = Some(std::sync::Arc::new(handler));
    }

    // ── Completion ───────────────────────────────────────────────────────────

    /// Natural completion: builds the result from the subtask counters.
    pub fn complete(&self) {
        let result = {
            let seqs = self.seqs.lock().unwrap();
            if seqs.failed > 0 {
                TaskResult::failed(
                    &self.task.id,
                    &PpcError::OnException(format!(
                        "task {} failed for {} error(s)",
                        self.task.id, seqs.failed
                    )),
                )
            } else {
                TaskResult::success(&self.task.id)
            }
        };
        self.finish(result);
    }

    /// Deliver a terminal result exactly once: run finalize, publish the
    /// output on success, release the reader, then fire the callback.
    pub fn finish(&self, mut result: TaskResult) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            task = %self.task.id,
            success = result.is_success(),
            ok = self.success_count(),
            failed = self.failed_count(),
            "task finished"
        );
        if let Some(finalize) = self.finalize.lock().unwrap().take() {
            finalize();
        }
        {
            let mut writer = self.writer.lock().unwrap();
            if let Some(writer) = writer.as_mut() {
                if result.is_success() && !self.uploaded.swap(true, Ordering::SeqCst) {
                    if let Err(e) = writer.flush().and_then(|_| writer.upload()) {
                        warn!(task = %self.task.id, error = %e, "publishing output failed");
                        result.set_error(&e);
                    }
                    result.file_info = writer.file_info();
                }
                writer.clean();
            }
        }
        if let Some(reader) = self.reader.lock().unwrap().as_mut() {
            reader.clean();
        }
        result.time_cost = self.pending_ms();
        if let Some(callback) = self.callback.lock().unwrap().take() {
            callback(result);
        }
    }

    /// A fatal error inside a subtask: drop all outstanding work and fail.
    pub fn on_task_exception(&self, message: &str) {
        self.set_finished(true);
        self.seqs.lock().unwrap().outstanding.clear();
        let error = PpcError::OnException(format!(
            "task {} exception, error: {message}",
            self.task.id
        ));
        warn!(task = %self.task.id, %message, "task exception");
        self.finish(TaskResult::failed(&self.task.id, &error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use veil_types::{PartyResource, PsiAlgorithm};

    fn state_with(calls: Arc<AtomicUsize>) -> TaskState {
        let task = Task::new("T_1", PsiAlgorithm::EcdhPsi2Pc, PartyResource::new("1001", 0));
        TaskState::new(
            task,
            Box::new(move |_result| {
                calls.fetch_add(1, Ordering::SeqCst);
            }),
            false,
            "result",
        )
    }

    #[test]
    fn seq_allocation_is_monotonic_and_tracked_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = state_with(calls);
        assert_eq!(state.allocate_seq(), 1);
        assert_eq!(state.allocate_seq(), 2);
        assert_eq!(state.outstanding_seqs(), 2);
        state.erase_finished_seq(1, true);
        state.erase_finished_seq(1, true); // double erase is a no-op
        assert_eq!(state.outstanding_seqs(), 1);
        assert_eq!(state.success_count(), 1);
        state.erase_finished_seq(2, false);
        assert_eq!(state.failed_count(), 1);
    }

    #[test]
    fn completable_requires_finished_and_drained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = state_with(calls);
        let seq = state.allocate_seq();
        assert!(!state.completable());
        state.set_finished(true);
        assert!(!state.completable());
        state.erase_finished_seq(seq, true);
        assert!(state.completable());
    }

    #[test]
    fn callback_fires_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = state_with(Arc::clone(&calls));
        state.set_finished(true);
        state.complete();
        state.complete();
        state.on_task_exception("too late");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(state.is_done());
    }

    #[test]
    fn subtask_hook_fires_on_each_erase() {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = state_with(Arc::new(AtomicUsize::new(0)));
        let hook_calls = Arc::clone(&calls);
        state.register_sub_task_finished_handler(move || {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        });
        let a = state.allocate_seq();
        let b = state.allocate_seq();
        state.erase_finished_seq(a, true);
        state.erase_finished_seq(b, false);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exception_clears_outstanding_and_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = state_with(Arc::clone(&calls));
        state.allocate_seq();
        state.on_task_exception("reader died");
        assert_eq!(state.outstanding_seqs(), 0);
        assert!(state.completable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_output_desc_targets_result_dir() {
        let state = state_with(Arc::new(AtomicUsize::new(0)));
        let desc = state.generate_default_output_desc();
        assert_eq!(desc.path, "result/T_1.result");
        // generating twice yields the same desc
        assert_eq!(state.generate_default_output_desc().path, desc.path);
    }
}
