// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The ECDH-PSI client cache.
//!
//! Two stores per task: the peer server's doubly-blinded cipher set (fed by
//! `ServerBlindedData` batches until `SyncDataBatchInfo` declares the total)
//! and one [`SubTaskCache`] per outstanding blinding batch. A subtask walks
//! Evaluating → Finalized → Intersectioned → Stored (→ Syncing → Synced)
//! and is dropped once synced, returning its bytes to the capacity budget.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};
use veil_io::{DataBatch, DataResourceLoader};
use veil_types::PpcError;

use crate::task_state::TaskState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Evaluating,
    Finalizing,
    Finalized,
    IntersectionProgressing,
    Intersectioned,
    StoreProgressing,
    Stored,
    Syncing,
    Synced,
}

// ── Server cipher set ─────────────────────────────────────────────────────────

#[derive(Default)]
struct ServerCipherInner {
    data: HashSet<Vec<u8>>,
    seqs: HashSet<u32>,
    /// -1 until the server announced its total batch count.
    batch_count: i64,
    finished: bool,
}

/// The peer server's complete doubly-blinded data set, accumulated batch by
/// batch. Duplicate seqs are ignored, so redelivery is harmless.
pub struct ServerCipherCache {
    task_id: String,
    inner: RwLock<ServerCipherInner>,
}

impl ServerCipherCache {
    pub fn new(task_id: &str) -> Self {
        ServerCipherCache {
            task_id: task_id.to_string(),
            inner: RwLock::new(ServerCipherInner {
                batch_count: -1,
                ..Default::default()
            }),
        }
    }

    pub fn append(&self, seq: u32, ciphers: Vec<Vec<u8>>) {
        let mut inner = self.inner.write().unwrap();
        if !inner.seqs.insert(seq) {
            return;
        }
        for cipher in ciphers {
            inner.data.insert(cipher);
        }
        if inner.batch_count >= 0 && inner.seqs.len() as i64 == inner.batch_count {
            inner.finished = true;
        }
        info!(task = %self.task_id, seq, batches = inner.seqs.len(),
              finished = inner.finished, "server cipher batch cached");
    }

    pub fn set_batch_count(&self, batch_count: i64) {
        let mut inner = self.inner.write().unwrap();
        inner.batch_count = batch_count;
        if inner.seqs.len() as i64 == batch_count {
            inner.finished = true;
        }
    }

    pub fn load_finished(&self) -> bool {
        self.inner.read().unwrap().finished
    }

    fn contains_all_of<'a>(&self, candidates: impl Iterator<Item = &'a Vec<u8>>) -> Vec<usize> {
        let inner = self.inner.read().unwrap();
        candidates
            .enumerate()
            .filter(|(_, cipher)| inner.data.contains(*cipher))
            .map(|(index, _)| index)
            .collect()
    }
}

// ── Per-batch subtask cache ───────────────────────────────────────────────────

struct SubTaskInner {
    state: CacheState,
    plain: DataBatch,
    client_cipher: Vec<Vec<u8>>,
}

/// One blinding batch in flight: the plaintext rows (kept to map matches
/// back), the peer's evaluate response, and the state machine above.
pub struct SubTaskCache {
    task_id: String,
    seq: u32,
    task_state: Arc<TaskState>,
    server: Arc<ServerCipherCache>,
    capacity: u64,
    inner: Mutex<SubTaskInner>,
}

impl SubTaskCache {
    fn new(
        task_id: &str,
        seq: u32,
        task_state: Arc<TaskState>,
        server: Arc<ServerCipherCache>,
        plain: DataBatch,
    ) -> Self {
        // plaintext plus one compressed point slot per row
        let capacity = plain.capacity_bytes() + plain.len() as u64 * 32;
        SubTaskCache {
            task_id: task_id.to_string(),
            seq,
            task_state,
            server,
            capacity,
            inner: Mutex::new(SubTaskInner {
                state: CacheState::Evaluating,
                plain,
                client_cipher: Vec::new(),
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn task_state(&self) -> &Arc<TaskState> {
        &self.task_state
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn cache_state(&self) -> CacheState {
        self.inner.lock().unwrap().state
    }

    /// Install the doubly-blinded response for this batch. Ignored unless
    /// the batch is still Evaluating, so a replay cannot regress the state.
    pub fn set_client_cipher(&self, ciphers: Vec<Vec<u8>>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CacheState::Evaluating {
            return;
        }
        inner.client_cipher = ciphers;
        inner.state = CacheState::Finalized;
    }

    /// Intersect against the server set and store the plaintext matches.
    ///
    /// Returns the stored rows when they still need to be synced to the
    /// peer; `None` when this batch is done (or not ready yet).
    pub fn try_intersect_and_store(
        &self,
        loader: &DataResourceLoader,
    ) -> Result<Option<Vec<Vec<u8>>>, PpcError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CacheState::Finalized {
            return Ok(None);
        }
        if !self.server.load_finished() {
            return Ok(None);
        }
        inner.state = CacheState::IntersectionProgressing;
        let hits = self.server.contains_all_of(inner.client_cipher.iter());
        let mut intersection = Vec::with_capacity(hits.len());
        for index in hits {
            intersection.push(inner.plain.to_bytes(index)?);
        }
        inner.state = CacheState::Intersectioned;
        info!(task = %self.task_id, seq = self.seq,
              intersections = intersection.len(), "batch intersection complete");

        inner.state = CacheState::StoreProgressing;
        self.task_state.store_result(loader, &intersection)?;
        inner.state = CacheState::Stored;

        if self.task_state.task().sync_result_to_peer {
            inner.state = CacheState::Syncing;
            return Ok(Some(intersection));
        }
        inner.state = CacheState::Synced;
        drop(inner);
        self.task_state.erase_finished_seq(self.seq, true);
        Ok(None)
    }

    /// Terminal transition after the peer acknowledged (or refused) the
    /// synced rows.
    pub fn mark_synced(&self, success: bool) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = CacheState::Synced;
        }
        self.task_state.erase_finished_seq(self.seq, success);
    }
}

// ── Task-level cache ──────────────────────────────────────────────────────────

/// All ECDH subtask caches of one engine, bounded by a soft byte budget.
pub struct EcdhCache {
    max_capacity: u64,
    capacity: AtomicU64,
    tasks: RwLock<HashMap<String, BTreeMap<u32, Arc<SubTaskCache>>>>,
    server_data: RwLock<HashMap<String, Arc<ServerCipherCache>>>,
}

impl EcdhCache {
    pub fn new(max_capacity: u64) -> Self {
        EcdhCache {
            max_capacity,
            capacity: AtomicU64::new(0),
            tasks: RwLock::new(HashMap::new()),
            server_data: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert_server_cipher_cache(&self, task_id: &str) -> Arc<ServerCipherCache> {
        let mut store = self.server_data.write().unwrap();
        Arc::clone(
            store
                .entry(task_id.to_string())
                .or_insert_with(|| Arc::new(ServerCipherCache::new(task_id))),
        )
    }

    pub fn server_cipher_cache(&self, task_id: &str) -> Option<Arc<ServerCipherCache>> {
        self.server_data.read().unwrap().get(task_id).cloned()
    }

    pub fn insert_sub_task(
        &self,
        task_id: &str,
        seq: u32,
        task_state: &Arc<TaskState>,
        server: Arc<ServerCipherCache>,
        plain: DataBatch,
    ) -> Arc<SubTaskCache> {
        let mut tasks = self.tasks.write().unwrap();
        let slots = tasks.entry(task_id.to_string()).or_default();
        if let Some(existing) = slots.get(&seq) {
            return Arc::clone(existing);
        }
        let sub = Arc::new(SubTaskCache::new(
            task_id,
            seq,
            Arc::clone(task_state),
            server,
            plain,
        ));
        self.capacity.fetch_add(sub.capacity(), Ordering::SeqCst);
        slots.insert(seq, Arc::clone(&sub));
        sub
    }

    pub fn sub_task(&self, task_id: &str, seq: u32) -> Option<Arc<SubTaskCache>> {
        self.tasks
            .read()
            .unwrap()
            .get(task_id)
            .and_then(|slots| slots.get(&seq))
            .cloned()
    }

    pub fn is_full(&self) -> bool {
        self.capacity.load(Ordering::SeqCst) >= self.max_capacity
    }

    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::SeqCst)
    }

    fn release(&self, bytes: u64) {
        let mut current = self.capacity.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(bytes);
            match self.capacity.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop every synced subtask (returning its bytes to the budget) and
    /// hand back the batches that are ready to intersect.
    pub fn sweep(&self) -> Vec<Arc<SubTaskCache>> {
        let mut ready = Vec::new();
        let mut tasks = self.tasks.write().unwrap();
        tasks.retain(|task_id, slots| {
            slots.retain(|seq, sub| match sub.cache_state() {
                CacheState::Synced => {
                    info!(task = %task_id, seq, "drop finished subtask cache");
                    self.release(sub.capacity());
                    false
                }
                CacheState::Finalized => {
                    ready.push(Arc::clone(sub));
                    true
                }
                _ => true,
            });
            !slots.is_empty()
        });
        ready
    }

    /// Erase everything the task accumulated. Only safe once the task has
    /// finished.
    pub fn erase(&self, task_id: &str) {
        {
            let mut tasks = self.tasks.write().unwrap();
            if let Some(slots) = tasks.remove(task_id) {
                for sub in slots.values() {
                    self.release(sub.capacity());
                }
            }
        }
        if self.server_data.write().unwrap().remove(task_id).is_some() {
            info!(task = task_id, "erased ecdh cache");
        } else {
            warn!(task = task_id, "erase for unknown ecdh cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_types::{PartyResource, PsiAlgorithm, Task};

    fn task_state() -> Arc<TaskState> {
        let task = Task::new("T_1", PsiAlgorithm::EcdhPsi2Pc, PartyResource::new("1001", 0));
        Arc::new(TaskState::new(task, Box::new(|_| {}), false, "result"))
    }

    #[test]
    fn server_cache_finishes_when_all_batches_seen() {
        let cache = ServerCipherCache::new("T_1");
        cache.append(1, vec![vec![1], vec![2]]);
        cache.append(1, vec![vec![3]]); // duplicate seq: ignored
        assert!(!cache.load_finished());
        cache.set_batch_count(2);
        assert!(!cache.load_finished());
        cache.append(2, vec![vec![4]]);
        assert!(cache.load_finished());
        assert_eq!(cache.contains_all_of([vec![2], vec![3], vec![4]].iter()), vec![0, 2]);
    }

    #[test]
    fn capacity_is_returned_on_sweep() {
        let cache = EcdhCache::new(1024);
        let state = task_state();
        let server = cache.insert_server_cipher_cache("T_1");
        let plain = DataBatch::from_bytes(vec![b"alice".to_vec(), b"bob".to_vec()]);
        let seq = state.allocate_seq();
        let sub = cache.insert_sub_task("T_1", seq, &state, server, plain);
        assert!(cache.capacity() > 0);
        sub.set_client_cipher(vec![vec![9u8; 32], vec![8u8; 32]]);
        assert_eq!(sub.cache_state(), CacheState::Finalized);
        // ready batches surface; nothing is dropped yet
        assert_eq!(cache.sweep().len(), 1);
        sub.mark_synced(true);
        assert_eq!(cache.sweep().len(), 0);
        assert_eq!(cache.capacity(), 0);
        assert!(cache.sub_task("T_1", seq).is_none());
    }

    #[test]
    fn replayed_evaluate_response_cannot_regress_state() {
        let cache = EcdhCache::new(1024);
        let state = task_state();
        let server = cache.insert_server_cipher_cache("T_1");
        let sub = cache.insert_sub_task(
            "T_1",
            state.allocate_seq(),
            &state,
            server,
            DataBatch::from_bytes(vec![b"alice".to_vec()]),
        );
        sub.set_client_cipher(vec![vec![1u8; 32]]);
        sub.mark_synced(true);
        sub.set_client_cipher(vec![vec![2u8; 32]]);
        assert_eq!(sub.cache_state(), CacheState::Synced);
    }
}
