// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The two-party ECDH-PSI engine.
//!
//! Party 0 (client) receives the intersection, party 1 (server) provides
//! data. Both blind their rows with a private scalar; the server streams
//! its blinded set (`ServerBlindedData` + a final `SyncDataBatchInfo`) and
//! evaluates the client's batches (`EvaluateRequest`/`Response`). The
//! client intersects in the doubly-blinded space and maps hits back to its
//! plaintext rows by batch position, which is why element order is
//! preserved end to end.

mod cache;

pub use cache::{CacheState, EcdhCache, ServerCipherCache, SubTaskCache};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use veil_channel::Front;
use veil_io::{DataBatch, DataResourceLoader, DataSchema};
use veil_protocol::{packet, PsiBody, PsiMessage};
use veil_types::{PpcError, PsiAlgorithm, Task, PARTY_CLIENT, PARTY_SERVER};

use crate::config::PsiConfig;
use crate::framework::{PsiEngine, PsiFramework};
use crate::suite::{select_suite, EcdhSuite};
use crate::task_state::{TaskCallback, TaskState};

/// The negotiated suite plus this task's private scalar.
pub struct EcdhCrypto {
    suite: EcdhSuite,
    key: Vec<u8>,
}

impl EcdhCrypto {
    pub fn new(suite: EcdhSuite) -> Self {
        let key = suite.random_scalar();
        EcdhCrypto { suite, key }
    }

    pub fn blind_batch(&self, batch: &DataBatch) -> Result<Vec<Vec<u8>>, PpcError> {
        let mut points = Vec::with_capacity(batch.len());
        for index in 0..batch.len() {
            points.push(self.suite.blind(&batch.to_bytes(index)?, &self.key)?);
        }
        Ok(points)
    }

    pub fn evaluate_batch(&self, points: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, PpcError> {
        self.suite.evaluate_batch(points, &self.key)
    }
}

pub struct EcdhEngine {
    pub cache: EcdhCache,
    crypto: DashMap<String, Arc<EcdhCrypto>>,
    /// Per-task guard so only one blinding pass runs at a time.
    blinding: DashMap<String, Arc<AtomicBool>>,
}

pub type EcdhPsi = PsiFramework<EcdhEngine>;

/// Build the ECDH-PSI engine over the given front and resource loader.
pub fn new_ecdh_psi(
    mut config: PsiConfig,
    front: Arc<dyn Front>,
    loader: Arc<DataResourceLoader>,
) -> Arc<EcdhPsi> {
    config.algorithm = PsiAlgorithm::EcdhPsi2Pc;
    let engine = EcdhEngine {
        cache: EcdhCache::new(config.max_cache_capacity),
        crypto: DashMap::new(),
        blinding: DashMap::new(),
    };
    PsiFramework::new(config, front, loader, engine)
}

impl EcdhEngine {
    pub fn crypto(&self, task_id: &str) -> Option<Arc<EcdhCrypto>> {
        self.crypto.get(task_id).map(|c| Arc::clone(&c))
    }

    fn install_crypto(&self, task_id: &str, suite: EcdhSuite) -> Arc<EcdhCrypto> {
        let crypto = Arc::new(EcdhCrypto::new(suite));
        self.crypto.insert(task_id.to_string(), Arc::clone(&crypto));
        crypto
    }

    fn remove_task(&self, task_id: &str) {
        self.crypto.remove(task_id);
        self.blinding.remove(task_id);
    }
}

#[async_trait]
impl PsiEngine for EcdhEngine {
    async fn handle_message(&self, framework: &PsiFramework<Self>, message: PsiMessage) {
        match message.packet_type {
            packet::ECDH_EVALUATE_REQUEST => handle_evaluate_request(framework, message).await,
            packet::ECDH_EVALUATE_RESPONSE => handle_evaluate_response(framework, message).await,
            packet::ECDH_SERVER_BLINDED_DATA => handle_server_blinded_data(framework, message).await,
            packet::ECDH_SYNC_DATA_BATCH_INFO => handle_sync_data_info(framework, message).await,
            other => {
                warn!(task = %message.task_id, packet = other, "unsupported ecdh packet type");
            }
        }
    }

    fn need_lock_resource(&self, _party_index: u16) -> bool {
        true
    }

    // the server selects the suite and waits for the client's ack before
    // blinding its own data
    async fn on_handshake_request(&self, framework: &PsiFramework<Self>, message: PsiMessage) {
        let Some(state) = framework.task_by_id(&message.task_id) else {
            framework
                .on_task_error(
                    "handshake request",
                    PpcError::TaskNotFound(message.task_id.clone()),
                    &message.from,
                    &message.task_id,
                )
                .await;
            return;
        };
        let PsiBody::HandshakeRequest { curves, hashes } = &message.body else {
            return;
        };
        let (curve, hash) = select_suite(&framework.config, curves, hashes);
        let response = PsiMessage::new(
            packet::HANDSHAKE_RESPONSE,
            PsiBody::HandshakeResponse {
                curve: curve.map(|c| c as i8).unwrap_or(-1),
                hash: hash.map(|h| h as i8).unwrap_or(-1),
                code: 0,
                message: "success".into(),
            },
        );
        let suite = match (curve, hash) {
            (Some(curve), Some(hash)) => match EcdhSuite::new(curve, hash) {
                Ok(suite) => suite,
                Err(e) => {
                    framework
                        .on_task_error("handshake request", e, &message.from, &message.task_id)
                        .await;
                    return;
                }
            },
            _ => {
                let error = PpcError::HandshakeFailed(
                    "no common curve/hash with the client".into(),
                );
                framework
                    .on_task_error("handshake request", error, &message.from, &message.task_id)
                    .await;
                return;
            }
        };
        info!(task = %message.task_id, ?curve, ?hash, "handshake suite selected");
        self.install_crypto(&message.task_id, suite);

        // deliver the response and park on the client's HandshakeSuccess ack
        let framework = framework.arc();
        let from = message.from.clone();
        let task_id = message.task_id.clone();
        tokio::spawn(async move {
            match framework.call_psi(&from, &task_id, 0, response).await {
                Ok(ack) if ack.error_code() == 0 => {
                    debug!(task = %task_id, "handshake acked, server starts blinding");
                    trigger_data_blind(&framework, &state);
                }
                Ok(ack) => {
                    let error =
                        PpcError::HandshakeFailed(format!("client ack failed: {}", ack.error_message()));
                    framework
                        .on_task_error("handshake ack", error, &from, &task_id)
                        .await;
                }
                Err(e) => {
                    framework
                        .on_task_error("handshake response", e, &from, &task_id)
                        .await;
                }
            }
        });
    }

    // the client activates the selected suite, acks, and starts blinding
    async fn on_handshake_response(&self, framework: &PsiFramework<Self>, message: PsiMessage) {
        let Some(state) = framework.task_by_id(&message.task_id) else {
            framework
                .on_task_error(
                    "handshake response",
                    PpcError::TaskNotFound(message.task_id.clone()),
                    &message.from,
                    &message.task_id,
                )
                .await;
            return;
        };
        let PsiBody::HandshakeResponse { curve, hash, .. } = &message.body else {
            return;
        };
        let suite = match (
            veil_types::EccCurve::from_i8(*curve),
            veil_types::HashAlg::from_i8(*hash),
        ) {
            (Some(curve), Some(hash)) => match EcdhSuite::new(curve, hash) {
                Ok(suite) => suite,
                Err(e) => {
                    framework
                        .on_task_error("handshake response", e, &state.peer_id(), &message.task_id)
                        .await;
                    return;
                }
            },
            _ => {
                let error =
                    PpcError::HandshakeFailed("no matching curve/hash selected".into());
                framework
                    .on_task_error("handshake response", error, &state.peer_id(), &message.task_id)
                    .await;
                return;
            }
        };
        info!(task = %message.task_id, curve, hash, "handshake response accepted");
        self.install_crypto(&message.task_id, suite);

        // unblock the server's blinding pipeline
        let ack = PsiMessage::notification(packet::HANDSHAKE_SUCCESS, 0, "success");
        if let Err(e) = framework
            .respond_psi(&message.from, &message.uuid, &message.task_id, 0, ack)
            .await
        {
            warn!(task = %message.task_id, error = %e, "handshake ack failed");
        }

        trigger_data_blind(framework, &state);
        // file inputs re-enter the blinding loop through the worker closure
        // as subtask completions free cache capacity
        if !state.sql_reader() {
            let weak_framework = framework.weak_ref();
            let weak_state = Arc::downgrade(&state);
            state.set_worker(move || {
                if let (Some(framework), Some(state)) =
                    (weak_framework.upgrade(), weak_state.upgrade())
                {
                    trigger_data_blind(&framework, &state);
                }
            });
        }
    }
}

// ── Task admission ────────────────────────────────────────────────────────────

impl PsiFramework<EcdhEngine> {
    pub async fn async_run_task(&self, task: Task, callback: TaskCallback) {
        let task_id = task.id.clone();
        let party_index = task.self_party.party_index;
        if party_index != PARTY_CLIENT && party_index != PARTY_SERVER {
            let error = PpcError::TaskParams(
                "the party index of ecdh-psi must be client(0) or server(1)".into(),
            );
            callback(veil_types::TaskResult::failed(&task_id, &error));
            return;
        }
        let server = party_index == PARTY_SERVER;
        if let Err(error) = self.check_task(&task, 2, false, false, false) {
            warn!(task = %task_id, code = error.code(), msg = %error, "task rejected");
            callback(veil_types::TaskResult::failed(&task_id, &error));
            return;
        }
        let state = self.build_task_state(task, callback);
        let framework = self.weak_ref();
        let finalize_task = task_id.clone();
        state.register_finalize_handler(move || {
            if let Some(framework) = framework.upgrade() {
                framework.engine.cache.erase(&finalize_task);
                framework.engine.remove_task(&finalize_task);
                framework.front.erase_task_info(&finalize_task);
            }
        });
        if self.lock_resource_and_record(Arc::clone(&state)).await.is_err() {
            return;
        }
        let Some(peer) = self.check_and_set_peer(&state, false).await else {
            return;
        };
        if !self.check_self_resource(&state, !server).await {
            return;
        }
        // every subtask completion sweeps the cache and re-arms the worker
        let framework = self.weak_ref();
        state.register_sub_task_finished_handler(move || {
            if let Some(framework) = framework.upgrade() {
                schedule_intersection(&framework);
                framework.wakeup_worker();
            }
        });
        if let Err(e) = self.init_task_state(&state, server).await {
            let error = PpcError::HandleTask(format!("init task error: {e}"));
            self.on_task_error("init task state", error, &peer.id, &task_id)
                .await;
            return;
        }
        info!(task = %task_id, server, "ecdh-psi task admitted");
        self.front.notify_task_info(&task_id);
        if !server {
            self.send_handshake_request(&state).await;
        }
    }

    async fn init_task_state(
        &self,
        state: &Arc<TaskState>,
        server: bool,
    ) -> Result<(), PpcError> {
        let task = state.task();
        if !server {
            self.engine.cache.insert_server_cipher_cache(&task.id);
            let output = state
                .output_desc()
                .ok_or(PpcError::NotSpecifyOutputDataResource)?;
            if !self.config.enable_output_exists {
                self.loader.ensure_output_absent(&output)?;
            }
        } else if task.sync_result_to_peer {
            let output = state.generate_default_output_desc();
            if !self.config.enable_output_exists {
                self.loader.ensure_output_absent(&output)?;
            }
        }
        self.load_task_reader(state).await
    }
}

// ── Blinding pipeline ─────────────────────────────────────────────────────────

/// Kick one blinding pass unless one is already running for the task.
pub(crate) fn trigger_data_blind(framework: &EcdhPsi, state: &Arc<TaskState>) {
    let task_id = state.task().id.clone();
    let guard = framework
        .engine
        .blinding
        .entry(task_id.clone())
        .or_insert_with(|| Arc::new(AtomicBool::new(false)))
        .clone();
    if guard.swap(true, Ordering::SeqCst) {
        return;
    }
    let framework = framework.arc();
    let state = Arc::clone(state);
    tokio::spawn(async move {
        let outcome = blind_data(&framework, &state).await;
        guard.store(false, Ordering::SeqCst);
        if let Err(e) = outcome {
            let error = PpcError::BlindData(format!("ecdh-psi blind data error: {e}"));
            framework
                .on_task_error("blind data", error, &state.peer_id(), &state.task().id)
                .await;
        }
    });
}

/// Stream the local input in batches: hash-to-curve, scalar-multiply, send.
/// Clients stop when the cache budget is full and resume via the worker;
/// the server drains its whole input and then announces the batch total.
async fn blind_data(framework: &EcdhPsi, state: &Arc<TaskState>) -> Result<(), PpcError> {
    let task = state.task();
    let task_id = task.id.clone();
    let server = task.self_party.party_index == PARTY_SERVER;
    let peer = state.peer_id();
    let resource_id = task
        .self_resource()
        .map(|r| r.resource_id.clone())
        .unwrap_or_default();
    let Some(crypto) = framework.engine.crypto(&task_id) else {
        return Err(PpcError::TaskNotReady(task_id));
    };
    let packet_type = if server {
        packet::ECDH_SERVER_BLINDED_DATA
    } else {
        packet::ECDH_EVALUATE_REQUEST
    };
    let server_cache = if server {
        None
    } else {
        Some(framework.engine.cache.insert_server_cipher_cache(&task_id))
    };

    let mut batch_count: u32 = 0;
    loop {
        // the task may have been cancelled under us
        if framework.task_by_id(&task_id).is_none() {
            framework.engine.cache.erase(&task_id);
            return Ok(());
        }
        if !server && framework.engine.cache.is_full() {
            debug!(task = %task_id, capacity = framework.engine.cache.capacity(),
                   "blinding paused: cache is full");
            break;
        }
        if state.load_finished() {
            break;
        }

        // read the next batch and allocate its seq under the reader lock
        let reader_state = Arc::clone(state);
        let read = tokio::task::spawn_blocking(move || -> Result<Option<(u32, DataBatch)>, PpcError> {
            let mut guard = reader_state.reader().lock().unwrap();
            let Some(reader) = guard.as_mut() else {
                return Err(PpcError::LoadDataFailed("task reader is gone".into()));
            };
            match reader.next(reader_state.reader_param(), DataSchema::Bytes)? {
                None => {
                    reader_state.set_finished(true);
                    Ok(None)
                }
                Some(batch) => {
                    let seq = reader_state.allocate_seq();
                    if reader_state.sql_reader() {
                        reader_state.set_finished(true);
                    }
                    Ok(Some((seq, batch)))
                }
            }
        })
        .await
        .map_err(|e| PpcError::OnException(e.to_string()))??;

        let Some((seq, batch)) = read else { break };

        let blind_crypto = Arc::clone(&crypto);
        let blind_batch = batch.clone();
        let points = tokio::task::spawn_blocking(move || blind_crypto.blind_batch(&blind_batch))
            .await
            .map_err(|e| PpcError::OnException(e.to_string()))??;

        let mut message = PsiMessage::data(packet_type, points);
        message.resource_id = resource_id.clone();
        // keep the plaintext so a matching doubly-blinded point at index i
        // maps back to its row
        if let Some(server_cache) = &server_cache {
            framework.engine.cache.insert_sub_task(
                &task_id,
                seq,
                state,
                Arc::clone(server_cache),
                batch,
            );
        }
        info!(task = %task_id, seq, rows = message.data_len(),
              capacity = framework.engine.cache.capacity(), "blinded batch dispatched");
        if let Err(e) = framework.send_psi(&peer, &task_id, seq, message).await {
            warn!(task = %task_id, seq, error = %e, "sending blinded batch failed");
            framework.cancel_task(Some(e), &task_id, false).await;
            return Ok(());
        }
        batch_count += 1;
    }

    if server && state.load_finished() {
        // the client needs the total to know when the server set is complete
        let mut sync = PsiMessage::new(
            packet::ECDH_SYNC_DATA_BATCH_INFO,
            PsiBody::Data {
                data: Vec::new(),
                batch_count,
            },
        );
        sync.resource_id = resource_id;
        info!(task = %task_id, batch_count, "announcing server batch total");
        if let Err(e) = framework.send_psi(&peer, &task_id, 0, sync).await {
            framework.cancel_task(Some(e), &task_id, false).await;
        }
    }
    Ok(())
}

// ── Message handlers ──────────────────────────────────────────────────────────

/// Server: evaluate the client's blinded points with the local scalar.
async fn handle_evaluate_request(framework: &EcdhPsi, mut message: PsiMessage) {
    let Some(crypto) = framework.engine.crypto(&message.task_id) else {
        let error = PpcError::TaskNotReady(message.task_id.clone());
        framework
            .on_task_error("evaluate request", error, &message.from, &message.task_id)
            .await;
        return;
    };
    let points = message.take_data();
    let evaluated = match tokio::task::spawn_blocking(move || crypto.evaluate_batch(&points)).await
    {
        Ok(Ok(evaluated)) => evaluated,
        Ok(Err(e)) => {
            framework
                .on_task_error("evaluate request", e, &message.from, &message.task_id)
                .await;
            return;
        }
        Err(e) => {
            let error = PpcError::OnException(e.to_string());
            framework
                .on_task_error("evaluate request", error, &message.from, &message.task_id)
                .await;
            return;
        }
    };
    let response = PsiMessage::data(packet::ECDH_EVALUATE_RESPONSE, evaluated);
    if let Err(e) = framework
        .send_psi(&message.from, &message.task_id, message.seq, response)
        .await
    {
        framework
            .on_task_error("evaluate response", e, &message.from, &message.task_id)
            .await;
    }
}

/// Client: the doubly-blinded copy of one of our batches arrived.
async fn handle_evaluate_response(framework: &EcdhPsi, mut message: PsiMessage) {
    // no cache entry means blinding for this seq never ran here — most
    // likely a response for a task that was already cancelled
    let Some(sub) = framework.engine.cache.sub_task(&message.task_id, message.seq) else {
        debug!(task = %message.task_id, seq = message.seq, "evaluate response without cache");
        return;
    };
    sub.set_client_cipher(message.take_data());
    schedule_intersection(framework);
}

/// Client: one batch of the server's blinded set arrived; re-blind it with
/// our scalar and fold it into the server cipher set.
async fn handle_server_blinded_data(framework: &EcdhPsi, mut message: PsiMessage) {
    let Some(crypto) = framework.engine.crypto(&message.task_id) else {
        let error = PpcError::TaskNotReady(message.task_id.clone());
        framework
            .on_task_error("server blinded data", error, &message.from, &message.task_id)
            .await;
        return;
    };
    if framework.task_by_id(&message.task_id).is_none() {
        let error = PpcError::TaskNotFound(message.task_id.clone());
        framework
            .on_task_error("server blinded data", error, &message.from, &message.task_id)
            .await;
        return;
    }
    let points = message.take_data();
    let evaluated = match tokio::task::spawn_blocking(move || crypto.evaluate_batch(&points)).await
    {
        Ok(Ok(evaluated)) => evaluated,
        _ => {
            let error = PpcError::BlindData("evaluating server data failed".into());
            framework
                .on_task_error("server blinded data", error, &message.from, &message.task_id)
                .await;
            return;
        }
    };
    let cache = framework
        .engine
        .cache
        .insert_server_cipher_cache(&message.task_id);
    cache.append(message.seq, evaluated);
    schedule_intersection(framework);
}

/// Client: the server announced how many batches make up its full set.
async fn handle_sync_data_info(framework: &EcdhPsi, message: PsiMessage) {
    let Some(cache) = framework.engine.cache.server_cipher_cache(&message.task_id) else {
        let error = PpcError::TaskNotFound(message.task_id.clone());
        framework
            .on_task_error("sync data info", error, &message.from, &message.task_id)
            .await;
        return;
    };
    info!(task = %message.task_id, batches = message.batch_count(), "server set complete");
    cache.set_batch_count(message.batch_count() as i64);
    schedule_intersection(framework);
}

// ── Intersection scheduling ───────────────────────────────────────────────────

/// Sweep the cache and intersect every batch that is ready. Runs after any
/// event that could unblock a batch (evaluate response, server set update,
/// subtask completion).
pub(crate) fn schedule_intersection(framework: &EcdhPsi) {
    let ready = framework.engine.cache.sweep();
    for sub in ready {
        let framework = framework.arc();
        tokio::spawn(async move {
            let loader = Arc::clone(&framework.loader);
            let worker = Arc::clone(&sub);
            let outcome =
                tokio::task::spawn_blocking(move || worker.try_intersect_and_store(&loader)).await;
            match outcome {
                Ok(Ok(Some(rows))) => sync_result_to_peer(&framework, &sub, rows).await,
                Ok(Ok(None)) => {}
                Ok(Err(e)) => sub.task_state().on_task_exception(&e.to_string()),
                Err(e) => sub.task_state().on_task_exception(&e.to_string()),
            }
        });
    }
}

/// Push stored rows to the peer and wait for its ACK before releasing the
/// subtask.
async fn sync_result_to_peer(framework: &EcdhPsi, sub: &Arc<SubTaskCache>, rows: Vec<Vec<u8>>) {
    let peer = sub.task_state().peer_id();
    info!(task = %sub.task_id(), seq = sub.seq(), rows = rows.len(), "syncing result to peer");
    let message = PsiMessage::data(packet::PSI_RESULT_SYNC, rows);
    match framework
        .call_psi(&peer, sub.task_id(), sub.seq(), message)
        .await
    {
        Ok(response) if response.error_code() == 0 => sub.mark_synced(true),
        Ok(response) => {
            warn!(task = %sub.task_id(), code = response.error_code(),
                  msg = %response.error_message(), "peer refused synced result");
            sub.mark_synced(false);
        }
        Err(e) => {
            warn!(task = %sub.task_id(), error = %e, "result sync failed");
            sub.mark_synced(false);
        }
    }
}
