// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The Labeled-PSI engine shell.
//!
//! Labeled PSI lets the receiver learn, for every common item, the label
//! the sender attached to it. The homomorphic-encryption pipeline (OPRF
//! preprocessing, cuckoo bucketing, powers-dag evaluation) is an opaque
//! capability behind [`LabeledVault`]; this module carries the engine
//! contract: admission through the shared framework, input streaming,
//! the three request/response rounds over the PSI envelope, and the label
//! output through the common writer path.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use veil_channel::Front;
use veil_io::{DataResourceLoader, DataSchema};
use veil_protocol::{packet, PsiMessage};
use veil_types::{PpcError, PsiAlgorithm, Task, TaskResult, PARTY_CLIENT, PARTY_SERVER};

use crate::config::PsiConfig;
use crate::framework::{PsiEngine, PsiFramework};
use crate::task_state::{TaskCallback, TaskState};

/// The opaque OPRF + FHE capability of the labeled protocol.
pub trait LabeledVault: Send + Sync + 'static {
    /// Sender: serialized query parameters (FHE params, bucket layout).
    fn query_params(&self) -> Result<Vec<u8>, PpcError>;
    /// Sender: evaluate the receiver's blinded items (OPRF round).
    fn oprf_evaluate(&self, blinded: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, PpcError>;
    /// Receiver: blind the local items for the OPRF round.
    fn oprf_blind(&self, items: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, PpcError>;
    /// Receiver: build the encrypted query from the evaluated items.
    fn build_query(&self, params: &[u8], evaluated: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, PpcError>;
    /// Sender: answer the encrypted query against its labeled data set.
    fn answer_query(
        &self,
        query: &[Vec<u8>],
        items: &[Vec<u8>],
    ) -> Result<Vec<Vec<u8>>, PpcError>;
    /// Receiver: decrypt the answer into `item -> label` rows.
    fn decrypt_answer(
        &self,
        answer: &[Vec<u8>],
        items: &[Vec<u8>],
    ) -> Result<Vec<Vec<u8>>, PpcError>;
}

pub struct LabeledEngine {
    vault: Arc<dyn LabeledVault>,
}

pub type LabeledPsi = PsiFramework<LabeledEngine>;

pub fn new_labeled_psi(
    mut config: PsiConfig,
    front: Arc<dyn Front>,
    loader: Arc<DataResourceLoader>,
    vault: Arc<dyn LabeledVault>,
) -> Arc<LabeledPsi> {
    config.algorithm = PsiAlgorithm::LabeledPsi2Pc;
    PsiFramework::new(config, front, loader, LabeledEngine { vault })
}

#[async_trait]
impl PsiEngine for LabeledEngine {
    async fn handle_message(&self, framework: &PsiFramework<Self>, message: PsiMessage) {
        let task_id = message.task_id.clone();
        let from = message.from.clone();
        let outcome = match message.packet_type {
            packet::LABELED_PARAMS_REQUEST => sender_send_params(framework, &message).await,
            packet::LABELED_OPRF_REQUEST => sender_answer_oprf(framework, message).await,
            packet::LABELED_QUERY => sender_answer_query(framework, message).await,
            other => {
                warn!(task = %task_id, packet = other, "unsupported labeled-psi packet");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            framework.on_task_error("labeled-psi", e, &from, &task_id).await;
        }
    }

    fn need_lock_resource(&self, party_index: u16) -> bool {
        // only the sender's (server's) labeled data set is an exclusive
        // resource; receivers may query concurrently
        party_index == PARTY_SERVER
    }

    async fn on_handshake_request(&self, _framework: &PsiFramework<Self>, message: PsiMessage) {
        warn!(task = %message.task_id, "unexpected handshake request for labeled-psi");
    }

    async fn on_handshake_response(
        &self,
        _framework: &PsiFramework<Self>,
        message: PsiMessage,
    ) {
        warn!(task = %message.task_id, "unexpected handshake response for labeled-psi");
    }
}

impl PsiFramework<LabeledEngine> {
    pub async fn async_run_task(&self, task: Task, callback: TaskCallback) {
        let task_id = task.id.clone();
        let party_index = task.self_party.party_index;
        if party_index != PARTY_CLIENT && party_index != PARTY_SERVER {
            let error = PpcError::TaskParams(
                "the party index of labeled-psi must be receiver(0) or sender(1)".into(),
            );
            callback(TaskResult::failed(&task_id, &error));
            return;
        }
        if let Err(error) = self.check_task(&task, 2, true, false, false) {
            callback(TaskResult::failed(&task_id, &error));
            return;
        }
        let state = self.build_task_state(task, callback);
        let framework = self.weak_ref();
        let finalize_task = task_id.clone();
        state.register_finalize_handler(move || {
            if let Some(framework) = framework.upgrade() {
                framework.front.erase_task_info(&finalize_task);
            }
        });
        if self.lock_resource_and_record(Arc::clone(&state)).await.is_err() {
            return;
        }
        let Some(peer) = self.check_and_set_peer(&state, false).await else {
            return;
        };
        if !self
            .check_self_resource(&state, party_index == PARTY_CLIENT)
            .await
        {
            return;
        }
        if let Err(e) = self.load_task_reader(&state).await {
            self.on_task_error("init task state", e, &peer.id, &task_id).await;
            return;
        }
        info!(task = %task_id, receiver = party_index == PARTY_CLIENT, "labeled-psi task admitted");
        self.front.notify_task_info(&task_id);

        if party_index == PARTY_CLIENT {
            let framework = self.arc();
            tokio::spawn(async move {
                if let Err(e) = run_receiver(&framework, &state).await {
                    framework
                        .on_task_error("labeled query", e, &state.peer_id(), &state.task().id)
                        .await;
                }
            });
        } else {
            // the sender stays outstanding until the receiver reports clean
            // completion
            let _ = state.allocate_seq();
            state.set_finished(true);
        }
    }
}

fn load_all_inputs(state: &Arc<TaskState>) -> Result<Vec<Vec<u8>>, PpcError> {
    let mut guard = state.reader().lock().unwrap();
    let reader = guard
        .as_mut()
        .ok_or_else(|| PpcError::LoadDataFailed("task reader is gone".into()))?;
    let mut rows = Vec::new();
    while let Some(batch) = reader.next(-1, DataSchema::Bytes)? {
        for index in 0..batch.len() {
            rows.push(batch.to_bytes(index)?);
        }
    }
    Ok(rows)
}

/// Receiver: params → OPRF → encrypted query → labels.
async fn run_receiver(framework: &LabeledPsi, state: &Arc<TaskState>) -> Result<(), PpcError> {
    let task_id = state.task().id.clone();
    let peer = state.peer_id();
    let seq = state.allocate_seq();
    let vault = Arc::clone(&framework.engine.vault);

    let items = load_all_inputs(state)?;
    state.set_finished(true);

    let params = framework
        .call_psi(
            &peer,
            &task_id,
            seq,
            PsiMessage::data(packet::LABELED_PARAMS_REQUEST, Vec::new()),
        )
        .await?;
    let params_blob = params_payload(&params)?;

    let blinded = vault.oprf_blind(&items)?;
    let mut evaluated = framework
        .call_psi(
            &peer,
            &task_id,
            seq,
            PsiMessage::data(packet::LABELED_OPRF_REQUEST, blinded),
        )
        .await?;
    let query = vault.build_query(&params_blob, &evaluated.take_data())?;

    let mut answer = framework
        .call_psi(
            &peer,
            &task_id,
            seq,
            PsiMessage::data(packet::LABELED_QUERY, query),
        )
        .await?;
    let labeled_rows = vault.decrypt_answer(&answer.take_data(), &items)?;

    info!(task = %task_id, rows = labeled_rows.len(), "labeled query complete");
    state.store_result(&framework.loader, &labeled_rows)?;
    state.erase_finished_seq(seq, true);
    Ok(())
}

fn params_payload(message: &PsiMessage) -> Result<Vec<u8>, PpcError> {
    let mut message = message.clone();
    message
        .take_data()
        .into_iter()
        .next()
        .ok_or_else(|| PpcError::HandleTask("empty labeled-psi params".into()))
}

async fn sender_send_params(
    framework: &LabeledPsi,
    message: &PsiMessage,
) -> Result<(), PpcError> {
    let params = framework.engine.vault.query_params()?;
    let response = PsiMessage::data(packet::LABELED_PARAMS_RESPONSE, vec![params]);
    framework
        .respond_psi(&message.from, &message.uuid, &message.task_id, message.seq, response)
        .await
}

async fn sender_answer_oprf(
    framework: &LabeledPsi,
    mut message: PsiMessage,
) -> Result<(), PpcError> {
    let vault = Arc::clone(&framework.engine.vault);
    let blinded = message.take_data();
    let evaluated = tokio::task::spawn_blocking(move || vault.oprf_evaluate(&blinded))
        .await
        .map_err(|e| PpcError::OnException(e.to_string()))??;
    let response = PsiMessage::data(packet::LABELED_OPRF_RESPONSE, evaluated);
    framework
        .respond_psi(&message.from, &message.uuid, &message.task_id, message.seq, response)
        .await
}

async fn sender_answer_query(
    framework: &LabeledPsi,
    mut message: PsiMessage,
) -> Result<(), PpcError> {
    let Some(state) = framework.task_by_id(&message.task_id) else {
        return Err(PpcError::TaskNotFound(message.task_id.clone()));
    };
    let items = load_all_inputs(&state)?;
    let vault = Arc::clone(&framework.engine.vault);
    let query = message.take_data();
    let answer = tokio::task::spawn_blocking(move || vault.answer_query(&query, &items))
        .await
        .map_err(|e| PpcError::OnException(e.to_string()))??;
    let response = PsiMessage::data(packet::LABELED_QUERY_RESPONSE, answer);
    framework
        .respond_psi(&message.from, &message.uuid, &message.task_id, message.seq, response)
        .await
}
