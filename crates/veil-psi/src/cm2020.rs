// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The CM2020-PSI engine shell.
//!
//! CM2020 derives OPRF outputs through an OT exchange: the receiver opens
//! with point A, the sender answers with point B, the receiver uploads its
//! correction matrix and the sender streams back the hashes of its own
//! OPRF outputs. The OT/OPRF math itself (base OTs, matrix correction,
//! bucket hashing) is an opaque capability behind [`OtOprf`]; this module
//! carries the engine contract — admission through the shared framework,
//! batched input streaming, channel rendezvous for the paired messages,
//! result writing and the result-sync path.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use veil_channel::Front;
use veil_io::{DataResourceLoader, DataSchema};
use veil_protocol::{packet, PpcMessage, PsiMessage};
use veil_types::{PpcError, PsiAlgorithm, Task, TaskResult, PARTY_CLIENT, PARTY_SERVER};

use crate::config::PsiConfig;
use crate::framework::{PsiEngine, PsiFramework};
use crate::task_state::{TaskCallback, TaskState};

/// Outer-frame message types used for the paired OT rounds. These travel
/// through the per-task channel, not the PSI envelope dispatcher.
pub mod ot_message {
    pub const POINT_A: u8 = 0x10;
    pub const POINT_B: u8 = 0x11;
    pub const MATRIX: u8 = 0x12;
    pub const HASHES: u8 = 0x13;
}

/// The opaque OT-based OPRF capability.
pub trait OtOprf: Send + Sync + 'static {
    /// Receiver: the opening point of the base-OT exchange.
    fn receiver_point_a(&self) -> Result<Vec<u8>, PpcError>;
    /// Sender: answer point B for the receiver's point A.
    fn sender_point_b(&self, point_a: &[u8]) -> Result<Vec<u8>, PpcError>;
    /// Receiver: derive the correction matrix and the local OPRF hashes.
    fn receiver_finalize(
        &self,
        point_b: &[u8],
        inputs: &[Vec<u8>],
    ) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>), PpcError>;
    /// Sender: derive the OPRF hashes of its own inputs from the matrix.
    fn sender_finalize(
        &self,
        matrix: &[Vec<u8>],
        inputs: &[Vec<u8>],
    ) -> Result<Vec<Vec<u8>>, PpcError>;
}

pub struct Cm2020Engine {
    oprf: Arc<dyn OtOprf>,
}

pub type Cm2020Psi = PsiFramework<Cm2020Engine>;

pub fn new_cm2020_psi(
    mut config: PsiConfig,
    front: Arc<dyn Front>,
    loader: Arc<DataResourceLoader>,
    oprf: Arc<dyn OtOprf>,
) -> Arc<Cm2020Psi> {
    config.algorithm = PsiAlgorithm::CmPsi2Pc;
    PsiFramework::new(config, front, loader, Cm2020Engine { oprf })
}

#[async_trait]
impl PsiEngine for Cm2020Engine {
    async fn handle_message(&self, _framework: &PsiFramework<Self>, message: PsiMessage) {
        // all paired traffic rendezvouses via the channel; envelope packets
        // beyond the framework set are unexpected here
        warn!(task = %message.task_id, packet = message.packet_type,
              "unsupported cm2020 packet type");
    }

    fn need_lock_resource(&self, _party_index: u16) -> bool {
        true
    }

    async fn on_handshake_request(&self, _framework: &PsiFramework<Self>, message: PsiMessage) {
        // CM2020 has no crypto-suite negotiation; parameters ride in the
        // task params
        warn!(task = %message.task_id, "unexpected handshake request for cm2020");
    }

    async fn on_handshake_response(
        &self,
        _framework: &PsiFramework<Self>,
        message: PsiMessage,
    ) {
        warn!(task = %message.task_id, "unexpected handshake response for cm2020");
    }
}

impl PsiFramework<Cm2020Engine> {
    pub async fn async_run_task(&self, task: Task, callback: TaskCallback) {
        let task_id = task.id.clone();
        let party_index = task.self_party.party_index;
        if party_index != PARTY_CLIENT && party_index != PARTY_SERVER {
            let error = PpcError::TaskParams(
                "the party index of cm2020-psi must be receiver(0) or sender(1)".into(),
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
        info!(task = %task_id, receiver = party_index == PARTY_CLIENT, "cm2020-psi task admitted");
        self.front.notify_task_info(&task_id);

        let framework = self.arc();
        tokio::spawn(async move {
            let outcome = if party_index == PARTY_CLIENT {
                run_receiver(&framework, &state).await
            } else {
                run_sender(&framework, &state).await
            };
            if let Err(e) = outcome {
                framework
                    .on_task_error("cm2020 exchange", e, &state.peer_id(), &state.task().id)
                    .await;
            }
        });
    }
}

fn ot_frame(framework: &Cm2020Psi, state: &TaskState, kind: u8, seq: u32, data: Vec<u8>) -> PpcMessage {
    PpcMessage {
        version: 1,
        task_type: veil_types::TaskType::Psi as u8,
        algorithm: framework.config.algorithm as u8,
        message_type: kind,
        seq,
        task_id: state.task().id.clone(),
        sender: framework.config.self_party.clone(),
        data,
        ..Default::default()
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
    state.set_finished(true);
    Ok(rows)
}

/// Receiver (party 0): open the OT, upload the matrix, intersect against
/// the sender's OPRF hashes and keep the plaintext hits.
async fn run_receiver(framework: &Cm2020Psi, state: &Arc<TaskState>) -> Result<(), PpcError> {
    let task_id = state.task().id.clone();
    let peer = state.peer_id();
    let seq = state.allocate_seq();
    let channel = framework
        .channels
        .channel_for_task(&task_id)
        .ok_or_else(|| PpcError::TaskNotFound(task_id.clone()))?;

    let inputs = load_all_inputs(state)?;
    let point_a = framework.engine.oprf.receiver_point_a()?;
    framework
        .front
        .send(&peer, ot_frame(framework, state, ot_message::POINT_A, seq, point_a))
        .await?;

    let point_b = channel.receive(ot_message::POINT_B, seq, 0).await?;
    let oprf = Arc::clone(&framework.engine.oprf);
    let finalize_inputs = inputs.clone();
    let (matrix, own_hashes) = tokio::task::spawn_blocking(move || {
        oprf.receiver_finalize(&point_b.data, &finalize_inputs)
    })
    .await
    .map_err(|e| PpcError::OnException(e.to_string()))??;

    framework
        .front
        .send(
            &peer,
            ot_frame(framework, state, ot_message::MATRIX, seq, join_rows(&matrix)),
        )
        .await?;

    let hashes_frame = channel.receive(ot_message::HASHES, seq, 0).await?;
    let sender_hashes: std::collections::HashSet<Vec<u8>> =
        split_rows(&hashes_frame.data).into_iter().collect();

    let mut intersection = Vec::new();
    for (index, hash) in own_hashes.iter().enumerate() {
        if sender_hashes.contains(hash) {
            intersection.push(inputs[index].clone());
        }
    }
    info!(task = %task_id, intersections = intersection.len(), "cm2020 intersection complete");
    state.store_result(&framework.loader, &intersection)?;

    if state.task().sync_result_to_peer {
        let message = PsiMessage::data(packet::PSI_RESULT_SYNC, intersection);
        let response = framework.call_psi(&peer, &task_id, seq, message).await?;
        if response.error_code() != 0 {
            state.erase_finished_seq(seq, false);
            return Err(PpcError::SyncPsiResultFailed(
                response.error_message().to_string(),
            ));
        }
    }
    state.erase_finished_seq(seq, true);
    Ok(())
}

/// Sender (party 1): answer the OT rounds and stream back the hashes of
/// the local OPRF outputs.
async fn run_sender(framework: &Cm2020Psi, state: &Arc<TaskState>) -> Result<(), PpcError> {
    let task_id = state.task().id.clone();
    let peer = state.peer_id();
    let seq = state.allocate_seq();
    let channel = framework
        .channels
        .channel_for_task(&task_id)
        .ok_or_else(|| PpcError::TaskNotFound(task_id.clone()))?;

    let point_a = channel.receive(ot_message::POINT_A, seq, 0).await?;
    let point_b = framework.engine.oprf.sender_point_b(&point_a.data)?;
    framework
        .front
        .send(&peer, ot_frame(framework, state, ot_message::POINT_B, seq, point_b))
        .await?;

    let matrix_frame = channel.receive(ot_message::MATRIX, seq, 0).await?;
    let inputs = load_all_inputs(state)?;
    let oprf = Arc::clone(&framework.engine.oprf);
    let matrix = split_rows(&matrix_frame.data);
    let hashes =
        tokio::task::spawn_blocking(move || oprf.sender_finalize(&matrix, &inputs))
            .await
            .map_err(|e| PpcError::OnException(e.to_string()))??;

    framework
        .front
        .send(
            &peer,
            ot_frame(framework, state, ot_message::HASHES, seq, join_rows(&hashes)),
        )
        .await?;
    // the seq stays outstanding: the sender's run closes when the receiver
    // reports clean completion, never before the intersection is stored
    Ok(())
}

// rows on the OT frames are length-prefixed (u32 big-endian) byte strings

fn join_rows(rows: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for row in rows {
        out.extend_from_slice(&(row.len() as u32).to_be_bytes());
        out.extend_from_slice(row);
    }
    out
}

fn split_rows(data: &[u8]) -> Vec<Vec<u8>> {
    let mut rows = Vec::new();
    let mut cursor = 0usize;
    while cursor + 4 <= data.len() {
        let len = u32::from_be_bytes([
            data[cursor],
            data[cursor + 1],
            data[cursor + 2],
            data[cursor + 3],
        ]) as usize;
        cursor += 4;
        if cursor + len > data.len() {
            break;
        }
        rows.push(data[cursor..cursor + len].to_vec());
        cursor += len;
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_framing_roundtrip() {
        let rows = vec![b"alpha".to_vec(), Vec::new(), vec![0u8; 64]];
        assert_eq!(split_rows(&join_rows(&rows)), rows);
    }

    #[test]
    fn truncated_row_framing_is_dropped() {
        let mut joined = join_rows(&[b"alpha".to_vec()]);
        joined.truncate(joined.len() - 1);
        assert!(split_rows(&joined).is_empty());
    }
}
