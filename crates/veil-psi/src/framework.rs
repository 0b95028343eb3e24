// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared engine behavior: admission, resource locking, the worker loop,
//! peer liveness, task-info synchronization, cancellation and result sync.
//!
//! Each engine owns one framework instance and one long-running event-loop
//! task. The loop drives three things per cycle: the per-task worker
//! closures (non-blocking nudges, e.g. "trigger the next blinding batch"),
//! completion detection (input exhausted + outstanding seqs drained), and
//! one inbound message. Interval timers fold the ping and task-sync
//! traffic into the same loop.
//!
//! Lock order is fixed: the pending map before the resource set. Both are
//! only ever held for map surgery, never across awaits.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use veil_channel::{ChannelManager, Front};
use veil_io::{DataResourceLoader, DataSchema};
use veil_protocol::{message_type, packet, PpcMessage, PsiBody, PsiMessage};
use veil_types::{PartyResource, PpcError, Task, TaskResult, PARTY_CLIENT};

use crate::config::PsiConfig;
use crate::task_state::{TaskCallback, TaskState};

/// Engine-specific extension points consumed by the framework loop.
#[async_trait]
pub trait PsiEngine: Send + Sync + Sized + 'static {
    /// Dispatch on packet type, called after the common packets have been
    /// filtered out.
    async fn handle_message(&self, framework: &PsiFramework<Self>, message: PsiMessage);

    /// Whether this party's input resource must be locked for the run.
    fn need_lock_resource(&self, party_index: u16) -> bool;

    /// Crypto-suite negotiation, server side.
    async fn on_handshake_request(&self, framework: &PsiFramework<Self>, message: PsiMessage);

    /// Crypto-suite negotiation, client side.
    async fn on_handshake_response(&self, framework: &PsiFramework<Self>, message: PsiMessage);
}

pub struct PsiFramework<E: PsiEngine> {
    pub config: PsiConfig,
    pub front: Arc<dyn Front>,
    pub loader: Arc<DataResourceLoader>,
    pub channels: ChannelManager,
    pub engine: E,

    pending: RwLock<HashMap<String, Arc<TaskState>>>,
    processing_resources: RwLock<HashSet<String>>,
    /// agency id → the task ids it last reported.
    peer_tasks: RwLock<HashMap<String, HashSet<String>>>,
    wakeup: Notify,
    running: AtomicBool,
    /// Self-reference for hooks and spawned work.
    weak: Weak<PsiFramework<E>>,
}

impl<E: PsiEngine> PsiFramework<E> {
    pub fn new(
        config: PsiConfig,
        front: Arc<dyn Front>,
        loader: Arc<DataResourceLoader>,
        engine: E,
    ) -> Arc<Self> {
        let holding = std::time::Duration::from_secs(config.holding_message_minutes * 60);
        Arc::new_cyclic(|weak| PsiFramework {
            config,
            front,
            loader,
            channels: ChannelManager::new(holding),
            engine,
            pending: RwLock::new(HashMap::new()),
            processing_resources: RwLock::new(HashSet::new()),
            peer_tasks: RwLock::new(HashMap::new()),
            wakeup: Notify::new(),
            running: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    /// A fresh strong handle; valid for as long as `&self` can exist.
    pub fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("framework is referenced")
    }

    pub fn weak_ref(&self) -> Weak<Self> {
        self.weak.clone()
    }

    // ── Worker loop ──────────────────────────────────────────────────────────

    /// Spawn the engine's worker loop over the given inbound frame stream.
    pub fn start(
        &self,
        mut inbox: mpsc::UnboundedReceiver<PpcMessage>,
    ) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let framework = self.arc();
        info!(party = %framework.config.self_party,
              algorithm = ?framework.config.algorithm, "psi framework started");
        tokio::spawn(async move {
            let mut ping = tokio::time::interval(framework.config.ping_interval);
            ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sync = tokio::time::interval(framework.config.task_sync_interval);
            sync.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick of a tokio interval fires immediately
            ping.tick().await;
            sync.tick().await;

            while framework.running.load(Ordering::SeqCst) {
                framework.handle_local_tasks();
                framework.check_and_notify_task_results().await;
                tokio::select! {
                    maybe = inbox.recv() => match maybe {
                        Some(frame) => framework.on_receive_frame(frame).await,
                        None => break,
                    },
                    _ = ping.tick() => framework.check_peer_activity().await,
                    _ = sync.tick() => framework.sync_task_info().await,
                    _ = framework.wakeup.notified() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_millis(5)) => {}
                }
            }
            debug!(party = %framework.config.self_party, "psi framework loop exited");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wakeup.notify_waiters();
    }

    pub fn wakeup_worker(&self) {
        self.wakeup.notify_one();
    }

    /// Nudge every unfinished task's worker closure once.
    fn handle_local_tasks(&self) {
        let states: Vec<Arc<TaskState>> = {
            let pending = self.pending.read().unwrap();
            pending.values().cloned().collect()
        };
        for state in states {
            if !state.completable() {
                state.execute_work();
            }
        }
    }

    /// Complete every task whose input is exhausted and whose outstanding
    /// seq set drained: emit the result, release locks, tell the peer.
    async fn check_and_notify_task_results(&self) {
        let completed: Vec<Arc<TaskState>> = {
            let mut pending = self.pending.write().unwrap();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, state)| state.completable() && !state.is_done())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for state in completed {
            self.release_task_resources(&state);
            let peer = state.peer_id();
            if !peer.is_empty() && !state.only_self_run() {
                // code 0 tells the peer this run finished cleanly
                self.notify_peer_task_result(None, &peer, &state.task().id)
                    .await;
            }
            state.complete();
        }
    }

    // ── Inbound traffic ──────────────────────────────────────────────────────

    async fn on_receive_frame(&self, frame: PpcMessage) {
        match frame.message_type {
            message_type::PING_PEER => {}
            message_type::ERROR_NOTIFICATION => {
                warn!(task = %frame.task_id, from = %frame.sender, "peer reported an error");
                self.cancel_task(Some(PpcError::PeerNotifyFinish), &frame.task_id, false)
                    .await;
            }
            message_type::PSI => {
                match PsiMessage::decode(
                    &frame.data,
                    &frame.task_id,
                    frame.seq,
                    &frame.sender,
                    &frame.uuid,
                ) {
                    Ok(message) => self.handle_psi_message(message).await,
                    Err(e) => {
                        warn!(task = %frame.task_id, error = %e, "dropping undecodable psi message")
                    }
                }
            }
            // engine-specific rendezvous traffic goes through the channel
            _ => self.channels.on_message_arrived(frame),
        }
    }

    async fn handle_psi_message(&self, message: PsiMessage) {
        if !self.check_psi_message(&message).await {
            return;
        }
        match message.packet_type {
            packet::CANCEL_TASK_NOTIFICATION => self.handle_cancel_notification(message).await,
            packet::TASK_SYNC => self.handle_task_sync(message).await,
            packet::HANDSHAKE_REQUEST => {
                self.engine.on_handshake_request(self, message).await;
            }
            packet::HANDSHAKE_RESPONSE => {
                self.engine.on_handshake_response(self, message).await;
            }
            // the ack travels back on the call rendezvous; seeing it here
            // means the responder already gave up on the uuid
            packet::HANDSHAKE_SUCCESS => {}
            packet::PSI_RESULT_SYNC => self.handle_result_sync(message).await,
            packet::PSI_RESULT_SYNC_RESPONSE => {}
            _ => self.engine.handle_message(self, message).await,
        }
    }

    /// Reject engine traffic for unknown tasks, telling the peer to stop.
    async fn check_psi_message(&self, message: &PsiMessage) -> bool {
        if message.packet_type == packet::CANCEL_TASK_NOTIFICATION
            || message.packet_type == packet::TASK_SYNC
        {
            return true;
        }
        if self.task_by_id(&message.task_id).is_some() {
            return true;
        }
        warn!(task = %message.task_id, from = %message.from, packet = message.packet_type,
              "message for a task not in the pending pool");
        let error = PpcError::TaskNotFound(format!(
            "task {} not found in {}",
            message.task_id, self.config.self_party
        ));
        self.notify_peer_task_result(Some(&error), &message.from, &message.task_id)
            .await;
        false
    }

    async fn handle_cancel_notification(&self, message: PsiMessage) {
        let code = message.error_code();
        info!(task = %message.task_id, from = %message.from, code,
              msg = %message.error_message(), "received task notification");
        if code == 0 {
            // the peer finished cleanly; close the local side with success
            self.cancel_task(None, &message.task_id, false).await;
        } else {
            let error = PpcError::from_code(code, message.error_message());
            self.cancel_task(Some(error), &message.task_id, false).await;
        }
    }

    // ── Admission ────────────────────────────────────────────────────────────

    /// Structural task validation shared by all engines.
    pub fn check_task(
        &self,
        task: &Task,
        parties_count: usize,
        mut enforce_self_input: bool,
        mut enforce_self_output: bool,
        enforce_peer_resource: bool,
    ) -> Result<(), PpcError> {
        if self.pending.read().unwrap().contains_key(&task.id) {
            return Err(PpcError::DuplicatedTask(task.id.clone()));
        }
        let self_party = &task.self_party;
        if self_party.party_index == PARTY_CLIENT {
            enforce_self_input = true;
            enforce_self_output = true;
        }
        let Some(resource) = &self_party.data_resource else {
            return Err(PpcError::TaskParams(
                "no data resource specified for self party".into(),
            ));
        };
        if enforce_self_input && resource.raw_data.is_empty() && resource.desc.is_none() {
            return Err(PpcError::TaskParams(
                "no input resource specified for self party".into(),
            ));
        }
        if enforce_self_output && resource.raw_data.is_empty() && resource.output_desc.is_none() {
            return Err(PpcError::TaskParams(
                "no output resource specified for self party".into(),
            ));
        }
        let mut indices = HashSet::new();
        if parties_count > 1 && self_party.party_index as usize >= parties_count {
            return Err(PpcError::TaskParams(format!(
                "invalid partyIndex: {}",
                self_party.party_index
            )));
        }
        indices.insert(self_party.party_index);
        if task.peers.len() != parties_count - 1 {
            return Err(PpcError::TaskParams(format!(
                "expected parties count: {parties_count}, current is {}",
                task.peers.len() + 1
            )));
        }
        for peer in task.peers.values() {
            if parties_count > 1 && peer.party_index as usize >= parties_count {
                return Err(PpcError::TaskParams(format!(
                    "invalid partyIndex: {}",
                    peer.party_index
                )));
            }
            if !indices.insert(peer.party_index) {
                return Err(PpcError::TaskParams(format!(
                    "repeated party index: {}",
                    peer.party_index
                )));
            }
            if enforce_peer_resource && peer.data_resource.is_none() {
                return Err(PpcError::NotSpecifyPeerDataResource);
            }
        }
        Ok(())
    }

    /// Admit a task: install it in the pending map and lock its input
    /// resource. Admission is atomic — on any failure neither map keeps the
    /// task, and the caller's callback has been invoked with the error.
    pub async fn lock_resource_and_record(
        &self,
        state: Arc<TaskState>,
    ) -> Result<(), PpcError> {
        // default subtask hook: let the worker loop re-examine completion
        let framework = self.weak_ref();
        state.register_sub_task_finished_handler(move || {
            if let Some(framework) = framework.upgrade() {
                framework.wakeup_worker();
            }
        });
        let task = state.task().clone();
        {
            let mut pending = self.pending.write().unwrap();
            if pending.contains_key(&task.id) {
                drop(pending);
                let error = PpcError::TaskInProcessing(task.id.clone());
                warn!(task = %task.id, "admission rejected: duplicated task");
                state.finish(TaskResult::failed(&task.id, &error));
                return Err(error);
            }
            pending.insert(task.id.clone(), Arc::clone(&state));
        }
        let party_index = task.self_party.party_index;
        if let Some(resource) = task.self_resource() {
            if self.engine.need_lock_resource(party_index) {
                let occupied = {
                    let mut resources = self.processing_resources.write().unwrap();
                    !resources.insert(resource.resource_id.clone())
                };
                if occupied {
                    // back out the pending entry only — the lock belongs to
                    // the task that is actually processing the resource
                    self.pending.write().unwrap().remove(&task.id);
                    let error = PpcError::DataResourceOccupied(resource.resource_id.clone());
                    warn!(task = %task.id, resource = %resource.resource_id,
                          "admission rejected: resource occupied");
                    state.finish(TaskResult::failed(&task.id, &error));
                    return Err(error);
                }
            }
        }
        self.channels.build_channel_for_task(&task.id);
        Ok(())
    }

    /// Resolve and record the single peer of a two-party task.
    pub async fn check_and_set_peer(
        &self,
        state: &Arc<TaskState>,
        enforce_peer_resource: bool,
    ) -> Option<PartyResource> {
        let task = state.task();
        if task.peers.len() != 1 {
            let error = PpcError::OnlySupportOnePeer(task.peers.len());
            self.cancel_task(Some(error), &task.id, false).await;
            return None;
        }
        let peer = task.peers.values().next().expect("exactly one peer").clone();
        state.set_peer_id(&peer.id);
        if enforce_peer_resource && peer.data_resource.is_none() {
            let error = PpcError::NotSpecifyPeerDataResource;
            self.on_task_error("check peer resource", error, &peer.id, &task.id)
                .await;
            return None;
        }
        Some(peer)
    }

    /// Verify the self party's data resource, failing the task otherwise.
    pub async fn check_self_resource(
        &self,
        state: &Arc<TaskState>,
        require_output: bool,
    ) -> bool {
        let task = state.task();
        let resource = task.self_resource();
        let has_input = resource.is_some_and(|r| r.desc.is_some() || !r.raw_data.is_empty());
        if !has_input {
            self.on_task_error(
                "check self resource",
                PpcError::NotSpecifyInputDataResource,
                &state.peer_id(),
                &task.id,
            )
            .await;
            return false;
        }
        if require_output
            && resource.is_some_and(|r| r.output_desc.is_none() && r.raw_data.is_empty())
        {
            self.on_task_error(
                "check self resource",
                PpcError::NotSpecifyOutputDataResource,
                &state.peer_id(),
                &task.id,
            )
            .await;
            return false;
        }
        true
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    /// Notify the peer, then cancel the local task with the same error.
    pub async fn on_task_error(
        &self,
        context: &str,
        error: PpcError,
        peer: &str,
        task_id: &str,
    ) {
        warn!(task = task_id, peer, code = error.code(), msg = %error, context, "task error");
        self.notify_peer_task_result(Some(&error), peer, task_id)
            .await;
        self.cancel_task(Some(error), task_id, false).await;
    }

    /// Cancel (or, with `error == None`, cleanly close) a task. Idempotent:
    /// canceling an unknown task is a no-op.
    pub async fn cancel_task(
        &self,
        error: Option<PpcError>,
        task_id: &str,
        notice_peer: bool,
    ) {
        let state = {
            let mut pending = self.pending.write().unwrap();
            pending.remove(task_id)
        };
        let Some(state) = state else {
            debug!(task = task_id, "cancel for a task not in the pending pool");
            return;
        };
        info!(task = task_id,
              code = error.as_ref().map(|e| e.code()).unwrap_or(0),
              notice_peer, "cancel task");
        self.release_task_resources(&state);
        if notice_peer && !state.only_self_run() {
            let peer = state.peer_id();
            if !peer.is_empty() {
                self.notify_peer_task_result(error.as_ref(), &peer, task_id)
                    .await;
            }
        }
        let result = match &error {
            Some(error) => TaskResult::failed(task_id, error),
            None => TaskResult::success(task_id),
        };
        state.finish(result);
    }

    fn release_task_resources(&self, state: &Arc<TaskState>) {
        if let Some(resource) = state.task().self_resource() {
            self.processing_resources
                .write()
                .unwrap()
                .remove(&resource.resource_id);
        }
        self.channels.remove_channel_for_task(&state.task().id);
        self.front.erase_task_info(&state.task().id);
    }

    /// Send a `CancelTaskNotification` (code 0 = clean completion).
    async fn notify_peer_task_result(&self, error: Option<&PpcError>, peer: &str, task_id: &str) {
        if peer.is_empty() || task_id.is_empty() {
            return;
        }
        let (code, text) = match error {
            Some(error) => (error.code(), error.to_string()),
            None => (0, "success".to_string()),
        };
        let message = PsiMessage::notification(packet::CANCEL_TASK_NOTIFICATION, code, text);
        if let Err(e) = self.send_psi(peer, task_id, 0, message).await {
            warn!(task = task_id, peer, error = %e, "notify task result failed");
        }
    }

    // ── Peer liveness ────────────────────────────────────────────────────────

    async fn check_peer_activity(&self) {
        let targets: Vec<(String, String)> = {
            let pending = self.pending.read().unwrap();
            pending
                .values()
                .filter(|state| !state.only_self_run())
                .flat_map(|state| {
                    let task_id = state.task().id.clone();
                    state
                        .task()
                        .peers
                        .keys()
                        .map(move |peer| (task_id.clone(), peer.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for (task_id, peer) in targets {
            let frame = self.make_frame(&task_id, 0, message_type::PING_PEER, Vec::new());
            if let Err(e) = self.front.send(&peer, frame).await {
                warn!(task = %task_id, %peer, error = %e, "peer is down");
                let error = PpcError::PeerNodeDown(format!("peer node is down, id: {peer}"));
                self.cancel_task(Some(error), &task_id, false).await;
            }
        }
    }

    // ── Task-info synchronization ────────────────────────────────────────────

    async fn sync_task_info(&self) {
        let mut per_peer: HashMap<String, Vec<String>> = HashMap::new();
        {
            let pending = self.pending.read().unwrap();
            for (id, state) in pending.iter() {
                let peer = state.peer_id();
                if !peer.is_empty() {
                    per_peer.entry(peer).or_default().push(id.clone());
                }
            }
        }
        // idle agencies still get an empty list, so their side can reconcile
        for agency in &self.config.agencies {
            if agency == &self.config.self_party {
                continue;
            }
            per_peer.entry(agency.clone()).or_default();
        }
        for (peer, tasks) in per_peer {
            let message = PsiMessage::new(
                packet::TASK_SYNC,
                PsiBody::TaskList {
                    party: self.config.self_party.clone(),
                    tasks: tasks.clone(),
                    statuses: Vec::new(),
                },
            );
            if let Err(e) = self.send_psi(&peer, "", 0, message).await {
                debug!(%peer, error = %e, "task sync broadcast failed");
                // an unreachable peer strands its tasks: drop the expired ones
                self.cancel_expired_tasks_of(&peer, &HashSet::new()).await;
            }
        }
    }

    async fn handle_task_sync(&self, message: PsiMessage) {
        let PsiBody::TaskList { tasks, .. } = &message.body else {
            return;
        };
        let peer_set: HashSet<String> = tasks.iter().cloned().collect();
        self.peer_tasks
            .write()
            .unwrap()
            .insert(message.from.clone(), peer_set.clone());
        self.cancel_expired_tasks_of(&message.from, &peer_set).await;
    }

    /// Cancel local tasks bound to `peer` that are older than the expiry
    /// threshold AND absent from the peer's reported set.
    async fn cancel_expired_tasks_of(&self, peer: &str, peer_tasks: &HashSet<String>) {
        let expire_ms = self.config.task_expire.as_millis() as u64;
        let expired: Vec<String> = {
            let pending = self.pending.read().unwrap();
            pending
                .iter()
                .filter(|(id, state)| {
                    state.peer_id() == peer
                        && state.pending_ms() > expire_ms
                        && !peer_tasks.contains(*id)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for task_id in expired {
            info!(task = %task_id, peer, "cancel task no longer present at the peer");
            let error =
                PpcError::TaskNotFound(format!("task {task_id} no longer exists in the peer party"));
            self.cancel_task(Some(error), &task_id, true).await;
        }
    }

    // ── Result sync ──────────────────────────────────────────────────────────

    /// Store intersection rows pushed by the authoritative party and ACK.
    async fn handle_result_sync(&self, mut message: PsiMessage) {
        let Some(state) = self.task_by_id(&message.task_id) else {
            let text = format!(
                "sync psi result for task {} failed for task not found",
                message.task_id
            );
            self.respond_result_sync(&message, PpcError::TaskNotFound(message.task_id.clone()).code(), &text)
                .await;
            return;
        };
        let rows = message.take_data();
        info!(task = %message.task_id, rows = rows.len(), "storing synced psi result");
        match state.store_result(&self.loader, &rows) {
            Ok(()) => self.respond_result_sync(&message, 0, "success").await,
            Err(e) => {
                let error = PpcError::SyncPsiResultFailed(e.to_string());
                self.respond_result_sync(&message, error.code(), &error.to_string())
                    .await;
                self.cancel_task(Some(error), &message.task_id, false).await;
            }
        }
    }

    async fn respond_result_sync(&self, request: &PsiMessage, code: i32, text: &str) {
        let response = PsiMessage::notification(packet::PSI_RESULT_SYNC_RESPONSE, code, text);
        let frame = match self.make_psi_frame(&request.task_id, request.seq, response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "encode result sync response failed");
                return;
            }
        };
        if let Err(e) = self.front.respond(&request.from, &request.uuid, frame).await {
            warn!(task = %request.task_id, error = %e, "result sync response failed");
        }
    }

    // ── Handshake ────────────────────────────────────────────────────────────

    /// The client opens the run by announcing its supported suites.
    pub async fn send_handshake_request(&self, state: &Arc<TaskState>) {
        let peer = state.peer_id();
        if peer.is_empty() {
            return;
        }
        let task_id = state.task().id.clone();
        info!(task = %task_id, %peer, "send handshake request");
        let message = PsiMessage::new(
            packet::HANDSHAKE_REQUEST,
            PsiBody::HandshakeRequest {
                curves: self.config.supported_curves.iter().map(|c| *c as i8).collect(),
                hashes: self.config.supported_hashes.iter().map(|h| *h as i8).collect(),
            },
        );
        if let Err(e) = self.send_psi(&peer, &task_id, 0, message).await {
            self.on_task_error("send handshake request", e, &peer, &task_id)
                .await;
        }
    }

    // ── Frame plumbing ───────────────────────────────────────────────────────

    fn make_frame(&self, task_id: &str, seq: u32, kind: u8, data: Vec<u8>) -> PpcMessage {
        PpcMessage {
            version: 1,
            task_type: veil_types::TaskType::Psi as u8,
            algorithm: self.config.algorithm as u8,
            message_type: kind,
            seq,
            task_id: task_id.to_string(),
            sender: self.config.self_party.clone(),
            ..Default::default()
        }
        .with_data(data)
    }

    pub fn make_psi_frame(
        &self,
        task_id: &str,
        seq: u32,
        mut message: PsiMessage,
    ) -> Result<PpcMessage, PpcError> {
        if message.party_id.is_empty() {
            message.party_id = self.config.self_party.clone();
        }
        Ok(self.make_frame(task_id, seq, message_type::PSI, message.encode()?))
    }

    /// Fire-and-forget a PSI envelope.
    pub async fn send_psi(
        &self,
        peer: &str,
        task_id: &str,
        seq: u32,
        message: PsiMessage,
    ) -> Result<(), PpcError> {
        let frame = self.make_psi_frame(task_id, seq, message)?;
        self.front.send(peer, frame).await
    }

    /// Send a PSI envelope and await the peer's uuid-correlated reply.
    pub async fn call_psi(
        &self,
        peer: &str,
        task_id: &str,
        seq: u32,
        message: PsiMessage,
    ) -> Result<PsiMessage, PpcError> {
        let frame = self.make_psi_frame(task_id, seq, message)?;
        let response = self
            .front
            .call(peer, frame, self.config.network_timeout())
            .await?;
        PsiMessage::decode(
            &response.data,
            &response.task_id,
            response.seq,
            &response.sender,
            &response.uuid,
        )
    }

    /// Answer a `call_psi` from the peer.
    pub async fn respond_psi(
        &self,
        peer: &str,
        uuid: &str,
        task_id: &str,
        seq: u32,
        message: PsiMessage,
    ) -> Result<(), PpcError> {
        let frame = self.make_psi_frame(task_id, seq, message)?;
        self.front.respond(peer, uuid, frame).await
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn task_by_id(&self, task_id: &str) -> Option<Arc<TaskState>> {
        self.pending.read().unwrap().get(task_id).cloned()
    }

    pub fn pending_task_count(&self) -> usize {
        self.pending.read().unwrap().len()
    }

    pub fn locking_resource_count(&self) -> usize {
        self.processing_resources.read().unwrap().len()
    }

    /// Build the standard task state for an admission.
    pub fn build_task_state(&self, task: Task, callback: TaskCallback) -> Arc<TaskState> {
        Arc::new(TaskState::new(
            task,
            callback,
            false,
            &self.config.result_dir,
        ))
    }

    /// Load the task's input reader. PSI inputs are single-column.
    pub async fn load_task_reader(
        &self,
        state: &Arc<TaskState>,
    ) -> Result<(), PpcError> {
        let task = state.task();
        let resource = task
            .self_resource()
            .ok_or(PpcError::NotSpecifyInputDataResource)?;
        let desc = resource
            .desc
            .as_ref()
            .ok_or(PpcError::NotSpecifyInputDataResource)?;
        let reader = self.loader.load_reader(desc, DataSchema::Bytes).await?;
        if reader.column_size() != 1 {
            return Err(PpcError::LoadDataFailed(format!(
                "psi input for task {} must be one column, got {}",
                task.id,
                reader.column_size()
            )));
        }
        let reader_param = if reader.is_one_shot() {
            -1
        } else {
            self.config.data_batch_size
        };
        state.set_reader(reader, reader_param);
        Ok(())
    }
}

trait WithData {
    fn with_data(self, data: Vec<u8>) -> Self;
}

impl WithData for PpcMessage {
    fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}
