// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cipher cache of one browser-assisted task.
//!
//! The browser pulls this side's first-round ciphers in pages, pushes back
//! the doubly-blinded versions, and separately pushes the partner's
//! first-round ciphers (which this side doubles with its own scalar as they
//! arrive). Completion is tracked per index with bitmaps, so pages may be
//! replayed or arrive out of order. When both sides are complete the cache
//! intersects, writes the result/index files, finishes the evidence log and
//! reports COMPLETED.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{error, info, warn};
use veil_io::{DataBatch, DataResourceLoader};
use veil_types::{DataResource, EccCurve, HashAlg, PpcError, TaskStatus};

use super::io::BsEcdhIo;
use super::messages::{
    BsEcdhResult, FetchCipherRequest, FetchCipherResponse, SendEcdhCipherRequest,
    SendPartnerCipherRequest, TaskStatusResponse, TaskStep,
};
use crate::suite::EcdhSuite;

pub type ReadyHook = Box<dyn Fn() + Send + Sync + 'static>;
pub type FinishHook = Box<dyn Fn(TaskStatus, BsEcdhResult) + Send + Sync + 'static>;

#[derive(Default)]
struct SelfCiphers {
    /// base64 first-round ciphers of the local inputs.
    ciphers: Vec<String>,
    /// base64 doubly-blinded ciphers pushed back by the browser.
    ecdh_ciphers: Vec<String>,
    flags: Vec<bool>,
    received: u32,
}

#[derive(Default)]
struct PartnerCiphers {
    /// raw partner ciphers, kept for the evidence log.
    ciphers: Vec<String>,
    /// partner ciphers doubled with the local scalar.
    ecdh_ciphers: Vec<String>,
    flags: Vec<bool>,
    received: u32,
}

pub struct BsEcdhCache {
    task_id: String,
    data_resource: DataResource,
    enable_audit: bool,
    enable_output_exists: bool,
    loader: Arc<DataResourceLoader>,
    io: Mutex<Option<Arc<BsEcdhIo>>>,

    on_self_ciphers_ready: ReadyHook,
    on_all_ciphers_ready: ReadyHook,
    on_task_finished: FinishHook,

    suite: EcdhSuite,
    key: Mutex<Vec<u8>>,
    origin_inputs: Mutex<Option<DataBatch>>,
    inputs_size: AtomicU32,
    partner_inputs_size: AtomicU32,
    start: Instant,

    self_ciphers: RwLock<SelfCiphers>,
    ecdh_ciphers_map: Mutex<HashMap<String, u32>>,
    self_ready: AtomicBool,
    self_received: AtomicU32,

    partner: RwLock<PartnerCiphers>,
    partner_ready: AtomicBool,
    partner_received: AtomicU32,

    step: AtomicU32,
    self_index: AtomicU32,
    partner_index: AtomicU32,
    progress: AtomicU32,
    all_ready: AtomicBool,
    weak: Weak<BsEcdhCache>,
}

impl BsEcdhCache {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: &str,
        loader: Arc<DataResourceLoader>,
        data_resource: DataResource,
        enable_audit: bool,
        enable_output_exists: bool,
        partner_inputs_size: u32,
        on_self_ciphers_ready: ReadyHook,
        on_all_ciphers_ready: ReadyHook,
        on_task_finished: FinishHook,
    ) -> Arc<Self> {
        info!(task = task_id, partner_inputs_size, "create browser-assisted cipher cache");
        Arc::new_cyclic(|weak| BsEcdhCache {
            task_id: task_id.to_string(),
            data_resource,
            enable_audit,
            enable_output_exists,
            loader,
            io: Mutex::new(None),
            on_self_ciphers_ready,
            on_all_ciphers_ready,
            on_task_finished,
            suite: EcdhSuite::new(EccCurve::Ed25519, HashAlg::Sha512)
                .expect("the ed25519/sha512 suite is always backed"),
            key: Mutex::new(Vec::new()),
            origin_inputs: Mutex::new(None),
            inputs_size: AtomicU32::new(0),
            partner_inputs_size: AtomicU32::new(partner_inputs_size),
            start: Instant::now(),
            self_ciphers: RwLock::new(SelfCiphers::default()),
            ecdh_ciphers_map: Mutex::new(HashMap::new()),
            self_ready: AtomicBool::new(false),
            self_received: AtomicU32::new(0),
            partner: RwLock::new(PartnerCiphers::default()),
            partner_ready: AtomicBool::new(false),
            partner_received: AtomicU32::new(0),
            step: AtomicU32::new(TaskStep::Initializing as u32),
            self_index: AtomicU32::new(0),
            partner_index: AtomicU32::new(0),
            progress: AtomicU32::new(0),
            all_ready: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    /// Load inputs and compute the first-round ciphers in the background.
    pub fn start(&self) {
        let cache = self.arc();
        tokio::spawn(async move {
            if let Err(e) = cache.prepare_cipher().await {
                cache.on_self_exception("prepare cipher", &e);
            }
        });
    }

    pub fn step(&self) -> TaskStep {
        TaskStep::from_u32(self.step.load(Ordering::SeqCst))
    }

    /// The resumption cursor the browser should continue from.
    pub fn index(&self) -> u32 {
        match self.step() {
            TaskStep::ProcessingSelfCiphers => self.self_index.load(Ordering::SeqCst),
            TaskStep::ProcessingPartnerCiphers => self.partner_index.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    pub fn progress(&self) -> u32 {
        self.progress.load(Ordering::SeqCst)
    }

    fn arc(&self) -> Arc<Self> {
        self.weak.upgrade().expect("cache is referenced")
    }

    // ── Key and cipher primitives (public for drivers and tests) ─────────────

    pub fn generate_key(&self) {
        *self.key.lock().unwrap() = self.suite.random_scalar();
    }

    pub fn set_key(&self, key: Vec<u8>) {
        *self.key.lock().unwrap() = key;
    }

    pub fn key(&self) -> Vec<u8> {
        self.key.lock().unwrap().clone()
    }

    /// Hash-to-curve, multiply by the task key, base64.
    pub fn gen_cipher_b64(&self, input: &str) -> Result<String, PpcError> {
        let key = self.key();
        Ok(BASE64.encode(self.suite.blind(input.as_bytes(), &key)?))
    }

    /// Multiply an incoming base64 point by the task key, base64 again.
    pub fn gen_ecdh_cipher_b64(&self, point_b64: &str) -> Result<String, PpcError> {
        let point = BASE64
            .decode(point_b64)
            .map_err(|e| PpcError::BlindData(format!("bad base64 point: {e}")))?;
        let key = self.key();
        Ok(BASE64.encode(self.suite.evaluate(&point, &key)?))
    }

    // ── Startup ──────────────────────────────────────────────────────────────

    async fn prepare_cipher(&self) -> Result<(), PpcError> {
        info!(task = %self.task_id, "start preparing ciphers");
        let io = Arc::new(
            BsEcdhIo::prepare(
                &self.task_id,
                &self.loader,
                &self.data_resource,
                self.enable_audit,
                self.enable_output_exists,
            )
            .await?,
        );

        self.generate_key();
        io.append_evidence("WB KEY", &BASE64.encode(self.key()))?;

        let inputs = io.load_inputs()?;
        if inputs.is_empty() {
            return Err(PpcError::OnException("data is empty".into()));
        }
        let inputs_size = inputs.len() as u32;
        self.inputs_size.store(inputs_size, Ordering::SeqCst);

        let cache = self.arc();
        let ciphers = tokio::task::spawn_blocking(move || -> Result<Vec<String>, PpcError> {
            let mut ciphers = Vec::with_capacity(inputs_size as usize);
            for index in 0..inputs.len() {
                let row = inputs.as_str(index).unwrap_or_default();
                ciphers.push(cache.gen_cipher_b64(row)?);
            }
            let mut origin = cache.origin_inputs.lock().unwrap();
            *origin = Some(inputs);
            Ok(ciphers)
        })
        .await
        .map_err(|e| PpcError::OnException(e.to_string()))??;

        io.append_evidences("WB CIPHERS", &ciphers)?;

        {
            let mut section = self.self_ciphers.write().unwrap();
            section.ecdh_ciphers = vec![String::new(); inputs_size as usize];
            section.flags = vec![false; inputs_size as usize];
            section.received = 0;
            section.ciphers = ciphers;
        }
        *self.io.lock().unwrap() = Some(io);

        self.step
            .store(TaskStep::ProcessingSelfCiphers as u32, Ordering::SeqCst);
        (self.on_self_ciphers_ready)();
        info!(task = %self.task_id, inputs = inputs_size, "ciphers prepared");
        Ok(())
    }

    // ── Browser-facing operations ────────────────────────────────────────────

    /// A window of the first-round ciphers. Idempotent; rejected once every
    /// doubly-blinded cipher has been received.
    pub fn fetch_cipher(&self, request: &FetchCipherRequest) -> BsEcdhResult {
        let section = self.self_ciphers.read().unwrap();
        if self.self_ready.load(Ordering::SeqCst) {
            return BsEcdhResult::with_error(
                &self.task_id,
                &PpcError::OnException("self ciphers have been processed".into()),
            );
        }
        let total = self.inputs_size.load(Ordering::SeqCst);
        let start = request.offset.min(total) as usize;
        let end = request.offset.saturating_add(request.size).min(total) as usize;
        let ciphers: Vec<String> = section.ciphers[start..end].to_vec();
        BsEcdhResult::with_data(
            &self.task_id,
            FetchCipherResponse {
                task_id: self.task_id.clone(),
                offset: request.offset,
                size: ciphers.len() as u32,
                total,
                ciphers,
            },
        )
    }

    /// Accept one page of doubly-blinded self ciphers.
    pub fn on_ecdh_cipher_received(&self, request: &SendEcdhCipherRequest) -> BsEcdhResult {
        let completed = {
            let mut section = self.self_ciphers.write().unwrap();
            if self.self_ready.load(Ordering::SeqCst) {
                return BsEcdhResult::ok(&self.task_id);
            }
            let total = self.inputs_size.load(Ordering::SeqCst);
            let end = request
                .offset
                .saturating_add(request.ecdh_ciphers.len() as u32)
                .min(total)
                .min(section.flags.len() as u32);
            for index in request.offset..end {
                let slot = index as usize;
                if !section.flags[slot] {
                    section.flags[slot] = true;
                    section.received += 1;
                }
                section.ecdh_ciphers[slot] =
                    request.ecdh_ciphers[(index - request.offset) as usize].clone();
            }
            self.self_received.store(section.received, Ordering::SeqCst);
            self.update_progress();
            if request.offset == self.self_index.load(Ordering::SeqCst) {
                self.self_index
                    .store(find_current_index(&section.flags, request.offset), Ordering::SeqCst);
            }
            section.received == total
        };
        if completed && !self.self_ready.swap(true, Ordering::SeqCst) {
            self.step
                .store(TaskStep::ProcessingPartnerCiphers as u32, Ordering::SeqCst);
            self.on_all_self_ecdh_ciphers_ready();
        }
        BsEcdhResult::ok(&self.task_id)
    }

    /// Accept one page of partner first-round ciphers and double them with
    /// the local scalar.
    pub fn on_partner_cipher_received(
        &self,
        request: &SendPartnerCipherRequest,
    ) -> BsEcdhResult {
        let outcome = self.store_partner_page(request);
        match outcome {
            Ok(completed) => {
                if completed && !self.partner_ready.swap(true, Ordering::SeqCst) {
                    self.on_all_partner_ecdh_ciphers_ready();
                }
                BsEcdhResult::ok(&self.task_id)
            }
            Err(e) => {
                warn!(task = %self.task_id, error = %e, "partner cipher page rejected");
                BsEcdhResult::with_error(&self.task_id, &e)
            }
        }
    }

    fn store_partner_page(&self, request: &SendPartnerCipherRequest) -> Result<bool, PpcError> {
        let mut section = self.partner.write().unwrap();
        if self.partner_ready.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if section.ciphers.is_empty() {
            // the run request wins; `total` only fills the gap for older
            // callers that did not announce the partner size up front
            if self.partner_inputs_size.load(Ordering::SeqCst) == 0 {
                self.partner_inputs_size.store(request.total, Ordering::SeqCst);
            }
            let size = self.partner_inputs_size.load(Ordering::SeqCst) as usize;
            if size == 0 {
                return Err(PpcError::InvalidParam(
                    "partner inputs size is unknown".into(),
                ));
            }
            section.ciphers = vec![String::new(); size];
            section.ecdh_ciphers = vec![String::new(); size];
            section.flags = vec![false; size];
        }
        let total = self.partner_inputs_size.load(Ordering::SeqCst);
        let end = request
            .offset
            .saturating_add(request.partner_ciphers.len() as u32)
            .min(total);
        let key = self.key();
        for index in request.offset..end {
            let slot = index as usize;
            let page_slot = (index - request.offset) as usize;
            if !section.flags[slot] {
                section.flags[slot] = true;
                section.received += 1;
            }
            let cipher = &request.partner_ciphers[page_slot];
            section.ciphers[slot] = cipher.clone();
            let point = BASE64
                .decode(cipher)
                .map_err(|e| PpcError::BlindData(format!("bad partner cipher: {e}")))?;
            section.ecdh_ciphers[slot] = BASE64.encode(self.suite.evaluate(&point, &key)?);
        }
        self.partner_received.store(section.received, Ordering::SeqCst);
        self.update_progress();
        if request.offset == self.partner_index.load(Ordering::SeqCst) {
            self.partner_index
                .store(find_current_index(&section.flags, request.offset), Ordering::SeqCst);
        }
        Ok(section.received == total)
    }

    fn update_progress(&self) {
        let total = (self.inputs_size.load(Ordering::SeqCst)
            + self.partner_inputs_size.load(Ordering::SeqCst))
        .max(1) as u64;
        let current = (self.self_received.load(Ordering::SeqCst)
            + self.partner_received.load(Ordering::SeqCst)) as u64;
        let progress = (current * 100 / total) as u32;
        self.progress.store(progress, Ordering::SeqCst);
        if progress % 10 == 0 {
            info!(task = %self.task_id, received = current, progress, "cipher exchange progress");
        }
    }

    // ── Completion ───────────────────────────────────────────────────────────

    fn on_all_self_ecdh_ciphers_ready(&self) {
        info!(task = %self.task_id, "all self ecdh ciphers received");
        let evidence = {
            let mut section = self.self_ciphers.write().unwrap();
            let mut map = self.ecdh_ciphers_map.lock().unwrap();
            map.reserve(section.ecdh_ciphers.len());
            for (index, cipher) in section.ecdh_ciphers.iter().enumerate() {
                map.insert(cipher.clone(), index as u32);
            }
            // the first-round ciphers and bitmap are dead weight now
            section.ciphers = Vec::new();
            section.flags = Vec::new();
            std::mem::take(&mut section.ecdh_ciphers)
        };
        if let Some(io) = self.io_handle() {
            if let Err(e) = io.append_evidences("WB ECDH CIPHERS", &evidence) {
                self.on_self_exception("append ecdh evidence", &e);
                return;
            }
        }
        if self.partner_ready.load(Ordering::SeqCst) {
            self.on_all_ecdh_ciphers_ready();
        }
    }

    fn on_all_partner_ecdh_ciphers_ready(&self) {
        info!(task = %self.task_id, "all partner ciphers received");
        if self.self_ready.load(Ordering::SeqCst) {
            self.on_all_ecdh_ciphers_ready();
        }
    }

    /// Both sides complete: intersect, emit outputs, report COMPLETED.
    fn on_all_ecdh_ciphers_ready(&self) {
        if self.all_ready.swap(true, Ordering::SeqCst) {
            return;
        }
        (self.on_all_ciphers_ready)();
        self.step
            .store(TaskStep::ComputingResults as u32, Ordering::SeqCst);
        if let Err(e) = self.compute_results() {
            self.on_self_exception("compute results", &e);
        }
    }

    fn compute_results(&self) -> Result<(), PpcError> {
        let io = self
            .io_handle()
            .ok_or_else(|| PpcError::OnException("io handler is gone".into()))?;

        let (partner_ecdh, partner_raw) = {
            let mut section = self.partner.write().unwrap();
            section.flags = Vec::new();
            (
                std::mem::take(&mut section.ecdh_ciphers),
                std::mem::take(&mut section.ciphers),
            )
        };
        io.append_evidences("PARTNER CIPHERS", &partner_raw)?;
        let evidence_info = io.upload_evidence()?;

        // walk the partner's ecdh ciphers in order; a map hit at partner
        // index i recovers our plaintext and records i for the partner
        let map = std::mem::take(&mut *self.ecdh_ciphers_map.lock().unwrap());
        let origin = self
            .origin_inputs
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| PpcError::OnException("origin inputs are gone".into()))?;
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        let mut partner_indexes = Vec::new();
        let mut duplicate_hits = 0u32;
        for (partner_index, cipher) in partner_ecdh.iter().enumerate() {
            let Some(self_index) = map.get(cipher) else {
                continue;
            };
            let row = origin
                .as_str(*self_index as usize)
                .unwrap_or_default()
                .to_string();
            if seen.insert(row.clone()) {
                results.push(row);
                partner_indexes.push(partner_index.to_string());
            } else {
                duplicate_hits += 1;
            }
        }

        let result_info = io.save_results(&results)?;
        let index_info = io.save_indexes(&partner_indexes)?;

        let inputs_size = self.inputs_size.load(Ordering::SeqCst);
        let partner_size = self.partner_inputs_size.load(Ordering::SeqCst);
        let time_cost = format!("{}ms", self.start.elapsed().as_millis());
        info!(task = %self.task_id, inputs_size, partner_size,
              intersections = results.len(), duplicate_hits, %time_cost,
              "browser-assisted task done");

        self.step.store(TaskStep::DownloadIndex as u32, Ordering::SeqCst);
        self.progress.store(100, Ordering::SeqCst);

        let mut response = TaskStatusResponse {
            task_id: self.task_id.clone(),
            status: TaskStatus::Completed.as_str().to_string(),
            intersections: results.len() as u64,
            party0_size: inputs_size,
            party1_size: partner_size,
            time_cost,
            step: TaskStep::DownloadIndex as u32,
            progress: 100,
            ..Default::default()
        };
        if let Some(info) = result_info {
            response.result_file_id = info.file_id;
            response.result_file_md5 = info.file_md5;
        }
        if let Some(info) = index_info {
            response.partner_index_file_id = info.file_id;
            response.partner_index_file_md5 = info.file_md5;
        }
        if let Some(info) = evidence_info {
            response.evidence_file_id = info.file_id;
            response.evidence_file_md5 = info.file_md5;
        }
        (self.on_task_finished)(
            TaskStatus::Completed,
            BsEcdhResult::with_data(&self.task_id, response),
        );
        Ok(())
    }

    fn io_handle(&self) -> Option<Arc<BsEcdhIo>> {
        self.io.lock().unwrap().clone()
    }

    fn on_self_exception(&self, context: &str, error: &PpcError) {
        error!(task = %self.task_id, context, %error, "browser-assisted task failed");
        let failure = PpcError::OnException(format!("task failed: {error}"));
        (self.on_task_finished)(
            TaskStatus::Failed,
            BsEcdhResult::failed_status(&self.task_id, &failure),
        );
    }

    pub fn clean(&self) {
        if let Some(io) = self.io_handle() {
            io.clean();
        }
    }
}

/// Advance a resumption cursor past the contiguous received prefix that
/// follows `offset`.
fn find_current_index(flags: &[bool], offset: u32) -> u32 {
    let mut index = offset as usize + 1;
    while index < flags.len() && flags[index] {
        index += 1;
    }
    index as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_skips_received_prefix() {
        let flags = [true, true, false, true];
        assert_eq!(find_current_index(&flags, 0), 2);
        assert_eq!(find_current_index(&flags, 2), 4);
        // never reads past the end
        assert_eq!(find_current_index(&flags, 3), 4);
    }

    fn bare_cache() -> Arc<BsEcdhCache> {
        BsEcdhCache::new(
            "T_1",
            Arc::new(DataResourceLoader::new(None, None)),
            DataResource::new("res"),
            false,
            false,
            100,
            Box::new(|| {}),
            Box::new(|| {}),
            Box::new(|_, _| {}),
        )
    }

    #[test]
    fn ecdh_ciphers_commute_across_two_caches() {
        let cache0 = bare_cache();
        let cache1 = bare_cache();
        cache0.generate_key();
        cache1.generate_key();
        for input in ["alice", "bob", "0"] {
            let cipher0 = cache0.gen_cipher_b64(input).unwrap();
            let cipher1 = cache1.gen_cipher_b64(input).unwrap();
            let double01 = cache1.gen_ecdh_cipher_b64(&cipher0).unwrap();
            let double10 = cache0.gen_ecdh_cipher_b64(&cipher1).unwrap();
            assert_eq!(double01, double10);
        }
    }

    #[test]
    fn keys_can_be_pinned_for_reproducibility() {
        let cache = bare_cache();
        let key = cache.key();
        assert!(key.is_empty());
        cache.set_key(vec![7u8; 32]);
        let a = cache.gen_cipher_b64("hello world").unwrap();
        let b = cache.gen_cipher_b64("hello world").unwrap();
        assert_eq!(a, b);
    }
}
