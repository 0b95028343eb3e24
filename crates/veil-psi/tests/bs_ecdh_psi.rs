// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Full browser-assisted ECDH-PSI flow, driven the way the external
//! browser drives a real node: fetch cipher pages, push the doubled pages
//! back, push the partner's pages, poll until COMPLETED.

use std::sync::Arc;
use std::time::Duration;

use veil_io::DataResourceLoader;
use veil_psi::bs_ecdh::{
    BsEcdhCache, BsEcdhPsi, FetchCipherRequest, GetTaskStatusRequest, KillTaskRequest,
    RunTaskRequest, SendEcdhCipherRequest, SendPartnerCipherRequest, TaskStep,
    UpdateTaskStatusRequest,
};
use veil_types::{codes, DataResource, DataResourceDesc, TaskStatus};

const SELF_SIZE: usize = 200;
const PARTNER_SIZE: usize = 150;
const COMMON: usize = 50;

fn self_inputs() -> Vec<String> {
    // row-0 .. row-199
    (0..SELF_SIZE).map(|i| format!("row-{i}")).collect()
}

fn partner_inputs() -> Vec<String> {
    // row-150 .. row-199 (the common block) plus partner-only rows
    let mut rows: Vec<String> = (SELF_SIZE - COMMON..SELF_SIZE)
        .map(|i| format!("row-{i}"))
        .collect();
    rows.extend((0..PARTNER_SIZE - COMMON).map(|i| format!("partner-{i}")));
    rows
}

fn driver_cache() -> Arc<BsEcdhCache> {
    let cache = BsEcdhCache::new(
        "driver",
        Arc::new(DataResourceLoader::new(None, None)),
        DataResource::new("driver"),
        false,
        false,
        0,
        Box::new(|| {}),
        Box::new(|| {}),
        Box::new(|_, _| {}),
    );
    cache.generate_key();
    cache
}

struct Harness {
    engine: Arc<BsEcdhPsi>,
    task_id: String,
    output: String,
}

impl Harness {
    async fn status(&self) -> serde_json::Value {
        let result = self.engine.get_task_status(&GetTaskStatusRequest {
            task_id: self.task_id.clone(),
        });
        assert!(!result.is_err(), "status: {:?}", result.error);
        result.data.expect("status carries data")
    }

    async fn wait_for_status(&self, wanted: &str) -> serde_json::Value {
        for _ in 0..600 {
            let status = self.status().await;
            if status["status"] == wanted {
                return status;
            }
            assert_ne!(
                status["status"], "FAILED",
                "task failed while waiting for {wanted}: {status}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("task never reached {wanted}");
    }
}

async fn start_task(dir: &tempfile::TempDir, task_id: &str, partner_inputs_size: u32) -> Harness {
    let input_path = dir.path().join(format!("{task_id}.csv"));
    let mut content = self_inputs().join("\n");
    content.push('\n');
    std::fs::write(&input_path, content).unwrap();
    let output_path = dir.path().join(format!("{task_id}.out")).display().to_string();

    let mut resource = DataResource::new(format!("res-{task_id}"));
    resource.desc = Some(DataResourceDesc::file(input_path.display().to_string()));
    resource.output_desc = Some(DataResourceDesc::file(&output_path));

    let loader = Arc::new(DataResourceLoader::new(None, None));
    let engine = BsEcdhPsi::new(loader, 60, false);
    engine.start();

    let admitted = engine.async_run_task(RunTaskRequest {
        task_id: task_id.into(),
        data_resource: resource,
        enable_audit: true,
        partner_inputs_size,
    });
    assert!(!admitted.is_err(), "admission: {:?}", admitted.error);

    Harness {
        engine,
        task_id: task_id.into(),
        output: output_path,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_browser_driven_flow() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start_task(&dir, "T_bs", PARTNER_SIZE as u32).await;
    let engine = &harness.engine;
    let task_id = harness.task_id.clone();

    harness.wait_for_status("RUNNING").await;

    let driver = driver_cache();
    let page = 64u32;

    // pull our ciphers page by page and push back the doubled versions;
    // every push is sent twice to prove page replays are harmless
    let mut offset = 0u32;
    let mut total = SELF_SIZE as u32;
    while offset < total {
        let fetched = engine.fetch_cipher(&FetchCipherRequest {
            task_id: task_id.clone(),
            offset,
            size: page,
        });
        assert!(!fetched.is_err(), "fetch: {:?}", fetched.error);
        let data = fetched.data.unwrap();
        total = data["total"].as_u64().unwrap() as u32;
        let ciphers: Vec<String> = data["ciphers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c.as_str().unwrap().to_string())
            .collect();
        let doubled: Vec<String> = ciphers
            .iter()
            .map(|c| driver.gen_ecdh_cipher_b64(c).unwrap())
            .collect();
        let request = SendEcdhCipherRequest {
            task_id: task_id.clone(),
            offset,
            size: doubled.len() as u32,
            ecdh_ciphers: doubled,
        };
        assert!(!engine.send_ecdh_cipher(&request).is_err());
        assert!(!engine.send_ecdh_cipher(&request).is_err());
        offset += ciphers.len() as u32;
    }

    // push the partner's first-round ciphers, also twice per page
    let partner: Vec<String> = partner_inputs()
        .iter()
        .map(|row| driver.gen_cipher_b64(row).unwrap())
        .collect();
    let mut offset = 0usize;
    while offset < partner.len() {
        let end = (offset + page as usize).min(partner.len());
        let request = SendPartnerCipherRequest {
            task_id: task_id.clone(),
            offset: offset as u32,
            size: (end - offset) as u32,
            total: partner.len() as u32,
            partner_ciphers: partner[offset..end].to_vec(),
        };
        assert!(!engine.send_partner_cipher(&request).is_err());
        assert!(!engine.send_partner_cipher(&request).is_err());
        offset = end;
    }

    let done = harness.wait_for_status("COMPLETED").await;
    assert_eq!(done["intersections"].as_u64(), Some(COMMON as u64));
    assert_eq!(done["party0Size"].as_u64(), Some(SELF_SIZE as u64));
    assert_eq!(done["party1Size"].as_u64(), Some(PARTNER_SIZE as u64));
    assert_eq!(done["progress"].as_u64(), Some(100));
    assert_eq!(done["step"].as_u64(), Some(TaskStep::DownloadIndex as u64));

    // result file: exactly the common rows
    let mut result_rows: Vec<String> = std::fs::read_to_string(&harness.output)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    result_rows.sort();
    let mut expected: Vec<String> = (SELF_SIZE - COMMON..SELF_SIZE)
        .map(|i| format!("row-{i}"))
        .collect();
    expected.sort();
    assert_eq!(result_rows, expected);

    // index file: the partner-side indices of the hits (the common block
    // sits at the front of the partner's list)
    let index_rows: Vec<usize> = std::fs::read_to_string(format!("{}.index", harness.output))
        .unwrap()
        .lines()
        .map(|line| line.parse().unwrap())
        .collect();
    assert_eq!(index_rows.len(), COMMON);
    assert!(index_rows.iter().all(|index| *index < COMMON));

    // evidence log: the four sections in order
    let evidence = std::fs::read_to_string(format!("{}.evidence", harness.output)).unwrap();
    let positions: Vec<usize> = ["WB KEY", "WB CIPHERS", "WB ECDH CIPHERS", "PARTNER CIPHERS"]
        .iter()
        .map(|tag| evidence.find(tag).unwrap_or_else(|| panic!("missing {tag}")))
        .collect();
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));

    // once everything is in, further polling is refused
    let refused = engine.fetch_cipher(&FetchCipherRequest {
        task_id: task_id.clone(),
        offset: 0,
        size: 1,
    });
    assert!(refused.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn partner_size_falls_back_to_the_first_page_total() {
    let dir = tempfile::tempdir().unwrap();
    // the run request does not announce the partner size
    let harness = start_task(&dir, "T_compat", 0).await;
    harness.wait_for_status("RUNNING").await;

    let driver = driver_cache();
    let partner: Vec<String> = ["row-199", "nobody"]
        .iter()
        .map(|row| driver.gen_cipher_b64(row).unwrap())
        .collect();
    let sent = harness.engine.send_partner_cipher(&SendPartnerCipherRequest {
        task_id: harness.task_id.clone(),
        offset: 0,
        size: partner.len() as u32,
        total: partner.len() as u32,
        partner_ciphers: partner,
    });
    assert!(!sent.is_err(), "{:?}", sent.error);
    let status = harness.status().await;
    // both partner ciphers were accepted against the fallback size
    assert_eq!(status["status"], "RUNNING");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_resume_and_kill() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start_task(&dir, "T_ctl", 10).await;
    harness.wait_for_status("RUNNING").await;
    let engine = &harness.engine;

    let paused = engine.update_task_status(&UpdateTaskStatusRequest {
        task_id: harness.task_id.clone(),
        status: "PAUSING".into(),
    });
    assert_eq!(paused.data.unwrap()["status"], "PAUSING");

    let resumed = engine.update_task_status(&UpdateTaskStatusRequest {
        task_id: harness.task_id.clone(),
        status: "RUNNING".into(),
    });
    assert_eq!(resumed.data.unwrap()["status"], "RUNNING");

    assert!(!engine
        .kill_task(&KillTaskRequest {
            task_id: harness.task_id.clone(),
        })
        .is_err());
    let status = engine.get_task_status(&GetTaskStatusRequest {
        task_id: harness.task_id.clone(),
    });
    assert_eq!(status.error_code(), codes::TASK_KILLED);
    assert_eq!(status.data.unwrap()["status"], TaskStatus::Failed.as_str());

    // cipher traffic for a killed task is refused
    let refused = engine.fetch_cipher(&FetchCipherRequest {
        task_id: harness.task_id.clone(),
        offset: 0,
        size: 1,
    });
    assert_eq!(refused.error_code(), codes::TASK_IS_NOT_RUNNING);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_task_is_task_not_found() {
    let loader = Arc::new(DataResourceLoader::new(None, None));
    let engine = BsEcdhPsi::new(loader, 60, false);
    let result = engine.fetch_cipher(&FetchCipherRequest {
        task_id: "missing".into(),
        offset: 0,
        size: 1,
    });
    assert_eq!(result.error_code(), codes::TASK_NOT_FOUND);
}
