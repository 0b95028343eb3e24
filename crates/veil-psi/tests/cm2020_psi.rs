// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! CM2020 engine contract: the paired OT rounds rendezvous through the
//! per-task channel and the receiver ends up with the intersection.
//!
//! The OPRF capability here is a transparent stand-in — it hashes inputs
//! directly, which exercises every part of the exchange except the OT math
//! itself.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use veil_channel::MemoryNetwork;
use veil_io::DataResourceLoader;
use veil_psi::cm2020::{new_cm2020_psi, Cm2020Psi, OtOprf};
use veil_psi::PsiConfig;
use veil_types::{
    DataResource, DataResourceDesc, PartyResource, PpcError, PsiAlgorithm, Task, TaskResult,
    PARTY_CLIENT, PARTY_SERVER,
};

/// Transparent OPRF double: both sides hash their inputs with the same
/// function, so common inputs collide exactly as the real OPRF would.
struct PlainHashOprf;

impl OtOprf for PlainHashOprf {
    fn receiver_point_a(&self) -> Result<Vec<u8>, PpcError> {
        Ok(b"point-a".to_vec())
    }

    fn sender_point_b(&self, point_a: &[u8]) -> Result<Vec<u8>, PpcError> {
        if point_a != b"point-a" {
            return Err(PpcError::HandleTask("unexpected point A".into()));
        }
        Ok(b"point-b".to_vec())
    }

    fn receiver_finalize(
        &self,
        _point_b: &[u8],
        inputs: &[Vec<u8>],
    ) -> Result<(Vec<Vec<u8>>, Vec<Vec<u8>>), PpcError> {
        let hashes = inputs.iter().map(|row| Sha256::digest(row).to_vec()).collect();
        Ok((vec![b"matrix".to_vec()], hashes))
    }

    fn sender_finalize(
        &self,
        matrix: &[Vec<u8>],
        inputs: &[Vec<u8>],
    ) -> Result<Vec<Vec<u8>>, PpcError> {
        if matrix.is_empty() {
            return Err(PpcError::HandleTask("missing matrix".into()));
        }
        Ok(inputs.iter().map(|row| Sha256::digest(row).to_vec()).collect())
    }
}

fn node_config(party: &str) -> PsiConfig {
    PsiConfig {
        self_party: party.into(),
        agencies: vec!["alice".into(), "bob".into()],
        task_sync_interval: Duration::from_secs(5),
        ping_interval: Duration::from_secs(60),
        // bounds the channel waits so a broken pairing fails fast
        holding_message_minutes: 1,
        ..Default::default()
    }
}

fn spawn_node(network: &Arc<MemoryNetwork>, party: &str) -> Arc<Cm2020Psi> {
    let (front, inbox) = network.register(party);
    let loader = Arc::new(DataResourceLoader::new(None, None));
    let framework = new_cm2020_psi(node_config(party), front, loader, Arc::new(PlainHashOprf));
    framework.start(inbox);
    framework
}

fn write_lines(dir: &tempfile::TempDir, name: &str, rows: &[&str]) -> String {
    let path = dir.path().join(name);
    let mut content = rows.join("\n");
    content.push('\n');
    std::fs::write(&path, content).unwrap();
    path.display().to_string()
}

fn task(
    task_id: &str,
    self_id: &str,
    index: u16,
    input: &str,
    output: Option<&str>,
    peer_id: &str,
) -> Task {
    let mut resource = DataResource::new(format!("res-{self_id}"));
    resource.desc = Some(DataResourceDesc::file(input));
    resource.output_desc = output.map(DataResourceDesc::file);
    let mut self_party = PartyResource::new(self_id, index);
    self_party.data_resource = Some(resource);
    let mut built = Task::new(task_id, PsiAlgorithm::CmPsi2Pc, self_party);
    built.add_peer(PartyResource::new(peer_id, 1 - index));
    built
}

async fn submit(framework: &Arc<Cm2020Psi>, task: Task) -> oneshot::Receiver<TaskResult> {
    let (tx, rx) = oneshot::channel();
    framework
        .async_run_task(
            task,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .await;
    rx
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receiver_obtains_the_intersection() {
    let dir = tempfile::tempdir().unwrap();
    let receiver_in = write_lines(&dir, "receiver.csv", &["alice", "bob", "carol", "erin"]);
    let sender_in = write_lines(&dir, "sender.csv", &["bob", "dave", "erin"]);
    let receiver_out = dir.path().join("receiver.out").display().to_string();

    let network = MemoryNetwork::new();
    let sender = spawn_node(&network, "bob");
    let receiver = spawn_node(&network, "alice");

    let sender_done = submit(
        &sender,
        task("T_cm", "bob", PARTY_SERVER, &sender_in, None, "alice"),
    )
    .await;
    let receiver_done = submit(
        &receiver,
        task(
            "T_cm",
            "alice",
            PARTY_CLIENT,
            &receiver_in,
            Some(&receiver_out),
            "bob",
        ),
    )
    .await;

    let receiver_result = tokio::time::timeout(Duration::from_secs(30), receiver_done)
        .await
        .expect("receiver must finish")
        .unwrap();
    let sender_result = tokio::time::timeout(Duration::from_secs(30), sender_done)
        .await
        .expect("sender must finish")
        .unwrap();

    assert!(receiver_result.is_success(), "{receiver_result:?}");
    assert!(sender_result.is_success(), "{sender_result:?}");

    let mut rows: Vec<String> = std::fs::read_to_string(&receiver_out)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    rows.sort();
    assert_eq!(rows, ["bob", "erin"]);
    assert_eq!(receiver.pending_task_count(), 0);
    assert_eq!(sender.pending_task_count(), 0);
}
