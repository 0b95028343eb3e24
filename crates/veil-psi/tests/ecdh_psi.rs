// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end ECDH-PSI runs between two in-process nodes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use veil_channel::MemoryNetwork;
use veil_io::DataResourceLoader;
use veil_psi::ecdh::{new_ecdh_psi, EcdhPsi};
use veil_psi::PsiConfig;
use veil_types::{
    codes, DataResource, DataResourceDesc, PartyResource, PsiAlgorithm, Task, TaskResult,
    TaskStatus, PARTY_CLIENT, PARTY_SERVER,
};

fn write_lines(dir: &tempfile::TempDir, name: &str, rows: &[&str]) -> String {
    let path = dir.path().join(name);
    let mut content = rows.join("\n");
    content.push('\n');
    std::fs::write(&path, content).unwrap();
    path.display().to_string()
}

fn node_config(party: &str) -> PsiConfig {
    PsiConfig {
        self_party: party.into(),
        agencies: vec!["alice".into(), "bob".into()],
        task_sync_interval: Duration::from_millis(100),
        ping_interval: Duration::from_secs(60),
        task_expire: Duration::from_millis(300),
        ..Default::default()
    }
}

struct TestNode {
    framework: Arc<EcdhPsi>,
    _worker: tokio::task::JoinHandle<()>,
}

fn spawn_node(network: &Arc<MemoryNetwork>, party: &str) -> TestNode {
    let (front, inbox) = network.register(party);
    let loader = Arc::new(DataResourceLoader::new(None, None));
    let framework = new_ecdh_psi(node_config(party), front, loader);
    let worker = framework.start(inbox);
    TestNode {
        framework,
        _worker: worker,
    }
}

fn resource(id: &str, input: &str, output: Option<&str>) -> DataResource {
    let mut resource = DataResource::new(id);
    resource.desc = Some(DataResourceDesc::file(input));
    resource.output_desc = output.map(DataResourceDesc::file);
    resource
}

fn two_party_task(
    task_id: &str,
    self_id: &str,
    self_index: u16,
    self_resource: DataResource,
    peer_id: &str,
    sync_result: bool,
) -> Task {
    let mut self_party = PartyResource::new(self_id, self_index);
    self_party.data_resource = Some(self_resource);
    let mut task = Task::new(task_id, PsiAlgorithm::EcdhPsi2Pc, self_party);
    let mut peer = PartyResource::new(peer_id, 1 - self_index);
    peer.data_resource = Some(DataResource::new(format!("res-{peer_id}")));
    task.add_peer(peer);
    task.sync_result_to_peer = sync_result;
    task
}

async fn run_task(node: &TestNode, task: Task) -> oneshot::Receiver<TaskResult> {
    let (tx, rx) = oneshot::channel();
    node.framework
        .async_run_task(
            task,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )
        .await;
    rx
}

fn read_sorted_lines(path: &str) -> Vec<String> {
    let mut rows: Vec<String> = std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect();
    rows.sort();
    rows
}

// the client input {alice, bob, carol} against the server input
// {bob, carol, dave}: the client ends up with {bob, carol}, the server with
// nothing unless result sync is on
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_party_intersection() {
    let dir = tempfile::tempdir().unwrap();
    let client_in = write_lines(&dir, "client.csv", &["alice", "bob", "carol"]);
    let server_in = write_lines(&dir, "server.csv", &["bob", "carol", "dave"]);
    let client_out = dir.path().join("client.out").display().to_string();

    let network = MemoryNetwork::new();
    let server = spawn_node(&network, "bob");
    let client = spawn_node(&network, "alice");

    // the server must be listening before the client opens the handshake
    let server_done = run_task(
        &server,
        two_party_task(
            "T_psi",
            "bob",
            PARTY_SERVER,
            resource("res-server", &server_in, None),
            "alice",
            false,
        ),
    )
    .await;
    let client_done = run_task(
        &client,
        two_party_task(
            "T_psi",
            "alice",
            PARTY_CLIENT,
            resource("res-client", &client_in, Some(&client_out)),
            "bob",
            false,
        ),
    )
    .await;

    let client_result = tokio::time::timeout(Duration::from_secs(30), client_done)
        .await
        .expect("client must finish")
        .unwrap();
    let server_result = tokio::time::timeout(Duration::from_secs(30), server_done)
        .await
        .expect("server must finish")
        .unwrap();

    assert!(client_result.is_success(), "client: {client_result:?}");
    assert!(server_result.is_success(), "server: {server_result:?}");
    assert_eq!(client_result.status, Some(TaskStatus::Completed));
    assert_eq!(read_sorted_lines(&client_out), ["bob", "carol"]);
    // both nodes cleaned up their admission state
    assert_eq!(client.framework.pending_task_count(), 0);
    assert_eq!(server.framework.pending_task_count(), 0);
    assert_eq!(client.framework.locking_resource_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn intersection_is_synced_to_the_server() {
    let dir = tempfile::tempdir().unwrap();
    let client_in = write_lines(&dir, "client.csv", &["alice", "bob", "carol"]);
    let server_in = write_lines(&dir, "server.csv", &["bob", "carol", "dave"]);
    let client_out = dir.path().join("client.out").display().to_string();
    let server_out = dir.path().join("server.out").display().to_string();

    let network = MemoryNetwork::new();
    let server = spawn_node(&network, "bob");
    let client = spawn_node(&network, "alice");

    let mut server_resource = resource("res-server", &server_in, Some(&server_out));
    server_resource.resource_id = "res-server".into();
    let server_done = run_task(
        &server,
        two_party_task("T_sync", "bob", PARTY_SERVER, server_resource, "alice", true),
    )
    .await;
    let client_done = run_task(
        &client,
        two_party_task(
            "T_sync",
            "alice",
            PARTY_CLIENT,
            resource("res-client", &client_in, Some(&client_out)),
            "bob",
            true,
        ),
    )
    .await;

    let client_result = tokio::time::timeout(Duration::from_secs(30), client_done)
        .await
        .expect("client must finish")
        .unwrap();
    let server_result = tokio::time::timeout(Duration::from_secs(30), server_done)
        .await
        .expect("server must finish")
        .unwrap();

    assert!(client_result.is_success(), "client: {client_result:?}");
    assert!(server_result.is_success(), "server: {server_result:?}");
    assert_eq!(server_result.status, Some(TaskStatus::Completed));
    // the server stored the same rows the client kept
    assert_eq!(read_sorted_lines(&client_out), ["bob", "carol"]);
    assert_eq!(read_sorted_lines(&server_out), ["bob", "carol"]);
}

// a peer that is reachable at the gateway but silent: the task-sync tick
// eventually observes the task absent from every peer list and cancels it
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_peer_expires_pending_task() {
    let dir = tempfile::tempdir().unwrap();
    let server_in = write_lines(&dir, "server.csv", &["bob", "carol"]);

    let network = MemoryNetwork::new();
    let node = spawn_node(&network, "alice");
    // "bob" never joins the network at all
    let done = run_task(
        &node,
        two_party_task(
            "T_gone",
            "alice",
            PARTY_SERVER,
            resource("res-a", &server_in, None),
            "bob",
            false,
        ),
    )
    .await;

    let result = tokio::time::timeout(Duration::from_secs(10), done)
        .await
        .expect("task must be cancelled")
        .unwrap();
    assert!(!result.is_success());
    assert_eq!(result.error.as_ref().unwrap().0, codes::TASK_NOT_FOUND);
    assert_eq!(node.framework.pending_task_count(), 0);
    assert_eq!(node.framework.locking_resource_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicated_task_and_occupied_resource_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_lines(&dir, "in.csv", &["x"]);

    let network = MemoryNetwork::new();
    // a silent but "up" peer keeps the first task pending
    network.blackhole("bob");
    let node = spawn_node(&network, "alice");

    let first = run_task(
        &node,
        two_party_task(
            "T_dup",
            "alice",
            PARTY_SERVER,
            resource("res-shared", &input, None),
            "bob",
            false,
        ),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node.framework.pending_task_count(), 1);
    assert_eq!(node.framework.locking_resource_count(), 1);

    // same task id again
    let duplicate = run_task(
        &node,
        two_party_task(
            "T_dup",
            "alice",
            PARTY_SERVER,
            resource("res-other", &input, None),
            "bob",
            false,
        ),
    )
    .await;
    let result = duplicate.await.unwrap();
    assert_eq!(result.error.as_ref().unwrap().0, codes::DUPLICATED_TASK);

    // different task id, same input resource
    let occupied = run_task(
        &node,
        two_party_task(
            "T_other",
            "alice",
            PARTY_SERVER,
            resource("res-shared", &input, None),
            "bob",
            false,
        ),
    )
    .await;
    let result = occupied.await.unwrap();
    assert_eq!(
        result.error.as_ref().unwrap().0,
        codes::DATA_RESOURCE_OCCUPIED
    );
    // the admission failures left the first task untouched
    assert_eq!(node.framework.pending_task_count(), 1);
    assert_eq!(node.framework.locking_resource_count(), 1);
    drop(first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_party_index_is_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_lines(&dir, "in.csv", &["x"]);
    let network = MemoryNetwork::new();
    let node = spawn_node(&network, "alice");

    let mut self_party = PartyResource::new("alice", 7);
    self_party.data_resource = Some(resource("res-a", &input, None));
    let task = Task::new("T_bad", PsiAlgorithm::EcdhPsi2Pc, self_party);
    let done = run_task(&node, task).await;
    let result = done.await.unwrap();
    assert_eq!(result.error.as_ref().unwrap().0, codes::TASK_PARAMS_ERROR);
    assert_eq!(node.framework.pending_task_count(), 0);
}
