// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The gateway send/receive contract.
//!
//! A `Front` delivers whole `PpcMessage` frames between agencies. Sends are
//! asynchronous and best-effort; `call` adds a uuid-correlated response
//! rendezvous on top (the peer answers with `respond` carrying the same
//! uuid). Everything behind this trait — transport, retries, routing — is a
//! deployment concern and out of scope for the node core.
//!
//! [`MemoryFront`] is the in-process implementation used by tests and by
//! single-process multi-party runs.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;
use veil_protocol::PpcMessage;
use veil_types::PpcError;

#[async_trait]
pub trait Front: Send + Sync {
    /// The agency id this front speaks for.
    fn self_party(&self) -> &str;

    /// Deliver a frame to a peer agency. Resolves once the gateway accepted
    /// the frame; an error means the peer is unreachable.
    async fn send(&self, peer: &str, message: PpcMessage) -> Result<(), PpcError>;

    /// Deliver a frame and await the peer's `respond` for it.
    async fn call(
        &self,
        peer: &str,
        message: PpcMessage,
        timeout: Duration,
    ) -> Result<PpcMessage, PpcError>;

    /// Answer a previously received `call` frame, echoing its uuid.
    async fn respond(&self, peer: &str, uuid: &str, message: PpcMessage)
        -> Result<(), PpcError>;

    /// Register a task id with the gateway for routing. Optional.
    fn notify_task_info(&self, _task_id: &str) {}

    /// Drop a task id from gateway routing. Optional.
    fn erase_task_info(&self, _task_id: &str) {}
}

// ── In-process network ────────────────────────────────────────────────────────

/// Links `MemoryFront`s by agency id inside one process.
pub struct MemoryNetwork {
    fronts: DashMap<String, Arc<MemoryFront>>,
    /// Agencies that accept frames but never deliver them — a peer that is
    /// "up" at the gateway yet silent, for liveness tests.
    blackholes: DashMap<String, ()>,
    weak: Weak<MemoryNetwork>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| MemoryNetwork {
            fronts: DashMap::new(),
            blackholes: DashMap::new(),
            weak: weak.clone(),
        })
    }

    /// Register an agency and return its front plus the inbound frame
    /// stream its engines consume.
    pub fn register(
        &self,
        party: &str,
    ) -> (Arc<MemoryFront>, mpsc::UnboundedReceiver<PpcMessage>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let front = Arc::new(MemoryFront {
            party: party.to_string(),
            network: self.weak.clone(),
            inbox: inbox_tx,
            pending_calls: DashMap::new(),
        });
        self.fronts.insert(party.to_string(), Arc::clone(&front));
        (front, inbox_rx)
    }

    /// Drop an agency from the network: subsequent sends to it fail, which
    /// is how tests simulate a crashed peer.
    pub fn disconnect(&self, party: &str) {
        self.fronts.remove(party);
    }

    /// Make an agency swallow all traffic without erroring.
    pub fn blackhole(&self, party: &str) {
        self.blackholes.insert(party.to_string(), ());
    }

    fn front_of(&self, party: &str) -> Option<Arc<MemoryFront>> {
        self.fronts.get(party).map(|f| Arc::clone(&f))
    }
}

/// In-process front: frames hop directly into the peer's inbox.
pub struct MemoryFront {
    party: String,
    network: Weak<MemoryNetwork>,
    inbox: mpsc::UnboundedSender<PpcMessage>,
    /// uuid → reply slot of an outstanding `call`.
    pending_calls: DashMap<String, oneshot::Sender<PpcMessage>>,
}

impl MemoryFront {
    fn deliver(&self, message: PpcMessage) {
        if !message.uuid.is_empty() {
            if let Some((_, reply)) = self.pending_calls.remove(&message.uuid) {
                let _ = reply.send(message);
                return;
            }
        }
        let _ = self.inbox.send(message);
    }

    fn route(&self, peer: &str, message: PpcMessage) -> Result<(), PpcError> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| PpcError::Network("network is gone".into()))?;
        if network.blackholes.contains_key(peer) {
            return Ok(());
        }
        let Some(front) = network.front_of(peer) else {
            return Err(PpcError::Network(format!("peer {peer} is unreachable")));
        };
        front.deliver(message);
        Ok(())
    }
}

#[async_trait]
impl Front for MemoryFront {
    fn self_party(&self) -> &str {
        &self.party
    }

    async fn send(&self, peer: &str, mut message: PpcMessage) -> Result<(), PpcError> {
        if message.sender.is_empty() {
            message.sender = self.party.clone();
        }
        self.route(peer, message)
    }

    async fn call(
        &self,
        peer: &str,
        mut message: PpcMessage,
        timeout: Duration,
    ) -> Result<PpcMessage, PpcError> {
        let uuid = Uuid::new_v4().to_string();
        message.uuid = uuid.clone();
        if message.sender.is_empty() {
            message.sender = self.party.clone();
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending_calls.insert(uuid.clone(), reply_tx);
        if let Err(e) = self.route(peer, message) {
            self.pending_calls.remove(&uuid);
            return Err(e);
        }
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending_calls.remove(&uuid);
                Err(PpcError::Network("reply channel dropped".into()))
            }
            Err(_) => {
                self.pending_calls.remove(&uuid);
                debug!(peer, "front call timed out");
                Err(PpcError::Timeout)
            }
        }
    }

    async fn respond(
        &self,
        peer: &str,
        uuid: &str,
        mut message: PpcMessage,
    ) -> Result<(), PpcError> {
        message.uuid = uuid.to_string();
        if message.sender.is_empty() {
            message.sender = self.party.clone();
        }
        self.route(peer, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(task_id: &str, seq: u32) -> PpcMessage {
        PpcMessage {
            version: 1,
            seq,
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn send_reaches_peer_inbox() {
        let network = MemoryNetwork::new();
        let (alice, _alice_rx) = network.register("alice");
        let (_bob, mut bob_rx) = network.register("bob");

        alice.send("bob", frame("T1", 3)).await.unwrap();
        let received = bob_rx.recv().await.unwrap();
        assert_eq!(received.seq, 3);
        assert_eq!(received.sender, "alice");
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let network = MemoryNetwork::new();
        let (alice, _rx) = network.register("alice");
        let err = alice.send("nobody", frame("T1", 1)).await.unwrap_err();
        assert!(matches!(err, PpcError::Network(_)));
    }

    #[tokio::test]
    async fn call_rendezvouses_with_respond() {
        let network = MemoryNetwork::new();
        let (alice, _alice_rx) = network.register("alice");
        let (bob, mut bob_rx) = network.register("bob");

        let responder = tokio::spawn(async move {
            let request = bob_rx.recv().await.unwrap();
            assert!(!request.uuid.is_empty());
            let mut response = frame(&request.task_id, request.seq);
            response.data = b"ack".to_vec();
            bob.respond(&request.sender, &request.uuid, response)
                .await
                .unwrap();
        });

        let response = alice
            .call("bob", frame("T1", 9), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.data, b"ack");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_call_times_out() {
        let network = MemoryNetwork::new();
        let (alice, _alice_rx) = network.register("alice");
        let (_bob, _bob_rx) = network.register("bob");
        let err = alice
            .call("bob", frame("T1", 1), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, PpcError::Timeout);
    }

    #[tokio::test]
    async fn disconnect_makes_peer_unreachable() {
        let network = MemoryNetwork::new();
        let (alice, _rx) = network.register("alice");
        let (_bob, _bob_rx) = network.register("bob");
        network.disconnect("bob");
        assert!(alice.send("bob", frame("T1", 1)).await.is_err());
    }
}
