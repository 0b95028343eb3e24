// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-task message rendezvous.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;
use veil_protocol::PpcMessage;
use veil_types::PpcError;

/// Receives exactly one message or one timeout error, never both.
pub type MessageHandler = Box<dyn FnOnce(Result<PpcMessage, PpcError>) + Send + 'static>;

enum Entry {
    /// A receiver parked on a deadline timer.
    Waiting {
        handler: MessageHandler,
        timer: tokio::task::JoinHandle<()>,
    },
    /// A message that arrived before anyone asked for it.
    Ready(PpcMessage),
}

/// One task's inbox: for each `(messageType, seq)` key either a pending
/// receiver with a deadline, or an already-arrived message — never both.
pub struct TaskChannel {
    entries: Arc<Mutex<HashMap<u64, Entry>>>,
    /// Applied when a receiver passes a zero timeout.
    default_timeout: Duration,
}

fn message_key(message_type: u8, seq: u32) -> u64 {
    ((message_type as u64) << 32) | seq as u64
}

impl TaskChannel {
    pub fn new(default_timeout: Duration) -> Self {
        TaskChannel {
            entries: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        }
    }

    /// Register a receiver for `(message_type, seq)`.
    ///
    /// If the message already arrived, the handler fires immediately with
    /// it. Otherwise the handler is parked; on arrival the timer is
    /// cancelled and the handler fires with the message, on expiry it fires
    /// with `Timeout`. A handler never fires twice. `timeout_secs == 0`
    /// selects the channel's default timeout.
    pub fn async_receive(
        &self,
        message_type: u8,
        seq: u32,
        timeout_secs: u64,
        handler: MessageHandler,
    ) {
        let key = message_key(message_type, seq);
        let timeout = if timeout_secs == 0 {
            self.default_timeout
        } else {
            Duration::from_secs(timeout_secs)
        };

        let mut entries = self.entries.lock().unwrap();
        if matches!(entries.get(&key), Some(Entry::Ready(_))) {
            let Some(Entry::Ready(message)) = entries.remove(&key) else {
                unreachable!("checked above")
            };
            drop(entries);
            handler(Ok(message));
            return;
        }
        let timer_entries = Arc::clone(&self.entries);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut entries = timer_entries.lock().unwrap();
                match entries.remove(&key) {
                    Some(Entry::Waiting { handler, .. }) => Some(handler),
                    Some(ready) => {
                        // raced with an arrival that was never picked up
                        entries.insert(key, ready);
                        None
                    }
                    None => None,
                }
            };
            if let Some(handler) = expired {
                debug!(message_type, seq, "channel receive timed out");
                handler(Err(PpcError::Timeout));
            }
        });
        if let Some(Entry::Waiting { timer: stale, .. }) =
            entries.insert(key, Entry::Waiting { handler, timer })
        {
            // a second receiver replaced the first; the first one's timer is
            // dead weight now
            stale.abort();
        }
    }

    /// Await one message with a oneshot bridge over `async_receive`.
    pub async fn receive(
        &self,
        message_type: u8,
        seq: u32,
        timeout_secs: u64,
    ) -> Result<PpcMessage, PpcError> {
        let (tx, rx) = oneshot::channel();
        self.async_receive(
            message_type,
            seq,
            timeout_secs,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.await.unwrap_or(Err(PpcError::Timeout))
    }

    /// Route an inbound message: dispatch to the waiting receiver if one is
    /// parked on the key, otherwise stash it for a later `async_receive`.
    pub fn on_message_arrived(&self, message_type: u8, message: PpcMessage) {
        let key = message_key(message_type, message.seq);
        let handler = {
            let mut entries = self.entries.lock().unwrap();
            match entries.remove(&key) {
                Some(Entry::Waiting { handler, timer }) => {
                    timer.abort();
                    Some(handler)
                }
                _ => {
                    entries.insert(key, Entry::Ready(message.clone()));
                    None
                }
            }
        };
        if let Some(handler) = handler {
            handler(Ok(message));
        }
    }

    /// Cancel all parked receivers and drop buffered messages.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap();
        for (_, entry) in entries.drain() {
            if let Entry::Waiting { timer, .. } = entry {
                timer.abort();
            }
        }
    }
}

impl Drop for TaskChannel {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(message_type: u8, seq: u32) -> PpcMessage {
        PpcMessage {
            version: 1,
            message_type,
            seq,
            task_id: "T_123456".into(),
            sender: "1001".into(),
            data: vec![b'a'; 10],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn buffered_message_is_delivered_to_late_receiver() {
        let channel = TaskChannel::new(Duration::from_secs(30));
        channel.on_message_arrived(4, message(4, 5));
        let received = channel.receive(4, 5, 1).await.unwrap();
        assert_eq!(received.seq, 5);
        assert_eq!(received.sender, "1001");
        assert_eq!(received.data.len(), 10);
    }

    #[tokio::test]
    async fn parked_receiver_fires_on_arrival() {
        let channel = Arc::new(TaskChannel::new(Duration::from_secs(30)));
        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.receive(4, 6, 5).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.on_message_arrived(4, message(4, 6));
        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received.seq, 6);
    }

    #[tokio::test]
    async fn timeout_fires_once_and_late_message_is_buffered() {
        let channel = TaskChannel::new(Duration::from_secs(30));
        let err = channel.receive(4, 7, 1).await.unwrap_err();
        assert_eq!(err, PpcError::Timeout);
        // the late arrival must not re-invoke the fired handler; it is
        // buffered for a future receiver instead
        channel.on_message_arrived(4, message(4, 7));
        let received = channel.receive(4, 7, 1).await.unwrap();
        assert_eq!(received.seq, 7);
    }

    #[tokio::test]
    async fn distinct_seqs_do_not_cross() {
        let channel = TaskChannel::new(Duration::from_secs(30));
        channel.on_message_arrived(4, message(4, 8));
        channel.on_message_arrived(4, message(4, 9));
        assert_eq!(channel.receive(4, 9, 1).await.unwrap().seq, 9);
        assert_eq!(channel.receive(4, 8, 1).await.unwrap().seq, 8);
    }

    #[tokio::test]
    async fn zero_timeout_uses_channel_default() {
        // a tiny default so the test observes it
        let channel = TaskChannel::new(Duration::from_millis(50));
        let start = std::time::Instant::now();
        let err = channel.receive(1, 1, 0).await.unwrap_err();
        assert_eq!(err, PpcError::Timeout);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
