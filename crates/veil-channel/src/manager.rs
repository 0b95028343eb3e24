// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! One channel per task, plus a holding pen for early messages.
//!
//! The gateway can deliver messages for a task before the local engine has
//! admitted it and built its channel. Those messages are held per task id
//! and replayed in arrival order once the channel exists; a task that never
//! materializes has its held messages discarded after a bounded time.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};
use veil_protocol::PpcMessage;

use crate::channel::TaskChannel;

/// How long early messages are held for a channel that does not exist yet.
/// Doubles (in seconds) as the default per-message receive timeout.
pub const HOLDING_MESSAGE_TIMEOUT_MINUTES: u64 = 30;

struct HoldingMessages {
    messages: Vec<(u8, PpcMessage)>,
    timer: tokio::task::JoinHandle<()>,
}

/// Owns the per-task channels of one engine.
pub struct ChannelManager {
    channels: DashMap<String, Arc<TaskChannel>>,
    holding: Arc<DashMap<String, HoldingMessages>>,
    holding_timeout: Duration,
}

impl Default for ChannelManager {
    fn default() -> Self {
        ChannelManager::new(Duration::from_secs(HOLDING_MESSAGE_TIMEOUT_MINUTES * 60))
    }
}

impl ChannelManager {
    pub fn new(holding_timeout: Duration) -> Self {
        ChannelManager {
            channels: DashMap::new(),
            holding: Arc::new(DashMap::new()),
            holding_timeout,
        }
    }

    /// Create the channel for `task_id` and replay any held messages into it
    /// in arrival order.
    pub fn build_channel_for_task(&self, task_id: &str) -> Arc<TaskChannel> {
        info!(task = task_id, "build channel for task");
        let channel = Arc::new(TaskChannel::new(self.holding_timeout));
        self.channels.insert(task_id.to_string(), Arc::clone(&channel));
        if let Some((_, held)) = self.holding.remove(task_id) {
            held.timer.abort();
            debug!(task = task_id, count = held.messages.len(), "replaying held messages");
            for (message_type, message) in held.messages {
                channel.on_message_arrived(message_type, message);
            }
        }
        channel
    }

    pub fn channel_for_task(&self, task_id: &str) -> Option<Arc<TaskChannel>> {
        self.channels.get(task_id).map(|c| Arc::clone(&c))
    }

    pub fn remove_channel_for_task(&self, task_id: &str) {
        info!(task = task_id, "remove channel for task");
        self.channels.remove(task_id);
    }

    /// Route an inbound message to its task's channel, or hold it if the
    /// channel has not been built yet.
    pub fn on_message_arrived(&self, message: PpcMessage) {
        let task_id = message.task_id.clone();
        if let Some(channel) = self.channels.get(&task_id) {
            channel.on_message_arrived(message.message_type, message);
            return;
        }
        let message_type = message.message_type;
        let mut entry = self.holding.entry(task_id.clone()).or_insert_with(|| {
            let holding = Arc::clone(&self.holding);
            let timeout = self.holding_timeout;
            let expired_task = task_id.clone();
            HoldingMessages {
                messages: Vec::new(),
                timer: tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if holding.remove(&expired_task).is_some() {
                        debug!(task = %expired_task, "held messages expired");
                    }
                }),
            }
        });
        entry.messages.push((message_type, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_types::PpcError;

    fn message(seq: u32) -> PpcMessage {
        PpcMessage {
            version: 1,
            message_type: 4,
            seq,
            task_id: "T_123456".into(),
            sender: "1001".into(),
            data: vec![b'a'; 10],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn early_messages_replay_into_new_channel() {
        let manager = ChannelManager::default();
        manager.on_message_arrived(message(5));
        manager.on_message_arrived(message(6));

        let channel = manager.build_channel_for_task("T_123456");
        assert_eq!(channel.receive(4, 5, 1).await.unwrap().seq, 5);
        assert_eq!(channel.receive(4, 6, 1).await.unwrap().seq, 6);
        // nothing was held for seq 7
        assert_eq!(
            channel.receive(4, 7, 1).await.unwrap_err(),
            PpcError::Timeout
        );
    }

    #[tokio::test]
    async fn held_messages_expire() {
        let manager = ChannelManager::new(Duration::from_millis(30));
        manager.on_message_arrived(message(5));
        tokio::time::sleep(Duration::from_millis(80)).await;
        let channel = manager.build_channel_for_task("T_123456");
        assert_eq!(
            channel.receive(4, 5, 1).await.unwrap_err(),
            PpcError::Timeout
        );
    }

    #[tokio::test]
    async fn routed_directly_once_channel_exists() {
        let manager = ChannelManager::default();
        let channel = manager.build_channel_for_task("T_123456");
        manager.on_message_arrived(message(8));
        assert_eq!(channel.receive(4, 8, 1).await.unwrap().seq, 8);
        manager.remove_channel_for_task("T_123456");
        assert!(manager.channel_for_task("T_123456").is_none());
    }
}
