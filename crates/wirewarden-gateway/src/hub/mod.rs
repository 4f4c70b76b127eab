//! C7 WebSocket Hub and C8 connection pump (spec §4.7, §4.8).

pub mod pump;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::mpsc;
use wirewarden_types::{ChannelName, ServerMessage};

/// Per-client outbound queue depth. A client whose write pump falls behind
/// has messages dropped, never the hub blocked (spec §4.7 "slow-consumer policy").
const SEND_QUEUE_DEPTH: usize = 64;

pub type ClientId = u64;

struct ClientHandle {
    sender: mpsc::Sender<ServerMessage>,
}

/// Client registry, per-channel subscription sets, and broadcast fan-out.
/// Reader-writer semantics via [`DashMap`]; no lock is held across I/O.
#[derive(Default)]
pub struct Hub {
    next_id: AtomicU64,
    clients: DashMap<ClientId, ClientHandle>,
    subscriptions: DashMap<ChannelName, DashSet<ClientId>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new connection and return its id plus the receiving half
    /// of its send queue, owned by the connection's write pump.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        self.clients.insert(id, ClientHandle { sender: tx });
        (id, rx)
    }

    /// Drop the client's queue and remove it from every subscription set.
    pub fn unregister(&self, id: ClientId) {
        self.clients.remove(&id);
        for entry in self.subscriptions.iter() {
            entry.value().remove(&id);
        }
    }

    pub fn subscribe(&self, id: ClientId, channel: ChannelName) {
        self.subscriptions.entry(channel).or_default().insert(id);
    }

    pub fn unsubscribe(&self, id: ClientId, channel: ChannelName) {
        if let Some(set) = self.subscriptions.get(&channel) {
            set.remove(&id);
        }
    }

    /// Marshal once, iterate the channel's subscribers, non-blocking send.
    /// A client with a full queue loses this message only (spec §4.7
    /// testable property 7 "slow-consumer isolation").
    pub fn broadcast(&self, channel: ChannelName, payload: Value) {
        let Some(subscribers) = self.subscriptions.get(&channel) else { return };
        let message = ServerMessage::for_channel(channel, payload);

        for id in subscribers.iter() {
            if let Some(client) = self.clients.get(&id) {
                if client.sender.try_send(message.clone()).is_err() {
                    tracing::debug!(client_id = *id, channel = channel.as_str(), "dropping message for slow consumer");
                }
            }
        }
    }

    /// Send directly to one client, bypassing subscription sets (used for
    /// the synthetic `init` message and on-demand snapshots).
    pub fn send_to(&self, id: ClientId, message: ServerMessage) {
        if let Some(client) = self.clients.get(&id) {
            let _ = client.sender.try_send(message);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn channel_subscriber_count(&self, channel: ChannelName) -> usize {
        self.subscriptions.get(&channel).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Testable property 6: single subscriber sees broadcasts in call order
    // because delivery is a single mpsc queue drained by one consumer.
    #[tokio::test]
    async fn broadcast_preserves_order_for_one_subscriber() {
        let hub = Hub::new();
        let (id, mut rx) = hub.register();
        hub.subscribe(id, ChannelName::Stats);

        hub.broadcast(ChannelName::Stats, serde_json::json!({"n": 1}));
        hub.broadcast(ChannelName::Stats, serde_json::json!({"n": 2}));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload["n"], 1);
        assert_eq!(second.payload["n"], 2);
    }

    // Testable property 7: client A's full queue doesn't block delivery to B.
    #[tokio::test]
    async fn slow_consumer_does_not_block_others() {
        let hub = Hub::new();
        let (id_a, rx_a) = hub.register();
        let (id_b, mut rx_b) = hub.register();
        hub.subscribe(id_a, ChannelName::Traffic);
        hub.subscribe(id_b, ChannelName::Traffic);

        // Fill A's queue without draining it.
        for i in 0..SEND_QUEUE_DEPTH + 5 {
            hub.broadcast(ChannelName::Traffic, serde_json::json!({"n": i}));
        }

        let last = rx_b.try_recv();
        assert!(last.is_ok());
        drop(rx_a);
    }

    #[test]
    fn unregister_clears_subscriptions() {
        let hub = Hub::new();
        let (id, _rx) = hub.register();
        hub.subscribe(id, ChannelName::Docker);
        assert_eq!(hub.channel_subscriber_count(ChannelName::Docker), 1);

        hub.unregister(id);
        assert_eq!(hub.channel_subscriber_count(ChannelName::Docker), 0);
        assert_eq!(hub.client_count(), 0);
    }
}
