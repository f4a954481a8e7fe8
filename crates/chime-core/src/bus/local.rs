//! In-process message bus.
//!
//! Implements the full boundary contract the hub relies on: wildcard
//! subscriptions, retained messages with tombstones, and last wills fired on
//! unclean disconnect. Used by the test suite and by single-process
//! deployments; a broker-backed client implements the same trait.

use super::{BusMessage, MessageBus};
use crate::error::HubResult;
use crate::topics::topic_matches;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

struct Subscription {
    filter: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

struct Will {
    topic: String,
    payload: Vec<u8>,
    retain: bool,
}

#[derive(Default)]
pub struct LocalBus {
    subscriptions: Mutex<Vec<Subscription>>,
    retained: DashMap<String, Vec<u8>>,
    wills: Mutex<Vec<Will>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn fan_out(&self, topic: &str, payload: &[u8]) {
        let mut subscriptions = self.subscriptions.lock().await;
        // Dropped receivers fall out of the list on the next publish.
        subscriptions.retain(|sub| {
            if !topic_matches(&sub.filter, topic) {
                return true;
            }
            sub.sender
                .send(BusMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                })
                .is_ok()
        });
    }

    /// Simulate an unclean disconnect: publish every registered will.
    pub async fn disconnect_uncleanly(&self) {
        let wills: Vec<Will> = std::mem::take(&mut *self.wills.lock().await);
        for will in wills {
            let _ = self.publish(&will.topic, will.payload, will.retain).await;
        }
    }

    /// The retained payload on a topic, if any. Test helper.
    pub fn retained_on(&self, topic: &str) -> Option<Vec<u8>> {
        self.retained.get(topic).map(|entry| entry.clone())
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> HubResult<()> {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), payload.clone());
            }
        }
        self.fan_out(topic, &payload).await;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> HubResult<mpsc::UnboundedReceiver<BusMessage>> {
        let (sender, receiver) = mpsc::unbounded_channel();

        // Late subscribers see current retained state first.
        for entry in self.retained.iter() {
            if topic_matches(filter, entry.key()) {
                let _ = sender.send(BusMessage {
                    topic: entry.key().clone(),
                    payload: entry.value().clone(),
                });
            }
        }

        self.subscriptions.lock().await.push(Subscription {
            filter: filter.to_string(),
            sender,
        });
        Ok(receiver)
    }

    async fn set_will(&self, topic: &str, payload: Vec<u8>, retain: bool) -> HubResult<()> {
        self.wills.lock().await.push(Will {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_matching_topics_only() {
        let bus = LocalBus::new();
        let mut rx = bus.subscribe("chime/abc/cores/+/finished").await.unwrap();

        bus.publish("chime/abc/cores/wled/finished", b"a".to_vec(), false)
            .await
            .unwrap();
        bus.publish("chime/abc/cores/wled/run", b"b".to_vec(), false)
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "chime/abc/cores/wled/finished");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_subscriber_sees_retained_state() {
        let bus = LocalBus::new();
        bus.publish("chime/abc/cores/list", b"[1]".to_vec(), true)
            .await
            .unwrap();

        let mut rx = bus.subscribe("chime/abc/cores/list").await.unwrap();
        let message = rx.recv().await.unwrap();
        assert_eq!(message.payload, b"[1]");
    }

    #[tokio::test]
    async fn empty_retained_payload_is_a_tombstone() {
        let bus = LocalBus::new();
        bus.publish("chime/abc/thinking", b"x".to_vec(), true)
            .await
            .unwrap();
        bus.publish("chime/abc/thinking", Vec::new(), true)
            .await
            .unwrap();

        assert!(bus.retained_on("chime/abc/thinking").is_none());
        let mut rx = bus.subscribe("chime/abc/thinking").await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wills_fire_on_unclean_disconnect() {
        let bus = LocalBus::new();
        bus.publish("chime/abc/cores/wled/central_config", b"{}".to_vec(), true)
            .await
            .unwrap();
        bus.set_will("chime/abc/cores/wled/central_config", Vec::new(), true)
            .await
            .unwrap();

        bus.disconnect_uncleanly().await;
        assert!(bus.retained_on("chime/abc/cores/wled/central_config").is_none());
    }
}
