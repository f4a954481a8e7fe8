//! The message-bus boundary.
//!
//! The transport itself is out of scope for the hub: anything that offers
//! topic pub/sub with retained messages and a last-will mechanism can carry
//! it. [`MessageBus`] is that seam, [`LocalBus`] the bundled in-process
//! implementation, and [`BusHandle`] the device-scoped publisher the rest of
//! the hub talks through.

pub mod local;

pub use local::LocalBus;

use crate::error::HubResult;
use crate::message::{
    CoreList, InstantIntentMap, PlayAudio, RecordSpeech, RecordingState, RunIntent, Speak,
    ThinkingState, TranscribeAudio,
};
use crate::topics::TopicSpace;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One delivered publication.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Topic-based pub/sub with retained messages and last wills.
///
/// Contract notes: delivery is at-least-once, so consumers must tolerate
/// duplicates; ordering is preserved within a single subscription; an empty
/// retained payload clears the retained value (a tombstone); registered
/// wills fire on unclean disconnect.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> HubResult<()>;

    /// Subscribe to a topic filter (`+`/`#` wildcards). Matching retained
    /// messages are delivered immediately.
    async fn subscribe(&self, filter: &str) -> HubResult<mpsc::UnboundedReceiver<BusMessage>>;

    /// Register a message the bus publishes on our behalf if we disconnect
    /// uncleanly.
    async fn set_will(&self, topic: &str, payload: Vec<u8>, retain: bool) -> HubResult<()>;
}

/// Device-scoped bus access for hub components.
///
/// Every retained publish is recorded here, so shutdown can tombstone
/// exactly the topics this device owns instead of crawling a wildcard
/// subscription looking for leftovers.
#[derive(Clone)]
pub struct BusHandle {
    bus: Arc<dyn MessageBus>,
    topics: TopicSpace,
    friendly_name: String,
    owned_retained: Arc<DashMap<String, ()>>,
}

impl BusHandle {
    pub fn new(bus: Arc<dyn MessageBus>, topics: TopicSpace, friendly_name: &str) -> Self {
        Self {
            bus,
            topics,
            friendly_name: friendly_name.to_string(),
            owned_retained: Arc::new(DashMap::new()),
        }
    }

    pub fn topics(&self) -> &TopicSpace {
        &self.topics
    }

    pub async fn subscribe(&self, filter: &str) -> HubResult<mpsc::UnboundedReceiver<BusMessage>> {
        self.bus.subscribe(filter).await
    }

    pub async fn publish_json<T: Serialize>(&self, topic: &str, payload: &T) -> HubResult<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.bus.publish(topic, bytes, false).await
    }

    /// Retained publish, recorded in the owned-topics registry.
    pub async fn publish_retained_json<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
    ) -> HubResult<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.owned_retained.insert(topic.to_string(), ());
        self.bus.publish(topic, bytes, true).await
    }

    /// Register a will that clears a retained topic if we vanish. A stale
    /// retained value from a previous run must never be read by a freshly
    /// started Core.
    pub async fn set_will_clear(&self, topic: &str) -> HubResult<()> {
        self.bus.set_will(topic, Vec::new(), true).await
    }

    /// Tombstone every retained topic this handle ever published.
    pub async fn clear_retained(&self) -> HubResult<()> {
        let owned: Vec<String> = self
            .owned_retained
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for topic in owned {
            tracing::debug!(%topic, "clearing retained topic");
            self.bus.publish(&topic, Vec::new(), true).await?;
            self.owned_retained.remove(&topic);
        }
        Ok(())
    }

    /// The bus logging contract: a `[{name}] message` line on the device's
    /// logs topic, mirrored to local tracing. Best-effort; a full logs
    /// subscriber must never stall the pipeline.
    pub async fn log(&self, message: &str) {
        tracing::info!("[{}] {}", self.friendly_name, message);
        let line = format!("[{}] {}", self.friendly_name, message);
        if let Err(e) = self
            .bus
            .publish(&self.topics.logs(), line.into_bytes(), false)
            .await
        {
            tracing::warn!(error = %e, "failed to publish log line to bus");
        }
    }

    // Pipeline commands

    pub async fn play_audio(&self, audio: &str, request_id: &str) -> HubResult<()> {
        self.publish_json(
            &self.topics.play_file(),
            &PlayAudio {
                id: request_id.to_string(),
                audio: audio.to_string(),
            },
        )
        .await
    }

    pub async fn start_recording(&self, request_id: &str) -> HubResult<()> {
        self.publish_json(
            &self.topics.record_speech(),
            &RecordSpeech {
                id: request_id.to_string(),
            },
        )
        .await
    }

    pub async fn transcribe_audio(&self, audio: &str, request_id: &str) -> HubResult<()> {
        self.publish_json(
            &self.topics.transcribe(),
            &TranscribeAudio {
                id: request_id.to_string(),
                audio: audio.to_string(),
            },
        )
        .await
    }

    pub async fn run_core(
        &self,
        intent_id: &str,
        core_id: &str,
        text: &str,
        request_id: &str,
    ) -> HubResult<()> {
        self.publish_json(
            &self.topics.core_run(core_id),
            &RunIntent {
                id: request_id.to_string(),
                intent_id: intent_id.to_string(),
                core_id: core_id.to_string(),
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn speak(&self, text: &str, request_id: &str) -> HubResult<()> {
        self.publish_json(
            &self.topics.speak(),
            &Speak {
                id: request_id.to_string(),
                text: text.to_string(),
            },
        )
        .await
    }

    // Retained state and registry topics

    pub async fn set_thinking(&self, state: bool) -> HubResult<()> {
        self.publish_retained_json(&self.topics.thinking(), &ThinkingState { is_thinking: state })
            .await
    }

    pub async fn set_recording(&self, state: bool) -> HubResult<()> {
        self.publish_retained_json(
            &self.topics.recording(),
            &RecordingState { is_recording: state },
        )
        .await
    }

    pub async fn publish_instant_intents(&self, map: &InstantIntentMap) -> HubResult<()> {
        self.publish_retained_json(&self.topics.instant_intents(), map)
            .await
    }

    pub async fn publish_core_list(&self, loaded_cores: Vec<String>) -> HubResult<()> {
        let topic = self.topics.core_list();
        self.set_will_clear(&topic).await?;
        self.publish_retained_json(&topic, &CoreList { loaded_cores })
            .await
    }

    pub async fn publish_central_config(
        &self,
        core_id: &str,
        config: &serde_json::Value,
    ) -> HubResult<()> {
        let topic = self.topics.central_config(core_id);
        self.set_will_clear(&topic).await?;
        self.publish_retained_json(&topic, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clear_retained_tombstones_every_owned_topic() {
        let bus = Arc::new(LocalBus::new());
        let handle = BusHandle::new(bus.clone(), TopicSpace::new("dev"), "Chime");

        handle.set_thinking(true).await.unwrap();
        handle
            .publish_core_list(vec!["wled".to_string()])
            .await
            .unwrap();
        handle
            .publish_central_config("wled", &serde_json::json!({"ips": ["10.0.0.2"]}))
            .await
            .unwrap();

        let topics = handle.topics().clone();
        assert!(bus.retained_on(&topics.thinking()).is_some());
        assert!(bus.retained_on(&topics.core_list()).is_some());
        assert!(bus.retained_on(&topics.central_config("wled")).is_some());

        handle.clear_retained().await.unwrap();
        assert!(bus.retained_on(&topics.thinking()).is_none());
        assert!(bus.retained_on(&topics.core_list()).is_none());
        assert!(bus.retained_on(&topics.central_config("wled")).is_none());
    }

    #[tokio::test]
    async fn vanished_device_wills_clear_its_registry_topics() {
        let bus = Arc::new(LocalBus::new());
        let handle = BusHandle::new(bus.clone(), TopicSpace::new("dev"), "Chime");

        handle
            .publish_core_list(vec!["wled".to_string()])
            .await
            .unwrap();
        bus.disconnect_uncleanly().await;
        assert!(bus.retained_on(&handle.topics().core_list()).is_none());
    }
}

impl std::fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusHandle")
            .field("device_id", &self.topics.device_id())
            .field("friendly_name", &self.friendly_name)
            .finish()
    }
}
