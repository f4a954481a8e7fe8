//! Device-scoped topic namespace.
//!
//! Every topic lives under `chime/{device_id}/`. Cores and the hub agree on
//! these paths, so they are built in one place rather than formatted ad hoc.

/// Marker that must appear in a Core executable's file name for discovery.
pub const CORE_MARKER: &str = "bb_core";

/// Builds the full topic set for one device.
#[derive(Debug, Clone)]
pub struct TopicSpace {
    device_id: String,
}

impl TopicSpace {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn scoped(&self, suffix: &str) -> String {
        format!("chime/{}/{}", self.device_id, suffix)
    }

    // Pipeline events (published by utils, consumed by the orchestrator)

    pub fn wakeword_finished(&self) -> String {
        self.scoped("cores/wakeword_util/finished")
    }

    pub fn recorder_finished(&self) -> String {
        self.scoped("cores/audio_recorder_util/finished")
    }

    pub fn stt_finished(&self) -> String {
        self.scoped("cores/stt_util/finished")
    }

    pub fn tts_finished(&self) -> String {
        self.scoped("cores/tts_util/finished")
    }

    pub fn core_finished(&self, core_id: &str) -> String {
        self.scoped(&format!("cores/{core_id}/finished"))
    }

    /// Matches every Core's finished topic, utils included; the orchestrator
    /// tells them apart by suffixed util names.
    pub fn any_core_finished(&self) -> String {
        self.scoped("cores/+/finished")
    }

    // Commands (published by the orchestrator)

    pub fn play_file(&self) -> String {
        self.scoped("cores/audio_playback_util/play_file")
    }

    pub fn record_speech(&self) -> String {
        self.scoped("cores/audio_recorder_util/record_speech")
    }

    pub fn transcribe(&self) -> String {
        self.scoped("cores/stt_util/transcribe")
    }

    pub fn speak(&self) -> String {
        self.scoped("cores/tts_util/run")
    }

    pub fn core_run(&self, core_id: &str) -> String {
        self.scoped(&format!("cores/{core_id}/run"))
    }

    // Registry topics (retained)

    pub fn central_config(&self, core_id: &str) -> String {
        self.scoped(&format!("cores/{core_id}/central_config"))
    }

    pub fn core_list(&self) -> String {
        self.scoped("cores/list")
    }

    pub fn core_intents(&self) -> String {
        self.scoped("cores/+/intents")
    }

    pub fn core_collections(&self) -> String {
        self.scoped("cores/+/collections")
    }

    pub fn instant_intents(&self) -> String {
        self.scoped("instant_intents")
    }

    // State and logging

    pub fn thinking(&self) -> String {
        self.scoped("thinking")
    }

    pub fn recording(&self) -> String {
        self.scoped("recording")
    }

    pub fn logs(&self) -> String {
        self.scoped("logs")
    }
}

/// A finished topic from a Util rather than a user-facing Core. The pipeline
/// listens on `cores/+/finished` but must not confuse a skill result with a
/// util stage completing.
pub fn is_util_topic(topic: &str) -> bool {
    topic
        .rsplit('/')
        .nth(1)
        .is_some_and(|segment| segment.ends_with("_util"))
}

/// Topic filter matching with `+` (one level) and `#` (rest of levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
