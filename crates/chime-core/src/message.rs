//! Wire payloads, one fixed schema per topic.
//!
//! Everything on the bus is a flat JSON object. Audio never gets decoded by
//! the hub; it travels as a base64 string between the recorder, the
//! transcriber, and the playback util.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Published by the wakeword util when a wakeword fires. Carries no request
/// id; the orchestrator mints one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakewordDetected {
    pub wakeword_id: String,
    #[serde(default)]
    pub confidence: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingFinished {
    pub id: String,
    pub audio: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionFinished {
    pub id: String,
    pub text: String,
}

/// A user-facing Core's result, ready to be spoken back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreFinished {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechSynthesized {
    pub id: String,
    pub audio: String,
}

// Commands

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayAudio {
    pub id: String,
    pub audio: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSpeech {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeAudio {
    pub id: String,
    pub audio: String,
}

/// Dispatch of a resolved intent to its target Core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIntent {
    pub id: String,
    pub intent_id: String,
    pub core_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Speak {
    pub id: String,
    pub text: String,
}

// Retained registry/state topics

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreList {
    pub loaded_cores: Vec<String>,
}

/// wakeword id -> intent id, retained on the instant-intents topic.
pub type InstantIntentMap = HashMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingState {
    pub is_thinking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingState {
    pub is_recording: bool,
}

/// Decode a steady-state payload. Callers log and drop the message on error;
/// a malformed publication must never take the hub down.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}
