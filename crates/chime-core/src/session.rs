//! The single in-flight voice request.
//!
//! At most one non-idle session exists at a time; a wakeword heard while one
//! is active is ignored. The session is owned exclusively by the
//! orchestrator's event loop — handlers never share it — which is what keeps
//! two concurrently delivered bus events from racing on the request id.

use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Where the active request currently sits in the pipeline.
///
/// Resolution and dispatch happen synchronously inside the transcription
/// handler, so no stage exists for them; playback is fire-and-forget, so
/// commanding it clears the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    /// An instant intent was dispatched straight to its Core.
    AwaitingInstantResponse,
    /// The recorder is capturing the user's speech.
    Listening,
    /// The captured audio is with the transcriber.
    Transcribing,
    /// A resolved intent was dispatched to its Core.
    AwaitingCoreResult,
    /// The Core's answer is with the speech synthesizer.
    Speaking,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::AwaitingInstantResponse => "awaiting_instant_response",
            Stage::Listening => "listening",
            Stage::Transcribing => "transcribing",
            Stage::AwaitingCoreResult => "awaiting_core_result",
            Stage::Speaking => "speaking",
        }
    }
}

/// Correlation state for the active request.
#[derive(Debug)]
pub struct Session {
    id: Option<String>,
    stage: Stage,
    transcript: Option<String>,
    stage_timeout: Duration,
    deadline: Option<Instant>,
}

impl Session {
    pub fn new(stage_timeout: Duration) -> Self {
        Self {
            id: None,
            stage: Stage::Idle,
            transcript: None,
            stage_timeout,
            deadline: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.stage != Stage::Idle
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn transcript(&self) -> Option<&str> {
        self.transcript.as_deref()
    }

    pub fn set_transcript(&mut self, transcript: String) {
        self.transcript = Some(transcript);
    }

    /// Start a fresh request, minting its correlation token.
    pub fn begin(&mut self, stage: Stage) -> String {
        let id = Uuid::new_v4().to_string();
        self.id = Some(id.clone());
        self.advance(stage);
        id
    }

    /// Move to the next stage and re-arm the stall deadline.
    pub fn advance(&mut self, stage: Stage) {
        self.stage = stage;
        self.deadline = if stage == Stage::Idle {
            None
        } else {
            Some(Instant::now() + self.stage_timeout)
        };
    }

    /// Whether an event carrying `id` belongs to the active request. Stale
    /// and duplicate deliveries fail this check and must be ignored.
    pub fn accepts(&self, id: &str) -> bool {
        self.is_active() && self.id.as_deref() == Some(id)
    }

    /// Clear everything; ready for the next wakeword.
    pub fn reset(&mut self) {
        self.id = None;
        self.transcript = None;
        self.stage = Stage::Idle;
        self.deadline = None;
    }

    /// The instant at which the current stage counts as stalled. `None`
    /// while idle.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
