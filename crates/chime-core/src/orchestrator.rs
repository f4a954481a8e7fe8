//! The request pipeline orchestrator.
//!
//! One task owns the whole pipeline: it funnels every bus event it cares
//! about through a single `select!` loop, so session state never needs a
//! lock and stage transitions are serialized by construction. The stages
//! themselves run out-of-process (wakeword, recorder, transcriber,
//! synthesizer, and the user-facing Cores); this loop only correlates their
//! finished events, decides what runs next, and enforces a per-stage stall
//! deadline.

use crate::bus::{BusHandle, BusMessage};
use crate::error::HubResult;
use crate::intent::{self, Collection, Intent, IntentRegistry, Resolution};
use crate::message::{
    self, CoreFinished, RecordingFinished, SpeechSynthesized, TranscriptionFinished,
    WakewordDetected,
};
use crate::session::{Session, Stage};
use crate::topics::is_util_topic;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Base64-encoded feedback sounds, played at pipeline transitions so the
/// user hears where their request is without watching a screen.
#[derive(Debug, Clone)]
pub struct CueSounds {
    /// Wakeword accepted, recording is starting.
    pub begin: String,
    /// Recording captured, the hub is working on it.
    pub stop: String,
    /// Resolution failed or a stage stalled.
    pub error: String,
    /// An instant intent fired.
    pub instant: String,
}

pub struct Orchestrator {
    bus: BusHandle,
    registry: Arc<IntentRegistry>,
    session: Session,
    cues: CueSounds,
}

impl Orchestrator {
    pub fn new(
        bus: BusHandle,
        registry: Arc<IntentRegistry>,
        cues: CueSounds,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            registry,
            session: Session::new(stage_timeout),
            cues,
        }
    }

    /// Run the pipeline until the bus closes.
    ///
    /// The finished filter (`cores/+/finished`) covers the util stages and
    /// the user-facing Cores alike; the handler tells them apart by topic.
    pub async fn run(mut self) -> HubResult<()> {
        let mut finished = self.bus.subscribe(&self.bus.topics().any_core_finished()).await?;
        let mut intents = self.bus.subscribe(&self.bus.topics().core_intents()).await?;
        let mut collections = self
            .bus
            .subscribe(&self.bus.topics().core_collections())
            .await?;

        self.bus.set_thinking(false).await?;
        self.bus.set_recording(false).await?;
        self.bus
            .set_will_clear(&self.bus.topics().instant_intents())
            .await?;
        self.bus
            .publish_instant_intents(&self.registry.instant_intent_map())
            .await?;

        info!("pipeline orchestrator running");

        loop {
            tokio::select! {
                message = finished.recv() => match message {
                    Some(message) => self.handle_finished(message).await?,
                    None => break,
                },
                message = intents.recv() => match message {
                    Some(message) => self.handle_intent_registration(&message).await?,
                    None => break,
                },
                message = collections.recv() => match message {
                    Some(message) => self.handle_collection_registration(&message),
                    None => break,
                },
                _ = stage_expiry(self.session.deadline()) => {
                    self.handle_stage_timeout().await?;
                }
            }
        }

        info!("bus closed, pipeline orchestrator stopping");
        Ok(())
    }

    async fn handle_finished(&mut self, message: BusMessage) -> HubResult<()> {
        let topics = self.bus.topics().clone();
        if message.topic == topics.wakeword_finished() {
            self.handle_wakeword(&message).await
        } else if message.topic == topics.recorder_finished() {
            self.handle_recording_finished(&message).await
        } else if message.topic == topics.stt_finished() {
            self.handle_transcription_finished(&message).await
        } else if message.topic == topics.tts_finished() {
            self.handle_speech_synthesized(&message).await
        } else if !is_util_topic(&message.topic) {
            self.handle_core_finished(&message).await
        } else {
            // A util we issue no commands to (e.g. playback) reporting in.
            Ok(())
        }
    }

    /// A wakeword fired. The pipeline is single-flight: while a request is
    /// in progress every further wakeword is dropped, not queued.
    async fn handle_wakeword(&mut self, message: &BusMessage) -> HubResult<()> {
        let detected: WakewordDetected = match message::decode(&message.payload) {
            Ok(detected) => detected,
            Err(e) => {
                warn!(error = %e, "discarding malformed wakeword event");
                return Ok(());
            }
        };

        if self.session.is_active() {
            self.bus
                .log(&format!(
                    "Ignoring wakeword \"{}\": a request is already in flight",
                    detected.wakeword_id
                ))
                .await;
            return Ok(());
        }

        if let Some((intent_id, core_id)) = self.registry.instant_intent(&detected.wakeword_id) {
            let request_id = self.session.begin(Stage::AwaitingInstantResponse);
            self.bus
                .log(&format!(
                    "Wakeword \"{}\" triggers instant intent {intent_id}",
                    detected.wakeword_id
                ))
                .await;
            self.bus.play_audio(&self.cues.instant, &request_id).await?;
            self.bus.set_thinking(true).await?;
            self.bus
                .run_core(&intent_id, &core_id, &detected.wakeword_id, &request_id)
                .await?;
            return Ok(());
        }

        let request_id = self.session.begin(Stage::Listening);
        self.bus
            .log(&format!(
                "Wakeword \"{}\" detected, recording speech",
                detected.wakeword_id
            ))
            .await;
        self.bus.play_audio(&self.cues.begin, &request_id).await?;
        self.bus.set_recording(true).await?;
        self.bus.start_recording(&request_id).await
    }

    async fn handle_recording_finished(&mut self, message: &BusMessage) -> HubResult<()> {
        let recording: RecordingFinished = match message::decode(&message.payload) {
            Ok(recording) => recording,
            Err(e) => {
                warn!(error = %e, "discarding malformed recorder event");
                return Ok(());
            }
        };
        if !self.session.accepts(&recording.id) {
            warn!(id = %recording.id, "ignoring recording for a request that is not active");
            return Ok(());
        }
        if self.session.stage() != Stage::Listening {
            warn!(stage = self.session.stage().name(), "ignoring duplicate recorder event");
            return Ok(());
        }

        self.bus.set_recording(false).await?;
        self.bus.set_thinking(true).await?;
        self.bus.play_audio(&self.cues.stop, &recording.id).await?;
        self.bus
            .transcribe_audio(&recording.audio, &recording.id)
            .await?;
        self.session.advance(Stage::Transcribing);
        Ok(())
    }

    /// The transcript is in; resolve it and dispatch. Resolution is a pure
    /// in-memory lookup, so it runs inline rather than as its own stage.
    async fn handle_transcription_finished(&mut self, message: &BusMessage) -> HubResult<()> {
        let transcription: TranscriptionFinished = match message::decode(&message.payload) {
            Ok(transcription) => transcription,
            Err(e) => {
                warn!(error = %e, "discarding malformed transcriber event");
                return Ok(());
            }
        };
        if !self.session.accepts(&transcription.id) {
            warn!(id = %transcription.id, "ignoring transcript for a request that is not active");
            return Ok(());
        }
        if self.session.stage() != Stage::Transcribing {
            warn!(stage = self.session.stage().name(), "ignoring duplicate transcriber event");
            return Ok(());
        }

        self.bus
            .log(&format!("Heard: \"{}\"", transcription.text))
            .await;
        self.session.set_transcript(transcription.text.clone());

        match intent::resolve(&transcription.text, &self.registry) {
            Resolution::Match(result) => {
                self.bus
                    .log(&format!(
                        "Resolved intent {} for core {}",
                        result.intent_id, result.core_id
                    ))
                    .await;
                self.bus
                    .run_core(
                        &result.intent_id,
                        &result.core_id,
                        &result.text,
                        &transcription.id,
                    )
                    .await?;
                self.session.advance(Stage::AwaitingCoreResult);
            }
            Resolution::NoMatch => {
                self.bus
                    .log(&format!("No intent matched \"{}\"", transcription.text))
                    .await;
                self.fail_request(&transcription.id).await?;
            }
            Resolution::Ambiguous => {
                self.bus
                    .log(&format!(
                        "\"{}\" matched multiple intents equally well, refusing to guess",
                        transcription.text
                    ))
                    .await;
                self.fail_request(&transcription.id).await?;
            }
        }
        Ok(())
    }

    async fn handle_core_finished(&mut self, message: &BusMessage) -> HubResult<()> {
        let finished: CoreFinished = match message::decode(&message.payload) {
            Ok(finished) => finished,
            Err(e) => {
                warn!(error = %e, topic = %message.topic, "discarding malformed core result");
                return Ok(());
            }
        };
        if !self.session.accepts(&finished.id) {
            warn!(id = %finished.id, topic = %message.topic, "ignoring core result for a request that is not active");
            return Ok(());
        }
        if !matches!(
            self.session.stage(),
            Stage::AwaitingCoreResult | Stage::AwaitingInstantResponse
        ) {
            warn!(stage = self.session.stage().name(), "ignoring core result in an unexpected stage");
            return Ok(());
        }

        if let Some(explanation) = &finished.explanation {
            self.bus.log(&format!("Core explained: {explanation}")).await;
        }
        self.bus.set_thinking(true).await?;
        self.bus.speak(&finished.text, &finished.id).await?;
        self.session.advance(Stage::Speaking);
        Ok(())
    }

    /// Synthesized speech is ready. Playback is fire-and-forget, so
    /// commanding it completes the request.
    async fn handle_speech_synthesized(&mut self, message: &BusMessage) -> HubResult<()> {
        let speech: SpeechSynthesized = match message::decode(&message.payload) {
            Ok(speech) => speech,
            Err(e) => {
                warn!(error = %e, "discarding malformed synthesizer event");
                return Ok(());
            }
        };
        if !self.session.accepts(&speech.id) {
            warn!(id = %speech.id, "ignoring synthesized speech for a request that is not active");
            return Ok(());
        }
        if self.session.stage() != Stage::Speaking {
            warn!(stage = self.session.stage().name(), "ignoring duplicate synthesizer event");
            return Ok(());
        }

        self.bus.set_thinking(false).await?;
        self.bus.play_audio(&speech.audio, &speech.id).await?;
        self.session.reset();
        Ok(())
    }

    /// A stage outlived its deadline. Give up on the request so a fresh
    /// wakeword works immediately; nothing is retried.
    async fn handle_stage_timeout(&mut self) -> HubResult<()> {
        let stage = self.session.stage().name();
        warn!(stage, "stage deadline passed, abandoning request");
        self.bus
            .log(&format!("Request timed out while {stage}, resetting"))
            .await;
        let request_id = self.session.id().unwrap_or_default().to_string();
        self.fail_request(&request_id).await
    }

    /// Error cue, flags down, session cleared.
    async fn fail_request(&mut self, request_id: &str) -> HubResult<()> {
        self.bus.play_audio(&self.cues.error, request_id).await?;
        self.bus.set_thinking(false).await?;
        self.bus.set_recording(false).await?;
        self.session.reset();
        Ok(())
    }

    /// A Core published (or re-published) an intent. Registration is
    /// idempotent; the retained instant-intent map is refreshed so
    /// wakeword utils learn new dedicated wakewords without a restart.
    async fn handle_intent_registration(&mut self, message: &BusMessage) -> HubResult<()> {
        let registered: Intent = match message::decode(&message.payload) {
            Ok(registered) => registered,
            Err(e) => {
                warn!(error = %e, topic = %message.topic, "discarding malformed intent registration");
                return Ok(());
            }
        };
        info!(intent = %registered.id, core = %registered.core_id, "intent registered");
        let had_wakewords = !registered.wakewords.is_empty();
        self.registry.insert_intent(registered);
        if had_wakewords {
            self.bus
                .publish_instant_intents(&self.registry.instant_intent_map())
                .await?;
        }
        Ok(())
    }

    fn handle_collection_registration(&mut self, message: &BusMessage) {
        let registered: Collection = match message::decode(&message.payload) {
            Ok(registered) => registered,
            Err(e) => {
                warn!(error = %e, topic = %message.topic, "discarding malformed collection registration");
                return;
            }
        };
        info!(collection = %registered.id, "collection registered");
        self.registry.insert_collection(registered);
    }
}

/// Pends while idle so the timeout branch never fires spuriously.
async fn stage_expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
