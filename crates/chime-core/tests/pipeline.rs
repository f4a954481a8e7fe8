//! End-to-end pipeline tests over the in-process bus.
//!
//! Each test plays the role of the out-of-process utils: it consumes the
//! orchestrator's commands from their topics and publishes the finished
//! events a real util would, then asserts on what the orchestrator does
//! next.

use chime_core::bus::{BusHandle, BusMessage, LocalBus};
use chime_core::intent::{Intent, IntentRegistry};
use chime_core::message::{
    CoreFinished, InstantIntentMap, PlayAudio, RecordSpeech, RunIntent, Speak, SpeechSynthesized,
    TranscribeAudio, TranscriptionFinished, WakewordDetected,
};
use chime_core::orchestrator::{CueSounds, Orchestrator};
use chime_core::topics::TopicSpace;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const BEGIN_CUE: &str = "QkVHSU4=";
const STOP_CUE: &str = "U1RPUA==";
const ERROR_CUE: &str = "RVJST1I=";
const INSTANT_CUE: &str = "SU5TVEFOVA==";

struct Harness {
    bus: Arc<LocalBus>,
    handle: BusHandle,
}

impl Harness {
    /// Spawn an orchestrator on a fresh bus and wait until it is live (it
    /// publishes its retained state flags once its subscriptions are up).
    async fn start(registry: Arc<IntentRegistry>, stage_timeout: Duration) -> Self {
        let bus = Arc::new(LocalBus::new());
        let handle = BusHandle::new(bus.clone(), TopicSpace::new("test-device"), "Chime Test");
        let cues = CueSounds {
            begin: BEGIN_CUE.to_string(),
            stop: STOP_CUE.to_string(),
            error: ERROR_CUE.to_string(),
            instant: INSTANT_CUE.to_string(),
        };
        let orchestrator = Orchestrator::new(handle.clone(), registry, cues, stage_timeout);
        tokio::spawn(orchestrator.run());

        let thinking = handle.topics().thinking();
        for _ in 0..200 {
            if bus.retained_on(&thinking).is_some() {
                return Self { bus, handle };
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("orchestrator never came up");
    }

    fn topics(&self) -> &TopicSpace {
        self.handle.topics()
    }

    async fn listen(&self, topic: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        self.handle.subscribe(topic).await.expect("subscribe")
    }

    async fn publish<T: Serialize>(&self, topic: &str, payload: &T) {
        self.handle
            .publish_json(topic, payload)
            .await
            .expect("publish");
    }

    async fn wake(&self, wakeword_id: &str) {
        self.publish(
            &self.topics().wakeword_finished(),
            &WakewordDetected {
                wakeword_id: wakeword_id.to_string(),
                confidence: None,
            },
        )
        .await;
    }
}

async fn recv<T: DeserializeOwned>(rx: &mut mpsc::UnboundedReceiver<BusMessage>) -> T {
    let message = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a bus message")
        .expect("bus closed");
    serde_json::from_slice(&message.payload).expect("payload decodes")
}

async fn assert_silent(rx: &mut mpsc::UnboundedReceiver<BusMessage>) {
    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "expected no message on this topic"
    );
}

fn wled_registry() -> Arc<IntentRegistry> {
    let registry = IntentRegistry::new();
    let intent: Intent = serde_json::from_value(json!({
        "id": "wled_power",
        "core_id": "wled",
        "keyphrases": [{"wled": ""}, {"turn on": "", "turn off": ""}]
    }))
    .expect("intent parses");
    registry.insert_intent(intent);
    Arc::new(registry)
}

#[tokio::test]
async fn full_round_trip_from_wakeword_to_playback() {
    let harness = Harness::start(wled_registry(), Duration::from_secs(30)).await;
    let mut record = harness.listen(&harness.topics().record_speech()).await;
    let mut transcribe = harness.listen(&harness.topics().transcribe()).await;
    let mut run = harness.listen(&harness.topics().core_run("wled")).await;
    let mut speak = harness.listen(&harness.topics().speak()).await;
    let mut play = harness.listen(&harness.topics().play_file()).await;

    harness.wake("hey chime").await;

    let begin: PlayAudio = recv(&mut play).await;
    assert_eq!(begin.audio, BEGIN_CUE);
    let recording: RecordSpeech = recv(&mut record).await;
    let id = recording.id;

    harness
        .publish(
            &harness.topics().recorder_finished(),
            &json!({"id": id, "audio": "c3BlZWNo"}),
        )
        .await;

    let stop: PlayAudio = recv(&mut play).await;
    assert_eq!(stop.audio, STOP_CUE);
    let job: TranscribeAudio = recv(&mut transcribe).await;
    assert_eq!(job.id, id);
    assert_eq!(job.audio, "c3BlZWNo");

    harness
        .publish(
            &harness.topics().stt_finished(),
            &TranscriptionFinished {
                id: id.clone(),
                text: "ask wled to turn on the light".to_string(),
            },
        )
        .await;

    let dispatch: RunIntent = recv(&mut run).await;
    assert_eq!(dispatch.id, id);
    assert_eq!(dispatch.intent_id, "wled_power");
    assert_eq!(dispatch.core_id, "wled");

    harness
        .publish(
            &harness.topics().core_finished("wled"),
            &CoreFinished {
                id: id.clone(),
                text: "The light is on".to_string(),
                explanation: None,
            },
        )
        .await;

    let utterance: Speak = recv(&mut speak).await;
    assert_eq!(utterance.id, id);
    assert_eq!(utterance.text, "The light is on");

    harness
        .publish(
            &harness.topics().tts_finished(),
            &SpeechSynthesized {
                id: id.clone(),
                audio: "c3ludGg=".to_string(),
            },
        )
        .await;

    let playback: PlayAudio = recv(&mut play).await;
    assert_eq!(playback.id, id);
    assert_eq!(playback.audio, "c3ludGg=");

    // The request completed, so a new wakeword starts a fresh one.
    harness.wake("hey chime").await;
    let next: RecordSpeech = recv(&mut record).await;
    assert_ne!(next.id, id);
}

#[tokio::test]
async fn wakeword_during_active_request_is_dropped() {
    let harness = Harness::start(wled_registry(), Duration::from_secs(30)).await;
    let mut record = harness.listen(&harness.topics().record_speech()).await;

    harness.wake("hey chime").await;
    let _first: RecordSpeech = recv(&mut record).await;

    harness.wake("hey chime").await;
    assert_silent(&mut record).await;
}

#[tokio::test]
async fn events_with_a_stale_id_are_ignored() {
    let harness = Harness::start(wled_registry(), Duration::from_secs(30)).await;
    let mut record = harness.listen(&harness.topics().record_speech()).await;
    let mut transcribe = harness.listen(&harness.topics().transcribe()).await;
    let mut run = harness.listen(&harness.topics().core_run("wled")).await;

    harness.wake("hey chime").await;
    let recording: RecordSpeech = recv(&mut record).await;

    // A recorder result from some earlier, abandoned request.
    harness
        .publish(
            &harness.topics().recorder_finished(),
            &json!({"id": "not-the-active-request", "audio": "c3BlZWNo"}),
        )
        .await;
    assert_silent(&mut transcribe).await;

    // The real one still goes through.
    harness
        .publish(
            &harness.topics().recorder_finished(),
            &json!({"id": recording.id, "audio": "c3BlZWNo"}),
        )
        .await;
    let job: TranscribeAudio = recv(&mut transcribe).await;
    assert_eq!(job.id, recording.id);

    // Same for a transcript carrying the wrong id.
    harness
        .publish(
            &harness.topics().stt_finished(),
            &TranscriptionFinished {
                id: "not-the-active-request".to_string(),
                text: "ask wled to turn on the light".to_string(),
            },
        )
        .await;
    assert_silent(&mut run).await;
}

#[tokio::test]
async fn redelivered_events_with_the_active_id_run_each_stage_once() {
    let harness = Harness::start(wled_registry(), Duration::from_secs(30)).await;
    let mut record = harness.listen(&harness.topics().record_speech()).await;
    let mut transcribe = harness.listen(&harness.topics().transcribe()).await;
    let mut run = harness.listen(&harness.topics().core_run("wled")).await;

    harness.wake("hey chime").await;
    let recording: RecordSpeech = recv(&mut record).await;

    // The bus is at-least-once; the recorder result shows up twice.
    let recorder_event = json!({"id": recording.id, "audio": "c3BlZWNo"});
    harness
        .publish(&harness.topics().recorder_finished(), &recorder_event)
        .await;
    harness
        .publish(&harness.topics().recorder_finished(), &recorder_event)
        .await;
    let job: TranscribeAudio = recv(&mut transcribe).await;
    assert_eq!(job.id, recording.id);
    assert_silent(&mut transcribe).await;

    // Same for the transcript; the core must be dispatched exactly once.
    let transcript = TranscriptionFinished {
        id: recording.id.clone(),
        text: "ask wled to turn on the light".to_string(),
    };
    harness
        .publish(&harness.topics().stt_finished(), &transcript)
        .await;
    harness
        .publish(&harness.topics().stt_finished(), &transcript)
        .await;
    let dispatch: RunIntent = recv(&mut run).await;
    assert_eq!(dispatch.id, recording.id);
    assert_silent(&mut run).await;
}

#[tokio::test]
async fn instant_wakeword_dispatches_without_recording() {
    let registry = IntentRegistry::new();
    let intent: Intent = serde_json::from_value(json!({
        "id": "lamp_toggle",
        "core_id": "wled",
        "wakewords": ["lamp"]
    }))
    .expect("intent parses");
    registry.insert_intent(intent);
    let harness = Harness::start(Arc::new(registry), Duration::from_secs(30)).await;

    let mut record = harness.listen(&harness.topics().record_speech()).await;
    let mut run = harness.listen(&harness.topics().core_run("wled")).await;
    let mut play = harness.listen(&harness.topics().play_file()).await;

    harness.wake("lamp").await;

    let cue: PlayAudio = recv(&mut play).await;
    assert_eq!(cue.audio, INSTANT_CUE);
    let dispatch: RunIntent = recv(&mut run).await;
    assert_eq!(dispatch.intent_id, "lamp_toggle");
    assert_silent(&mut record).await;

    // The retained instant-intent map advertises the bypass.
    let retained = harness
        .bus
        .retained_on(&harness.topics().instant_intents())
        .expect("instant intents retained");
    let map: InstantIntentMap = serde_json::from_slice(&retained).expect("map decodes");
    assert_eq!(map.get("lamp"), Some(&"lamp_toggle".to_string()));
}

#[tokio::test]
async fn unresolvable_transcript_fails_the_request() {
    let harness = Harness::start(wled_registry(), Duration::from_secs(30)).await;
    let mut record = harness.listen(&harness.topics().record_speech()).await;
    let mut play = harness.listen(&harness.topics().play_file()).await;
    let mut run = harness.listen(&harness.topics().core_run("wled")).await;

    harness.wake("hey chime").await;
    let _begin: PlayAudio = recv(&mut play).await;
    let recording: RecordSpeech = recv(&mut record).await;

    harness
        .publish(
            &harness.topics().recorder_finished(),
            &json!({"id": recording.id, "audio": "c3BlZWNo"}),
        )
        .await;
    let _stop: PlayAudio = recv(&mut play).await;

    harness
        .publish(
            &harness.topics().stt_finished(),
            &TranscriptionFinished {
                id: recording.id.clone(),
                text: "mumble mumble nothing registered".to_string(),
            },
        )
        .await;

    let error: PlayAudio = recv(&mut play).await;
    assert_eq!(error.audio, ERROR_CUE);
    assert_silent(&mut run).await;

    // And the pipeline is idle again.
    harness.wake("hey chime").await;
    let next: RecordSpeech = recv(&mut record).await;
    assert_ne!(next.id, recording.id);
}

#[tokio::test]
async fn stalled_stage_times_out_and_recovers() {
    let harness = Harness::start(wled_registry(), Duration::from_millis(200)).await;
    let mut record = harness.listen(&harness.topics().record_speech()).await;
    let mut play = harness.listen(&harness.topics().play_file()).await;

    harness.wake("hey chime").await;
    let _begin: PlayAudio = recv(&mut play).await;
    let first: RecordSpeech = recv(&mut record).await;

    // The recorder never answers; the deadline fires the error cue.
    let error: PlayAudio = recv(&mut play).await;
    assert_eq!(error.audio, ERROR_CUE);

    harness.wake("hey chime").await;
    let second: RecordSpeech = recv(&mut record).await;
    assert_ne!(second.id, first.id);
}

#[tokio::test]
async fn malformed_payloads_are_discarded_without_breaking_the_loop() {
    let harness = Harness::start(wled_registry(), Duration::from_secs(30)).await;
    let mut record = harness.listen(&harness.topics().record_speech()).await;

    harness
        .handle
        .publish_json(&harness.topics().wakeword_finished(), &json!({"bogus": 1}))
        .await
        .expect("publish");
    harness
        .publish(&harness.topics().core_intents().replace('+', "wled"), &json!(17))
        .await;

    harness.wake("hey chime").await;
    let _still_running: RecordSpeech = recv(&mut record).await;
}

#[tokio::test]
async fn intents_registered_over_the_bus_resolve() {
    let harness = Harness::start(Arc::new(IntentRegistry::new()), Duration::from_secs(30)).await;
    let mut record = harness.listen(&harness.topics().record_speech()).await;
    let mut run = harness.listen(&harness.topics().core_run("timer")).await;

    let intents_topic = harness.topics().core_intents().replace('+', "timer");
    harness
        .publish(
            &intents_topic,
            &json!({
                "id": "set_timer",
                "core_id": "timer",
                "keyphrases": [{"timer": ""}],
                "require_number": true
            }),
        )
        .await;

    // Registration races the wakeword only in this test; give the loop a
    // beat to ingest it before driving the pipeline.
    sleep(Duration::from_millis(50)).await;

    harness.wake("hey chime").await;
    let recording: RecordSpeech = recv(&mut record).await;
    harness
        .publish(
            &harness.topics().recorder_finished(),
            &json!({"id": recording.id, "audio": "c3BlZWNo"}),
        )
        .await;
    harness
        .publish(
            &harness.topics().stt_finished(),
            &TranscriptionFinished {
                id: recording.id.clone(),
                text: "set a timer for 5 minutes".to_string(),
            },
        )
        .await;

    let dispatch: RunIntent = recv(&mut run).await;
    assert_eq!(dispatch.intent_id, "set_timer");
    assert_eq!(dispatch.core_id, "timer");
}
