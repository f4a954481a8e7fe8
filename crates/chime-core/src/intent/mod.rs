//! Intents, Collections, and the registries that hold them.
//!
//! Cores publish their Intents and Collections over the bus; the registries
//! grow for the lifetime of the process and are never explicitly emptied.
//! Ingestion and resolution can run concurrently, so the maps are DashMaps
//! behind a shared handle rather than module-level state.

pub mod normalize;
pub mod resolve;

pub use normalize::normalize;
pub use resolve::{resolve, MatchResult, Resolution};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One keyphrase group: phrase -> substitution ("" = keep the phrase as-is).
/// Satisfying a group takes a match on any one of its phrases; an intent's
/// groups are all required. A phrase key of the form `$collectionId` pulls a
/// whole [`Collection`] into the group at match time.
pub type KeyphraseGroup = BTreeMap<String, String>;

/// A registered pattern mapped to a target Core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    pub core_id: String,
    #[serde(default)]
    pub keyphrases: Vec<KeyphraseGroup>,
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub suffixes: Vec<String>,
    /// When set, the text must contain a bare integer token.
    #[serde(default)]
    pub require_number: bool,
    /// Dedicated wakewords that trigger this intent directly, skipping
    /// recording and transcription.
    #[serde(default)]
    pub wakewords: Vec<String>,
}

/// A reusable, named bundle of keyphrase substitutions, inlined into intents
/// that reference it as `$id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    #[serde(default)]
    pub keyphrases: BTreeMap<String, String>,
    /// Opaque per-phrase metadata (device identifiers and the like), passed
    /// through untouched for the owning Core's benefit.
    #[serde(default)]
    pub variables: Option<serde_json::Value>,
}

/// Shared, concurrency-safe storage for everything the resolver needs.
#[derive(Debug, Default)]
pub struct IntentRegistry {
    intents: DashMap<String, Intent>,
    collections: DashMap<String, Collection>,
    /// wakeword -> intent id, for the instant-intent bypass.
    instant: DashMap<String, String>,
}

impl IntentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or overwrite an intent. Re-registration refreshes any
    /// instant-intent wakewords it declares.
    pub fn insert_intent(&self, intent: Intent) {
        for wakeword in &intent.wakewords {
            self.instant.insert(wakeword.clone(), intent.id.clone());
        }
        self.intents.insert(intent.id.clone(), intent);
    }

    pub fn insert_collection(&self, collection: Collection) {
        self.collections.insert(collection.id.clone(), collection);
    }

    pub fn get_collection(&self, id: &str) -> Option<Collection> {
        self.collections.get(id).map(|c| c.clone())
    }

    /// The intent an instant wakeword maps to, if any.
    pub fn instant_intent(&self, wakeword: &str) -> Option<(String, String)> {
        let intent_id = self.instant.get(wakeword)?.clone();
        let core_id = self.intents.get(&intent_id)?.core_id.clone();
        Some((intent_id, core_id))
    }

    /// Current wakeword -> intent id mapping, for the retained registry topic.
    pub fn instant_intent_map(&self) -> crate::message::InstantIntentMap {
        self.instant
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Snapshot of all intents. The resolver works on copies so stored
    /// registrations are never mutated by collection inlining.
    pub fn intents_snapshot(&self) -> Vec<Intent> {
        let mut intents: Vec<Intent> = self.intents.iter().map(|e| e.value().clone()).collect();
        intents.sort_by(|a, b| a.id.cmp(&b.id));
        intents
    }

    pub fn intent_count(&self) -> usize {
        self.intents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(id: &str, wakewords: &[&str]) -> Intent {
        Intent {
            id: id.to_string(),
            core_id: "core".to_string(),
            keyphrases: Vec::new(),
            prefixes: Vec::new(),
            suffixes: Vec::new(),
            require_number: false,
            wakewords: wakewords.iter().map(|w| w.to_string()).collect(),
        }
    }

    #[test]
    fn reregistration_overwrites() {
        let registry = IntentRegistry::new();
        registry.insert_intent(intent("a", &[]));
        registry.insert_intent(intent("a", &[]));
        assert_eq!(registry.intent_count(), 1);
    }

    #[test]
    fn wakewords_populate_the_instant_map() {
        let registry = IntentRegistry::new();
        registry.insert_intent(intent("lamp_toggle", &["lamp"]));
        let (intent_id, core_id) = registry.instant_intent("lamp").unwrap();
        assert_eq!(intent_id, "lamp_toggle");
        assert_eq!(core_id, "core");
        assert!(registry.instant_intent("other").is_none());
    }

    #[test]
    fn intent_wire_schema_defaults() {
        let intent: Intent = serde_json::from_str(
            r#"{"id": "x", "core_id": "y", "keyphrases": [{"time": "1"}]}"#,
        )
        .unwrap();
        assert!(!intent.require_number);
        assert!(intent.prefixes.is_empty());
        assert_eq!(intent.keyphrases[0]["time"], "1");
    }
}
