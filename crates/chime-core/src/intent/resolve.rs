//! The intent resolution engine.
//!
//! A pure function from (registered intents, registered collections, raw
//! text) to one resolved intent, no match, or an ambiguity. Matching is
//! deterministic and lexical: normalize, inline referenced collections,
//! apply phrase substitutions, then run the structural checks each intent
//! declares. When several intents pass, the most specific one wins; a shared
//! maximum is deliberately reported as ambiguous, because a wrong guess is
//! worse than no action.

use super::normalize::normalize;
use super::{Intent, IntentRegistry, KeyphraseGroup};
use tracing::{debug, warn};

/// A successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub intent_id: String,
    pub core_id: String,
    /// The normalized, substituted text the winning intent saw.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Match(MatchResult),
    NoMatch,
    /// Two or more intents passed with equal top specificity.
    Ambiguous,
}

/// Resolve `text` against every registered intent.
pub fn resolve(text: &str, registry: &IntentRegistry) -> Resolution {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return Resolution::NoMatch;
    }

    let mut candidates: Vec<(Intent, usize, String)> = Vec::new();

    for intent in registry.intents_snapshot() {
        let groups = inline_collections(&intent, registry);
        let text = substitute_phrases(&normalized, &groups);

        match evaluate(&intent, &groups, &text) {
            Some(specificity) => {
                debug!(intent = %intent.id, specificity, "intent passed all declared checks");
                candidates.push((intent, specificity, text));
            }
            None => debug!(intent = %intent.id, "intent failed"),
        }
    }

    if candidates.len() > 1 {
        let top = candidates.iter().map(|(_, s, _)| *s).max().unwrap_or(0);
        candidates.retain(|(_, s, _)| *s == top);
        if candidates.len() > 1 {
            return Resolution::Ambiguous;
        }
    }
    match candidates.pop() {
        Some((intent, _, text)) => Resolution::Match(MatchResult {
            intent_id: intent.id,
            core_id: intent.core_id,
            text,
        }),
        None => Resolution::NoMatch,
    }
}

/// Expand `$collectionId` tokens into the group that references them, on a
/// working copy. A reference next to a non-empty substitution forces that
/// substitution onto every inlined phrase; a reference with an empty one
/// keeps the collection's own substitutions. Unknown collections are logged
/// and dropped, degrading the group to its remaining phrases.
fn inline_collections(intent: &Intent, registry: &IntentRegistry) -> Vec<KeyphraseGroup> {
    let mut groups = intent.keyphrases.clone();
    for group in &mut groups {
        let references: Vec<(String, String)> = group
            .iter()
            .filter(|(phrase, _)| phrase.starts_with('$'))
            .map(|(phrase, sub)| (phrase.clone(), sub.clone()))
            .collect();

        for (token, substitution) in references {
            group.remove(&token);
            let collection_id = &token[1..];
            let Some(collection) = registry.get_collection(collection_id) else {
                warn!(
                    collection = collection_id,
                    intent = %intent.id,
                    "collection does not exist, but was called for"
                );
                continue;
            };
            for (phrase, collection_sub) in collection.keyphrases {
                let inlined_sub = if substitution.is_empty() {
                    collection_sub
                } else {
                    substitution.clone()
                };
                group.insert(phrase, inlined_sub);
            }
        }
    }
    groups
}

/// Replace every phrase that declares a substitution, collapsing synonyms to
/// one canonical token before the structural checks run.
fn substitute_phrases(text: &str, groups: &[KeyphraseGroup]) -> String {
    let mut text = text.to_string();
    for group in groups {
        for (phrase, substitution) in group {
            if !substitution.is_empty() {
                text = replace_phrase(&text, phrase, substitution);
            }
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Run every check the intent declares. `Some(specificity)` when all pass.
fn evaluate(intent: &Intent, groups: &[KeyphraseGroup], text: &str) -> Option<usize> {
    let mut specificity = 0;

    if !groups.is_empty() {
        let matched = keyphrase_groups_matched(groups, text);
        if matched != groups.len() {
            debug!(
                intent = %intent.id,
                "keyphrase check failed: {matched}/{} groups", groups.len()
            );
            return None;
        }
        specificity += matched;
    }

    if !intent.prefixes.is_empty() {
        if !prefix_matches(&intent.prefixes, text) {
            return None;
        }
        specificity += 1;
    }

    if !intent.suffixes.is_empty() {
        if !suffix_matches(&intent.suffixes, text) {
            return None;
        }
        specificity += 1;
    }

    if intent.require_number {
        if !contains_integer_token(text) {
            return None;
        }
        specificity += 1;
    }

    Some(specificity)
}

/// How many groups have at least one matching phrase. Phrases with a
/// substitution have already been rewritten into the text, so the check
/// looks for the substituted form.
fn keyphrase_groups_matched(groups: &[KeyphraseGroup], text: &str) -> usize {
    groups
        .iter()
        .filter(|group| {
            group.iter().any(|(phrase, substitution)| {
                let target = if substitution.is_empty() {
                    phrase
                } else {
                    substitution
                };
                phrase_in_text(text, target)
            })
        })
        .count()
}

fn prefix_matches(prefixes: &[String], text: &str) -> bool {
    prefixes.iter().any(|prefix| {
        if prefix.split(' ').nth(1).is_none() {
            text.split(' ').next() == Some(prefix.as_str())
        } else {
            text.starts_with(prefix.as_str())
        }
    })
}

fn suffix_matches(suffixes: &[String], text: &str) -> bool {
    suffixes.iter().any(|suffix| {
        if suffix.split(' ').nth(1).is_none() {
            text.split(' ').next_back() == Some(suffix.as_str())
        } else {
            text.ends_with(suffix.as_str())
        }
    })
}

fn contains_integer_token(text: &str) -> bool {
    text.split_whitespace()
        .any(|word| word.parse::<i64>().is_ok())
}

/// Single words only match whole tokens; "time" must not match inside
/// "times". Multi-word phrases match as substrings, since a whole phrase is
/// unlikely to appear inside another by accident.
fn phrase_in_text(text: &str, phrase: &str) -> bool {
    if phrase.is_empty() {
        return false;
    }
    if phrase.split(' ').nth(1).is_none() {
        text.split(' ').any(|word| word == phrase)
    } else {
        text.contains(phrase)
    }
}

/// Word-boundary-aware replacement, same single-vs-multi-word rule as
/// [`phrase_in_text`].
fn replace_phrase(text: &str, phrase: &str, replacement: &str) -> String {
    if phrase.split(' ').nth(1).is_none() {
        text.split(' ')
            .map(|word| if word == phrase { replacement } else { word })
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        text.replace(phrase, replacement)
    }
}
