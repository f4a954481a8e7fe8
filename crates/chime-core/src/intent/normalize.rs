//! Text normalization applied before any intent matching.

use once_cell::sync::Lazy;
use regex::Regex;

/// Symbols that speech-to-text sometimes emits literally, spelled out the way
/// a user would say them. None of the replacements contains another symbol
/// from this table, so application order does not matter.
const SYMBOL_WORDS: &[(&str, &str)] = &[
    ("&", " and "),
    ("+", " plus "),
    ("*", " times "),
    ("-", " minus "),
    ("/", " over "),
    ("%", " percent "),
];

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9 ]+").expect("static regex"));

/// Lowercase, spell out known symbols, strip everything else that is not
/// alphanumeric, and collapse whitespace runs. Idempotent.
pub fn normalize(text: &str) -> String {
    let mut text = text.to_lowercase();
    for (symbol, word) in SYMBOL_WORDS {
        if text.contains(symbol) {
            text = text.replace(symbol, word);
        }
    }
    let text = NON_ALNUM.replace_all(&text, "");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
