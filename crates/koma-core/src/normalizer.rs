//! Cleanup of bubble text before it is handed to the speech engine.
//!
//! OCR'd manga lettering is usually upper case, broken over several lines,
//! hyphenated mid-word and full of full-width punctuation. Speech engines
//! read that badly (all-caps words get spelled out letter by letter), so every
//! bubble goes through this pass first. Rules are configurable through the
//! `[normalization]` table of `conf/normalizer.toml`.

use crate::model::Bubble;
use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use unicode_normalization::UnicodeNormalization;

const DEFAULT_NORMALIZER_PATH: &str = "conf/normalizer.toml";

static RE_HYPHEN_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\p{L})-\s*\n\s*(\p{L})").unwrap());
static RE_ANY_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_ELLIPSIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.(?:\s*\.)+|…+").unwrap());
static RE_SPACE_BEFORE_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+([,.;:!?])").unwrap());
static RE_REPEATED_MARKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[!?]{2,}").unwrap());
static RE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\p{L}[\p{L}']*").unwrap());

#[derive(Debug, Clone, Default)]
pub struct TextNormalizer {
    config: NormalizerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
struct NormalizerFile {
    normalization: NormalizerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
struct NormalizerConfig {
    enabled: bool,
    unicode_fold: bool,
    join_hyphenated_breaks: bool,
    collapse_whitespace: bool,
    soften_all_caps: bool,
    keep_caps: BTreeSet<String>,
    ellipsis: String,
    squash_repeated_marks: bool,
    remove_space_before_punctuation: bool,
    min_chars: usize,
    require_alphanumeric: bool,
    replacements: BTreeMap<String, String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unicode_fold: true,
            join_hyphenated_breaks: true,
            collapse_whitespace: true,
            soften_all_caps: true,
            keep_caps: ["OK", "TV", "DNA", "UFO", "CEO", "ID"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            ellipsis: "...".to_string(),
            squash_repeated_marks: true,
            remove_space_before_punctuation: true,
            min_chars: 1,
            require_alphanumeric: true,
            replacements: BTreeMap::new(),
        }
    }
}

impl TextNormalizer {
    pub fn load_default() -> Self {
        Self::load(Path::new(DEFAULT_NORMALIZER_PATH))
    }

    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), "Invalid normalizer config TOML: {err}");
                Self::default()
            }),
            Err(err) => {
                tracing::debug!(
                    path = %path.display(),
                    "Falling back to default normalizer config: {err}"
                );
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        let file = toml::from_str::<NormalizerFile>(contents)?;
        Ok(Self {
            config: file.normalization,
        })
    }

    /// One utterance per bubble, index-aligned with `bubbles`. Bubbles with
    /// nothing speakable map to an empty string.
    pub fn plan_utterances(&self, bubbles: &[Bubble]) -> Vec<String> {
        bubbles
            .iter()
            .map(|bubble| self.normalize(&bubble.text).unwrap_or_default())
            .collect()
    }

    /// Speakable form of `text`, or `None` when nothing worth saying is left.
    pub fn normalize(&self, text: &str) -> Option<String> {
        if !self.config.enabled {
            let trimmed = text.trim();
            return (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        let cleaned = self.clean(text);
        self.finalize(&cleaned)
    }

    fn clean(&self, input: &str) -> String {
        let mut text: String = if self.config.unicode_fold {
            input.nfkc().collect()
        } else {
            input.to_string()
        };

        if self.config.join_hyphenated_breaks {
            text = RE_HYPHEN_BREAK.replace_all(&text, "$1$2").to_string();
        }

        if self.config.collapse_whitespace {
            text = RE_ANY_WS.replace_all(&text, " ").to_string();
        }

        if !self.config.replacements.is_empty() {
            let mut entries: Vec<_> = self.config.replacements.iter().collect();
            entries.sort_by_key(|(from, _)| Reverse(from.len()));
            for (from, to) in entries {
                if !from.is_empty() {
                    text = text.replace(from.as_str(), to.as_str());
                }
            }
        }

        text = RE_ELLIPSIS
            .replace_all(&text, NoExpand(&self.config.ellipsis))
            .to_string();

        if self.config.squash_repeated_marks {
            text = RE_REPEATED_MARKS
                .replace_all(&text, |caps: &regex::Captures| {
                    if caps[0].contains('?') {
                        "?"
                    } else {
                        "!"
                    }
                })
                .to_string();
        }

        if self.config.soften_all_caps && is_shouting(&text) {
            text = soften_caps(&text, &self.config.keep_caps);
        }

        if self.config.remove_space_before_punctuation {
            text = RE_SPACE_BEFORE_PUNCT.replace_all(&text, "$1").to_string();
        }

        text.trim().to_string()
    }

    fn finalize(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        if self.config.require_alphanumeric && !trimmed.chars().any(char::is_alphanumeric) {
            return None;
        }
        if trimmed.chars().count() < self.config.min_chars.max(1) {
            return None;
        }
        Some(trimmed.to_string())
    }
}

/// True when most cased letters are upper case.
fn is_shouting(text: &str) -> bool {
    let (upper, lower) = text.chars().fold((0usize, 0usize), |(u, l), ch| {
        if ch.is_uppercase() {
            (u + 1, l)
        } else if ch.is_lowercase() {
            (u, l + 1)
        } else {
            (u, l)
        }
    });
    upper >= 2 && upper > lower * 3
}

/// Lower-case every word, then restore sentence starts, the pronoun "I" and
/// any word listed in `keep_caps`.
fn soften_caps(text: &str, keep_caps: &BTreeSet<String>) -> String {
    let lowered = RE_WORD.replace_all(text, |caps: &regex::Captures| {
        let word = &caps[0];
        if keep_caps.contains(word) {
            return word.to_string();
        }
        let lower = word.to_lowercase();
        if lower == "i" || lower.starts_with("i'") {
            let mut chars = lower.chars();
            chars.next();
            return format!("I{}", chars.as_str());
        }
        lower
    });

    let mut out = String::with_capacity(lowered.len());
    let mut sentence_start = true;
    for ch in lowered.chars() {
        if sentence_start && ch.is_alphabetic() {
            out.extend(ch.to_uppercase());
            sentence_start = false;
            continue;
        }
        if matches!(ch, '.' | '!' | '?') {
            sentence_start = true;
        } else if !ch.is_whitespace() && !matches!(ch, '"' | '\'' | '(' | '«') {
            sentence_start = false;
        }
        out.push(ch);
    }
    out
}
