//! Input text normalization applied to a row before it is sent to a model.
//!
//! A [`TextPipeline`] is an ordered list of [`Stage`]s. Presets mirror the
//! options offered by the batch form; `custom` builds the list from individual
//! toggles.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::core::batch::types::cell_text;
use crate::core::config::PreprocessConfig;

static TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\d+::\d+::\d+-\d+::\d+::\d+\]").unwrap());
static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static DEFAULT_MARKERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[DATA\]|<DATA>|\{DATA\}").unwrap());

// Turn headers. The timestamped form allows one or two colons between fields.
static TIMED_TURN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([\x{4e00}-\x{9fa5}]+)\[\d+:{1,2}\d+:{1,2}\d+-\d+:{1,2}\d+:{1,2}\d+\]:").unwrap()
});
static PLAIN_TURN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\x{4e00}-\x{9fa5}])([\x{4e00}-\x{9fa5}]{1,5}):").unwrap()
});
static QUESTION_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\?+").unwrap());
static QUESTION_GAP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\?\s+").unwrap());

const ROLE_KEY: &str = "角色";
const CONTENT_KEY: &str = "内容";

pub fn strip_timestamps(text: &str) -> String {
    TIMESTAMP.replace_all(text, "").into_owned()
}

pub fn strip_markup(text: &str) -> String {
    MARKUP.replace_all(text, "").into_owned()
}

pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

/// Remove the built-in `[DATA]`/`<DATA>`/`{DATA}` markers and then every extra pattern.
pub fn strip_markers(text: &str, extra: &[Regex]) -> String {
    let mut out = DEFAULT_MARKERS.replace_all(text, "").into_owned();
    for pattern in extra {
        out = pattern.replace_all(&out, "").into_owned();
    }
    out
}

/// Compile user supplied marker patterns. Invalid patterns are logged and skipped.
pub fn compile_markers(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Skipping invalid marker pattern {:?}: {}", p, e);
                None
            }
        })
        .collect()
}

/// Ordered speaker alias table (raw speaker label -> canonical name).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct SpeakerMap(Vec<(String, String)>);

impl SpeakerMap {
    pub fn new<K: Into<String>, V: Into<String>>(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// The aliases the batch form starts with.
    pub fn standard() -> Self {
        Self::new([
            ("司机", "司机"),
            ("用户", "用户"),
            ("乘客", "用户"),
            ("客人", "用户"),
            ("系统", "系统"),
        ])
    }

    /// Map a raw speaker label to its canonical name.
    ///
    /// Exact key match wins; otherwise the first key that *ends with* the label
    /// is used, so an abbreviated `机` resolves through `司机`. Unknown labels
    /// pass through unchanged.
    pub fn resolve<'a>(&'a self, speaker: &'a str) -> &'a str {
        if speaker.is_empty() {
            return speaker;
        }
        if let Some((_, canonical)) = self
            .0
            .iter()
            .find(|(key, canonical)| key == speaker && !canonical.is_empty())
        {
            return canonical;
        }
        self.0
            .iter()
            .find(|(key, _)| key.ends_with(speaker))
            .map(|(_, canonical)| canonical.as_str())
            .unwrap_or(speaker)
    }
}

impl From<Map<String, Value>> for SpeakerMap {
    fn from(map: Map<String, Value>) -> Self {
        Self(map.into_iter().map(|(k, v)| (k, cell_text(&v))).collect())
    }
}

impl From<SpeakerMap> for Map<String, Value> {
    fn from(map: SpeakerMap) -> Self {
        map.0
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect()
    }
}

fn clean_utterance(raw: &str) -> String {
    let no_backspace: String = raw.chars().filter(|c| *c != '\u{8}').collect();
    let spaced = QUESTION_GAP.replace_all(&no_backspace, "? ");
    QUESTION_RUN.replace_all(&spaced, "?").trim().to_string()
}

/// Split `text` into `(speaker, utterance)` turns using `header`, whose first
/// capture group is the speaker. An utterance runs until the next header.
fn split_turns(text: &str, header: &Regex) -> Vec<(String, String)> {
    let heads: Vec<(String, usize, usize)> = header
        .captures_iter(text)
        .filter_map(|cap| {
            let speaker = cap.get(1)?;
            let whole = cap.get(0)?;
            Some((speaker.as_str().to_string(), speaker.start(), whole.end()))
        })
        .collect();

    heads
        .iter()
        .enumerate()
        .map(|(i, (speaker, _, body_start))| {
            let body_end = heads.get(i + 1).map(|(_, s, _)| *s).unwrap_or(text.len());
            (speaker.trim().to_string(), text[*body_start..body_end].to_string())
        })
        .collect()
}

/// Re-apply alias mapping to text that is already a JSON array of
/// `{"角色": .., "内容": ..}` records. Returns `None` for any other shape.
fn remap_dialogue_array(text: &str, speakers: &SpeakerMap) -> Option<String> {
    let parsed: Value = serde_json::from_str(text).ok()?;
    let items = parsed.as_array()?;
    let first_has_role = items
        .first()
        .and_then(|item| item.get(ROLE_KEY))
        .and_then(Value::as_str)
        .is_some_and(|role| !role.is_empty());
    if !first_has_role || !items.iter().all(Value::is_object) {
        return None;
    }

    let remapped: Vec<Value> = items
        .iter()
        .map(|item| {
            let mut record = item.as_object().cloned().unwrap_or_default();
            if let Some(Value::String(role)) = record.get(ROLE_KEY) {
                let mapped = speakers.resolve(role).to_string();
                record.insert(ROLE_KEY.to_string(), Value::String(mapped));
            }
            Value::Object(record)
        })
        .collect();
    serde_json::to_string_pretty(&remapped).ok()
}

/// Turn a raw two-party transcript into a JSON array of role/utterance records.
///
/// Turns with a bracketed timestamp (`驾驶员[0::0::0-0::9::310]:`) take precedence;
/// without any, plain `名字:` headers of one to five CJK characters are used.
/// Text that is already such an array only has its speakers remapped, and
/// text without any recognizable turn is returned unchanged.
pub fn rewrite_dialogue(text: &str, speakers: &SpeakerMap) -> String {
    if let Some(remapped) = remap_dialogue_array(text, speakers) {
        return remapped;
    }

    let mut turns = split_turns(text, &TIMED_TURN);
    if turns.is_empty() {
        turns = split_turns(text, &PLAIN_TURN);
    }
    if turns.is_empty() {
        return text.to_string();
    }

    let records: Vec<Value> = turns
        .into_iter()
        .map(|(speaker, utterance)| {
            let mut record = Map::new();
            record.insert(
                ROLE_KEY.to_string(),
                Value::String(speakers.resolve(&speaker).to_string()),
            );
            record.insert(
                CONTENT_KEY.to_string(),
                Value::String(clean_utterance(&utterance)),
            );
            Value::Object(record)
        })
        .collect();
    serde_json::to_string_pretty(&records).unwrap_or_else(|_| text.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Basic,
    Complete,
    Conversation,
    #[default]
    Custom,
}

#[derive(Debug, Clone)]
pub enum Stage {
    StripTimestamps,
    StripMarkup,
    CollapseWhitespace,
    StripMarkers(Vec<Regex>),
    RewriteDialogue(SpeakerMap),
}

impl Stage {
    pub fn apply(&self, text: &str) -> String {
        match self {
            Stage::StripTimestamps => strip_timestamps(text),
            Stage::StripMarkup => strip_markup(text),
            Stage::CollapseWhitespace => collapse_whitespace(text),
            Stage::StripMarkers(extra) => strip_markers(text, extra),
            Stage::RewriteDialogue(speakers) => rewrite_dialogue(text, speakers),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TextPipeline {
    stages: Vec<Stage>,
}

impl TextPipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn preset(preset: Preset, config: &PreprocessConfig) -> Self {
        let stages = match preset {
            Preset::Basic => vec![Stage::StripTimestamps, Stage::CollapseWhitespace],
            Preset::Complete => vec![
                Stage::StripTimestamps,
                Stage::StripMarkup,
                Stage::CollapseWhitespace,
            ],
            Preset::Conversation => vec![Stage::RewriteDialogue(config.speaker_map.clone())],
            Preset::Custom => {
                let mut stages = Vec::new();
                if config.remove_timestamps {
                    stages.push(Stage::StripTimestamps);
                }
                if config.remove_html_tags {
                    stages.push(Stage::StripMarkup);
                }
                if config.normalize_whitespace {
                    stages.push(Stage::CollapseWhitespace);
                }
                if config.remove_data_markers && !config.custom_patterns.is_empty() {
                    stages.push(Stage::StripMarkers(compile_markers(&config.custom_patterns)));
                }
                if config.enhance_roles {
                    stages.push(Stage::RewriteDialogue(config.speaker_map.clone()));
                }
                stages
            }
        };
        Self { stages }
    }

    /// Pipeline for a job, or `None` when preprocessing is switched off.
    pub fn from_config(config: &PreprocessConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self::preset(config.preset, config))
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn apply(&self, text: &str) -> String {
        self.stages
            .iter()
            .fold(text.to_string(), |acc, stage| stage.apply(&acc))
    }
}
