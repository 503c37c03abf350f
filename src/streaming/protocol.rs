//! Speech service JSON payloads
//!
//! Outbound bodies go in `speech.config`, `speech.context` and `telemetry`
//! text messages. Inbound bodies arrive on the `speech.*` and `turn.*` paths.
//!
//! # Protocol Overview
//!
//! 1. Send `speech.config` once per connection (client/OS/device description)
//! 2. Send `speech.context` and the RIFF header as the first `audio` message
//! 3. Stream `audio` messages; an empty one ends the audio
//! 4. Receive `turn.start`, `speech.startdetected`, `speech.hypothesis`,
//!    `speech.phrase`, `speech.enddetected`, `turn.end`

use serde::{Deserialize, Serialize};

use crate::audio::DeviceInfo;
use crate::recognizer::RecognitionMode;

pub const PATH_SPEECH_CONFIG: &str = "speech.config";
pub const PATH_SPEECH_CONTEXT: &str = "speech.context";
pub const PATH_AUDIO: &str = "audio";
pub const PATH_TELEMETRY: &str = "telemetry";

pub const PATH_TURN_START: &str = "turn.start";
pub const PATH_TURN_END: &str = "turn.end";
pub const PATH_SPEECH_START_DETECTED: &str = "speech.startdetected";
pub const PATH_SPEECH_END_DETECTED: &str = "speech.enddetected";
pub const PATH_SPEECH_HYPOTHESIS: &str = "speech.hypothesis";
pub const PATH_SPEECH_FRAGMENT: &str = "speech.fragment";
pub const PATH_SPEECH_PHRASE: &str = "speech.phrase";

/// Content type of the RIFF header message
pub const AUDIO_CONTENT_TYPE: &str = "audio/x-wav";

// ============================================================================
// Outbound payloads
// ============================================================================

/// Body of `speech.config`
#[derive(Debug, Clone, Serialize)]
pub struct SpeechServiceConfig {
    pub context: ConfigContext,
    pub recognition: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigContext {
    pub system: SystemInfo,
    pub os: OsInfo,
    pub audio: AudioInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub name: String,
    pub version: String,
    pub build: String,
    pub lang: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OsInfo {
    pub platform: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioInfo {
    pub source: DeviceInfo,
}

impl SpeechServiceConfig {
    pub fn new(mode: RecognitionMode, device: DeviceInfo) -> Self {
        Self {
            context: ConfigContext {
                system: SystemInfo {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    build: "Rust".to_string(),
                    lang: "Rust".to_string(),
                },
                os: OsInfo {
                    platform: std::env::consts::FAMILY.to_string(),
                    name: std::env::consts::OS.to_string(),
                    version: std::env::consts::ARCH.to_string(),
                },
                audio: AudioInfo { source: device },
            },
            recognition: mode.as_str().to_string(),
        }
    }
}

/// Body of `speech.context`
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeechContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dgi: Option<DynamicGrammar>,
}

/// Phrase hints
#[derive(Debug, Clone, Serialize)]
pub struct DynamicGrammar {
    #[serde(rename = "Groups")]
    pub groups: Vec<GrammarGroup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrammarGroup {
    #[serde(rename = "Type")]
    pub group_type: String,
    #[serde(rename = "Items")]
    pub items: Vec<GrammarItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrammarItem {
    #[serde(rename = "Text")]
    pub text: String,
}

impl SpeechContext {
    pub fn with_phrases(phrases: &[String]) -> Self {
        if phrases.is_empty() {
            return Self::default();
        }
        Self {
            dgi: Some(DynamicGrammar {
                groups: vec![GrammarGroup {
                    group_type: "Generic".to_string(),
                    items: phrases
                        .iter()
                        .map(|p| GrammarItem { text: p.clone() })
                        .collect(),
                }],
            }),
        }
    }
}

// ============================================================================
// Inbound payloads
// ============================================================================

/// Body of `speech.startdetected` / `speech.enddetected`
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechDetected {
    #[serde(rename = "Offset", default)]
    pub offset: u64,
}

/// Body of `speech.hypothesis` / `speech.fragment`
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechHypothesis {
    #[serde(rename = "Text", default)]
    pub text: String,
    #[serde(rename = "Offset", default)]
    pub offset: u64,
    #[serde(rename = "Duration", default)]
    pub duration: u64,
}

/// Final status of a phrase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RecognitionStatus {
    Success,
    NoMatch,
    InitialSilenceTimeout,
    BabbleTimeout,
    Error,
    EndOfDictation,
    TooManyRequests,
    BadRequest,
    Forbidden,
    /// Statuses this client does not know
    #[serde(other)]
    Unknown,
}

/// One alternative of a detailed phrase
#[derive(Debug, Clone, Deserialize)]
pub struct NBestEntry {
    #[serde(rename = "Confidence", default)]
    pub confidence: f64,
    #[serde(rename = "Lexical", default)]
    pub lexical: String,
    #[serde(rename = "ITN", default)]
    pub itn: String,
    #[serde(rename = "MaskedITN", default)]
    pub masked_itn: String,
    #[serde(rename = "Display", default)]
    pub display: String,
}

/// Body of `speech.phrase` (simple and detailed output formats)
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechPhrase {
    #[serde(rename = "RecognitionStatus")]
    pub recognition_status: RecognitionStatus,
    #[serde(rename = "DisplayText", default)]
    pub display_text: Option<String>,
    #[serde(rename = "Offset", default)]
    pub offset: u64,
    #[serde(rename = "Duration", default)]
    pub duration: u64,
    #[serde(rename = "NBest", default)]
    pub n_best: Vec<NBestEntry>,
}

impl SpeechPhrase {
    /// Display text, falling back to the best detailed alternative
    pub fn text(&self) -> String {
        match &self.display_text {
            Some(text) => text.clone(),
            None => self
                .n_best
                .first()
                .map(|best| best.display.clone())
                .unwrap_or_default(),
        }
    }
}

/// Body of `turn.start`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TurnStart {
    #[serde(default)]
    pub context: Option<TurnStartContext>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TurnStartContext {
    #[serde(rename = "serviceTag", default)]
    pub service_tag: Option<String>,
}
