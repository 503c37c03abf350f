use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SETTINGS_DIR_NAME: &str = "vokey-speech";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Result format requested from the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutputFormat {
    #[default]
    Simple,
    Detailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Service region used to build the endpoint, e.g. `westus`.
    pub region: String,

    /// Full `wss://` endpoint; overrides `region` when set.
    pub endpoint: Option<String>,

    /// Recognition language (BCP-47).
    pub language: String,

    pub output_format: OutputFormat,

    /// Retries after the first connection attempt; a connect makes at most N+1 attempts.
    pub max_retry_count: u32,

    /// Base delay between connection attempts, doubled per attempt. 0 retries immediately.
    pub connection_retry_delay_ms: u64,

    /// WebSocket handshake timeout.
    pub connection_timeout_ms: u64,

    /// Audio uploaded without pacing at the start of a turn.
    pub transmit_length_before_throttle_ms: u64,

    /// How long an interactive recognition waits for any service message.
    pub interactive_timeout_ms: u64,

    /// How long a continuous recognition waits for any service message.
    pub continuous_timeout_ms: u64,

    /// Send `telemetry` messages to the service at the end of each turn.
    pub telemetry_enabled: bool,

    /// Phrases sent as recognition hints in `speech.context`.
    pub phrase_hints: Vec<String>,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            region: "westus".to_string(),
            endpoint: None,
            language: "en-US".to_string(),
            output_format: OutputFormat::Simple,
            max_retry_count: 4,
            connection_retry_delay_ms: 0,
            connection_timeout_ms: 10_000,
            transmit_length_before_throttle_ms: 5_000,
            interactive_timeout_ms: 8_000,
            continuous_timeout_ms: 25_000,
            telemetry_enabled: true,
            phrase_hints: Vec::new(),
        }
    }
}

/// `<config dir>/vokey-speech/settings.json`
pub fn default_settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> RecognizerConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<RecognizerConfig>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                RecognizerConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => RecognizerConfig::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            RecognizerConfig::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &RecognizerConfig) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails when the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
