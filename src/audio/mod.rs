//! Audio input for the recognizer
//!
//! An [`AudioSource`] hands out [`AudioStreamNode`]s, one per recognition turn.
//! The recognizer wraps each node in a [`ReplayableAudioNode`] so that audio the
//! service has not yet confirmed can be re-sent after a reconnect.
//!
//! ```text
//! AudioSource ──attach(node_id)──▶ AudioStreamNode ──▶ ReplayableAudioNode ──▶ upload loop
//! ```

pub mod format;
pub mod replayable;
pub mod sources;

use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use format::AudioStreamFormat;
pub use replayable::{BufferEntry, ReplayableAudioNode};
pub use sources::{PushAudioSource, PushAudioWriter, WavFileAudioSource};

/// Errors that can occur while producing audio
#[derive(Debug, Clone, thiserror::Error)]
pub enum AudioError {
    #[error("Failed to open audio file: {0}")]
    FileOpen(String),
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("Audio source already attached to node {0}")]
    AlreadyAttached(String),
    #[error("Audio node {0} is detached")]
    Detached(String),
    #[error("Failed to read audio: {0}")]
    Read(String),
}

/// A chunk of audio bytes handed out by a stream node
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Raw PCM bytes (empty for the end-of-stream marker)
    pub data: Vec<u8>,
    /// Monotonic timestamp when the chunk was first produced
    pub captured_at: Instant,
    /// True once the source has no more audio
    pub is_end: bool,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            captured_at: Instant::now(),
            is_end: false,
        }
    }

    /// The terminal chunk of a stream
    pub fn end() -> Self {
        Self {
            data: Vec::new(),
            captured_at: Instant::now(),
            is_end: true,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Kind of device behind a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DeviceType {
    Microphones,
    File,
    Stream,
}

/// Device description sent to the service inside `speech.context`
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(rename = "samplerate")]
    pub sample_rate: u32,
    #[serde(rename = "bitspersample")]
    pub bits_per_sample: u16,
    #[serde(rename = "channelcount")]
    pub channels: u16,
    pub connectivity: String,
    pub manufacturer: String,
    pub model: String,
}

impl DeviceInfo {
    pub fn new(device_type: DeviceType, format: &AudioStreamFormat) -> Self {
        Self {
            device_type,
            sample_rate: format.samples_per_sec,
            bits_per_sample: format.bits_per_sample,
            channels: format.channels,
            connectivity: "Unknown".to_string(),
            manufacturer: "Speech SDK".to_string(),
            model: match device_type {
                DeviceType::Microphones => "Microphone".to_string(),
                DeviceType::File => "File".to_string(),
                DeviceType::Stream => "Stream".to_string(),
            },
        }
    }

    /// Live audio never signals end-of-stream by itself
    pub fn is_live(&self) -> bool {
        self.device_type == DeviceType::Microphones
    }
}

/// Lifecycle events published by audio sources
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSourceEvent {
    NodeAttached { node_id: String },
    NodeDetached { node_id: String },
    SourceOff,
}

/// A single reader attached to an [`AudioSource`]
#[async_trait]
pub trait AudioStreamNode: Send + Sync {
    fn id(&self) -> &str;

    /// Next chunk, or a chunk with `is_end` once the stream is exhausted or detached
    async fn read(&self) -> Result<AudioChunk, AudioError>;

    /// Stop producing audio; pending and later reads resolve to end-of-stream
    async fn detach(&self) -> Result<(), AudioError>;
}

/// Producer of audio for recognition turns
#[async_trait]
pub trait AudioSource: Send + Sync {
    fn id(&self) -> &str;

    async fn attach(&self, node_id: &str) -> Result<Box<dyn AudioStreamNode>, AudioError>;

    fn format(&self) -> AudioStreamFormat;

    fn device_info(&self) -> DeviceInfo;

    /// Subscribe to lifecycle events, if the source publishes any
    fn events(&self) -> Option<broadcast::Receiver<AudioSourceEvent>> {
        None
    }

    /// Release the underlying device
    async fn turn_off(&self) -> Result<(), AudioError> {
        Ok(())
    }
}
