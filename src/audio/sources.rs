//! Concrete audio sources: WAV files and push streams
//!
//! Both sources hand out nodes whose `read()` never blocks the runtime and
//! resolves to an end-of-stream chunk once the audio is exhausted or the node
//! is detached.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::format::AudioStreamFormat;
use super::{AudioChunk, AudioError, AudioSource, AudioSourceEvent, AudioStreamNode, DeviceInfo, DeviceType};

/// Chunk duration handed out by file sources
const FILE_CHUNK_MS: u32 = 100;

fn new_source_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// ============================================================================
// WAV file source
// ============================================================================

/// Serves the PCM payload of a WAV file in 100ms chunks
pub struct WavFileAudioSource {
    id: String,
    format: AudioStreamFormat,
    data: Arc<Vec<u8>>,
    chunk_bytes: usize,
    events: broadcast::Sender<AudioSourceEvent>,
}

impl WavFileAudioSource {
    /// Read the whole file into memory
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AudioError> {
        let path = path.as_ref();
        let mut reader =
            hound::WavReader::open(path).map_err(|e| AudioError::FileOpen(format!("{:?}: {}", path, e)))?;
        let format = AudioStreamFormat::from_wav_spec(&reader.spec())?;

        let data: Vec<u8> = if format.bits_per_sample == 16 {
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| v.to_le_bytes()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AudioError::Read(e.to_string()))?
                .into_iter()
                .flatten()
                .collect()
        } else {
            // hound signs 8-bit samples; the wire format is unsigned
            reader
                .samples::<i8>()
                .map(|s| s.map(|v| (v as i16 + 128) as u8))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AudioError::Read(e.to_string()))?
        };

        log::info!(
            "WavFileAudioSource: loaded {:?} ({} bytes, {}Hz, {} bit, {} ch)",
            path,
            data.len(),
            format.samples_per_sec,
            format.bits_per_sample,
            format.channels
        );

        Ok(Self::from_pcm(format, data))
    }

    /// Wrap raw PCM bytes already in memory
    pub fn from_pcm(format: AudioStreamFormat, data: Vec<u8>) -> Self {
        let chunk_bytes = format.bytes_for_duration_ms(FILE_CHUNK_MS).max(1);
        let (events, _) = broadcast::channel(16);
        Self {
            id: new_source_id(),
            format,
            data: Arc::new(data),
            chunk_bytes,
            events,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

#[async_trait]
impl AudioSource for WavFileAudioSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn attach(&self, node_id: &str) -> Result<Box<dyn AudioStreamNode>, AudioError> {
        let _ = self.events.send(AudioSourceEvent::NodeAttached {
            node_id: node_id.to_string(),
        });
        Ok(Box::new(FileStreamNode {
            id: node_id.to_string(),
            data: self.data.clone(),
            position: Mutex::new(0),
            chunk_bytes: self.chunk_bytes,
            detached: AtomicBool::new(false),
            events: self.events.clone(),
        }))
    }

    fn format(&self) -> AudioStreamFormat {
        self.format
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo::new(DeviceType::File, &self.format)
    }

    fn events(&self) -> Option<broadcast::Receiver<AudioSourceEvent>> {
        Some(self.events.subscribe())
    }
}

struct FileStreamNode {
    id: String,
    data: Arc<Vec<u8>>,
    position: Mutex<usize>,
    chunk_bytes: usize,
    detached: AtomicBool,
    events: broadcast::Sender<AudioSourceEvent>,
}

#[async_trait]
impl AudioStreamNode for FileStreamNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read(&self) -> Result<AudioChunk, AudioError> {
        if self.detached.load(Ordering::SeqCst) {
            return Ok(AudioChunk::end());
        }

        let mut position = self.position.lock().unwrap_or_else(|e| e.into_inner());
        if *position >= self.data.len() {
            return Ok(AudioChunk::end());
        }

        let end = (*position + self.chunk_bytes).min(self.data.len());
        let chunk = AudioChunk::new(self.data[*position..end].to_vec());
        *position = end;
        Ok(chunk)
    }

    async fn detach(&self) -> Result<(), AudioError> {
        if !self.detached.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(AudioSourceEvent::NodeDetached {
                node_id: self.id.clone(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Push stream source
// ============================================================================

/// Write end of a [`PushAudioSource`]
///
/// Dropping (or closing) the writer ends the stream.
#[derive(Clone)]
pub struct PushAudioWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl PushAudioWriter {
    pub fn write(&self, data: Vec<u8>) -> Result<(), AudioError> {
        self.tx
            .send(data)
            .map_err(|_| AudioError::Read("push stream reader is gone".to_string()))
    }

    pub fn close(self) {
        drop(self.tx);
    }
}

/// Audio source fed by the application through a [`PushAudioWriter`]
///
/// Only one node may be attached at a time; a detached node hands the stream
/// back so the next recognition continues where the previous one stopped.
pub struct PushAudioSource {
    id: String,
    format: AudioStreamFormat,
    device_type: DeviceType,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    attached: Arc<Mutex<Option<String>>>,
    events: broadcast::Sender<AudioSourceEvent>,
}

impl PushAudioSource {
    pub fn new(format: AudioStreamFormat) -> (Self, PushAudioWriter) {
        Self::with_device_type(format, DeviceType::Stream)
    }

    /// Use `DeviceType::Microphones` to treat the pushed audio as live capture
    pub fn with_device_type(
        format: AudioStreamFormat,
        device_type: DeviceType,
    ) -> (Self, PushAudioWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        (
            Self {
                id: new_source_id(),
                format,
                device_type,
                receiver: Arc::new(tokio::sync::Mutex::new(rx)),
                attached: Arc::new(Mutex::new(None)),
                events,
            },
            PushAudioWriter { tx },
        )
    }
}

#[async_trait]
impl AudioSource for PushAudioSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn attach(&self, node_id: &str) -> Result<Box<dyn AudioStreamNode>, AudioError> {
        {
            let mut attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = attached.as_ref() {
                return Err(AudioError::AlreadyAttached(existing.clone()));
            }
            *attached = Some(node_id.to_string());
        }

        let _ = self.events.send(AudioSourceEvent::NodeAttached {
            node_id: node_id.to_string(),
        });

        Ok(Box::new(PushStreamNode {
            id: node_id.to_string(),
            receiver: self.receiver.clone(),
            attached: self.attached.clone(),
            cancel: CancellationToken::new(),
            events: self.events.clone(),
        }))
    }

    fn format(&self) -> AudioStreamFormat {
        self.format
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo::new(self.device_type, &self.format)
    }

    fn events(&self) -> Option<broadcast::Receiver<AudioSourceEvent>> {
        Some(self.events.subscribe())
    }

    async fn turn_off(&self) -> Result<(), AudioError> {
        let _ = self.events.send(AudioSourceEvent::SourceOff);
        Ok(())
    }
}

struct PushStreamNode {
    id: String,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    attached: Arc<Mutex<Option<String>>>,
    cancel: CancellationToken,
    events: broadcast::Sender<AudioSourceEvent>,
}

#[async_trait]
impl AudioStreamNode for PushStreamNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read(&self) -> Result<AudioChunk, AudioError> {
        if self.cancel.is_cancelled() {
            return Ok(AudioChunk::end());
        }

        let mut rx = self.receiver.lock().await;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(AudioChunk::end()),
                data = rx.recv() => match data {
                    // Empty writes carry no audio
                    Some(data) if data.is_empty() => continue,
                    Some(data) => return Ok(AudioChunk::new(data)),
                    None => return Ok(AudioChunk::end()),
                },
            }
        }
    }

    async fn detach(&self) -> Result<(), AudioError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.cancel.cancel();

        let mut attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
        if attached.as_deref() == Some(self.id.as_str()) {
            *attached = None;
        }
        let _ = self.events.send(AudioSourceEvent::NodeDetached {
            node_id: self.id.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{SampleFormat, WavSpec, WavWriter};

    fn write_test_wav(path: &Path, samples: &[i16]) {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[tokio::test]
    async fn test_wav_file_source_chunks_and_ends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        // 250ms at 16kHz
        let samples: Vec<i16> = (0..4000).map(|i| (i % 100) as i16).collect();
        write_test_wav(&path, &samples);

        let source = WavFileAudioSource::open(&path).unwrap();
        assert_eq!(source.byte_len(), 8000);
        assert_eq!(source.format().avg_bytes_per_sec(), 32000);

        let node = source.attach("node-1").await.unwrap();
        let first = node.read().await.unwrap();
        assert_eq!(first.len(), 3200);
        assert_eq!(&first.data[0..4], &[0, 0, 1, 0]);

        let second = node.read().await.unwrap();
        assert_eq!(second.len(), 3200);
        let third = node.read().await.unwrap();
        assert_eq!(third.len(), 1600);
        assert!(node.read().await.unwrap().is_end);
    }

    #[tokio::test]
    async fn test_missing_wav_file_fails() {
        let result = WavFileAudioSource::open("/tmp/this_file_does_not_exist_12345.wav");
        assert!(matches!(result, Err(AudioError::FileOpen(_))));
    }

    #[tokio::test]
    async fn test_file_node_detach_ends_stream() {
        let source = WavFileAudioSource::from_pcm(AudioStreamFormat::default(), vec![0u8; 10000]);
        let node = source.attach("node-1").await.unwrap();
        node.detach().await.unwrap();
        assert!(node.read().await.unwrap().is_end);
    }

    #[tokio::test]
    async fn test_push_source_delivers_writes_in_order() {
        let (source, writer) = PushAudioSource::new(AudioStreamFormat::default());
        let node = source.attach("node-1").await.unwrap();

        writer.write(vec![1, 2]).unwrap();
        writer.write(Vec::new()).unwrap();
        writer.write(vec![3, 4]).unwrap();
        writer.close();

        assert_eq!(node.read().await.unwrap().data, vec![1, 2]);
        assert_eq!(node.read().await.unwrap().data, vec![3, 4]);
        assert!(node.read().await.unwrap().is_end);
    }

    #[tokio::test]
    async fn test_push_source_single_attach_until_detached() {
        let (source, _writer) = PushAudioSource::new(AudioStreamFormat::default());
        let node = source.attach("node-1").await.unwrap();

        assert!(matches!(
            source.attach("node-2").await,
            Err(AudioError::AlreadyAttached(_))
        ));

        node.detach().await.unwrap();
        assert!(source.attach("node-2").await.is_ok());
    }

    #[tokio::test]
    async fn test_detach_releases_pending_read() {
        let (source, _writer) = PushAudioSource::new(AudioStreamFormat::default());
        let node: Arc<dyn AudioStreamNode> = Arc::from(source.attach("node-1").await.unwrap());

        let reader = {
            let node = node.clone();
            tokio::spawn(async move { node.read().await })
        };
        tokio::task::yield_now().await;
        node.detach().await.unwrap();

        let chunk = reader.await.unwrap().unwrap();
        assert!(chunk.is_end);
    }
}
