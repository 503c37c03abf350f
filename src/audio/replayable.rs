//! Replay buffer for audio the service has not yet confirmed
//!
//! Every chunk handed to the upload loop is retained until the service reports
//! (via a recognition offset) that it has consumed it. After a reconnect the
//! node is told to [`replay`](ReplayableAudioNode::replay) and serves the retained
//! audio again, starting at the last confirmed offset, before pulling new audio
//! from the underlying source.
//!
//! # Offsets
//!
//! Offsets are service time in 100ns ticks. Conversion to bytes uses the stream's
//! average byte rate; byte seeks are rounded and then aligned up to an even count
//! so a seek never lands in the middle of a 16-bit sample.
//!
//! ```text
//!  buffer_start_offset          last_shrink_offset
//!         │                            │
//!         ▼                            ▼
//!   ┌──────────┬──────────┬──────────┬──────────┐
//!   │ entry 0  │ entry 1  │ entry 2  │ entry 3  │ ◀── appended by read()
//!   └──────────┴──────────┴──────────┴──────────┘
//!   ▲ dropped by shrink_buffers() once confirmed
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;

use super::format::AudioStreamFormat;
use super::{AudioChunk, AudioError, AudioStreamNode};

/// 100ns ticks per second
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Convert a tick offset to a byte count, rounded and aligned to 2 bytes
pub fn ticks_to_aligned_bytes(ticks: u64, bytes_per_sec: u32) -> u64 {
    let bytes = (ticks as f64 * bytes_per_sec as f64 / TICKS_PER_SECOND as f64).round() as u64;
    if bytes % 2 != 0 {
        bytes + 1
    } else {
        bytes
    }
}

/// Convert a byte count to 100ns ticks, rounded
pub fn bytes_to_ticks(bytes: u64, bytes_per_sec: u32) -> u64 {
    if bytes_per_sec == 0 {
        return 0;
    }
    (bytes as f64 * TICKS_PER_SECOND as f64 / bytes_per_sec as f64).round() as u64
}

/// One retained chunk
#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub chunk: AudioChunk,
    /// Monotonic per-node serial
    pub serial: u64,
    /// Cumulative bytes read from the source before this chunk
    pub byte_offset: u64,
}

#[derive(Debug, Default)]
struct ReplayState {
    buffers: VecDeque<BufferEntry>,
    buffer_start_offset: u64,
    buffer_serial: u64,
    buffered_bytes: u64,
    replay: bool,
    replay_offset: u64,
    last_shrink_offset: u64,
    replay_generation: u64,
    detached: bool,
}

impl ReplayState {
    /// Index of the entry containing `bytes_to_seek` and the remaining offset into it
    fn locate(&self, mut bytes_to_seek: u64) -> (usize, u64) {
        let mut i = 0;
        while i < self.buffers.len() && bytes_to_seek >= self.buffers[i].chunk.len() as u64 {
            bytes_to_seek -= self.buffers[i].chunk.len() as u64;
            i += 1;
        }
        (i, bytes_to_seek)
    }
}

/// Audio node that can rewind to the last service-confirmed offset
pub struct ReplayableAudioNode {
    source: Box<dyn AudioStreamNode>,
    bytes_per_sec: u32,
    state: Mutex<ReplayState>,
}

impl ReplayableAudioNode {
    pub fn new(source: Box<dyn AudioStreamNode>, format: &AudioStreamFormat) -> Self {
        Self {
            source,
            bytes_per_sec: format.avg_bytes_per_sec(),
            state: Mutex::new(ReplayState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bytes_per_sec(&self) -> u32 {
        self.bytes_per_sec
    }

    /// Serve retained audio from the last confirmed offset on the next reads
    pub fn replay(&self) {
        let mut state = self.state();
        state.replay = true;
        state.replay_offset = state.last_shrink_offset;
        state.replay_generation += 1;
        log::debug!(
            "ReplayableAudioNode: replay from offset {} ({} buffered entries)",
            state.replay_offset,
            state.buffers.len()
        );
    }

    /// Drop every retained entry lying entirely before `offset`
    pub fn shrink_buffers(&self, offset: u64) {
        let mut state = self.state();
        state.last_shrink_offset = offset;
        if state.buffers.is_empty() {
            // Nothing retained: the next entry starts at the next byte read
            state.buffer_start_offset = bytes_to_ticks(state.buffered_bytes, self.bytes_per_sec);
            return;
        }

        let seek = offset.saturating_sub(state.buffer_start_offset);
        let bytes_to_seek = ticks_to_aligned_bytes(seek, self.bytes_per_sec);
        let (drop_count, leftover) = state.locate(bytes_to_seek);

        state.buffer_start_offset =
            offset.saturating_sub(bytes_to_ticks(leftover, self.bytes_per_sec));
        state.buffers.drain(..drop_count);

        log::trace!(
            "ReplayableAudioNode: shrink to {} dropped {} entries, start now {}",
            offset,
            drop_count,
            state.buffer_start_offset
        );
    }

    /// Capture time of the chunk containing `offset`, if it is still retained
    pub fn find_time_at_offset(&self, offset: u64) -> Option<Instant> {
        let state = self.state();
        if offset < state.buffer_start_offset {
            return None;
        }

        state.buffers.iter().find_map(|entry| {
            let start = bytes_to_ticks(entry.byte_offset, self.bytes_per_sec);
            let end = start + bytes_to_ticks(entry.chunk.len() as u64, self.bytes_per_sec);
            (offset >= start && offset <= end).then_some(entry.chunk.captured_at)
        })
    }

    /// Number of retained entries
    pub fn buffered_entries(&self) -> usize {
        self.state().buffers.len()
    }

    /// Total bytes pulled from the underlying source
    pub fn total_bytes_read(&self) -> u64 {
        self.state().buffered_bytes
    }

    pub fn is_replaying(&self) -> bool {
        self.state().replay
    }

    /// Incremented by every [`replay`](Self::replay); a chunk served under an
    /// older generation is superseded by the replayed audio
    pub fn replay_generation(&self) -> u64 {
        self.state().replay_generation
    }

    /// Like [`read`](AudioStreamNode::read), also returning the replay generation
    /// the chunk was served under
    pub async fn read_tagged(&self) -> Result<(AudioChunk, u64), AudioError> {
        {
            let mut state = self.state();
            if state.detached {
                return Err(AudioError::Detached(self.source.id().to_string()));
            }
            if let Some(chunk) = self.next_replayed(&mut state) {
                return Ok((chunk, state.replay_generation));
            }
        }

        let chunk = self.source.read().await?;

        let mut state = self.state();
        let generation = state.replay_generation;
        if state.detached {
            return Ok((chunk, generation));
        }

        if !chunk.is_end && !chunk.is_empty() {
            let serial = state.buffer_serial;
            let byte_offset = state.buffered_bytes;
            state.buffer_serial += 1;
            state.buffered_bytes += chunk.len() as u64;
            state.buffers.push_back(BufferEntry {
                chunk: chunk.clone(),
                serial,
                byte_offset,
            });
        }

        // A replay requested while the source read was pending is served first;
        // the new chunk is already at the tail of what gets replayed
        if state.replay {
            if let Some(replayed) = self.next_replayed(&mut state) {
                return Ok((replayed, generation));
            }
        }

        Ok((chunk, generation))
    }

    /// Next slice of retained audio when replaying, clearing the flag once the
    /// tail entry has been served
    fn next_replayed(&self, state: &mut ReplayState) -> Option<AudioChunk> {
        if !state.replay || state.buffers.is_empty() {
            state.replay = false;
            return None;
        }

        let seek = state.replay_offset.saturating_sub(state.buffer_start_offset);
        let bytes_to_seek = ticks_to_aligned_bytes(seek, self.bytes_per_sec);
        let (index, within) = state.locate(bytes_to_seek);

        if index >= state.buffers.len() {
            state.replay = false;
            return None;
        }

        let entry = &state.buffers[index];
        let data = entry.chunk.data[within as usize..].to_vec();
        let captured_at = entry.chunk.captured_at;

        state.replay_offset += bytes_to_ticks(data.len() as u64, self.bytes_per_sec);
        if index == state.buffers.len() - 1 {
            state.replay = false;
        }

        Some(AudioChunk {
            data,
            captured_at,
            is_end: false,
        })
    }
}

#[async_trait]
impl AudioStreamNode for ReplayableAudioNode {
    fn id(&self) -> &str {
        self.source.id()
    }

    async fn read(&self) -> Result<AudioChunk, AudioError> {
        self.read_tagged().await.map(|(chunk, _)| chunk)
    }

    async fn detach(&self) -> Result<(), AudioError> {
        {
            let mut state = self.state();
            if state.detached {
                return Ok(());
            }
            state.detached = true;
            state.buffers.clear();
            state.replay = false;
        }
        self.source.detach().await
    }
}
