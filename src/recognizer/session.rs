//! Per-recognition request session
//!
//! A `RequestSession` tracks one recognition from audio attach to completion:
//! correlation ids, the monotonic speech-ended / canceled / completed flags, and
//! the audio offsets the service has confirmed. Confirmed offsets shrink the
//! replay buffer of the attached [`ReplayableAudioNode`]; a successful
//! (re)connect replays from the last confirmed offset.
//!
//! # Lifecycle
//!
//! ```text
//! Created ─▶ AudioAttachPending ─▶ AudioAttached ─▶ ConnectPending ─▶ TurnActive ─┐
//!                  │                                      │              ▲          │
//!                  └──────────── error ───────────────────┴──▶ Completed │  turn.end (continuous)
//!                                                                        └──────────┘
//! ```
//!
//! Sessions are never reset: a new recognition gets a new session.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audio::{AudioStreamNode, ReplayableAudioNode};
use crate::streaming::message::create_no_dash_guid;
use crate::telemetry::ServiceTelemetryListener;

/// Coarse lifecycle phase, for logging and inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    AudioAttachPending,
    AudioAttached,
    ConnectPending,
    TurnActive,
    Completed,
    Canceled,
}

#[derive(Debug)]
struct SessionState {
    phase: SessionPhase,
    request_id: String,
    session_id: String,
    audio_node_id: String,
    auth_fetch_event_id: Option<String>,
    connection_id: Option<String>,

    is_recognizing: bool,
    is_speech_ended: bool,
    is_canceled: bool,
    is_completed: bool,
    is_disposed: bool,
    is_audio_node_detached: bool,
    is_stop_reported: bool,

    current_turn_audio_offset: u64,
    last_reco_offset: u64,
    hypothesis_received: bool,

    bytes_sent: u64,
    recognition_bytes_sent: u64,
    connection_attempts: u32,
}

pub struct RequestSession {
    audio_source_id: String,
    state: Mutex<SessionState>,
    audio_node: Mutex<Option<Arc<ReplayableAudioNode>>>,
    telemetry: ServiceTelemetryListener,
    detachables: Mutex<Vec<JoinHandle<()>>>,
    in_turn: watch::Sender<bool>,
}

impl RequestSession {
    /// Start a session; `session_id` carries over the id of a reused connection
    pub fn new(audio_source_id: &str, session_id: Option<String>) -> Arc<Self> {
        let request_id = create_no_dash_guid();
        let audio_node_id = create_no_dash_guid();
        let (in_turn, _) = watch::channel(false);

        Arc::new(Self {
            audio_source_id: audio_source_id.to_string(),
            telemetry: ServiceTelemetryListener::new(&request_id, &audio_node_id),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Created,
                request_id,
                session_id: session_id.unwrap_or_default(),
                audio_node_id,
                auth_fetch_event_id: None,
                connection_id: None,
                is_recognizing: true,
                is_speech_ended: false,
                is_canceled: false,
                is_completed: false,
                is_disposed: false,
                is_audio_node_detached: false,
                is_stop_reported: false,
                current_turn_audio_offset: 0,
                last_reco_offset: 0,
                hypothesis_received: false,
                bytes_sent: 0,
                recognition_bytes_sent: 0,
                connection_attempts: 0,
            }),
            audio_node: Mutex::new(None),
            detachables: Mutex::new(Vec::new()),
            in_turn,
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(state: &mut SessionState, phase: SessionPhase) {
        if state.phase != phase {
            log::debug!(
                "RequestSession: {} {:?} -> {:?}",
                state.request_id,
                state.phase,
                phase
            );
            state.phase = phase;
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn audio_source_id(&self) -> &str {
        &self.audio_source_id
    }

    pub fn request_id(&self) -> String {
        self.state().request_id.clone()
    }

    pub fn session_id(&self) -> String {
        self.state().session_id.clone()
    }

    pub fn audio_node_id(&self) -> String {
        self.state().audio_node_id.clone()
    }

    pub fn auth_fetch_event_id(&self) -> Option<String> {
        self.state().auth_fetch_event_id.clone()
    }

    pub fn connection_id(&self) -> Option<String> {
        self.state().connection_id.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state().phase
    }

    pub fn is_recognizing(&self) -> bool {
        self.state().is_recognizing
    }

    pub fn is_speech_ended(&self) -> bool {
        self.state().is_speech_ended
    }

    pub fn is_canceled(&self) -> bool {
        self.state().is_canceled
    }

    pub fn is_completed(&self) -> bool {
        self.state().is_completed
    }

    pub fn is_disposed(&self) -> bool {
        self.state().is_disposed
    }

    pub fn current_turn_audio_offset(&self) -> u64 {
        self.state().current_turn_audio_offset
    }

    pub fn last_reco_offset(&self) -> u64 {
        self.state().last_reco_offset
    }

    pub fn bytes_sent(&self) -> u64 {
        self.state().bytes_sent
    }

    pub fn recognition_bytes_sent(&self) -> u64 {
        self.state().recognition_bytes_sent
    }

    pub fn connection_attempts(&self) -> u32 {
        self.state().connection_attempts
    }

    pub fn is_in_turn(&self) -> bool {
        *self.in_turn.borrow()
    }

    pub fn audio_node(&self) -> Option<Arc<ReplayableAudioNode>> {
        self.audio_node
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn telemetry(&self) -> &ServiceTelemetryListener {
        &self.telemetry
    }

    /// Telemetry JSON accumulated since the last call
    pub fn get_telemetry(&self) -> Option<String> {
        self.telemetry.get_telemetry()
    }

    /// Resolves once no turn is open
    pub async fn turn_completion(&self) {
        let mut rx = self.in_turn.subscribe();
        let _ = rx.wait_for(|in_turn| !*in_turn).await;
    }

    /// Task to abort when the session is disposed
    pub fn add_detachable(&self, handle: JoinHandle<()>) {
        self.detachables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    pub fn on_audio_source_attach_started(&self) {
        let mut state = self.state();
        Self::set_phase(&mut state, SessionPhase::AudioAttachPending);
    }

    pub async fn on_audio_source_attach_completed(
        &self,
        node: Option<Arc<ReplayableAudioNode>>,
        is_error: bool,
    ) {
        if let Some(node) = node {
            *self.audio_node.lock().unwrap_or_else(|e| e.into_inner()) = Some(node);
        }

        if is_error {
            log::warn!("RequestSession: audio attach failed for {}", self.request_id());
            self.on_complete().await;
            return;
        }

        {
            let mut state = self.state();
            if state.phase == SessionPhase::AudioAttachPending || state.phase == SessionPhase::Created {
                Self::set_phase(&mut state, SessionPhase::AudioAttached);
            }
        }
        self.telemetry.microphone_started();
    }

    pub fn on_pre_connection_start(&self, auth_fetch_event_id: &str, connection_id: &str) {
        let mut state = self.state();
        state.auth_fetch_event_id = Some(auth_fetch_event_id.to_string());
        state.connection_id = Some(connection_id.to_string());
        // The session id stays with the first connection
        if state.session_id.is_empty() {
            state.session_id = connection_id.to_string();
        }
        if !state.is_completed {
            Self::set_phase(&mut state, SessionPhase::ConnectPending);
        }
    }

    pub async fn on_auth_completed(&self, is_error: bool) {
        if is_error {
            self.on_complete().await;
        }
    }

    /// 200 replays unconfirmed audio into the new connection; anything else completes
    pub async fn on_connection_establish_completed(&self, status_code: u16) {
        if status_code != 200 {
            log::warn!(
                "RequestSession: connection for {} failed with {}",
                self.request_id(),
                status_code
            );
            self.on_complete().await;
            return;
        }

        {
            let mut state = self.state();
            state.current_turn_audio_offset = state.last_reco_offset;
            state.bytes_sent = 0;
            if !state.is_completed {
                Self::set_phase(&mut state, SessionPhase::TurnActive);
            }
        }
        if let Some(node) = self.audio_node() {
            node.replay();
        }
    }

    /// New request id for the next `speech.context`
    pub fn on_speech_context(&self) -> String {
        let mut state = self.state();
        state.request_id = create_no_dash_guid();
        self.telemetry.set_request_id(&state.request_id);
        state.request_id.clone()
    }

    pub fn on_service_turn_start_response(&self) {
        if self.is_in_turn() {
            log::warn!(
                "RequestSession: turn.start for {} while a turn is open",
                self.request_id()
            );
        }
        self.in_turn.send_replace(true);
        let mut state = self.state();
        state.hypothesis_received = false;
        if !state.is_completed {
            Self::set_phase(&mut state, SessionPhase::TurnActive);
        }
    }

    /// End of a service turn; returns true when the session completed
    pub async fn on_service_turn_end_response(&self, continuous: bool) -> bool {
        self.in_turn.send_replace(false);

        let speech_ended = self.is_speech_ended();
        if !continuous || speech_ended {
            self.on_complete().await;
            return true;
        }

        let mut state = self.state();
        state.current_turn_audio_offset = state.last_reco_offset;
        state.request_id = create_no_dash_guid();
        self.telemetry.set_request_id(&state.request_id);
        log::info!(
            "RequestSession: restarting turn at offset {} as {}",
            state.current_turn_audio_offset,
            state.request_id
        );
        // Replay under the same lock so no reader sees the new request id with stale audio
        if let Some(node) = self.audio_node() {
            node.replay();
        }
        false
    }

    /// The service confirmed audio up to `offset`; never moves backwards
    pub fn on_service_recognized(&self, offset: u64) {
        let node = {
            let mut state = self.state();
            if !state.is_recognizing || offset < state.last_reco_offset {
                return;
            }
            state.last_reco_offset = offset;
            state.hypothesis_received = false;
            state.connection_attempts = 0;
            self.audio_node()
        };

        if let Some(node) = node {
            node.shrink_buffers(offset);
        }
    }

    pub fn on_hypothesis(&self, offset: u64) {
        let first = {
            let mut state = self.state();
            if !state.is_recognizing || state.hypothesis_received {
                false
            } else {
                state.hypothesis_received = true;
                true
            }
        };

        if first {
            let captured_at = self.audio_node().and_then(|n| n.find_time_at_offset(offset));
            self.telemetry.hypothesis_received(captured_at);
        }
    }

    pub fn on_phrase_recognized(&self, offset: u64) {
        if !self.is_recognizing() {
            return;
        }
        let captured_at = self.audio_node().and_then(|n| n.find_time_at_offset(offset));
        self.telemetry.phrase_received(captured_at);
        self.on_service_recognized(offset);
    }

    pub fn on_audio_sent(&self, bytes: usize) {
        let mut state = self.state();
        state.bytes_sent += bytes as u64;
        state.recognition_bytes_sent += bytes as u64;
    }

    /// Count a connection attempt; returns the new total
    pub fn increment_connection_attempts(&self) -> u32 {
        let mut state = self.state();
        state.connection_attempts += 1;
        state.connection_attempts
    }

    pub fn on_speech_ended(&self) {
        self.state().is_speech_ended = true;
    }

    /// Returns true the first time only
    pub fn on_cancelled(&self) -> bool {
        let mut state = self.state();
        if state.is_canceled {
            return false;
        }
        state.is_canceled = true;
        Self::set_phase(&mut state, SessionPhase::Canceled);
        true
    }

    /// Returns true the first time only; guards the `session_stopped` callback
    pub fn mark_stop_reported(&self) -> bool {
        let mut state = self.state();
        !std::mem::replace(&mut state.is_stop_reported, true)
    }

    pub async fn on_stop_recognizing(&self) {
        self.on_complete().await;
    }

    async fn on_complete(&self) {
        let was_recognizing = {
            let mut state = self.state();
            let was = state.is_recognizing;
            state.is_recognizing = false;
            state.is_completed = true;
            if state.phase != SessionPhase::Canceled {
                Self::set_phase(&mut state, SessionPhase::Completed);
            }
            was
        };

        // An open turn stays open until turn.end or dispose
        if was_recognizing {
            self.detach_audio_node().await;
        }
    }

    async fn detach_audio_node(&self) {
        let node = {
            let mut state = self.state();
            if state.is_audio_node_detached {
                return;
            }
            state.is_audio_node_detached = true;
            self.audio_node()
        };

        if let Some(node) = node {
            if let Err(e) = node.detach().await {
                log::warn!("RequestSession: failed to detach audio node: {}", e);
            }
            self.telemetry.microphone_stopped();
        }
    }

    /// Detach the audio node and abort attached tasks; safe to call repeatedly
    pub async fn dispose(&self) {
        {
            let mut state = self.state();
            if state.is_disposed {
                return;
            }
            state.is_disposed = true;
            state.is_recognizing = false;
        }
        self.in_turn.send_replace(false);

        let detachables: Vec<JoinHandle<()>> = self
            .detachables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in detachables {
            handle.abort();
        }

        self.detach_audio_node().await;
        self.telemetry.dispose();
        log::debug!("RequestSession: {} disposed", self.request_id());
    }
}
