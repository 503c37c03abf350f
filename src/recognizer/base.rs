//! Recognition orchestration
//!
//! `ServiceRecognizerBase` owns the connection to the service and runs two loops
//! per recognition:
//!
//! - the **send loop** pulls audio from the [`ReplayableAudioNode`], paces it
//!   with [`SendPacer`] and uploads it as `audio` messages
//! - the **receive loop** reads service messages, handles the turn-level paths
//!   and hands the rest to the [`MessageHandler`]
//!
//! Both loops go through `fetch_connection`, which reconnects transparently
//! when the socket dropped with a non-fatal code. A successful reconnect replays
//! every byte the service has not confirmed, so the caller never notices.
//!
//! ```text
//! fetch_connection ─▶ connected? ──yes──▶ speech.config (once per socket)
//!        │                                speech.context + RIFF header (once per request id)
//!        no
//!        ▼
//!  fatal close code? ──yes──▶ cancel (BadRequestParameters / ConnectionFailure)
//!        │
//!        no
//!        ▼
//!  retryable_connect: up to max_retry_count + 1 attempts,
//!  credentials refreshed after a 1006
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};

use super::session::RequestSession;
use super::speech::{MessageHandler, SpeechMessageHandler};
use super::{
    CancellationDetails, CancellationErrorCode, CancellationReason, RecognitionEventArgs,
    RecognitionMode, RecognitionOutcome, RecognizerObserver, ServiceEventArgs, SessionEventArgs,
    SpeechRecognitionCanceledEventArgs,
};
use crate::audio::{AudioSource, AudioStreamFormat, AudioStreamNode, ReplayableAudioNode};
use crate::settings::RecognizerConfig;
use crate::streaming::connection::{STATUS_BAD_REQUEST, STATUS_UNAUTHORIZED};
use crate::streaming::message::create_no_dash_guid;
use crate::streaming::protocol::{
    SpeechContext, SpeechDetected, SpeechServiceConfig, AUDIO_CONTENT_TYPE, PATH_AUDIO,
    PATH_SPEECH_CONFIG, PATH_SPEECH_CONTEXT, PATH_SPEECH_END_DETECTED,
    PATH_SPEECH_START_DETECTED, PATH_TELEMETRY, PATH_TURN_END, PATH_TURN_START,
};
use crate::streaming::{
    Authentication, Connection, ConnectionEvent, ConnectionFactory, ConnectionState, MessageBody,
    MessageType, SpeechConnectionMessage, StreamingError,
};
use crate::telemetry::{NoopTelemetry, TelemetrySink};

/// Close codes after which reconnecting cannot help
const FATAL_CLOSE_CODES: [u16; 4] = [1002, 1003, STATUS_BAD_REQUEST, 4000];

/// Log upload progress every N chunks
const CHUNK_LOG_INTERVAL: u64 = 50;

/// Cap on the exponential retry backoff multiplier (2^6)
const MAX_BACKOFF_SHIFT: u32 = 6;

fn is_fatal_close(status_code: u16) -> bool {
    FATAL_CLOSE_CODES.contains(&status_code)
}

fn close_error_code(status_code: u16) -> CancellationErrorCode {
    if status_code == STATUS_BAD_REQUEST {
        CancellationErrorCode::BadRequestParameters
    } else {
        CancellationErrorCode::ConnectionFailure
    }
}

/// Delay before connection attempt `attempt` (1-based); the first attempt never waits
fn retry_delay(base_ms: u64, attempt: u32) -> Duration {
    if attempt <= 1 || base_ms == 0 {
        return Duration::ZERO;
    }
    let shift = (attempt - 2).min(MAX_BACKOFF_SHIFT);
    Duration::from_millis(base_ms.saturating_mul(1u64 << shift))
}

// ============================================================================
// Pacing
// ============================================================================

/// Upload pacing
///
/// The first `transmit_length_before_throttle_ms` of audio on a connection go
/// out as fast as they are read. After that each chunk waits until the previous
/// one would have been consumed at twice real time.
#[derive(Debug, Clone)]
pub struct SendPacer {
    avg_bytes_per_sec: u32,
    unthrottled_bytes: u64,
    next_send_time: Option<Instant>,
}

impl SendPacer {
    pub fn new(format: &AudioStreamFormat, fast_lane_ms: u64) -> Self {
        let avg_bytes_per_sec = format.avg_bytes_per_sec();
        Self {
            avg_bytes_per_sec,
            unthrottled_bytes: avg_bytes_per_sec as u64 * fast_lane_ms / 1000,
            next_send_time: None,
        }
    }

    pub fn unthrottled_bytes(&self) -> u64 {
        self.unthrottled_bytes
    }

    /// How long to wait before sending, given the bytes counted on this
    /// connection including the chunk about to go out
    pub fn delay(&self, bytes_sent: u64, now: Instant) -> Duration {
        if bytes_sent <= self.unthrottled_bytes {
            return Duration::ZERO;
        }
        self.next_send_time
            .map(|next| next.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn record_send(&mut self, len: usize, now: Instant) {
        if self.avg_bytes_per_sec == 0 {
            return;
        }
        let nanos = len as u64 * 1_000_000_000 / (self.avg_bytes_per_sec as u64 * 2);
        self.next_send_time = Some(now + Duration::from_nanos(nanos));
    }
}

// ============================================================================
// Recognizer
// ============================================================================

struct ActiveConnection {
    connection: Arc<dyn Connection>,
    generation: u64,
    mode: RecognitionMode,
}

/// What has been sent ahead of the audio, keyed by connection generation
#[derive(Debug, Default)]
struct PreAudioState {
    config_generation: Option<u64>,
    context: Option<(u64, String)>,
}

pub struct ServiceRecognizerBase {
    config: RecognizerConfig,
    auth: Arc<dyn Authentication>,
    factory: Arc<dyn ConnectionFactory>,
    audio_source: Arc<dyn AudioSource>,
    observer: Arc<dyn RecognizerObserver>,
    handler: Arc<dyn MessageHandler>,
    telemetry_sink: Arc<dyn TelemetrySink>,

    connection: AsyncMutex<Option<ActiveConnection>>,
    pre_audio: AsyncMutex<PreAudioState>,
    connection_generation: AtomicU64,

    session: Mutex<Option<Arc<RequestSession>>>,
    mode: Mutex<RecognitionMode>,
    recog_number: AtomicU64,
    outcome: Mutex<Option<oneshot::Sender<RecognitionOutcome>>>,
    must_report_end_of_stream: AtomicBool,
    is_disposed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ServiceRecognizerBase {
    pub fn new(
        config: RecognizerConfig,
        auth: Arc<dyn Authentication>,
        factory: Arc<dyn ConnectionFactory>,
        audio_source: Arc<dyn AudioSource>,
        observer: Arc<dyn RecognizerObserver>,
    ) -> Self {
        Self {
            config,
            auth,
            factory,
            audio_source,
            observer,
            handler: Arc::new(SpeechMessageHandler),
            telemetry_sink: Arc::new(NoopTelemetry),
            connection: AsyncMutex::new(None),
            pre_audio: AsyncMutex::new(PreAudioState::default()),
            connection_generation: AtomicU64::new(0),
            session: Mutex::new(None),
            mode: Mutex::new(RecognitionMode::Interactive),
            recog_number: AtomicU64::new(0),
            outcome: Mutex::new(None),
            must_report_end_of_stream: AtomicBool::new(false),
            is_disposed: AtomicBool::new(false),
        }
    }

    pub fn with_message_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry_sink = sink;
        self
    }

    pub fn config(&self) -> &RecognizerConfig {
        &self.config
    }

    pub fn observer(&self) -> &dyn RecognizerObserver {
        self.observer.as_ref()
    }

    pub fn current_session(&self) -> Option<Arc<RequestSession>> {
        lock(&self.session).clone()
    }

    pub fn mode(&self) -> RecognitionMode {
        *lock(&self.mode)
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::SeqCst)
    }

    fn activity_timeout(&self, mode: RecognitionMode) -> Duration {
        Duration::from_millis(if mode.is_continuous() {
            self.config.continuous_timeout_ms
        } else {
            self.config.interactive_timeout_ms
        })
    }

    fn is_current(&self, recog_number: u64) -> bool {
        self.recog_number.load(Ordering::SeqCst) == recog_number
    }

    /// Resolve the pending single-shot outcome; later calls are ignored
    pub fn complete_outcome(&self, outcome: RecognitionOutcome) {
        if let Some(tx) = lock(&self.outcome).take() {
            let _ = tx.send(outcome);
        }
    }

    fn outcome_pending(&self) -> bool {
        lock(&self.outcome).is_some()
    }

    fn fire_session_stopped(&self, session: &RequestSession) {
        if session.mark_stop_reported() {
            log::info!("Recognizer: session {} stopped", session.session_id());
            self.observer.on_session_stopped(&SessionEventArgs {
                session_id: session.session_id(),
            });
        }
    }

    /// Cancel the recognition once, reporting `on_canceled` and resolving the
    /// pending outcome. Ignored when the session already stopped recognizing.
    pub async fn cancel_recognition_local(
        &self,
        session: &Arc<RequestSession>,
        reason: CancellationReason,
        error_code: CancellationErrorCode,
        error_details: &str,
    ) {
        if !session.is_recognizing() || !session.on_cancelled() {
            return;
        }

        if reason == CancellationReason::Error {
            log::warn!(
                "Recognizer: canceling {} ({:?}): {}",
                session.request_id(),
                error_code,
                error_details
            );
        } else {
            log::info!("Recognizer: end of stream for {}", session.request_id());
        }
        session.on_stop_recognizing().await;

        let details = CancellationDetails {
            reason,
            error_code,
            error_details: error_details.to_string(),
            session_id: session.session_id(),
        };
        self.observer.on_canceled(&SpeechRecognitionCanceledEventArgs {
            session_id: session.session_id(),
            offset: session.last_reco_offset(),
            details: details.clone(),
        });
        self.complete_outcome(Err(details));
        self.fire_session_stopped(session);
    }

    // ========================================================================
    // Connection management
    // ========================================================================

    async fn send_message(
        connection: &Arc<dyn Connection>,
        message: SpeechConnectionMessage,
    ) -> Result<(), StreamingError> {
        connection.send(message.into_connection_message()).await
    }

    fn spawn_event_forwarder(self: &Arc<Self>, connection: &Arc<dyn Connection>) {
        let mut events = connection.events();
        let base = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("Recognizer: {} connection events skipped", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(base) = base.upgrade() else { break };
                base.on_connection_event(&event).await;
            }
        });
    }

    async fn on_connection_event(&self, event: &ConnectionEvent) {
        let session = self.current_session();
        if let Some(session) = &session {
            session.telemetry().on_connection_event(event);
        }
        self.observer.on_connection_event(event);

        let ConnectionEvent::ConnectionClosed {
            connection_id,
            status_code,
            reason,
        } = event
        else {
            return;
        };
        let Some(session) = session else { return };
        if session.connection_id().as_deref() != Some(connection_id.as_str()) {
            return;
        }

        if is_fatal_close(*status_code)
            || session.connection_attempts() > self.config.max_retry_count
        {
            self.cancel_recognition_local(
                &session,
                CancellationReason::Error,
                close_error_code(*status_code),
                &format!("{} websocket error code: {}", reason, status_code),
            )
            .await;
        }
    }

    /// Open a connection, retrying up to `max_retry_count` times
    async fn retryable_connect(
        self: &Arc<Self>,
        session: &Arc<RequestSession>,
        mode: RecognitionMode,
    ) -> Result<Arc<dyn Connection>, StreamingError> {
        let max_attempts = self.config.max_retry_count + 1;
        let mut unauthorized = false;
        let mut last_status = 0u16;
        let mut last_reason = String::from("no connection attempt made");
        let mut auth_error: Option<StreamingError> = None;

        while session.connection_attempts() < max_attempts {
            let attempt = session.increment_connection_attempts();
            let delay = retry_delay(self.config.connection_retry_delay_ms, attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let auth_fetch_event_id = create_no_dash_guid();
            let connection_id = create_no_dash_guid();
            session.on_pre_connection_start(&auth_fetch_event_id, &connection_id);

            let auth = if unauthorized {
                self.auth.fetch_on_expiry(&auth_fetch_event_id).await
            } else {
                self.auth.fetch(&auth_fetch_event_id).await
            };
            let auth = match auth {
                Ok(auth) => {
                    auth_error = None;
                    auth
                }
                Err(e) => {
                    log::warn!(
                        "Recognizer: credential fetch failed (attempt {}/{}): {}",
                        attempt,
                        max_attempts,
                        e
                    );
                    last_reason = e.to_string();
                    auth_error = Some(e);
                    continue;
                }
            };

            let connection = match self.factory.create(&self.config, mode, &auth, &connection_id)
            {
                Ok(connection) => connection,
                Err(e) => {
                    log::warn!("Recognizer: could not create connection: {}", e);
                    last_reason = e.to_string();
                    continue;
                }
            };
            self.spawn_event_forwarder(&connection);

            log::info!(
                "Recognizer: connecting {} (attempt {}/{})",
                connection_id,
                attempt,
                max_attempts
            );
            let response = connection.open().await;
            if response.is_success() {
                log::info!("Recognizer: connection {} established", connection_id);
                return Ok(connection);
            }

            log::warn!(
                "Recognizer: connection attempt {}/{} failed ({}): {}",
                attempt,
                max_attempts,
                response.status_code,
                response.reason
            );
            unauthorized = response.status_code == STATUS_UNAUTHORIZED;
            last_status = response.status_code;
            last_reason = response.reason;
            connection.dispose().await;
        }

        if let Some(e) = auth_error {
            return Err(e);
        }
        Err(StreamingError::ConnectionFailed {
            status_code: last_status,
            reason: last_reason,
        })
    }

    /// Current connection, reconnecting when the previous one dropped
    async fn ensure_connection(
        self: &Arc<Self>,
        session: &Arc<RequestSession>,
    ) -> Result<(Arc<dyn Connection>, u64), StreamingError> {
        let mode = self.mode();
        let mut slot = self.connection.lock().await;

        if let Some(active) = slot.as_ref() {
            if active.mode == mode && active.connection.state() != ConnectionState::Disconnected {
                return Ok((active.connection.clone(), active.generation));
            }
        }

        if let Some(previous) = slot.take() {
            if let Some(close) = previous.connection.close_status() {
                if is_fatal_close(close.status_code) {
                    drop(slot);
                    self.cancel_recognition_local(
                        session,
                        CancellationReason::Error,
                        close_error_code(close.status_code),
                        &format!("{} websocket error code: {}", close.reason, close.status_code),
                    )
                    .await;
                    return Err(StreamingError::Disconnected(format!(
                        "closed with {}",
                        close.status_code
                    )));
                }
            }
            previous.connection.dispose().await;
        }

        if !session.is_recognizing() {
            return Err(StreamingError::Canceled(
                "session is no longer recognizing".to_string(),
            ));
        }
        if session.connection_attempts() > self.config.max_retry_count {
            drop(slot);
            let details = format!(
                "Unable to contact the service after {} attempts",
                session.connection_attempts()
            );
            self.cancel_recognition_local(
                session,
                CancellationReason::Error,
                CancellationErrorCode::ConnectionFailure,
                &details,
            )
            .await;
            return Err(StreamingError::Disconnected(details));
        }

        let connection = match self.retryable_connect(session, mode).await {
            Ok(connection) => connection,
            Err(e) => {
                drop(slot);
                let (code, status) = match &e {
                    StreamingError::MissingCredentials | StreamingError::AuthenticationFailed(_) => {
                        (CancellationErrorCode::AuthenticationFailure, 0)
                    }
                    StreamingError::ConnectionFailed { status_code, .. } => {
                        (CancellationErrorCode::ConnectionFailure, *status_code)
                    }
                    _ => (CancellationErrorCode::ConnectionFailure, 0),
                };
                self.cancel_recognition_local(
                    session,
                    CancellationReason::Error,
                    code,
                    &e.to_string(),
                )
                .await;
                if code == CancellationErrorCode::AuthenticationFailure {
                    session.on_auth_completed(true).await;
                }
                session.on_connection_establish_completed(status).await;
                return Err(e);
            }
        };

        // The replay is armed before any loop can see the new connection
        session.on_connection_establish_completed(200).await;

        let generation = self.connection_generation.fetch_add(1, Ordering::SeqCst) + 1;
        *slot = Some(ActiveConnection {
            connection: connection.clone(),
            generation,
            mode,
        });
        Ok((connection, generation))
    }

    /// `speech.config` once per socket, then `speech.context` and the RIFF
    /// header once per request id. Returns the request id the context was sent for.
    async fn send_pre_audio_messages(
        &self,
        connection: &Arc<dyn Connection>,
        generation: u64,
        session: &Arc<RequestSession>,
    ) -> Result<String, StreamingError> {
        let mut sent = self.pre_audio.lock().await;

        if sent.config_generation != Some(generation) {
            let config = SpeechServiceConfig::new(self.mode(), self.audio_source.device_info());
            let body = serde_json::to_string(&config)
                .map_err(|e| StreamingError::InvalidMessage(e.to_string()))?;
            Self::send_message(
                connection,
                SpeechConnectionMessage::text(PATH_SPEECH_CONFIG, &session.request_id(), body)?,
            )
            .await?;
            sent.config_generation = Some(generation);
        }

        let current = (generation, session.request_id());
        if sent.context.as_ref() == Some(&current) {
            return Ok(current.1);
        }

        let request_id = session.on_speech_context();
        let context = serde_json::to_string(&SpeechContext::with_phrases(&self.config.phrase_hints))
            .map_err(|e| StreamingError::InvalidMessage(e.to_string()))?;
        Self::send_message(
            connection,
            SpeechConnectionMessage::text(PATH_SPEECH_CONTEXT, &request_id, context)?,
        )
        .await?;

        let header = self.audio_source.format().header()?;
        Self::send_message(
            connection,
            SpeechConnectionMessage::new(
                MessageType::Binary,
                PATH_AUDIO,
                &request_id,
                Some(AUDIO_CONTENT_TYPE),
                MessageBody::Binary(header),
            )?,
        )
        .await?;

        log::debug!(
            "Recognizer: request {} configured on connection {}",
            request_id,
            connection.id()
        );
        sent.context = Some((generation, request_id.clone()));
        Ok(request_id)
    }

    /// A configured connection and the request id its `speech.context` announced
    async fn fetch_connection(
        self: &Arc<Self>,
        session: &Arc<RequestSession>,
    ) -> Result<(Arc<dyn Connection>, String), StreamingError> {
        loop {
            let (connection, generation) = self.ensure_connection(session).await?;
            match self
                .send_pre_audio_messages(&connection, generation, session)
                .await
            {
                Ok(request_id) => return Ok((connection, request_id)),
                Err(e)
                    if connection.state() == ConnectionState::Disconnected
                        && session.is_recognizing() =>
                {
                    log::info!("Recognizer: connection lost while configuring: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ========================================================================
    // Public API
    // ========================================================================

    /// Start a recognition; `outcome` receives the first final result or the
    /// cancellation
    pub async fn recognize(
        self: &Arc<Self>,
        mode: RecognitionMode,
        outcome: Option<oneshot::Sender<RecognitionOutcome>>,
    ) -> Result<(), StreamingError> {
        if self.is_disposed() {
            return Err(StreamingError::Disposed);
        }

        let recog_number = self.recog_number.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.current_session();
        if let Some(previous) = &previous {
            previous.dispose().await;
        }
        *lock(&self.mode) = mode;

        // A reused connection keeps its session id
        let carried_session_id = {
            let slot = self.connection.lock().await;
            match (&previous, slot.as_ref()) {
                (Some(previous), Some(active))
                    if active.mode == mode
                        && active.connection.state() == ConnectionState::Connected =>
                {
                    Some(previous.session_id()).filter(|id| !id.is_empty())
                }
                _ => None,
            }
        };

        let session = RequestSession::new(self.audio_source.id(), carried_session_id);
        *lock(&self.session) = Some(session.clone());
        *lock(&self.outcome) = outcome;
        self.must_report_end_of_stream.store(false, Ordering::SeqCst);

        log::info!(
            "Recognizer: starting {} recognition, request {}",
            mode.as_str(),
            session.request_id()
        );

        session.on_audio_source_attach_started();
        let audio_node_id = session.audio_node_id();
        let (attached, connected) = tokio::join!(
            self.audio_source.attach(&audio_node_id),
            self.fetch_connection(&session)
        );

        let node = match attached {
            Ok(inner) => Arc::new(ReplayableAudioNode::new(inner, &self.audio_source.format())),
            Err(e) => {
                self.cancel_recognition_local(
                    &session,
                    CancellationReason::Error,
                    CancellationErrorCode::RuntimeError,
                    &e.to_string(),
                )
                .await;
                session.on_audio_source_attach_completed(None, true).await;
                return Err(e.into());
            }
        };
        session
            .on_audio_source_attach_completed(Some(node.clone()), false)
            .await;

        if let Err(e) = connected {
            // Canceled while connecting; the node attached afterwards
            if let Err(detach_err) = node.detach().await {
                log::warn!("Recognizer: failed to detach audio node: {}", detach_err);
            }
            return Err(e);
        }

        let is_live = self.audio_source.device_info().is_live();
        log::info!("Recognizer: session {} started", session.session_id());
        self.observer.on_session_started(&SessionEventArgs {
            session_id: session.session_id(),
        });

        let receiver = tokio::spawn(self.clone().receive_messages(session.clone(), recog_number));
        let sender = tokio::spawn(self.clone().send_audio(
            session.clone(),
            node,
            recog_number,
            is_live,
        ));
        session.add_detachable(receiver);
        session.add_detachable(sender);
        Ok(())
    }

    /// Recognize a single utterance
    pub async fn recognize_once(self: &Arc<Self>) -> RecognitionOutcome {
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.recognize(RecognitionMode::Interactive, Some(tx)).await {
            log::warn!("Recognizer: recognition did not start: {}", e);
        }

        rx.await.unwrap_or_else(|_| {
            Err(CancellationDetails {
                reason: CancellationReason::Error,
                error_code: CancellationErrorCode::RuntimeError,
                error_details: "recognition ended without a result".to_string(),
                session_id: self
                    .current_session()
                    .map(|s| s.session_id())
                    .unwrap_or_default(),
            })
        })
    }

    /// Recognize until [`stop_recognizing`](Self::stop_recognizing) or the end of the audio
    pub async fn start_continuous(
        self: &Arc<Self>,
        mode: RecognitionMode,
    ) -> Result<(), StreamingError> {
        let mode = if mode.is_continuous() {
            mode
        } else {
            log::warn!("Recognizer: interactive mode is single-shot, using conversation");
            RecognitionMode::Conversation
        };
        self.recognize(mode, None).await
    }

    /// Stop the audio, finish the open turn and dispose the session
    pub async fn stop_recognizing(self: &Arc<Self>) -> Result<(), StreamingError> {
        let Some(session) = self.current_session() else {
            return Ok(());
        };
        if !session.is_recognizing() {
            session.dispose().await;
            return Ok(());
        }

        log::info!("Recognizer: stopping session {}", session.session_id());
        if let Err(e) = self.audio_source.turn_off().await {
            log::warn!("Recognizer: failed to turn off audio source: {}", e);
        }

        let result = self.send_final_audio(&session).await;
        session.on_stop_recognizing().await;

        let wait = self.activity_timeout(self.mode());
        if tokio::time::timeout(wait, session.turn_completion())
            .await
            .is_err()
        {
            log::warn!(
                "Recognizer: turn did not complete within {}ms of stopping",
                wait.as_millis()
            );
        }

        self.complete_outcome(Err(CancellationDetails {
            reason: CancellationReason::EndOfStream,
            error_code: CancellationErrorCode::NoError,
            error_details: "recognition stopped".to_string(),
            session_id: session.session_id(),
        }));
        self.fire_session_stopped(&session);
        session.dispose().await;
        result
    }

    async fn send_final_audio(
        self: &Arc<Self>,
        session: &Arc<RequestSession>,
    ) -> Result<(), StreamingError> {
        if session.is_speech_ended() {
            return Ok(());
        }
        session.on_speech_ended();

        let (connection, request_id) = self.fetch_connection(session).await?;
        Self::send_message(
            &connection,
            SpeechConnectionMessage::audio(&request_id, Vec::new())?,
        )
        .await
    }

    /// Dispose the current session and close the connection
    pub async fn dispose(&self) {
        if self.is_disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(session) = self.current_session() {
            session.dispose().await;
        }
        lock(&self.outcome).take();

        let active = self.connection.lock().await.take();
        if let Some(active) = active {
            active.connection.dispose().await;
        }
        log::info!("Recognizer: disposed");
    }

    // ========================================================================
    // Send loop
    // ========================================================================

    fn is_sending(&self, session: &RequestSession, recog_number: u64) -> bool {
        !self.is_disposed()
            && !session.is_speech_ended()
            && session.is_recognizing()
            && self.is_current(recog_number)
    }

    async fn send_audio(
        self: Arc<Self>,
        session: Arc<RequestSession>,
        node: Arc<ReplayableAudioNode>,
        recog_number: u64,
        is_live: bool,
    ) {
        let mut pacer = SendPacer::new(
            &self.audio_source.format(),
            self.config.transmit_length_before_throttle_ms,
        );
        let mut chunks_sent: u64 = 0;

        while self.is_sending(&session, recog_number) {
            if let Err(e) = self.fetch_connection(&session).await {
                log::debug!("Recognizer: send loop stopping: {}", e);
                break;
            }

            let (chunk, served_under) = match node.read_tagged().await {
                Ok(read) => read,
                Err(e) => {
                    if self.is_sending(&session, recog_number) {
                        self.cancel_recognition_local(
                            &session,
                            CancellationReason::Error,
                            CancellationErrorCode::RuntimeError,
                            &e.to_string(),
                        )
                        .await;
                    }
                    break;
                }
            };
            if session.is_speech_ended() {
                break;
            }

            let is_end = chunk.is_end;
            if !is_end {
                let delay = pacer.delay(session.bytes_sent() + chunk.len() as u64, Instant::now());
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            if !self.is_sending(&session, recog_number) {
                break;
            }
            let (connection, request_id) = match self.fetch_connection(&session).await {
                Ok(active) => active,
                Err(e) => {
                    log::debug!("Recognizer: send loop stopping: {}", e);
                    break;
                }
            };
            // Replayed since this chunk was served (reconnect or turn restart):
            // the chunk is buffered and comes back in the replay
            if served_under != node.replay_generation() {
                continue;
            }

            let len = chunk.len();
            let message = match SpeechConnectionMessage::audio(&request_id, chunk.data) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("Recognizer: could not build audio message: {}", e);
                    break;
                }
            };
            if let Err(e) = Self::send_message(&connection, message).await {
                if connection.state() == ConnectionState::Disconnected {
                    log::info!("Recognizer: connection dropped while sending audio: {}", e);
                    continue;
                }
                self.cancel_recognition_local(
                    &session,
                    CancellationReason::Error,
                    CancellationErrorCode::RuntimeError,
                    &e.to_string(),
                )
                .await;
                break;
            }
            if !is_end {
                session.on_audio_sent(len);
                pacer.record_send(len, Instant::now());
            }

            chunks_sent += 1;
            if chunks_sent % CHUNK_LOG_INTERVAL == 0 {
                log::debug!(
                    "Recognizer: sent {} audio chunks ({} bytes this recognition)",
                    chunks_sent,
                    session.recognition_bytes_sent()
                );
            }

            if is_end {
                log::info!(
                    "Recognizer: end of audio after {} bytes",
                    session.recognition_bytes_sent()
                );
                if !is_live {
                    session.on_speech_ended();
                }
                break;
            }
        }
    }

    // ========================================================================
    // Receive loop
    // ========================================================================

    async fn receive_messages(self: Arc<Self>, session: Arc<RequestSession>, recog_number: u64) {
        let mode = self.mode();
        let activity_timeout = self.activity_timeout(mode);

        while !self.is_disposed() && !session.is_disposed() && self.is_current(recog_number) {
            let connection = match self.fetch_connection(&session).await {
                Ok((connection, _)) => connection,
                Err(e) => {
                    log::debug!("Recognizer: receive loop stopping: {}", e);
                    break;
                }
            };

            let message = match tokio::time::timeout(activity_timeout, connection.read()).await {
                Err(_) => {
                    self.cancel_recognition_local(
                        &session,
                        CancellationReason::Error,
                        CancellationErrorCode::ServiceTimeout,
                        &format!(
                            "No response from the service within {}ms",
                            activity_timeout.as_millis()
                        ),
                    )
                    .await;
                    break;
                }
                Ok(Err(e)) => {
                    log::warn!("Recognizer: dropping unreadable message: {}", e);
                    continue;
                }
                Ok(Ok(None)) => {
                    if !session.is_recognizing() {
                        break;
                    }
                    log::info!("Recognizer: connection {} ended", connection.id());
                    continue;
                }
                Ok(Ok(Some(message))) => message,
            };

            let message = match SpeechConnectionMessage::from_connection_message(message) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("Recognizer: dropping message: {}", e);
                    continue;
                }
            };
            session.telemetry().received_message(&message.path);

            if !message
                .request_id
                .eq_ignore_ascii_case(&session.request_id())
            {
                log::debug!(
                    "Recognizer: discarding {} for request {}",
                    message.path,
                    message.request_id
                );
                continue;
            }

            if !self.dispatch(&session, &connection, &message, mode).await {
                break;
            }
        }
        log::debug!("Recognizer: receive loop for {} done", session.request_id());
    }

    fn speech_detected_offset(session: &RequestSession, message: &SpeechConnectionMessage) -> u64 {
        let body = message.text_body().unwrap_or_default();
        let detected = if body.trim().is_empty() {
            SpeechDetected { offset: 0 }
        } else {
            serde_json::from_str(body).unwrap_or_else(|e| {
                log::warn!("Recognizer: bad {} body: {}", message.path, e);
                SpeechDetected { offset: 0 }
            })
        };
        detected.offset + session.current_turn_audio_offset()
    }

    /// Handle one message; returns false once the session is over
    async fn dispatch(
        self: &Arc<Self>,
        session: &Arc<RequestSession>,
        connection: &Arc<dyn Connection>,
        message: &SpeechConnectionMessage,
        mode: RecognitionMode,
    ) -> bool {
        match message.path.to_ascii_lowercase().as_str() {
            PATH_TURN_START => {
                self.must_report_end_of_stream.store(true, Ordering::SeqCst);
                session.on_service_turn_start_response();
            }
            PATH_SPEECH_START_DETECTED => {
                let offset = Self::speech_detected_offset(session, message);
                self.observer.on_speech_start_detected(&RecognitionEventArgs {
                    session_id: session.session_id(),
                    offset,
                });
            }
            PATH_SPEECH_END_DETECTED => {
                let offset = Self::speech_detected_offset(session, message);
                if mode.is_continuous() {
                    session.on_service_recognized(offset);
                }
                self.observer.on_speech_end_detected(&RecognitionEventArgs {
                    session_id: session.session_id(),
                    offset,
                });
            }
            PATH_TURN_END => return self.on_turn_end(session, connection, mode).await,
            _ => {
                if !self
                    .handler
                    .process_type_specific_message(self, session, message)
                    .await
                {
                    self.observer.on_service_event(&ServiceEventArgs {
                        session_id: session.session_id(),
                        path: message.path.clone(),
                        body: message.text_body().unwrap_or_default().to_string(),
                    });
                }
            }
        }
        true
    }

    async fn send_telemetry(&self, session: &RequestSession, connection: &Arc<dyn Connection>) {
        let Some(json) = session.get_telemetry() else {
            return;
        };
        self.telemetry_sink
            .record(&session.session_id(), &session.request_id(), &json);
        if !self.config.telemetry_enabled {
            return;
        }

        match SpeechConnectionMessage::text(PATH_TELEMETRY, &session.request_id(), json) {
            Ok(message) => {
                if let Err(e) = Self::send_message(connection, message).await {
                    log::debug!("Recognizer: telemetry not sent: {}", e);
                }
            }
            Err(e) => log::warn!("Recognizer: could not build telemetry message: {}", e),
        }
    }

    async fn on_turn_end(
        self: &Arc<Self>,
        session: &Arc<RequestSession>,
        connection: &Arc<dyn Connection>,
        mode: RecognitionMode,
    ) -> bool {
        self.send_telemetry(session, connection).await;

        let continuous = mode.is_continuous();
        let report_end_of_stream = if continuous {
            session.is_speech_ended() && self.must_report_end_of_stream.swap(false, Ordering::SeqCst)
        } else {
            self.outcome_pending()
        };
        if report_end_of_stream {
            self.cancel_recognition_local(
                session,
                CancellationReason::EndOfStream,
                CancellationErrorCode::NoError,
                "",
            )
            .await;
        }

        let completed = session.on_service_turn_end_response(continuous).await;
        if completed || !session.is_recognizing() {
            self.fire_session_stopped(session);
            return false;
        }

        // Next turn on the same session
        match self.fetch_connection(session).await {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Recognizer: could not restart turn: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacer_fast_lane() {
        let pacer = SendPacer::new(&AudioStreamFormat::default(), 5_000);
        assert_eq!(pacer.unthrottled_bytes(), 160_000);
        assert_eq!(pacer.delay(160_000, Instant::now()), Duration::ZERO);
    }

    #[test]
    fn test_pacer_throttles_at_twice_real_time() {
        let mut pacer = SendPacer::new(&AudioStreamFormat::default(), 0);
        let now = Instant::now();

        // Nothing sent yet
        assert_eq!(pacer.delay(3_200, now), Duration::ZERO);

        // 100ms of audio at 2x real time is due 50ms later
        pacer.record_send(3_200, now);
        let delay = pacer.delay(6_400, now);
        assert_eq!(delay, Duration::from_millis(50));

        // Already past the deadline
        assert_eq!(pacer.delay(6_400, now + Duration::from_millis(80)), Duration::ZERO);
    }

    #[test]
    fn test_retry_delay_backoff() {
        assert_eq!(retry_delay(100, 1), Duration::ZERO);
        assert_eq!(retry_delay(100, 2), Duration::from_millis(100));
        assert_eq!(retry_delay(100, 3), Duration::from_millis(200));
        assert_eq!(retry_delay(100, 4), Duration::from_millis(400));
        assert_eq!(retry_delay(100, 50), Duration::from_millis(6_400));
        assert_eq!(retry_delay(0, 5), Duration::ZERO);
    }

    #[test]
    fn test_fatal_close_codes() {
        assert!(is_fatal_close(1007));
        assert!(is_fatal_close(4000));
        assert!(!is_fatal_close(STATUS_UNAUTHORIZED));
        assert!(!is_fatal_close(1000));
        assert_eq!(close_error_code(1007), CancellationErrorCode::BadRequestParameters);
        assert_eq!(close_error_code(1002), CancellationErrorCode::ConnectionFailure);
    }
}
