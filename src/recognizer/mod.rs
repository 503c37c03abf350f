//! Recognition engine
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────────────────────────┐
//!  AudioSource ──attach─▶ ReplayableAudioNode          │
//!                       │        │ send loop (paced)   │
//!                       │        ▼                     │
//!                       │  ServiceRecognizerBase ──────┼──▶ Connection (retry + auth)
//!                       │        ▲ receive loop        │
//!                       │        │                     │
//!                       │  RequestSession (per turn)   │
//!                       └────────┬─────────────────────┘
//!                                ▼
//!                       RecognizerObserver callbacks
//! ```
//!
//! Every externally visible failure ends in exactly one `on_canceled` callback
//! carrying [`CancellationDetails`]; a turn either completes with a result or is
//! canceled, never both.

pub mod base;
pub mod session;
pub mod speech;

pub use base::{SendPacer, ServiceRecognizerBase};
pub use session::{RequestSession, SessionPhase};
pub use speech::{MessageHandler, SpeechMessageHandler};

use tokio::sync::mpsc;

use crate::streaming::ConnectionEvent;

/// Recognition mode; anything but `Interactive` keeps the session open across turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecognitionMode {
    #[default]
    Interactive,
    Conversation,
    Dictation,
}

impl RecognitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionMode::Interactive => "interactive",
            RecognitionMode::Conversation => "conversation",
            RecognitionMode::Dictation => "dictation",
        }
    }

    pub fn is_continuous(&self) -> bool {
        !matches!(self, RecognitionMode::Interactive)
    }
}

impl std::str::FromStr for RecognitionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interactive" => Ok(RecognitionMode::Interactive),
            "conversation" => Ok(RecognitionMode::Conversation),
            "dictation" => Ok(RecognitionMode::Dictation),
            other => Err(format!("unknown recognition mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultReason {
    NoMatch,
    Canceled,
    RecognizingSpeech,
    RecognizedSpeech,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub result_id: String,
    pub reason: ResultReason,
    pub text: String,
    /// Start of the phrase, 100ns ticks from the beginning of the stream
    pub offset: u64,
    pub duration: u64,
    /// Raw service payload
    pub json: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    Error,
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationErrorCode {
    NoError,
    AuthenticationFailure,
    BadRequestParameters,
    TooManyRequests,
    Forbidden,
    ConnectionFailure,
    ServiceTimeout,
    ServiceError,
    RuntimeError,
}

/// Why a recognition ended without a result
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason:?} ({error_code:?}): {error_details}")]
pub struct CancellationDetails {
    pub reason: CancellationReason,
    pub error_code: CancellationErrorCode,
    pub error_details: String,
    pub session_id: String,
}

/// Outcome of a single-shot recognition
pub type RecognitionOutcome = Result<RecognitionResult, CancellationDetails>;

// ============================================================================
// Event args
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEventArgs {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionEventArgs {
    pub session_id: String,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRecognitionEventArgs {
    pub session_id: String,
    pub offset: u64,
    pub result: RecognitionResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRecognitionCanceledEventArgs {
    pub session_id: String,
    pub offset: u64,
    pub details: CancellationDetails,
}

/// A message on a path no handler claimed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEventArgs {
    pub session_id: String,
    pub path: String,
    pub body: String,
}

/// Recognizer callbacks; every method defaults to a no-op
pub trait RecognizerObserver: Send + Sync {
    fn on_session_started(&self, _args: &SessionEventArgs) {}
    fn on_session_stopped(&self, _args: &SessionEventArgs) {}
    fn on_speech_start_detected(&self, _args: &RecognitionEventArgs) {}
    fn on_speech_end_detected(&self, _args: &RecognitionEventArgs) {}
    fn on_recognizing(&self, _args: &SpeechRecognitionEventArgs) {}
    fn on_recognized(&self, _args: &SpeechRecognitionEventArgs) {}
    fn on_canceled(&self, _args: &SpeechRecognitionCanceledEventArgs) {}
    fn on_connection_event(&self, _event: &ConnectionEvent) {}
    fn on_service_event(&self, _args: &ServiceEventArgs) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RecognizerObserver for NoopObserver {}

/// Observer callbacks as values
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    SessionStarted(SessionEventArgs),
    SessionStopped(SessionEventArgs),
    SpeechStartDetected(RecognitionEventArgs),
    SpeechEndDetected(RecognitionEventArgs),
    Recognizing(SpeechRecognitionEventArgs),
    Recognized(SpeechRecognitionEventArgs),
    Canceled(SpeechRecognitionCanceledEventArgs),
    Connection(ConnectionEvent),
    Service(ServiceEventArgs),
}

/// Forwards every callback into a channel
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<RecognizerEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RecognizerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: RecognizerEvent) {
        let _ = self.tx.send(event);
    }
}

impl RecognizerObserver for ChannelObserver {
    fn on_session_started(&self, args: &SessionEventArgs) {
        self.forward(RecognizerEvent::SessionStarted(args.clone()));
    }
    fn on_session_stopped(&self, args: &SessionEventArgs) {
        self.forward(RecognizerEvent::SessionStopped(args.clone()));
    }
    fn on_speech_start_detected(&self, args: &RecognitionEventArgs) {
        self.forward(RecognizerEvent::SpeechStartDetected(args.clone()));
    }
    fn on_speech_end_detected(&self, args: &RecognitionEventArgs) {
        self.forward(RecognizerEvent::SpeechEndDetected(args.clone()));
    }
    fn on_recognizing(&self, args: &SpeechRecognitionEventArgs) {
        self.forward(RecognizerEvent::Recognizing(args.clone()));
    }
    fn on_recognized(&self, args: &SpeechRecognitionEventArgs) {
        self.forward(RecognizerEvent::Recognized(args.clone()));
    }
    fn on_canceled(&self, args: &SpeechRecognitionCanceledEventArgs) {
        self.forward(RecognizerEvent::Canceled(args.clone()));
    }
    fn on_connection_event(&self, event: &ConnectionEvent) {
        self.forward(RecognizerEvent::Connection(event.clone()));
    }
    fn on_service_event(&self, args: &ServiceEventArgs) {
        self.forward(RecognizerEvent::Service(args.clone()));
    }
}
