//! Streaming speech recognition client engine
//!
//! Audio from an [`audio::AudioSource`] is uploaded over a duplex connection to
//! the speech service while results stream back. The engine reconnects on
//! transient failures and replays any audio the service has not confirmed.

pub mod audio;
pub mod recognizer;
pub mod settings;
pub mod streaming;
pub mod telemetry;

pub use recognizer::{
    CancellationDetails, CancellationErrorCode, CancellationReason, ChannelObserver,
    RecognitionMode, RecognitionOutcome, RecognitionResult, RecognizerEvent, RecognizerObserver,
    ResultReason, ServiceRecognizerBase,
};
pub use settings::RecognizerConfig;
pub use streaming::StreamingError;
