use std::process::ExitCode;
use std::sync::Arc;

use speech_lib::audio::replayable::TICKS_PER_SECOND;
use speech_lib::audio::WavFileAudioSource;
use speech_lib::settings::{default_settings_path, load_settings};
use speech_lib::streaming::{
    Authentication, SpeechConnectionFactory, SubscriptionKeyAuthentication, TokenAuthentication,
};
use speech_lib::telemetry::TelemetryCollector;
use speech_lib::{
    ChannelObserver, RecognitionMode, RecognizerConfig, RecognizerEvent, ResultReason,
    ServiceRecognizerBase,
};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: vokey-speech <file.wav> [interactive|conversation|dictation]";

fn load_config() -> RecognizerConfig {
    let mut config = match default_settings_path() {
        Ok(path) => load_settings(&path),
        Err(e) => {
            log::warn!("{}, using default settings", e);
            RecognizerConfig::default()
        }
    };

    if let Ok(region) = std::env::var("SPEECH_REGION") {
        config.region = region;
    }
    if let Ok(endpoint) = std::env::var("SPEECH_ENDPOINT") {
        config.endpoint = Some(endpoint);
    }
    config
}

fn authentication(config: &RecognizerConfig) -> Result<Arc<dyn Authentication>, String> {
    let key = std::env::var("SPEECH_KEY").unwrap_or_default();
    // SPEECH_USE_TOKEN exchanges the key for short-lived bearer tokens
    if std::env::var("SPEECH_USE_TOKEN").is_ok() {
        let auth = TokenAuthentication::new(key, &config.region).map_err(|e| e.to_string())?;
        Ok(Arc::new(auth))
    } else {
        let auth = SubscriptionKeyAuthentication::new(key).map_err(|e| e.to_string())?;
        Ok(Arc::new(auth))
    }
}

fn seconds(ticks: u64) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

async fn run() -> Result<(), String> {
    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or_else(|| USAGE.to_string())?;
    let mode = match args.next() {
        Some(mode) => mode.parse::<RecognitionMode>()?,
        None => RecognitionMode::Interactive,
    };

    let config = load_config();
    let auth = authentication(&config)?;
    let source = WavFileAudioSource::open(&path).map_err(|e| e.to_string())?;
    log::info!("Transcribing {} ({} bytes, {} mode)", path, source.byte_len(), mode.as_str());

    let (observer, mut events) = ChannelObserver::new();
    let recognizer = Arc::new(
        ServiceRecognizerBase::new(
            config,
            auth,
            Arc::new(SpeechConnectionFactory::new()),
            Arc::new(source),
            Arc::new(observer),
        )
        .with_telemetry_sink(Arc::new(TelemetryCollector::new())),
    );

    let started = if mode.is_continuous() {
        recognizer.start_continuous(mode).await
    } else {
        recognizer.recognize(mode, None).await
    };
    if let Err(e) = started {
        recognizer.dispose().await;
        return Err(e.to_string());
    }

    let mut failure = None;
    while let Some(event) = events.recv().await {
        match event {
            RecognizerEvent::Recognizing(args) => {
                log::debug!("recognizing: {}", args.result.text);
            }
            RecognizerEvent::Recognized(args) => match args.result.reason {
                ResultReason::RecognizedSpeech => {
                    println!("[{:>7.2}s] {}", seconds(args.offset), args.result.text);
                }
                _ => println!("[{:>7.2}s] (no match)", seconds(args.offset)),
            },
            RecognizerEvent::Canceled(args) => {
                if args.details.reason == speech_lib::CancellationReason::Error {
                    failure = Some(args.details.to_string());
                }
            }
            RecognizerEvent::SessionStopped(_) => break,
            _ => {}
        }
    }

    recognizer.dispose().await;
    match failure {
        Some(details) => Err(details),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
