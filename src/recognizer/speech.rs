//! Speech-recognition message handling
//!
//! [`ServiceRecognizerBase`] dispatches the turn-level paths itself and hands
//! everything else to a [`MessageHandler`]. [`SpeechMessageHandler`] turns
//! hypotheses and phrases into observer callbacks and the single-shot outcome.

use std::sync::Arc;

use async_trait::async_trait;

use super::base::ServiceRecognizerBase;
use super::session::RequestSession;
use super::{
    CancellationErrorCode, CancellationReason, RecognitionResult, ResultReason,
    SpeechRecognitionEventArgs,
};
use crate::streaming::protocol::{
    RecognitionStatus, SpeechHypothesis, SpeechPhrase, PATH_SPEECH_FRAGMENT,
    PATH_SPEECH_HYPOTHESIS, PATH_SPEECH_PHRASE,
};
use crate::streaming::SpeechConnectionMessage;

/// Hook for message paths the base does not handle
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Returns false when the message was not recognized, so the base can
    /// surface it as a service event
    async fn process_type_specific_message(
        &self,
        base: &ServiceRecognizerBase,
        session: &Arc<RequestSession>,
        message: &SpeechConnectionMessage,
    ) -> bool;
}

/// What a final phrase status means for the recognition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhraseDisposition {
    Result(ResultReason),
    Cancel(CancellationErrorCode),
    Ignore,
}

fn phrase_disposition(status: RecognitionStatus) -> PhraseDisposition {
    match status {
        RecognitionStatus::Success => PhraseDisposition::Result(ResultReason::RecognizedSpeech),
        RecognitionStatus::NoMatch
        | RecognitionStatus::InitialSilenceTimeout
        | RecognitionStatus::BabbleTimeout => PhraseDisposition::Result(ResultReason::NoMatch),
        RecognitionStatus::EndOfDictation => PhraseDisposition::Ignore,
        RecognitionStatus::Error | RecognitionStatus::Unknown => {
            PhraseDisposition::Cancel(CancellationErrorCode::ServiceError)
        }
        RecognitionStatus::BadRequest => {
            PhraseDisposition::Cancel(CancellationErrorCode::BadRequestParameters)
        }
        RecognitionStatus::Forbidden => PhraseDisposition::Cancel(CancellationErrorCode::Forbidden),
        RecognitionStatus::TooManyRequests => {
            PhraseDisposition::Cancel(CancellationErrorCode::TooManyRequests)
        }
    }
}

fn error_details(code: CancellationErrorCode) -> &'static str {
    match code {
        CancellationErrorCode::ServiceError => "The speech service encountered an internal error",
        CancellationErrorCode::BadRequestParameters => {
            "The speech service rejected the request parameters"
        }
        CancellationErrorCode::Forbidden => "The recognizer is using a free subscription that ran out of quota",
        CancellationErrorCode::TooManyRequests => {
            "The number of parallel requests exceeded the subscription limit"
        }
        _ => "",
    }
}

/// Handles `speech.hypothesis`, `speech.fragment` and `speech.phrase`
#[derive(Debug, Default, Clone, Copy)]
pub struct SpeechMessageHandler;

impl SpeechMessageHandler {
    fn on_hypothesis(
        &self,
        base: &ServiceRecognizerBase,
        session: &Arc<RequestSession>,
        message: &SpeechConnectionMessage,
        body: &str,
    ) {
        let hypothesis: SpeechHypothesis = match serde_json::from_str(body) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("SpeechHandler: bad {} body: {}", message.path, e);
                return;
            }
        };

        let offset = hypothesis.offset + session.current_turn_audio_offset();
        session.on_hypothesis(offset);

        let result = RecognitionResult {
            result_id: message.request_id.clone(),
            reason: ResultReason::RecognizingSpeech,
            text: hypothesis.text,
            offset,
            duration: hypothesis.duration,
            json: body.to_string(),
        };
        base.observer().on_recognizing(&SpeechRecognitionEventArgs {
            session_id: session.session_id(),
            offset,
            result,
        });
    }

    async fn on_phrase(
        &self,
        base: &ServiceRecognizerBase,
        session: &Arc<RequestSession>,
        message: &SpeechConnectionMessage,
        body: &str,
    ) {
        let phrase: SpeechPhrase = match serde_json::from_str(body) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("SpeechHandler: bad speech.phrase body: {}", e);
                return;
            }
        };

        let turn_offset = session.current_turn_audio_offset();
        session.on_phrase_recognized(turn_offset + phrase.offset + phrase.duration);

        let reason = match phrase_disposition(phrase.recognition_status) {
            PhraseDisposition::Ignore => {
                log::debug!("SpeechHandler: ignoring {:?}", phrase.recognition_status);
                return;
            }
            PhraseDisposition::Cancel(code) => {
                log::warn!(
                    "SpeechHandler: phrase status {:?} cancels recognition",
                    phrase.recognition_status
                );
                base.cancel_recognition_local(session, CancellationReason::Error, code, error_details(code))
                    .await;
                return;
            }
            PhraseDisposition::Result(reason) => reason,
        };

        let result = RecognitionResult {
            result_id: message.request_id.clone(),
            reason,
            text: if reason == ResultReason::RecognizedSpeech {
                phrase.text()
            } else {
                String::new()
            },
            offset: turn_offset + phrase.offset,
            duration: phrase.duration,
            json: body.to_string(),
        };

        // A trailing NoMatch after the audio ended carries nothing for the caller
        let trailing_no_match = session.is_speech_ended()
            && reason == ResultReason::NoMatch
            && phrase.recognition_status != RecognitionStatus::InitialSilenceTimeout;
        if !trailing_no_match {
            log::info!(
                "SpeechHandler: {:?} at {} ({} chars)",
                reason,
                result.offset,
                result.text.len()
            );
            base.observer().on_recognized(&SpeechRecognitionEventArgs {
                session_id: session.session_id(),
                offset: result.offset,
                result: result.clone(),
            });
        }

        base.complete_outcome(Ok(result));
    }
}

#[async_trait]
impl MessageHandler for SpeechMessageHandler {
    async fn process_type_specific_message(
        &self,
        base: &ServiceRecognizerBase,
        session: &Arc<RequestSession>,
        message: &SpeechConnectionMessage,
    ) -> bool {
        let path = message.path.to_ascii_lowercase();
        let body = message.text_body().unwrap_or_default();

        match path.as_str() {
            PATH_SPEECH_HYPOTHESIS | PATH_SPEECH_FRAGMENT => {
                self.on_hypothesis(base, session, message, body);
                true
            }
            PATH_SPEECH_PHRASE => {
                self.on_phrase(base, session, message, body).await;
                true
            }
            _ => false,
        }
    }
}
