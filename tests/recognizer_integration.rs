//! Recognizer tests against a scripted in-memory speech service
//!
//! Each `MockConnection` runs a script that reacts to what the client sends:
//! replying with service messages, closing the socket with a code, or waiting
//! until the client has consumed every reply.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use speech_lib::audio::{AudioStreamFormat, DeviceType, PushAudioSource, WavFileAudioSource};
use speech_lib::recognizer::{
    CancellationErrorCode, CancellationReason, ChannelObserver, RecognitionMode, RecognizerEvent,
    ResultReason, ServiceRecognizerBase,
};
use speech_lib::settings::RecognizerConfig;
use speech_lib::streaming::message::{HEADER_CONTENT_TYPE, HEADER_PATH, HEADER_REQUEST_ID};
use speech_lib::streaming::{
    AuthInfo, Authentication, Connection, ConnectionEvent, ConnectionFactory, ConnectionMessage,
    ConnectionOpenResponse, ConnectionState, MessageBody, MessageType, StreamingError,
};
use speech_lib::telemetry::TelemetryCollector;

// ============================================================================
// Scripted service
// ============================================================================

enum Action {
    Reply(&'static str, String),
    /// Replies sent in order from a background task after a delay
    ReplyAfter(Duration, Vec<(&'static str, String)>),
    Malformed,
    /// Block the client's send until it has processed every reply and is reading again
    WaitIdle,
    Close(u16),
}

/// A client message as seen by the script
struct Sent<'a> {
    connection_index: usize,
    path: &'a str,
    request_id: &'a str,
    /// 1-based index of an audio data chunk on this connection, 0 otherwise
    audio_index: usize,
    is_end_of_audio: bool,
}

type Script = Arc<dyn Fn(&Sent) -> Vec<Action> + Send + Sync>;

type Inbound = Result<ConnectionMessage, StreamingError>;

struct MockConnection {
    id: String,
    index: usize,
    open_status: u16,
    script: Script,
    state: Mutex<ConnectionState>,
    close: Mutex<Option<ConnectionOpenResponse>>,
    sent: Mutex<Vec<ConnectionMessage>>,
    audio_chunks: AtomicUsize,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Inbound>>,
    pending: Arc<AtomicUsize>,
    reader_idle: AtomicBool,
    closed: CancellationToken,
    events: broadcast::Sender<ConnectionEvent>,
}

fn service_message(path: &str, request_id: &str, body: String) -> ConnectionMessage {
    let mut headers = BTreeMap::new();
    headers.insert(HEADER_PATH.to_string(), path.to_string());
    headers.insert(HEADER_REQUEST_ID.to_string(), request_id.to_string());
    ConnectionMessage::new(MessageType::Text, headers, MessageBody::Text(body))
}

impl MockConnection {
    fn new(index: usize, id: &str, open_status: u16, script: Script) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        Self {
            id: id.to_string(),
            index,
            open_status,
            script,
            state: Mutex::new(ConnectionState::None),
            close: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            audio_chunks: AtomicUsize::new(0),
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            pending: Arc::new(AtomicUsize::new(0)),
            reader_idle: AtomicBool::new(false),
            closed: CancellationToken::new(),
            events,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn enqueue(&self, item: Inbound) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _ = self.inbound_tx.send(item);
    }

    async fn wait_idle(&self) {
        for _ in 0..2_500 {
            if self.pending.load(Ordering::SeqCst) == 0 && self.reader_idle.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("client never drained the scripted replies");
    }

    fn close_with(&self, status_code: u16) {
        self.set_state(ConnectionState::Disconnected);
        *self.close.lock().unwrap() = Some(ConnectionOpenResponse::new(status_code, "scripted close"));
        let _ = self.events.send(ConnectionEvent::ConnectionClosed {
            connection_id: self.id.clone(),
            status_code,
            reason: "scripted close".to_string(),
        });
        self.closed.cancel();
    }

    fn sent(&self) -> Vec<ConnectionMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_paths(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|m| m.path().unwrap_or_default().to_string())
            .collect()
    }

    /// Audio data bytes, excluding the RIFF header and the end marker
    fn audio_bytes(&self) -> Vec<u8> {
        self.sent()
            .iter()
            .filter(|m| m.path() == Some("audio") && m.header(HEADER_CONTENT_TYPE).is_none())
            .filter_map(|m| m.body.as_bytes().map(|b| b.to_vec()))
            .flatten()
            .collect()
    }

    /// Every audio message carries a request id announced by an earlier `speech.context`
    fn audio_uses_announced_request_ids(&self) -> bool {
        let mut announced = Vec::new();
        for message in self.sent() {
            let request_id = message.request_id().unwrap_or_default().to_string();
            match message.path() {
                Some("speech.context") => announced.push(request_id),
                Some("audio") if !announced.contains(&request_id) => return false,
                _ => {}
            }
        }
        true
    }

    fn request_ids_for(&self, path: &str) -> Vec<String> {
        self.sent()
            .iter()
            .filter(|m| m.path() == Some(path))
            .map(|m| m.request_id().unwrap_or_default().to_string())
            .collect()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn open(&self) -> ConnectionOpenResponse {
        let _ = self.events.send(ConnectionEvent::ConnectionStart {
            connection_id: self.id.clone(),
        });
        if self.open_status == 200 {
            self.set_state(ConnectionState::Connected);
            let _ = self.events.send(ConnectionEvent::ConnectionEstablished {
                connection_id: self.id.clone(),
            });
            ConnectionOpenResponse::ok()
        } else {
            self.set_state(ConnectionState::Disconnected);
            let _ = self.events.send(ConnectionEvent::ConnectionEstablishError {
                connection_id: self.id.clone(),
                status_code: self.open_status,
                reason: "scripted failure".to_string(),
            });
            ConnectionOpenResponse::new(self.open_status, "scripted failure")
        }
    }

    async fn send(&self, message: ConnectionMessage) -> Result<(), StreamingError> {
        if self.state() != ConnectionState::Connected {
            return Err(StreamingError::SendFailed("not connected".to_string()));
        }

        let path = message.path().unwrap_or_default().to_string();
        let request_id = message.request_id().unwrap_or_default().to_string();
        let is_audio = path == "audio" && message.header(HEADER_CONTENT_TYPE).is_none();
        let is_end_of_audio = is_audio && message.body.is_empty();
        let audio_index = if is_audio && !is_end_of_audio {
            self.audio_chunks.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            0
        };
        self.sent.lock().unwrap().push(message);

        let actions = (self.script)(&Sent {
            connection_index: self.index,
            path: &path,
            request_id: &request_id,
            audio_index,
            is_end_of_audio,
        });
        for action in actions {
            match action {
                Action::Reply(path, body) => {
                    self.enqueue(Ok(service_message(path, &request_id, body)));
                }
                Action::ReplyAfter(delay, replies) => {
                    let tx = self.inbound_tx.clone();
                    let pending = self.pending.clone();
                    let messages: Vec<_> = replies
                        .into_iter()
                        .map(|(path, body)| service_message(path, &request_id, body))
                        .collect();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        for message in messages {
                            pending.fetch_add(1, Ordering::SeqCst);
                            let _ = tx.send(Ok(message));
                        }
                    });
                }
                Action::Malformed => {
                    self.enqueue(Err(StreamingError::MalformedMessage(
                        "header length exceeds frame".to_string(),
                    )));
                }
                Action::WaitIdle => self.wait_idle().await,
                Action::Close(code) => self.close_with(code),
            }
        }
        Ok(())
    }

    async fn read(&self) -> Result<Option<ConnectionMessage>, StreamingError> {
        if self.pending.load(Ordering::SeqCst) == 0 {
            self.reader_idle.store(true, Ordering::SeqCst);
        }
        let mut rx = self.inbound_rx.lock().await;
        let item = tokio::select! {
            biased;
            item = rx.recv() => item,
            _ = self.closed.cancelled() => None,
        };

        match item {
            Some(item) => {
                self.reader_idle.store(false, Ordering::SeqCst);
                self.pending.fetch_sub(1, Ordering::SeqCst);
                item.map(Some)
            }
            None => Ok(None),
        }
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn close_status(&self) -> Option<ConnectionOpenResponse> {
        self.close.lock().unwrap().clone()
    }

    async fn dispose(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.closed.cancel();
    }
}

struct MockFactory {
    open_statuses: Mutex<VecDeque<u16>>,
    script: Script,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockFactory {
    fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.connections.lock().unwrap()[index].clone()
    }

    fn created(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

impl ConnectionFactory for MockFactory {
    fn create(
        &self,
        _config: &RecognizerConfig,
        _mode: RecognitionMode,
        auth: &AuthInfo,
        connection_id: &str,
    ) -> Result<Arc<dyn Connection>, StreamingError> {
        assert_eq!(auth.header_name, "Ocp-Apim-Subscription-Key");
        let status = self.open_statuses.lock().unwrap().pop_front().unwrap_or(200);
        let mut connections = self.connections.lock().unwrap();
        let connection = Arc::new(MockConnection::new(
            connections.len(),
            connection_id,
            status,
            self.script.clone(),
        ));
        connections.push(connection.clone());
        Ok(connection)
    }
}

#[derive(Default)]
struct MockAuth {
    fetches: AtomicUsize,
    expiry_fetches: AtomicUsize,
}

#[async_trait]
impl Authentication for MockAuth {
    async fn fetch(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo, StreamingError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(AuthInfo::new("Ocp-Apim-Subscription-Key", "key"))
    }

    async fn fetch_on_expiry(&self, _auth_fetch_event_id: &str) -> Result<AuthInfo, StreamingError> {
        self.expiry_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(AuthInfo::new("Ocp-Apim-Subscription-Key", "fresh-key"))
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    recognizer: Arc<ServiceRecognizerBase>,
    factory: Arc<MockFactory>,
    auth: Arc<MockAuth>,
    telemetry: Arc<TelemetryCollector>,
    events: mpsc::UnboundedReceiver<RecognizerEvent>,
}

fn test_config() -> RecognizerConfig {
    RecognizerConfig {
        interactive_timeout_ms: 5_000,
        continuous_timeout_ms: 5_000,
        ..Default::default()
    }
}

fn pcm(ms: u32) -> Vec<u8> {
    let format = AudioStreamFormat::default();
    (0..format.bytes_for_duration_ms(ms))
        .map(|i| (i % 251) as u8)
        .collect()
}

fn harness_with_source(
    config: RecognizerConfig,
    open_statuses: Vec<u16>,
    script: Script,
    source: Arc<dyn speech_lib::audio::AudioSource>,
) -> Harness {
    let factory = Arc::new(MockFactory {
        open_statuses: Mutex::new(open_statuses.into()),
        script,
        connections: Mutex::new(Vec::new()),
    });
    let auth = Arc::new(MockAuth::default());
    let telemetry = Arc::new(TelemetryCollector::new());
    let (observer, events) = ChannelObserver::new();

    let recognizer = Arc::new(
        ServiceRecognizerBase::new(
            config,
            auth.clone(),
            factory.clone(),
            source,
            Arc::new(observer),
        )
        .with_telemetry_sink(telemetry.clone()),
    );

    Harness {
        recognizer,
        factory,
        auth,
        telemetry,
        events,
    }
}

fn harness(config: RecognizerConfig, open_statuses: Vec<u16>, audio: Vec<u8>, script: Script) -> Harness {
    let source = Arc::new(WavFileAudioSource::from_pcm(AudioStreamFormat::default(), audio));
    harness_with_source(config, open_statuses, script, source)
}

async fn events_until_stopped(events: &mut mpsc::UnboundedReceiver<RecognizerEvent>) -> Vec<RecognizerEvent> {
    let mut seen = Vec::new();
    let collect = async {
        while let Some(event) = events.recv().await {
            let stopped = matches!(event, RecognizerEvent::SessionStopped(_));
            seen.push(event);
            if stopped {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("session never stopped");
    seen
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..2_500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn count(events: &[RecognizerEvent], pred: impl Fn(&RecognizerEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

fn phrase(text: &str, offset: u64, duration: u64) -> String {
    serde_json::json!({
        "RecognitionStatus": "Success",
        "DisplayText": text,
        "Offset": offset,
        "Duration": duration,
    })
    .to_string()
}

/// A service that answers the end of the audio with one phrase
fn single_phrase_script() -> Script {
    Arc::new(|sent: &Sent| {
        if sent.audio_index == 1 {
            return vec![
                Action::Reply("turn.start", r#"{"context":{"serviceTag":"tag"}}"#.to_string()),
                Action::Reply("speech.startDetected", r#"{"Offset":1000000}"#.to_string()),
            ];
        }
        if sent.is_end_of_audio {
            return vec![
                Action::Reply(
                    "speech.hypothesis",
                    r#"{"Text":"hello","Offset":1000000,"Duration":5000000}"#.to_string(),
                ),
                Action::Reply("speech.endDetected", r#"{"Offset":29000000}"#.to_string()),
                Action::Reply("speech.phrase", phrase("Hello world.", 1_000_000, 20_000_000)),
                Action::Reply("turn.end", "{}".to_string()),
            ];
        }
        Vec::new()
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_interactive_recognition_succeeds() {
    let audio = pcm(3_000);
    let mut h = harness(test_config(), vec![], audio.clone(), single_phrase_script());

    let outcome = h.recognizer.recognize_once().await;
    let result = outcome.expect("recognition should succeed");
    assert_eq!(result.reason, ResultReason::RecognizedSpeech);
    assert_eq!(result.text, "Hello world.");
    assert_eq!(result.offset, 1_000_000);

    let events = events_until_stopped(&mut h.events).await;
    assert_eq!(count(&events, |e| matches!(e, RecognizerEvent::Recognized(_))), 1);
    assert_eq!(count(&events, |e| matches!(e, RecognizerEvent::Recognizing(_))), 1);
    assert_eq!(count(&events, |e| matches!(e, RecognizerEvent::SessionStarted(_))), 1);
    assert_eq!(count(&events, |e| matches!(e, RecognizerEvent::Canceled(_))), 0);
    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.auth.fetches.load(Ordering::SeqCst), 1);

    let connection = h.factory.connection(0);
    let paths = connection.sent_paths();
    assert_eq!(paths[0], "speech.config");
    assert_eq!(paths[1], "speech.context");
    assert_eq!(paths[2], "audio");
    assert_eq!(
        connection.sent()[2].header(HEADER_CONTENT_TYPE),
        Some("audio/x-wav")
    );
    assert!(paths.contains(&"telemetry".to_string()));
    assert_eq!(connection.audio_bytes(), audio);

    // The audio went out under the request id announced in speech.context
    let context_id = &connection.request_ids_for("speech.context")[0];
    assert!(connection
        .request_ids_for("audio")
        .iter()
        .all(|id| id == context_id));

    let history = h.telemetry.get_history();
    assert_eq!(history.len(), 1);
    assert!(history[0].payload["ReceivedMessages"]["speech.phrase"].is_array());

    h.recognizer.dispose().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let mut h = harness(test_config(), vec![503, 503], pcm(1_000), single_phrase_script());

    let result = h.recognizer.recognize_once().await.expect("third attempt succeeds");
    assert_eq!(result.text, "Hello world.");
    assert_eq!(h.factory.created(), 3);
    assert_eq!(h.auth.fetches.load(Ordering::SeqCst), 3);
    assert_eq!(h.auth.expiry_fetches.load(Ordering::SeqCst), 0);

    let events = events_until_stopped(&mut h.events).await;
    let failures = count(&events, |e| {
        matches!(e, RecognizerEvent::Connection(ConnectionEvent::ConnectionEstablishError { .. }))
    });
    assert_eq!(failures, 2);
    h.recognizer.dispose().await;
}

#[tokio::test]
async fn test_retries_exhausted_cancels_with_connection_failure() {
    let config = RecognizerConfig {
        max_retry_count: 2,
        ..test_config()
    };
    let mut h = harness(config, vec![503; 10], pcm(1_000), single_phrase_script());

    let details = h.recognizer.recognize_once().await.unwrap_err();
    assert_eq!(details.reason, CancellationReason::Error);
    assert_eq!(details.error_code, CancellationErrorCode::ConnectionFailure);
    assert!(details.error_details.contains("503"));
    assert_eq!(h.factory.created(), 3);

    let events = events_until_stopped(&mut h.events).await;
    assert_eq!(count(&events, |e| matches!(e, RecognizerEvent::Canceled(_))), 1);
    assert_eq!(count(&events, |e| matches!(e, RecognizerEvent::SessionStarted(_))), 0);
    h.recognizer.dispose().await;
}

#[tokio::test]
async fn test_unauthorized_refreshes_credentials() {
    let mut h = harness(test_config(), vec![1006], pcm(1_000), single_phrase_script());

    let result = h.recognizer.recognize_once().await.expect("retry with fresh credentials");
    assert_eq!(result.text, "Hello world.");
    assert_eq!(h.auth.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.auth.expiry_fetches.load(Ordering::SeqCst), 1);

    events_until_stopped(&mut h.events).await;
    h.recognizer.dispose().await;
}

#[tokio::test]
async fn test_bad_request_close_cancels_without_reconnect() {
    let script: Script = Arc::new(|sent: &Sent| {
        if sent.audio_index == 3 {
            vec![Action::Close(1007)]
        } else {
            Vec::new()
        }
    });
    let mut h = harness(test_config(), vec![], pcm(2_000), script);

    let details = h.recognizer.recognize_once().await.unwrap_err();
    assert_eq!(details.error_code, CancellationErrorCode::BadRequestParameters);
    assert!(details.error_details.contains("1007"));

    let events = events_until_stopped(&mut h.events).await;
    assert_eq!(count(&events, |e| matches!(e, RecognizerEvent::Canceled(_))), 1);

    // Give the loops a moment to prove they stay quiet
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.factory.created(), 1);
    assert_eq!(h.factory.connection(0).audio_bytes().len(), 3 * 3_200);
    h.recognizer.dispose().await;
}

#[tokio::test]
async fn test_dropped_connection_replays_unconfirmed_audio() {
    let script: Script = Arc::new(|sent: &Sent| {
        match (sent.connection_index, sent.audio_index) {
            // Confirm the first 500ms (16000 bytes), then drop the socket
            (0, 5) => vec![Action::Reply("speech.phrase", phrase("first half", 0, 5_000_000))],
            (0, 10) => vec![Action::WaitIdle, Action::Close(1006)],
            (1, _) if sent.is_end_of_audio => vec![Action::ReplyAfter(
                Duration::from_millis(100),
                vec![("turn.end", "{}".to_string())],
            )],
            _ => Vec::new(),
        }
    });
    let audio = pcm(2_000);
    let mut h = harness(test_config(), vec![], audio.clone(), script);

    h.recognizer
        .start_continuous(RecognitionMode::Conversation)
        .await
        .unwrap();
    let events = events_until_stopped(&mut h.events).await;

    assert_eq!(count(&events, |e| matches!(e, RecognizerEvent::Canceled(_))), 0);
    assert_eq!(h.factory.created(), 2);

    let replayed = h.factory.connection(1).audio_bytes();
    assert_eq!(replayed, audio[16_000..].to_vec());

    assert!(h.factory.connection(1).audio_uses_announced_request_ids());

    // The new socket is configured from scratch
    let paths = h.factory.connection(1).sent_paths();
    assert_eq!(paths[0], "speech.config");
    assert_eq!(paths[1], "speech.context");

    let session_ids: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            RecognizerEvent::SessionStarted(args) | RecognizerEvent::SessionStopped(args) => {
                Some(args.session_id.clone())
            }
            RecognizerEvent::Recognized(args) => Some(args.session_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(session_ids.len(), 3);
    assert!(session_ids.iter().all(|id| id == &session_ids[0]));
    h.recognizer.dispose().await;
}

#[tokio::test]
async fn test_continuous_turn_end_starts_new_request() {
    let script: Script = Arc::new(|sent: &Sent| {
        if sent.audio_index == 3 {
            return vec![
                Action::Reply("turn.start", "{}".to_string()),
                Action::Reply("speech.phrase", phrase("first", 0, 3_000_000)),
                Action::Reply("turn.end", "{}".to_string()),
                Action::WaitIdle,
            ];
        }
        if sent.is_end_of_audio {
            return vec![Action::ReplyAfter(
                Duration::from_millis(100),
                vec![
                    ("turn.start", "{}".to_string()),
                    ("speech.phrase", phrase("second", 0, 1_000_000)),
                    ("turn.end", "{}".to_string()),
                ],
            )];
        }
        Vec::new()
    });
    let mut h = harness(test_config(), vec![], pcm(2_000), script);

    h.recognizer
        .start_continuous(RecognitionMode::Conversation)
        .await
        .unwrap();
    let events = events_until_stopped(&mut h.events).await;

    let recognized: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RecognizerEvent::Recognized(args) => Some(args.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(recognized.len(), 2);
    assert_eq!(recognized[0].result.text, "first");
    assert_eq!(recognized[1].result.text, "second");
    assert_eq!(recognized[1].offset, 3_000_000);
    assert_eq!(recognized[0].session_id, recognized[1].session_id);

    assert!(h.factory.connection(0).audio_uses_announced_request_ids());
    let contexts = h.factory.connection(0).request_ids_for("speech.context");
    assert_eq!(contexts.len(), 2);
    assert_ne!(contexts[0], contexts[1]);
    assert_eq!(h.factory.created(), 1);

    // End of the file is reported once as EndOfStream
    let canceled: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RecognizerEvent::Canceled(args) => Some(args.details.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(canceled.len(), 1);
    assert_eq!(canceled[0].reason, CancellationReason::EndOfStream);
    assert_eq!(canceled[0].error_code, CancellationErrorCode::NoError);
    assert_eq!(count(&events, |e| matches!(e, RecognizerEvent::SessionStopped(_))), 1);
    h.recognizer.dispose().await;
}

#[tokio::test]
async fn test_malformed_message_is_skipped() {
    let phrase_script = single_phrase_script();
    let script: Script = Arc::new(move |sent: &Sent| {
        let mut actions = Vec::new();
        if sent.audio_index == 2 {
            actions.push(Action::Malformed);
            actions.push(Action::Reply("speech.unknownpath", "{}".to_string()));
        }
        actions.extend(phrase_script(sent));
        actions
    });
    let mut h = harness(test_config(), vec![], pcm(1_000), script);

    let result = h.recognizer.recognize_once().await.expect("malformed frame is ignored");
    assert_eq!(result.text, "Hello world.");

    let events = events_until_stopped(&mut h.events).await;
    let service_events = count(&events, |e| {
        matches!(e, RecognizerEvent::Service(args) if args.path == "speech.unknownpath")
    });
    assert_eq!(service_events, 1);
    h.recognizer.dispose().await;
}

#[tokio::test]
async fn test_silent_service_times_out() {
    let config = RecognizerConfig {
        interactive_timeout_ms: 300,
        ..test_config()
    };
    let script: Script = Arc::new(|_: &Sent| Vec::new());
    let mut h = harness(config, vec![], pcm(500), script);

    let details = h.recognizer.recognize_once().await.unwrap_err();
    assert_eq!(details.error_code, CancellationErrorCode::ServiceTimeout);

    events_until_stopped(&mut h.events).await;
    h.recognizer.dispose().await;
}

#[tokio::test]
async fn test_stop_recognizing_live_source() {
    let (source, writer) =
        PushAudioSource::with_device_type(AudioStreamFormat::default(), DeviceType::Microphones);
    let script: Script = Arc::new(|_: &Sent| Vec::new());
    let mut h = harness_with_source(test_config(), vec![], script, Arc::new(source));

    h.recognizer
        .start_continuous(RecognitionMode::Conversation)
        .await
        .unwrap();
    for _ in 0..3 {
        writer.write(vec![7u8; 3_200]).unwrap();
    }

    let connection = h.factory.connection(0);
    for _ in 0..500 {
        if connection.audio_bytes().len() == 3 * 3_200 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(connection.audio_bytes().len(), 3 * 3_200);

    h.recognizer.stop_recognizing().await.unwrap();
    let events = events_until_stopped(&mut h.events).await;
    assert_eq!(count(&events, |e| matches!(e, RecognizerEvent::Canceled(_))), 0);

    let end_markers = connection
        .sent()
        .iter()
        .filter(|m| m.path() == Some("audio") && m.body.is_empty())
        .count();
    assert_eq!(end_markers, 1);
    h.recognizer.dispose().await;
}

#[tokio::test]
async fn test_reconnect_while_waiting_for_live_audio_replays_everything() {
    let (source, writer) =
        PushAudioSource::with_device_type(AudioStreamFormat::default(), DeviceType::Microphones);
    let script: Script = Arc::new(|_: &Sent| Vec::new());
    let mut h = harness_with_source(test_config(), vec![], script, Arc::new(source));

    h.recognizer
        .start_continuous(RecognitionMode::Conversation)
        .await
        .unwrap();
    for value in 1..=3u8 {
        writer.write(vec![value; 3_200]).unwrap();
    }
    let first = h.factory.connection(0);
    wait_until("three chunks on the first connection", || {
        first.audio_bytes().len() == 3 * 3_200
    })
    .await;

    // Drop the socket while the send loop is blocked on the microphone
    first.close_with(1000);
    let factory = h.factory.clone();
    wait_until("the second connection to be configured", || {
        factory.created() == 2
            && factory
                .connection(1)
                .sent()
                .iter()
                .any(|m| m.header(HEADER_CONTENT_TYPE) == Some("audio/x-wav"))
    })
    .await;

    writer.write(vec![4u8; 3_200]).unwrap();
    let second = h.factory.connection(1);
    wait_until("the replay and the new chunk", || {
        second.audio_bytes().len() >= 4 * 3_200
    })
    .await;

    // Nothing confirmed, so the whole stream is replayed in order
    let mut expected = Vec::new();
    for value in 1..=4u8 {
        expected.extend(vec![value; 3_200]);
    }
    assert_eq!(second.audio_bytes(), expected);
    assert!(second.audio_uses_announced_request_ids());

    h.recognizer.stop_recognizing().await.unwrap();
    let events = events_until_stopped(&mut h.events).await;
    assert_eq!(count(&events, |e| matches!(e, RecognizerEvent::Canceled(_))), 0);
    h.recognizer.dispose().await;
}
