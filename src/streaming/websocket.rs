//! WebSocket implementation of the connection boundary
//!
//! # Connection Flow
//!
//! 1. `open()` - WebSocket handshake with the auth and `X-ConnectionId` headers
//! 2. A background task reads frames, decodes them and queues them for `read()`
//! 3. `send()` - encode and write one frame
//! 4. `dispose()` - abort the reader and close the socket
//!
//! Handshake rejections (HTTP 401/403) and transport failures are reported as
//! status 1006 so the recognizer refreshes credentials before retrying.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use super::auth::AuthInfo;
use super::codec::{self, WireFrame};
use super::connection::{
    Connection, ConnectionEvent, ConnectionFactory, ConnectionOpenResponse, ConnectionState,
    STATUS_UNAUTHORIZED,
};
use super::message::ConnectionMessage;
use super::StreamingError;
use crate::recognizer::RecognitionMode;
use crate::settings::{OutputFormat, RecognizerConfig};

/// Capacity of the decoded-message queue
const INCOMING_QUEUE: usize = 100;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// State shared with the reader task
struct Shared {
    state: Mutex<ConnectionState>,
    close_status: Mutex<Option<ConnectionOpenResponse>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn record_close(&self, status: ConnectionOpenResponse) {
        let mut close = self.close_status.lock().unwrap_or_else(|e| e.into_inner());
        if close.is_none() {
            *close = Some(status);
        }
    }
}

pub struct WebSocketConnection {
    id: String,
    url: String,
    headers: Vec<(String, String)>,
    connect_timeout: Duration,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    incoming: tokio::sync::Mutex<Option<mpsc::Receiver<Result<ConnectionMessage, StreamingError>>>>,
    events: broadcast::Sender<ConnectionEvent>,
    receiver_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WebSocketConnection {
    pub fn new(
        id: &str,
        url: String,
        headers: Vec<(String, String)>,
        connect_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            id: id.to_string(),
            url,
            headers,
            connect_timeout,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::None),
                close_status: Mutex::new(None),
            }),
            writer: tokio::sync::Mutex::new(None),
            incoming: tokio::sync::Mutex::new(None),
            events,
            receiver_task: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn fail_open(&self, status_code: u16, reason: String) -> ConnectionOpenResponse {
        log::warn!(
            "WebSocket: connection {} failed to open ({}): {}",
            self.id,
            status_code,
            reason
        );
        self.shared.set_state(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::ConnectionEstablishError {
            connection_id: self.id.clone(),
            status_code,
            reason: reason.clone(),
        });
        ConnectionOpenResponse::new(status_code, reason)
    }

    fn build_request(
        &self,
    ) -> Result<tungstenite::handshake::client::Request, StreamingError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamingError::ConnectionFailed {
                status_code: 0,
                reason: e.to_string(),
            })?;

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| StreamingError::AuthenticationFailed(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| StreamingError::AuthenticationFailed(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        Ok(request)
    }

    fn spawn_reader(
        &self,
        mut read: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
        incoming_tx: mpsc::Sender<Result<ConnectionMessage, StreamingError>>,
    ) -> tokio::task::JoinHandle<()> {
        let shared = self.shared.clone();
        let events = self.events.clone();
        let connection_id = self.id.clone();

        tokio::spawn(async move {
            let close = loop {
                let frame = match read.next().await {
                    Some(Ok(Message::Text(text))) => WireFrame::Text(text),
                    Some(Ok(Message::Binary(bytes))) => WireFrame::Binary(bytes),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1000, String::new()));
                        log::info!(
                            "WebSocket: connection {} closed by service ({} {})",
                            connection_id,
                            code,
                            reason
                        );
                        break ConnectionOpenResponse::new(code, reason);
                    }
                    Some(Ok(_)) => continue, // ping/pong
                    Some(Err(e)) => {
                        log::warn!("WebSocket: connection {} error: {}", connection_id, e);
                        break ConnectionOpenResponse::new(STATUS_UNAUTHORIZED, e.to_string());
                    }
                    None => {
                        break ConnectionOpenResponse::new(
                            STATUS_UNAUTHORIZED,
                            "stream ended".to_string(),
                        )
                    }
                };

                let decoded = codec::decode(frame);
                if let Ok(message) = &decoded {
                    let _ = events.send(ConnectionEvent::MessageReceived {
                        connection_id: connection_id.clone(),
                        path: message.path().unwrap_or_default().to_string(),
                    });
                }
                if incoming_tx.send(decoded).await.is_err() {
                    log::debug!("WebSocket: incoming queue closed");
                    return;
                }
            };

            shared.record_close(close.clone());
            shared.set_state(ConnectionState::Disconnected);
            let _ = events.send(ConnectionEvent::ConnectionClosed {
                connection_id,
                status_code: close.status_code,
                reason: close.reason,
            });
            log::debug!("WebSocket: reader task exiting");
        })
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    async fn open(&self) -> ConnectionOpenResponse {
        match self.shared.state() {
            ConnectionState::None => {}
            ConnectionState::Connected => return ConnectionOpenResponse::ok(),
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                return ConnectionOpenResponse::new(
                    STATUS_UNAUTHORIZED,
                    "connection already used".to_string(),
                )
            }
        }

        self.shared.set_state(ConnectionState::Connecting);
        self.emit(ConnectionEvent::ConnectionStart {
            connection_id: self.id.clone(),
        });

        let request = match self.build_request() {
            Ok(request) => request,
            Err(e) => return self.fail_open(STATUS_UNAUTHORIZED, e.to_string()),
        };

        log::info!("WebSocket: connecting {} to {}", self.id, self.url);

        let connected = timeout(
            self.connect_timeout,
            connect_async_with_config(request, None, false),
        )
        .await;

        let ws_stream = match connected {
            Err(_) => return self.fail_open(STATUS_UNAUTHORIZED, "Connection timeout".to_string()),
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status().as_u16();
                let reason = response
                    .status()
                    .canonical_reason()
                    .unwrap_or("HTTP error")
                    .to_string();
                let status = if status == 401 || status == 403 {
                    STATUS_UNAUTHORIZED
                } else {
                    status
                };
                return self.fail_open(status, reason);
            }
            Ok(Err(e)) => return self.fail_open(STATUS_UNAUTHORIZED, e.to_string()),
            Ok(Ok((ws_stream, _response))) => ws_stream,
        };

        let (write, read) = ws_stream.split();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);

        *self.writer.lock().await = Some(write);
        *self.incoming.lock().await = Some(incoming_rx);
        let task = self.spawn_reader(read, incoming_tx);
        *self.receiver_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        self.shared.set_state(ConnectionState::Connected);
        self.emit(ConnectionEvent::ConnectionEstablished {
            connection_id: self.id.clone(),
        });
        log::info!("WebSocket: connection {} established", self.id);

        ConnectionOpenResponse::ok()
    }

    async fn send(&self, message: ConnectionMessage) -> Result<(), StreamingError> {
        if self.shared.state() != ConnectionState::Connected {
            return Err(StreamingError::Disconnected(format!(
                "connection {} is not open",
                self.id
            )));
        }

        let path = message.path().unwrap_or_default().to_string();
        let frame = match codec::encode(&message)? {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(bytes) => Message::Binary(bytes),
        };

        let mut writer = self.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| StreamingError::Disconnected(format!("connection {} has no writer", self.id)))?;

        if let Err(e) = sink.send(frame).await {
            self.shared.record_close(ConnectionOpenResponse::new(
                STATUS_UNAUTHORIZED,
                e.to_string(),
            ));
            self.shared.set_state(ConnectionState::Disconnected);
            return Err(StreamingError::SendFailed(e.to_string()));
        }

        self.emit(ConnectionEvent::MessageSent {
            connection_id: self.id.clone(),
            path,
        });
        Ok(())
    }

    async fn read(&self) -> Result<Option<ConnectionMessage>, StreamingError> {
        let mut incoming = self.incoming.lock().await;
        match incoming.as_mut() {
            Some(rx) => match rx.recv().await {
                Some(Ok(message)) => Ok(Some(message)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn close_status(&self) -> Option<ConnectionOpenResponse> {
        self.shared
            .close_status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn dispose(&self) {
        if let Some(task) = self
            .receiver_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        if let Some(mut sink) = self.writer.lock().await.take() {
            if let Err(e) = sink.close().await {
                log::debug!("WebSocket: error closing {}: {}", self.id, e);
            }
        }

        self.shared.set_state(ConnectionState::Disconnected);
        log::debug!("WebSocket: connection {} disposed", self.id);
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        if let Some(task) = self
            .receiver_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds [`WebSocketConnection`]s for the speech-to-text endpoint
pub struct SpeechConnectionFactory;

impl SpeechConnectionFactory {
    pub fn new() -> Self {
        // Already installed is fine
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self
    }

    /// Endpoint for `mode`, honoring the configured override
    pub fn endpoint_url(config: &RecognizerConfig, mode: RecognitionMode) -> String {
        let base = match &config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!(
                "wss://{}.stt.speech.microsoft.com/speech/recognition/{}/cognitiveservices/v1",
                config.region,
                mode.as_str()
            ),
        };

        let format = match config.output_format {
            OutputFormat::Simple => "simple",
            OutputFormat::Detailed => "detailed",
        };
        let separator = if base.contains('?') { '&' } else { '?' };

        format!(
            "{}{}language={}&format={}",
            base, separator, config.language, format
        )
    }
}

impl Default for SpeechConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionFactory for SpeechConnectionFactory {
    fn create(
        &self,
        config: &RecognizerConfig,
        mode: RecognitionMode,
        auth: &AuthInfo,
        connection_id: &str,
    ) -> Result<Arc<dyn Connection>, StreamingError> {
        let headers = vec![
            (auth.header_name.clone(), auth.token.clone()),
            ("X-ConnectionId".to_string(), connection_id.to_string()),
        ];

        Ok(Arc::new(WebSocketConnection::new(
            connection_id,
            Self::endpoint_url(config, mode),
            headers,
            Duration::from_millis(config.connection_timeout_ms),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_from_region() {
        let config = RecognizerConfig::default();
        let url = SpeechConnectionFactory::endpoint_url(&config, RecognitionMode::Interactive);
        assert_eq!(
            url,
            "wss://westus.stt.speech.microsoft.com/speech/recognition/interactive/cognitiveservices/v1?language=en-US&format=simple"
        );
    }

    #[test]
    fn test_endpoint_override_keeps_query() {
        let config = RecognizerConfig {
            endpoint: Some("wss://example.test/stt?cid=1".to_string()),
            output_format: OutputFormat::Detailed,
            ..Default::default()
        };
        let url = SpeechConnectionFactory::endpoint_url(&config, RecognitionMode::Dictation);
        assert_eq!(url, "wss://example.test/stt?cid=1&language=en-US&format=detailed");
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let connection = WebSocketConnection::new(
            "conn",
            "wss://127.0.0.1:9/".to_string(),
            Vec::new(),
            Duration::from_millis(200),
        );
        let message = ConnectionMessage::new(
            super::super::message::MessageType::Text,
            Default::default(),
            Default::default(),
        );
        assert!(matches!(
            connection.send(message).await,
            Err(StreamingError::Disconnected(_))
        ));
        assert_eq!(connection.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_unauthorized_sentinel() {
        let factory = SpeechConnectionFactory::new();
        let config = RecognizerConfig {
            endpoint: Some("ws://127.0.0.1:9/stt".to_string()),
            connection_timeout_ms: 500,
            ..Default::default()
        };
        let auth = AuthInfo::new("Ocp-Apim-Subscription-Key", "key");
        let connection = factory
            .create(&config, RecognitionMode::Interactive, &auth, "CONN1")
            .unwrap();

        let response = connection.open().await;
        assert_eq!(response.status_code, STATUS_UNAUTHORIZED);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
