//! The duplex connection boundary the recognizer talks through

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::auth::AuthInfo;
use super::message::ConnectionMessage;
use super::StreamingError;
use crate::recognizer::RecognitionMode;
use crate::settings::RecognizerConfig;

/// Status reported when the service rejects credentials or the socket closes abnormally
pub const STATUS_UNAUTHORIZED: u16 = 1006;
/// Close code for a request the service refuses to process
pub const STATUS_BAD_REQUEST: u16 = 1007;

/// Lifecycle of one physical connection; never goes backwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    None,
    Connecting,
    Connected,
    Disconnected,
}

/// Result of opening a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOpenResponse {
    pub status_code: u16,
    pub reason: String,
}

impl ConnectionOpenResponse {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            status_code,
            reason: reason.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "")
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// Observable connection events, forwarded to telemetry and recognizer observers
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnectionStart {
        connection_id: String,
    },
    ConnectionEstablished {
        connection_id: String,
    },
    ConnectionEstablishError {
        connection_id: String,
        status_code: u16,
        reason: String,
    },
    ConnectionClosed {
        connection_id: String,
        status_code: u16,
        reason: String,
    },
    MessageSent {
        connection_id: String,
        path: String,
    },
    MessageReceived {
        connection_id: String,
        path: String,
    },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> &str {
        match self {
            ConnectionEvent::ConnectionStart { connection_id }
            | ConnectionEvent::ConnectionEstablished { connection_id }
            | ConnectionEvent::ConnectionEstablishError { connection_id, .. }
            | ConnectionEvent::ConnectionClosed { connection_id, .. }
            | ConnectionEvent::MessageSent { connection_id, .. }
            | ConnectionEvent::MessageReceived { connection_id, .. } => connection_id,
        }
    }
}

/// A duplex message channel to the service
///
/// Implementations are shared behind `Arc` by the send and receive loops, so
/// every method takes `&self`.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> &str;

    fn state(&self) -> ConnectionState;

    async fn open(&self) -> ConnectionOpenResponse;

    async fn send(&self, message: ConnectionMessage) -> Result<(), StreamingError>;

    /// Next inbound message, or `None` once the connection has ended
    async fn read(&self) -> Result<Option<ConnectionMessage>, StreamingError>;

    fn events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Close code and reason once the peer has closed the connection
    fn close_status(&self) -> Option<ConnectionOpenResponse> {
        None
    }

    async fn dispose(&self);
}

/// Produces ready-to-open connections
pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: &RecognizerConfig,
        mode: RecognitionMode,
        auth: &AuthInfo,
        connection_id: &str,
    ) -> Result<std::sync::Arc<dyn Connection>, StreamingError>;
}
