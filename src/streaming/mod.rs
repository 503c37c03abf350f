//! Protocol and transport layer for the speech service
//!
//! # Architecture
//!
//! ```text
//!  SpeechConnectionMessage ──▶ ConnectionMessage ──encode──▶ WireFrame ──▶ WebSocket
//!                                                                            │
//!  SpeechConnectionMessage ◀── ConnectionMessage ◀──decode── WireFrame ◀─────┘
//! ```
//!
//! [`Connection`] and [`ConnectionFactory`] are the seam the recognizer talks
//! through; [`WebSocketConnection`] is the production implementation and tests
//! substitute scripted in-memory connections.

pub mod auth;
pub mod codec;
pub mod connection;
pub mod message;
pub mod protocol;
pub mod websocket;

pub use auth::{AuthInfo, Authentication, SubscriptionKeyAuthentication, TokenAuthentication};
pub use codec::{decode, encode, WireFrame};
pub use connection::{
    Connection, ConnectionEvent, ConnectionFactory, ConnectionOpenResponse, ConnectionState,
};
pub use message::{ConnectionMessage, MessageBody, MessageType, SpeechConnectionMessage};
pub use websocket::{SpeechConnectionFactory, WebSocketConnection};

use crate::audio::AudioError;

/// Errors raised by the protocol and transport layer
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamingError {
    /// No subscription key or token configured
    #[error("Speech credentials not configured. Set SPEECH_KEY environment variable.")]
    MissingCredentials,
    /// Connection could not be opened, retries exhausted
    #[error("Failed to connect to the speech service ({status_code}): {reason}")]
    ConnectionFailed { status_code: u16, reason: String },
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    /// Wire frame could not be decoded
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    /// Message is missing mandatory headers or has an unusable body
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Connection disconnected: {0}")]
    Disconnected(String),
    #[error("Failed to send message: {0}")]
    SendFailed(String),
    #[error("Audio source error: {0}")]
    Audio(#[from] AudioError),
    #[error("Recognition canceled: {0}")]
    Canceled(String),
    #[error("Recognizer has been disposed")]
    Disposed,
}
