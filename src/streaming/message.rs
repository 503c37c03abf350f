//! Logical messages exchanged with the speech service
//!
//! A [`ConnectionMessage`] is what travels over a [`Connection`](super::Connection):
//! a type, a header map, and a body. [`SpeechConnectionMessage`] layers the
//! protocol's mandatory headers (`Path`, `X-RequestId`, `X-Timestamp`) on top.

use std::collections::BTreeMap;

use uuid::Uuid;

use super::StreamingError;

pub const HEADER_PATH: &str = "path";
pub const HEADER_REQUEST_ID: &str = "x-requestid";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_STREAM_ID: &str = "x-streamid";

/// Frame kind on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
}

/// Message payload
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MessageBody {
    #[default]
    Empty,
    Text(String),
    Binary(Vec<u8>),
}

impl MessageBody {
    pub fn is_empty(&self) -> bool {
        match self {
            MessageBody::Empty => true,
            MessageBody::Text(text) => text.is_empty(),
            MessageBody::Binary(bytes) => bytes.is_empty(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            MessageBody::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// One message on a connection
///
/// Header names are stored lower-cased; lookups are case-insensitive.
#[derive(Debug, Clone)]
pub struct ConnectionMessage {
    pub id: String,
    pub message_type: MessageType,
    pub headers: BTreeMap<String, String>,
    pub body: MessageBody,
}

/// Equality ignores the locally generated `id`
impl PartialEq for ConnectionMessage {
    fn eq(&self, other: &Self) -> bool {
        self.message_type == other.message_type
            && self.headers == other.headers
            && self.body == other.body
    }
}

impl ConnectionMessage {
    /// Header names are lower-cased; an empty text or binary body becomes `Empty`
    pub fn new(message_type: MessageType, headers: BTreeMap<String, String>, body: MessageBody) -> Self {
        let body = if body.is_empty() { MessageBody::Empty } else { body };
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value))
            .collect();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            message_type,
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|value| value.as_str())
    }

    pub fn path(&self) -> Option<&str> {
        self.header(HEADER_PATH)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.header(HEADER_REQUEST_ID)
    }
}

/// Connection message carrying the speech protocol's mandatory headers
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechConnectionMessage {
    pub message_type: MessageType,
    pub path: String,
    pub request_id: String,
    pub content_type: Option<String>,
    pub stream_id: Option<String>,
    /// Remaining headers, lower-cased
    pub additional_headers: BTreeMap<String, String>,
    pub body: MessageBody,
}

impl SpeechConnectionMessage {
    /// Build an outbound message; `path` and `request_id` must not be empty
    pub fn new(
        message_type: MessageType,
        path: &str,
        request_id: &str,
        content_type: Option<&str>,
        body: MessageBody,
    ) -> Result<Self, StreamingError> {
        if path.trim().is_empty() {
            return Err(StreamingError::InvalidMessage("path is required".to_string()));
        }
        if request_id.trim().is_empty() {
            return Err(StreamingError::InvalidMessage(
                "request id is required".to_string(),
            ));
        }

        Ok(Self {
            message_type,
            path: path.to_string(),
            request_id: request_id.to_string(),
            content_type: content_type.map(str::to_string),
            stream_id: None,
            additional_headers: BTreeMap::new(),
            body,
        })
    }

    /// JSON text message
    pub fn text(path: &str, request_id: &str, json: String) -> Result<Self, StreamingError> {
        Self::new(
            MessageType::Text,
            path,
            request_id,
            Some("application/json"),
            MessageBody::Text(json),
        )
    }

    /// Binary audio message; an empty payload marks end of audio
    pub fn audio(request_id: &str, data: Vec<u8>) -> Result<Self, StreamingError> {
        let body = if data.is_empty() {
            MessageBody::Empty
        } else {
            MessageBody::Binary(data)
        };
        Self::new(MessageType::Binary, "audio", request_id, None, body)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.additional_headers
            .insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Interpret an inbound message; fails when `path` or `X-RequestId` is missing
    pub fn from_connection_message(message: ConnectionMessage) -> Result<Self, StreamingError> {
        let mut headers = message.headers;
        let path = headers
            .remove(HEADER_PATH)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| StreamingError::InvalidMessage("missing Path header".to_string()))?;
        let request_id = headers
            .remove(HEADER_REQUEST_ID)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                StreamingError::InvalidMessage(format!("missing X-RequestId header on {}", path))
            })?;
        let content_type = headers.remove(HEADER_CONTENT_TYPE);
        let stream_id = headers.remove(HEADER_STREAM_ID);

        Ok(Self {
            message_type: message.message_type,
            path,
            request_id,
            content_type,
            stream_id,
            additional_headers: headers,
            body: message.body,
        })
    }

    /// Flatten into a connection message, stamping `X-Timestamp`
    pub fn into_connection_message(self) -> ConnectionMessage {
        let mut headers = self.additional_headers;
        headers.insert(HEADER_PATH.to_string(), self.path);
        headers.insert(HEADER_REQUEST_ID.to_string(), self.request_id);
        headers
            .entry(HEADER_TIMESTAMP.to_string())
            .or_insert_with(timestamp_now);
        if let Some(content_type) = self.content_type {
            headers.insert(HEADER_CONTENT_TYPE.to_string(), content_type);
        }
        if let Some(stream_id) = self.stream_id {
            headers.insert(HEADER_STREAM_ID.to_string(), stream_id);
        }
        ConnectionMessage::new(self.message_type, headers, self.body)
    }

    pub fn text_body(&self) -> Option<&str> {
        self.body.as_text()
    }
}

/// ISO-8601 UTC timestamp with millisecond precision
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Request/connection ids are dashless upper-case UUIDs
pub fn create_no_dash_guid() -> String {
    Uuid::new_v4().simple().to_string().to_ascii_uppercase()
}
