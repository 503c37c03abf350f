//! Wire framing for connection messages
//!
//! Text frames:
//!
//! ```text
//! Path: speech.config\r\n
//! X-RequestId: 5F2A...\r\n
//! \r\n
//! {"context": ...}
//! ```
//!
//! Binary frames:
//!
//! ```text
//! ┌────────────┬───────────────────────┬──────────────┐
//! │ L (u16 BE) │ L bytes header (Latin1)│ body bytes   │
//! └────────────┴───────────────────────┴──────────────┘
//! ```

use std::collections::BTreeMap;

use super::message::{ConnectionMessage, MessageBody, MessageType};
use super::StreamingError;

const CRLF: &str = "\r\n";
const HEADER_BODY_SEPARATOR: &str = "\r\n\r\n";

/// A single WebSocket frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Canonical spelling for the headers the service documents
fn canonical_header_name(name: &str) -> &str {
    match name {
        "path" => "Path",
        "x-requestid" => "X-RequestId",
        "x-timestamp" => "X-Timestamp",
        "content-type" => "Content-Type",
        "x-streamid" => "X-StreamId",
        other => other,
    }
}

fn serialize_headers(headers: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        out.push_str(canonical_header_name(name));
        out.push_str(": ");
        out.push_str(value);
        out.push_str(CRLF);
    }
    out
}

fn parse_headers(block: &str) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    for line in block.split(['\r', '\n']).filter(|l| !l.is_empty()) {
        match line.find(':') {
            Some(idx) if idx > 0 => {
                headers.insert(
                    line[..idx].trim().to_ascii_lowercase(),
                    line[idx + 1..].trim().to_string(),
                );
            }
            _ => {
                headers.insert(line.trim().to_ascii_lowercase(), String::new());
            }
        }
    }
    headers
}

/// Encode a message into its wire frame
pub fn encode(message: &ConnectionMessage) -> Result<WireFrame, StreamingError> {
    let header_text = serialize_headers(&message.headers);

    match message.message_type {
        MessageType::Text => {
            let body = match &message.body {
                MessageBody::Empty => "",
                MessageBody::Text(text) => text.as_str(),
                MessageBody::Binary(_) => {
                    return Err(StreamingError::InvalidMessage(
                        "text message with binary body".to_string(),
                    ))
                }
            };
            Ok(WireFrame::Text(format!("{}{}{}", header_text, CRLF, body)))
        }
        MessageType::Binary => {
            let header_bytes = header_text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c)).map_err(|_| {
                        StreamingError::InvalidMessage(format!(
                            "header character {:?} is not Latin1",
                            c
                        ))
                    })
                })
                .collect::<Result<Vec<u8>, _>>()?;

            let header_len = u16::try_from(header_bytes.len()).map_err(|_| {
                StreamingError::InvalidMessage(format!(
                    "binary header too long ({} bytes)",
                    header_bytes.len()
                ))
            })?;

            let body: &[u8] = match &message.body {
                MessageBody::Empty => &[],
                MessageBody::Binary(bytes) => bytes,
                MessageBody::Text(_) => {
                    return Err(StreamingError::InvalidMessage(
                        "binary message with text body".to_string(),
                    ))
                }
            };

            let mut frame = Vec::with_capacity(2 + header_bytes.len() + body.len());
            frame.extend_from_slice(&header_len.to_be_bytes());
            frame.extend_from_slice(&header_bytes);
            frame.extend_from_slice(body);
            Ok(WireFrame::Binary(frame))
        }
    }
}

/// Decode a wire frame; malformed binary frames yield `MalformedMessage`
pub fn decode(frame: WireFrame) -> Result<ConnectionMessage, StreamingError> {
    match frame {
        WireFrame::Text(text) => {
            let (header_block, body) = match text.split_once(HEADER_BODY_SEPARATOR) {
                Some((headers, body)) => (headers, body),
                None => (text.as_str(), ""),
            };
            let body = if body.is_empty() {
                MessageBody::Empty
            } else {
                MessageBody::Text(body.to_string())
            };
            Ok(ConnectionMessage::new(
                MessageType::Text,
                parse_headers(header_block),
                body,
            ))
        }
        WireFrame::Binary(bytes) => {
            if bytes.len() < 2 {
                return Err(StreamingError::MalformedMessage(format!(
                    "binary frame of {} bytes has no header length",
                    bytes.len()
                )));
            }

            let header_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
            if bytes.len() < 2 + header_len {
                return Err(StreamingError::MalformedMessage(format!(
                    "binary frame declares {} header bytes but has {}",
                    header_len,
                    bytes.len() - 2
                )));
            }

            // Latin1: one char per byte
            let header_text: String = bytes[2..2 + header_len].iter().map(|&b| b as char).collect();
            let body = &bytes[2 + header_len..];
            let body = if body.is_empty() {
                MessageBody::Empty
            } else {
                MessageBody::Binary(body.to_vec())
            };

            Ok(ConnectionMessage::new(
                MessageType::Binary,
                parse_headers(&header_text),
                body,
            ))
        }
    }
}
