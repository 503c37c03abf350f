//! Recognition telemetry
//!
//! [`ServiceTelemetryListener`] accumulates per-request timings (connection
//! setup, microphone lifetime, received message paths, recognition latency) and
//! renders them as the JSON body of a `telemetry` message at the end of each
//! turn. The same JSON is handed to the [`TelemetrySink`] injected into the
//! recognizer; [`TelemetryCollector`] is a sink that keeps a bounded history.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::streaming::message::timestamp_now;
use crate::streaming::ConnectionEvent;

/// Maximum number of telemetry payloads to retain in history
const MAX_TELEMETRY_HISTORY: usize = 50;

/// Receives the telemetry JSON produced at the end of each turn
pub trait TelemetrySink: Send + Sync {
    fn record(&self, session_id: &str, request_id: &str, json: &str);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _session_id: &str, _request_id: &str, _json: &str) {}
}

// ============================================================================
// Collector
// ============================================================================

/// A telemetry payload captured by [`TelemetryCollector`]
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    pub session_id: String,
    pub request_id: String,
    /// Unix timestamp when recorded (seconds)
    pub recorded_at: u64,
    pub payload: serde_json::Value,
}

/// Sink keeping the most recent payloads (newest first)
#[derive(Default)]
pub struct TelemetryCollector {
    history: Mutex<VecDeque<TelemetryRecord>>,
}

impl TelemetryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<TelemetryRecord>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_history(&self) -> Vec<TelemetryRecord> {
        self.history().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history().is_empty()
    }
}

impl TelemetrySink for TelemetryCollector {
    fn record(&self, session_id: &str, request_id: &str, json: &str) {
        let payload = match serde_json::from_str(json) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Telemetry: dropping unparseable payload: {}", e);
                return;
            }
        };

        let recorded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut history = self.history();
        history.push_front(TelemetryRecord {
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            recorded_at,
            payload,
        });
        while history.len() > MAX_TELEMETRY_HISTORY {
            history.pop_back();
        }
    }
}

// ============================================================================
// Per-request listener
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct Metric {
    #[serde(rename = "Name")]
    name: &'static str,
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Start")]
    start: String,
    #[serde(rename = "End", skip_serializing_if = "Option::is_none")]
    end: Option<String>,
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct TelemetryPayload<'a> {
    #[serde(rename = "Metrics")]
    metrics: Vec<Metric>,
    #[serde(rename = "ReceivedMessages")]
    received_messages: &'a BTreeMap<String, Vec<String>>,
    #[serde(rename = "PhraseLatencyMs", skip_serializing_if = "Vec::is_empty")]
    phrase_latencies: &'a Vec<u64>,
    #[serde(rename = "FirstHypothesisLatencyMs", skip_serializing_if = "Vec::is_empty")]
    hypothesis_latencies: &'a Vec<u64>,
}

#[derive(Debug, Default)]
struct ListenerState {
    request_id: String,
    audio_node_id: String,
    connection: Option<Metric>,
    microphone: Option<Metric>,
    received_messages: BTreeMap<String, Vec<String>>,
    phrase_latencies: Vec<u64>,
    hypothesis_latencies: Vec<u64>,
    has_data: bool,
    disposed: bool,
}

/// Collects telemetry for one request session
pub struct ServiceTelemetryListener {
    state: Mutex<ListenerState>,
}

impl ServiceTelemetryListener {
    pub fn new(request_id: &str, audio_node_id: &str) -> Self {
        Self {
            state: Mutex::new(ListenerState {
                request_id: request_id.to_string(),
                audio_node_id: audio_node_id.to_string(),
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Follow the session onto a new request id
    pub fn set_request_id(&self, request_id: &str) {
        self.state().request_id = request_id.to_string();
    }

    pub fn on_connection_event(&self, event: &ConnectionEvent) {
        let mut state = self.state();
        if state.disposed {
            return;
        }
        match event {
            ConnectionEvent::ConnectionStart { connection_id } => {
                state.connection = Some(Metric {
                    name: "Connection",
                    id: connection_id.clone(),
                    start: timestamp_now(),
                    end: None,
                    error: None,
                });
                state.has_data = true;
            }
            ConnectionEvent::ConnectionEstablished { .. } => {
                if let Some(metric) = state.connection.as_mut() {
                    metric.end = Some(timestamp_now());
                }
            }
            ConnectionEvent::ConnectionEstablishError {
                status_code,
                reason,
                ..
            } => {
                if let Some(metric) = state.connection.as_mut() {
                    metric.end = Some(timestamp_now());
                    metric.error = Some(format!("{} {}", status_code, reason));
                }
            }
            _ => {}
        }
    }

    pub fn microphone_started(&self) {
        let mut state = self.state();
        let id = state.audio_node_id.clone();
        state.microphone = Some(Metric {
            name: "Microphone",
            id,
            start: timestamp_now(),
            end: None,
            error: None,
        });
        state.has_data = true;
    }

    pub fn microphone_stopped(&self) {
        if let Some(metric) = self.state().microphone.as_mut() {
            metric.end = Some(timestamp_now());
        }
    }

    pub fn received_message(&self, path: &str) {
        let mut state = self.state();
        if state.disposed {
            return;
        }
        state
            .received_messages
            .entry(path.to_ascii_lowercase())
            .or_default()
            .push(timestamp_now());
        state.has_data = true;
    }

    /// First hypothesis of a phrase; `captured_at` is when its audio was read
    pub fn hypothesis_received(&self, captured_at: Option<Instant>) {
        if let Some(at) = captured_at {
            let mut state = self.state();
            state.hypothesis_latencies.push(at.elapsed().as_millis() as u64);
            state.has_data = true;
        }
    }

    pub fn phrase_received(&self, captured_at: Option<Instant>) {
        if let Some(at) = captured_at {
            let mut state = self.state();
            state.phrase_latencies.push(at.elapsed().as_millis() as u64);
            state.has_data = true;
        }
    }

    /// Render and reset the accumulated telemetry; `None` when nothing was recorded
    pub fn get_telemetry(&self) -> Option<String> {
        let mut state = self.state();
        if !state.has_data {
            return None;
        }

        let metrics: Vec<Metric> = state
            .connection
            .iter()
            .chain(state.microphone.iter())
            .cloned()
            .collect();

        let json = serde_json::to_string(&TelemetryPayload {
            metrics,
            received_messages: &state.received_messages,
            phrase_latencies: &state.phrase_latencies,
            hypothesis_latencies: &state.hypothesis_latencies,
        });

        // Metrics are reported once; messages and latencies per turn
        state.connection = None;
        state.microphone = None;
        state.received_messages.clear();
        state.phrase_latencies.clear();
        state.hypothesis_latencies.clear();
        state.has_data = false;

        match json {
            Ok(json) => Some(json),
            Err(e) => {
                log::warn!(
                    "Telemetry: failed to serialize for request {}: {}",
                    state.request_id,
                    e
                );
                None
            }
        }
    }

    pub fn dispose(&self) {
        self.state().disposed = true;
    }
}
