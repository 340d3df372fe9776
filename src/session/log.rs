//! Transmission log: one record per send attempt, in insertion order.

use crate::device::ServerTarget;
use crate::packet::{Packet, PacketKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const LOG_TITLE: &str = "TrackerSHV Transmission Log";

/// Outcome of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Success,
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Success => "success",
            RecordStatus::Error => "error",
        }
    }
}

/// One observed exchange with a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub target_id: String,
    pub host: String,
    pub port: u16,
    pub kind: PacketKind,
    pub packet: String,
    /// Response text, or the error message when `status` is `Error`.
    pub response: String,
    pub status: RecordStatus,
}

/// Success/error counts for the whole log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub total: usize,
    pub success: usize,
    pub error: usize,
}

struct LogInner {
    next_id: u64,
    records: Vec<TransmissionRecord>,
}

/// Shared append-only log. Cloning shares the same records.
#[derive(Clone)]
pub struct TransmissionLog {
    inner: Arc<Mutex<LogInner>>,
    notify: broadcast::Sender<TransmissionRecord>,
}

impl Default for TransmissionLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TransmissionLog {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                next_id: 1,
                records: Vec::new(),
            })),
            notify,
        }
    }

    /// Append the outcome of one send attempt and notify subscribers.
    ///
    /// Ids increase strictly, including across [`clear`](Self::clear).
    pub fn append(
        &self,
        target: &ServerTarget,
        packet: &Packet,
        outcome: Result<String, String>,
    ) -> TransmissionRecord {
        let (response, status) = match outcome {
            Ok(text) => (text, RecordStatus::Success),
            Err(text) => (text, RecordStatus::Error),
        };

        let mut inner = self.inner.lock().unwrap();
        let record = TransmissionRecord {
            id: inner.next_id,
            timestamp: Utc::now(),
            target_id: target.id.clone(),
            host: target.host.clone(),
            port: target.port,
            kind: packet.kind(),
            packet: packet.as_str().to_string(),
            response,
            status,
        };
        inner.next_id += 1;
        inner.records.push(record.clone());

        // Sent under the lock so subscribers observe log order
        let _ = self.notify.send(record.clone());

        record
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<TransmissionRecord> {
        self.inner.lock().unwrap().records.clone()
    }

    /// Records with an id greater than `after_id`.
    pub fn records_after(&self, after_id: u64) -> Vec<TransmissionRecord> {
        let inner = self.inner.lock().unwrap();
        let start = inner.records.partition_point(|r| r.id <= after_id);
        inner.records[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every record. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let cleared = inner.records.len();
        inner.records.clear();
        cleared
    }

    pub fn stats(&self) -> LogStats {
        let inner = self.inner.lock().unwrap();
        let success = inner
            .records
            .iter()
            .filter(|r| r.status == RecordStatus::Success)
            .count();
        LogStats {
            total: inner.records.len(),
            success,
            error: inner.records.len() - success,
        }
    }

    /// Plain-text rendering for sharing.
    pub fn export_text(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let mut out = format!("{}\n\n", LOG_TITLE);
        for r in &inner.records {
            let _ = write!(
                out,
                "[{}] {}:{} - {}\nPacket: {}\nResponse: {}\n\n",
                r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                r.host,
                r.port,
                r.status.as_str().to_ascii_uppercase(),
                r.packet,
                r.response
            );
        }
        out
    }

    /// Receive every record appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransmissionRecord> {
        self.notify.subscribe()
    }
}
