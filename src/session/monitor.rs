//! Background status monitor for running sessions.

use super::{RecordStatus, SessionManager, SessionStatus, TransmissionLog};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Periodically logs the connection state of every session.
pub struct StatusMonitor {
    manager: Arc<SessionManager>,
    interval: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl StatusMonitor {
    pub fn new(manager: Arc<SessionManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the monitor background task.
    pub async fn start(&self) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let period = self.interval;

        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        {
            let mut stop_guard = self.stop.lock().await;
            *stop_guard = Some(tx);
        }

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last = String::new();

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        let status = manager.get_status().await;
                        if status.is_empty() {
                            last.clear();
                            continue;
                        }
                        let line = summarize(&status);
                        if line != last {
                            tracing::info!("Sessions: {} ({} records)", line, manager.log().len());
                            last = line;
                        } else {
                            tracing::debug!("Sessions: {}", line);
                        }
                    }
                }
            }
        })
    }

    /// Stop the monitor.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// One-line rendering of a status snapshot.
pub fn summarize(status: &[SessionStatus]) -> String {
    status
        .iter()
        .map(|s| {
            format!(
                "{} ({}:{}) {} {} sent",
                s.target_id,
                s.host,
                s.port,
                if s.connected { "connected" } else { "disconnected" },
                s.packets_sent
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Echo every new transmission record to the log as it is appended.
pub fn spawn_record_logger(log: &TransmissionLog) -> JoinHandle<()> {
    let mut rx = log.subscribe();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(record) => match record.status {
                    RecordStatus::Success => tracing::info!(
                        "[{}] {}:{} {} -> {}",
                        record.target_id,
                        record.host,
                        record.port,
                        record.kind,
                        record.response
                    ),
                    RecordStatus::Error => tracing::warn!(
                        "[{}] {}:{} {} failed: {}",
                        record.target_id,
                        record.host,
                        record.port,
                        record.kind,
                        record.response
                    ),
                },
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Record logger skipped {} records", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
