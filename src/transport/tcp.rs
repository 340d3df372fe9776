//! Persistent TCP stream transport.
//!
//! One packet per write, no framing. Inbound bytes are surfaced as they arrive.

use super::{Delivery, TransportError, TransportEvent};
use crate::device::ServerTarget;
use crate::packet::Packet;

use socket2::SockRef;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const READ_BUFFER_SIZE: usize = 4096;

/// Opens TCP links with the configured timeouts.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            idle_timeout,
        }
    }

    /// Connect to `target` and start the reader task.
    pub async fn connect(&self, target: &ServerTarget) -> Result<TcpLink, TransportError> {
        let address = target.address();

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout(address.clone(), self.connect_timeout))?
        .map_err(|e| TransportError::Connect {
            address: address.clone(),
            message: e.to_string(),
        })?;

        stream.set_nodelay(true)?;
        if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
            tracing::warn!("Failed to enable keep-alive for {}: {}", address, e);
        }

        let (reader, writer) = stream.into_split();
        let open = Arc::new(AtomicBool::new(true));
        let activity = Arc::new(Mutex::new(Instant::now()));
        let (tx, rx) = mpsc::channel(64);

        let reader_task = tokio::spawn(run_reader(
            reader,
            tx,
            open.clone(),
            activity.clone(),
            self.idle_timeout,
        ));

        tracing::debug!("TCP link open to {}", address);

        Ok(TcpLink {
            address,
            writer,
            events: rx,
            open,
            activity,
            reader_task,
        })
    }
}

/// A connected TCP stream.
#[derive(Debug)]
pub struct TcpLink {
    address: String,
    writer: OwnedWriteHalf,
    events: mpsc::Receiver<TransportEvent>,
    open: Arc<AtomicBool>,
    activity: Arc<Mutex<Instant>>,
    reader_task: JoinHandle<()>,
}

impl TcpLink {
    /// Write the packet text as-is. Does not wait for a reply.
    pub async fn send(&mut self, packet: &Packet) -> Result<Delivery, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        match self.writer.write_all(packet.as_bytes()).await {
            Ok(()) => {
                touch(&self.activity);
                Ok(Delivery::Written(packet.len()))
            }
            Err(e) => {
                self.open.store(false, Ordering::SeqCst);
                Err(TransportError::Io(e))
            }
        }
    }

    /// Next event from the reader task; `None` once it has finished.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn open_flag(&self) -> Arc<AtomicBool> {
        self.open.clone()
    }

    pub async fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.reader_task.abort();
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!("Shutdown of {} failed: {}", self.address, e);
        }
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn touch(activity: &Mutex<Instant>) {
    if let Ok(mut last) = activity.lock() {
        *last = Instant::now();
    }
}

fn last_activity(activity: &Mutex<Instant>) -> Instant {
    activity.lock().map(|last| *last).unwrap_or_else(|_| Instant::now())
}

/// Forward inbound data until the stream ends, fails, or goes idle.
async fn run_reader(
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<TransportEvent>,
    open: Arc<AtomicBool>,
    activity: Arc<Mutex<Instant>>,
    idle_timeout: Duration,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let terminal = loop {
        let deadline = last_activity(&activity) + idle_timeout;

        tokio::select! {
            result = reader.read(&mut buf) => match result {
                Ok(0) => break TransportEvent::Closed,
                Ok(n) => {
                    touch(&activity);
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if events.send(TransportEvent::Data(text)).await.is_err() {
                        // Link dropped
                        return;
                    }
                }
                Err(e) => break TransportEvent::Error(e.to_string()),
            },
            _ = tokio::time::sleep_until(deadline) => {
                // Writes may have pushed the deadline out
                if last_activity(&activity).elapsed() >= idle_timeout {
                    break TransportEvent::Timeout;
                }
            }
        }
    };

    open.store(false, Ordering::SeqCst);
    let _ = events.send(terminal).await;
}
