//! Transmission session manager.
//!
//! Runs one task per server target: connect, send the login packet, then send a
//! fresh position report on every tick until the session is stopped, expires,
//! or the transport reports a terminal event. Sessions never retry.

mod log;
mod monitor;

pub use log::*;
pub use monitor::*;

use crate::device::{validate_targets, Coordinates, DeviceConfig, ServerTarget, ValidationError};
use crate::packet::{build_login_packet, build_position_report_at, verify_packet, Packet, Telemetry};
use crate::transport::{Delivery, Link, Transport, TransportEvent, TransportKind};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

/// Session error types.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("no session for target {0}")]
    NotFound(String),
    #[error("session for target {0} is not active")]
    NotActive(String),
    #[error("session for target {0} has too many queued packets")]
    Busy(String),
}

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closed,
}

/// Timing knobs shared by every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Period between position reports.
    pub report_interval: Duration,
    /// Sessions older than this are stopped automatically.
    pub max_lifetime: Option<Duration>,
    /// How long a stop waits for the session task before aborting it.
    pub stop_grace: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(5),
            max_lifetime: Some(Duration::from_secs(300)),
            stop_grace: Duration::from_secs(2),
        }
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub target_id: String,
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub state: SessionState,
    pub connected: bool,
    pub packets_sent: u64,
    pub last_response: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Session state readable from outside the session task.
struct SessionShared {
    target: ServerTarget,
    transport: TransportKind,
    started_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    link_open: Mutex<Option<Arc<AtomicBool>>>,
    packets_sent: AtomicU64,
    last_response: Mutex<Option<String>>,
}

impl SessionShared {
    fn new(target: ServerTarget, transport: TransportKind) -> Self {
        Self {
            target,
            transport,
            started_at: Utc::now(),
            state: Mutex::new(SessionState::Idle),
            link_open: Mutex::new(None),
            packets_sent: AtomicU64::new(0),
            last_response: Mutex::new(None),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    fn attach(&self, open: Arc<AtomicBool>) {
        *self.link_open.lock().unwrap() = Some(open);
    }

    fn set_last_response(&self, text: String) {
        *self.last_response.lock().unwrap() = Some(text);
    }

    /// TCP: the socket is open. HTTP: the schedule is armed.
    fn connected(&self) -> bool {
        if self.state() != SessionState::Active {
            return false;
        }
        match self.transport {
            TransportKind::Http => true,
            TransportKind::Tcp => self
                .link_open
                .lock()
                .unwrap()
                .as_ref()
                .map(|open| open.load(Ordering::SeqCst))
                .unwrap_or(false),
        }
    }

    fn snapshot(&self) -> SessionStatus {
        SessionStatus {
            target_id: self.target.id.clone(),
            host: self.target.host.clone(),
            port: self.target.port,
            transport: self.transport,
            state: self.state(),
            connected: self.connected(),
            packets_sent: self.packets_sent.load(Ordering::SeqCst),
            last_response: self.last_response.lock().unwrap().clone(),
            started_at: self.started_at,
        }
    }
}

/// Manager-side handle to a running session task.
struct SessionHandle {
    generation: u64,
    shared: Arc<SessionShared>,
    stop_tx: watch::Sender<bool>,
    commands: mpsc::Sender<Packet>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn signal_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Wait for the task to finish; abort it if it overruns `grace`.
    async fn join(mut self, grace: Duration) {
        self.signal_stop();
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            tracing::warn!(
                "Session {}: did not stop within {:?}, aborting",
                self.shared.target.id,
                grace
            );
            self.task.abort();
            let _ = (&mut self.task).await;
        }
        self.shared.set_state(SessionState::Closed);
    }
}

/// Owns every live session, keyed by target id.
pub struct SessionManager {
    transport: Transport,
    log: TransmissionLog,
    settings: SessionSettings,
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
    /// Serializes start/stop so a target never has two live sessions.
    control: tokio::sync::Mutex<()>,
    device: watch::Sender<Option<DeviceConfig>>,
    position: watch::Sender<Option<Coordinates>>,
    next_generation: AtomicU64,
}

impl SessionManager {
    pub fn new(transport: Transport, log: TransmissionLog, settings: SessionSettings) -> Self {
        let (device, _) = watch::channel(None);
        let (position, _) = watch::channel(None);

        Self {
            transport,
            log,
            settings,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            control: tokio::sync::Mutex::new(()),
            device,
            position,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn log(&self) -> &TransmissionLog {
        &self.log
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Validate everything up front, then start a session per target.
    pub async fn start_all(
        &self,
        config: DeviceConfig,
        targets: Vec<ServerTarget>,
    ) -> Result<usize, SessionError> {
        config.validate()?;
        validate_targets(&targets)?;

        let count = targets.len();
        for target in targets {
            self.start_session(target, config.clone()).await?;
        }

        tracing::info!("Started transmission to {} server(s)", count);
        Ok(count)
    }

    /// Start transmitting to `target`, replacing any session it already has.
    ///
    /// `config` becomes the current device configuration for every session.
    pub async fn start_session(
        &self,
        target: ServerTarget,
        config: DeviceConfig,
    ) -> Result<(), SessionError> {
        config.validate()?;
        target.validate()?;

        let _guard = self.control.lock().await;

        if self.stop_locked(&target.id).await {
            tracing::info!("Session {}: restarting", target.id);
        }

        self.device.send_replace(Some(config.clone()));

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(SessionShared::new(target.clone(), self.transport.kind()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let ctx = SessionContext {
            target: target.clone(),
            transport: self.transport.clone(),
            log: self.log.clone(),
            settings: self.settings.clone(),
            shared: shared.clone(),
            device: self.device.subscribe(),
            position: self.position.subscribe(),
            fallback: config,
        };

        // Hold the write lock across spawn so an instantly-closing session
        // cannot try to remove itself before it is registered.
        let mut sessions = self.sessions.write().await;
        let registry = self.sessions.clone();
        let target_id = target.id.clone();

        let task = tokio::spawn(async move {
            run_session(ctx, stop_rx, cmd_rx).await;

            let mut sessions = registry.write().await;
            if sessions.get(&target_id).map(|h| h.generation) == Some(generation) {
                sessions.remove(&target_id);
            }
        });

        sessions.insert(
            target.id.clone(),
            SessionHandle {
                generation,
                shared,
                stop_tx,
                commands: cmd_tx,
                task,
            },
        );

        Ok(())
    }

    /// Stop one session. Unknown or already-closed ids are a no-op.
    ///
    /// Returns whether a session was running.
    pub async fn stop_session(&self, target_id: &str) -> bool {
        let _guard = self.control.lock().await;
        let stopped = self.stop_locked(target_id).await;
        if stopped {
            tracing::info!("Session {}: stopped", target_id);
        }
        stopped
    }

    /// Stop every session. Returns how many were running.
    pub async fn stop_all_sessions(&self) -> usize {
        let _guard = self.control.lock().await;

        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };

        for handle in &handles {
            handle.signal_stop();
        }

        // Each handle gets the same grace period, measured from now
        let count = handles.len();
        let mut joins = JoinSet::new();
        for handle in handles {
            joins.spawn(handle.join(self.settings.stop_grace));
        }
        while joins.join_next().await.is_some() {}

        if count > 0 {
            tracing::info!("Stopped {} session(s)", count);
        }
        count
    }

    async fn stop_locked(&self, target_id: &str) -> bool {
        let handle = self.sessions.write().await.remove(target_id);
        match handle {
            Some(handle) => {
                handle.join(self.settings.stop_grace).await;
                true
            }
            None => false,
        }
    }

    /// Snapshot of every live session, ordered by target id.
    pub async fn get_status(&self) -> Vec<SessionStatus> {
        let sessions = self.sessions.read().await;
        let mut status: Vec<SessionStatus> =
            sessions.values().map(|h| h.shared.snapshot()).collect();
        status.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        status
    }

    /// Replace the configuration used for subsequent reports.
    pub fn update_device(&self, config: DeviceConfig) -> Result<(), ValidationError> {
        config.validate()?;
        self.device.send_replace(Some(config));
        Ok(())
    }

    pub fn current_device(&self) -> Option<DeviceConfig> {
        self.device.borrow().clone()
    }

    /// Publish the latest device-GPS fix.
    pub fn update_position(&self, coordinates: Coordinates) -> Result<(), ValidationError> {
        coordinates.validate()?;
        self.position.send_replace(Some(coordinates));
        Ok(())
    }

    pub fn current_position(&self) -> Option<Coordinates> {
        *self.position.borrow()
    }

    /// Queue raw text on an active session. It is sent between scheduled reports.
    pub async fn send_custom(&self, target_id: &str, text: &str) -> Result<(), SessionError> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(target_id)
            .ok_or_else(|| SessionError::NotFound(target_id.to_string()))?;

        if handle.shared.state() != SessionState::Active {
            return Err(SessionError::NotActive(target_id.to_string()));
        }

        if !verify_packet(text) {
            tracing::warn!(
                "Session {}: custom packet has no valid checksum, sending as-is",
                target_id
            );
        }

        handle
            .commands
            .try_send(Packet::custom(text))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SessionError::Busy(target_id.to_string()),
                mpsc::error::TrySendError::Closed(_) => {
                    SessionError::NotActive(target_id.to_string())
                }
            })
    }
}

/// Everything a session task owns.
struct SessionContext {
    target: ServerTarget,
    transport: Transport,
    log: TransmissionLog,
    settings: SessionSettings,
    shared: Arc<SessionShared>,
    device: watch::Receiver<Option<DeviceConfig>>,
    position: watch::Receiver<Option<Coordinates>>,
    fallback: DeviceConfig,
}

impl SessionContext {
    fn current_config(&self) -> DeviceConfig {
        self.device
            .borrow()
            .clone()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn live_position(&self) -> Option<Coordinates> {
        *self.position.borrow()
    }

    /// Send one packet and record the outcome.
    ///
    /// A stop that lands mid-send abandons the send and records it as cancelled.
    async fn transmit(
        &self,
        link: &mut Link,
        packet: Packet,
        stop: &mut watch::Receiver<bool>,
    ) -> SendOutcome {
        tracing::debug!(
            "Session {}: sending {} packet: {}",
            self.target.id,
            packet.kind(),
            packet
        );

        let result = tokio::select! {
            biased;
            result = link.send(&packet) => result,
            _ = stop.changed() => {
                tracing::warn!(
                    "Session {}: {} packet to {} cancelled by stop",
                    self.target.id,
                    packet.kind(),
                    self.target.address()
                );
                self.log.append(
                    &self.target,
                    &packet,
                    Err("cancelled: session stopped".to_string()),
                );
                return SendOutcome::Cancelled;
            }
        };

        let outcome = match result {
            Ok(delivery) => {
                self.shared.packets_sent.fetch_add(1, Ordering::SeqCst);
                if let Delivery::Response(body) = &delivery {
                    self.shared.set_last_response(body.clone());
                }
                Ok(delivery.response_text())
            }
            Err(e) => {
                tracing::warn!(
                    "Session {}: {} packet to {} failed: {}",
                    self.target.id,
                    packet.kind(),
                    self.target.address(),
                    e
                );
                Err(e.to_string())
            }
        };

        let sent = if outcome.is_ok() {
            SendOutcome::Sent
        } else {
            SendOutcome::Failed
        };
        self.log.append(&self.target, &packet, outcome);
        sent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Sent,
    Failed,
    Cancelled,
}

/// Sleep for the session's lifetime bound, or forever without one.
async fn lifetime(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// Drive one session from `Connecting` to `Closed`.
async fn run_session(
    ctx: SessionContext,
    mut stop_rx: watch::Receiver<bool>,
    mut commands: mpsc::Receiver<Packet>,
) {
    let target = ctx.target.clone();
    ctx.shared.set_state(SessionState::Connecting);
    tracing::info!("Session {}: connecting to {}", target.id, target.address());

    let connected = tokio::select! {
        biased;
        _ = stop_rx.changed() => {
            ctx.shared.set_state(SessionState::Closed);
            return;
        }
        result = ctx.transport.connect(&target) => result,
    };

    let mut link = match connected {
        Ok(link) => link,
        Err(e) => {
            tracing::error!("Session {}: {}", target.id, e);
            let login = build_login_packet(&ctx.current_config(), ctx.live_position());
            ctx.log.append(&target, &login, Err(e.to_string()));
            ctx.shared.set_state(SessionState::Closed);
            return;
        }
    };
    ctx.shared.attach(link.open_flag());

    let login = build_login_packet(&ctx.current_config(), ctx.live_position());
    let outcome = ctx.transmit(&mut link, login, &mut stop_rx).await;
    if outcome == SendOutcome::Cancelled
        || (outcome == SendOutcome::Failed && !link.is_open())
    {
        link.close().await;
        ctx.shared.set_state(SessionState::Closed);
        return;
    }

    ctx.shared.set_state(SessionState::Active);
    tracing::info!("Session {}: active", target.id);

    let period = ctx.settings.report_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let expiry = lifetime(ctx.settings.max_lifetime);
    tokio::pin!(expiry);

    let mut telemetry = Telemetry::default();

    let reason = loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break "stopped".to_string(),
            _ = &mut expiry => break "maximum lifetime reached".to_string(),
            event = link.next_event() => match event {
                Some(TransportEvent::Data(text)) => {
                    tracing::debug!("Session {}: received {:?}", target.id, text);
                    ctx.shared.set_last_response(text);
                }
                Some(TransportEvent::Closed) | None => break "closed by server".to_string(),
                Some(TransportEvent::Error(e)) => break format!("error: {}", e),
                Some(TransportEvent::Timeout) => break "idle timeout".to_string(),
            },
            Some(packet) = commands.recv() => {
                match ctx.transmit(&mut link, packet, &mut stop_rx).await {
                    SendOutcome::Cancelled => break "stopped".to_string(),
                    SendOutcome::Failed if !link.is_open() => break "write failed".to_string(),
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                let report = build_position_report_at(
                    &ctx.current_config(),
                    ctx.live_position(),
                    &telemetry,
                    Local::now().naive_local(),
                );
                telemetry.advance_frame();
                match ctx.transmit(&mut link, report, &mut stop_rx).await {
                    SendOutcome::Cancelled => break "stopped".to_string(),
                    SendOutcome::Failed if !link.is_open() => break "write failed".to_string(),
                    _ => {}
                }
            }
        }
    };

    link.close().await;
    ctx.shared.set_state(SessionState::Closed);
    tracing::info!("Session {}: closed ({})", target.id, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{sample_config, PositionSource};
    use crate::packet::{verify_packet, PacketKind};
    use crate::transport::{spawn_relay, HttpRelay, TcpTransport};
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    const TICK: Duration = Duration::from_millis(100);

    fn settings() -> SessionSettings {
        SessionSettings {
            report_interval: TICK,
            max_lifetime: None,
            stop_grace: Duration::from_secs(1),
        }
    }

    fn tcp_manager(settings: SessionSettings) -> SessionManager {
        let transport = TcpTransport::new(Duration::from_secs(2), Duration::from_secs(5));
        SessionManager::new(Transport::Tcp(transport), TransmissionLog::new(), settings)
    }

    fn http_manager(url: &str) -> SessionManager {
        let relay = HttpRelay::new(url, Duration::from_secs(2)).unwrap();
        SessionManager::new(Transport::Http(relay), TransmissionLog::new(), settings())
    }

    /// Accept any number of connections, collect their bytes and answer `ACK`.
    async fn spawn_collector() -> (u16, Arc<StdMutex<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(StdMutex::new(String::new()));
        let sink = received.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let sink = sink.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                sink.lock()
                                    .unwrap()
                                    .push_str(&String::from_utf8_lossy(&buf[..n]));
                                if socket.write_all(b"ACK").await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        (port, received)
    }

    async fn wait_for_records(log: &TransmissionLog, count: usize) {
        for _ in 0..300 {
            if log.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} records, have {}", count, log.len());
    }

    async fn wait_for_no_sessions(manager: &SessionManager) {
        for _ in 0..300 {
            if manager.get_status().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sessions still registered: {:?}", manager.get_status().await);
    }

    #[tokio::test]
    async fn test_login_then_position_reports() {
        let (port, received) = spawn_collector().await;
        let manager = tcp_manager(settings());
        let target = ServerTarget::new("server_1", "127.0.0.1", port);

        assert_ok!(manager.start_session(target, sample_config()).await);
        wait_for_records(manager.log(), 4).await;
        assert!(manager.stop_session("server_1").await);

        let records = manager.log().records();
        assert_eq!(records[0].kind, PacketKind::Login);
        assert!(records[0]
            .packet
            .starts_with("$LGN,VNDR,866772041471415,"));
        assert!(records[1..]
            .iter()
            .all(|r| r.kind == PacketKind::PositionReport));
        assert!(records
            .iter()
            .all(|r| r.status == RecordStatus::Success && r.target_id == "server_1"));

        // Reports advance the frame number
        let frames: Vec<&str> = records[1..3]
            .iter()
            .map(|r| r.packet.rsplit_once('*').unwrap().0.rsplit(',').next().unwrap())
            .collect();
        assert_eq!(frames, vec!["492894", "492895"]);

        let wire = received.lock().unwrap().clone();
        assert!(wire.starts_with("$LGN,VNDR,866772041471415,"));
        let packets: Vec<String> = wire
            .split('$')
            .filter(|p| !p.is_empty())
            .map(|p| format!("${}", p))
            .collect();
        assert!(packets.len() >= 4);
        assert!(packets.iter().all(|p| verify_packet(p)));
    }

    #[tokio::test]
    async fn test_tcp_status_reports_connection() {
        let (port, _received) = spawn_collector().await;
        let manager = tcp_manager(settings());
        let target = ServerTarget::new("server_1", "127.0.0.1", port);

        assert_ok!(manager.start_session(target, sample_config()).await);
        wait_for_records(manager.log(), 2).await;

        let status = manager.get_status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].target_id, "server_1");
        assert_eq!(status[0].state, SessionState::Active);
        assert!(status[0].connected);
        assert!(status[0].packets_sent >= 2);
        assert_eq!(status[0].last_response.as_deref().map(|r| r.contains("ACK")), Some(true));

        manager.stop_all_sessions().await;
    }

    #[tokio::test]
    async fn test_start_twice_keeps_one_session() {
        let (port, _received) = spawn_collector().await;
        let manager = tcp_manager(settings());
        let target = ServerTarget::new("server_1", "127.0.0.1", port);

        assert_ok!(manager.start_session(target.clone(), sample_config()).await);
        assert_ok!(manager.start_session(target, sample_config()).await);

        let status = manager.get_status().await;
        assert_eq!(status.len(), 1);

        wait_for_records(manager.log(), 3).await;
        assert_eq!(manager.get_status().await.len(), 1);
        assert_eq!(manager.stop_all_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_stop_unknown_session_is_noop() {
        let manager = tcp_manager(settings());
        assert!(!manager.stop_session("never-started").await);
        assert_eq!(manager.stop_all_sessions().await, 0);
        assert!(manager.log().is_empty());
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let (port, _received) = spawn_collector().await;
        let manager = tcp_manager(settings());
        let target = ServerTarget::new("server_1", "127.0.0.1", port);

        assert_ok!(manager.start_session(target, sample_config()).await);
        wait_for_records(manager.log(), 1).await;

        assert!(manager.stop_session("server_1").await);
        let count = manager.log().len();
        assert!(!manager.stop_session("server_1").await);
        assert_eq!(manager.log().len(), count);
    }

    #[tokio::test]
    async fn test_invalid_imei_rejected_without_records() {
        let (port, _received) = spawn_collector().await;
        let manager = tcp_manager(settings());
        let target = ServerTarget::new("server_1", "127.0.0.1", port);

        let mut config = sample_config();
        config.imei = "8667720414714".to_string();

        let result = manager.start_session(target.clone(), config.clone()).await;
        assert!(matches!(
            result,
            Err(SessionError::Validation(ValidationError::InvalidImei(_)))
        ));
        assert_err!(manager.start_all(config, vec![target]).await);

        tokio::time::sleep(TICK * 2).await;
        assert!(manager.log().is_empty());
        assert!(manager.get_status().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_all_halts_transmission() {
        let (port, _received) = spawn_collector().await;
        let manager = tcp_manager(settings());
        let targets = vec![
            ServerTarget::new("server_1", "127.0.0.1", port),
            ServerTarget::new("server_2", "127.0.0.1", port),
            ServerTarget::new("server_3", "127.0.0.1", port),
        ];

        assert_eq!(manager.start_all(sample_config(), targets).await.unwrap(), 3);
        wait_for_records(manager.log(), 9).await;
        assert_eq!(manager.get_status().await.len(), 3);

        assert_eq!(manager.stop_all_sessions().await, 3);
        let after_stop = manager.log().len();

        let status = manager.get_status().await;
        assert!(status.iter().all(|s| !s.connected));

        tokio::time::sleep(TICK * 4).await;
        assert_eq!(manager.log().len(), after_stop);
        assert!(manager.get_status().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_records_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let manager = tcp_manager(settings());
        let target = ServerTarget::new("server_1", "127.0.0.1", port);
        assert_ok!(manager.start_session(target, sample_config()).await);

        wait_for_records(manager.log(), 1).await;
        wait_for_no_sessions(&manager).await;

        let records = manager.log().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Error);
        assert_eq!(records[0].kind, PacketKind::Login);

        // No retry
        tokio::time::sleep(TICK * 3).await;
        assert_eq!(manager.log().len(), 1);
    }

    #[tokio::test]
    async fn test_server_close_ends_only_that_session() {
        let closing = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closing_port = closing.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = closing.accept().await {
                drop(socket);
            }
        });
        let (port, _received) = spawn_collector().await;

        let manager = tcp_manager(settings());
        let targets = vec![
            ServerTarget::new("closing", "127.0.0.1", closing_port),
            ServerTarget::new("healthy", "127.0.0.1", port),
        ];
        assert_ok!(manager.start_all(sample_config(), targets).await);

        for _ in 0..300 {
            let status = manager.get_status().await;
            if status.len() == 1 {
                assert_eq!(status[0].target_id, "healthy");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = manager.get_status().await;
        assert_eq!(status.len(), 1);

        let before = manager.log().len();
        tokio::time::sleep(TICK * 3).await;
        assert!(manager.log().len() > before);
        assert!(manager
            .log()
            .records()
            .iter()
            .filter(|r| r.target_id == "closing")
            .all(|r| r.kind == PacketKind::Login));

        manager.stop_all_sessions().await;
    }

    #[tokio::test]
    async fn test_reports_follow_current_config_and_position() {
        let (port, _received) = spawn_collector().await;
        let manager = tcp_manager(settings());
        let target = ServerTarget::new("server_1", "127.0.0.1", port);

        let config = sample_config();
        assert_eq!(config.position, PositionSource::DeviceGps);
        assert_ok!(manager.start_session(target, config.clone()).await);
        wait_for_records(manager.log(), 2).await;

        let first = manager.log().records()[1].packet.clone();
        assert!(first.contains(",0,"));
        assert!(first.contains(",00.000000,N,00.000000,E,"));

        manager
            .update_position(Coordinates::new(12.345678, 76.54321))
            .unwrap();
        let mut updated = config;
        updated.vendor_id = "ACME".to_string();
        manager.update_device(updated).unwrap();

        let seen = manager.log().len();
        wait_for_records(manager.log(), seen + 2).await;
        manager.stop_all_sessions().await;

        let last = manager.log().records().last().unwrap().packet.clone();
        assert!(last.starts_with("$PVT,ACME,"));
        assert!(last.contains(",12.345678,N,76.543210,E,"));
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_values() {
        let manager = tcp_manager(settings());
        assert!(manager.update_position(Coordinates::new(120.0, 0.0)).is_err());

        let mut config = sample_config();
        config.vehicle_number = String::new();
        assert!(manager.update_device(config).is_err());
        assert!(manager.current_device().is_none());
    }

    #[tokio::test]
    async fn test_custom_packet() {
        let (port, received) = spawn_collector().await;
        let manager = tcp_manager(SessionSettings {
            report_interval: Duration::from_secs(60),
            ..settings()
        });

        assert!(matches!(
            manager.send_custom("server_1", "$PING").await,
            Err(SessionError::NotFound(_))
        ));

        let target = ServerTarget::new("server_1", "127.0.0.1", port);
        assert_ok!(manager.start_session(target, sample_config()).await);
        wait_for_records(manager.log(), 1).await;

        for _ in 0..100 {
            if manager.get_status().await[0].state == SessionState::Active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_ok!(manager.send_custom("server_1", "$PING").await);
        wait_for_records(manager.log(), 2).await;
        manager.stop_all_sessions().await;

        let records = manager.log().records();
        assert_eq!(records[1].kind, PacketKind::Custom);
        assert_eq!(records[1].packet, "$PING");
        assert!(received.lock().unwrap().ends_with("$PING"));
    }

    #[tokio::test]
    async fn test_max_lifetime_expires_session() {
        let (port, _received) = spawn_collector().await;
        let manager = tcp_manager(SessionSettings {
            max_lifetime: Some(Duration::from_millis(250)),
            ..settings()
        });
        let target = ServerTarget::new("server_1", "127.0.0.1", port);

        assert_ok!(manager.start_session(target, sample_config()).await);
        wait_for_records(manager.log(), 1).await;
        wait_for_no_sessions(&manager).await;

        let count = manager.log().len();
        tokio::time::sleep(TICK * 3).await;
        assert_eq!(manager.log().len(), count);
    }

    #[tokio::test]
    async fn test_http_relay_session() {
        let base = spawn_relay().await;
        let manager = http_manager(&format!("{}/relay", base));
        let target = ServerTarget::new("server_1", "34.225.227.181", 5001);

        assert_ok!(manager.start_session(target, sample_config()).await);
        wait_for_records(manager.log(), 3).await;

        let status = manager.get_status().await;
        assert_eq!(status[0].transport, TransportKind::Http);
        assert!(status[0].connected);

        assert_eq!(manager.stop_all_sessions().await, 1);

        let records = manager.log().records();
        assert!(records[0].response.starts_with("ACK $LGN,VNDR,866772041471415,"));
        assert!(records[0].response.ends_with("34.225.227.181:5001"));
        assert!(records.iter().all(|r| r.status == RecordStatus::Success));
    }

    #[tokio::test]
    async fn test_stop_records_cancelled_in_flight_sends() {
        let base = spawn_relay().await;
        let relay = HttpRelay::new(&format!("{}/stall", base), Duration::from_secs(60)).unwrap();
        let manager = SessionManager::new(Transport::Http(relay), TransmissionLog::new(), settings());
        let targets = (1..=4)
            .map(|i| ServerTarget::new(&format!("server_{}", i), "34.225.227.181", 5001))
            .collect();

        assert_eq!(manager.start_all(sample_config(), targets).await.unwrap(), 4);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(manager.log().is_empty());

        let started = Instant::now();
        assert_eq!(manager.stop_all_sessions().await, 4);
        assert!(started.elapsed() < Duration::from_millis(900));

        // One record per in-flight login, present as soon as stop returns
        let records = manager.log().records();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.kind == PacketKind::Login
            && r.status == RecordStatus::Error
            && r.response == "cancelled: session stopped"));

        let mut ids: Vec<&str> = records.iter().map(|r| r.target_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["server_1", "server_2", "server_3", "server_4"]);

        tokio::time::sleep(TICK * 3).await;
        assert_eq!(manager.log().len(), 4);
    }

    #[tokio::test]
    async fn test_stop_all_waits_for_sessions_together() {
        let grace = Duration::from_millis(300);
        let manager = tcp_manager(SessionSettings {
            stop_grace: grace,
            ..settings()
        });

        // Tasks that ignore the stop signal and must be aborted
        {
            let mut sessions = manager.sessions.write().await;
            for generation in 0..4u64 {
                let id = format!("stuck_{}", generation);
                let (stop_tx, _stop_rx) = watch::channel(false);
                let (commands, _) = mpsc::channel(1);
                let target = ServerTarget::new(&id, "127.0.0.1", 9);
                sessions.insert(
                    id,
                    SessionHandle {
                        generation,
                        shared: Arc::new(SessionShared::new(target, TransportKind::Tcp)),
                        stop_tx,
                        commands,
                        task: tokio::spawn(tokio::time::sleep(Duration::from_secs(30))),
                    },
                );
            }
        }

        let started = Instant::now();
        assert_eq!(manager.stop_all_sessions().await, 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= grace);
        assert!(elapsed < grace * 3, "stop_all took {:?}", elapsed);
        assert!(manager.get_status().await.is_empty());
    }

    #[tokio::test]
    async fn test_http_errors_do_not_close_session() {
        let base = spawn_relay().await;
        let manager = http_manager(&format!("{}/fail", base));
        let target = ServerTarget::new("server_1", "34.225.227.181", 5001);

        assert_ok!(manager.start_session(target, sample_config()).await);
        wait_for_records(manager.log(), 3).await;

        let status = manager.get_status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].state, SessionState::Active);

        manager.stop_all_sessions().await;

        let records = manager.log().records();
        assert!(records.iter().all(|r| r.status == RecordStatus::Error));
        assert!(records[0].response.contains("502"));
    }
}
