//! Configuration module for TrackerSHV.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::session::SessionSettings;
use crate::transport::{HttpRelay, TcpTransport, Transport, TransportError, TransportKind};

use std::env;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the control API (default: 8080)
    pub http_port: u16,
    /// Transport used for every session (default: tcp)
    pub transport: TransportKind,
    /// Relay endpoint, required when `transport` is http
    pub relay_url: Option<String>,
    pub report_interval: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
    /// Zero disables the bound.
    pub max_session: Duration,
    pub status_interval: Duration,
    /// Device profile to start transmitting at boot
    pub profile_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            transport: TransportKind::Tcp,
            relay_url: None,
            report_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(10),
            max_session: Duration::from_secs(300),
            status_interval: Duration::from_secs(2),
            profile_path: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TRACKERSHV_HTTP_PORT`: HTTP port (default: 8080)
    /// - `TRACKERSHV_TRANSPORT`: `tcp` or `http` (default: tcp)
    /// - `TRACKERSHV_RELAY_URL`: relay endpoint for the http transport
    /// - `TRACKERSHV_REPORT_INTERVAL_SECS`: seconds between reports (default: 5)
    /// - `TRACKERSHV_CONNECT_TIMEOUT_SECS`: TCP connect timeout (default: 15)
    /// - `TRACKERSHV_IDLE_TIMEOUT_SECS`: TCP idle timeout (default: 15)
    /// - `TRACKERSHV_REQUEST_TIMEOUT_SECS`: relay request timeout (default: 10)
    /// - `TRACKERSHV_MAX_SESSION_SECS`: session lifetime, 0 for none (default: 300)
    /// - `TRACKERSHV_STATUS_INTERVAL_SECS`: status log period (default: 2)
    /// - `TRACKERSHV_PROFILE`: device profile JSON to start at boot
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut cfg = Self::default();

        if let Some(port) = lookup("TRACKERSHV_HTTP_PORT").and_then(|v| v.parse().ok()) {
            cfg.http_port = port;
        }

        if let Some(value) = lookup("TRACKERSHV_TRANSPORT") {
            match value.parse() {
                Ok(kind) => cfg.transport = kind,
                Err(e) => tracing::warn!("Ignoring TRACKERSHV_TRANSPORT: {}", e),
            }
        }

        cfg.relay_url = lookup("TRACKERSHV_RELAY_URL").filter(|v| !v.trim().is_empty());

        let seconds = |key: &str, current: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(current)
        };

        cfg.report_interval = seconds("TRACKERSHV_REPORT_INTERVAL_SECS", cfg.report_interval);
        cfg.connect_timeout = seconds("TRACKERSHV_CONNECT_TIMEOUT_SECS", cfg.connect_timeout);
        cfg.idle_timeout = seconds("TRACKERSHV_IDLE_TIMEOUT_SECS", cfg.idle_timeout);
        cfg.request_timeout = seconds("TRACKERSHV_REQUEST_TIMEOUT_SECS", cfg.request_timeout);
        cfg.max_session = seconds("TRACKERSHV_MAX_SESSION_SECS", cfg.max_session);
        cfg.status_interval = seconds("TRACKERSHV_STATUS_INTERVAL_SECS", cfg.status_interval);

        // A zero period would spin
        if cfg.report_interval.is_zero() {
            cfg.report_interval = Self::default().report_interval;
        }
        if cfg.status_interval.is_zero() {
            cfg.status_interval = Self::default().status_interval;
        }

        cfg.profile_path = lookup("TRACKERSHV_PROFILE").filter(|v| !v.trim().is_empty());

        cfg
    }

    /// Build the configured transport.
    pub fn build_transport(&self) -> Result<Transport, TransportError> {
        match self.transport {
            TransportKind::Tcp => Ok(Transport::Tcp(TcpTransport::new(
                self.connect_timeout,
                self.idle_timeout,
            ))),
            TransportKind::Http => {
                let url = self.relay_url.as_deref().ok_or_else(|| {
                    TransportError::Config(
                        "TRACKERSHV_RELAY_URL is required for the http transport".to_string(),
                    )
                })?;
                Ok(Transport::Http(HttpRelay::new(url, self.request_timeout)?))
            }
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            report_interval: self.report_interval,
            max_lifetime: (!self.max_session.is_zero()).then_some(self.max_session),
            ..SessionSettings::default()
        }
    }
}
