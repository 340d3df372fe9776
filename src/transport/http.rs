//! HTTP relay transport.
//!
//! Every packet is POSTed on its own as a JSON envelope naming the real
//! destination; the relay forwards it and returns the server's reply.

use super::{Delivery, TransportError};
use crate::device::ServerTarget;
use crate::packet::Packet;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Request body understood by the relay.
#[derive(Debug, Serialize)]
pub struct RelayEnvelope<'a> {
    pub packet: &'a str,
    #[serde(rename = "HOST")]
    pub host: &'a str,
    #[serde(rename = "PORT")]
    pub port: String,
}

/// Client for the packet relay endpoint.
#[derive(Debug, Clone)]
pub struct HttpRelay {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpRelay {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("http://{}", url)
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Self {
            client,
            url,
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Relay one packet to `target` and return the response body.
    ///
    /// Non-2xx responses become [`TransportError::Status`] carrying the body.
    pub async fn send(&self, target: &ServerTarget, packet: &str) -> Result<String, TransportError> {
        let envelope = RelayEnvelope {
            packet,
            host: &target.host,
            port: target.port.to_string(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_error(e))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// A stateless link bound to `target`.
    pub fn link(&self, target: &ServerTarget) -> HttpLink {
        HttpLink {
            relay: self.clone(),
            target: target.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    fn map_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// Relay link for one target. Open until closed; failures never close it.
#[derive(Debug)]
pub struct HttpLink {
    relay: HttpRelay,
    target: ServerTarget,
    open: Arc<AtomicBool>,
}

impl HttpLink {
    pub async fn send(&mut self, packet: &Packet) -> Result<Delivery, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let body = self.relay.send(&self.target, packet.as_str()).await?;
        Ok(Delivery::Response(body))
    }

    pub fn open_flag(&self) -> Arc<AtomicBool> {
        self.open.clone()
    }

    pub fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::Value;

    /// Local relay: `/relay` echoes the envelope, `/fail` answers 502 and
    /// `/stall` holds the request for 30 seconds.
    pub(crate) async fn spawn_relay() -> String {
        async fn relay(Json(body): Json<Value>) -> String {
            format!(
                "ACK {} {}:{}",
                body["packet"].as_str().unwrap_or_default(),
                body["HOST"].as_str().unwrap_or_default(),
                body["PORT"].as_str().unwrap_or_default()
            )
        }

        async fn fail() -> (StatusCode, &'static str) {
            (StatusCode::BAD_GATEWAY, "upstream refused")
        }

        async fn stall() -> &'static str {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "late"
        }

        let app = Router::new()
            .route("/relay", post(relay))
            .route("/fail", post(fail))
            .route("/stall", post(stall));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{}", addr)
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = RelayEnvelope {
            packet: "$LGN,VNDR*00",
            host: "34.225.227.181",
            port: "5001".to_string(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"packet": "$LGN,VNDR*00", "HOST": "34.225.227.181", "PORT": "5001"})
        );
    }

    #[test]
    fn test_url_scheme_added() {
        let relay = HttpRelay::new("relay.local:8090/relay", Duration::from_secs(1)).unwrap();
        assert_eq!(relay.url(), "http://relay.local:8090/relay");
    }

    #[tokio::test]
    async fn test_send_success() {
        let base = spawn_relay().await;
        let relay = HttpRelay::new(&format!("{}/relay", base), Duration::from_secs(2)).unwrap();
        let target = ServerTarget::new("server_1", "34.225.227.181", 5001);

        let body = relay.send(&target, "$PVT,X*00").await.unwrap();
        assert_eq!(body, "ACK $PVT,X*00 34.225.227.181:5001");
    }

    #[tokio::test]
    async fn test_send_status_error() {
        let base = spawn_relay().await;
        let relay = HttpRelay::new(&format!("{}/fail", base), Duration::from_secs(2)).unwrap();
        let target = ServerTarget::new("server_1", "10.0.0.1", 5001);

        let err = relay.send(&target, "$PVT,X*00").await.unwrap_err();
        match err {
            TransportError::Status { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body, "upstream refused");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_send_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let relay = HttpRelay::new(&format!("http://{}/relay", addr), Duration::from_secs(2)).unwrap();
        let target = ServerTarget::new("server_1", "10.0.0.1", 5001);
        assert!(relay.send(&target, "$PVT,X*00").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_link_rejects_send() {
        let relay = HttpRelay::new("http://127.0.0.1:9/relay", Duration::from_secs(1)).unwrap();
        let mut link = relay.link(&ServerTarget::new("server_1", "10.0.0.1", 5001));
        link.close();
        let err = link.send(&Packet::custom("$X*00")).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
