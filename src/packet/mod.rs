//! Packet encoder for the tracker wire protocol.
//!
//! A packet is a comma-separated ASCII sentence `$<TAG>,<field>,...,<field>`
//! followed by `*` and a two-digit uppercase hex checksum. The checksum is the
//! XOR of every byte after the leading `$`.
//!
//! Two kinds are produced: `LGN` (login, once per session) and `PVT`
//! (position/velocity/time report, on every tick).

mod telemetry;

pub use telemetry::*;

use crate::device::{Coordinates, DeviceConfig, PositionSource};

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_VENDOR_ID: &str = "VNDR";
pub const DEFAULT_FIRMWARE_VERSION: &str = "FIRMWAREVER1.0";
pub const DEFAULT_NETWORK_PROVIDER: &str = "AIRTEL";

/// Position announced at login when neither a manual position nor a live fix exists.
pub const LOGIN_FALLBACK_POSITION: Coordinates = Coordinates {
    latitude: 30.101455,
    longitude: 78.289948,
};

const LOGIN_PROTOCOL: &str = "AIS140";

/// The kind of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Login,
    PositionReport,
    /// Raw text supplied by the operator.
    Custom,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::Login => f.write_str("login"),
            PacketKind::PositionReport => f.write_str("position_report"),
            PacketKind::Custom => f.write_str("custom"),
        }
    }
}

/// An encoded packet. The text never changes after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketKind,
    text: String,
}

impl Packet {
    /// Wrap operator-supplied text without touching it.
    pub fn custom(text: impl Into<String>) -> Self {
        Self {
            kind: PacketKind::Custom,
            text: text.into(),
        }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn into_string(self) -> String {
        self.text
    }

    fn seal(kind: PacketKind, fields: &[String]) -> Self {
        let payload = fields.join(",");
        let ck = checksum(&payload);
        Self {
            kind,
            text: format!("{}*{}", payload, ck),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// XOR of every byte after the first, as two uppercase hex digits.
pub fn checksum(payload: &str) -> String {
    let ck = payload.bytes().skip(1).fold(0u8, |acc, b| acc ^ b);
    format!("{:02X}", ck)
}

/// Recompute the checksum of `text` and compare it with its trailer.
pub fn verify_packet(text: &str) -> bool {
    if !text.starts_with('$') {
        return false;
    }

    let Some((payload, trailer)) = text.rsplit_once('*') else {
        return false;
    };

    trailer.len() == 2
        && trailer
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
        && checksum(payload) == trailer
}

/// Build the login packet sent once when a session connects.
pub fn build_login_packet(config: &DeviceConfig, live: Option<Coordinates>) -> Packet {
    let position = resolve_position(config, live).unwrap_or(LOGIN_FALLBACK_POSITION);

    let fields = [
        "$LGN".to_string(),
        or_default(&config.vendor_id, DEFAULT_VENDOR_ID),
        config.imei.clone(),
        or_default(&config.firmware_version, DEFAULT_FIRMWARE_VERSION),
        LOGIN_PROTOCOL.to_string(),
        format!("{:.6}", position.latitude),
        format!("{:.6}", position.longitude),
    ];

    Packet::seal(PacketKind::Login, &fields)
}

/// Build a position report stamped with the current local time.
pub fn build_position_report_packet(config: &DeviceConfig, live: Option<Coordinates>) -> Packet {
    build_position_report_at(
        config,
        live,
        &Telemetry::default(),
        Local::now().naive_local(),
    )
}

/// Build a position report for an explicit telemetry block and timestamp.
pub fn build_position_report_at(
    config: &DeviceConfig,
    live: Option<Coordinates>,
    telemetry: &Telemetry,
    now: NaiveDateTime,
) -> Packet {
    let position = resolve_position(config, live);
    let (fix, coords) = match position {
        Some(c) => ("1", c),
        None => ("0", Coordinates::new(0.0, 0.0)),
    };

    let provider = config
        .network_provider
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| DEFAULT_NETWORK_PROVIDER.to_string());

    let mut fields = Vec::with_capacity(50);
    fields.extend([
        "$PVT".to_string(),
        or_default(&config.vendor_id, DEFAULT_VENDOR_ID),
        or_default(&config.firmware_version, DEFAULT_FIRMWARE_VERSION),
        telemetry.packet_type.clone(),
        telemetry.alert_id.to_string(),
        telemetry.packet_status.to_string(),
        config.imei.clone(),
        config.vehicle_id(),
        fix.to_string(),
        now.format("%d%m%Y").to_string(),
        now.format("%H%M%S").to_string(),
        format_coordinate(coords.latitude),
        if coords.latitude < 0.0 { "S" } else { "N" }.to_string(),
        format_coordinate(coords.longitude),
        if coords.longitude < 0.0 { "W" } else { "E" }.to_string(),
    ]);
    fields.extend(telemetry.motion_fields());
    fields.push(provider);
    fields.extend(telemetry.device_fields());
    fields.extend(telemetry.trailer_fields());

    Packet::seal(PacketKind::PositionReport, &fields)
}

/// Manual coordinates win; device-GPS mode uses the live fix if there is one.
pub fn resolve_position(config: &DeviceConfig, live: Option<Coordinates>) -> Option<Coordinates> {
    match config.position {
        PositionSource::Manual(coords) => Some(coords),
        PositionSource::DeviceGps => live,
    }
}

/// Absolute value, six decimals, zero-padded to `DD.dddddd`.
fn format_coordinate(value: f64) -> String {
    format!("{:09.6}", value.abs())
}

fn or_default(value: &str, default: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}
