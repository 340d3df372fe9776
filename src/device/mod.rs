//! Device model: tracker configuration, server targets and pre-flight validation.

mod profile;

pub use profile::*;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Width of the vehicle identifier field after normalization.
pub const VEHICLE_ID_WIDTH: usize = 16;

/// Configuration problems caught before any session starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("IMEI must be 15 digits, got {0:?}")]
    InvalidImei(String),
    #[error("vendor ID is required")]
    MissingVendorId,
    #[error("vehicle number is required")]
    MissingVehicleNumber,
    #[error("network provider is required")]
    MissingNetworkProvider,
    #[error("unknown network provider: {0}")]
    UnknownNetworkProvider(String),
    #[error("latitude and longitude are required for manual positioning")]
    MissingCoordinates,
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(String),
    #[error("at least one server is required")]
    NoTargets,
    #[error("server {0} has no host")]
    MissingHost(String),
    #[error("server {id} has invalid port {port:?}")]
    InvalidPort { id: String, port: String },
    #[error("duplicate server id: {0}")]
    DuplicateTarget(String),
}

/// Cellular network the simulated modem reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkProvider {
    Airtel,
    Vodafone,
    #[serde(rename = "BSNL")]
    Bsnl,
}

impl NetworkProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkProvider::Airtel => "Airtel",
            NetworkProvider::Vodafone => "Vodafone",
            NetworkProvider::Bsnl => "BSNL",
        }
    }
}

impl fmt::Display for NetworkProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkProvider {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "airtel" => Ok(NetworkProvider::Airtel),
            "vodafone" => Ok(NetworkProvider::Vodafone),
            "bsnl" => Ok(NetworkProvider::Bsnl),
            "" => Err(ValidationError::MissingNetworkProvider),
            other => Err(ValidationError::UnknownNetworkProvider(other.to_string())),
        }
    }
}

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Reject non-finite or out-of-range values.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ValidationError::InvalidCoordinate(format!(
                "latitude {}",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ValidationError::InvalidCoordinate(format!(
                "longitude {}",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// Where position reports take their coordinates from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PositionSource {
    /// Coordinates are supplied per send from the live GPS feed.
    DeviceGps,
    /// A fixed position entered by the operator.
    Manual(Coordinates),
}

/// Snapshot of the emulated device used to build packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub vendor_id: String,
    pub firmware_version: String,
    pub imei: String,
    pub vehicle_number: String,
    pub network_provider: Option<NetworkProvider>,
    pub position: PositionSource,
}

impl DeviceConfig {
    /// Check every field a session depends on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_imei(&self.imei) {
            return Err(ValidationError::InvalidImei(self.imei.clone()));
        }
        if self.vendor_id.trim().is_empty() {
            return Err(ValidationError::MissingVendorId);
        }
        if self.vehicle_number.trim().is_empty() {
            return Err(ValidationError::MissingVehicleNumber);
        }
        if self.network_provider.is_none() {
            return Err(ValidationError::MissingNetworkProvider);
        }
        if let PositionSource::Manual(coords) = &self.position {
            coords.validate()?;
        }
        Ok(())
    }

    /// Vehicle number in its on-the-wire form.
    pub fn vehicle_id(&self) -> String {
        normalize_vehicle_number(&self.vehicle_number)
    }
}

/// One transmission destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerTarget {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl ServerTarget {
    pub fn new(id: &str, host: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::MissingHost(self.id.clone()));
        }
        if self.port == 0 {
            return Err(ValidationError::InvalidPort {
                id: self.id.clone(),
                port: self.port.to_string(),
            });
        }
        Ok(())
    }
}

/// Validate an ordered target list: non-empty, every entry valid, ids distinct.
pub fn validate_targets(targets: &[ServerTarget]) -> Result<(), ValidationError> {
    if targets.is_empty() {
        return Err(ValidationError::NoTargets);
    }

    let mut seen = HashSet::new();
    for target in targets {
        target.validate()?;
        if !seen.insert(target.id.as_str()) {
            return Err(ValidationError::DuplicateTarget(target.id.clone()));
        }
    }

    Ok(())
}

/// True when `imei` is exactly 15 ASCII digits.
pub fn is_valid_imei(imei: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[0-9]{15}$").unwrap());
    re.is_match(imei)
}

/// Strip everything outside `[A-Za-z0-9]`, uppercase, and left-pad with `0`
/// to 16 characters. Longer values are kept whole.
pub fn normalize_vehicle_number(raw: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9]").unwrap());
    let stripped = re.replace_all(raw, "").to_ascii_uppercase();
    format!("{:0>width$}", stripped, width = VEHICLE_ID_WIDTH)
}

#[cfg(test)]
pub(crate) fn sample_config() -> DeviceConfig {
    DeviceConfig {
        vendor_id: "VNDR".to_string(),
        firmware_version: String::new(),
        imei: "866772041471415".to_string(),
        vehicle_number: "PB01BV2345".to_string(),
        network_provider: Some(NetworkProvider::Airtel),
        position: PositionSource::DeviceGps,
    }
}
