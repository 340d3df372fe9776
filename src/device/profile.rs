//! Device profile: the raw configuration form, loadable from JSON.

use super::{
    validate_targets, Coordinates, DeviceConfig, NetworkProvider, PositionSource, ServerTarget,
    ValidationError,
};

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Profile loading error types.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("failed to read profile: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse profile: {0}")]
    Json(#[from] serde_json::Error),
}

/// Port as typed into the form; JSON clients send either a number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortField {
    Number(i64),
    Text(String),
}

impl Default for PortField {
    fn default() -> Self {
        PortField::Text(String::new())
    }
}

impl PortField {
    fn parse(&self) -> Option<u16> {
        let port = match self {
            PortField::Number(n) => u16::try_from(*n).ok()?,
            PortField::Text(s) => s.trim().parse::<u16>().ok()?,
        };
        (port != 0).then_some(port)
    }

    fn raw(&self) -> String {
        match self {
            PortField::Number(n) => n.to_string(),
            PortField::Text(s) => s.clone(),
        }
    }
}

/// One server row of the form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEntry {
    pub id: Option<String>,
    #[serde(alias = "ip")]
    pub host: String,
    pub port: PortField,
}

/// Unvalidated device and server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceProfile {
    #[serde(alias = "ipPortPairs")]
    pub servers: Vec<ServerEntry>,
    pub device_imei: String,
    pub vendor_id: String,
    pub vehicle_number: String,
    pub network_provider: String,
    pub firmware_version: String,
    pub use_gps_coordinates: bool,
    pub latitude: String,
    pub longitude: String,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            device_imei: String::new(),
            vendor_id: String::new(),
            vehicle_number: String::new(),
            network_provider: String::new(),
            firmware_version: String::new(),
            use_gps_coordinates: true,
            latitude: String::new(),
            longitude: String::new(),
        }
    }
}

impl DeviceProfile {
    /// Read a profile from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProfileError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Validate the server rows and the device fields together.
    pub fn into_parts(&self) -> Result<(DeviceConfig, Vec<ServerTarget>), ValidationError> {
        let targets = self.server_targets()?;
        let config = self.device_config()?;
        Ok((config, targets))
    }

    /// Validate and convert the server rows. Rows without an id get `server_<n>`.
    pub fn server_targets(&self) -> Result<Vec<ServerTarget>, ValidationError> {
        let targets = self
            .servers
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let id = entry
                    .id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("server_{}", i + 1));

                let host = entry.host.trim();
                if host.is_empty() {
                    return Err(ValidationError::MissingHost(id));
                }

                let port = entry.port.parse().ok_or_else(|| ValidationError::InvalidPort {
                    id: id.clone(),
                    port: entry.port.raw(),
                })?;

                Ok(ServerTarget::new(&id, host, port))
            })
            .collect::<Result<Vec<_>, _>>()?;

        validate_targets(&targets)?;
        Ok(targets)
    }

    /// Validate and convert the device fields.
    pub fn device_config(&self) -> Result<DeviceConfig, ValidationError> {
        let network_provider: NetworkProvider = self.network_provider.parse()?;

        let position = if self.use_gps_coordinates {
            PositionSource::DeviceGps
        } else {
            let lat = self.latitude.trim();
            let lon = self.longitude.trim();
            if lat.is_empty() || lon.is_empty() {
                return Err(ValidationError::MissingCoordinates);
            }
            PositionSource::Manual(Coordinates::new(
                parse_coordinate(lat)?,
                parse_coordinate(lon)?,
            ))
        };

        let config = DeviceConfig {
            vendor_id: self.vendor_id.trim().to_string(),
            firmware_version: self.firmware_version.trim().to_string(),
            imei: self.device_imei.trim().to_string(),
            vehicle_number: self.vehicle_number.trim().to_string(),
            network_provider: Some(network_provider),
            position,
        };
        config.validate()?;

        Ok(config)
    }
}

fn parse_coordinate(value: &str) -> Result<f64, ValidationError> {
    value
        .parse::<f64>()
        .map_err(|_| ValidationError::InvalidCoordinate(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_profile() -> DeviceProfile {
        DeviceProfile {
            servers: vec![ServerEntry {
                id: None,
                host: "34.225.227.181".to_string(),
                port: PortField::Text("5001".to_string()),
            }],
            device_imei: "866772041471415".to_string(),
            vendor_id: "VNDR".to_string(),
            vehicle_number: "PB01BV2345".to_string(),
            network_provider: "Airtel".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_into_parts() {
        let (config, targets) = sample_profile().into_parts().unwrap();
        assert_eq!(config.imei, "866772041471415");
        assert_eq!(config.network_provider, Some(NetworkProvider::Airtel));
        assert_eq!(config.position, PositionSource::DeviceGps);
        assert_eq!(targets, vec![ServerTarget::new("server_1", "34.225.227.181", 5001)]);
    }

    #[test]
    fn test_manual_coordinates_required() {
        let mut profile = sample_profile();
        profile.use_gps_coordinates = false;
        assert_eq!(
            profile.device_config(),
            Err(ValidationError::MissingCoordinates)
        );

        profile.latitude = "30.101455".to_string();
        profile.longitude = "east".to_string();
        assert!(matches!(
            profile.device_config(),
            Err(ValidationError::InvalidCoordinate(_))
        ));

        profile.longitude = "78.289948".to_string();
        let config = profile.device_config().unwrap();
        assert_eq!(
            config.position,
            PositionSource::Manual(Coordinates::new(30.101455, 78.289948))
        );
    }

    #[test]
    fn test_short_imei_rejected() {
        let mut profile = sample_profile();
        profile.device_imei = "86677204147141".to_string();
        assert!(matches!(
            profile.into_parts(),
            Err(ValidationError::InvalidImei(_))
        ));
    }

    #[test]
    fn test_bad_ports_rejected() {
        for port in [
            PortField::Text(String::new()),
            PortField::Text("http".to_string()),
            PortField::Number(0),
            PortField::Number(70000),
        ] {
            let mut profile = sample_profile();
            profile.servers[0].port = port;
            assert!(matches!(
                profile.server_targets(),
                Err(ValidationError::InvalidPort { .. })
            ));
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = NamedTempFile::new().unwrap();
        write!(
            tmp,
            r#"{{
                "ipPortPairs": [
                    {{"id": "1", "ip": "127.0.0.1", "port": "5001"}},
                    {{"ip": "tracker.local", "port": 5002}}
                ],
                "deviceImei": "866772041471415",
                "vendorId": "VNDR",
                "vehicleNumber": "pb01 bv 2345",
                "networkProvider": "BSNL",
                "useGpsCoordinates": false,
                "latitude": "30.101455",
                "longitude": "78.289948"
            }}"#
        )
        .unwrap();

        let profile = DeviceProfile::load(tmp.path()).unwrap();
        let (config, targets) = profile.into_parts().unwrap();
        assert_eq!(config.vehicle_id(), "000000PB01BV2345");
        assert_eq!(config.network_provider, Some(NetworkProvider::Bsnl));
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].id, "1");
        assert_eq!(targets[1].id, "server_2");
        assert_eq!(targets[1].port, 5002);
    }

    #[test]
    fn test_load_missing_file() {
        let result = DeviceProfile::load("/nonexistent/profile.json");
        assert!(matches!(result, Err(ProfileError::Io(_))));
    }
}
