//! Simulated vehicle telemetry carried in position reports.

use serde::{Deserialize, Serialize};

/// Frame numbers are six digits on the wire.
const FRAME_NUMBER_LIMIT: u64 = 1_000_000;

/// One neighbouring-cell measurement triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellMeasurement {
    pub cell_id: String,
    pub lac: String,
    pub signal: String,
}

impl CellMeasurement {
    pub fn new(cell_id: &str, lac: &str, signal: &str) -> Self {
        Self {
            cell_id: cell_id.to_string(),
            lac: lac.to_string(),
            signal: signal.to_string(),
        }
    }
}

/// Everything in a position report that is not device identity or position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// `NR` for a normal report, `EPB` for an emergency.
    pub packet_type: String,
    pub alert_id: u16,
    /// `L` for live, `H` for history.
    pub packet_status: char,
    pub speed_kmh: f64,
    pub heading: f64,
    pub satellites: u8,
    pub altitude_m: f64,
    pub pdop: f64,
    pub hdop: f64,
    pub ignition: bool,
    pub main_power: bool,
    pub main_voltage: f64,
    pub battery_voltage: f64,
    pub tamper: bool,
    pub door_closed: bool,
    /// GSM signal strength, 0-31.
    pub signal_strength: u8,
    pub mcc: u16,
    pub mnc: u16,
    pub lac: String,
    pub cell_id: String,
    pub neighbours: [CellMeasurement; 4],
    pub spare: CellMeasurement,
    pub analog_input: f64,
    pub frame_number: u64,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            packet_type: "NR".to_string(),
            alert_id: 1,
            packet_status: 'L',
            speed_kmh: 0.0,
            heading: 117.58,
            satellites: 39,
            altitude_m: 286.7,
            pdop: 0.42,
            hdop: 0.43,
            ignition: true,
            main_power: true,
            main_voltage: 12.2,
            battery_voltage: 4.1,
            tamper: false,
            door_closed: true,
            signal_strength: 12,
            mcc: 404,
            mnc: 53,
            lac: "16C7".to_string(),
            cell_id: "E4C2".to_string(),
            neighbours: [
                CellMeasurement::new("2138", "700000", "29"),
                CellMeasurement::new("2137", "700000", "21"),
                CellMeasurement::new("2136", "700000", "21"),
                CellMeasurement::new("968A", "70000", "19"),
            ],
            spare: CellMeasurement::new("0000", "0000", "00"),
            analog_input: 0.0,
            frame_number: 492894,
        }
    }
}

impl Telemetry {
    /// Move to the next frame, wrapping after 999999.
    pub fn advance_frame(&mut self) {
        self.frame_number = (self.frame_number + 1) % FRAME_NUMBER_LIMIT;
    }

    /// Fields from speed through HDOP.
    pub(crate) fn motion_fields(&self) -> [String; 6] {
        [
            self.speed_kmh.to_string(),
            self.heading.to_string(),
            self.satellites.to_string(),
            self.altitude_m.to_string(),
            self.pdop.to_string(),
            self.hdop.to_string(),
        ]
    }

    /// Fields from ignition through the cell id, after the network provider.
    pub(crate) fn device_fields(&self) -> Vec<String> {
        vec![
            flag(self.ignition).to_string(),
            flag(self.main_power).to_string(),
            self.main_voltage.to_string(),
            self.battery_voltage.to_string(),
            flag(self.tamper).to_string(),
            if self.door_closed { "C" } else { "O" }.to_string(),
            self.signal_strength.to_string(),
            self.mcc.to_string(),
            self.mnc.to_string(),
            self.lac.clone(),
            self.cell_id.clone(),
        ]
    }

    /// Neighbour cells, the spare triple, the analog input and the frame number.
    pub(crate) fn trailer_fields(&self) -> Vec<String> {
        let mut fields = Vec::with_capacity(17);
        for cell in self.neighbours.iter().chain(std::iter::once(&self.spare)) {
            fields.push(cell.cell_id.clone());
            fields.push(cell.lac.clone());
            fields.push(cell.signal.clone());
        }
        fields.push(self.analog_input.to_string());
        fields.push(format!("{:06}", self.frame_number));
        fields
    }
}

fn flag(on: bool) -> &'static str {
    if on {
        "1"
    } else {
        "0"
    }
}
