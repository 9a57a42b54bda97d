//! Data read from the DTU during one poll. Mirrors the register layout of
//! the Modbus interface: one record per microinverter port, where several
//! ports may belong to the same physical microinverter (same serial number).

/// One microinverter port as reported by the DTU.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MicroinverterData {
    pub data_type: u8,
    pub serial_number: String,
    pub port_number: u16,
    pub pv_voltage: f64,
    pub pv_current: f64,
    pub grid_voltage: f64,
    pub grid_frequency: f64,
    pub pv_power: f64,
    pub today_production: u32,
    pub total_production: u64,
    pub temperature: f64,
    pub operating_status: u16,
    pub alarm_code: u16,
    pub alarm_count: u16,
    pub link_status: u16,
}

/// Snapshot of the whole plant: the DTU record plus all port records.
///
/// The plant-level aggregates are whatever the transport reported; when
/// production post-processing is enabled the builder overwrites the energy
/// aggregates with the reconciled sums before serializing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlantData {
    pub dtu: String,
    pub pv_power: f64,
    pub today_production: u64,
    pub total_production: u64,
    pub alarm_flag: bool,
    pub microinverter_data: Vec<MicroinverterData>,
}

impl PlantData {
    pub fn new(dtu_serial: &str) -> Self {
        Self {
            dtu: dtu_serial.to_string(),
            ..Default::default()
        }
    }
}
