//! Thin Modbus-TCP client for Hoymiles DTUs.
//!
//! One poll opens a fresh connection, reads the DTU serial number and then
//! walks the microinverter data blocks until an empty block terminates the
//! list. Only the handful of registers the publisher needs is implemented
//! here; everything above the framing speaks [`DtuClient`].

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use dtu2mqtt::dtu_client::{DtuClient, DtuError};
use dtu2mqtt::plant_data::{MicroinverterData, PlantData};
use log::{debug, info};

const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Start of the DTU serial number registers (6 BCD bytes).
const DTU_SERIAL_ADDRESS: u16 = 0x2000;
const DTU_SERIAL_REGISTERS: u16 = 3;

/// Start of the first microinverter data block.
const MI_DATA_ADDRESS: u16 = 0x1000;
/// Address distance between two consecutive data blocks.
const MI_DATA_STRIDE: u16 = 0x28;
/// Registers read per data block.
const MI_DATA_REGISTERS: u16 = 20;
/// Upper bound on ports behind one DTU; a DTU-Pro manages up to 99 units.
const MAX_PORTS: u16 = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NetworkState {
    Unknown,
    Online,
    Offline,
}

pub struct ModbusTcpDtu {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
    transaction: u16,
    state: NetworkState,
}

impl ModbusTcpDtu {
    pub fn new(host: &str, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.to_string(),
            port,
            unit_id,
            timeout: Duration::from_millis(3_000),
            transaction: 0,
            state: NetworkState::Unknown,
        }
    }

    fn set_state(&mut self, new_state: NetworkState) {
        if self.state != new_state {
            self.state = new_state;
            info!("DTU is {new_state:?}");
        }
    }

    fn connect(&self) -> Result<TcpStream, DtuError> {
        let address: SocketAddr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| DtuError::Protocol(format!("cannot resolve {}", self.host)))?;
        let stream = TcpStream::connect_timeout(&address, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }

    fn read_registers(
        &mut self,
        stream: &mut TcpStream,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DtuError> {
        self.transaction = self.transaction.wrapping_add(1);

        // MBAP header + read-holding-registers PDU
        let mut request = Vec::with_capacity(12);
        request.extend_from_slice(&self.transaction.to_be_bytes());
        request.extend_from_slice(&0_u16.to_be_bytes()); // protocol id
        request.extend_from_slice(&6_u16.to_be_bytes()); // remaining length
        request.push(self.unit_id);
        request.push(READ_HOLDING_REGISTERS);
        request.extend_from_slice(&address.to_be_bytes());
        request.extend_from_slice(&count.to_be_bytes());
        stream.write_all(&request)?;

        let mut header = [0_u8; 9];
        stream.read_exact(&mut header).map_err(short_response)?;
        let function = header[7];
        if function == READ_HOLDING_REGISTERS | 0x80 {
            return Err(DtuError::Protocol(format!(
                "modbus exception 0x{:02x} reading {count} registers at 0x{address:04x}",
                header[8]
            )));
        }
        if function != READ_HOLDING_REGISTERS {
            return Err(DtuError::Protocol(format!(
                "unexpected function code 0x{function:02x}"
            )));
        }
        let byte_count = header[8] as usize;
        if byte_count != count as usize * 2 {
            return Err(DtuError::Protocol(format!(
                "expected {} payload bytes, DTU announced {byte_count}",
                count * 2
            )));
        }

        let mut payload = vec![0_u8; byte_count];
        stream.read_exact(&mut payload).map_err(short_response)?;
        Ok(payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}

fn short_response(e: std::io::Error) -> DtuError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        DtuError::NoResponse("connection closed before a full frame arrived".to_string())
    } else {
        DtuError::Io(e)
    }
}

/// Decode a BCD-packed serial number into its printable form.
fn serial_from_registers(registers: &[u16]) -> String {
    registers
        .iter()
        .flat_map(|r| r.to_be_bytes())
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn microinverter_from_registers(registers: &[u16]) -> MicroinverterData {
    MicroinverterData {
        data_type: (registers[0] >> 8) as u8,
        serial_number: serial_from_registers(&registers[1..4]),
        port_number: registers[4],
        pv_voltage: f64::from(registers[5]) / 10.0,
        pv_current: f64::from(registers[6]) / 100.0,
        grid_voltage: f64::from(registers[7]) / 10.0,
        grid_frequency: f64::from(registers[8]) / 100.0,
        pv_power: f64::from(registers[9]) / 10.0,
        today_production: u32::from(registers[10]),
        total_production: (u64::from(registers[11]) << 16) | u64::from(registers[12]),
        temperature: f64::from(registers[13] as i16) / 10.0,
        operating_status: registers[14],
        alarm_code: registers[15],
        alarm_count: registers[16],
        link_status: registers[17],
    }
}

impl DtuClient for ModbusTcpDtu {
    fn plant_data(&mut self) -> Result<PlantData, DtuError> {
        let result = self.poll();
        match &result {
            Ok(_) => self.set_state(NetworkState::Online),
            Err(e) => {
                debug!("{e}");
                self.set_state(NetworkState::Offline);
            }
        }
        result
    }
}

impl ModbusTcpDtu {
    fn poll(&mut self) -> Result<PlantData, DtuError> {
        let mut stream = self.connect()?;

        let serial_registers =
            self.read_registers(&mut stream, DTU_SERIAL_ADDRESS, DTU_SERIAL_REGISTERS)?;
        let mut plant = PlantData::new(&serial_from_registers(&serial_registers));

        for index in 0..MAX_PORTS {
            let address = MI_DATA_ADDRESS + index * MI_DATA_STRIDE;
            let registers = self.read_registers(&mut stream, address, MI_DATA_REGISTERS)?;
            if registers[0] == 0 {
                // end of the populated data blocks
                break;
            }
            plant
                .microinverter_data
                .push(microinverter_from_registers(&registers));
        }

        // plant-level aggregates; the builder overwrites the energy sums
        // with reconciled values when post-processing is enabled
        plant.pv_power = plant
            .microinverter_data
            .iter()
            .map(|mi| mi.pv_power)
            .sum();
        plant.today_production = plant
            .microinverter_data
            .iter()
            .map(|mi| u64::from(mi.today_production))
            .sum();
        plant.total_production = plant
            .microinverter_data
            .iter()
            .map(|mi| mi.total_production)
            .sum();
        plant.alarm_flag = plant
            .microinverter_data
            .iter()
            .any(|mi| mi.alarm_code != 0);

        Ok(plant)
    }
}
