//! Modbus TCP-like shim
//!
//! Register access by function-code family. Quantities follow the Modbus PDU
//! limits: 1..=125 registers, 1..=2000 bits per request.

use async_trait::async_trait;
use tracing::debug;

use super::sim::{SimLink, Waveform};
use super::{Session, SimulationSettings};
use crate::device::{Device, Endpoint};
use crate::error::{LinkError, Result};

/// Maximum registers per read request (FC03/FC04)
pub const MAX_REGISTERS: u16 = 125;
/// Maximum bits per read request (FC01/FC02)
pub const MAX_BITS: u16 = 2000;
/// Highest assignable unit id
pub const MAX_UNIT_ID: u8 = 247;
/// Unit id used when the device does not configure one
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Typed Modbus read operations
#[async_trait]
pub trait ModbusApi: Session {
    /// FC01
    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>>;

    /// FC02
    async fn read_discrete_inputs(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>>;

    /// FC03
    async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>>;

    /// FC04
    async fn read_input_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>>;
}

/// Check quantity and address span of a request against a PDU limit
pub fn validate_range(address: u16, quantity: u16, max: u16) -> Result<()> {
    if quantity == 0 || quantity > max {
        return Err(LinkError::validation(format!(
            "quantity {} outside 1..={}",
            quantity, max
        )));
    }
    let last = u32::from(address) + u32::from(quantity) - 1;
    if last > u32::from(u16::MAX) {
        return Err(LinkError::validation(format!(
            "address range {}+{} exceeds 65535",
            address, quantity
        )));
    }
    Ok(())
}

/// Simulated Modbus client
#[derive(Debug)]
pub struct SimModbusClient {
    link: SimLink,
    unit_id: u8,
    wave: Waveform,
}

impl SimModbusClient {
    pub fn new(device: &Device, endpoint: Endpoint, settings: SimulationSettings) -> Self {
        let wave = Waveform::new(&device.id, settings.jitter);
        Self {
            link: SimLink::new(&device.id, endpoint, settings),
            unit_id: device.params.slave_id.unwrap_or(DEFAULT_UNIT_ID),
            wave,
        }
    }

    async fn bits(&self, address: u16, quantity: u16) -> Result<Vec<bool>> {
        self.link.ensure_open().await?;
        validate_range(address, quantity, MAX_BITS)?;
        Ok((0..quantity)
            .map(|i| self.wave.sample_bit(u32::from(address) + u32::from(i)))
            .collect())
    }

    async fn registers(&self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.link.ensure_open().await?;
        validate_range(address, quantity, MAX_REGISTERS)?;
        Ok((0..quantity)
            .map(|i| {
                let raw = self.wave.sample(u32::from(address) + u32::from(i));
                raw.round().clamp(0.0, f64::from(u16::MAX)) as u16
            })
            .collect())
    }
}

#[async_trait]
impl Session for SimModbusClient {
    fn device_id(&self) -> &str {
        &self.link.device_id
    }

    async fn connect(&mut self) -> Result<()> {
        if self.unit_id == 0 || self.unit_id > MAX_UNIT_ID {
            return Err(LinkError::config(format!(
                "Device {} unit id {} outside 1..={}",
                self.link.device_id, self.unit_id, MAX_UNIT_ID
            )));
        }
        self.link.open("modbus").await?;
        debug!("Dev {} unit id {}", self.link.device_id, self.unit_id);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.link.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_open()
    }
}

#[async_trait]
impl ModbusApi for SimModbusClient {
    async fn read_coils(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>> {
        self.bits(address, quantity).await
    }

    async fn read_discrete_inputs(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>> {
        self.bits(address, quantity).await
    }

    async fn read_holding_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.registers(address, quantity).await
    }

    async fn read_input_registers(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.registers(address, quantity).await
    }
}
