//! Siemens S7-like shim
//!
//! Reads are addressed by memory area, data block number, byte offset and a
//! data type. For [`S7DataType::Bit`] the offset is a bit address
//! (`byte * 8 + bit`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::sim::{SimLink, Waveform};
use super::{Session, SimulationSettings};
use crate::device::{Device, Endpoint};
use crate::error::{LinkError, Result};

pub const MAX_RACK: u16 = 7;
pub const MAX_SLOT: u16 = 31;
/// Largest PDU payload of a single read, in bytes
pub const MAX_READ_BYTES: usize = 462;

/// PLC memory area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum S7Area {
    #[serde(alias = "db")]
    DataBlock,
    /// Flag memory (M)
    #[serde(alias = "m", alias = "flags")]
    Merker,
    /// Process image inputs (I/E)
    #[serde(alias = "i", alias = "pe")]
    Inputs,
    /// Process image outputs (Q/A)
    #[serde(alias = "q", alias = "pa")]
    Outputs,
}

impl fmt::Display for S7Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            S7Area::DataBlock => "DB",
            S7Area::Merker => "M",
            S7Area::Inputs => "I",
            S7Area::Outputs => "Q",
        };
        f.write_str(s)
    }
}

/// Element type of an area read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum S7DataType {
    #[serde(alias = "bool")]
    Bit,
    Byte,
    Word,
    Int,
    #[serde(alias = "dint")]
    DInt,
    #[serde(alias = "float")]
    Real,
}

impl S7DataType {
    /// Element width in bytes; bits are packed and report 1
    pub fn size(self) -> usize {
        match self {
            S7DataType::Bit | S7DataType::Byte => 1,
            S7DataType::Word | S7DataType::Int => 2,
            S7DataType::DInt | S7DataType::Real => 4,
        }
    }
}

/// Decoded S7 value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum S7Value {
    Bit(bool),
    Byte(u8),
    Word(u16),
    Int(i16),
    DInt(i32),
    Real(f32),
}

impl S7Value {
    pub fn as_f64(&self) -> f64 {
        match *self {
            S7Value::Bit(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            },
            S7Value::Byte(v) => f64::from(v),
            S7Value::Word(v) => f64::from(v),
            S7Value::Int(v) => f64::from(v),
            S7Value::DInt(v) => f64::from(v),
            S7Value::Real(v) => f64::from(v),
        }
    }
}

/// Typed S7 read operations
#[async_trait]
pub trait S7Api: Session {
    /// Read `count` elements of `data_type` starting at `start`.
    ///
    /// `db_number` is only meaningful for [`S7Area::DataBlock`] and must be
    /// non-zero there.
    async fn read_area(
        &mut self,
        area: S7Area,
        db_number: u16,
        start: u32,
        data_type: S7DataType,
        count: u16,
    ) -> Result<Vec<S7Value>>;
}

/// Simulated S7 client
#[derive(Debug)]
pub struct SimS7Client {
    link: SimLink,
    rack: u16,
    slot: u16,
    wave: Waveform,
}

impl SimS7Client {
    pub fn new(device: &Device, endpoint: Endpoint, settings: SimulationSettings) -> Self {
        let wave = Waveform::new(&device.id, settings.jitter);
        Self {
            link: SimLink::new(&device.id, endpoint, settings),
            rack: device.params.rack.unwrap_or(0),
            slot: device.params.slot.unwrap_or(1),
            wave,
        }
    }

    fn sample(&self, address: u32, data_type: S7DataType) -> S7Value {
        let raw = self.wave.sample(address);
        match data_type {
            S7DataType::Bit => S7Value::Bit(self.wave.sample_bit(address)),
            S7DataType::Byte => S7Value::Byte(raw.round().clamp(0.0, 255.0) as u8),
            S7DataType::Word => S7Value::Word(raw.round() as u16),
            S7DataType::Int => S7Value::Int(raw.round() as i16),
            S7DataType::DInt => S7Value::DInt(raw.round() as i32),
            S7DataType::Real => S7Value::Real(raw as f32),
        }
    }
}

#[async_trait]
impl Session for SimS7Client {
    fn device_id(&self) -> &str {
        &self.link.device_id
    }

    async fn connect(&mut self) -> Result<()> {
        if self.rack > MAX_RACK || self.slot > MAX_SLOT {
            return Err(LinkError::config(format!(
                "Device {} rack/slot {}/{} outside 0..={}/0..={}",
                self.link.device_id, self.rack, self.slot, MAX_RACK, MAX_SLOT
            )));
        }
        self.link.open("s7").await?;
        debug!(
            "Dev {} rack {} slot {}",
            self.link.device_id, self.rack, self.slot
        );
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
impl S7Api for SimS7Client {
    async fn read_area(
        &mut self,
        area: S7Area,
        db_number: u16,
        start: u32,
        data_type: S7DataType,
        count: u16,
    ) -> Result<Vec<S7Value>> {
        self.link.ensure_open().await?;

        if area == S7Area::DataBlock && db_number == 0 {
            return Err(LinkError::validation("data block reads need a DB number"));
        }
        if count == 0 {
            return Err(LinkError::validation("count must be at least 1"));
        }
        let bytes = match data_type {
            S7DataType::Bit => usize::from(count).div_ceil(8),
            other => usize::from(count) * other.size(),
        };
        if bytes > MAX_READ_BYTES {
            return Err(LinkError::validation(format!(
                "{} bytes exceed the {} byte PDU payload",
                bytes, MAX_READ_BYTES
            )));
        }

        let step = match data_type {
            S7DataType::Bit => 1,
            other => other.size() as u32,
        };
        let values = (0..u32::from(count))
            .map(|i| self.sample(start.saturating_add(i * step), data_type))
            .collect();
        debug!(
            "Dev {} read {}{} @{} x{}",
            self.link.device_id,
            area,
            if area == S7Area::DataBlock {
                db_number.to_string()
            } else {
                String::new()
            },
            start,
            count
        );
        Ok(values)
    }
}
