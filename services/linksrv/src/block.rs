//! Read request descriptors and read results
//!
//! A `ReadBlock` asks for one data point. The connector turns each block into
//! a typed read on the owning device's shim and stores the first returned
//! value under `"{device_id}.{address}"`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::protocols::s7::{S7Area, S7DataType};

/// Register or area kind requested by a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Modbus coils (discrete outputs)
    #[serde(alias = "coils")]
    Coil,
    /// Modbus discrete inputs
    #[serde(alias = "discrete_input", alias = "discrete_inputs")]
    Discrete,
    /// Modbus holding registers
    #[serde(alias = "holding_register", alias = "holding_registers")]
    Holding,
    /// Modbus input registers
    #[serde(alias = "input_register", alias = "input_registers")]
    Input,
    /// S7 typed area read (area + db number + offset + data type)
    Area,
    /// OPC UA variable read by numeric node id
    #[serde(alias = "node")]
    Variable,
}

impl BlockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockKind::Coil => "coil",
            BlockKind::Discrete => "discrete",
            BlockKind::Holding => "holding",
            BlockKind::Input => "input",
            BlockKind::Area => "area",
            BlockKind::Variable => "variable",
        }
    }
}

fn default_quantity() -> u16 {
    1
}

/// A request to read one data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadBlock {
    #[serde(alias = "device_id")]
    pub device_id: String,
    /// Starting address: register address, S7 byte offset, or OPC UA numeric node id
    pub address: u32,
    #[serde(default = "default_quantity")]
    pub quantity: u16,
    #[serde(rename = "type", alias = "kind")]
    pub kind: BlockKind,

    // S7-only fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<S7Area>,
    #[serde(default, alias = "db_number", skip_serializing_if = "Option::is_none")]
    pub db_number: Option<u16>,
    #[serde(default, alias = "data_type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<S7DataType>,

    // OPC UA-only fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<u16>,
}

impl ReadBlock {
    /// Single-value block without protocol extras
    pub fn new(device_id: impl Into<String>, address: u32, kind: BlockKind) -> Self {
        Self {
            device_id: device_id.into(),
            address,
            quantity: 1,
            kind,
            area: None,
            db_number: None,
            data_type: None,
            namespace: None,
        }
    }

    /// S7 data block read
    pub fn s7_db(
        device_id: impl Into<String>,
        db_number: u16,
        offset: u32,
        data_type: S7DataType,
    ) -> Self {
        Self {
            area: Some(S7Area::DataBlock),
            db_number: Some(db_number),
            data_type: Some(data_type),
            ..Self::new(device_id, offset, BlockKind::Area)
        }
    }

    pub fn with_quantity(mut self, quantity: u16) -> Self {
        self.quantity = quantity;
        self
    }

    /// Result-map key for this block
    pub fn key(&self) -> String {
        point_key(&self.device_id, self.address)
    }
}

/// Result-map key: `"{device_id}.{address}"`
pub fn point_key(device_id: &str, address: u32) -> String {
    format!("{}.{}", device_id, address)
}

/// Values produced by one `read_data` call, keyed by [`point_key`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReadResult(BTreeMap<String, f64>);

impl ReadResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, key: String, value: f64) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}
