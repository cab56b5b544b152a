//! OPC UA-like shim
//!
//! Variables are addressed by numeric node ids within a namespace.

use async_trait::async_trait;
use std::fmt;

use super::sim::{SimLink, Waveform};
use super::{Session, SimulationSettings};
use crate::device::{Device, Endpoint};
use crate::error::{LinkError, Result};

/// Namespace used when neither the block nor the device names one
pub const DEFAULT_NAMESPACE: u16 = 2;

/// Numeric node id (`ns=2;i=1001`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: u32,
}

impl NodeId {
    pub fn numeric(namespace: u16, identifier: u32) -> Self {
        Self {
            namespace,
            identifier,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns={};i={}", self.namespace, self.identifier)
    }
}

/// Value of a variable node
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Variant {
    Boolean(bool),
    Int32(i32),
    Double(f64),
}

impl Variant {
    pub fn as_f64(&self) -> f64 {
        match *self {
            Variant::Boolean(true) => 1.0,
            Variant::Boolean(false) => 0.0,
            Variant::Int32(v) => f64::from(v),
            Variant::Double(v) => v,
        }
    }
}

/// Typed OPC UA read operations
#[async_trait]
pub trait OpcUaApi: Session {
    /// Read the value attribute of each node, in request order
    async fn read_variables(&mut self, nodes: &[NodeId]) -> Result<Vec<Variant>>;
}

/// Simulated OPC UA client
#[derive(Debug)]
pub struct SimOpcUaClient {
    link: SimLink,
    wave: Waveform,
}

impl SimOpcUaClient {
    pub fn new(device: &Device, endpoint: Endpoint, settings: SimulationSettings) -> Self {
        let wave = Waveform::new(&device.id, settings.jitter);
        Self {
            link: SimLink::new(&device.id, endpoint, settings),
            wave,
        }
    }
}

#[async_trait]
impl Session for SimOpcUaClient {
    fn device_id(&self) -> &str {
        &self.link.device_id
    }

    async fn connect(&mut self) -> Result<()> {
        self.link.open("opcua").await
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
impl OpcUaApi for SimOpcUaClient {
    async fn read_variables(&mut self, nodes: &[NodeId]) -> Result<Vec<Variant>> {
        self.link.ensure_open().await?;
        if nodes.is_empty() {
            return Err(LinkError::validation("no nodes requested"));
        }

        nodes
            .iter()
            .map(|node| {
                // Namespace 0 holds the standard server model, not process data
                if node.namespace == 0 {
                    return Err(LinkError::protocol(format!(
                        "BadNodeIdUnknown: {} is not a process variable",
                        node
                    )));
                }
                let value = self.wave.sample(node.identifier);
                Ok(match node.identifier % 3 {
                    0 => Variant::Double(value),
                    1 => Variant::Int32(value.round() as i32),
                    _ => Variant::Boolean(self.wave.sample_bit(node.identifier)),
                })
            })
            .collect()
    }
}
