//! Protocol client shims
//!
//! Every protocol family exposes the same session lifecycle ([`Session`]) and
//! its own addressing vocabulary ([`ModbusApi`], [`S7Api`], [`OpcUaApi`]).
//! The connector holds clients as the closed [`ProtocolClient`] sum type and
//! normalizes across protocols only at its dispatch boundary.
//!
//! ```text
//! ┌──────────────┐   create()   ┌──────────────────┐
//! │ClientFactory │─────────────►│ ProtocolClient   │
//! └──────────────┘              │  Modbus │ S7 │ UA│
//!                               └──────────────────┘
//! ```

pub mod modbus;
pub mod opcua;
pub mod s7;
pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::device::{Device, Endpoint, Protocol};
use crate::error::Result;

pub use modbus::{ModbusApi, SimModbusClient};
pub use opcua::{NodeId, OpcUaApi, SimOpcUaClient, Variant};
pub use s7::{S7Api, S7Area, S7DataType, S7Value, SimS7Client};

/// Session lifecycle shared by every protocol shim
#[async_trait]
pub trait Session: Send + Sync {
    /// Device id this session belongs to
    fn device_id(&self) -> &str;

    /// Establish a logical session.
    ///
    /// Fails with `ConnectionError` when the transport cannot be opened; the
    /// session is marked connected only on success.
    async fn connect(&mut self) -> Result<()>;

    /// Tear the session down. Idempotent.
    async fn disconnect(&mut self) -> Result<()>;

    /// Pure status read
    fn is_connected(&self) -> bool;
}

/// One client per device, typed by protocol family
pub enum ProtocolClient {
    Modbus(Box<dyn ModbusApi>),
    S7(Box<dyn S7Api>),
    OpcUa(Box<dyn OpcUaApi>),
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("protocol", &self.protocol())
            .field("device_id", &self.device_id())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ProtocolClient {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolClient::Modbus(_) => Protocol::Modbus,
            ProtocolClient::S7(_) => Protocol::S7,
            ProtocolClient::OpcUa(_) => Protocol::OpcUa,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            ProtocolClient::Modbus(c) => c.device_id(),
            ProtocolClient::S7(c) => c.device_id(),
            ProtocolClient::OpcUa(c) => c.device_id(),
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        match self {
            ProtocolClient::Modbus(c) => c.connect().await,
            ProtocolClient::S7(c) => c.connect().await,
            ProtocolClient::OpcUa(c) => c.connect().await,
        }
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        match self {
            ProtocolClient::Modbus(c) => c.disconnect().await,
            ProtocolClient::S7(c) => c.disconnect().await,
            ProtocolClient::OpcUa(c) => c.disconnect().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            ProtocolClient::Modbus(c) => c.is_connected(),
            ProtocolClient::S7(c) => c.is_connected(),
            ProtocolClient::OpcUa(c) => c.is_connected(),
        }
    }
}

/// Builds the shim for a device
///
/// Injected into the connector so tests and alternative transports can supply
/// their own clients.
pub trait ClientFactory: Send + Sync {
    fn create(&self, device: &Device, endpoint: &Endpoint) -> Result<ProtocolClient>;
}

/// Tuning knobs for the simulated shims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Maximum absolute random jitter added to analog samples
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Artificial latency of `connect()`
    #[serde(default)]
    pub connect_latency_ms: u64,
    /// Artificial latency of each read
    #[serde(default)]
    pub read_latency_ms: u64,
}

fn default_jitter() -> f64 {
    0.5
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            jitter: default_jitter(),
            connect_latency_ms: 0,
            read_latency_ms: 0,
        }
    }
}

impl SimulationSettings {
    pub(crate) fn connect_latency(&self) -> Duration {
        Duration::from_millis(self.connect_latency_ms)
    }

    pub(crate) fn read_latency(&self) -> Duration {
        Duration::from_millis(self.read_latency_ms)
    }
}

/// Factory producing the simulated shims
#[derive(Debug, Clone, Default)]
pub struct SimulatedClientFactory {
    settings: SimulationSettings,
}

impl SimulatedClientFactory {
    pub fn new(settings: SimulationSettings) -> Self {
        Self { settings }
    }
}

impl ClientFactory for SimulatedClientFactory {
    fn create(&self, device: &Device, endpoint: &Endpoint) -> Result<ProtocolClient> {
        let client = match device.protocol {
            Protocol::Modbus => ProtocolClient::Modbus(Box::new(SimModbusClient::new(
                device,
                endpoint.clone(),
                self.settings.clone(),
            ))),
            Protocol::S7 => ProtocolClient::S7(Box::new(SimS7Client::new(
                device,
                endpoint.clone(),
                self.settings.clone(),
            ))),
            Protocol::OpcUa => ProtocolClient::OpcUa(Box::new(SimOpcUaClient::new(
                device,
                endpoint.clone(),
                self.settings.clone(),
            ))),
        };
        Ok(client)
    }
}

/// Resolve the endpoint through the async resolver.
///
/// IP literals resolve locally; hostnames go through the system resolver.
pub(crate) async fn open_transport(device_id: &str, endpoint: &Endpoint) -> Result<()> {
    use crate::error::LinkError;

    let mut addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| {
            LinkError::connection(format!(
                "Device {} cannot resolve {}: {}",
                device_id, endpoint, e
            ))
        })?;

    match addrs.next() {
        Some(addr) => {
            tracing::debug!("Dev {} transport resolved to {}", device_id, addr);
            Ok(())
        },
        None => Err(LinkError::connection(format!(
            "Device {} endpoint {} resolved to no addresses",
            device_id, endpoint
        ))),
    }
}
