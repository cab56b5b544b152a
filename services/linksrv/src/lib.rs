//! PLC Device Link Service (linksrv)
//!
//! Multi-protocol device connector for Modbus, S7 and OPC UA controllers.
//!
//! ```text
//! DeviceRegistry ──► Connector ──► ProtocolClient (per device)
//!                        ▲
//!                 PollingDriver ──► TelemetrySink
//! ```
//!
//! - [`connector::Connector`] owns one client per device and isolates
//!   connect/read failures per device and per block.
//! - [`polling::PollingDriver`] reads a fixed block list on an interval and
//!   stores every result.
//! - [`registry`] supplies devices from memory, a file or SQLite.

pub mod block;
pub mod bootstrap;
pub mod config;
pub mod connector;
pub mod device;
pub mod error;
pub mod events;
pub mod polling;
pub mod protocols;
pub mod registry;
pub mod storage;

pub use block::{point_key, BlockKind, ReadBlock, ReadResult};
pub use config::AppConfig;
pub use connector::{
    ConnectMode, ConnectionStatus, Connector, ConnectorOptions, DeviceHealth, LinkState,
};
pub use device::{Device, DeviceParams, Endpoint, Protocol};
pub use error::{LinkError, Result};
pub use events::DeviceChange;
pub use polling::{PollEvent, PollStats, PollingConfig, PollingDriver, PollingHandle};
pub use protocols::{ClientFactory, ProtocolClient, SimulatedClientFactory, SimulationSettings};
pub use registry::{DeviceRegistry, FileRegistry, MemoryRegistry, RegistrySource, SqliteRegistry};
pub use storage::{
    JsonlSink, MemorySink, StorageConfig, TelemetryBatch, TelemetryRow, TelemetrySink,
};
