//! Connector: one client per device, isolated connect and read
//!
//! The connector owns a client per device (chosen by the device's protocol)
//! and a per-device [`LinkState`]. A failure in one device or one read block
//! is logged, recorded in that device's health and never affects the others.
//!
//! ```text
//! Unconnected ──connect()──► Connecting ──ok──► Connected
//!      ▲                          │
//!      │                          └──err/timeout──► Failed
//!      └──────────── disconnect() ◄──────────────────┘
//! ```

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::block::{BlockKind, ReadBlock, ReadResult};
use crate::device::{Device, Protocol};
use crate::error::{LinkError, Result};
use crate::protocols::opcua::DEFAULT_NAMESPACE;
use crate::protocols::{ClientFactory, NodeId, ProtocolClient, S7Area, S7DataType};

/// Device id → connected flag. Always a copy; mutating it has no effect on
/// the connector.
pub type ConnectionStatus = HashMap<String, bool>;

/// Per-device connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Unconnected,
    Connecting,
    Connected,
    Failed,
}

/// Health snapshot of one device, for status displays
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceHealth {
    pub device_id: String,
    pub protocol: Protocol,
    pub state: LinkState,
    pub last_error: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl DeviceHealth {
    fn new(device: &Device) -> Self {
        Self {
            device_id: device.id.clone(),
            protocol: device.protocol,
            state: LinkState::Unconnected,
            last_error: None,
            changed_at: Utc::now(),
        }
    }

    fn transition(&mut self, state: LinkState) {
        if self.state != state {
            self.state = state;
            self.changed_at = Utc::now();
        }
    }
}

/// How `connect()` walks the device list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    /// One device at a time, in registry order
    #[default]
    Sequential,
    /// All devices at once
    Concurrent,
}

/// Connector tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorOptions {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub connect_mode: ConnectMode,
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    3000
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            connect_mode: ConnectMode::default(),
        }
    }
}

impl ConnectorOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Multiplexes reads over a fixed set of devices
pub struct Connector {
    devices: Vec<Device>,
    factory: Arc<dyn ClientFactory>,
    options: ConnectorOptions,
    clients: HashMap<String, ProtocolClient>,
    health: HashMap<String, DeviceHealth>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("devices", &self.devices.len())
            .field("clients", &self.clients.len())
            .field("options", &self.options)
            .finish()
    }
}

impl Connector {
    /// Build a connector for a device list.
    ///
    /// Duplicate ids keep their first occurrence. Every remaining device
    /// starts `Unconnected`.
    pub fn new(
        devices: Vec<Device>,
        factory: Arc<dyn ClientFactory>,
        options: ConnectorOptions,
    ) -> Self {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(devices.len());
        for device in devices {
            if seen.insert(device.id.clone()) {
                unique.push(device);
            } else {
                warn!("Dev {} duplicate id ignored", device.id);
            }
        }

        let health = unique
            .iter()
            .map(|d| (d.id.clone(), DeviceHealth::new(d)))
            .collect();

        Self {
            devices: unique,
            factory,
            options,
            clients: HashMap::new(),
            health,
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Connect every device that is not already live.
    ///
    /// Devices without a usable address, with a failing shim or with a shim
    /// that exceeds the connect timeout end up `Failed`; the rest of the list
    /// is unaffected.
    pub async fn connect(&mut self) {
        let pending: Vec<Device> = self
            .devices
            .iter()
            .filter(|d| !self.is_live(&d.id))
            .cloned()
            .collect();

        if pending.is_empty() {
            debug!("All {} devices already connected", self.devices.len());
            return;
        }

        for device in &pending {
            if let Some(mut stale) = self.clients.remove(&device.id) {
                let closed =
                    tokio::time::timeout(self.options.connect_timeout(), stale.disconnect()).await;
                if !matches!(closed, Ok(Ok(()))) {
                    debug!("Dev {} stale client did not close cleanly", device.id);
                }
            }
            self.set_state(&device.id, LinkState::Connecting);
        }

        let timeout = self.options.connect_timeout();
        match self.options.connect_mode {
            ConnectMode::Sequential => {
                for device in &pending {
                    let outcome = open_client(self.factory.as_ref(), device, timeout).await;
                    self.record_connect(device, outcome);
                }
            },
            ConnectMode::Concurrent => {
                let factory = Arc::clone(&self.factory);
                let outcomes = join_all(
                    pending
                        .iter()
                        .map(|device| open_client(factory.as_ref(), device, timeout)),
                )
                .await;
                for (device, outcome) in pending.iter().zip(outcomes) {
                    self.record_connect(device, outcome);
                }
            },
        }

        let connected = self
            .health
            .values()
            .filter(|h| h.state == LinkState::Connected)
            .count();
        info!("Connected {}/{} devices", connected, self.devices.len());
    }

    /// Read every block; blocks that cannot be served yield no entry.
    pub async fn read_data(&mut self, blocks: &[ReadBlock]) -> ReadResult {
        let mut result = ReadResult::new();
        let timeout = self.options.read_timeout();

        for block in blocks {
            if !self.is_connected(&block.device_id) {
                debug!("Dev {} not connected, skip {}", block.device_id, block.key());
                continue;
            }
            let namespace = self.device_namespace(&block.device_id);
            let Some(client) = self.clients.get_mut(&block.device_id) else {
                continue;
            };

            match read_block(client, block, namespace, timeout).await {
                Ok(value) => result.insert(block.key(), value),
                Err(e) => {
                    warn!("Dev {} read {} failed: {}", block.device_id, block.key(), e);
                    if let Some(health) = self.health.get_mut(&block.device_id) {
                        health.last_error = Some(e.to_string());
                    }
                },
            }
        }

        result
    }

    /// Close every client and reset every device to `Unconnected`. Idempotent.
    pub async fn disconnect(&mut self) {
        let timeout = self.options.connect_timeout();
        for device in &self.devices {
            let Some(mut client) = self.clients.remove(&device.id) else {
                continue;
            };
            match tokio::time::timeout(timeout, client.disconnect()).await {
                Ok(Ok(())) => debug!("Dev {} disconnected", device.id),
                Ok(Err(e)) => warn!("Dev {} disconnect error: {}", device.id, e),
                Err(_) => warn!("Dev {} disconnect timed out", device.id),
            }
        }

        for health in self.health.values_mut() {
            health.transition(LinkState::Unconnected);
        }
    }

    /// Copy of the per-device connected flags
    pub fn get_connection_status(&self) -> ConnectionStatus {
        self.health
            .iter()
            .map(|(id, h)| (id.clone(), h.state == LinkState::Connected))
            .collect()
    }

    /// Health of every device, in registry order
    pub fn device_health(&self) -> Vec<DeviceHealth> {
        self.devices
            .iter()
            .filter_map(|d| self.health.get(&d.id).cloned())
            .collect()
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.health
            .get(device_id)
            .is_some_and(|h| h.state == LinkState::Connected)
    }

    /// Ids of devices whose status is false
    pub fn disconnected_devices(&self) -> Vec<String> {
        self.devices
            .iter()
            .filter(|d| !self.is_connected(&d.id))
            .map(|d| d.id.clone())
            .collect()
    }

    fn is_live(&self, device_id: &str) -> bool {
        self.is_connected(device_id)
            && self
                .clients
                .get(device_id)
                .is_some_and(ProtocolClient::is_connected)
    }

    fn set_state(&mut self, device_id: &str, state: LinkState) {
        if let Some(health) = self.health.get_mut(device_id) {
            health.transition(state);
        }
    }

    fn record_connect(&mut self, device: &Device, outcome: Result<ProtocolClient>) {
        match outcome {
            Ok(client) => {
                self.clients.insert(device.id.clone(), client);
                if let Some(health) = self.health.get_mut(&device.id) {
                    health.transition(LinkState::Connected);
                    health.last_error = None;
                }
            },
            Err(e) => {
                warn!("Dev {} ({}) connect failed: {}", device.id, device.protocol, e);
                if let Some(health) = self.health.get_mut(&device.id) {
                    health.transition(LinkState::Failed);
                    health.last_error = Some(e.to_string());
                }
            },
        }
    }

    fn device_namespace(&self, device_id: &str) -> Option<u16> {
        self.devices
            .iter()
            .find(|d| d.id == device_id)
            .and_then(|d| d.params.namespace)
    }
}

/// Resolve, build and connect the client for one device
async fn open_client(
    factory: &dyn ClientFactory,
    device: &Device,
    timeout: Duration,
) -> Result<ProtocolClient> {
    let endpoint = device.endpoint()?;
    let mut client = factory.create(device, &endpoint)?;

    match tokio::time::timeout(timeout, client.connect()).await {
        Ok(Ok(())) => Ok(client),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(LinkError::timeout(format!(
            "Device {} connect to {} exceeded {}ms",
            device.id,
            endpoint,
            timeout.as_millis()
        ))),
    }
}

/// Dispatch one block to the typed read of its client and take the first value
async fn read_block(
    client: &mut ProtocolClient,
    block: &ReadBlock,
    device_namespace: Option<u16>,
    timeout: Duration,
) -> Result<f64> {
    if block.quantity == 0 {
        return Err(LinkError::validation("quantity must be at least 1"));
    }

    tokio::time::timeout(timeout, dispatch(client, block, device_namespace))
        .await
        .map_err(|_| {
            LinkError::timeout(format!(
                "Device {} read {} exceeded {}ms",
                block.device_id,
                block.key(),
                timeout.as_millis()
            ))
        })?
}

/// Typed read for one block on its device's client
async fn dispatch(
    client: &mut ProtocolClient,
    block: &ReadBlock,
    device_namespace: Option<u16>,
) -> Result<f64> {
    let protocol = client.protocol();
    match client {
        ProtocolClient::Modbus(c) => {
            let address = u16::try_from(block.address).map_err(|_| {
                LinkError::validation(format!(
                    "Modbus address {} exceeds 65535",
                    block.address
                ))
            })?;
            match block.kind {
                BlockKind::Coil => first_bit(c.read_coils(address, block.quantity).await?),
                BlockKind::Discrete => {
                    first_bit(c.read_discrete_inputs(address, block.quantity).await?)
                },
                BlockKind::Holding => {
                    first_register(c.read_holding_registers(address, block.quantity).await?)
                },
                BlockKind::Input => {
                    first_register(c.read_input_registers(address, block.quantity).await?)
                },
                other => Err(unsupported(other, protocol)),
            }
        },
        ProtocolClient::S7(c) => {
            if block.kind != BlockKind::Area {
                return Err(unsupported(block.kind, protocol));
            }
            let values = c
                .read_area(
                    block.area.unwrap_or(S7Area::DataBlock),
                    block.db_number.unwrap_or(0),
                    block.address,
                    block.data_type.unwrap_or(S7DataType::Int),
                    block.quantity,
                )
                .await?;
            values
                .first()
                .map(|v| v.as_f64())
                .ok_or_else(|| empty_response(block))
        },
        ProtocolClient::OpcUa(c) => {
            if block.kind != BlockKind::Variable {
                return Err(unsupported(block.kind, protocol));
            }
            let namespace = block
                .namespace
                .or(device_namespace)
                .unwrap_or(DEFAULT_NAMESPACE);
            // Only the first value is kept, so only the first node is requested
            let node = NodeId::numeric(namespace, block.address);
            let values = c.read_variables(&[node]).await?;
            values
                .first()
                .map(|v| v.as_f64())
                .ok_or_else(|| empty_response(block))
        },
    }
}

fn first_bit(values: Vec<bool>) -> Result<f64> {
    values
        .first()
        .map(|&b| if b { 1.0 } else { 0.0 })
        .ok_or_else(|| LinkError::protocol("empty bit response"))
}

fn first_register(values: Vec<u16>) -> Result<f64> {
    values
        .first()
        .map(|&v| f64::from(v))
        .ok_or_else(|| LinkError::protocol("empty register response"))
}

fn empty_response(block: &ReadBlock) -> LinkError {
    LinkError::protocol(format!("empty response for {}", block.key()))
}

fn unsupported(kind: BlockKind, protocol: Protocol) -> LinkError {
    LinkError::validation(format!(
        "block kind '{}' is not served by {} devices",
        kind.as_str(),
        protocol
    ))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocols::{SimulatedClientFactory, SimulationSettings, Variant};
    use tracing_test::traced_test;

    fn connector(devices: Vec<Device>) -> Connector {
        Connector::new(
            devices,
            Arc::new(SimulatedClientFactory::default()),
            ConnectorOptions::default(),
        )
    }

    fn mixed_devices() -> Vec<Device> {
        let mut s7 = Device::new("s7-a", Protocol::S7, Some("127.0.0.1"));
        s7.params.rack = Some(0);
        s7.params.slot = Some(1);
        let mut ua = Device::new("ua-a", Protocol::OpcUa, Some("opc.tcp://127.0.0.1:4840"));
        ua.params.namespace = Some(3);
        vec![
            Device::new("mb-a", Protocol::Modbus, Some("127.0.0.1:502")),
            s7,
            ua,
        ]
    }

    #[tokio::test]
    async fn test_status_starts_false_for_every_device() {
        let connector = connector(mixed_devices());
        let status = connector.get_connection_status();
        assert_eq!(status.len(), 3);
        assert!(status.values().all(|connected| !connected));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_address_is_isolated() {
        let mut devices = mixed_devices();
        devices.insert(1, Device::new("noaddr", Protocol::Modbus, None));
        let mut connector = connector(devices);

        connector.connect().await;

        let status = connector.get_connection_status();
        assert!(!status["noaddr"]);
        assert!(status["mb-a"]);
        assert!(status["s7-a"]);
        assert!(status["ua-a"]);
        assert!(logs_contain("noaddr"));

        let health = connector.device_health();
        assert_eq!(health[1].state, LinkState::Failed);
        assert!(health[1].last_error.as_deref().unwrap().contains("no address"));
    }

    #[tokio::test]
    async fn test_reads_dispatch_per_protocol() {
        let mut connector = connector(mixed_devices());
        connector.connect().await;

        let blocks = vec![
            ReadBlock::new("mb-a", 0, BlockKind::Holding),
            ReadBlock::new("mb-a", 5, BlockKind::Coil),
            ReadBlock::s7_db("s7-a", 1, 8, S7DataType::Real),
            ReadBlock::new("ua-a", 1001, BlockKind::Variable),
        ];
        let result = connector.read_data(&blocks).await;

        assert_eq!(result.len(), 4);
        for key in ["mb-a.0", "mb-a.5", "s7-a.8", "ua-a.1001"] {
            assert!(result.contains_key(key), "missing {}", key);
        }
        let coil = result.get("mb-a.5").unwrap();
        assert!(coil == 0.0 || coil == 1.0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_invalid_blocks_are_isolated() {
        let mut connector = connector(mixed_devices());
        connector.connect().await;

        let blocks = vec![
            ReadBlock::new("mb-a", 0, BlockKind::Holding).with_quantity(0),
            ReadBlock::new("mb-a", 70_000, BlockKind::Holding),
            ReadBlock::new("mb-a", 1, BlockKind::Variable),
            ReadBlock::new("s7-a", 0, BlockKind::Area), // DB without number
            ReadBlock::new("unknown", 0, BlockKind::Holding),
            ReadBlock::new("mb-a", 2, BlockKind::Input),
        ];
        let result = connector.read_data(&blocks).await;

        assert_eq!(result.keys().collect::<Vec<_>>(), vec!["mb-a.2"]);
        assert!(logs_contain("not served by modbus"));
        let health = connector.device_health();
        assert!(health[1].last_error.is_some());
    }

    #[tokio::test]
    async fn test_unusable_jitter_keeps_blocks_isolated() {
        let settings = SimulationSettings {
            jitter: f64::INFINITY,
            ..SimulationSettings::default()
        };
        let mut connector = Connector::new(
            vec![
                Device::new("mb-a", Protocol::Modbus, Some("127.0.0.1")),
                Device::new("mb-b", Protocol::Modbus, Some("127.0.0.1")),
            ],
            Arc::new(SimulatedClientFactory::new(settings)),
            ConnectorOptions::default(),
        );
        connector.connect().await;

        let result = connector
            .read_data(&[
                ReadBlock::new("mb-a", 0, BlockKind::Holding),
                ReadBlock::new("mb-b", 0, BlockKind::Holding),
            ])
            .await;
        assert_eq!(result.len(), 2);
    }

    /// OPC UA client that records the node ids it is asked for
    struct RecordingOpcUa {
        connected: bool,
        requests: Arc<std::sync::Mutex<Vec<Vec<NodeId>>>>,
    }

    #[async_trait::async_trait]
    impl crate::protocols::Session for RecordingOpcUa {
        fn device_id(&self) -> &str {
            "ua"
        }

        async fn connect(&mut self) -> Result<()> {
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[async_trait::async_trait]
    impl crate::protocols::OpcUaApi for RecordingOpcUa {
        async fn read_variables(&mut self, nodes: &[NodeId]) -> Result<Vec<Variant>> {
            self.requests.lock().unwrap().push(nodes.to_vec());
            Ok(nodes
                .iter()
                .map(|n| Variant::Int32(i32::from(n.namespace)))
                .collect())
        }
    }

    struct RecordingFactory {
        requests: Arc<std::sync::Mutex<Vec<Vec<NodeId>>>>,
    }

    impl ClientFactory for RecordingFactory {
        fn create(
            &self,
            _device: &Device,
            _endpoint: &crate::device::Endpoint,
        ) -> Result<ProtocolClient> {
            Ok(ProtocolClient::OpcUa(Box::new(RecordingOpcUa {
                connected: false,
                requests: Arc::clone(&self.requests),
            })))
        }
    }

    #[tokio::test]
    async fn test_opcua_namespace_precedence() {
        let requests = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut with_ns =
            Device::new("ua-ns", Protocol::OpcUa, Some("opc.tcp://10.0.0.5:4840"));
        with_ns.params.namespace = Some(4);
        let plain = Device::new("ua-plain", Protocol::OpcUa, Some("opc.tcp://10.0.0.6:4840"));
        let mut connector = Connector::new(
            vec![with_ns, plain],
            Arc::new(RecordingFactory {
                requests: Arc::clone(&requests),
            }),
            ConnectorOptions::default(),
        );
        connector.connect().await;

        let mut block_ns = ReadBlock::new("ua-ns", 10, BlockKind::Variable);
        block_ns.namespace = Some(7);
        let blocks = vec![
            block_ns,
            ReadBlock::new("ua-ns", 11, BlockKind::Variable),
            ReadBlock::new("ua-plain", 12, BlockKind::Variable).with_quantity(500),
        ];
        let result = connector.read_data(&blocks).await;

        assert_eq!(
            *requests.lock().unwrap(),
            vec![
                vec![NodeId::numeric(7, 10)],
                vec![NodeId::numeric(4, 11)],
                vec![NodeId::numeric(DEFAULT_NAMESPACE, 12)],
            ]
        );
        assert_eq!(result.get("ua-ns.10"), Some(7.0));
        assert_eq!(result.get("ua-ns.11"), Some(4.0));
        assert_eq!(result.get("ua-plain.12"), Some(2.0));
    }

    #[tokio::test]
    async fn test_reads_before_connect_yield_nothing() {
        let mut connector = connector(mixed_devices());
        let result = connector
            .read_data(&[ReadBlock::new("mb-a", 0, BlockKind::Holding)])
            .await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut connector = connector(mixed_devices());
        connector.connect().await;
        connector.disconnect().await;
        let first = connector.get_connection_status();
        connector.disconnect().await;
        assert_eq!(first, connector.get_connection_status());
        assert!(first.values().all(|c| !c));
        assert!(connector
            .device_health()
            .iter()
            .all(|h| h.state == LinkState::Unconnected));
    }

    #[tokio::test]
    async fn test_status_is_a_copy() {
        let mut connector = connector(mixed_devices());
        let mut status = connector.get_connection_status();
        status.insert("mb-a".into(), true);
        status.insert("ghost".into(), true);
        assert!(!connector.get_connection_status()["mb-a"]);
        assert!(!connector.get_connection_status().contains_key("ghost"));

        connector.connect().await;
        assert_eq!(connector.get_connection_status().len(), 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_duplicate_ids_keep_first() {
        let devices = vec![
            Device::new("dup", Protocol::Modbus, Some("127.0.0.1")),
            Device::new("dup", Protocol::S7, Some("127.0.0.2")),
        ];
        let connector = connector(devices);
        assert_eq!(connector.devices().len(), 1);
        assert_eq!(connector.devices()[0].protocol, Protocol::Modbus);
        assert!(logs_contain("duplicate id ignored"));
    }

    #[tokio::test]
    async fn test_disconnected_devices_listing() {
        let devices = vec![
            Device::new("ok", Protocol::Modbus, Some("127.0.0.1")),
            Device::new("bad", Protocol::Modbus, Some("")),
        ];
        let mut connector = connector(devices);
        connector.connect().await;
        assert_eq!(connector.disconnected_devices(), vec!["bad".to_string()]);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: ConnectorOptions =
            serde_yaml::from_str("connect_mode: concurrent\nread_timeout_ms: 250\n").unwrap();
        assert_eq!(options.connect_mode, ConnectMode::Concurrent);
        assert_eq!(options.read_timeout(), Duration::from_millis(250));
        assert_eq!(options.connect_timeout(), Duration::from_secs(5));
    }
}
