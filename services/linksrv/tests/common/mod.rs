//! Test Common Utilities
//!
//! Scripted protocol clients and a factory that hands them out per device id.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use linksrv::device::{Device, Endpoint, Protocol};
use linksrv::error::{LinkError, Result};
use linksrv::protocols::{ClientFactory, ModbusApi, ProtocolClient, Session};

/// How a scripted device behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Healthy,
    FailConnect,
    HangConnect,
    FailRead,
    HangRead,
    PanicRead,
}

/// Shared call counters
#[derive(Debug, Default)]
pub struct Calls {
    pub creates: Mutex<Vec<String>>,
    pub disconnects: AtomicUsize,
    pub reads: AtomicUsize,
}

impl Calls {
    pub fn creates_for(&self, device_id: &str) -> usize {
        self.creates
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == device_id)
            .count()
    }
}

/// Modbus client whose behavior is scripted by the test
pub struct ScriptedModbus {
    device_id: String,
    behavior: Behavior,
    value: u16,
    connected: bool,
    calls: Arc<Calls>,
}

#[async_trait]
impl Session for ScriptedModbus {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn connect(&mut self) -> Result<()> {
        match self.behavior {
            Behavior::FailConnect => Err(LinkError::connection(format!(
                "{} refused connection",
                self.device_id
            ))),
            Behavior::HangConnect => {
                std::future::pending::<()>().await;
                Ok(())
            },
            _ => {
                self.connected = true;
                Ok(())
            },
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.calls.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl ScriptedModbus {
    async fn registers(&mut self, quantity: u16) -> Result<Vec<u16>> {
        self.calls.reads.fetch_add(1, Ordering::SeqCst);
        if !self.connected {
            return Err(LinkError::not_connected(&self.device_id));
        }
        match self.behavior {
            Behavior::FailRead => Err(LinkError::io(format!("{} read failed", self.device_id))),
            Behavior::HangRead => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(vec![])
            },
            Behavior::PanicRead => panic!("scripted panic in {}", self.device_id),
            _ => Ok(vec![self.value; usize::from(quantity)]),
        }
    }
}

#[async_trait]
impl ModbusApi for ScriptedModbus {
    async fn read_coils(&mut self, _address: u16, quantity: u16) -> Result<Vec<bool>> {
        Ok(self
            .registers(quantity)
            .await?
            .into_iter()
            .map(|v| v != 0)
            .collect())
    }

    async fn read_discrete_inputs(&mut self, address: u16, quantity: u16) -> Result<Vec<bool>> {
        self.read_coils(address, quantity).await
    }

    async fn read_holding_registers(&mut self, _address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.registers(quantity).await
    }

    async fn read_input_registers(&mut self, _address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.registers(quantity).await
    }
}

/// Factory handing out [`ScriptedModbus`] clients
#[derive(Default)]
pub struct ScriptedFactory {
    behaviors: HashMap<String, Behavior>,
    values: HashMap<String, u16>,
    pub calls: Arc<Calls>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, device_id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(device_id.to_string(), behavior);
        self
    }

    pub fn value(mut self, device_id: &str, value: u16) -> Self {
        self.values.insert(device_id.to_string(), value);
        self
    }
}

impl ClientFactory for ScriptedFactory {
    fn create(&self, device: &Device, _endpoint: &Endpoint) -> Result<ProtocolClient> {
        self.calls.creates.lock().unwrap().push(device.id.clone());
        Ok(ProtocolClient::Modbus(Box::new(ScriptedModbus {
            device_id: device.id.clone(),
            behavior: self.behaviors.get(&device.id).copied().unwrap_or_default(),
            value: self.values.get(&device.id).copied().unwrap_or(42),
            connected: false,
            calls: Arc::clone(&self.calls),
        })))
    }
}

pub fn modbus(id: &str, address: Option<&str>) -> Device {
    Device::new(id, Protocol::Modbus, address)
}
