//! Shared building blocks of the simulated shims
//!
//! `SimLink` carries the session state every simulated client needs, and
//! `Waveform` synthesizes plausible process values: a per-address baseline,
//! a slow sine and a bounded random jitter.

use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Instant;
use tracing::{debug, info};

use super::{open_transport, SimulationSettings};
use crate::device::Endpoint;
use crate::error::{LinkError, Result};

/// Largest jitter amplitude a waveform applies
pub const MAX_JITTER: f64 = 25.0;

/// Session state of a simulated client
#[derive(Debug)]
pub(crate) struct SimLink {
    pub device_id: String,
    pub endpoint: Endpoint,
    pub settings: SimulationSettings,
    connected: bool,
}

impl SimLink {
    pub fn new(device_id: &str, endpoint: Endpoint, settings: SimulationSettings) -> Self {
        Self {
            device_id: device_id.to_string(),
            endpoint,
            settings,
            connected: false,
        }
    }

    /// Open the (simulated) transport. Marks the link connected only on success.
    pub async fn open(&mut self, protocol: &str) -> Result<()> {
        let latency = self.settings.connect_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        open_transport(&self.device_id, &self.endpoint).await?;
        self.connected = true;
        info!(
            "Dev {} {} session open ({})",
            self.device_id, protocol, self.endpoint
        );
        Ok(())
    }

    pub fn close(&mut self) {
        if self.connected {
            debug!("Dev {} session closed", self.device_id);
        }
        self.connected = false;
    }

    pub fn is_open(&self) -> bool {
        self.connected
    }

    /// Gate for read operations
    pub async fn ensure_open(&self) -> Result<()> {
        if !self.connected {
            return Err(LinkError::not_connected(&self.device_id));
        }
        let latency = self.settings.read_latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

/// Value synthesizer for one device
#[derive(Debug, Clone)]
pub(crate) struct Waveform {
    started: Instant,
    seed: f64,
    jitter: f64,
}

impl Waveform {
    /// Non-finite jitter disables noise; finite jitter is capped at [`MAX_JITTER`]
    pub fn new(device_id: &str, jitter: f64) -> Self {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        let jitter = if jitter.is_finite() {
            jitter.abs().min(MAX_JITTER)
        } else {
            0.0
        };
        Self {
            started: Instant::now(),
            seed: (hasher.finish() % 1000) as f64,
            jitter,
        }
    }

    /// Analog sample for an address, always within `[0, 1100)`
    pub fn sample(&self, address: u32) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        let baseline = (f64::from(address) * 37.0 + self.seed) % 1000.0;
        let wave = 25.0 * (elapsed / 30.0 + f64::from(address)).sin();
        let noise = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        (baseline + 50.0 + wave + noise).max(0.0)
    }

    /// Digital sample for an address; toggles with an address-dependent period
    pub fn sample_bit(&self, address: u32) -> bool {
        let period = u64::from(address % 7) + 3;
        (self.started.elapsed().as_secs() / period + u64::from(address)) % 2 == 0
    }
}
