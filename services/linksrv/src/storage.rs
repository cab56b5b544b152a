//! Telemetry storage collaborators
//!
//! The polling driver turns each [`ReadResult`] into a [`TelemetryBatch`] and
//! hands it to a [`TelemetrySink`]. Sinks decide how rows are persisted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::block::{BlockKind, ReadBlock, ReadResult};
use crate::error::{ErrorExt, Result};

/// One stored data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRow {
    pub device_id: String,
    pub address: u32,
    pub kind: BlockKind,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Rows produced by one poll cycle, sharing a timestamp
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryBatch {
    pub rows: Vec<TelemetryRow>,
}

impl TelemetryBatch {
    /// Rows for every block that produced a value, in block order
    pub fn from_result(result: &ReadResult, blocks: &[ReadBlock]) -> Self {
        Self::from_result_at(result, blocks, Utc::now())
    }

    pub fn from_result_at(
        result: &ReadResult,
        blocks: &[ReadBlock],
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let mut emitted = std::collections::HashSet::new();
        let rows = blocks
            .iter()
            .filter_map(|block| {
                let key = block.key();
                let value = result.get(&key)?;
                emitted.insert(key).then(|| TelemetryRow {
                    device_id: block.device_id.clone(),
                    address: block.address,
                    kind: block.kind,
                    value,
                    recorded_at,
                })
            })
            .collect();
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Destination for telemetry rows
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn store(&self, batch: &TelemetryBatch) -> Result<()>;
}

/// In-process sink keeping the latest value per point and a bounded history
#[derive(Debug)]
pub struct MemorySink {
    capacity: usize,
    history: RwLock<VecDeque<TelemetryRow>>,
    latest: RwLock<HashMap<String, TelemetryRow>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            history: RwLock::new(VecDeque::new()),
            latest: RwLock::new(HashMap::new()),
        }
    }

    /// Most recent row of a point (`"{device_id}.{address}"`)
    pub async fn latest(&self, key: &str) -> Option<TelemetryRow> {
        self.latest.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.history.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.history.read().await.is_empty()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn store(&self, batch: &TelemetryBatch) -> Result<()> {
        {
            let mut latest = self.latest.write().await;
            for row in &batch.rows {
                latest.insert(
                    crate::block::point_key(&row.device_id, row.address),
                    row.clone(),
                );
            }
        }

        let mut history = self.history.write().await;
        for row in &batch.rows {
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(row.clone());
        }
        Ok(())
    }
}

/// Append-only JSON lines file, one row per line
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TelemetrySink for JsonlSink {
    async fn store(&self, batch: &TelemetryBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for row in &batch.rows {
            serde_json::to_writer(&mut buf, row).storage_error("encode row")?;
            buf.push(b'\n');
        }

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .storage_error(&format!("create {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .storage_error(&format!("open {}", self.path.display()))?;
        file.write_all(&buf)
            .await
            .storage_error(&format!("append {}", self.path.display()))?;
        file.flush().await.storage_error("flush")?;

        debug!("{} rows -> {}", batch.len(), self.path.display());
        Ok(())
    }
}

/// Sink selection in the service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    Memory {
        #[serde(default = "default_capacity")]
        capacity: usize,
    },
    Jsonl { path: PathBuf },
}

fn default_capacity() -> usize {
    10_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory {
            capacity: default_capacity(),
        }
    }
}

/// Build the sink described by `config`
pub fn open_sink(config: &StorageConfig) -> Arc<dyn TelemetrySink> {
    match config {
        StorageConfig::Memory { capacity } => Arc::new(MemorySink::new(*capacity)),
        StorageConfig::Jsonl { path } => Arc::new(JsonlSink::new(path.clone())),
    }
}
