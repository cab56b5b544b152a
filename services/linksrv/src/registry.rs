//! Device registries
//!
//! A registry supplies the device list the connector is built from. Three
//! backends are provided: an in-memory list fed by the realtime change feed,
//! a YAML/JSON file, and a SQLite `devices` table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceParams, Protocol};
use crate::error::{ErrorExt, LinkError, Result};
use crate::events::DeviceChange;

/// Read-only source of devices
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Active devices visible to `principal`, in registry order
    async fn list_active_devices(&self, principal: &str) -> Result<Vec<Device>>;
}

fn visible(devices: &[Device], principal: &str) -> Vec<Device> {
    devices
        .iter()
        .filter(|d| d.visible_to(principal))
        .cloned()
        .collect()
}

// ============================================================================
// In-memory registry
// ============================================================================

/// In-memory device list, updated from the change feed
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    devices: RwLock<Vec<Device>>,
}

impl MemoryRegistry {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Apply one validated change
    pub async fn apply(&self, change: DeviceChange) {
        let mut devices = self.devices.write().await;
        match change {
            DeviceChange::Inserted(device) | DeviceChange::Updated(device) => {
                match devices.iter_mut().find(|d| d.id == device.id) {
                    Some(existing) => {
                        debug!("Dev {} updated", device.id);
                        *existing = device;
                    },
                    None => {
                        debug!("Dev {} added", device.id);
                        devices.push(device);
                    },
                }
            },
            DeviceChange::Deleted { id } => {
                let before = devices.len();
                devices.retain(|d| d.id != id);
                if devices.len() == before {
                    debug!("Dev {} delete ignored: unknown", id);
                }
            },
        }
    }

    /// Parse and apply a raw change-feed payload. Invalid payloads are rejected
    /// without touching the list.
    pub async fn apply_payload(&self, payload: &str) -> Result<DeviceChange> {
        let change = DeviceChange::parse(payload)?;
        self.apply(change.clone()).await;
        Ok(change)
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn list_active_devices(&self, principal: &str) -> Result<Vec<Device>> {
        Ok(visible(&self.devices.read().await, principal))
    }
}

// ============================================================================
// File registry
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeviceDocument {
    Wrapped { devices: Vec<Device> },
    List(Vec<Device>),
}

/// Device list stored in a YAML or JSON file; re-read on every listing
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<Device>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .config_error(&format!("read {}", self.path.display()))?;

        let is_json = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let document: DeviceDocument = if is_json {
            serde_json::from_str(&content).config_error(&self.path.display().to_string())?
        } else {
            serde_yaml::from_str(&content)?
        };

        Ok(match document {
            DeviceDocument::Wrapped { devices } | DeviceDocument::List(devices) => devices,
        })
    }
}

#[async_trait]
impl DeviceRegistry for FileRegistry {
    async fn list_active_devices(&self, principal: &str) -> Result<Vec<Device>> {
        let devices = self.load().await?;
        debug!("{} devices in {}", devices.len(), self.path.display());
        Ok(visible(&devices, principal))
    }
}

// ============================================================================
// SQLite registry
// ============================================================================

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL DEFAULT '',
    protocol    TEXT NOT NULL,
    address     TEXT,
    port        INTEGER,
    params      TEXT NOT NULL DEFAULT '{}',
    active      BOOLEAN NOT NULL DEFAULT 1,
    owner       TEXT,
    created_at  TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)
"#;

type DeviceRow = (
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    String,
    bool,
    Option<String>,
);

/// Devices stored in a SQLite `devices` table
#[derive(Debug, Clone)]
pub struct SqliteRegistry {
    pool: SqlitePool,
}

impl SqliteRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool for `url` (`sqlite:data/devices.db`, `sqlite::memory:`)
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await
            .storage_error(&format!("open {}", url))?;

        sqlx::query("SELECT 1").fetch_one(&pool).await?;
        info!("SQLite: {}", url);
        Ok(Self { pool })
    }

    /// Create the `devices` table when missing
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert or replace a device row
    pub async fn upsert(&self, device: &Device) -> Result<()> {
        let params = serde_json::to_string(&device.params)?;
        sqlx::query(
            r#"
            INSERT INTO devices (id, name, protocol, address, port, params, active, owner)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                protocol = excluded.protocol,
                address = excluded.address,
                port = excluded.port,
                params = excluded.params,
                active = excluded.active,
                owner = excluded.owner
            "#,
        )
        .bind(&device.id)
        .bind(&device.name)
        .bind(device.protocol.as_str())
        .bind(device.address.as_deref())
        .bind(device.port.map(i64::from))
        .bind(params)
        .bind(device.active)
        .bind(device.owner.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn device_from_row(row: DeviceRow) -> Result<Device> {
    let (id, name, protocol, address, port, params, active, owner) = row;

    let protocol: Protocol = serde_json::from_value(serde_json::Value::String(protocol))
        .validation_error(&format!("device {} protocol", id))?;
    let params: DeviceParams =
        serde_json::from_str(&params).validation_error(&format!("device {} params", id))?;
    let port = port
        .map(u16::try_from)
        .transpose()
        .validation_error(&format!("device {} port", id))?;

    Ok(Device {
        name: if name.is_empty() { id.clone() } else { name },
        id,
        protocol,
        address,
        port,
        params,
        active,
        owner,
    })
}

#[async_trait]
impl DeviceRegistry for SqliteRegistry {
    async fn list_active_devices(&self, principal: &str) -> Result<Vec<Device>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT id, name, protocol, address, port, params, active, owner
            FROM devices
            WHERE active = TRUE AND (owner IS NULL OR owner = ?)
            ORDER BY rowid
            "#,
        )
        .bind(principal)
        .fetch_all(&self.pool)
        .await?;

        let mut devices = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.0.clone();
            match device_from_row(row) {
                Ok(device) => devices.push(device),
                Err(e) => warn!("Dev {} row skipped: {}", id, e),
            }
        }
        Ok(devices)
    }
}

// ============================================================================
// Construction from configuration
// ============================================================================

/// Where the device list comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistrySource {
    /// Devices listed directly in the service configuration
    Inline {
        #[serde(default)]
        devices: Vec<Device>,
    },
    File { path: PathBuf },
    Sqlite {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Create the table on startup
        #[serde(default)]
        bootstrap: bool,
    },
}

fn default_max_connections() -> u32 {
    4
}

impl Default for RegistrySource {
    fn default() -> Self {
        RegistrySource::File {
            path: PathBuf::from("config/devices.yaml"),
        }
    }
}

/// Build the registry described by `source`
pub async fn open_registry(source: &RegistrySource) -> Result<Arc<dyn DeviceRegistry>> {
    match source {
        RegistrySource::Inline { devices } => Ok(Arc::new(MemoryRegistry::new(devices.clone()))),
        RegistrySource::File { path } => {
            if !path.exists() {
                return Err(LinkError::config(format!(
                    "device file not found: {}",
                    path.display()
                )));
            }
            Ok(Arc::new(FileRegistry::new(path.clone())))
        },
        RegistrySource::Sqlite {
            url,
            max_connections,
            bootstrap,
        } => {
            let registry = SqliteRegistry::connect(url, *max_connections).await?;
            if *bootstrap {
                registry.ensure_schema().await?;
            }
            Ok(Arc::new(registry))
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    fn owned(id: &str, owner: Option<&str>) -> Device {
        let mut device = Device::new(id, Protocol::Modbus, Some("127.0.0.1"));
        device.owner = owner.map(str::to_string);
        device
    }

    fn ids(devices: &[Device]) -> Vec<&str> {
        devices.iter().map(|d| d.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_memory_registry_visibility_and_order() {
        let mut inactive = owned("c", None);
        inactive.active = false;
        let registry = MemoryRegistry::new(vec![
            owned("a", Some("alice")),
            owned("b", None),
            inactive,
            owned("d", Some("bob")),
        ]);

        let alice = registry.list_active_devices("alice").await.unwrap();
        assert_eq!(ids(&alice), vec!["a", "b"]);
        let bob = registry.list_active_devices("bob").await.unwrap();
        assert_eq!(ids(&bob), vec!["b", "d"]);
    }

    #[tokio::test]
    async fn test_memory_registry_applies_changes() {
        let registry = MemoryRegistry::new(vec![owned("a", None), owned("b", None)]);

        registry
            .apply_payload(
                r#"{"eventType":"UPDATE","table":"devices","new":{"id":"a","protocol":"s7","address":"127.0.0.2"}}"#,
            )
            .await
            .unwrap();
        registry
            .apply_payload(r#"{"eventType":"DELETE","table":"devices","old":{"id":"b"}}"#)
            .await
            .unwrap();
        registry
            .apply_payload(
                r#"{"eventType":"INSERT","table":"devices","new":{"id":"c","protocol":"opcua"}}"#,
            )
            .await
            .unwrap();
        assert!(registry
            .apply_payload(r#"{"eventType":"DELETE","table":"sites","old":{"id":"a"}}"#)
            .await
            .is_err());

        let devices = registry.list_active_devices("anyone").await.unwrap();
        assert_eq!(ids(&devices), vec!["a", "c"]);
        assert_eq!(devices[0].protocol, Protocol::S7);
    }

    #[tokio::test]
    async fn test_file_registry_yaml_and_json() {
        let mut yaml = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            yaml,
            "devices:\n  - id: press-01\n    protocol: modbus\n    address: 10.0.0.1:502\n    params:\n      slave_id: 3\n  - id: old\n    protocol: s7\n    active: false\n"
        )
        .unwrap();
        let devices = FileRegistry::new(yaml.path())
            .list_active_devices("x")
            .await
            .unwrap();
        assert_eq!(ids(&devices), vec!["press-01"]);
        assert_eq!(devices[0].params.slave_id, Some(3));

        let mut json = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(json, r#"[{{"id":"ua-1","protocol":"opc_ua","address":"opc.tcp://h:4840"}}]"#)
            .unwrap();
        let devices = FileRegistry::new(json.path())
            .list_active_devices("x")
            .await
            .unwrap();
        assert_eq!(devices[0].protocol, Protocol::OpcUa);
    }

    #[tokio::test]
    async fn test_file_registry_missing_file() {
        let registry = FileRegistry::new("/nonexistent/devices.yaml");
        assert!(matches!(
            registry.list_active_devices("x").await,
            Err(LinkError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_sqlite_registry_round_trip() {
        let registry = SqliteRegistry::connect("sqlite::memory:", 1).await.unwrap();
        registry.ensure_schema().await.unwrap();

        let mut s7 = Device::new("s7-a", Protocol::S7, Some("127.0.0.1"));
        s7.params.rack = Some(0);
        s7.params.slot = Some(2);
        s7.port = Some(1102);
        registry.upsert(&owned("mb-a", Some("alice"))).await.unwrap();
        registry.upsert(&s7).await.unwrap();
        registry.upsert(&owned("mb-b", Some("bob"))).await.unwrap();

        let devices = registry.list_active_devices("alice").await.unwrap();
        assert_eq!(ids(&devices), vec!["mb-a", "s7-a"]);
        assert_eq!(devices[1], s7);

        sqlx::query("INSERT INTO devices (id, protocol) VALUES ('bad', 'bacnet')")
            .execute(registry.pool())
            .await
            .unwrap();
        let devices = registry.list_active_devices("alice").await.unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn test_open_registry_inline() {
        let source: RegistrySource = serde_yaml::from_str(
            "kind: inline\ndevices:\n  - id: a\n    protocol: modbus\n    address: 127.0.0.1\n",
        )
        .unwrap();
        let registry = open_registry(&source).await.unwrap();
        assert_eq!(registry.list_active_devices("p").await.unwrap().len(), 1);
    }
}
