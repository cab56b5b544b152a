//! Realtime change feed on the devices table
//!
//! Payloads arrive as JSON envelopes:
//!
//! ```json
//! {"eventType": "UPDATE", "table": "devices", "new": {...}, "old": {"id": "plc-1"}}
//! ```
//!
//! [`DeviceChange::parse`] validates the envelope and the device record and
//! rejects anything it does not recognize.

use serde::Deserialize;
use serde_json::Value;

use crate::device::Device;
use crate::error::{ErrorExt, LinkError, Result};

pub const DEVICES_TABLE: &str = "devices";

/// Validated change on the devices table
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceChange {
    Inserted(Device),
    Updated(Device),
    Deleted { id: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum EventType {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(alias = "type", alias = "event_type")]
    event_type: EventType,
    table: String,
    #[serde(default, alias = "record")]
    new: Option<Value>,
    #[serde(default, alias = "old_record")]
    old: Option<Value>,
}

impl DeviceChange {
    /// Parse and validate one change-feed payload
    pub fn parse(payload: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(payload).validation_error("change payload")?;

        if envelope.table != DEVICES_TABLE {
            return Err(LinkError::validation(format!(
                "change on unexpected table '{}'",
                envelope.table
            )));
        }

        match envelope.event_type {
            EventType::Insert => Ok(DeviceChange::Inserted(record(envelope.new)?)),
            EventType::Update => Ok(DeviceChange::Updated(record(envelope.new)?)),
            EventType::Delete => {
                let id = envelope
                    .old
                    .as_ref()
                    .and_then(|old| old.get("id"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| LinkError::validation("delete event without old.id"))?;
                Ok(DeviceChange::Deleted { id: id.to_string() })
            },
        }
    }

    /// Id of the affected device
    pub fn device_id(&self) -> &str {
        match self {
            DeviceChange::Inserted(d) | DeviceChange::Updated(d) => &d.id,
            DeviceChange::Deleted { id } => id,
        }
    }
}

fn record(value: Option<Value>) -> Result<Device> {
    let value = value.ok_or_else(|| LinkError::validation("event without new record"))?;
    let device: Device = serde_json::from_value(value).validation_error("device record")?;
    if device.id.trim().is_empty() {
        return Err(LinkError::validation("device record with empty id"));
    }
    Ok(device)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::device::Protocol;

    #[test]
    fn test_insert_and_update() {
        let change = DeviceChange::parse(
            r#"{"eventType":"INSERT","table":"devices","new":{"id":"plc-7","protocol":"modbus","address":"10.1.1.7"}}"#,
        )
        .unwrap();
        match change {
            DeviceChange::Inserted(device) => {
                assert_eq!(device.id, "plc-7");
                assert_eq!(device.protocol, Protocol::Modbus);
                assert!(device.active);
            },
            other => panic!("unexpected {:?}", other),
        }

        let change = DeviceChange::parse(
            r#"{"eventType":"UPDATE","table":"devices","new":{"id":"plc-7","protocol":"s7","active":false},"old":{"id":"plc-7"}}"#,
        )
        .unwrap();
        assert!(matches!(change, DeviceChange::Updated(ref d) if !d.active));
        assert_eq!(change.device_id(), "plc-7");
    }

    #[test]
    fn test_delete_uses_old_id() {
        let change = DeviceChange::parse(
            r#"{"eventType":"DELETE","table":"devices","new":{},"old":{"id":"plc-7"}}"#,
        )
        .unwrap();
        assert_eq!(change, DeviceChange::Deleted { id: "plc-7".into() });
    }

    #[test]
    fn test_rejects_unrecognized_payloads() {
        let rejected = [
            r#"{"eventType":"TRUNCATE","table":"devices"}"#,
            r#"{"eventType":"INSERT","table":"readings","new":{"id":"x","protocol":"modbus"}}"#,
            r#"{"eventType":"INSERT","table":"devices","new":{"id":"x","protocol":"profinet"}}"#,
            r#"{"eventType":"INSERT","table":"devices","new":{"id":" ","protocol":"modbus"}}"#,
            r#"{"eventType":"INSERT","table":"devices"}"#,
            r#"{"eventType":"DELETE","table":"devices","old":{}}"#,
            r#"not json"#,
        ];
        for payload in rejected {
            assert!(
                matches!(
                    DeviceChange::parse(payload),
                    Err(LinkError::ValidationError(_))
                ),
                "accepted {}",
                payload
            );
        }
    }
}
