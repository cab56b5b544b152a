//! Device model
//!
//! A `Device` is one configured PLC endpoint. The protocol discriminant is a
//! closed enum, so adding a protocol family is a compile-checked change in the
//! client factory and the connector dispatch.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LinkError, Result};

/// Supported protocol families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Modbus TCP-like register access
    #[serde(alias = "modbus_tcp", alias = "modbustcp")]
    Modbus,
    /// Siemens S7-like area/offset access
    #[serde(alias = "siemens_s7", alias = "s7comm")]
    S7,
    /// OPC UA-like node access
    #[serde(alias = "opc_ua", alias = "opc-ua")]
    OpcUa,
}

impl Protocol {
    /// Well-known TCP port of the protocol family
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Modbus => 502,
            Protocol::S7 => 102,
            Protocol::OpcUa => 4840,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Modbus => "modbus",
            Protocol::S7 => "s7",
            Protocol::OpcUa => "opcua",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-protocol secondary identifiers
///
/// Only the fields relevant to the device's protocol are consulted; the rest
/// are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceParams {
    /// Modbus unit (slave) id
    #[serde(default, alias = "unit_id", skip_serializing_if = "Option::is_none")]
    pub slave_id: Option<u8>,
    /// S7 rack number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rack: Option<u16>,
    /// S7 slot number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u16>,
    /// OPC UA default namespace index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<u16>,
}

/// A configured device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub protocol: Protocol,
    /// `host`, `host:port` or `opc.tcp://host:port/path`
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub params: DeviceParams,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Owning principal; `None` means visible to everyone
    #[serde(default)]
    pub owner: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Resolved network endpoint of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Device {
    /// Create a device with default parameters
    pub fn new(id: impl Into<String>, protocol: Protocol, address: Option<&str>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            protocol,
            address: address.map(str::to_string),
            port: None,
            params: DeviceParams::default(),
            active: true,
            owner: None,
        }
    }

    /// Whether the device is visible to the given principal
    pub fn visible_to(&self, principal: &str) -> bool {
        self.active && self.owner.as_deref().map_or(true, |owner| owner == principal)
    }

    /// Resolve the endpoint from `address`, `port` and the protocol default.
    ///
    /// Port precedence: explicit port in the address, then `port`, then the
    /// protocol's well-known port.
    pub fn endpoint(&self) -> Result<Endpoint> {
        let raw = self
            .address
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LinkError::missing_address(&self.id))?;

        // Strip URL scheme and path (opc.tcp://host:4840/server)
        let without_scheme = raw.split_once("://").map_or(raw, |(_, rest)| rest);
        let authority = without_scheme
            .split('/')
            .next()
            .unwrap_or(without_scheme);

        let (host, explicit_port) = split_host_port(authority).map_err(|reason| {
            LinkError::config(format!("Device {} address '{}': {}", self.id, raw, reason))
        })?;

        if host.is_empty() {
            return Err(LinkError::missing_address(&self.id));
        }

        let port = explicit_port
            .or(self.port)
            .unwrap_or_else(|| self.protocol.default_port());
        if port == 0 {
            return Err(LinkError::config(format!(
                "Device {} has invalid port 0",
                self.id
            )));
        }

        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals (`[::1]:502`).
fn split_host_port(authority: &str) -> std::result::Result<(&str, Option<u16>), String> {
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| "unterminated IPv6 literal".to_string())?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(parse_port(port)?))),
            None if tail.is_empty() => Ok((host, None)),
            None => Err(format!("unexpected trailing '{}'", tail)),
        };
    }

    match authority.matches(':').count() {
        0 => Ok((authority, None)),
        1 => {
            let (host, port) = authority
                .split_once(':')
                .ok_or_else(|| "malformed host:port".to_string())?;
            Ok((host, Some(parse_port(port)?)))
        },
        // Bare IPv6 literal without port
        _ => Ok((authority, None)),
    }
}

fn parse_port(port: &str) -> std::result::Result<u16, String> {
    port.parse::<u16>()
        .map_err(|e| format!("invalid port '{}': {}", port, e))
}
