// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Device Model
//!
//! Value objects describing the devices a study protocol expects and the
//! registrations physical devices present when they join a deployment.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`RoleName`] | Unique key of a device within a protocol |
//! | [`DeviceKind`] | Tagged capability variant per known device type |
//! | [`DeviceDescriptor`] | Device as declared in the protocol |
//! | [`DeviceRegistration`] | Identity a physical device supplies on registration |
//! | [`RegistrationValidity`] | Ternary outcome of a registration check |
//!
//! Device kinds and registration types received from a newer protocol
//! version deserialize into their `Unknown` variants with every field kept,
//! and serialize back unchanged. Unknown kinds accept any registration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::domain::protocol::ProtocolError;

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Name of a device role, unique across a protocol (e.g. "Participant's phone").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleName(String);

impl RoleName {
    /// Create a role name. Leading and trailing whitespace is not allowed and
    /// the name must not be empty.
    pub fn new(name: impl Into<String>) -> Result<Self, ProtocolError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ProtocolError::InvalidRoleName(
                "Role name cannot be empty".to_string(),
            ));
        }
        if name.trim() != name {
            return Err(ProtocolError::InvalidRoleName(format!(
                "Role name '{}' has surrounding whitespace",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoleName {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoleName> for String {
    fn from(role: RoleName) -> Self {
        role.0
    }
}

impl FromStr for RoleName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Borrow<str> for RoleName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Value Objects: Device Kinds
// ============================================================================

// ============================================================================
// Wire Format
// ============================================================================

/// `type` tag plus the remaining fields of a device kind or registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TypedFields {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl TypedFields {
    fn bare(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            fields: Map::new(),
        }
    }
}

/// Device type, determining which registrations a device accepts and whether
/// it can act as a primary device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TypedFields", into = "TypedFields")]
pub enum DeviceKind {
    /// Phone running the study client; primary-capable.
    Smartphone,
    /// Bluetooth beacon following the AltBeacon specification.
    AltBeacon,
    /// Bluetooth Low Energy heart rate sensor, identified by MAC address.
    BleHeartRateDevice,
    /// Web browser running the study client; primary-capable.
    WebBrowser,
    /// Device speaking a study-specific protocol; primary-capable.
    CustomProtocolDevice,
    /// Device type this build does not know about.
    Unknown {
        type_name: String,
        properties: Map<String, Value>,
    },
}

impl From<TypedFields> for DeviceKind {
    fn from(wire: TypedFields) -> Self {
        match Self::from_type_name(&wire.type_name) {
            Self::Unknown { type_name, .. } => Self::Unknown {
                type_name,
                properties: wire.fields,
            },
            known => known,
        }
    }
}

impl From<DeviceKind> for TypedFields {
    fn from(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Unknown {
                type_name,
                properties,
            } => TypedFields {
                type_name,
                fields: properties,
            },
            known => TypedFields::bare(known.type_name()),
        }
    }
}

impl DeviceKind {
    /// Resolve a manifest type name. Unrecognized names are preserved as
    /// [`DeviceKind::Unknown`].
    pub fn from_type_name(type_name: &str) -> Self {
        match type_name {
            "Smartphone" => Self::Smartphone,
            "AltBeacon" => Self::AltBeacon,
            "BleHeartRateDevice" => Self::BleHeartRateDevice,
            "WebBrowser" => Self::WebBrowser,
            "CustomProtocolDevice" => Self::CustomProtocolDevice,
            other => Self::Unknown {
                type_name: other.to_string(),
                properties: Map::new(),
            },
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Self::Smartphone => "Smartphone",
            Self::AltBeacon => "AltBeacon",
            Self::BleHeartRateDevice => "BleHeartRateDevice",
            Self::WebBrowser => "WebBrowser",
            Self::CustomProtocolDevice => "CustomProtocolDevice",
            Self::Unknown { type_name, .. } => type_name,
        }
    }

    /// Whether devices of this kind can receive a configuration of their own.
    /// Unknown kinds defer to the flag on the descriptor.
    pub fn supports_primary(&self) -> bool {
        !matches!(self, Self::AltBeacon | Self::BleHeartRateDevice)
    }

    /// Check a registration against the requirements of this device kind.
    pub fn is_valid_registration(&self, registration: &DeviceRegistration) -> RegistrationValidity {
        if let RegistrationDetails::Unknown { .. } = registration.details {
            return RegistrationValidity::Unknown;
        }

        match self {
            Self::Smartphone | Self::WebBrowser | Self::CustomProtocolDevice => {
                match registration.details {
                    RegistrationDetails::Default => RegistrationValidity::Valid,
                    _ => RegistrationValidity::Invalid(format!(
                        "{} devices expect a default registration",
                        self.type_name()
                    )),
                }
            }
            Self::AltBeacon => match &registration.details {
                RegistrationDetails::AltBeacon { organization_id, .. } => {
                    if organization_id.trim().is_empty() {
                        RegistrationValidity::Invalid(
                            "AltBeacon registration requires an organization id".to_string(),
                        )
                    } else {
                        RegistrationValidity::Valid
                    }
                }
                _ => RegistrationValidity::Invalid(
                    "AltBeacon devices expect an AltBeacon registration".to_string(),
                ),
            },
            Self::BleHeartRateDevice => match &registration.details {
                RegistrationDetails::MacAddress { mac_address } if is_mac_address(mac_address) => {
                    RegistrationValidity::Valid
                }
                RegistrationDetails::MacAddress { mac_address } => RegistrationValidity::Invalid(
                    format!("'{}' is not a valid MAC address", mac_address),
                ),
                _ => RegistrationValidity::Invalid(
                    "BLE heart rate devices expect a MAC address registration".to_string(),
                ),
            },
            Self::Unknown { .. } => RegistrationValidity::Unknown,
        }
    }
}

/// Six hex octets separated by ':' or '-'.
fn is_mac_address(candidate: &str) -> bool {
    let separator = if candidate.contains('-') { '-' } else { ':' };
    let octets: Vec<&str> = candidate.split(separator).collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

// ============================================================================
// Entities: Device Descriptor
// ============================================================================

/// A device as declared in a study protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub role_name: RoleName,
    pub kind: DeviceKind,
    /// Primary devices receive a configuration for themselves and their
    /// connected devices.
    pub is_primary: bool,
    /// Optional primary devices do not hold back the aggregate deployment status.
    #[serde(default)]
    pub is_optional: bool,
    /// Kind-specific sampling defaults handed to the device with its configuration.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub default_sampling: serde_json::Value,
}

impl DeviceDescriptor {
    pub fn primary(role_name: RoleName, kind: DeviceKind) -> Self {
        Self {
            role_name,
            kind,
            is_primary: true,
            is_optional: false,
            default_sampling: serde_json::Value::Null,
        }
    }

    pub fn connected(role_name: RoleName, kind: DeviceKind) -> Self {
        Self {
            role_name,
            kind,
            is_primary: false,
            is_optional: false,
            default_sampling: serde_json::Value::Null,
        }
    }

    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    pub fn with_default_sampling(mut self, sampling: serde_json::Value) -> Self {
        self.default_sampling = sampling;
        self
    }
}

// ============================================================================
// Value Objects: Registrations
// ============================================================================

/// Kind-specific part of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "TypedFields", into = "TypedFields")]
pub enum RegistrationDetails {
    /// No information beyond the device id.
    #[default]
    Default,
    AltBeacon {
        manufacturer_id: u16,
        organization_id: String,
        major_id: u16,
        minor_id: u16,
    },
    MacAddress { mac_address: String },
    /// Registration type this build does not know about, forwarded as-is.
    Unknown {
        type_name: String,
        properties: Map<String, Value>,
    },
}

#[derive(Deserialize)]
struct AltBeaconFields {
    manufacturer_id: u16,
    organization_id: String,
    major_id: u16,
    minor_id: u16,
}

#[derive(Deserialize)]
struct MacAddressFields {
    mac_address: String,
}

impl TryFrom<TypedFields> for RegistrationDetails {
    type Error = serde_json::Error;

    fn try_from(wire: TypedFields) -> Result<Self, Self::Error> {
        let TypedFields { type_name, fields } = wire;
        match type_name.as_str() {
            "Default" => return Ok(Self::Default),
            "AltBeacon" => {
                let f: AltBeaconFields = serde_json::from_value(Value::Object(fields))?;
                return Ok(Self::AltBeacon {
                    manufacturer_id: f.manufacturer_id,
                    organization_id: f.organization_id,
                    major_id: f.major_id,
                    minor_id: f.minor_id,
                });
            }
            "MacAddress" => {
                let f: MacAddressFields = serde_json::from_value(Value::Object(fields))?;
                return Ok(Self::MacAddress {
                    mac_address: f.mac_address,
                });
            }
            _ => {}
        }

        Ok(Self::Unknown {
            type_name,
            properties: fields,
        })
    }
}

impl From<RegistrationDetails> for TypedFields {
    fn from(details: RegistrationDetails) -> Self {
        match details {
            RegistrationDetails::Default => TypedFields::bare("Default"),
            RegistrationDetails::AltBeacon {
                manufacturer_id,
                organization_id,
                major_id,
                minor_id,
            } => {
                let mut fields = Map::new();
                fields.insert("manufacturer_id".to_string(), manufacturer_id.into());
                fields.insert("organization_id".to_string(), organization_id.into());
                fields.insert("major_id".to_string(), major_id.into());
                fields.insert("minor_id".to_string(), minor_id.into());
                TypedFields {
                    type_name: "AltBeacon".to_string(),
                    fields,
                }
            }
            RegistrationDetails::MacAddress { mac_address } => {
                let mut fields = Map::new();
                fields.insert("mac_address".to_string(), mac_address.into());
                TypedFields {
                    type_name: "MacAddress".to_string(),
                    fields,
                }
            }
            RegistrationDetails::Unknown {
                type_name,
                properties,
            } => TypedFields {
                type_name,
                fields: properties,
            },
        }
    }
}

/// Identity and configuration a physical device supplies when it registers
/// for a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    /// Identifier unique to the physical device within a deployment.
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
    #[serde(default = "Utc::now")]
    pub registration_created_on: DateTime<Utc>,
    #[serde(default)]
    pub details: RegistrationDetails,
}

impl DeviceRegistration {
    /// Registration with default details, created now.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_display_name: None,
            registration_created_on: Utc::now(),
            details: RegistrationDetails::Default,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.device_display_name = Some(name.into());
        self
    }

    pub fn with_details(mut self, details: RegistrationDetails) -> Self {
        self.details = details;
        self
    }

    /// Display name, falling back to the device id.
    pub fn display_name(&self) -> &str {
        self.device_display_name.as_deref().unwrap_or(&self.device_id)
    }
}

/// Outcome of checking a registration against a device's capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationValidity {
    Valid,
    Invalid(String),
    /// The device or registration type is not understood; treated as valid.
    Unknown,
}

impl RegistrationValidity {
    pub fn is_acceptable(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}
