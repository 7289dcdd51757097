//! Persisted address settings in JSON form
//!
//! The document is a flat object:
//!
//! ```text
//! {"ipAddr":"192.168.2.26","subnetMask":"255.255.255.0",
//!  "gatewayAddr":"192.168.2.1","dnsAddr":"8.8.8.8","DHCP":false}
//! ```
//!
//! Unknown keys are ignored. A key whose value is not a valid dotted quad
//! (or, for `DHCP`, not a boolean) is skipped and the field keeps its
//! previous value.

use alloc::string::{String, ToString};
use serde::Serialize;
use serde_json::Value;

use crate::error::ConfigError;
use crate::types::{parse_dotted_quad, AddressSettings, DottedQuad, Ipv4};

pub const KEY_IP_ADDR: &str = "ipAddr";
pub const KEY_SUBNET_MASK: &str = "subnetMask";
pub const KEY_GATEWAY_ADDR: &str = "gatewayAddr";
pub const KEY_DNS_ADDR: &str = "dnsAddr";
pub const KEY_DHCP: &str = "DHCP";

/// Field-level changes decoded from a JSON settings document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigUpdate {
    pub ip_addr: Option<Ipv4>,
    pub subnet_mask: Option<Ipv4>,
    pub gateway_addr: Option<Ipv4>,
    pub dns_addr: Option<Ipv4>,
    pub dhcp: Option<bool>,
}

impl ConfigUpdate {
    /// Decode a settings document
    ///
    /// # Returns
    /// * `Ok(ConfigUpdate)` - Valid fields found in the object (possibly none)
    /// * `Err(ConfigError)` - Text is not JSON, or not a JSON object
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let object = value.as_object().ok_or(ConfigError::NotAnObject)?;

        let mut update = ConfigUpdate::default();
        for (key, value) in object {
            match key.as_str() {
                KEY_IP_ADDR => update.ip_addr = address_field(key, value),
                KEY_SUBNET_MASK => update.subnet_mask = address_field(key, value),
                KEY_GATEWAY_ADDR => update.gateway_addr = address_field(key, value),
                KEY_DNS_ADDR => update.dns_addr = address_field(key, value),
                KEY_DHCP => match value.as_bool() {
                    Some(flag) => update.dhcp = Some(flag),
                    None => log::trace!("{}", ConfigError::invalid_value(key)),
                },
                _ => {}
            }
        }

        Ok(update)
    }

    /// True if any address field is present
    pub fn has_addresses(&self) -> bool {
        self.ip_addr.is_some()
            || self.subnet_mask.is_some()
            || self.gateway_addr.is_some()
            || self.dns_addr.is_some()
    }

    /// Overlay the present address fields onto `settings`
    pub fn apply_addresses(&self, settings: &mut AddressSettings) {
        if let Some(ip) = self.ip_addr {
            settings.ip_addr = ip;
        }
        if let Some(mask) = self.subnet_mask {
            settings.subnet_mask = mask;
        }
        if let Some(gateway) = self.gateway_addr {
            settings.gateway_addr = gateway;
        }
        if let Some(dns) = self.dns_addr {
            settings.dns_addr = dns;
        }
    }
}

fn address_field(key: &str, value: &Value) -> Option<Ipv4> {
    let parsed = value.as_str().and_then(parse_dotted_quad);
    if parsed.is_none() {
        log::trace!("{}", ConfigError::invalid_value(key));
    }
    parsed
}

#[derive(Serialize)]
struct StoredAddresses {
    #[serde(rename = "ipAddr")]
    ip_addr: String,
    #[serde(rename = "subnetMask")]
    subnet_mask: String,
    #[serde(rename = "gatewayAddr")]
    gateway_addr: String,
    #[serde(rename = "dnsAddr")]
    dns_addr: String,
}

/// Encode the four address fields as a settings document
pub fn to_json(settings: &AddressSettings) -> Result<String, ConfigError> {
    let stored = StoredAddresses {
        ip_addr: DottedQuad(&settings.ip_addr).to_string(),
        subnet_mask: DottedQuad(&settings.subnet_mask).to_string(),
        gateway_addr: DottedQuad(&settings.gateway_addr).to_string(),
        dns_addr: DottedQuad(&settings.dns_addr).to_string(),
    };

    serde_json::to_string(&stored).map_err(|e| ConfigError::SerializationError(e.to_string()))
}
