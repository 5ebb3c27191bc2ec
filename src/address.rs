//! Protocol addresses: the `(identifier, device id)` pair that names a
//! remote session endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a remote device: a stable name plus a device id.
///
/// The display form `"name.device_id"` is the storage key and the
/// per-address serialization key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolAddress {
    name: String,
    device_id: u32,
}

impl ProtocolAddress {
    /// Create an address.
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }

    /// The identifier (phone number, UUID, ...).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device id under that identifier.
    #[must_use]
    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}
