//! Device identifiers.
//!
//! An OMEMO device is one client installation of one identity. Device ids are
//! chosen by the client at provisioning time and published in the identity's
//! device list; the `(owner, id)` pair is the unit the engine keys sessions,
//! bundles and trust on.

use serde::{Deserialize, Serialize};

use crate::jid::BareJid;

/// Error for out-of-range device ids.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("device id out of range [1, 2^31 - 1]: {0}")]
pub struct InvalidDeviceId(pub u32);

/// A device id in the range `[1, 2^31 - 1]`.
///
/// The upper bound keeps ids representable in implementations that use
/// signed 32-bit integers. Zero is excluded so that it can never be confused
/// with an unassigned id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "u32", into = "u32")]
pub struct DeviceId(u32);

impl DeviceId {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = i32::MAX as u32;

    pub fn new(id: u32) -> Result<Self, InvalidDeviceId> {
        if (Self::MIN..=Self::MAX).contains(&id) {
            Ok(DeviceId(id))
        } else {
            Err(InvalidDeviceId(id))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for DeviceId {
    type Error = InvalidDeviceId;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        DeviceId::new(id)
    }
}

impl From<DeviceId> for u32 {
    fn from(id: DeviceId) -> u32 {
        id.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One device of one identity: the addressing unit for sessions and trust.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OmemoDevice {
    pub owner: BareJid,
    pub id: DeviceId,
}

impl OmemoDevice {
    pub fn new(owner: BareJid, id: DeviceId) -> Self {
        OmemoDevice { owner, id }
    }
}

impl std::fmt::Display for OmemoDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.owner, self.id)
    }
}
