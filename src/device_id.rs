//! Beacon identity.

use std::fmt;

/// Opaque identifier of a beacon, stable for the lifetime of a scan session.
///
/// Holds the 6-byte Bluetooth address, most significant byte first, and is
/// used as the key for every set the manager keeps. Ordering follows the
/// bytes so iteration over connected beacons is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceId(pub [u8; 6]);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl From<[u8; 6]> for DeviceId {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for DeviceId {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(feature = "bluer")]
impl From<DeviceId> for bluer::Address {
    fn from(id: DeviceId) -> Self {
        bluer::Address(id.0)
    }
}
