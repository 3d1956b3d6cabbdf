//! Simulated network endpoints.
//!
//! The protocol core treats devices as opaque: an identity for registry
//! keys and a name for trace output. Topology, rendering, and routing all
//! live outside this crate.

use std::fmt;

/// Stable identity of a simulated device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An abstract host participating in the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    id: DeviceId,
    name: String,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: DeviceId::new(id),
            name: name.into(),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_identity() {
        let a = Device::new("pc-1", "Alice's PC");
        let b = Device::new("pc-1", "Renamed later");
        assert_eq!(a.id(), b.id());
        assert_eq!(a.name(), "Alice's PC");
    }

    #[test]
    fn test_display() {
        let d = Device::new("srv-1", "Web Server");
        assert_eq!(format!("{}", d), "Web Server (srv-1)");
        assert_eq!(format!("{}", d.id()), "srv-1");
    }
}
