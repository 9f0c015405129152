//! Device identity.
//!
//! A device is identified by its IPv4 address, held the way `inet_addr`
//! would hand it back: the four wire-order octets reinterpreted as a
//! native-endian `u32`. This is kept as a distinct newtype (never a bare
//! `u32`, never a port number) per the design note in spec §9.

use std::fmt;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(u32);

impl DeviceHandle {
    #[must_use]
    pub fn from_ipv4(addr: Ipv4Addr) -> Self {
        Self(u32::from_ne_bytes(addr.octets()))
    }

    #[must_use]
    pub fn to_ipv4(self) -> Ipv4Addr {
        Ipv4Addr::from(self.0.to_ne_bytes())
    }

    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x} ({})", self.0, self.to_ipv4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_ipv4() {
        let addr: Ipv4Addr = "192.168.1.101".parse().unwrap();
        let handle = DeviceHandle::from_ipv4(addr);
        assert_eq!(handle.to_ipv4(), addr);
    }

    #[test]
    fn matches_inet_addr_byte_order() {
        // 192.168.1.101 -> octets [192, 168, 1, 101] -> native-endian u32
        // reinterpretation of those bytes as they sit on the wire.
        let addr: Ipv4Addr = "192.168.1.101".parse().unwrap();
        let handle = DeviceHandle::from_ipv4(addr);
        assert_eq!(handle.raw(), u32::from_ne_bytes([192, 168, 1, 101]));
    }

    #[test]
    fn discovery_scenario_handle_literal() {
        // End-to-end scenario 1 in spec §8: device at 192.168.1.101 must
        // yield handle 0x6501a8c0 on a little-endian host.
        let addr: Ipv4Addr = "192.168.1.101".parse().unwrap();
        let handle = DeviceHandle::from_ipv4(addr);
        if cfg!(target_endian = "little") {
            assert_eq!(handle.raw(), 0x6501_a8c0);
        }
    }
}
