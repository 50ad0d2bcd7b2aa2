//! The `DeviceAnnouncement` value type and its parsing from raw Pro DJ Link
//! packets.

use std::fmt;
use std::net::Ipv4Addr;

use crate::util::{
    self, DEVICE_NAME_LEN, DEVICE_NAME_OFFSET, DEVICE_NUMBER_OFFSET, MAC_ADDRESS_LEN,
    MAC_ADDRESS_OFFSET,
};

pub type DeviceNumber = u8;

/// A device's six-byte hardware address, rendered as colon-separated hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; MAC_ADDRESS_LEN]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|b| format!("{b:02x}")).collect();
        write!(f, "{}", parts.join(":"))
    }
}

/// An immutable record of one sighting of a device on the network.
///
/// Identity for map keying is `address`; two announcements from the same
/// address supersede each other and the most recent one wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAnnouncement {
    pub name: String,
    pub number: DeviceNumber,
    pub address: Ipv4Addr,
    pub mac: MacAddress,
    pub timestamp: u64,
}

impl DeviceAnnouncement {
    /// Parse a 54-byte announcement payload already known to have passed
    /// `util::is_device_announcement`. `source` is the datagram's actual
    /// source address, preferred over the IP field embedded in the packet.
    pub fn parse(data: &[u8], source: Ipv4Addr, timestamp: u64) -> Self {
        debug_assert!(util::is_device_announcement(data));

        let name = util::read_fixed_string(data, DEVICE_NAME_OFFSET, DEVICE_NAME_LEN);
        let number = data[DEVICE_NUMBER_OFFSET];
        let mut mac = [0u8; MAC_ADDRESS_LEN];
        mac.copy_from_slice(&data[MAC_ADDRESS_OFFSET..MAC_ADDRESS_OFFSET + MAC_ADDRESS_LEN]);

        DeviceAnnouncement {
            name,
            number,
            address: source,
            mac: MacAddress(mac),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{ANNOUNCEMENT_PACKET_LENGTH, PACKET_TYPE_DEVICE_ANNOUNCEMENT, PACKET_TYPE_OFFSET};

    fn packet_with(name: &str, number: u8, mac: [u8; 6]) -> Vec<u8> {
        let mut buf = vec![0u8; ANNOUNCEMENT_PACKET_LENGTH];
        buf[PACKET_TYPE_OFFSET] = PACKET_TYPE_DEVICE_ANNOUNCEMENT;
        let name_bytes = name.as_bytes();
        buf[DEVICE_NAME_OFFSET..DEVICE_NAME_OFFSET + name_bytes.len()].copy_from_slice(name_bytes);
        buf[DEVICE_NUMBER_OFFSET] = number;
        buf[MAC_ADDRESS_OFFSET..MAC_ADDRESS_OFFSET + MAC_ADDRESS_LEN].copy_from_slice(&mac);
        buf
    }

    #[test]
    fn parses_name_number_mac_and_uses_source_address() {
        let mac = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
        let packet = packet_with("CDJ-2000", 2, mac);
        let source: Ipv4Addr = "192.168.1.10".parse().unwrap();

        let ann = DeviceAnnouncement::parse(&packet, source, 12345);
        assert_eq!(ann.name, "CDJ-2000");
        assert_eq!(ann.number, 2);
        assert_eq!(ann.address, source);
        assert_eq!(ann.mac.0, mac);
        assert_eq!(ann.timestamp, 12345);
    }

    #[test]
    fn mac_display_is_colon_hex() {
        let mac = MacAddress([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(mac.to_string(), "00:11:22:33:44:55");
    }

    #[test]
    fn parsing_is_deterministic() {
        let packet = packet_with("XDJ-1000", 4, [1, 2, 3, 4, 5, 6]);
        let source: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let a = DeviceAnnouncement::parse(&packet, source, 1);
        let b = DeviceAnnouncement::parse(&packet, source, 1);
        assert_eq!(a, b);
    }
}
