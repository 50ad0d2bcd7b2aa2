//! Byte-buffer helpers and packet layout constants shared by the announcement
//! listener and the DBServer query protocol.
//!
//! Offsets below are taken from the dysentery Pro DJ Link packet analysis
//! referenced by the spec; they are not re-derived here.

use byteorder::{BigEndian, ByteOrder};

/// Pro DJ Link announcement packets are always exactly this many bytes.
pub const ANNOUNCEMENT_PACKET_LENGTH: usize = 54;

/// First ten bytes of every Pro DJ Link packet are zero.
pub const MAGIC_HEADER_LEN: usize = 10;

/// Byte 10 identifies the packet type; `0x06` is a device announcement.
pub const PACKET_TYPE_OFFSET: usize = 10;
pub const PACKET_TYPE_DEVICE_ANNOUNCEMENT: u8 = 0x06;

/// Device name is a fixed-width ASCII/UTF-8 field starting here.
pub const DEVICE_NAME_OFFSET: usize = 12;
pub const DEVICE_NAME_LEN: usize = 20;

/// Single-byte device number ("player number").
pub const DEVICE_NUMBER_OFFSET: usize = 36;

/// Six-byte hardware (MAC) address.
pub const MAC_ADDRESS_OFFSET: usize = 38;
pub const MAC_ADDRESS_LEN: usize = 6;

/// Four-byte IPv4 address as claimed by the device itself (the datagram's
/// source address is preferred over this field; see `announcement.rs`).
pub const IP_ADDRESS_OFFSET: usize = 44;

/// True iff `data` passes the structural checks for a device announcement:
/// exact length, ten leading zero bytes, and packet-type byte `0x06`.
pub fn is_device_announcement(data: &[u8]) -> bool {
    if data.len() != ANNOUNCEMENT_PACKET_LENGTH {
        return false;
    }
    if data[..MAGIC_HEADER_LEN].iter().any(|&b| b != 0) {
        return false;
    }
    data[PACKET_TYPE_OFFSET] == PACKET_TYPE_DEVICE_ANNOUNCEMENT
}

/// Read a NUL-terminated (or field-width-truncated) ASCII/UTF-8 name field.
pub fn read_fixed_string(data: &[u8], offset: usize, len: usize) -> String {
    let field = &data[offset..offset + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

pub fn read_u16_be(data: &[u8], offset: usize) -> u16 {
    BigEndian::read_u16(&data[offset..offset + 2])
}
