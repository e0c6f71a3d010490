// sACN (E1.31) Protocol Implementation
// ANSI E1.31 - 2018 Streaming ACN Protocol

use std::net::Ipv4Addr;
use thiserror::Error;

/// sACN constants
pub const SACN_PORT: u16 = 5568;
pub const ACN_PACKET_IDENTIFIER: &[u8] = b"ASC-E1.17";

/// Root layer vector for E131_DATA_PACKET (bytes 18-21, big-endian)
const VECTOR_ROOT_DATA: u32 = 0x0000_0004;

/// Minimum DMP data packet: root + framing + DMP headers + start code
const SACN_DATA_MIN_LEN: usize = 126;

/// Source priority domain per E1.31-2018 (default 100)
pub const SACN_PRIORITY_MIN: u8 = 1;
pub const SACN_PRIORITY_MAX: u8 = 200;
pub const SACN_PRIORITY_DEFAULT: u8 = 100;

/// Parsed sACN DMX payload, borrowing from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SacnDmx<'a> {
    pub universe: u16,
    pub priority: u8,
    pub data: &'a [u8],
}

/// Result of parsing an sACN packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SacnPacket<'a> {
    Dmx(SacnDmx<'a>),
    /// Legitimate but unsupported: extended packets (sync, universe
    /// discovery) and non-null start codes
    Ignored,
}

/// Structural failures. The caller counts these; non-null start codes and
/// extended packets are `Ignored`, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SacnError {
    #[error("packet shorter than DMP data layout")]
    Truncated,
    #[error("missing ACN packet identifier")]
    BadId,
    #[error("property value count {0} out of range")]
    BadPropertyCount(u16),
}

/// Parse an sACN packet from raw bytes.
pub fn parse_sacn_packet(data: &[u8]) -> Result<SacnPacket<'_>, SacnError> {
    if data.len() < 22 {
        return Err(SacnError::Truncated);
    }

    // ACN packet identifier (offset 4)
    if &data[4..4 + ACN_PACKET_IDENTIFIER.len()] != ACN_PACKET_IDENTIFIER {
        return Err(SacnError::BadId);
    }

    // Root layer vector (bytes 18-21); anything but a data packet is an
    // extended packet (sync / universe discovery) and is skipped
    let root_vector = u32::from_be_bytes([data[18], data[19], data[20], data[21]]);
    if root_vector != VECTOR_ROOT_DATA {
        return Ok(SacnPacket::Ignored);
    }

    if data.len() < SACN_DATA_MIN_LEN {
        return Err(SacnError::Truncated);
    }

    // Priority (framing layer, byte 108), clamped to the legal domain
    let priority = data[108].clamp(SACN_PRIORITY_MIN, SACN_PRIORITY_MAX);

    // Universe (bytes 113-114, big-endian)
    let universe = u16::from_be_bytes([data[113], data[114]]);

    // DMP property value count (bytes 123-124): start code + channel data
    let prop_val_count = u16::from_be_bytes([data[123], data[124]]);
    if prop_val_count == 0 || prop_val_count > 513 {
        return Err(SacnError::BadPropertyCount(prop_val_count));
    }

    // Start code (byte 125): non-null start codes carry alternative data
    // (RDM, text packets) and are skipped without a malformed count
    let start_code = data[125];
    if start_code != 0 {
        return Ok(SacnPacket::Ignored);
    }

    // Channel data starts at byte 126
    let dmx_len = (prop_val_count as usize - 1)
        .min(512)
        .min(data.len() - SACN_DATA_MIN_LEN);

    Ok(SacnPacket::Dmx(SacnDmx {
        universe,
        priority,
        data: &data[SACN_DATA_MIN_LEN..SACN_DATA_MIN_LEN + dmx_len],
    }))
}

/// Calculate sACN multicast address for a universe
/// Format: 239.255.{high byte}.{low byte}
pub fn sacn_multicast_address(universe: u16) -> Ipv4Addr {
    Ipv4Addr::new(239, 255, (universe >> 8) as u8, (universe & 0xFF) as u8)
}
