//! Minimal SNTP client packet handling

use crate::BoardError;

pub const NTP_PORT: u16 = 123;
pub const PACKET_LEN: usize = 48;

/// Seconds between 1900-01-01 and 1970-01-01
const NTP_UNIX_OFFSET: u32 = 2_208_988_800;

/// LI 0, version 4, mode 3 (client)
const CLIENT_HEADER: u8 = 0b00_100_011;

pub fn build_request() -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = CLIENT_HEADER;
    packet
}

/// Unix seconds from a server reply
pub fn parse_reply(packet: &[u8]) -> Result<u32, BoardError> {
    if packet.len() < PACKET_LEN {
        return Err(BoardError::ProtocolError);
    }

    let mode = packet[0] & 0x07;
    let stratum = packet[1];
    // 4 = server, 5 = broadcast; stratum 0 is a kiss-o'-death
    if !(mode == 4 || mode == 5) || stratum == 0 {
        return Err(BoardError::ProtocolError);
    }

    let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]);
    if seconds == 0 {
        return Err(BoardError::ProtocolError);
    }
    seconds
        .checked_sub(NTP_UNIX_OFFSET)
        .ok_or(BoardError::ProtocolError)
}
