//! LLUDP packet header
//!
//! ```text
//! [flags:1][sequence:4 BE][extra_len:1][extra][message number][body][acks: 4 BE each][ack_count:1]
//! ```
//!
//! The ack trailer is only present when the ACK flag is set.

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use crate::networking::{NetworkError, NetworkResult};
use std::ops::Range;

/// flags + sequence + extra length
pub const PREFIX_LEN: usize = 6;
/// Trailing byte holding the number of appended acks
pub const ACK_COUNT_LEN: usize = 1;
/// One appended ack
pub const ACK_LEN: usize = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        const ZEROCODED = 0x80;
        const RELIABLE = 0x40;
        const RESENT = 0x20;
        const ACK = 0x10;
    }
}

/// Decoded header of one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: u32,
    pub extra: Bytes,
    pub acks: Vec<u32>,
}

impl PacketHeader {
    pub fn new(flags: PacketFlags, sequence: u32) -> Self {
        Self { flags, sequence, extra: Bytes::new(), acks: Vec::new() }
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn is_resent(&self) -> bool {
        self.flags.contains(PacketFlags::RESENT)
    }

    pub fn is_zerocoded(&self) -> bool {
        self.flags.contains(PacketFlags::ZEROCODED)
    }

    /// Parse the prefix and, if present, the ack trailer. Returns the header
    /// and the byte range of the (possibly zerocoded) body, which starts at
    /// the message number.
    pub fn decode(datagram: &[u8]) -> NetworkResult<(PacketHeader, Range<usize>)> {
        if datagram.len() < PREFIX_LEN {
            return Err(NetworkError::Truncated {
                reason: format!("{} bytes is shorter than the packet prefix", datagram.len()),
            });
        }

        let flags = PacketFlags::from_bits_retain(datagram[0]);
        let sequence = BigEndian::read_u32(&datagram[1..5]);
        let extra_len = datagram[5] as usize;
        let body_start = PREFIX_LEN + extra_len;
        if body_start > datagram.len() {
            return Err(NetworkError::Truncated {
                reason: format!("extra header of {} bytes overruns datagram", extra_len),
            });
        }
        let extra = Bytes::copy_from_slice(&datagram[PREFIX_LEN..body_start]);

        let mut body_end = datagram.len();
        let mut acks = Vec::new();
        if flags.contains(PacketFlags::ACK) {
            if body_end <= body_start {
                return Err(NetworkError::Truncated {
                    reason: "ACK flag set but no ack count".to_string(),
                });
            }
            let count = datagram[body_end - 1] as usize;
            let trailer = count * ACK_LEN + ACK_COUNT_LEN;
            if body_start + trailer > body_end {
                return Err(NetworkError::Truncated {
                    reason: format!("{} appended acks overrun datagram", count),
                });
            }
            body_end -= trailer;
            acks = datagram[body_end..body_end + count * ACK_LEN]
                .chunks_exact(ACK_LEN)
                .map(BigEndian::read_u32)
                .collect();
        }

        Ok((PacketHeader { flags, sequence, extra, acks }, body_start..body_end))
    }

    /// Write flags, sequence and extra header. Acks are appended separately
    /// once the final datagram size is known.
    pub fn write_prefix(&self, buffer: &mut BytesMut) {
        buffer.put_u8(self.flags.bits());
        buffer.put_u32(self.sequence);
        buffer.put_u8(self.extra.len() as u8);
        buffer.extend_from_slice(&self.extra);
    }
}

/// Append an ack trailer to a finished datagram and set its ACK flag.
pub fn append_acks(datagram: &mut BytesMut, acks: &[u32]) {
    if acks.is_empty() || datagram.is_empty() {
        return;
    }
    let count = acks.len().min(u8::MAX as usize);
    for ack in &acks[..count] {
        datagram.put_u32(*ack);
    }
    datagram.put_u8(count as u8);
    datagram[0] |= PacketFlags::ACK.bits();
}

/// Overwrite the sequence number of an already-built datagram.
pub fn stamp_sequence(datagram: &mut [u8], sequence: u32) {
    if datagram.len() >= PREFIX_LEN {
        BigEndian::write_u32(&mut datagram[1..5], sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_header() {
        let datagram = [0x40, 0x00, 0x00, 0x01, 0x02, 0x00, 0xFF, 0xFF, 0x00, 0x03, 0xAA];
        let (header, body) = PacketHeader::decode(&datagram).unwrap();
        assert!(header.is_reliable());
        assert!(!header.is_resent());
        assert_eq!(header.sequence, 0x0102);
        assert!(header.acks.is_empty());
        assert_eq!(body, 6..11);
    }

    #[test]
    fn test_decode_extra_and_acks() {
        let datagram = [
            0x10, 0, 0, 0, 9, // flags, sequence
            2, 0xEE, 0xEE, // extra header
            0x01, 0x42, // message number and body
            0, 0, 0, 5, 0, 0, 1, 0, // two acks
            2,
        ];
        let (header, body) = PacketHeader::decode(&datagram).unwrap();
        assert_eq!(header.extra.as_ref(), &[0xEE, 0xEE]);
        assert_eq!(header.acks, vec![5, 256]);
        assert_eq!(&datagram[body], &[0x01, 0x42]);
    }

    #[test]
    fn test_truncated_inputs() {
        assert!(matches!(PacketHeader::decode(&[0x40, 0, 0]), Err(NetworkError::Truncated { .. })));
        // extra length overruns
        assert!(PacketHeader::decode(&[0x00, 0, 0, 0, 1, 9, 1]).is_err());
        // claims 3 acks but only carries one
        assert!(PacketHeader::decode(&[0x10, 0, 0, 0, 1, 0, 1, 0, 0, 0, 1, 3]).is_err());
    }

    #[test]
    fn test_write_prefix_and_append_acks() {
        let mut header = PacketHeader::new(PacketFlags::RELIABLE, 7);
        header.extra = Bytes::from_static(&[1]);
        let mut buffer = BytesMut::new();
        header.write_prefix(&mut buffer);
        buffer.put_u8(0x01);
        append_acks(&mut buffer, &[3, 4]);

        let (decoded, body) = PacketHeader::decode(&buffer).unwrap();
        assert!(decoded.flags.contains(PacketFlags::RELIABLE | PacketFlags::ACK));
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.acks, vec![3, 4]);
        assert_eq!(&buffer[body], &[0x01]);

        stamp_sequence(&mut buffer, 99);
        assert_eq!(PacketHeader::decode(&buffer).unwrap().0.sequence, 99);
    }
}
