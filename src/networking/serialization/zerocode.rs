//! Second Life zerocoding
//!
//! Runs of zero bytes in a packet body are replaced by `0x00 n`, where `n`
//! is the run length (1..=255). Only the body is coded: the 6-byte prefix,
//! the extra header and the appended-ack trailer always travel verbatim.

use super::header::{PacketFlags, PacketHeader, ACK_COUNT_LEN, PREFIX_LEN};
use crate::networking::{NetworkError, NetworkResult};
use bytes::{BufMut, Bytes, BytesMut};

/// Largest body a zerocoded packet may expand to, the size of the
/// receive buffer
pub const MAX_DECODED_LEN: usize = 8192;

/// Encode a body. A single zero becomes `00 01`, longer runs are split
/// every 255 bytes.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        if data[i] == 0 {
            let mut run = 0usize;
            while i < data.len() && data[i] == 0 && run < 255 {
                run += 1;
                i += 1;
            }
            result.push(0x00);
            result.push(run as u8);
        } else {
            result.push(data[i]);
            i += 1;
        }
    }

    result
}

/// Decode a zerocoded body. `00 00` expands to nothing; a `00` with no
/// count byte after it is a truncated packet. Expansion past
/// [`MAX_DECODED_LEN`] is rejected.
pub fn decode(data: &[u8]) -> NetworkResult<Vec<u8>> {
    let mut result = Vec::with_capacity(data.len() * 2);
    let mut i = 0;

    while i < data.len() {
        if data[i] == 0x00 {
            let count = *data.get(i + 1).ok_or_else(|| NetworkError::Truncated {
                reason: "zerocode run without a count byte".to_string(),
            })?;
            let expanded = result.len() + count as usize;
            if expanded > MAX_DECODED_LEN {
                return Err(NetworkError::PacketDecode {
                    reason: format!("zerocoded body expands past {} bytes", MAX_DECODED_LEN),
                });
            }
            result.resize(expanded, 0);
            i += 2;
        } else {
            if result.len() == MAX_DECODED_LEN {
                return Err(NetworkError::PacketDecode {
                    reason: format!("zerocoded body expands past {} bytes", MAX_DECODED_LEN),
                });
            }
            result.push(data[i]);
            i += 1;
        }
    }

    Ok(result)
}

/// Expand a whole datagram. Prefix and ack trailer are copied as-is, the
/// body in between is decoded when the ZEROCODED flag is set.
pub fn decode_packet(datagram: &[u8]) -> NetworkResult<Vec<u8>> {
    let (header, body) = PacketHeader::decode(datagram)?;
    if !header.flags.contains(PacketFlags::ZEROCODED) {
        return Ok(datagram.to_vec());
    }

    let decoded = decode(&datagram[body.clone()])?;
    let mut result = Vec::with_capacity(datagram.len() + decoded.len());
    result.extend_from_slice(&datagram[..body.start]);
    result.extend_from_slice(&decoded);
    result.extend_from_slice(&datagram[body.end..]);
    Ok(result)
}

/// Zerocode an outgoing datagram that carries no ack trailer yet.
///
/// Nothing happens unless the ZEROCODED flag is set. If coding would not
/// shrink the body, the plain datagram is returned with the flag cleared.
pub fn encode_packet(datagram: &[u8]) -> Bytes {
    let Some(&flags) = datagram.first() else {
        return Bytes::new();
    };
    if flags & PacketFlags::ZEROCODED.bits() == 0 || datagram.len() < PREFIX_LEN {
        return Bytes::copy_from_slice(datagram);
    }

    let body_start = (PREFIX_LEN + datagram[PREFIX_LEN - 1] as usize).min(datagram.len());
    let body = &datagram[body_start..];
    let encoded = encode(body);

    let mut out = BytesMut::with_capacity(body_start + encoded.len() + ACK_COUNT_LEN);
    if encoded.len() <= body.len() {
        out.extend_from_slice(&datagram[..body_start]);
        out.extend_from_slice(&encoded);
    } else {
        out.put_u8(flags & !PacketFlags::ZEROCODED.bits());
        out.extend_from_slice(&datagram[1..]);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_zeros() {
        let data = vec![1, 2, 3, 4, 5];
        let encoded = encode(&data);
        assert_eq!(encoded, data);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_single_zero() {
        let data = vec![1, 0, 2];
        let encoded = encode(&data);
        assert_eq!(encoded, vec![1, 0, 1, 2]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_multiple_zeros() {
        let data = vec![1, 0, 0, 0, 2];
        let encoded = encode(&data);
        assert_eq!(encoded, vec![1, 0, 3, 2]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_max_zeros() {
        let data = vec![0; 255];
        assert_eq!(encode(&data), vec![0, 255]);
    }

    #[test]
    fn test_overflow_zeros() {
        let data = vec![0; 300];
        let encoded = encode(&data);
        assert_eq!(encoded, vec![0, 255, 0, 45]);
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_empty_run_decodes_to_nothing() {
        assert_eq!(decode(&[7, 0, 0, 8]).unwrap(), vec![7, 8]);
    }

    #[test]
    fn test_dangling_zero_is_truncated() {
        assert!(matches!(decode(&[1, 2, 0]), Err(NetworkError::Truncated { .. })));
    }

    #[test]
    fn test_expansion_is_bounded() {
        // 600 maximal runs would inflate one datagram to ~150 KB
        let bomb: Vec<u8> = std::iter::repeat([0x00, 0xFF]).take(600).flatten().collect();
        assert!(matches!(decode(&bomb), Err(NetworkError::PacketDecode { .. })));

        let fits: Vec<u8> = std::iter::repeat([0x00, 0xFF]).take(MAX_DECODED_LEN / 255).flatten().collect();
        assert_eq!(decode(&fits).unwrap().len(), MAX_DECODED_LEN / 255 * 255);
    }

    #[test]
    fn test_encode_packet_codes_body_only() {
        // flags, seq 0x00000005, no extra, then body with a zero run
        let datagram = [0xC0, 0, 0, 0, 5, 0, 0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 9];
        let coded = encode_packet(&datagram);
        assert_eq!(&coded[..6], &datagram[..6]);
        assert_eq!(&coded[6..], &[0xFF, 0xFF, 0, 6, 9]);

        let restored = decode_packet(&coded).unwrap();
        assert_eq!(restored, datagram.to_vec());
    }

    #[test]
    fn test_encode_packet_falls_back_when_larger() {
        // Isolated zeros double in size, so the flag must be dropped
        let datagram = [0x80, 0, 0, 0, 1, 0, 1, 0, 2, 0, 3, 0, 4];
        let coded = encode_packet(&datagram);
        assert_eq!(coded[0], 0x00);
        assert_eq!(&coded[1..], &datagram[1..]);
    }

    #[test]
    fn test_encode_packet_ignores_plain_packets() {
        let datagram = [0x40, 0, 0, 0, 1, 0, 1, 0, 0, 0, 0];
        assert_eq!(&encode_packet(&datagram)[..], &datagram[..]);
    }

    #[test]
    fn test_decode_packet_keeps_ack_trailer_verbatim() {
        // zerocoded body "01 00 03" (= 01 00 00 00) followed by one appended ack
        let datagram = [0x90, 0, 0, 0, 2, 0, 0x01, 0x00, 0x03, 0, 0, 0, 7, 1];
        let restored = decode_packet(&datagram).unwrap();
        assert_eq!(restored, vec![0x90, 0, 0, 0, 2, 0, 1, 0, 0, 0, 0, 0, 0, 7, 1]);
    }
}
