//! Second Life packet serialization and deserialization
//!
//! Outbound packets are framed here once, without a sequence number; the
//! circuit stamps the sequence and appends acks at the moment of sending.

use crate::networking::packets::{self, AnyPacket, Packet, PacketType};
use crate::networking::{NetworkError, NetworkResult};
use bytes::{Bytes, BytesMut};

pub mod header;
pub mod packet_buffer;
pub mod zerocode;

pub use header::{PacketFlags, PacketHeader};
pub use packet_buffer::PacketBuffer;

/// Largest datagram the transport sends
pub const MTU: usize = 1200;

/// A framed packet waiting for its sequence number
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub packet_type: PacketType,
    pub reliable: bool,
    /// Whole datagram with sequence 0 and no ack trailer
    pub data: Bytes,
}

impl OutgoingPacket {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Packet serializer producing the exact Second Life datagram format
pub struct PacketSerializer;

impl PacketSerializer {
    /// Frame a packet for sending. Splittable packets that are oversized or
    /// carry more than 255 block items come back as several fragments of
    /// the same type, each within the MTU.
    pub fn build_outbound<P: Packet>(packet: &P) -> NetworkResult<Vec<OutgoingPacket>> {
        let prefix_len = header::PREFIX_LEN + P::FREQUENCY.message_number_len();
        let body_budget = MTU - prefix_len;

        let mut body = BytesMut::new();
        packet.encode_body(&mut body);

        // Splitting also runs for bodies that fit: a block count is one
        // byte, so a block over 255 items needs fragments regardless of size.
        let fragments = match (P::SPLITTABLE, body.len() <= body_budget) {
            (true, fits) => match packet.split(body_budget) {
                Some(fragments) => fragments,
                None if fits => return Ok(vec![Self::frame::<P>(&body)]),
                None => return Err(Self::oversized::<P>(body.len(), body_budget)),
            },
            (false, true) => return Ok(vec![Self::frame::<P>(&body)]),
            (false, false) => return Err(Self::oversized::<P>(body.len(), body_budget)),
        };

        let mut framed = Vec::with_capacity(fragments.len());
        for fragment in &fragments {
            body.clear();
            fragment.encode_body(&mut body);
            if body.len() > body_budget {
                return Err(NetworkError::PacketEncode {
                    reason: format!("{} fragment of {} bytes exceeds the MTU", P::name(), body.len()),
                });
            }
            framed.push(Self::frame::<P>(&body));
        }
        tracing::debug!("Split {} into {} fragments", P::name(), framed.len());
        Ok(framed)
    }

    fn oversized<P: Packet>(len: usize, budget: usize) -> NetworkError {
        NetworkError::PacketEncode {
            reason: format!("{} body is {} bytes, limit is {} and it cannot be split", P::name(), len, budget),
        }
    }

    fn frame<P: Packet>(body: &[u8]) -> OutgoingPacket {
        let mut flags = PacketFlags::empty();
        if P::RELIABLE {
            flags |= PacketFlags::RELIABLE;
        }
        if P::ZEROCODED {
            flags |= PacketFlags::ZEROCODED;
        }

        let mut buffer = BytesMut::with_capacity(MTU);
        PacketHeader::new(flags, 0).write_prefix(&mut buffer);
        P::FREQUENCY.write_message_number(P::ID, &mut buffer);
        buffer.extend_from_slice(body);

        OutgoingPacket {
            packet_type: P::TYPE,
            reliable: P::RELIABLE,
            data: zerocode::encode_packet(&buffer),
        }
    }

    /// Decode the message carried by a datagram whose header has already
    /// been parsed. `body` is the range returned by [`PacketHeader::decode`].
    pub fn decode_message(header: &PacketHeader, body: &[u8]) -> NetworkResult<AnyPacket> {
        if header.is_zerocoded() {
            packets::decode_message(&zerocode::decode(body)?)
        } else {
            packets::decode_message(body)
        }
    }

    /// Parse a full datagram
    pub fn decode(datagram: &[u8]) -> NetworkResult<(PacketHeader, AnyPacket)> {
        let (header, body) = PacketHeader::decode(datagram)?;
        let packet = Self::decode_message(&header, &datagram[body])?;
        Ok((header, packet))
    }
}
