//! Second Life packet definitions and the static dispatch table
//!
//! Every packet the transport understands is a plain struct implementing
//! [`Packet`]. The `packet_set!` list below turns that set into the
//! [`PacketType`] tag, the [`AnyPacket`] tagged union handed to handlers,
//! and a lookup table from wire message number to decoder that is built
//! once per process.

use crate::networking::serialization::PacketBuffer;
use crate::networking::{NetworkError, NetworkResult};
use bytes::{BufMut, BytesMut};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::OnceLock;

pub mod messages;
pub mod types;

pub use messages::*;

/// Packet frequency determines the message number encoding size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketFrequency {
    /// `id` (1 byte)
    High,
    /// `FF id`
    Medium,
    /// `FF FF hi lo`
    Low,
    /// `FF FF FF id`
    Fixed,
}

impl PacketFrequency {
    pub fn message_number_len(self) -> usize {
        match self {
            PacketFrequency::High => 1,
            PacketFrequency::Medium => 2,
            PacketFrequency::Low | PacketFrequency::Fixed => 4,
        }
    }

    pub fn write_message_number(self, id: u16, buffer: &mut BytesMut) {
        match self {
            PacketFrequency::High => buffer.put_u8(id as u8),
            PacketFrequency::Medium => {
                buffer.put_u8(0xFF);
                buffer.put_u8(id as u8);
            }
            PacketFrequency::Low => {
                buffer.put_u16(0xFFFF);
                buffer.put_u16(id);
            }
            PacketFrequency::Fixed => {
                buffer.put_u16(0xFFFF);
                buffer.put_u8(0xFF);
                buffer.put_u8(id as u8);
            }
        }
    }

    pub fn read_message_number(buffer: &mut PacketBuffer<'_>) -> NetworkResult<(PacketFrequency, u16)> {
        let first = buffer.get_u8()?;
        if first != 0xFF {
            return Ok((PacketFrequency::High, first as u16));
        }
        let second = buffer.get_u8()?;
        if second != 0xFF {
            return Ok((PacketFrequency::Medium, second as u16));
        }
        let hi = buffer.get_u8()?;
        let lo = buffer.get_u8()?;
        if hi == 0xFF {
            Ok((PacketFrequency::Fixed, lo as u16))
        } else {
            Ok((PacketFrequency::Low, u16::from_be_bytes([hi, lo])))
        }
    }
}

/// Core packet trait implemented by every known packet body.
pub trait Packet: Debug + Clone + Send + Sync + Into<AnyPacket> + 'static {
    /// Identifier within its frequency range
    const ID: u16;

    const FREQUENCY: PacketFrequency;

    /// Whether this packet is sent reliably by default
    const RELIABLE: bool;

    /// Whether the body is zerocoded on send
    const ZEROCODED: bool;

    /// Whether an oversized packet may be split across several datagrams
    const SPLITTABLE: bool = false;

    const TYPE: PacketType;

    fn name() -> &'static str {
        Self::TYPE.name()
    }

    /// Write the body (everything after the message number)
    fn encode_body(&self, buffer: &mut BytesMut);

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self>;

    /// Split into fragments whose bodies each fit `body_budget` bytes.
    /// `None` means the packet goes out as-is.
    fn split(&self, _body_budget: usize) -> Option<Vec<Self>> {
        None
    }

    fn lookup_key() -> (PacketFrequency, u16) {
        (Self::FREQUENCY, Self::ID)
    }
}

type Decoder = for<'a, 'b> fn(&'a mut PacketBuffer<'b>) -> NetworkResult<AnyPacket>;

/// Dispatch table entry
#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub name: &'static str,
    pub packet_type: PacketType,
    pub id: u16,
    pub frequency: PacketFrequency,
    pub reliable: bool,
    pub zerocoded: bool,
    pub splittable: bool,
    decoder: Decoder,
}

#[derive(Default)]
struct Registry {
    by_number: HashMap<(PacketFrequency, u16), PacketInfo>,
}

impl Registry {
    fn register<P: Packet>(&mut self) {
        self.by_number.insert(
            P::lookup_key(),
            PacketInfo {
                name: P::name(),
                packet_type: P::TYPE,
                id: P::ID,
                frequency: P::FREQUENCY,
                reliable: P::RELIABLE,
                zerocoded: P::ZEROCODED,
                splittable: P::SPLITTABLE,
                decoder: decode_any::<P>,
            },
        );
    }
}

fn decode_any<P: Packet>(buffer: &mut PacketBuffer<'_>) -> NetworkResult<AnyPacket> {
    P::decode_body(buffer).map(Into::into)
}

static PACKET_REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    PACKET_REGISTRY.get_or_init(build_registry)
}

/// Look up packet information by message number
pub fn get_packet_info(frequency: PacketFrequency, id: u16) -> Option<&'static PacketInfo> {
    registry().by_number.get(&(frequency, id))
}

/// Decode a message starting at its message number. `bytes` must already
/// be zero-decoded.
pub fn decode_message(bytes: &[u8]) -> NetworkResult<AnyPacket> {
    let mut buffer = PacketBuffer::new(bytes);
    let (frequency, id) = PacketFrequency::read_message_number(&mut buffer)?;
    let info = get_packet_info(frequency, id)
        .ok_or(NetworkError::UnknownPacket { id, frequency })?;
    let packet = (info.decoder)(&mut buffer)?;
    if buffer.has_remaining() {
        tracing::trace!("{}: ignoring {} trailing bytes", info.name, buffer.remaining());
    }
    Ok(packet)
}

macro_rules! packet_set {
    ($($name:ident),* $(,)?) => {
        /// Tag for every packet type the transport can decode
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum PacketType {
            $($name),*
        }

        impl PacketType {
            pub const ALL: &'static [PacketType] = &[$(PacketType::$name),*];

            pub fn name(self) -> &'static str {
                match self {
                    $(PacketType::$name => stringify!($name)),*
                }
            }

            pub fn id(self) -> u16 {
                match self {
                    $(PacketType::$name => <$name as Packet>::ID),*
                }
            }

            pub fn frequency(self) -> PacketFrequency {
                match self {
                    $(PacketType::$name => <$name as Packet>::FREQUENCY),*
                }
            }

            pub fn is_reliable(self) -> bool {
                match self {
                    $(PacketType::$name => <$name as Packet>::RELIABLE),*
                }
            }

            pub fn is_zerocoded(self) -> bool {
                match self {
                    $(PacketType::$name => <$name as Packet>::ZEROCODED),*
                }
            }

            pub fn is_splittable(self) -> bool {
                match self {
                    $(PacketType::$name => <$name as Packet>::SPLITTABLE),*
                }
            }
        }

        /// A decoded packet of any known type
        #[derive(Debug, Clone)]
        pub enum AnyPacket {
            $($name($name)),*
        }

        impl AnyPacket {
            pub fn packet_type(&self) -> PacketType {
                match self {
                    $(AnyPacket::$name(_) => PacketType::$name),*
                }
            }

            pub fn encode_body(&self, buffer: &mut BytesMut) {
                match self {
                    $(AnyPacket::$name(packet) => packet.encode_body(buffer)),*
                }
            }

            fn as_any(&self) -> &dyn Any {
                match self {
                    $(AnyPacket::$name(packet) => packet as &dyn Any),*
                }
            }
        }

        $(
            impl From<$name> for AnyPacket {
                fn from(packet: $name) -> Self {
                    AnyPacket::$name(packet)
                }
            }
        )*

        fn build_registry() -> Registry {
            let mut registry = Registry::default();
            $(registry.register::<$name>();)*
            registry
        }
    };
}

packet_set! {
    PacketAck,
    StartPingCheck,
    CompletePingCheck,
    UseCircuitCode,
    CompleteAgentMovement,
    LogoutRequest,
    LogoutReply,
    EnableSimulator,
    DisableSimulator,
    CloseCircuit,
    KickUser,
    RegionHandshake,
    RegionHandshakeReply,
    UUIDNameRequest,
    UUIDNameReply,
}

impl AnyPacket {
    pub fn name(&self) -> &'static str {
        self.packet_type().name()
    }

    /// Borrow the concrete packet if this is a `P`
    pub fn downcast_ref<P: Packet>(&self) -> Option<&P> {
        self.as_any().downcast_ref::<P>()
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_message_number_encodings() {
        for (frequency, id, expected) in [
            (PacketFrequency::High, 1u16, vec![0x01]),
            (PacketFrequency::Medium, 7, vec![0xFF, 0x07]),
            (PacketFrequency::Low, 249, vec![0xFF, 0xFF, 0x00, 0xF9]),
            (PacketFrequency::Fixed, 0xFB, vec![0xFF, 0xFF, 0xFF, 0xFB]),
        ] {
            let mut buffer = BytesMut::new();
            frequency.write_message_number(id, &mut buffer);
            assert_eq!(buffer.as_ref(), expected.as_slice());
            assert_eq!(buffer.len(), frequency.message_number_len());

            let mut reader = PacketBuffer::new(&buffer);
            assert_eq!(PacketFrequency::read_message_number(&mut reader).unwrap(), (frequency, id));
        }
    }

    #[test]
    fn test_registry_covers_every_type() {
        for packet_type in PacketType::ALL {
            let info = get_packet_info(packet_type.frequency(), packet_type.id())
                .unwrap_or_else(|| panic!("{} not registered", packet_type));
            assert_eq!(info.packet_type, *packet_type);
            assert_eq!(info.name, packet_type.name());
        }
    }

    #[test]
    fn test_decode_message_dispatches_by_number() {
        let packet = CompleteAgentMovement {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            circuit_code: 1234,
        };
        let mut buffer = BytesMut::new();
        CompleteAgentMovement::FREQUENCY.write_message_number(CompleteAgentMovement::ID, &mut buffer);
        packet.encode_body(&mut buffer);

        let decoded = decode_message(&buffer).unwrap();
        assert_eq!(decoded.packet_type(), PacketType::CompleteAgentMovement);
        assert_eq!(decoded.downcast_ref::<CompleteAgentMovement>(), Some(&packet));
        assert!(decoded.downcast_ref::<LogoutRequest>().is_none());
    }

    #[test]
    fn test_unknown_number_is_reported() {
        let err = decode_message(&[0xFF, 0xFF, 0x7F, 0x00]).unwrap_err();
        assert!(matches!(err, NetworkError::UnknownPacket { id: 0x7F00, frequency: PacketFrequency::Low }));
    }

    #[test]
    fn test_truncated_body_is_decode_error() {
        // StartPingCheck needs five body bytes
        let err = decode_message(&[0x01, 0x05, 0x00]).unwrap_err();
        assert!(matches!(err, NetworkError::PacketDecode { .. }));
    }
}
