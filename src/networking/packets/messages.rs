//! Packet bodies used by the transport layer
//!
//! Field layouts follow the simulator message template. Only the
//! circuit-management and region-crossing messages live here; feature
//! packets are layered on top by their managers.

use super::types::{string1_len, PutFields};
use super::{Packet, PacketFrequency, PacketType};
use crate::networking::serialization::PacketBuffer;
use crate::networking::NetworkResult;
use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;
use uuid::Uuid;

const UUID_LEN: usize = 16;

/// Group the items of a Variable block into fragments whose bodies fit
/// `budget`. `fixed_len` is the size of the rest of the body, the block
/// count byte is accounted for here. Returns `None` when one fragment is
/// enough or a single item can never fit.
fn split_block<T: Clone>(
    fixed_len: usize,
    items: &[T],
    item_len: impl Fn(&T) -> usize,
    budget: usize,
) -> Option<Vec<Vec<T>>> {
    let room = budget.checked_sub(fixed_len + 1)?;
    let mut chunks = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut used = 0;

    for item in items {
        let len = item_len(item);
        if len > room {
            return None;
        }
        if used + len > room || current.len() == u8::MAX as usize {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        used += len;
        current.push(item.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    if chunks.len() > 1 { Some(chunks) } else { None }
}

fn put_block<T>(buffer: &mut BytesMut, items: &[T], mut put: impl FnMut(&mut BytesMut, &T)) {
    let count = items.len().min(u8::MAX as usize);
    buffer.put_u8(count as u8);
    for item in &items[..count] {
        put(buffer, item);
    }
}

fn get_block<T>(
    buffer: &mut PacketBuffer<'_>,
    mut get: impl FnMut(&mut PacketBuffer<'_>) -> NetworkResult<T>,
) -> NetworkResult<Vec<T>> {
    let count = buffer.get_block_count()?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(get(buffer)?);
    }
    Ok(items)
}

/// Acknowledges reliable packets by sequence number
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PacketAck {
    pub packets: Vec<u32>,
}

impl Packet for PacketAck {
    const ID: u16 = 0xFB;
    const FREQUENCY: PacketFrequency = PacketFrequency::Fixed;
    const RELIABLE: bool = false;
    const ZEROCODED: bool = false;
    const SPLITTABLE: bool = true;
    const TYPE: PacketType = PacketType::PacketAck;

    fn encode_body(&self, buffer: &mut BytesMut) {
        put_block(buffer, &self.packets, |b, id| b.put_u32_le(*id));
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self { packets: get_block(buffer, |b| b.get_u32())? })
    }

    fn split(&self, body_budget: usize) -> Option<Vec<Self>> {
        let chunks = split_block(0, &self.packets, |_| 4, body_budget)?;
        Some(chunks.into_iter().map(|packets| Self { packets }).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StartPingCheck {
    pub ping_id: u8,
    /// Oldest sequence still waiting for an ack, so the peer can trim its
    /// duplicate filter
    pub oldest_unacked: u32,
}

impl Packet for StartPingCheck {
    const ID: u16 = 1;
    const FREQUENCY: PacketFrequency = PacketFrequency::High;
    const RELIABLE: bool = false;
    const ZEROCODED: bool = false;
    const TYPE: PacketType = PacketType::StartPingCheck;

    fn encode_body(&self, buffer: &mut BytesMut) {
        buffer.put_u8(self.ping_id);
        buffer.put_u32_le(self.oldest_unacked);
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self { ping_id: buffer.get_u8()?, oldest_unacked: buffer.get_u32()? })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletePingCheck {
    pub ping_id: u8,
}

impl Packet for CompletePingCheck {
    const ID: u16 = 2;
    const FREQUENCY: PacketFrequency = PacketFrequency::High;
    const RELIABLE: bool = false;
    const ZEROCODED: bool = false;
    const TYPE: PacketType = PacketType::CompletePingCheck;

    fn encode_body(&self, buffer: &mut BytesMut) {
        buffer.put_u8(self.ping_id);
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self { ping_id: buffer.get_u8()? })
    }
}

/// First packet on a new circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseCircuitCode {
    pub code: u32,
    pub session_id: Uuid,
    pub id: Uuid,
}

impl Packet for UseCircuitCode {
    const ID: u16 = 3;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;
    const TYPE: PacketType = PacketType::UseCircuitCode;

    fn encode_body(&self, buffer: &mut BytesMut) {
        buffer.put_u32_le(self.code);
        buffer.put_uuid(&self.session_id);
        buffer.put_uuid(&self.id);
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            code: buffer.get_u32()?,
            session_id: buffer.get_uuid()?,
            id: buffer.get_uuid()?,
        })
    }
}

/// Completes arrival in the region the agent logged into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompleteAgentMovement {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}

impl Packet for CompleteAgentMovement {
    const ID: u16 = 249;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;
    const TYPE: PacketType = PacketType::CompleteAgentMovement;

    fn encode_body(&self, buffer: &mut BytesMut) {
        buffer.put_uuid(&self.agent_id);
        buffer.put_uuid(&self.session_id);
        buffer.put_u32_le(self.circuit_code);
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            agent_id: buffer.get_uuid()?,
            session_id: buffer.get_uuid()?,
            circuit_code: buffer.get_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogoutRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

impl Packet for LogoutRequest {
    const ID: u16 = 252;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;
    const TYPE: PacketType = PacketType::LogoutRequest;

    fn encode_body(&self, buffer: &mut BytesMut) {
        buffer.put_uuid(&self.agent_id);
        buffer.put_uuid(&self.session_id);
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self { agent_id: buffer.get_uuid()?, session_id: buffer.get_uuid()? })
    }
}

/// Logout acknowledgement; lists inventory items the server wants flushed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutReply {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub item_ids: Vec<Uuid>,
}

impl Packet for LogoutReply {
    const ID: u16 = 253;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;
    const SPLITTABLE: bool = true;
    const TYPE: PacketType = PacketType::LogoutReply;

    fn encode_body(&self, buffer: &mut BytesMut) {
        buffer.put_uuid(&self.agent_id);
        buffer.put_uuid(&self.session_id);
        put_block(buffer, &self.item_ids, |b, id| b.put_uuid(id));
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            agent_id: buffer.get_uuid()?,
            session_id: buffer.get_uuid()?,
            item_ids: get_block(buffer, |b| b.get_uuid())?,
        })
    }

    fn split(&self, body_budget: usize) -> Option<Vec<Self>> {
        let chunks = split_block(2 * UUID_LEN, &self.item_ids, |_| UUID_LEN, body_budget)?;
        Some(
            chunks
                .into_iter()
                .map(|item_ids| Self { agent_id: self.agent_id, session_id: self.session_id, item_ids })
                .collect(),
        )
    }
}

/// Server asks the client to open a circuit to a neighbouring simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnableSimulator {
    pub handle: u64,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Packet for EnableSimulator {
    const ID: u16 = 151;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;
    const TYPE: PacketType = PacketType::EnableSimulator;

    fn encode_body(&self, buffer: &mut BytesMut) {
        buffer.put_u64_le(self.handle);
        buffer.put_ipaddr(self.ip);
        buffer.put_ipport(self.port);
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            handle: buffer.get_u64()?,
            ip: buffer.get_ipv4()?,
            port: buffer.get_ipport()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisableSimulator;

impl Packet for DisableSimulator {
    const ID: u16 = 152;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;
    const TYPE: PacketType = PacketType::DisableSimulator;

    fn encode_body(&self, _buffer: &mut BytesMut) {}

    fn decode_body(_buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self)
    }
}

/// Best-effort notice that the circuit is going away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseCircuit;

impl Packet for CloseCircuit {
    const ID: u16 = 0xFD;
    const FREQUENCY: PacketFrequency = PacketFrequency::Fixed;
    const RELIABLE: bool = false;
    const ZEROCODED: bool = false;
    const TYPE: PacketType = PacketType::CloseCircuit;

    fn encode_body(&self, _buffer: &mut BytesMut) {}

    fn decode_body(_buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KickUser {
    pub target_ip: Ipv4Addr,
    pub target_port: u16,
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub reason: String,
}

impl Packet for KickUser {
    const ID: u16 = 163;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;
    const TYPE: PacketType = PacketType::KickUser;

    fn encode_body(&self, buffer: &mut BytesMut) {
        buffer.put_ipaddr(self.target_ip);
        buffer.put_ipport(self.target_port);
        buffer.put_uuid(&self.agent_id);
        buffer.put_uuid(&self.session_id);
        buffer.put_string2(&self.reason);
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            target_ip: buffer.get_ipv4()?,
            target_port: buffer.get_ipport()?,
            agent_id: buffer.get_uuid()?,
            session_id: buffer.get_uuid()?,
            reason: buffer.get_string2()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionInfo4 {
    pub region_flags_extended: u64,
    pub region_protocols: u64,
}

/// Region description sent once the circuit is up
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegionHandshake {
    pub region_flags: u32,
    pub sim_access: u8,
    pub sim_name: String,
    pub sim_owner: Uuid,
    pub is_estate_manager: bool,
    pub water_height: f32,
    pub billable_factor: f32,
    pub cache_id: Uuid,
    pub terrain_base: [Uuid; 4],
    pub terrain_detail: [Uuid; 4],
    pub terrain_start_height: [f32; 4],
    pub terrain_height_range: [f32; 4],
    pub region_id: Uuid,
    pub cpu_class_id: i32,
    pub cpu_ratio: i32,
    pub colo_name: String,
    pub product_sku: String,
    pub product_name: String,
    pub region_info4: Vec<RegionInfo4>,
}

impl Packet for RegionHandshake {
    const ID: u16 = 148;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = true;
    const TYPE: PacketType = PacketType::RegionHandshake;

    fn encode_body(&self, buffer: &mut BytesMut) {
        buffer.put_u32_le(self.region_flags);
        buffer.put_u8(self.sim_access);
        buffer.put_string1(&self.sim_name);
        buffer.put_uuid(&self.sim_owner);
        buffer.put_bool(self.is_estate_manager);
        buffer.put_f32_le(self.water_height);
        buffer.put_f32_le(self.billable_factor);
        buffer.put_uuid(&self.cache_id);
        for id in self.terrain_base.iter().chain(&self.terrain_detail) {
            buffer.put_uuid(id);
        }
        for value in self.terrain_start_height.iter().chain(&self.terrain_height_range) {
            buffer.put_f32_le(*value);
        }
        buffer.put_uuid(&self.region_id);
        buffer.put_i32_le(self.cpu_class_id);
        buffer.put_i32_le(self.cpu_ratio);
        buffer.put_string1(&self.colo_name);
        buffer.put_string1(&self.product_sku);
        buffer.put_string1(&self.product_name);
        put_block(buffer, &self.region_info4, |b, info| {
            b.put_u64_le(info.region_flags_extended);
            b.put_u64_le(info.region_protocols);
        });
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        let mut handshake = Self {
            region_flags: buffer.get_u32()?,
            sim_access: buffer.get_u8()?,
            sim_name: buffer.get_string1()?,
            sim_owner: buffer.get_uuid()?,
            is_estate_manager: buffer.get_bool()?,
            water_height: buffer.get_f32()?,
            billable_factor: buffer.get_f32()?,
            cache_id: buffer.get_uuid()?,
            ..Default::default()
        };
        for slot in handshake.terrain_base.iter_mut().chain(handshake.terrain_detail.iter_mut()) {
            *slot = buffer.get_uuid()?;
        }
        for slot in handshake
            .terrain_start_height
            .iter_mut()
            .chain(handshake.terrain_height_range.iter_mut())
        {
            *slot = buffer.get_f32()?;
        }
        handshake.region_id = buffer.get_uuid()?;
        handshake.cpu_class_id = buffer.get_i32()?;
        handshake.cpu_ratio = buffer.get_i32()?;
        handshake.colo_name = buffer.get_string1()?;
        handshake.product_sku = buffer.get_string1()?;
        handshake.product_name = buffer.get_string1()?;
        // Older simulators stop before RegionInfo4
        if buffer.has_remaining() {
            handshake.region_info4 = get_block(buffer, |b| {
                Ok(RegionInfo4 { region_flags_extended: b.get_u64()?, region_protocols: b.get_u64()? })
            })?;
        }
        Ok(handshake)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHandshakeReply {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub flags: u32,
}

impl Packet for RegionHandshakeReply {
    const ID: u16 = 149;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = true;
    const TYPE: PacketType = PacketType::RegionHandshakeReply;

    fn encode_body(&self, buffer: &mut BytesMut) {
        buffer.put_uuid(&self.agent_id);
        buffer.put_uuid(&self.session_id);
        buffer.put_u32_le(self.flags);
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            agent_id: buffer.get_uuid()?,
            session_id: buffer.get_uuid()?,
            flags: buffer.get_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UUIDNameRequest {
    pub ids: Vec<Uuid>,
}

impl Packet for UUIDNameRequest {
    const ID: u16 = 235;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;
    const SPLITTABLE: bool = true;
    const TYPE: PacketType = PacketType::UUIDNameRequest;

    fn encode_body(&self, buffer: &mut BytesMut) {
        put_block(buffer, &self.ids, |b, id| b.put_uuid(id));
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self { ids: get_block(buffer, |b| b.get_uuid())? })
    }

    fn split(&self, body_budget: usize) -> Option<Vec<Self>> {
        let chunks = split_block(0, &self.ids, |_| UUID_LEN, body_budget)?;
        Some(chunks.into_iter().map(|ids| Self { ids }).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UuidName {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
}

impl UuidName {
    fn wire_len(&self) -> usize {
        UUID_LEN + string1_len(&self.first_name) + string1_len(&self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UUIDNameReply {
    pub names: Vec<UuidName>,
}

impl Packet for UUIDNameReply {
    const ID: u16 = 236;
    const FREQUENCY: PacketFrequency = PacketFrequency::Low;
    const RELIABLE: bool = true;
    const ZEROCODED: bool = false;
    const SPLITTABLE: bool = true;
    const TYPE: PacketType = PacketType::UUIDNameReply;

    fn encode_body(&self, buffer: &mut BytesMut) {
        put_block(buffer, &self.names, |b, name| {
            b.put_uuid(&name.id);
            b.put_string1(&name.first_name);
            b.put_string1(&name.last_name);
        });
    }

    fn decode_body(buffer: &mut PacketBuffer<'_>) -> NetworkResult<Self> {
        Ok(Self {
            names: get_block(buffer, |b| {
                Ok(UuidName { id: b.get_uuid()?, first_name: b.get_string1()?, last_name: b.get_string1()? })
            })?,
        })
    }

    fn split(&self, body_budget: usize) -> Option<Vec<Self>> {
        let chunks = split_block(0, &self.names, UuidName::wire_len, body_budget)?;
        Some(chunks.into_iter().map(|names| Self { names }).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<P: Packet + PartialEq>(packet: &P) -> P {
        let mut buffer = BytesMut::new();
        packet.encode_body(&mut buffer);
        let mut reader = PacketBuffer::new(&buffer);
        let decoded = P::decode_body(&mut reader).unwrap();
        assert!(!reader.has_remaining(), "{} left bytes behind", P::name());
        decoded
    }

    #[test]
    fn test_packet_ack_body_is_little_endian() {
        let ack = PacketAck { packets: vec![1, 0x0102] };
        let mut buffer = BytesMut::new();
        ack.encode_body(&mut buffer);
        assert_eq!(buffer.as_ref(), &[2, 1, 0, 0, 0, 2, 1, 0, 0]);
        assert_eq!(round_trip(&ack), ack);
    }

    #[test]
    fn test_region_handshake_fields() {
        let handshake = RegionHandshake {
            region_flags: 0x10,
            sim_access: 13,
            sim_name: "Ahern".to_string(),
            sim_owner: Uuid::new_v4(),
            water_height: 20.0,
            terrain_height_range: [60.0, 60.0, 60.0, 60.0],
            region_id: Uuid::new_v4(),
            product_name: "Mainland".to_string(),
            region_info4: vec![RegionInfo4 { region_flags_extended: 0x10, region_protocols: 1 }],
            ..Default::default()
        };
        assert_eq!(round_trip(&handshake), handshake);
    }

    #[test]
    fn test_region_handshake_without_info4() {
        let handshake = RegionHandshake { sim_name: "Da Boom".to_string(), ..Default::default() };
        let mut buffer = BytesMut::new();
        handshake.encode_body(&mut buffer);
        // drop the empty RegionInfo4 count byte
        buffer.truncate(buffer.len() - 1);
        let decoded = RegionHandshake::decode_body(&mut PacketBuffer::new(&buffer)).unwrap();
        assert_eq!(decoded.sim_name, "Da Boom");
        assert!(decoded.region_info4.is_empty());
    }

    #[test]
    fn test_kick_user_reason() {
        let kick = KickUser {
            target_ip: Ipv4Addr::new(127, 0, 0, 1),
            target_port: 13005,
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            reason: "Region is restarting".to_string(),
        };
        assert_eq!(round_trip(&kick), kick);
    }

    #[test]
    fn test_split_block_respects_budget() {
        let ids: Vec<Uuid> = (0..10).map(|_| Uuid::new_v4()).collect();
        let request = UUIDNameRequest { ids: ids.clone() };

        // 1 count byte + 4 ids
        let fragments = request.split(1 + 4 * UUID_LEN).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments.iter().map(|f| f.ids.len()).collect::<Vec<_>>(), vec![4, 4, 2]);
        let rejoined: Vec<Uuid> = fragments.into_iter().flat_map(|f| f.ids).collect();
        assert_eq!(rejoined, ids);

        // fits in one
        assert!(request.split(1 + 10 * UUID_LEN).is_none());
        // cannot fit even one item
        assert!(request.split(UUID_LEN).is_none());
    }

    #[test]
    fn test_split_caps_block_count() {
        let ack = PacketAck { packets: (0..600).collect() };
        let fragments = ack.split(usize::MAX / 2).unwrap();
        assert_eq!(fragments.iter().map(|f| f.packets.len()).collect::<Vec<_>>(), vec![255, 255, 90]);
    }

    #[test]
    fn test_logout_reply_split_keeps_agent_data() {
        let reply = LogoutReply {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            item_ids: (0..5).map(|_| Uuid::new_v4()).collect(),
        };
        let fragments = reply.split(2 * UUID_LEN + 1 + 2 * UUID_LEN).unwrap();
        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(|f| f.agent_id == reply.agent_id && f.session_id == reply.session_id));
    }
}
