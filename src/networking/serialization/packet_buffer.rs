//! Bounds-checked reader over Second Life packet bodies

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use crate::networking::{NetworkError, NetworkResult};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Cursor over a packet body. Field data is little-endian except where the
/// protocol says otherwise (sequence numbers, acks, IP ports).
pub struct PacketBuffer<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> PacketBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn take(&mut self, n: usize) -> NetworkResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(NetworkError::PacketDecode {
                reason: format!("Not enough data: need {}, have {}", n, self.remaining()),
            });
        }
        let slice = &self.data[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> NetworkResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> NetworkResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u16(&mut self) -> NetworkResult<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn get_u16_be(&mut self) -> NetworkResult<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn get_u32(&mut self) -> NetworkResult<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn get_u32_be(&mut self) -> NetworkResult<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn get_i32(&mut self) -> NetworkResult<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn get_u64(&mut self) -> NetworkResult<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn get_f32(&mut self) -> NetworkResult<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn get_uuid(&mut self) -> NetworkResult<Uuid> {
        let bytes = self.take(16)?;
        Uuid::from_slice(bytes).map_err(|e| NetworkError::PacketDecode { reason: e.to_string() })
    }

    /// IPADDR fields are sent in network byte order
    pub fn get_ipv4(&mut self) -> NetworkResult<Ipv4Addr> {
        let b = self.take(4)?;
        Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    pub fn get_bytes(&mut self, len: usize) -> NetworkResult<Vec<u8>> {
        Ok(self.take(len)?.to_vec())
    }

    /// Variable field with a 1-byte length prefix
    pub fn get_variable1(&mut self) -> NetworkResult<Vec<u8>> {
        let len = self.get_u8()? as usize;
        self.get_bytes(len)
    }

    /// Variable field with a 2-byte (little-endian) length prefix
    pub fn get_variable2(&mut self) -> NetworkResult<Vec<u8>> {
        let len = self.get_u16()? as usize;
        self.get_bytes(len)
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.position).copied()
    }
}
