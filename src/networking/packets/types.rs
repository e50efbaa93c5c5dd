//! Wire field helpers shared by the packet bodies
//!
//! Message fields are little-endian, except IPADDR/IPPORT which travel in
//! network byte order. Text in Variable fields is NUL-terminated.

use crate::networking::serialization::PacketBuffer;
use crate::networking::NetworkResult;
use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Write helpers for the template field types
pub trait PutFields {
    fn put_uuid(&mut self, id: &Uuid);
    fn put_bool(&mut self, value: bool);
    fn put_ipaddr(&mut self, addr: Ipv4Addr);
    fn put_ipport(&mut self, port: u16);
    fn put_variable1(&mut self, bytes: &[u8]);
    fn put_variable2(&mut self, bytes: &[u8]);
    fn put_string1(&mut self, text: &str);
    fn put_string2(&mut self, text: &str);
}

impl PutFields for BytesMut {
    fn put_uuid(&mut self, id: &Uuid) {
        self.put_slice(id.as_bytes());
    }

    fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    fn put_ipaddr(&mut self, addr: Ipv4Addr) {
        self.put_slice(&addr.octets());
    }

    fn put_ipport(&mut self, port: u16) {
        self.put_u16(port);
    }

    fn put_variable1(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(u8::MAX as usize);
        self.put_u8(len as u8);
        self.put_slice(&bytes[..len]);
    }

    fn put_variable2(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(u16::MAX as usize);
        self.put_u16_le(len as u16);
        self.put_slice(&bytes[..len]);
    }

    fn put_string1(&mut self, text: &str) {
        self.put_variable1(&string_to_variable(text, u8::MAX as usize));
    }

    fn put_string2(&mut self, text: &str) {
        self.put_variable2(&string_to_variable(text, u16::MAX as usize));
    }
}

/// Encoded size of a string written with `put_string1`
pub fn string1_len(text: &str) -> usize {
    1 + (text.len() + 1).min(u8::MAX as usize)
}

/// NUL-terminated bytes, truncated so the terminator still fits in `max`.
pub fn string_to_variable(text: &str, max: usize) -> Vec<u8> {
    let mut bytes: Vec<u8> = text.as_bytes().iter().copied().take(max.saturating_sub(1)).collect();
    bytes.push(0);
    bytes
}

/// Text from a Variable field, dropping the trailing NUL
pub fn variable_to_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl PacketBuffer<'_> {
    pub fn get_string1(&mut self) -> NetworkResult<String> {
        Ok(variable_to_string(&self.get_variable1()?))
    }

    pub fn get_string2(&mut self) -> NetworkResult<String> {
        Ok(variable_to_string(&self.get_variable2()?))
    }

    pub fn get_ipport(&mut self) -> NetworkResult<u16> {
        self.get_u16_be()
    }

    /// Block count of a Variable block
    pub fn get_block_count(&mut self) -> NetworkResult<usize> {
        Ok(self.get_u8()? as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_are_nul_terminated() {
        let mut buffer = BytesMut::new();
        buffer.put_string1("Ruth");
        assert_eq!(buffer.as_ref(), &[5, b'R', b'u', b't', b'h', 0]);
        assert_eq!(string1_len("Ruth"), buffer.len());

        let mut reader = PacketBuffer::new(&buffer);
        assert_eq!(reader.get_string1().unwrap(), "Ruth");
    }

    #[test]
    fn test_long_string_is_truncated_to_field() {
        let text = "x".repeat(300);
        let mut buffer = BytesMut::new();
        buffer.put_string1(&text);
        assert_eq!(buffer[0], 255);
        assert_eq!(buffer.len(), 256);
        assert_eq!(string1_len(&text), 256);
    }

    #[test]
    fn test_network_order_fields() {
        let mut buffer = BytesMut::new();
        buffer.put_ipaddr(Ipv4Addr::new(10, 0, 0, 1));
        buffer.put_ipport(13000);
        assert_eq!(buffer.as_ref(), &[10, 0, 0, 1, 0x32, 0xC8]);

        let mut reader = PacketBuffer::new(&buffer);
        assert_eq!(reader.get_ipv4().unwrap(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(reader.get_ipport().unwrap(), 13000);
    }
}
