//! Compact field encodings.
//!
//! Integers are little-endian. Variable-length unsigned integers use a one
//! byte form below `0xfd` and a marker byte followed by a 2, 4 or 8 byte
//! integer above it. Strings, buffers and lists are prefixed with their
//! length in that variable form.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::ProtocolError;
use crate::constants::{ID_LEN, PEER_ADDR_LEN};

const UINT16_MARKER: u8 = 0xfd;
const UINT32_MARKER: u8 = 0xfe;
const UINT64_MARKER: u8 = 0xff;

fn ensure(buf: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn uint_len(n: u64) -> usize {
    if n < UINT16_MARKER as u64 {
        1
    } else if n <= u16::MAX as u64 {
        3
    } else if n <= u32::MAX as u64 {
        5
    } else {
        9
    }
}

pub fn put_uint(buf: &mut BytesMut, n: u64) {
    if n < UINT16_MARKER as u64 {
        buf.put_u8(n as u8);
    } else if n <= u16::MAX as u64 {
        buf.put_u8(UINT16_MARKER);
        buf.put_u16_le(n as u16);
    } else if n <= u32::MAX as u64 {
        buf.put_u8(UINT32_MARKER);
        buf.put_u32_le(n as u32);
    } else {
        buf.put_u8(UINT64_MARKER);
        buf.put_u64_le(n);
    }
}

pub fn get_uint(buf: &mut &[u8]) -> Result<u64, ProtocolError> {
    ensure(buf, 1)?;
    match buf.get_u8() {
        UINT16_MARKER => {
            ensure(buf, 2)?;
            Ok(buf.get_u16_le() as u64)
        }
        UINT32_MARKER => {
            ensure(buf, 4)?;
            Ok(buf.get_u32_le() as u64)
        }
        UINT64_MARKER => {
            ensure(buf, 8)?;
            Ok(buf.get_u64_le())
        }
        n => Ok(n as u64),
    }
}

fn get_len(buf: &mut &[u8]) -> Result<usize, ProtocolError> {
    let len = get_uint(buf)?;
    usize::try_from(len).map_err(|_| ProtocolError::InvalidLength)
}

pub fn get_u8(buf: &mut &[u8]) -> Result<u8, ProtocolError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut &[u8]) -> Result<u16, ProtocolError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub fn put_fixed32(buf: &mut BytesMut, bytes: &[u8; ID_LEN]) {
    buf.put_slice(bytes);
}

pub fn get_fixed32(buf: &mut &[u8]) -> Result<[u8; ID_LEN], ProtocolError> {
    ensure(buf, ID_LEN)?;
    let mut out = [0u8; ID_LEN];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn put_peer_addr(buf: &mut BytesMut, addr: &SocketAddrV4) {
    buf.put_slice(&addr.ip().octets());
    buf.put_u16_le(addr.port());
}

pub fn get_peer_addr(buf: &mut &[u8]) -> Result<SocketAddrV4, ProtocolError> {
    ensure(buf, PEER_ADDR_LEN)?;
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    let port = buf.get_u16_le();
    Ok(SocketAddrV4::new(Ipv4Addr::from(octets), port))
}

pub fn peer_list_len(peers: &[SocketAddrV4]) -> usize {
    uint_len(peers.len() as u64) + peers.len() * PEER_ADDR_LEN
}

pub fn put_peer_list(buf: &mut BytesMut, peers: &[SocketAddrV4]) {
    put_uint(buf, peers.len() as u64);
    for peer in peers {
        put_peer_addr(buf, peer);
    }
}

pub fn get_peer_list(buf: &mut &[u8]) -> Result<Vec<SocketAddrV4>, ProtocolError> {
    let count = get_len(buf)?;
    // Check the whole list up front so a bogus count can't drive a huge allocation.
    let needed = count
        .checked_mul(PEER_ADDR_LEN)
        .ok_or(ProtocolError::InvalidLength)?;
    ensure(buf, needed)?;

    let mut peers = Vec::with_capacity(count);
    for _ in 0..count {
        peers.push(get_peer_addr(buf)?);
    }
    Ok(peers)
}

pub fn buffer_len(bytes: &[u8]) -> usize {
    uint_len(bytes.len() as u64) + bytes.len()
}

pub fn put_buffer(buf: &mut BytesMut, bytes: &[u8]) {
    put_uint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn get_buffer(buf: &mut &[u8]) -> Result<Bytes, ProtocolError> {
    let len = get_len(buf)?;
    ensure(buf, len)?;
    let bytes = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(bytes)
}

pub fn string_len(s: &str) -> usize {
    buffer_len(s.as_bytes())
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_buffer(buf, s.as_bytes());
}

pub fn get_string(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    let len = get_len(buf)?;
    ensure(buf, len)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| ProtocolError::InvalidString)?
        .to_string();
    buf.advance(len);
    Ok(s)
}
