//! Big-endian protocol primitives
//!
//! Readers consume from the front of a [`Bytes`] cursor and fail with
//! [`FrameError::Truncated`] instead of panicking when the body runs short.
//! Writers append to a [`BytesMut`] and reject values that do not fit their
//! length prefix.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::consistency::Consistency;
use crate::error::{FrameError, Result};

fn ensure(src: &Bytes, needed: usize) -> Result<()> {
    if src.remaining() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: src.remaining(),
        });
    }
    Ok(())
}

fn read_len(src: &mut Bytes) -> Result<usize> {
    let len = read_int(src)?;
    if len < 0 {
        return Err(FrameError::NegativeLength(len));
    }
    Ok(len as usize)
}

pub fn read_byte(src: &mut Bytes) -> Result<u8> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

pub fn read_short(src: &mut Bytes) -> Result<u16> {
    ensure(src, 2)?;
    Ok(src.get_u16())
}

pub fn read_int(src: &mut Bytes) -> Result<i32> {
    ensure(src, 4)?;
    Ok(src.get_i32())
}

pub fn read_long(src: &mut Bytes) -> Result<i64> {
    ensure(src, 8)?;
    Ok(src.get_i64())
}

/// `[string]`: u16 length followed by UTF-8
pub fn read_string(src: &mut Bytes) -> Result<String> {
    let len = read_short(src)? as usize;
    read_utf8(src, len)
}

/// `[long string]`: i32 length followed by UTF-8
pub fn read_long_string(src: &mut Bytes) -> Result<String> {
    let len = read_len(src)?;
    read_utf8(src, len)
}

fn read_utf8(src: &mut Bytes, len: usize) -> Result<String> {
    ensure(src, len)?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidUtf8)
}

pub fn read_string_list(src: &mut Bytes) -> Result<Vec<String>> {
    let count = read_short(src)? as usize;
    let mut list = Vec::with_capacity(count.min(src.remaining() / 2));
    for _ in 0..count {
        list.push(read_string(src)?);
    }
    Ok(list)
}

/// `[bytes]`: i32 length, negative meaning null
pub fn read_bytes(src: &mut Bytes) -> Result<Option<Bytes>> {
    let len = read_int(src)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    ensure(src, len)?;
    Ok(Some(src.split_to(len)))
}

/// `[short bytes]`: u16 length followed by raw bytes
pub fn read_short_bytes(src: &mut Bytes) -> Result<Bytes> {
    let len = read_short(src)? as usize;
    ensure(src, len)?;
    Ok(src.split_to(len))
}

/// `[inet]`: address length (4 or 16), address bytes, i32 port
pub fn read_inet(src: &mut Bytes) -> Result<SocketAddr> {
    let len = read_byte(src)?;
    let ip = match len {
        4 => {
            ensure(src, 4)?;
            let mut octets = [0u8; 4];
            src.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        16 => {
            ensure(src, 16)?;
            let mut octets = [0u8; 16];
            src.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(FrameError::InvalidInetLength(other)),
    };
    let port = read_int(src)?;
    let port = u16::try_from(port).map_err(|_| FrameError::InvalidPort(port))?;
    Ok(SocketAddr::new(ip, port))
}

pub fn read_string_map(src: &mut Bytes) -> Result<HashMap<String, String>> {
    let count = read_short(src)? as usize;
    let mut map = HashMap::with_capacity(count.min(64));
    for _ in 0..count {
        let key = read_string(src)?;
        let value = read_string(src)?;
        map.insert(key, value);
    }
    Ok(map)
}

pub fn read_string_multimap(src: &mut Bytes) -> Result<HashMap<String, Vec<String>>> {
    let count = read_short(src)? as usize;
    let mut map = HashMap::with_capacity(count.min(64));
    for _ in 0..count {
        let key = read_string(src)?;
        let values = read_string_list(src)?;
        map.insert(key, values);
    }
    Ok(map)
}

pub fn read_consistency(src: &mut Bytes) -> Result<Consistency> {
    Consistency::try_from(read_short(src)?)
}

pub fn write_short(dst: &mut BytesMut, value: u16) {
    dst.put_u16(value);
}

pub fn write_int(dst: &mut BytesMut, value: i32) {
    dst.put_i32(value);
}

pub fn write_long(dst: &mut BytesMut, value: i64) {
    dst.put_i64(value);
}

fn short_len(kind: &'static str, length: usize) -> Result<u16> {
    u16::try_from(length).map_err(|_| FrameError::ValueTooLong { kind, length })
}

fn int_len(kind: &'static str, length: usize) -> Result<i32> {
    i32::try_from(length).map_err(|_| FrameError::ValueTooLong { kind, length })
}

pub fn write_string(dst: &mut BytesMut, value: &str) -> Result<()> {
    dst.put_u16(short_len("string", value.len())?);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub fn write_long_string(dst: &mut BytesMut, value: &str) -> Result<()> {
    dst.put_i32(int_len("long string", value.len())?);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub fn write_string_list<S: AsRef<str>>(dst: &mut BytesMut, values: &[S]) -> Result<()> {
    dst.put_u16(short_len("string list", values.len())?);
    for value in values {
        write_string(dst, value.as_ref())?;
    }
    Ok(())
}

/// Write `[bytes]`, `None` encoding as length -1
pub fn write_bytes(dst: &mut BytesMut, value: Option<&[u8]>) -> Result<()> {
    match value {
        Some(value) => {
            dst.put_i32(int_len("bytes", value.len())?);
            dst.put_slice(value);
        }
        None => dst.put_i32(-1),
    }
    Ok(())
}

pub fn write_short_bytes(dst: &mut BytesMut, value: &[u8]) -> Result<()> {
    dst.put_u16(short_len("short bytes", value.len())?);
    dst.put_slice(value);
    Ok(())
}

pub fn write_inet(dst: &mut BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            dst.put_u8(4);
            dst.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            dst.put_u8(16);
            dst.put_slice(&ip.octets());
        }
    }
    dst.put_i32(i32::from(addr.port()));
}

/// Write a `[string map]`. Keys are sorted so encoding is deterministic.
pub fn write_string_map(dst: &mut BytesMut, map: &HashMap<String, String>) -> Result<()> {
    dst.put_u16(short_len("string map", map.len())?);
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
    for (key, value) in entries {
        write_string(dst, key)?;
        write_string(dst, value)?;
    }
    Ok(())
}

pub fn write_string_multimap(
    dst: &mut BytesMut,
    map: &HashMap<String, Vec<String>>,
) -> Result<()> {
    dst.put_u16(short_len("string multimap", map.len())?);
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
    for (key, values) in entries {
        write_string(dst, key)?;
        write_string_list(dst, values)?;
    }
    Ok(())
}

pub fn write_consistency(dst: &mut BytesMut, consistency: Consistency) {
    dst.put_u16(consistency.code());
}
