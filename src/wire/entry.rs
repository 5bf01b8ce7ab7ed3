// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Entry data model: the unit a producer hands to the Muxer and the unit
//! carried inside `ENTRY`/`BATCH` payloads.
//!
//! Wire layout (see wire::codec for the frame table this implements):
//! `i64 sec, u32 nsec, u16 tag, u8 src_len, src_bytes, u32 data_len,
//! data_bytes, u16 ev_count, [evs...]` where each enumerated value is
//! `u8 name_len, name_bytes, u8 type, u32 value_len, value_bytes`.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MuxError;

/// Source address attached to an Entry, either unset, IPv4 or IPv6. The
/// wire format distinguishes these purely by `src_len` (0, 4, or 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrcAddr {
    None,
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

/// A single typed value inside an Entry's optional enumerated value list.
#[derive(Debug, Clone, PartialEq)]
pub enum EvValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Bytes),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Mac([u8; 6]),
    Timestamp { sec: i64, nsec: u32 },
    Duration { sec: i64, nsec: u32 },
}

/// A named, typed value carried alongside an Entry's opaque `data` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    pub name: String,
    pub value: EvValue,
}

impl EnumValue {
    /// Encoded size of this value: `name_len byte + name + type byte +
    /// value_len word + value bytes`.
    fn byte_length(&self) -> usize {
        1 + self.name.len() + 1 + 4 + encode_value_bytes(&self.value).len()
    }
}

/// A single ingested record.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub sec: i64,
    pub nsec: u32,
    pub src: SrcAddr,
    /// Process-local tag ID, resolved to the per-connection remote ID at
    /// send time by the Connection's tag table.
    pub tag: u16,
    pub data: Bytes,
    pub values: Vec<EnumValue>,
}

impl Entry {
    pub fn new(sec: i64, nsec: u32, tag: u16, data: impl Into<Bytes>) -> Self {
        Entry {
            sec,
            nsec,
            src: SrcAddr::None,
            tag,
            data: data.into(),
            values: Vec::new(),
        }
    }

    pub fn with_src(mut self, src: SrcAddr) -> Self {
        self.src = src;
        self
    }

    /// Total encoded size of `data` plus every enumerated value, matching
    /// the field this entry's size limit is checked against.
    pub fn byte_length(&self) -> usize {
        self.data.len() + self.values.iter().map(EnumValue::byte_length).sum::<usize>()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: EvValue) -> Self {
        self.values.push(EnumValue { name: name.into(), value });
        self
    }
}

const EV_BOOL: u8 = 0x01;
const EV_I8: u8 = 0x02;
const EV_I16: u8 = 0x03;
const EV_I32: u8 = 0x04;
const EV_I64: u8 = 0x05;
const EV_U8: u8 = 0x06;
const EV_U16: u8 = 0x07;
const EV_U32: u8 = 0x08;
const EV_U64: u8 = 0x09;
const EV_F32: u8 = 0x0A;
const EV_F64: u8 = 0x0B;
const EV_STRING: u8 = 0x0C;
const EV_BYTES: u8 = 0x0D;
const EV_IPV4: u8 = 0x0E;
const EV_IPV6: u8 = 0x0F;
const EV_MAC: u8 = 0x10;
const EV_TIMESTAMP: u8 = 0x11;
const EV_DURATION: u8 = 0x12;

fn encode_value_bytes(v: &EvValue) -> BytesMut {
    let mut b = BytesMut::new();
    match v {
        EvValue::Bool(x) => b.put_u8(*x as u8),
        EvValue::I8(x) => b.put_i8(*x),
        EvValue::I16(x) => b.put_i16_le(*x),
        EvValue::I32(x) => b.put_i32_le(*x),
        EvValue::I64(x) => b.put_i64_le(*x),
        EvValue::U8(x) => b.put_u8(*x),
        EvValue::U16(x) => b.put_u16_le(*x),
        EvValue::U32(x) => b.put_u32_le(*x),
        EvValue::U64(x) => b.put_u64_le(*x),
        EvValue::F32(x) => b.put_f32_le(*x),
        EvValue::F64(x) => b.put_f64_le(*x),
        EvValue::String(s) => b.put_slice(s.as_bytes()),
        EvValue::Bytes(bytes) => b.put_slice(bytes),
        EvValue::Ipv4(a) => b.put_slice(&a.octets()),
        EvValue::Ipv6(a) => b.put_slice(&a.octets()),
        EvValue::Mac(m) => b.put_slice(m),
        EvValue::Timestamp { sec, nsec } | EvValue::Duration { sec, nsec } => {
            b.put_i64_le(*sec);
            b.put_u32_le(*nsec);
        }
    }
    b
}

fn value_type_tag(v: &EvValue) -> u8 {
    match v {
        EvValue::Bool(_) => EV_BOOL,
        EvValue::I8(_) => EV_I8,
        EvValue::I16(_) => EV_I16,
        EvValue::I32(_) => EV_I32,
        EvValue::I64(_) => EV_I64,
        EvValue::U8(_) => EV_U8,
        EvValue::U16(_) => EV_U16,
        EvValue::U32(_) => EV_U32,
        EvValue::U64(_) => EV_U64,
        EvValue::F32(_) => EV_F32,
        EvValue::F64(_) => EV_F64,
        EvValue::String(_) => EV_STRING,
        EvValue::Bytes(_) => EV_BYTES,
        EvValue::Ipv4(_) => EV_IPV4,
        EvValue::Ipv6(_) => EV_IPV6,
        EvValue::Mac(_) => EV_MAC,
        EvValue::Timestamp { .. } => EV_TIMESTAMP,
        EvValue::Duration { .. } => EV_DURATION,
    }
}

fn decode_value(tag: u8, mut raw: Bytes) -> Result<EvValue, MuxError> {
    let need = |n: usize| -> Result<(), MuxError> {
        if raw.remaining() < n {
            Err(MuxError::protocol("value byte length does not match declared value_len"))
        } else {
            Ok(())
        }
    };
    Ok(match tag {
        EV_BOOL => {
            need(1)?;
            EvValue::Bool(raw.get_u8() != 0)
        }
        EV_I8 => {
            need(1)?;
            EvValue::I8(raw.get_i8())
        }
        EV_I16 => {
            need(2)?;
            EvValue::I16(raw.get_i16_le())
        }
        EV_I32 => {
            need(4)?;
            EvValue::I32(raw.get_i32_le())
        }
        EV_I64 => {
            need(8)?;
            EvValue::I64(raw.get_i64_le())
        }
        EV_U8 => {
            need(1)?;
            EvValue::U8(raw.get_u8())
        }
        EV_U16 => {
            need(2)?;
            EvValue::U16(raw.get_u16_le())
        }
        EV_U32 => {
            need(4)?;
            EvValue::U32(raw.get_u32_le())
        }
        EV_U64 => {
            need(8)?;
            EvValue::U64(raw.get_u64_le())
        }
        EV_F32 => {
            need(4)?;
            EvValue::F32(raw.get_f32_le())
        }
        EV_F64 => {
            need(8)?;
            EvValue::F64(raw.get_f64_le())
        }
        EV_STRING => {
            let s = String::from_utf8(raw.to_vec())
                .map_err(|e| MuxError::protocol(format!("non-utf8 string value: {e}")))?;
            EvValue::String(s)
        }
        EV_BYTES => EvValue::Bytes(raw),
        EV_IPV4 => {
            need(4)?;
            let mut octets = [0u8; 4];
            raw.copy_to_slice(&mut octets);
            EvValue::Ipv4(Ipv4Addr::from(octets))
        }
        EV_IPV6 => {
            need(16)?;
            let mut octets = [0u8; 16];
            raw.copy_to_slice(&mut octets);
            EvValue::Ipv6(Ipv6Addr::from(octets))
        }
        EV_MAC => {
            need(6)?;
            let mut mac = [0u8; 6];
            raw.copy_to_slice(&mut mac);
            EvValue::Mac(mac)
        }
        EV_TIMESTAMP => {
            need(12)?;
            let sec = raw.get_i64_le();
            let nsec = raw.get_u32_le();
            EvValue::Timestamp { sec, nsec }
        }
        EV_DURATION => {
            need(12)?;
            let sec = raw.get_i64_le();
            let nsec = raw.get_u32_le();
            EvValue::Duration { sec, nsec }
        }
        other => return Err(MuxError::protocol(format!("unknown value type 0x{other:02x}"))),
    })
}

fn encode_ev(buf: &mut BytesMut, ev: &EnumValue) {
    let name_bytes = ev.name.as_bytes();
    buf.put_u8(name_bytes.len() as u8);
    buf.put_slice(name_bytes);
    buf.put_u8(value_type_tag(&ev.value));
    let value_bytes = encode_value_bytes(&ev.value);
    buf.put_u32_le(value_bytes.len() as u32);
    buf.put_slice(&value_bytes);
}

fn decode_ev(buf: &mut Bytes) -> Result<EnumValue, MuxError> {
    if buf.remaining() < 1 {
        return Err(MuxError::protocol("truncated enumerated value name_len"));
    }
    let name_len = buf.get_u8() as usize;
    if buf.remaining() < name_len {
        return Err(MuxError::protocol("truncated enumerated value name"));
    }
    let name = String::from_utf8(buf.split_to(name_len).to_vec())
        .map_err(|e| MuxError::protocol(format!("non-utf8 enumerated value name: {e}")))?;
    if buf.remaining() < 5 {
        return Err(MuxError::protocol("truncated enumerated value type/len"));
    }
    let type_tag = buf.get_u8();
    let value_len = buf.get_u32_le() as usize;
    if buf.remaining() < value_len {
        return Err(MuxError::protocol("truncated enumerated value bytes"));
    }
    let raw = buf.split_to(value_len);
    let value = decode_value(type_tag, raw)?;
    Ok(EnumValue { name, value })
}

/// Serialize an Entry's body. `remote_tag` is the wire tag ID to send —
/// for cache records this is the same process-local ID carried in
/// `entry.tag`; for live Connection writes it is the connection-local ID
/// resolved from the tag table.
pub fn encode_entry(buf: &mut BytesMut, entry: &Entry, remote_tag: u16) {
    buf.put_i64_le(entry.sec);
    buf.put_u32_le(entry.nsec);
    buf.put_u16_le(remote_tag);
    match entry.src {
        SrcAddr::None => buf.put_u8(0),
        SrcAddr::V4(a) => {
            buf.put_u8(4);
            buf.put_slice(&a.octets());
        }
        SrcAddr::V6(a) => {
            buf.put_u8(16);
            buf.put_slice(&a.octets());
        }
    }
    buf.put_u32_le(entry.data.len() as u32);
    buf.put_slice(&entry.data);
    buf.put_u16_le(entry.values.len() as u16);
    for ev in &entry.values {
        encode_ev(buf, ev);
    }
}

/// Decode an Entry body. The returned `tag` is the wire tag ID as sent;
/// resolving it to a process-local name is the caller's job.
pub fn decode_entry(buf: &mut Bytes) -> Result<Entry, MuxError> {
    if buf.remaining() < 15 {
        return Err(MuxError::protocol("truncated entry header"));
    }
    let sec = buf.get_i64_le();
    let nsec = buf.get_u32_le();
    let tag = buf.get_u16_le();
    let src_len = buf.get_u8();
    let src = match src_len {
        0 => SrcAddr::None,
        4 => {
            if buf.remaining() < 4 {
                return Err(MuxError::protocol("truncated ipv4 src"));
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            SrcAddr::V4(Ipv4Addr::from(octets))
        }
        16 => {
            if buf.remaining() < 16 {
                return Err(MuxError::protocol("truncated ipv6 src"));
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            SrcAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(MuxError::protocol(format!("invalid src_len {other} (must be 0, 4, or 16)"))),
    };
    if buf.remaining() < 4 {
        return Err(MuxError::protocol("truncated entry data_len"));
    }
    let data_len = buf.get_u32_le() as usize;
    if buf.remaining() < data_len {
        return Err(MuxError::protocol("truncated entry data"));
    }
    let data = buf.split_to(data_len);
    if buf.remaining() < 2 {
        return Err(MuxError::protocol("truncated ev_count"));
    }
    let ev_count = buf.get_u16_le();
    let mut values = Vec::with_capacity(ev_count as usize);
    for _ in 0..ev_count {
        values.push(decode_ev(buf)?);
    }
    Ok(Entry { sec, nsec, src, tag, data, values })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_plain_entry() {
        let entry = Entry::new(1_700_000_000, 123, 0xFFFF, Bytes::from_static(b"hello"));
        let mut buf = BytesMut::new();
        encode_entry(&mut buf, &entry, 7);
        let mut frozen = buf.freeze();
        let decoded = decode_entry(&mut frozen).unwrap();
        assert_eq!(decoded.sec, entry.sec);
        assert_eq!(decoded.nsec, entry.nsec);
        assert_eq!(decoded.tag, 7);
        assert_eq!(decoded.data, entry.data);
        assert!(decoded.values.is_empty());
    }

    #[test]
    fn round_trips_values_and_src() {
        let entry = Entry::new(1, 2, 0, Bytes::from_static(b"x"))
            .with_src(SrcAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
            .with_value("count", EvValue::U32(42))
            .with_value("name", EvValue::String("svc".into()));
        let mut buf = BytesMut::new();
        encode_entry(&mut buf, &entry, 0);
        let mut frozen = buf.freeze();
        let decoded = decode_entry(&mut frozen).unwrap();
        assert_eq!(decoded.src, SrcAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(decoded.values.len(), 2);
        assert_eq!(decoded.values[0].name, "count");
        assert_eq!(decoded.values[0].value, EvValue::U32(42));
    }

    #[test]
    fn round_trips_v6_src_and_bytes_value() {
        let entry = Entry::new(1, 0, 0, Bytes::from_static(b""))
            .with_src(SrcAddr::V6(Ipv6Addr::LOCALHOST))
            .with_value("blob", EvValue::Bytes(Bytes::from_static(b"\x00\x01\x02")));
        let mut buf = BytesMut::new();
        encode_entry(&mut buf, &entry, 0);
        let mut frozen = buf.freeze();
        let decoded = decode_entry(&mut frozen).unwrap();
        assert_eq!(decoded.src, SrcAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(decoded.values[0].value, EvValue::Bytes(Bytes::from_static(b"\x00\x01\x02")));
    }

    #[test]
    fn rejects_truncated_entry() {
        let mut buf = Bytes::from_static(b"short");
        assert!(decode_entry(&mut buf).is_err());
    }

    #[test]
    fn rejects_invalid_src_len() {
        let mut buf = BytesMut::new();
        buf.put_i64_le(1);
        buf.put_u32_le(0);
        buf.put_u16_le(0);
        buf.put_u8(7);
        let mut frozen = buf.freeze();
        assert!(decode_entry(&mut frozen).is_err());
    }
}
