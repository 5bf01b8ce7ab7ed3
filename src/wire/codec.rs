// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Command payload encode/decode, dispatched by command id from
//! [`frame`](super::frame).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::entry::{decode_entry, encode_entry, Entry};
use super::frame::{
    CMD_AUTH, CMD_AUTH_RESP, CMD_BATCH, CMD_ENTRY, CMD_HANDSHAKE, CMD_NEG_TAG, CMD_NEG_TAG_RESP,
    CMD_PING, CMD_PONG, CMD_STATE, CMD_SYNC, CMD_SYNC_ACK,
};
use crate::error::MuxError;

/// Handshake flag bit 0: ingester supports compression. Not required by
/// either side; advertised only.
pub const HANDSHAKE_FLAG_COMPRESSION: u32 = 0x1;

/// `AUTH_RESP.reason` codes.
pub const AUTH_REASON_OK: u8 = 0x00;
pub const AUTH_REASON_BAD_SECRET: u8 = 0x01;
pub const AUTH_REASON_BAD_VERSION: u8 = 0x02;
pub const AUTH_REASON_OTHER: u8 = 0xFF;

/// One decoded command, independent of its wire framing.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Handshake { version: u32, flags: u32, ingester_uuid: [u8; 16], ingester_name: String },
    Auth { secret: Bytes },
    AuthResp { ok: bool, reason: u8 },
    /// Request to resolve `name` to a connection-scoped remote tag ID.
    NegTag { name: String },
    /// Response to `NegTag`. Carries no name or request id — the wire
    /// protocol relies on strict per-connection FIFO ordering between a
    /// `NEG_TAG` and its `NEG_TAG_RESP` to correlate the two.
    NegTagResp { tag_id: u16, ok: bool },
    Entry { entry: Entry },
    Batch { entries: Vec<Entry> },
    Sync { cursor: u64 },
    SyncAck { cursor: u64, ok: bool },
    /// JSON-encoded state snapshot (config, startup/shutdown, stats).
    State { json: Bytes },
    Ping,
    Pong,
}

fn put_u16_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_u16_string(buf: &mut Bytes) -> Result<String, MuxError> {
    if buf.remaining() < 2 {
        return Err(MuxError::protocol("truncated string length"));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(MuxError::protocol("truncated string bytes"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| MuxError::protocol(format!("non-utf8 string: {e}")))
}

impl Frame {
    /// Command id this frame is sent/received under.
    pub fn command_id(&self) -> u32 {
        match self {
            Frame::Handshake { .. } => CMD_HANDSHAKE,
            Frame::Auth { .. } => CMD_AUTH,
            Frame::AuthResp { .. } => CMD_AUTH_RESP,
            Frame::NegTag { .. } => CMD_NEG_TAG,
            Frame::NegTagResp { .. } => CMD_NEG_TAG_RESP,
            Frame::Entry { .. } => CMD_ENTRY,
            Frame::Batch { .. } => CMD_BATCH,
            Frame::Sync { .. } => CMD_SYNC,
            Frame::SyncAck { .. } => CMD_SYNC_ACK,
            Frame::State { .. } => CMD_STATE,
            Frame::Ping => CMD_PING,
            Frame::Pong => CMD_PONG,
        }
    }

    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Frame::Handshake { version, flags, ingester_uuid, ingester_name } => {
                buf.put_u32_le(*version);
                buf.put_u32_le(*flags);
                buf.put_slice(ingester_uuid);
                put_u16_string(&mut buf, ingester_name);
            }
            Frame::Auth { secret } => {
                buf.put_u32_le(secret.len() as u32);
                buf.put_slice(secret);
            }
            Frame::AuthResp { ok, reason } => {
                buf.put_u8(*ok as u8);
                buf.put_u8(*reason);
            }
            Frame::NegTag { name } => put_u16_string(&mut buf, name),
            Frame::NegTagResp { tag_id, ok } => {
                buf.put_u16_le(*tag_id);
                buf.put_u8(*ok as u8);
            }
            Frame::Entry { entry } => encode_entry(&mut buf, entry, entry.tag),
            Frame::Batch { entries } => {
                buf.put_u32_le(entries.len() as u32);
                for entry in entries {
                    encode_entry(&mut buf, entry, entry.tag);
                }
            }
            Frame::Sync { cursor } => buf.put_u64_le(*cursor),
            Frame::SyncAck { cursor, ok } => {
                buf.put_u64_le(*cursor);
                buf.put_u8(*ok as u8);
            }
            Frame::State { json } => {
                buf.put_u32_le(json.len() as u32);
                buf.put_slice(json);
            }
            Frame::Ping | Frame::Pong => {}
        }
        buf.freeze()
    }

    pub fn decode(command_id: u32, mut payload: Bytes) -> Result<Self, MuxError> {
        Ok(match command_id {
            CMD_HANDSHAKE => {
                if payload.remaining() < 24 {
                    return Err(MuxError::protocol("truncated HANDSHAKE"));
                }
                let version = payload.get_u32_le();
                let flags = payload.get_u32_le();
                let mut ingester_uuid = [0u8; 16];
                payload.copy_to_slice(&mut ingester_uuid);
                let ingester_name = get_u16_string(&mut payload)?;
                Frame::Handshake { version, flags, ingester_uuid, ingester_name }
            }
            CMD_AUTH => {
                if payload.remaining() < 4 {
                    return Err(MuxError::protocol("truncated AUTH"));
                }
                let len = payload.get_u32_le() as usize;
                if payload.remaining() < len {
                    return Err(MuxError::protocol("truncated AUTH secret"));
                }
                Frame::Auth { secret: payload.split_to(len) }
            }
            CMD_AUTH_RESP => {
                if payload.remaining() < 2 {
                    return Err(MuxError::protocol("truncated AUTH_RESP"));
                }
                let ok = payload.get_u8() != 0;
                let reason = payload.get_u8();
                Frame::AuthResp { ok, reason }
            }
            CMD_NEG_TAG => Frame::NegTag { name: get_u16_string(&mut payload)? },
            CMD_NEG_TAG_RESP => {
                if payload.remaining() < 3 {
                    return Err(MuxError::protocol("truncated NEG_TAG_RESP"));
                }
                let tag_id = payload.get_u16_le();
                let ok = payload.get_u8() != 0;
                Frame::NegTagResp { tag_id, ok }
            }
            CMD_ENTRY => Frame::Entry { entry: decode_entry(&mut payload)? },
            CMD_BATCH => {
                if payload.remaining() < 4 {
                    return Err(MuxError::protocol("truncated BATCH count"));
                }
                let count = payload.get_u32_le();
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    entries.push(decode_entry(&mut payload)?);
                }
                Frame::Batch { entries }
            }
            CMD_SYNC => {
                if payload.remaining() < 8 {
                    return Err(MuxError::protocol("truncated SYNC"));
                }
                Frame::Sync { cursor: payload.get_u64_le() }
            }
            CMD_SYNC_ACK => {
                if payload.remaining() < 9 {
                    return Err(MuxError::protocol("truncated SYNC_ACK"));
                }
                let cursor = payload.get_u64_le();
                let ok = payload.get_u8() != 0;
                Frame::SyncAck { cursor, ok }
            }
            CMD_STATE => {
                if payload.remaining() < 4 {
                    return Err(MuxError::protocol("truncated STATE length"));
                }
                let len = payload.get_u32_le() as usize;
                if payload.remaining() < len {
                    return Err(MuxError::protocol("truncated STATE json"));
                }
                Frame::State { json: payload.split_to(len) }
            }
            CMD_PING => Frame::Ping,
            CMD_PONG => Frame::Pong,
            other => return Err(MuxError::protocol(format!("unknown command id 0x{other:02x}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::entry::SrcAddr;

    #[test]
    fn round_trips_handshake() {
        let f = Frame::Handshake {
            version: 2,
            flags: HANDSHAKE_FLAG_COMPRESSION,
            ingester_uuid: [7u8; 16],
            ingester_name: "demo".into(),
        };
        let payload = f.encode_payload();
        let decoded = Frame::decode(f.command_id(), payload).unwrap();
        assert_eq!(decoded, f);
    }

    #[test]
    fn round_trips_auth_resp_with_reason() {
        let f = Frame::AuthResp { ok: false, reason: AUTH_REASON_BAD_SECRET };
        let decoded = Frame::decode(f.command_id(), f.encode_payload()).unwrap();
        assert_eq!(decoded, f);
    }

    #[test]
    fn round_trips_neg_tag_resp() {
        let f = Frame::NegTagResp { tag_id: 9, ok: true };
        let decoded = Frame::decode(f.command_id(), f.encode_payload()).unwrap();
        assert_eq!(decoded, f);
    }

    #[test]
    fn round_trips_entry_and_batch() {
        let mut entry = Entry::new(1, 0, 3, Bytes::from_static(b"payload"));
        entry.src = SrcAddr::None;
        let f = Frame::Entry { entry: entry.clone() };
        let decoded = Frame::decode(f.command_id(), f.encode_payload()).unwrap();
        assert_eq!(decoded, f);

        let batch = Frame::Batch { entries: vec![entry.clone(), entry] };
        let decoded = Frame::decode(batch.command_id(), batch.encode_payload()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn round_trips_state_json() {
        let f = Frame::State { json: Bytes::from_static(b"{\"state\":\"hot\"}") };
        let decoded = Frame::decode(f.command_id(), f.encode_payload()).unwrap();
        assert_eq!(decoded, f);
    }

    #[test]
    fn round_trips_sync_ack() {
        let f = Frame::SyncAck { cursor: 42, ok: true };
        let decoded = Frame::decode(f.command_id(), f.encode_payload()).unwrap();
        assert_eq!(decoded, f);
    }

    #[test]
    fn rejects_unknown_command() {
        assert!(Frame::decode(0xFFFF, Bytes::new()).is_err());
    }

    #[test]
    fn ping_pong_have_empty_payloads() {
        assert!(Frame::Ping.encode_payload().is_empty());
        assert!(Frame::Pong.encode_payload().is_empty());
    }
}
