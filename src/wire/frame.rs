// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Fixed frame header shared by every command: `u8 magic, u32 id, u32
//! payload_len` followed by `payload_len` bytes, all little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::MuxError;

/// Every frame starts with this byte.
pub const MAGIC: u8 = 0xA5;

pub const CMD_HANDSHAKE: u32 = 0x01;
pub const CMD_AUTH: u32 = 0x02;
pub const CMD_AUTH_RESP: u32 = 0x03;
pub const CMD_NEG_TAG: u32 = 0x10;
pub const CMD_NEG_TAG_RESP: u32 = 0x11;
pub const CMD_ENTRY: u32 = 0x20;
pub const CMD_BATCH: u32 = 0x21;
pub const CMD_SYNC: u32 = 0x30;
pub const CMD_SYNC_ACK: u32 = 0x31;
pub const CMD_STATE: u32 = 0x40;
pub const CMD_PING: u32 = 0x50;
pub const CMD_PONG: u32 = 0x51;

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub id: u32,
    pub payload_len: u32,
}

/// Serialize `id`+`payload` as a complete frame and write it to `writer`.
///
/// Holds no lock itself — callers (the Connection writer task) are expected
/// to serialize calls so a frame is never interleaved with another.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: u32,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(9 + payload.len());
    buf.put_u8(MAGIC);
    buf.put_u32_le(id);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    writer.write_all(&buf).await
}

/// Read one complete frame from `reader`, rejecting payloads larger than
/// `max_payload`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: u32,
) -> Result<(FrameHeader, Bytes), MuxError> {
    let mut hdr = [0u8; 9];
    reader
        .read_exact(&mut hdr)
        .await
        .map_err(|e| MuxError::transport(format!("frame header read failed: {e}")))?;

    let mut cursor = &hdr[..];
    let magic = cursor.get_u8();
    if magic != MAGIC {
        return Err(MuxError::protocol(format!("bad magic byte: 0x{magic:02x}")));
    }
    let id = cursor.get_u32_le();
    let payload_len = cursor.get_u32_le();
    if payload_len > max_payload {
        return Err(MuxError::protocol(format!(
            "payload length {payload_len} exceeds maximum {max_payload}"
        )));
    }

    let mut payload = BytesMut::zeroed(payload_len as usize);
    if payload_len > 0 {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| MuxError::transport(format!("frame payload read failed: {e}")))?;
    }

    Ok((FrameHeader { id, payload_len }, payload.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, CMD_PING, b"").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (hdr, payload) = read_frame(&mut cursor, 1024).await.unwrap();
        assert_eq!(hdr.id, CMD_PING);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn rejects_bad_magic() {
        let mut buf = vec![0x00u8, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut cursor = std::io::Cursor::new(&mut buf);
        let err = read_frame(&mut cursor, 1024).await.unwrap_err();
        assert!(matches!(err, MuxError::Protocol(_)));
    }

    #[tokio::test]
    async fn rejects_oversize_payload() {
        let mut buf = Vec::new();
        write_frame(&mut buf, CMD_ENTRY, &vec![0u8; 128]).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert!(matches!(err, MuxError::Protocol(_)));
    }
}
