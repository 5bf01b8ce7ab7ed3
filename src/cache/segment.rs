// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Length-prefixed Entry record framing within a single segment file, plus
//! the torn-tail recovery scan run when a segment is opened.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::MuxError;
use crate::wire::entry::{decode_entry, encode_entry};
use crate::wire::Entry;

/// Serialize one cache record: `u32 len` followed by the encoded Entry.
/// The Entry's `tag` field is the process-local tag ID, recorded verbatim.
pub fn encode_record(entry: &Entry) -> Bytes {
    let mut body = BytesMut::new();
    encode_entry(&mut body, entry, entry.tag);
    let mut framed = BytesMut::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&body);
    framed.freeze()
}

/// Decode every complete record from `data`. Returns the decoded Entries and
/// the byte offset of the first incomplete/corrupt record (== `data.len()`
/// if every record was valid). Callers truncate the backing file to that
/// offset to recover from a torn tail.
pub fn scan_records(data: &[u8]) -> (Vec<Entry>, usize) {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    loop {
        if data.len() - offset < 4 {
            break;
        }
        let len = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let record_start = offset + 4;
        if data.len() < record_start + len {
            break;
        }
        let mut body = Bytes::copy_from_slice(&data[record_start..record_start + len]);
        match decode_entry(&mut body) {
            Ok(entry) => {
                entries.push(entry);
                offset = record_start + len;
            }
            Err(_) => break,
        }
    }
    (entries, offset)
}

/// Decode records starting at `start_offset`, stopping once accumulated
/// record bytes would exceed `max_bytes`. Returns the entries read and the
/// new offset to resume from.
pub fn scan_records_budgeted(data: &[u8], start_offset: usize, max_bytes: usize) -> (Vec<Entry>, usize) {
    let mut entries = Vec::new();
    let mut offset = start_offset;
    let mut consumed = 0usize;
    loop {
        if consumed >= max_bytes || data.len() - offset < 4 {
            break;
        }
        let len = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let record_start = offset + 4;
        if data.len() < record_start + len {
            break;
        }
        let mut body = Bytes::copy_from_slice(&data[record_start..record_start + len]);
        match decode_entry(&mut body) {
            Ok(entry) => {
                entries.push(entry);
                offset = record_start + len;
                consumed += 4 + len;
            }
            Err(e) => {
                tracing::warn!(error = %e, "skipping corrupt cache record mid-segment");
                break;
            }
        }
    }
    (entries, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::entry::Entry as WireEntry;

    #[test]
    fn scan_records_reads_back_appended_entries() {
        let e1 = WireEntry::new(1, 0, 0, Bytes::from_static(b"one"));
        let e2 = WireEntry::new(2, 0, 0, Bytes::from_static(b"two"));
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_record(&e1));
        buf.extend_from_slice(&encode_record(&e2));

        let (entries, offset) = scan_records(&buf);
        assert_eq!(entries.len(), 2);
        assert_eq!(offset, buf.len());
        assert_eq!(entries[0].data, e1.data);
    }

    #[test]
    fn scan_records_truncates_on_torn_tail() {
        let e1 = WireEntry::new(1, 0, 0, Bytes::from_static(b"one"));
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_record(&e1));
        let good_len = buf.len();
        buf.extend_from_slice(&[1, 2, 3]);

        let (entries, offset) = scan_records(&buf);
        assert_eq!(entries.len(), 1);
        assert_eq!(offset, good_len);
    }

    #[test]
    fn scan_records_budgeted_stops_at_budget() {
        let e1 = WireEntry::new(1, 0, 0, Bytes::from_static(b"one"));
        let e2 = WireEntry::new(2, 0, 0, Bytes::from_static(b"two"));
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_record(&e1));
        let first_record_len = buf.len();
        buf.extend_from_slice(&encode_record(&e2));

        let (entries, offset) = scan_records_budgeted(&buf, 0, first_record_len);
        assert_eq!(entries.len(), 1);
        assert_eq!(offset, first_record_len);
    }
}
