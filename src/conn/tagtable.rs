// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-Connection `process-local tag ID -> indexer-assigned remote ID`
//! table. Single-writer: only the writer task mutates it; the reader task
//! only resolves completed negotiations that are still pending.
//!
//! `NEG_TAG_RESP` carries just `(tag_id, ok)` with no name or request id, so
//! the only way to correlate a response with its request is strict
//! per-connection FIFO ordering: the writer task issues `NEG_TAG` requests
//! one at a time and the reader task resolves them in the order they were
//! sent.

use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;

use crate::error::MuxError;

pub struct NegotiationOutcome {
    pub process_tag: u16,
    pub remote_tag: u16,
}

/// Tracks resolved names and in-flight `NEG_TAG` requests for one
/// Connection.
#[derive(Default)]
pub struct TagTable {
    resolved: HashMap<u16, u16>,
    pending: VecDeque<(u16, oneshot::Sender<NegotiationOutcome>)>,
}

impl TagTable {
    pub fn new() -> Self {
        TagTable::default()
    }

    pub fn resolved(&self, process_tag: u16) -> Option<u16> {
        self.resolved.get(&process_tag).copied()
    }

    /// Register a new in-flight negotiation. The caller must send `NEG_TAG`
    /// for `process_tag` immediately after, before registering any other
    /// negotiation, to preserve FIFO correlation.
    pub fn push_pending(&mut self, process_tag: u16, done: oneshot::Sender<NegotiationOutcome>) {
        self.pending.push_back((process_tag, done));
    }

    /// Resolve the oldest pending negotiation with the indexer's response.
    /// Called by the reader task on `NEG_TAG_RESP`.
    pub fn resolve_next(&mut self, tag_id: u16, ok: bool) -> Result<(), MuxError> {
        let Some((process_tag, done)) = self.pending.pop_front() else {
            return Err(MuxError::protocol("NEG_TAG_RESP with no outstanding NEG_TAG request"));
        };
        if ok {
            self.resolved.insert(process_tag, tag_id);
        }
        let _ = done.send(NegotiationOutcome { process_tag, remote_tag: tag_id });
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_in_fifo_order() {
        let mut table = TagTable::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        table.push_pending(1, tx1);
        table.push_pending(2, tx2);

        table.resolve_next(100, true).unwrap();
        table.resolve_next(200, true).unwrap();

        let out1 = rx1.await.unwrap();
        let out2 = rx2.await.unwrap();
        assert_eq!(out1.process_tag, 1);
        assert_eq!(out1.remote_tag, 100);
        assert_eq!(out2.process_tag, 2);
        assert_eq!(out2.remote_tag, 200);
        assert_eq!(table.resolved(1), Some(100));
        assert_eq!(table.resolved(2), Some(200));
    }

    #[tokio::test]
    async fn rejected_negotiation_is_not_cached() {
        let mut table = TagTable::new();
        let (tx, rx) = oneshot::channel();
        table.push_pending(1, tx);
        table.resolve_next(0, false).unwrap();
        let out = rx.await.unwrap();
        assert_eq!(out.process_tag, 1);
        assert_eq!(table.resolved(1), None);
    }

    #[test]
    fn unexpected_response_is_a_protocol_error() {
        let mut table = TagTable::new();
        assert!(table.resolve_next(1, true).is_err());
    }
}
