// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The Connection's reader task: decodes frames from the indexer and
//! dispatches them. Answers PING with PONG directly (bidirectional
//! keepalive) without resetting its own idle timer.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::tagtable::TagTable;
use super::transport::Transport;
use super::SyncWaiters;
use crate::error::MuxError;
use crate::wire::codec::Frame;
use crate::wire::frame::{read_frame, write_frame};
use crate::wire::MAX_FRAME_PAYLOAD;

pub struct ReaderCtx {
    pub shared_writer: Arc<AsyncMutex<BufWriter<WriteHalf<Transport>>>>,
    pub tag_table: Arc<std::sync::Mutex<TagTable>>,
    pub sync_waiters: SyncWaiters,
    pub last_activity: tokio::sync::watch::Sender<Instant>,
}

pub async fn run_reader(
    ctx: ReaderCtx,
    mut read_half: ReadHalf<Transport>,
    fault_tx: mpsc::Sender<MuxError>,
) {
    loop {
        let (hdr, payload) = match read_frame(&mut read_half, MAX_FRAME_PAYLOAD).await {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "reader task failed, signalling connection fault");
                let _ = fault_tx.try_send(e);
                return;
            }
        };
        let _ = ctx.last_activity.send(Instant::now());

        let frame = match Frame::decode(hdr.id, payload) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "protocol error decoding frame, signalling connection fault");
                let _ = fault_tx.try_send(e);
                return;
            }
        };

        match frame {
            Frame::NegTagResp { tag_id, ok } => {
                #[allow(clippy::unwrap_used)]
                let mut table = ctx.tag_table.lock().unwrap();
                if let Err(e) = table.resolve_next(tag_id, ok) {
                    drop(table);
                    let _ = fault_tx.try_send(e);
                    return;
                }
            }
            Frame::SyncAck { cursor, ok } => {
                let waiter = {
                    #[allow(clippy::unwrap_used)]
                    let mut waiters = ctx.sync_waiters.lock().unwrap();
                    waiters.remove(&cursor)
                };
                if let Some(ack) = waiter {
                    let result = if ok {
                        Ok(())
                    } else {
                        Err(MuxError::protocol(format!("indexer NACKed SYNC at cursor {cursor}")))
                    };
                    let _ = ack.send(result);
                } else {
                    trace!(cursor, "SYNC_ACK for unknown or already-resolved cursor");
                }
            }
            Frame::Ping => {
                let pong = Frame::Pong;
                let mut w = ctx.shared_writer.lock().await;
                if let Err(e) = write_frame(&mut *w, pong.command_id(), &pong.encode_payload()).await {
                    drop(w);
                    let _ = fault_tx.try_send(MuxError::transport(format!("replying PONG: {e}")));
                    return;
                }
                if let Err(e) = w.flush().await {
                    let _ = fault_tx.try_send(MuxError::transport(format!("flushing PONG: {e}")));
                    return;
                }
            }
            Frame::Pong => {
                trace!("received PONG");
            }
            Frame::State { .. } => {
                trace!("received STATE from indexer, ignoring");
            }
            other => {
                warn!(command_id = other.command_id(), "unexpected frame from indexer");
            }
        }
    }
}
