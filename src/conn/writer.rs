// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The Connection's writer task: owns the outgoing command queue, the tag
//! table's write side, and issues keepalive PINGs on an idle timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufWriter, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::tagtable::TagTable;
use super::transport::Transport;
use super::{ConnCmd, SyncWaiters};
use crate::error::MuxError;
use crate::ratelimit::RateLimiter;
use crate::tag::TagManager;
use crate::wire::codec::Frame;
use crate::wire::entry::Entry;
use crate::wire::frame::write_frame;

pub struct WriterCtx {
    pub shared_writer: Arc<AsyncMutex<BufWriter<WriteHalf<Transport>>>>,
    pub tag_table: Arc<std::sync::Mutex<TagTable>>,
    pub tag_manager: Arc<TagManager>,
    pub sync_waiters: SyncWaiters,
    pub rate_limiter: Arc<RateLimiter>,
    pub keepalive_interval: Duration,
    pub last_activity: tokio::sync::watch::Sender<Instant>,
}

async fn send_frame(ctx: &WriterCtx, frame: Frame) -> Result<(), MuxError> {
    let payload = frame.encode_payload();
    let mut w = ctx.shared_writer.lock().await;
    write_frame(&mut *w, frame.command_id(), &payload)
        .await
        .map_err(|e| MuxError::transport(format!("writing frame: {e}")))?;
    w.flush()
        .await
        .map_err(|e| MuxError::transport(format!("flushing frame: {e}")))?;
    Ok(())
}

/// Resolve `process_tag` to a remote tag ID, negotiating lazily on first use.
async fn resolve_tag(ctx: &WriterCtx, process_tag: u16) -> Result<u16, MuxError> {
    {
        #[allow(clippy::unwrap_used)]
        let table = ctx.tag_table.lock().unwrap();
        if let Some(remote) = table.resolved(process_tag) {
            return Ok(remote);
        }
    }

    let name = ctx
        .tag_manager
        .lookup_by_id(process_tag)
        .ok_or_else(|| MuxError::protocol(format!("no tag name registered for process-local tag {process_tag}")))?;

    let (tx, rx) = oneshot::channel();
    {
        #[allow(clippy::unwrap_used)]
        let mut table = ctx.tag_table.lock().unwrap();
        table.push_pending(process_tag, tx);
    }
    send_frame(ctx, Frame::NegTag { name }).await?;

    let outcome = rx
        .await
        .map_err(|_| MuxError::transport("connection closed while negotiating tag"))?;
    Ok(outcome.remote_tag)
}

async fn send_entry(ctx: &WriterCtx, entry: &Entry) -> Result<(), MuxError> {
    let remote_tag = resolve_tag(ctx, entry.tag).await?;
    let mut wire_entry = entry.clone();
    wire_entry.tag = remote_tag;
    let frame = Frame::Entry { entry: wire_entry };
    ctx.rate_limiter.acquire(frame.encode_payload().len()).await;
    send_frame(ctx, frame).await
}

pub async fn run_writer(
    ctx: WriterCtx,
    mut cmd_rx: mpsc::Receiver<ConnCmd>,
    fault_tx: mpsc::Sender<MuxError>,
    cancel: CancellationToken,
) {
    let mut idle_tick = tokio::time::interval(ctx.keepalive_interval);
    idle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("writer task cancelled");
                return;
            }
            _ = idle_tick.tick() => {
                let idle_for = Instant::now().saturating_duration_since(*ctx.last_activity.borrow());
                if idle_for >= ctx.keepalive_interval {
                    if let Err(e) = send_frame(&ctx, Frame::Ping).await {
                        let _ = fault_tx.try_send(e);
                        return;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("command channel closed, writer task exiting");
                    return;
                };
                let result = match cmd {
                    ConnCmd::Write(entry) => send_entry(&ctx, &entry).await,
                    ConnCmd::WriteBatch(entries) => {
                        let mut wire_entries = Vec::with_capacity(entries.len());
                        let mut err = None;
                        for entry in &entries {
                            match resolve_tag(&ctx, entry.tag).await {
                                Ok(remote_tag) => {
                                    let mut wire_entry = entry.clone();
                                    wire_entry.tag = remote_tag;
                                    wire_entries.push(wire_entry);
                                }
                                Err(e) => {
                                    err = Some(e);
                                    break;
                                }
                            }
                        }
                        match err {
                            Some(e) => Err(e),
                            None => {
                                let frame = Frame::Batch { entries: wire_entries };
                                ctx.rate_limiter.acquire(frame.encode_payload().len()).await;
                                send_frame(&ctx, frame).await
                            }
                        }
                    }
                    ConnCmd::Sync { cursor, ack } => {
                        {
                            #[allow(clippy::unwrap_used)]
                            let mut waiters = ctx.sync_waiters.lock().unwrap();
                            waiters.insert(cursor, ack);
                        }
                        send_frame(&ctx, Frame::Sync { cursor }).await
                    }
                    ConnCmd::State(json) => send_frame(&ctx, Frame::State { json }).await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "writer task failed, signalling connection fault");
                    let _ = fault_tx.try_send(e);
                    return;
                }
                let _ = ctx.last_activity.send(Instant::now());
                idle_tick.reset();
            }
        }
    }
}
