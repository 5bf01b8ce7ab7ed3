// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One logical session to one indexer: transport, handshake/auth, lazy tag
//! negotiation, the write path, and sync/ack.

mod handshake;
mod reader;
mod tagtable;
pub mod transport;
mod writer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::io::{split, AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MuxError;
use crate::ratelimit::RateLimiter;
use crate::tag::TagManager;
use crate::wire::entry::Entry;
use crate::wire::target::Target;
use tagtable::TagTable;
use transport::{dial, Transport};

pub type SyncWaiters = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<(), MuxError>>>>>;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const SEND_BUFFER_BYTES: usize = 2 * 1024 * 1024;

/// Callback surface a Connection uses to notify its owning Muxer of
/// state transitions. The Connection holds only a `Weak` reference —
/// mirroring a non-owning handle back to the pool that owns it.
pub trait MuxerNotify: Send + Sync {
    fn on_hot(&self, conn_id: usize);
    fn on_dead(&self, conn_id: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Dead,
    Connecting,
    Authenticating,
    Hot,
    /// Authentication was rejected. Not retried until the Muxer is
    /// reconfigured and rebuilds the Connection.
    Fatal,
}

impl ConnState {
    fn to_u8(self) -> u8 {
        match self {
            ConnState::Dead => 0,
            ConnState::Connecting => 1,
            ConnState::Authenticating => 2,
            ConnState::Hot => 3,
            ConnState::Fatal => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnState::Connecting,
            2 => ConnState::Authenticating,
            3 => ConnState::Hot,
            4 => ConnState::Fatal,
            _ => ConnState::Dead,
        }
    }
}

struct StateCell {
    state: AtomicU8,
    notify: Notify,
}

impl StateCell {
    fn new() -> Self {
        StateCell { state: AtomicU8::new(ConnState::Dead.to_u8()), notify: Notify::new() }
    }

    fn get(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, s: ConnState) {
        self.state.store(s.to_u8(), Ordering::Release);
        self.notify.notify_waiters();
    }
}

#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub dial_timeout: Duration,
    pub insecure_skip_tls_verify: bool,
    pub secret: Vec<u8>,
    pub ingester_uuid: [u8; 16],
    pub ingester_name: String,
    pub queue_depth: usize,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            dial_timeout: Duration::from_secs(10),
            insecure_skip_tls_verify: false,
            secret: Vec::new(),
            ingester_uuid: [0u8; 16],
            ingester_name: String::new(),
            queue_depth: 1024,
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(30),
        }
    }
}

enum ConnCmd {
    Write(Entry),
    WriteBatch(Vec<Entry>),
    Sync { cursor: u64, ack: oneshot::Sender<Result<(), MuxError>> },
    State(bytes::Bytes),
}

/// One Connection to one indexer, owning its own reconnect supervisor task.
pub struct Connection {
    pub id: usize,
    pub target: Target,
    state: Arc<StateCell>,
    cmd_tx: StdMutex<Option<mpsc::Sender<ConnCmd>>>,
    cancel: CancellationToken,
    next_sync_cursor: AtomicU64,
}

impl Connection {
    /// Spawn a Connection's reconnect supervisor task and return its handle.
    pub fn spawn(
        id: usize,
        target: Target,
        cfg: ConnConfig,
        tag_manager: Arc<TagManager>,
        rate_limiter: Arc<RateLimiter>,
        muxer: Weak<dyn MuxerNotify>,
    ) -> Arc<Self> {
        let state = Arc::new(StateCell::new());
        let cancel = CancellationToken::new();
        let conn = Arc::new(Connection {
            id,
            target: target.clone(),
            state: state.clone(),
            cmd_tx: StdMutex::new(None),
            cancel: cancel.clone(),
            next_sync_cursor: AtomicU64::new(1),
        });

        let supervised = conn.clone();
        tokio::spawn(async move {
            supervise(id, target, cfg, tag_manager, rate_limiter, muxer, state, cancel, supervised).await;
        });

        conn
    }

    pub fn state(&self) -> ConnState {
        self.state.get()
    }

    pub fn is_hot(&self) -> bool {
        self.state() == ConnState::Hot
    }

    /// Remaining queue capacity, used by the Muxer's dispatch policy to pick
    /// the Connection with the shortest outgoing queue. `None` if not
    /// currently connected.
    pub fn spare_capacity(&self) -> Option<usize> {
        #[allow(clippy::unwrap_used)]
        let guard = self.cmd_tx.lock().unwrap();
        guard.as_ref().map(|tx| tx.capacity())
    }

    /// Non-blocking enqueue. Returns `Err(NotHot)` if there is no live
    /// command channel or the queue is full — the Muxer treats both as "try
    /// the next Hot Connection".
    pub fn try_write(&self, entry: Entry) -> Result<(), MuxError> {
        #[allow(clippy::unwrap_used)]
        let guard = self.cmd_tx.lock().unwrap();
        let tx = guard.as_ref().ok_or(MuxError::NotHot)?;
        tx.try_send(ConnCmd::Write(entry)).map_err(|_| MuxError::NotHot)
    }

    pub fn try_write_batch(&self, entries: Vec<Entry>) -> Result<(), MuxError> {
        #[allow(clippy::unwrap_used)]
        let guard = self.cmd_tx.lock().unwrap();
        let tx = guard.as_ref().ok_or(MuxError::NotHot)?;
        tx.try_send(ConnCmd::WriteBatch(entries)).map_err(|_| MuxError::NotHot)
    }

    /// Send a STATE frame out-of-band, e.g. the shutdown notice.
    pub fn try_send_state(&self, json: bytes::Bytes) -> Result<(), MuxError> {
        #[allow(clippy::unwrap_used)]
        let guard = self.cmd_tx.lock().unwrap();
        let tx = guard.as_ref().ok_or(MuxError::NotHot)?;
        tx.try_send(ConnCmd::State(json)).map_err(|_| MuxError::NotHot)
    }

    pub async fn sync(&self, timeout: Duration) -> Result<(), MuxError> {
        let tx = {
            #[allow(clippy::unwrap_used)]
            let guard = self.cmd_tx.lock().unwrap();
            guard.as_ref().cloned().ok_or(MuxError::NotHot)?
        };
        let cursor = self.next_sync_cursor.fetch_add(1, Ordering::SeqCst);
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(ConnCmd::Sync { cursor, ack: ack_tx })
            .await
            .map_err(|_| MuxError::NotHot)?;
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MuxError::transport("connection closed while awaiting SYNC_ACK")),
            Err(_) => Err(MuxError::transport("SYNC timed out waiting for SYNC_ACK")),
        }
    }

    pub async fn wait_for_hot(&self) {
        loop {
            if self.is_hot() {
                return;
            }
            self.state.notify.notified().await;
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_INITIAL.as_millis() as u64 * 2u64.saturating_pow(attempt.min(16));
    let capped = exp.min(BACKOFF_CAP.as_millis() as u64);
    #[allow(clippy::unwrap_used)]
    let jittered = rand::rng().random_range(0..=capped.max(1));
    Duration::from_millis(jittered)
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    id: usize,
    target: Target,
    cfg: ConnConfig,
    tag_manager: Arc<TagManager>,
    rate_limiter: Arc<RateLimiter>,
    muxer: Weak<dyn MuxerNotify>,
    state: Arc<StateCell>,
    cancel: CancellationToken,
    conn: Arc<Connection>,
) {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        state.set(ConnState::Connecting);
        let dial_result = dial(&target, cfg.dial_timeout, cfg.insecure_skip_tls_verify).await;
        let mut transport = match dial_result {
            Ok(t) => t,
            Err(e) => {
                warn!(conn_id = id, error = %e, "dial failed, backing off");
                state.set(ConnState::Dead);
                if let Some(m) = muxer.upgrade() {
                    m.on_dead(id);
                }
                attempt += 1;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff_delay(attempt)) => continue,
                }
            }
        };

        state.set(ConnState::Authenticating);
        let handshake_result =
            handshake::run_handshake(&mut transport, cfg.ingester_uuid, cfg.ingester_name.clone(), cfg.secret.clone())
                .await;

        if let Err(e) = handshake_result {
            if matches!(e, MuxError::Auth(_)) {
                warn!(conn_id = id, error = %e, "authentication rejected, not retrying");
                state.set(ConnState::Fatal);
                if let Some(m) = muxer.upgrade() {
                    m.on_dead(id);
                }
                return;
            }
            warn!(conn_id = id, error = %e, "handshake failed, backing off");
            state.set(ConnState::Dead);
            if let Some(m) = muxer.upgrade() {
                m.on_dead(id);
            }
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff_delay(attempt)) => continue,
            }
        }

        attempt = 0;
        info!(conn_id = id, target = %target, "connection is hot");

        let (read_half, write_half) = split(transport);
        let shared_writer = Arc::new(AsyncMutex::new(BufWriter::with_capacity(SEND_BUFFER_BYTES, write_half)));
        let tag_table = Arc::new(StdMutex::new(TagTable::new()));
        let sync_waiters: SyncWaiters = Arc::new(StdMutex::new(HashMap::new()));
        let (last_activity_tx, last_activity_rx) = watch::channel(Instant::now());
        let (cmd_tx, cmd_rx) = mpsc::channel(cfg.queue_depth);
        let (fault_tx, mut fault_rx) = mpsc::channel(2);
        let task_cancel = CancellationToken::new();

        {
            #[allow(clippy::unwrap_used)]
            let mut guard = conn.cmd_tx.lock().unwrap();
            *guard = Some(cmd_tx);
        }
        state.set(ConnState::Hot);
        if let Some(m) = muxer.upgrade() {
            m.on_hot(id);
        }

        let reader_ctx = reader::ReaderCtx {
            shared_writer: shared_writer.clone(),
            tag_table: tag_table.clone(),
            sync_waiters: sync_waiters.clone(),
            last_activity: last_activity_tx.clone(),
        };
        let reader_fault_tx = fault_tx.clone();
        let reader_handle = tokio::spawn(async move {
            reader::run_reader(reader_ctx, read_half, reader_fault_tx).await;
        });

        let writer_ctx = writer::WriterCtx {
            shared_writer: shared_writer.clone(),
            tag_table: tag_table.clone(),
            tag_manager: tag_manager.clone(),
            sync_waiters: sync_waiters.clone(),
            rate_limiter: rate_limiter.clone(),
            keepalive_interval: cfg.keepalive_interval,
            last_activity: last_activity_tx.clone(),
        };
        let writer_fault_tx = fault_tx.clone();
        let writer_cancel = task_cancel.clone();
        let writer_handle = tokio::spawn(async move {
            writer::run_writer(writer_ctx, cmd_rx, writer_fault_tx, writer_cancel).await;
        });

        let fault = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(conn_id = id, "connection shutdown requested");
                task_cancel.cancel();
                let _ = reader_handle.await;
                let _ = writer_handle.await;
                {
                    #[allow(clippy::unwrap_used)]
                    let mut guard = conn.cmd_tx.lock().unwrap();
                    *guard = None;
                }
                state.set(ConnState::Dead);
                return;
            }
            f = fault_rx.recv() => f,
            _ = timeout_watch(&last_activity_rx, cfg.keepalive_timeout) => {
                Some(MuxError::transport("keepalive timeout: no traffic from indexer"))
            }
        };

        task_cancel.cancel();
        {
            #[allow(clippy::unwrap_used)]
            let mut guard = conn.cmd_tx.lock().unwrap();
            *guard = None;
        }
        let fault = fault.unwrap_or_else(|| MuxError::transport("connection task ended unexpectedly"));
        warn!(conn_id = id, error = %fault, "connection dropped to dead");

        let stale: Vec<_> = {
            #[allow(clippy::unwrap_used)]
            let mut waiters = sync_waiters.lock().unwrap();
            waiters.drain().collect()
        };
        for (_, ack) in stale {
            let _ = ack.send(Err(fault.clone()));
        }

        state.set(ConnState::Dead);
        if let Some(m) = muxer.upgrade() {
            m.on_dead(id);
        }

        attempt += 1;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff_delay(attempt)) => continue,
        }
    }
}

/// Resolves once no traffic has been observed for `timeout`.
async fn timeout_watch(last_activity: &watch::Receiver<Instant>, timeout: Duration) {
    loop {
        let last = *last_activity.borrow();
        let elapsed = Instant::now().saturating_duration_since(last);
        if elapsed >= timeout {
            return;
        }
        tokio::time::sleep(timeout - elapsed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_bounds() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d <= BACKOFF_CAP);
        }
    }

    #[test]
    fn conn_state_round_trips_through_u8() {
        for s in [ConnState::Dead, ConnState::Connecting, ConnState::Authenticating, ConnState::Hot, ConnState::Fatal] {
            assert_eq!(ConnState::from_u8(s.to_u8()), s);
        }
    }
}
