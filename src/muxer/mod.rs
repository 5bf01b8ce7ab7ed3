// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The Muxer: a pool of Connections plus a Cache, with dispatch,
//! backpressure, hot/cold rebalancing, rate limiting and graceful shutdown.
//! This is the producer-facing surface of the crate.

pub mod config;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheConfig};
use crate::conn::{Connection, ConnConfig, MuxerNotify};
use crate::error::MuxError;
use crate::ratelimit::RateLimiter;
use crate::tag::TagManager;
use crate::wire::entry::{Entry, SrcAddr};

pub use config::{CacheMode, LogLevel, MuxerConfig};

/// Poll interval used while waiting for any Connection to turn Hot. Each
/// Connection already wakes on its own state change; this bound just caps
/// how long a torn-down Connection (replaced mid-wait) can go unnoticed.
const HOT_WAIT_POLL: Duration = Duration::from_millis(100);

/// Pool of Connections, the shared Cache, Tag Manager and rate limiter.
///
/// Mirrors the teacher's `Pool`: a `Weak` self-reference set once, at
/// construction via `Arc::new_cyclic`, so background callbacks
/// (`on_hot`/`on_dead`) can spawn further work against the same `Arc` the
/// caller holds.
struct MuxerInner {
    cfg: MuxerConfig,
    connections: Vec<Arc<Connection>>,
    cache: Option<Arc<Cache>>,
    tag_manager: Arc<TagManager>,
    rate_limiter: Arc<RateLimiter>,
    closing: AtomicBool,
    rr: AtomicUsize,
    draining: AtomicBool,
    self_weak: Weak<MuxerInner>,
}

impl MuxerNotify for MuxerInner {
    fn on_hot(&self, conn_id: usize) {
        info!(conn_id, "connection is hot");
        let Some(cache) = self.cache.clone() else { return };
        if cache.empty() {
            return;
        }
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(drain_loop(self.self_weak.clone(), conn_id));
    }

    fn on_dead(&self, conn_id: usize) {
        warn!(conn_id, "connection is dead");
    }
}

/// Background task spawned on a Dead→Hot transition: pulls batches from the
/// Cache and pushes them onto the newly-Hot Connection until the Cache is
/// empty, the Connection faults, or the Muxer starts closing. Does not
/// restart itself; the next `on_hot` call (of any Connection) resumes it.
async fn drain_loop(muxer: Weak<MuxerInner>, conn_id: usize) {
    loop {
        let Some(inner) = muxer.upgrade() else { return };
        if inner.closing.load(Ordering::SeqCst) {
            inner.draining.store(false, Ordering::SeqCst);
            return;
        }
        let Some(conn) = inner.connections.get(conn_id).cloned() else {
            inner.draining.store(false, Ordering::SeqCst);
            return;
        };
        if !conn.is_hot() {
            inner.draining.store(false, Ordering::SeqCst);
            return;
        }
        let Some(cache) = inner.cache.clone() else {
            inner.draining.store(false, Ordering::SeqCst);
            return;
        };
        let budget_bytes = inner.cfg.drain_batch.saturating_mul(inner.cfg.max_entry_size).max(4096);
        drop(inner);

        let result = cache.drain_tick(budget_bytes, |batch| conn.try_write_batch(batch.to_vec()).is_ok());

        match result {
            Ok((0, remaining_bytes)) => {
                if remaining_bytes == 0 {
                    if let Some(inner) = muxer.upgrade() {
                        inner.draining.store(false, Ordering::SeqCst);
                    }
                    return;
                }
                // Sink refused the batch — queue briefly full. Back off and
                // retry rather than busy-spinning on the same batch.
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(_) => {
                tokio::task::yield_now().await;
            }
            Err(e) => {
                warn!(error = %e, "cache drain failed, stopping drain task");
                if let Some(inner) = muxer.upgrade() {
                    inner.draining.store(false, Ordering::SeqCst);
                }
                return;
            }
        }
    }
}

/// Handle to a running Muxer. Cloning shares the same pool.
#[derive(Clone)]
pub struct Muxer {
    inner: Arc<MuxerInner>,
}

impl Muxer {
    /// Build a Muxer and its Connections. Connections start dialing
    /// immediately; use `wait_for_hot` to block until one is ready.
    pub fn start(cfg: MuxerConfig) -> Result<Self, MuxError> {
        cfg.validate()?;

        let tag_manager = Arc::new(TagManager::new());
        for name in &cfg.tags {
            tag_manager.negotiate(name)?;
        }

        let rate_limiter = Arc::new(RateLimiter::new(cfg.rate_limit_bps)?);

        let cache = if cfg.cache_enabled {
            Some(Arc::new(Cache::open(CacheConfig {
                dir: std::path::PathBuf::from(&cfg.cache_path),
                max_bytes: cfg.max_cache_mb * 1024 * 1024,
                segment_size: cfg.segment_mb * 1024 * 1024,
                compress: cfg.cache_compress,
            })?))
        } else {
            None
        };

        let targets = cfg.parsed_destinations()?;
        let ingester_uuid = cfg.ingester_uuid_bytes()?;
        let conn_cfg = ConnConfig {
            dial_timeout: cfg.dial_timeout,
            insecure_skip_tls_verify: cfg.insecure_skip_tls_verify,
            secret: cfg.auth.clone().into_bytes(),
            ingester_uuid,
            ingester_name: cfg.ingester_name.clone(),
            queue_depth: cfg.queue_depth,
            keepalive_interval: cfg.keepalive_interval,
            keepalive_timeout: cfg.keepalive_timeout,
        };

        let inner = Arc::new_cyclic(move |weak: &Weak<MuxerInner>| {
            let notify: Weak<dyn MuxerNotify> = weak.clone();
            let connections: Vec<Arc<Connection>> = targets
                .into_iter()
                .enumerate()
                .map(|(id, target)| {
                    Connection::spawn(id, target, conn_cfg.clone(), tag_manager.clone(), rate_limiter.clone(), notify.clone())
                })
                .collect();

            MuxerInner {
                cfg,
                connections,
                cache,
                tag_manager,
                rate_limiter,
                closing: AtomicBool::new(false),
                rr: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                self_weak: weak.clone(),
            }
        });

        Ok(Muxer { inner })
    }

    /// Block until at least one Connection is Hot, or `timeout` elapses.
    pub async fn wait_for_hot(&self, timeout: Duration) -> Result<(), MuxError> {
        tokio::time::timeout(timeout, async {
            while !self.any_hot() {
                tokio::time::sleep(HOT_WAIT_POLL).await;
            }
        })
        .await
        .map_err(|_| MuxError::NotHot)
    }

    fn any_hot(&self) -> bool {
        self.inner.connections.iter().any(|c| c.is_hot())
    }

    fn hot_connections(&self) -> Vec<&Arc<Connection>> {
        self.inner.connections.iter().filter(|c| c.is_hot()).collect()
    }

    fn source_for(&self, entry: &Entry) -> SrcAddr {
        if entry.src != SrcAddr::None {
            return entry.src;
        }
        self.inner.cfg.parsed_source_override().ok().flatten().unwrap_or(SrcAddr::None)
    }

    /// Dispatch one Entry per the §4.5 policy: shortest-queue Hot
    /// Connection with round-robin tie-break, falling back to the Cache (or
    /// blocking, if caching is disabled) when no Connection accepts it.
    pub async fn write_entry(&self, mut entry: Entry) -> Result<(), MuxError> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(MuxError::Closing);
        }
        let size = entry.byte_length();
        if size > self.inner.cfg.max_entry_size {
            return Err(MuxError::Oversize { size, max: self.inner.cfg.max_entry_size });
        }
        entry.src = self.source_for(&entry);

        if let Some(cache) = &self.inner.cache {
            if self.inner.cfg.cache_mode == CacheMode::Always {
                // Always mode: persist-and-drain only. The drain task is the
                // sole path an Entry takes to a Connection, so it must not
                // also be dispatched live here.
                cache.append(&entry)?;
                return Ok(());
            }
        }

        if self.try_dispatch(&entry) {
            return Ok(());
        }

        if let Some(cache) = &self.inner.cache {
            if self.inner.cfg.cache_mode == CacheMode::Fallback {
                cache.append(&entry)?;
            }
            return Ok(());
        }

        match self.wait_for_hot(self.inner.cfg.connection_timeout).await {
            Ok(()) if self.try_dispatch(&entry) => Ok(()),
            _ => Err(MuxError::NotHot),
        }
    }

    pub async fn write_batch(&self, entries: Vec<Entry>) -> Result<(), MuxError> {
        for entry in entries {
            self.write_entry(entry).await?;
        }
        Ok(())
    }

    /// Try every currently-Hot Connection, shortest-queue first with
    /// round-robin tie-break, until one accepts the Entry.
    fn try_dispatch(&self, entry: &Entry) -> bool {
        let mut hot = self.hot_connections();
        if hot.is_empty() {
            return false;
        }
        let start = self.inner.rr.fetch_add(1, Ordering::Relaxed) % hot.len();
        hot.rotate_left(start);
        hot.sort_by_key(|c| std::cmp::Reverse(c.spare_capacity().unwrap_or(0)));
        for conn in hot {
            if conn.try_write(entry.clone()).is_ok() {
                return true;
            }
        }
        false
    }

    /// Issue `SYNC` on every currently-Hot Connection and wait for all acks.
    pub async fn sync(&self, timeout: Duration) -> Result<(), MuxError> {
        let hot = self.hot_connections();
        if hot.is_empty() {
            return Err(MuxError::NotHot);
        }
        for conn in hot {
            conn.sync(timeout).await?;
        }
        Ok(())
    }

    /// Stop accepting new writes, flush in-flight queues via a final SYNC on
    /// every still-Hot Connection, emit a shutdown STATE frame, then close
    /// every Connection.
    pub async fn close(&self, deadline: Duration) {
        self.inner.closing.store(true, Ordering::SeqCst);

        let shutdown_state = serde_json::json!({ "state": "shutdown" }).to_string();
        for conn in self.hot_connections() {
            let _ = conn.try_send_state(bytes::Bytes::from(shutdown_state.clone()));
            if let Err(e) = conn.sync(deadline).await {
                debug!(error = %e, "final SYNC did not complete cleanly before shutdown");
            }
        }

        for conn in &self.inner.connections {
            conn.shutdown();
        }
    }

    pub fn tag_manager(&self) -> &Arc<TagManager> {
        &self.inner.tag_manager
    }

    pub fn cache_size(&self) -> u64 {
        self.inner.cache.as_ref().map(|c| c.size()).unwrap_or(0)
    }
}
