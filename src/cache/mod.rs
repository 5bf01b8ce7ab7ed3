// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bounded, append-oriented on-disk store of Entries written while no
//! Connection is hot. Segment-based ring buffer: an active segment plus
//! sealed `segment-<seq>.dat[.gz]` files, bounded by `max_bytes` through
//! whole-segment eviction (oldest first).

pub mod segment;

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::MuxError;
use crate::wire::Entry;
use segment::{encode_record, scan_records, scan_records_budgeted};

const META_FILE: &str = "cache.meta";
const GZ_SUFFIX: &str = ".gz";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_bytes: u64,
    pub segment_size: u64,
    pub compress: bool,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct CacheMeta {
    oldest_seq: u64,
    next_seq: u64,
}

struct SealedSegment {
    seq: u64,
    path: PathBuf,
    bytes: u64,
    compressed: bool,
}

struct Inner {
    dir: PathBuf,
    max_bytes: u64,
    segment_size: u64,
    compress: bool,
    active_path: PathBuf,
    active_file: File,
    active_bytes: u64,
    next_seq: u64,
    sealed: VecDeque<SealedSegment>,
    /// Read offset into the oldest unit currently being drained: the front
    /// of `sealed` if non-empty, otherwise the active segment.
    drain_pos: usize,
}

/// Segment-based on-disk cache of Entries awaiting delivery.
pub struct Cache {
    inner: Mutex<Inner>,
}

fn segment_path(dir: &Path, seq: u64, compressed: bool) -> PathBuf {
    let name = if compressed {
        format!("segment-{seq:020}.dat{GZ_SUFFIX}")
    } else {
        format!("segment-{seq:020}.dat")
    };
    dir.join(name)
}

fn parse_seq(file_name: &str) -> Option<(u64, bool)> {
    let stripped = file_name.strip_prefix("segment-")?;
    let (seq_str, compressed) = match stripped.strip_suffix(".dat.gz") {
        Some(s) => (s, true),
        None => (stripped.strip_suffix(".dat")?, false),
    };
    seq_str.parse::<u64>().ok().map(|seq| (seq, compressed))
}

impl Cache {
    pub fn open(cfg: CacheConfig) -> Result<Self, MuxError> {
        fs::create_dir_all(&cfg.dir)
            .map_err(|e| MuxError::cache(format!("creating cache dir {:?}: {e}", cfg.dir)))?;

        let mut sealed = Vec::new();
        let mut max_seq = 0u64;
        for entry in fs::read_dir(&cfg.dir)
            .map_err(|e| MuxError::cache(format!("reading cache dir {:?}: {e}", cfg.dir)))?
        {
            let entry = entry.map_err(|e| MuxError::cache(format!("reading cache dir entry: {e}")))?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else { continue };
            if let Some((seq, compressed)) = parse_seq(file_name) {
                let bytes = entry
                    .metadata()
                    .map_err(|e| MuxError::cache(format!("stat {file_name}: {e}")))?
                    .len();
                sealed.push(SealedSegment { seq, path: entry.path(), bytes, compressed });
                max_seq = max_seq.max(seq);
            }
        }
        sealed.sort_by_key(|s| s.seq);
        let sealed: VecDeque<SealedSegment> = sealed.into_iter().collect();
        let total_bytes: u64 = sealed.iter().map(|s| s.bytes).sum();

        let active_path = cfg.dir.join("active.dat");
        let mut active_bytes = 0u64;
        if active_path.exists() {
            let mut raw = Vec::new();
            File::open(&active_path)
                .and_then(|mut f| f.read_to_end(&mut raw))
                .map_err(|e| MuxError::cache(format!("reading active segment: {e}")))?;
            let (_entries, valid_len) = scan_records(&raw);
            if valid_len < raw.len() {
                tracing::warn!(
                    valid_len,
                    total_len = raw.len(),
                    "torn tail detected in active cache segment, truncating"
                );
            }
            let truncated = OpenOptions::new()
                .write(true)
                .open(&active_path)
                .map_err(|e| MuxError::cache(format!("truncating active segment: {e}")))?;
            truncated
                .set_len(valid_len as u64)
                .map_err(|e| MuxError::cache(format!("truncating active segment: {e}")))?;
            active_bytes = valid_len as u64;
        }

        let active_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active_path)
            .map_err(|e| MuxError::cache(format!("opening active segment: {e}")))?;

        let next_seq = max_seq + 1;
        Self::write_meta(&cfg.dir, sealed.front().map(|s| s.seq).unwrap_or(next_seq), next_seq)?;

        Ok(Cache {
            inner: Mutex::new(Inner {
                dir: cfg.dir,
                max_bytes: cfg.max_bytes,
                segment_size: cfg.segment_size,
                compress: cfg.compress,
                active_path,
                active_file,
                active_bytes,
                next_seq,
                sealed,
                drain_pos: 0,
            }),
        })
    }

    fn write_meta(dir: &Path, oldest_seq: u64, next_seq: u64) -> Result<(), MuxError> {
        let meta = CacheMeta { oldest_seq, next_seq };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| MuxError::cache(format!("serializing cache.meta: {e}")))?;
        fs::write(dir.join(META_FILE), json)
            .map_err(|e| MuxError::cache(format!("writing cache.meta: {e}")))
    }

    /// Append one Entry. Atomic for the single record: either the whole
    /// record lands in the active segment, or nothing does. Fsync happens
    /// only at segment rollover, not on every append.
    pub fn append(&self, entry: &Entry) -> Result<(), MuxError> {
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();
        let record = encode_record(entry);

        if inner.active_bytes > 0 && inner.active_bytes + record.len() as u64 > inner.segment_size {
            Self::seal_active(&mut inner)?;
        }

        inner
            .active_file
            .write_all(&record)
            .map_err(|e| MuxError::cache(format!("appending cache record: {e}")))?;
        inner
            .active_file
            .flush()
            .map_err(|e| MuxError::cache(format!("flushing cache record: {e}")))?;
        inner.active_bytes += record.len() as u64;

        Self::evict_if_needed(&mut inner)?;
        Ok(())
    }

    fn seal_active(inner: &mut Inner) -> Result<(), MuxError> {
        inner
            .active_file
            .sync_all()
            .map_err(|e| MuxError::cache(format!("fsyncing segment at rollover: {e}")))?;

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let sealed_path = segment_path(&inner.dir, seq, inner.compress);

        let bytes = if inner.compress {
            let mut raw = Vec::new();
            File::open(&inner.active_path)
                .and_then(|mut f| f.read_to_end(&mut raw))
                .map_err(|e| MuxError::cache(format!("reading segment for compression: {e}")))?;
            let out = File::create(&sealed_path)
                .map_err(|e| MuxError::cache(format!("creating sealed segment: {e}")))?;
            let mut encoder = GzEncoder::new(out, Compression::default());
            encoder
                .write_all(&raw)
                .map_err(|e| MuxError::cache(format!("gzip-compressing segment: {e}")))?;
            encoder
                .finish()
                .map_err(|e| MuxError::cache(format!("finishing gzip segment: {e}")))?;
            fs::remove_file(&inner.active_path)
                .map_err(|e| MuxError::cache(format!("removing raw segment after compression: {e}")))?;
            fs::metadata(&sealed_path)
                .map_err(|e| MuxError::cache(format!("stat sealed segment: {e}")))?
                .len()
        } else {
            fs::rename(&inner.active_path, &sealed_path)
                .map_err(|e| MuxError::cache(format!("sealing segment: {e}")))?;
            inner.active_bytes
        };

        inner.sealed.push_back(SealedSegment { seq, path: sealed_path, bytes, compressed: inner.compress });

        inner.active_file = OpenOptions::new()
            .create(true)
            .append(true)
            .truncate(true)
            .open(&inner.active_path)
            .map_err(|e| MuxError::cache(format!("reopening active segment: {e}")))?;
        inner.active_bytes = 0;
        inner.drain_pos = 0;

        Self::write_meta(&inner.dir, inner.sealed.front().map(|s| s.seq).unwrap_or(inner.next_seq), inner.next_seq)
    }

    fn total_bytes(inner: &Inner) -> u64 {
        inner.sealed.iter().map(|s| s.bytes).sum::<u64>() + inner.active_bytes
    }

    fn evict_if_needed(inner: &mut Inner) -> Result<(), MuxError> {
        while Self::total_bytes(inner) > inner.max_bytes {
            let Some(oldest) = inner.sealed.pop_front() else { break };
            fs::remove_file(&oldest.path)
                .map_err(|e| MuxError::cache(format!("evicting segment {:?}: {e}", oldest.path)))?;
            inner.drain_pos = 0;
            tracing::info!(seq = oldest.seq, bytes = oldest.bytes, "evicted oldest cache segment");
        }
        Self::write_meta(&inner.dir, inner.sealed.front().map(|s| s.seq).unwrap_or(inner.next_seq), inner.next_seq)
    }

    fn read_unit(path: &Path, compressed: bool) -> Result<Vec<u8>, MuxError> {
        let mut raw = Vec::new();
        File::open(path)
            .map_err(|e| MuxError::cache(format!("opening {path:?}: {e}")))?
            .read_to_end(&mut raw)
            .map_err(|e| MuxError::cache(format!("reading {path:?}: {e}")))?;
        if compressed {
            let mut decoder = GzDecoder::new(&raw[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| MuxError::cache(format!("gzip-decompressing {path:?}: {e}")))?;
            Ok(out)
        } else {
            Ok(raw)
        }
    }

    /// Drain up to `max_bytes_per_tick` worth of Entries, oldest first, into
    /// `sink`. On `sink` returning `false` the read cursor does not advance
    /// and the batch remains at the head for the next call.
    pub fn drain_tick(
        &self,
        max_bytes_per_tick: usize,
        sink: impl FnOnce(&[Entry]) -> bool,
    ) -> Result<(usize, u64), MuxError> {
        #[allow(clippy::unwrap_used)]
        let mut inner = self.inner.lock().unwrap();

        let (unit_path, compressed, from_active) = if let Some(front) = inner.sealed.front() {
            (front.path.clone(), front.compressed, false)
        } else if inner.active_bytes > 0 {
            (inner.active_path.clone(), false, true)
        } else {
            return Ok((0, Self::total_bytes(&inner)));
        };

        let data = Self::read_unit(&unit_path, compressed)?;
        let (batch, new_offset) = scan_records_budgeted(&data, inner.drain_pos, max_bytes_per_tick);

        if batch.is_empty() {
            return Ok((0, Self::total_bytes(&inner)));
        }

        if !sink(&batch) {
            return Ok((0, Self::total_bytes(&inner)));
        }

        let consumed = new_offset - inner.drain_pos;
        inner.drain_pos = new_offset;
        if !from_active {
            if let Some(front) = inner.sealed.front_mut() {
                front.bytes = front.bytes.saturating_sub(consumed as u64);
            }
            if new_offset >= data.len() {
                if let Some(front) = inner.sealed.pop_front() {
                    fs::remove_file(&front.path)
                        .map_err(|e| MuxError::cache(format!("removing drained segment {:?}: {e}", front.path)))?;
                }
                inner.drain_pos = 0;
                Self::write_meta(
                    &inner.dir,
                    inner.sealed.front().map(|s| s.seq).unwrap_or(inner.next_seq),
                    inner.next_seq,
                )?;
            }
        } else {
            inner.active_bytes = inner.active_bytes.saturating_sub(consumed as u64);
        }

        Ok((batch.len(), Self::total_bytes(&inner)))
    }

    pub fn size(&self) -> u64 {
        #[allow(clippy::unwrap_used)]
        let inner = self.inner.lock().unwrap();
        Self::total_bytes(&inner)
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::tempdir;

    use super::*;

    fn cfg(dir: &Path) -> CacheConfig {
        CacheConfig { dir: dir.to_path_buf(), max_bytes: 1024 * 1024, segment_size: 4096, compress: false }
    }

    #[test]
    fn append_then_drain_preserves_order() {
        let dir = tempdir().unwrap();
        let cache = Cache::open(cfg(dir.path())).unwrap();
        for i in 0..20 {
            let entry = Entry::new(i, 0, 0, Bytes::from(format!("entry-{i}")));
            cache.append(&entry).unwrap();
        }
        assert!(!cache.empty());

        let mut drained = Vec::new();
        loop {
            let mut got = Vec::new();
            let (n, _remaining) = cache
                .drain_tick(4096, |batch| {
                    got = batch.to_vec();
                    true
                })
                .unwrap();
            if n == 0 {
                break;
            }
            drained.extend(got);
        }
        assert_eq!(drained.len(), 20);
        for (i, entry) in drained.iter().enumerate() {
            assert_eq!(entry.sec, i as i64);
        }
        assert!(cache.empty());
    }

    #[test]
    fn failed_sink_does_not_advance_cursor() {
        let dir = tempdir().unwrap();
        let cache = Cache::open(cfg(dir.path())).unwrap();
        cache.append(&Entry::new(1, 0, 0, Bytes::from_static(b"x"))).unwrap();

        let (n, _) = cache.drain_tick(4096, |_| false).unwrap();
        assert_eq!(n, 0);
        assert!(!cache.empty());

        let mut seen = 0;
        let (n, _) = cache
            .drain_tick(4096, |batch| {
                seen = batch.len();
                true
            })
            .unwrap();
        assert_eq!(n, seen);
        assert!(cache.empty());
    }

    #[test]
    fn eviction_keeps_total_bytes_bounded() {
        let dir = tempdir().unwrap();
        let mut small = cfg(dir.path());
        small.max_bytes = 2048;
        small.segment_size = 512;
        let cache = Cache::open(small).unwrap();
        for i in 0..200u64 {
            let entry = Entry::new(i as i64, 0, 0, Bytes::from(vec![b'a'; 64]));
            cache.append(&entry).unwrap();
        }
        assert!(cache.size() <= 2048 + 512);
    }

    #[test]
    fn reopen_recovers_from_torn_tail() {
        let dir = tempdir().unwrap();
        {
            let cache = Cache::open(cfg(dir.path())).unwrap();
            cache.append(&Entry::new(1, 0, 0, Bytes::from_static(b"a"))).unwrap();
            cache.append(&Entry::new(2, 0, 0, Bytes::from_static(b"b"))).unwrap();
        }
        let active_path = dir.path().join("active.dat");
        let mut raw = std::fs::read(&active_path).unwrap();
        raw.truncate(raw.len() - 2);
        std::fs::write(&active_path, &raw).unwrap();

        let cache = Cache::open(cfg(dir.path())).unwrap();
        let mut drained = Vec::new();
        loop {
            let mut got = Vec::new();
            let (n, _) = cache
                .drain_tick(4096, |batch| {
                    got = batch.to_vec();
                    true
                })
                .unwrap();
            if n == 0 {
                break;
            }
            drained.extend(got);
        }
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].data, Bytes::from_static(b"a"));
    }

    #[test]
    fn gzip_compression_round_trips_through_rollover() {
        let dir = tempdir().unwrap();
        let mut c = cfg(dir.path());
        c.compress = true;
        c.segment_size = 200;
        let cache = Cache::open(c).unwrap();
        for i in 0..50u64 {
            cache.append(&Entry::new(i as i64, 0, 0, Bytes::from(vec![b'z'; 32]))).unwrap();
        }

        let mut drained = Vec::new();
        loop {
            let mut got = Vec::new();
            let (n, _) = cache
                .drain_tick(4096, |batch| {
                    got = batch.to_vec();
                    true
                })
                .unwrap();
            if n == 0 {
                break;
            }
            drained.extend(got);
        }
        assert_eq!(drained.len(), 50);
    }
}
