// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process-wide tag name → process-local tag ID table.
//!
//! Independent of any Connection: each Connection keeps its own
//! name → indexer-assigned-ID table (see `conn::tagtable`) and negotiates
//! lazily against the indexer on first use of a process-local tag.

use dashmap::DashMap;

use crate::error::MuxError;
use crate::wire::{TAG_DEFAULT, TAG_SELF_LOG};

const FORBIDDEN_CHARS: &str = " \t\r\n!\"#$%&'()*+,-./:;<=>?@[\\]^`{|}~";

/// Validate a tag name against spec: printable ASCII, 1..256 bytes, no
/// forbidden characters.
pub fn validate_tag_name(name: &str) -> Result<(), MuxError> {
    if name.is_empty() || name.len() > 256 {
        return Err(MuxError::config(format!(
            "tag name must be 1..256 bytes, got {} bytes",
            name.len()
        )));
    }
    if !name.is_ascii() {
        return Err(MuxError::config(format!("tag name {name:?} must be printable ASCII")));
    }
    for b in name.bytes() {
        if !(0x20..=0x7E).contains(&b) {
            return Err(MuxError::config(format!("tag name {name:?} contains a non-printable byte")));
        }
        if FORBIDDEN_CHARS.as_bytes().contains(&b) {
            return Err(MuxError::config(format!(
                "tag name {name:?} contains forbidden character {:?}",
                b as char
            )));
        }
    }
    Ok(())
}

/// Process-wide map of tag names to process-local tag IDs.
///
/// Assignment is monotonic starting at 0, skipping the two reserved values.
/// `DashMap` gives us the short, lock-free-ish critical sections the spec
/// calls for without a coarser mutex around the whole table.
#[derive(Debug, Default)]
pub struct TagManager {
    by_name: DashMap<String, u16>,
    by_id: DashMap<u16, String>,
    next_id: std::sync::atomic::AtomicU32,
}

impl TagManager {
    pub fn new() -> Self {
        let tm = TagManager {
            by_name: DashMap::new(),
            by_id: DashMap::new(),
            next_id: std::sync::atomic::AtomicU32::new(0),
        };
        tm.by_name.insert("default".to_string(), TAG_DEFAULT);
        tm.by_id.insert(TAG_DEFAULT, "default".to_string());
        tm.by_name.insert("gravwell".to_string(), TAG_SELF_LOG);
        tm.by_id.insert(TAG_SELF_LOG, "gravwell".to_string());
        tm
    }

    /// Resolve `name` to its process-local ID, assigning one on first use.
    pub fn negotiate(&self, name: &str) -> Result<u16, MuxError> {
        validate_tag_name(name)?;
        if let Some(id) = self.by_name.get(name) {
            return Ok(*id);
        }

        loop {
            let candidate = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let candidate = u16::try_from(candidate)
                .map_err(|_| MuxError::config("tag ID space exhausted (process-local IDs are 16-bit)"))?;
            if candidate == TAG_DEFAULT || candidate == TAG_SELF_LOG {
                continue;
            }
            match self.by_name.entry(name.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(existing) => return Ok(*existing.get()),
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(candidate);
                    self.by_id.insert(candidate, name.to_string());
                    return Ok(candidate);
                }
            }
        }
    }

    pub fn lookup_by_id(&self, id: u16) -> Option<String> {
        self.by_id.get(&id).map(|r| r.clone())
    }

    pub fn known_tags(&self) -> Vec<String> {
        self.by_name.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names_map_to_reserved_ids() {
        let tm = TagManager::new();
        assert_eq!(tm.negotiate("default").unwrap(), TAG_DEFAULT);
        assert_eq!(tm.negotiate("gravwell").unwrap(), TAG_SELF_LOG);
    }

    #[test]
    fn negotiate_is_idempotent() {
        let tm = TagManager::new();
        let a = tm.negotiate("t1").unwrap();
        let b = tm.negotiate("t1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn negotiate_skips_reserved_ids() {
        let tm = TagManager::new();
        for i in 0..5 {
            let id = tm.negotiate(&format!("t{i}")).unwrap();
            assert_ne!(id, TAG_DEFAULT);
            assert_ne!(id, TAG_SELF_LOG);
        }
    }

    #[test]
    fn rejects_forbidden_characters() {
        let tm = TagManager::new();
        assert!(tm.negotiate("bad tag").is_err());
        assert!(tm.negotiate("bad/tag").is_err());
    }

    #[test]
    fn lookup_by_id_round_trips() {
        let tm = TagManager::new();
        let id = tm.negotiate("svc_a").unwrap();
        assert_eq!(tm.lookup_by_id(id).as_deref(), Some("svc_a"));
    }

    #[test]
    fn known_tags_includes_reserved_and_new() {
        let tm = TagManager::new();
        tm.negotiate("svc_a").unwrap();
        let known = tm.known_tags();
        assert!(known.contains(&"default".to_string()));
        assert!(known.contains(&"svc_a".to_string()));
    }
}
