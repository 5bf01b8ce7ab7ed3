// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Environment variable overrides applied on top of a loaded `MuxerConfig`,
//! for the handful of values an embedding deployment typically wants to set
//! without touching the file: the shared secret, destinations by scheme, and
//! log level. A `*_FILE` variant of a var takes the first non-empty line of
//! the named file over the bare var.

use std::fs;

use crate::muxer::config::{LogLevel, MuxerConfig};

const INGEST_SECRET: &str = "INGEST_SECRET";
const INGEST_SECRET_FILE: &str = "INGEST_SECRET_FILE";
const CLEARTEXT_TARGETS: &str = "CLEARTEXT_TARGETS";
const ENCRYPTED_TARGETS: &str = "ENCRYPTED_TARGETS";
const PIPE_TARGETS: &str = "PIPE_TARGETS";
const LOG_LEVEL: &str = "LOG_LEVEL";

fn first_nonempty_line(path: &str) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    raw.lines().map(str::trim).find(|l| !l.is_empty()).map(str::to_string)
}

/// Read `var`, preferring the first non-empty line of `${var}_FILE` when
/// that variable is set.
fn read_var_or_file(var: &str, file_var: &str) -> Option<String> {
    if let Ok(path) = std::env::var(file_var) {
        if let Some(v) = first_nonempty_line(&path) {
            return Some(v);
        }
    }
    std::env::var(var).ok()
}

fn split_targets(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Apply §6's environment variable overrides to `cfg` in place.
pub fn apply(cfg: &mut MuxerConfig) {
    if let Some(secret) = read_var_or_file(INGEST_SECRET, INGEST_SECRET_FILE) {
        cfg.auth = secret;
    }

    let mut extra = Vec::new();
    if let Ok(raw) = std::env::var(CLEARTEXT_TARGETS) {
        extra.extend(split_targets(&raw).map(|addr| format!("tcp://{addr}")));
    }
    if let Ok(raw) = std::env::var(ENCRYPTED_TARGETS) {
        extra.extend(split_targets(&raw).map(|addr| format!("tls://{addr}")));
    }
    if let Ok(raw) = std::env::var(PIPE_TARGETS) {
        extra.extend(split_targets(&raw).map(|addr| format!("pipe://{addr}")));
    }
    if !extra.is_empty() {
        cfg.destinations = extra;
    }

    if let Ok(raw) = std::env::var(LOG_LEVEL) {
        if let Some(level) = parse_log_level(&raw) {
            cfg.log_level = level;
        }
    }
}

fn parse_log_level(raw: &str) -> Option<LogLevel> {
    match raw.to_ascii_lowercase().as_str() {
        "off" => Some(LogLevel::Off),
        "info" => Some(LogLevel::Info),
        "warn" | "warning" => Some(LogLevel::Warn),
        "error" => Some(LogLevel::Error),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // Environment variables are process-global; serialize tests that touch
    // them so parallel test runs don't interleave reads and writes.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn base_cfg() -> MuxerConfig {
        serde_yaml::from_str(
            r#"
destinations:
  - "tcp://indexer1:4023"
auth: "s3cret"
ingester_name: "demo"
"#,
        )
        .unwrap()
    }

    #[test]
    fn overrides_auth_from_plain_var() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var(INGEST_SECRET_FILE);
            std::env::set_var(INGEST_SECRET, "from-env");
        }
        let mut cfg = base_cfg();
        apply(&mut cfg);
        assert_eq!(cfg.auth, "from-env");
        unsafe { std::env::remove_var(INGEST_SECRET) };
    }

    #[test]
    fn file_variant_takes_precedence_over_plain_var() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        fs::write(&path, "from-file\n").unwrap();
        unsafe {
            std::env::set_var(INGEST_SECRET, "from-env");
            std::env::set_var(INGEST_SECRET_FILE, path.to_str().unwrap());
        }
        let mut cfg = base_cfg();
        apply(&mut cfg);
        assert_eq!(cfg.auth, "from-file");
        unsafe {
            std::env::remove_var(INGEST_SECRET);
            std::env::remove_var(INGEST_SECRET_FILE);
        }
    }

    #[test]
    fn target_vars_replace_destinations_by_scheme() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var(CLEARTEXT_TARGETS);
            std::env::remove_var(ENCRYPTED_TARGETS);
            std::env::set_var(PIPE_TARGETS, "/var/run/a.sock, /var/run/b.sock");
        }
        let mut cfg = base_cfg();
        apply(&mut cfg);
        assert_eq!(cfg.destinations, vec!["pipe:///var/run/a.sock", "pipe:///var/run/b.sock"]);
        unsafe { std::env::remove_var(PIPE_TARGETS) };
    }

    #[test]
    fn log_level_var_is_case_insensitive() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe { std::env::set_var(LOG_LEVEL, "WARN") };
        let mut cfg = base_cfg();
        apply(&mut cfg);
        assert_eq!(cfg.log_level, LogLevel::Warn);
        unsafe { std::env::remove_var(LOG_LEVEL) };
    }
}
