// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `MuxerConfig`: the `[global]` section of the configuration file plus
//! everything `Muxer::start` needs. Loaded from YAML and validated
//! explicitly, field by field — never via reflection.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::MuxError;
use crate::wire::entry::SrcAddr;
use crate::wire::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    /// Persist every Entry to the Cache, in addition to live dispatch.
    Always,
    /// Use the Cache only when no Connection is Hot.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MuxerConfig {
    /// Ordered list of target URLs (`tcp://`, `tls://`, `pipe://`).
    pub destinations: Vec<String>,
    /// Shared secret sent in `AUTH`.
    pub auth: String,
    /// Pre-declared tag names, negotiated eagerly at `Start()`.
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
    #[serde(default = "default_max_cache_mb")]
    pub max_cache_mb: u64,
    #[serde(default = "default_cache_mode")]
    pub cache_mode: CacheMode,
    #[serde(default)]
    pub cache_compress: bool,
    #[serde(default = "default_segment_mb")]
    pub segment_mb: u64,
    #[serde(default = "default_drain_batch")]
    pub drain_batch: usize,

    #[serde(default = "default_rate_limit_bps")]
    pub rate_limit_bps: u64,
    #[serde(default = "default_connection_timeout_secs", with = "secs")]
    pub connection_timeout: Duration,
    #[serde(default = "default_dial_timeout_secs", with = "secs")]
    pub dial_timeout: Duration,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    #[serde(default = "default_keepalive_interval_secs", with = "secs")]
    pub keepalive_interval: Duration,
    #[serde(default = "default_keepalive_timeout_secs", with = "secs")]
    pub keepalive_timeout: Duration,

    pub ingester_name: String,
    #[serde(default)]
    pub ingester_uuid: String,
    #[serde(default)]
    pub ingester_label: String,
    #[serde(default)]
    pub ingester_version: String,

    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// 4- or 16-byte hex-encoded default `src`, substituted when an Entry
    /// arrives with `SrcAddr::None`.
    #[serde(default)]
    pub source_override: Option<String>,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_max_entry_size")]
    pub max_entry_size: usize,
}

fn default_cache_path() -> String {
    "./cache".to_string()
}
fn default_max_cache_mb() -> u64 {
    512
}
fn default_cache_mode() -> CacheMode {
    CacheMode::Fallback
}
fn default_segment_mb() -> u64 {
    64
}
fn default_drain_batch() -> usize {
    256
}
fn default_rate_limit_bps() -> u64 {
    10 * 1024 * 1024
}
fn default_connection_timeout_secs() -> Duration {
    Duration::from_secs(10)
}
fn default_dial_timeout_secs() -> Duration {
    Duration::from_secs(10)
}
fn default_true() -> bool {
    true
}
fn default_keepalive_interval_secs() -> Duration {
    Duration::from_secs(10)
}
fn default_keepalive_timeout_secs() -> Duration {
    Duration::from_secs(30)
}
fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_queue_depth() -> usize {
    1024
}
fn default_max_entry_size() -> usize {
    crate::wire::DEFAULT_MAX_ENTRY_SIZE
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

impl MuxerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading muxer config file")?;
        let mut cfg: MuxerConfig = serde_yaml::from_str(&raw).context("parsing muxer config YAML")?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply the §6 environment variable overrides, `*_FILE` variants taking
    /// the first non-empty line of the named file.
    pub fn apply_env_overrides(&mut self) {
        crate::cfg::envoverride::apply(self);
    }

    pub fn validate(&self) -> Result<(), MuxError> {
        if self.destinations.is_empty() {
            return Err(MuxError::config("destinations must not be empty"));
        }
        for d in &self.destinations {
            Target::parse(d)?;
        }
        if self.ingester_name.is_empty() {
            return Err(MuxError::config("ingester_name must not be empty"));
        }
        if self.max_entry_size == 0 {
            return Err(MuxError::config("max_entry_size must be > 0"));
        }
        if self.queue_depth == 0 {
            return Err(MuxError::config("queue_depth must be > 0"));
        }
        if self.segment_mb == 0 {
            return Err(MuxError::config("segment_mb must be > 0"));
        }
        for t in &self.tags {
            crate::tag::validate_tag_name(t)?;
        }
        if let Some(src) = &self.source_override {
            parse_source_override(src)?;
        }
        Ok(())
    }

    pub fn parsed_destinations(&self) -> Result<Vec<Target>, MuxError> {
        self.destinations.iter().map(|d| Target::parse(d)).collect()
    }

    pub fn parsed_source_override(&self) -> Result<Option<SrcAddr>, MuxError> {
        self.source_override.as_deref().map(parse_source_override).transpose()
    }

    pub fn ingester_uuid_bytes(&self) -> Result<[u8; 16], MuxError> {
        if self.ingester_uuid.is_empty() {
            return Ok([0u8; 16]);
        }
        let raw = hex::decode(&self.ingester_uuid)
            .map_err(|e| MuxError::config(format!("ingester_uuid must be 32 hex characters: {e}")))?;
        let arr: [u8; 16] = raw
            .try_into()
            .map_err(|_| MuxError::config("ingester_uuid must decode to exactly 16 bytes"))?;
        Ok(arr)
    }
}

fn parse_source_override(raw: &str) -> Result<SrcAddr, MuxError> {
    let bytes = hex::decode(raw).map_err(|e| MuxError::config(format!("source_override must be hex: {e}")))?;
    match bytes.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&bytes);
            Ok(SrcAddr::V4(std::net::Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes);
            Ok(SrcAddr::V6(std::net::Ipv6Addr::from(octets)))
        }
        other => Err(MuxError::config(format!("source_override must be 4 or 16 bytes, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
destinations:
  - "tcp://indexer1:4023"
auth: "s3cret"
ingester_name: "demo"
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg: MuxerConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert_eq!(cfg.cache_mode, CacheMode::Fallback);
        assert_eq!(cfg.max_cache_mb, 512);
        assert!(cfg.verify_tls);
        assert_eq!(cfg.queue_depth, 1024);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_empty_destinations() {
        let mut cfg: MuxerConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.destinations.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_destination_scheme() {
        let mut cfg: MuxerConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.destinations.push("udp://x:1".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_source_override() {
        let mut cfg: MuxerConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.source_override = Some("0a000001".to_string());
        let src = cfg.parsed_source_override().unwrap();
        assert_eq!(src, Some(SrcAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1))));
    }
}
