// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Indexer destination URLs: `tcp://host[:port]`, `tls://host[:port]`,
//! `pipe:///path/to/socket`. A closed match, not an open dispatch table —
//! an unrecognized scheme is a config error, not a silently-ignored one.
//! A missing port is left for `conn::transport::dial` to fill in with the
//! scheme's default.

use std::fmt;

use crate::error::MuxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
    /// Maps to a Unix domain socket. There is no Windows named-pipe
    /// implementation behind this scheme.
    Pipe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    /// `host:port` for tcp/tls, filesystem path for pipe.
    pub addr: String,
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self, MuxError> {
        let (scheme_str, rest) = raw
            .split_once("://")
            .ok_or_else(|| MuxError::config(format!("destination missing scheme: {raw}")))?;

        let scheme = match scheme_str {
            "tcp" => Scheme::Tcp,
            "tls" => Scheme::Tls,
            "pipe" => Scheme::Pipe,
            other => {
                return Err(MuxError::config(format!(
                    "unsupported destination scheme {other:?} (expected tcp, tls, or pipe)"
                )));
            }
        };

        if rest.is_empty() {
            return Err(MuxError::config(format!("destination missing address: {raw}")));
        }

        match scheme {
            // Port is optional here; `conn::transport::dial` fills in the
            // scheme's default port when `rest` carries none.
            Scheme::Tcp | Scheme::Tls => {}
            Scheme::Pipe => {
                if !rest.starts_with('/') {
                    return Err(MuxError::config(format!(
                        "pipe destination must be an absolute path, got: {rest}"
                    )));
                }
            }
        }

        Ok(Target { scheme, addr: rest.to_string() })
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.scheme, Scheme::Tls)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
            Scheme::Pipe => "pipe",
        };
        write!(f, "{scheme}://{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp() {
        let t = Target::parse("tcp://indexer1:4023").unwrap();
        assert_eq!(t.scheme, Scheme::Tcp);
        assert_eq!(t.addr, "indexer1:4023");
        assert!(!t.is_encrypted());
    }

    #[test]
    fn parses_tcp_without_port() {
        let t = Target::parse("tcp://indexer1").unwrap();
        assert_eq!(t.scheme, Scheme::Tcp);
        assert_eq!(t.addr, "indexer1");
    }

    #[test]
    fn parses_tls() {
        let t = Target::parse("tls://indexer1:4024").unwrap();
        assert_eq!(t.scheme, Scheme::Tls);
        assert!(t.is_encrypted());
    }

    #[test]
    fn parses_pipe() {
        let t = Target::parse("pipe:///var/run/ingest.sock").unwrap();
        assert_eq!(t.scheme, Scheme::Pipe);
        assert_eq!(t.addr, "/var/run/ingest.sock");
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(Target::parse("udp://indexer1:4023").is_err());
    }

    #[test]
    fn rejects_relative_pipe_path() {
        assert!(Target::parse("pipe://relative/path").is_err());
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(Target::parse("indexer1:4023").is_err());
    }
}
