// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ingest protocol wire format — on-wire framing shared by every Connection.
//!
//! These types ARE the protocol: frame layout, command ids and field widths
//! here must never change without a version bump (`PROTOCOL_VERSION`).
//! Framing is little-endian throughout. Read docs/wire-format in spec.md
//! §4.1/§6 before touching this module.

pub mod codec;
pub mod entry;
pub mod frame;
pub mod target;

pub use codec::Frame;
pub use entry::{EnumValue, Entry, EvValue, SrcAddr};
pub use frame::FrameHeader;
pub use target::{Scheme, Target};

/// Wire format version. Bumping this is a breaking change for every
/// connected indexer.
pub const PROTOCOL_VERSION: u32 = 0x0000_0002;

/// Maximum payload length enforced per direction. Oversize frames terminate
/// the Connection.
pub const MAX_FRAME_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Reserved tag ID meaning "default" — assigned by `Negotiate("default")`.
pub const TAG_DEFAULT: u16 = 0xFFFF;

/// Reserved tag ID for the muxer's internal self-log stream.
pub const TAG_SELF_LOG: u16 = 0xFFFE;

/// Default Entry size bound, enforced by the Muxer at `WriteEntry` time.
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 1024 * 1024;
