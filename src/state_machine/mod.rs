// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Generic `StateMachine`/`Transition` machinery, reused here to drive a
//! Connection's Connecting → Authenticating → Hot walk.

pub mod common;

pub use common::{StateMachine, Transition};
