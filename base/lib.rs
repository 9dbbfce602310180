// This file is part of wrrkit, a toolkit for web request/response archives.
// Copyright (C) 2025 The wrrkit Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

mod error;
pub mod shutdown;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorBuilder, ErrorKind};

/// Hasher for the in-memory maps; faster than SipHash and not exposed to
/// untrusted key choices.
pub type RandomState = ahash::RandomState;
