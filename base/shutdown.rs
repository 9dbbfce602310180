// This file is part of wrrkit, a toolkit for web request/response archives.
// Copyright (C) 2025 The wrrkit Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! The engine is synchronous, so this is deliberately minimal: a flag the
//! walker and the flush controller poll at safe points. The first SIGINT or
//! SIGTERM requests a graceful drain (queued placements are still flushed on
//! the way out); a second signal terminates the process immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

pub struct Sender(Arc<AtomicBool>);

impl Drop for Sender {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<AtomicBool>);

impl Receiver {
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0.load(Ordering::SeqCst) {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender will request shutdown. This is the test-friendly
/// entry point; the binary uses [`install_signal_handlers`].
pub fn channel() -> (Sender, Receiver) {
    let flag = Arc::new(AtomicBool::new(false));
    (Sender(flag.clone()), Receiver(flag))
}

/// Registers SIGINT/SIGTERM handlers and returns the receiver they trip.
///
/// Handlers run in registration order, so the conditional-shutdown handler
/// (registered first) sees the flag still unset on the first delivery and
/// exits the process on the second.
pub fn install_signal_handlers() -> Result<Receiver, std::io::Error> {
    let flag = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register_conditional_shutdown(sig, 1, Arc::clone(&flag))?;
        signal_hook::flag::register(sig, Arc::clone(&flag))?;
    }
    Ok(Receiver(flag))
}

#[cfg(test)]
mod tests {
    #[test]
    fn simple_check() {
        let (tx, rx) = super::channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[test]
    fn clones_share_state() {
        let (tx, rx) = super::channel();
        let rx2 = rx.clone();
        rx2.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
        rx2.check().unwrap_err();
    }
}
