// This file is part of wrrkit, a toolkit for web request/response archives.
// Copyright (C) 2025 The wrrkit Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Utilities for automated testing involving archives of records.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use base::Error;

use crate::organize::ReportSink;
use crate::record::{Reqres, Stime};

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests: logging to the test writer.
/// (Note the output can be confusing unless `RUST_TEST_THREADS=1` is set in
/// the program's environment prior to running.)
pub fn init() {
    INIT.call_once(base::tracing_setup::install_for_tests);
}

/// A complete GET/200 reqres for `url`.
pub fn reqres(url: &str, stime_ms: i64) -> Reqres {
    reqres_with_body(url, stime_ms, b"<html></html>")
}

/// Same, with a chosen response body, so two records can differ in content
/// while sharing every template field.
pub fn reqres_with_body(url: &str, stime_ms: i64, body: &[u8]) -> Reqres {
    Reqres {
        version: 1,
        stime: Stime(stime_ms),
        method: "GET".to_owned(),
        url: url.to_owned(),
        status: Some(200),
        complete: true,
        request_headers: vec![("accept".to_owned(), "*/*".to_owned())],
        response_headers: vec![("content-type".to_owned(), "text/html".to_owned())],
        request_body: Vec::new(),
        response_body: body.to_vec(),
    }
}

/// Serializes `rr` to `<dir>/<rel>`, creating parent directories.
pub fn write_record(dir: &Path, rel: &str, rr: &Reqres) -> PathBuf {
    let path = dir.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, rr.to_vec().unwrap()).unwrap();
    path
}

/// A report sink that records what the engine claims to have placed.
/// Clones share state, so tests can keep a handle while the engine owns
/// its copy.
#[derive(Clone, Default)]
pub struct TestSink {
    lines: Arc<Mutex<Vec<PathBuf>>>,
    syncs: Arc<AtomicUsize>,
}

impl TestSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<PathBuf> {
        self.lines.lock().unwrap().clone()
    }

    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }
}

impl ReportSink for TestSink {
    fn report(&mut self, path: &Path, _terminator: u8) -> Result<(), Error> {
        self.lines.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
