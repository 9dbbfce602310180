// This file is part of wrrkit, a toolkit for web request/response archives.
// Copyright (C) 2025 The wrrkit Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The organize engine: bounded-memory, deferred, batching placement of
//! records under a destination.
//!
//! Placements are not executed as they arrive. Each becomes an intent keyed
//! by its destination path in an insertion-ordered queue, so repeated
//! updates to the same output file collapse in memory, and the queue is
//! only drained when a resource budget is exceeded. Draining coalesces the
//! fsyncs for the whole batch and reports each destination on the reporting
//! channel only after its content and parent directory are durable.

mod intent;

pub use self::intent::{
    Action, BytesSource, Deferral, DeferredIo, FileSource, IoSource, OrganizeCtx, OrganizeIntent,
    SaveCtx, SaveIntent, Update,
};
pub use crate::fs::DeferredSync;

use std::io::Write as _;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use base::{bail, err, shutdown, Error, RandomState};
use hashlink::LinkedHashMap;
use tracing::{debug, error, info};

use crate::fs;
use crate::output::OutputFormat;
use crate::record::Reqres;
use crate::walk::{is_fatal, ErrorPolicy};

pub(crate) const NOT_ALLOWED: &str = "; this is not allowed to prevent accidental data loss";

const VARIANCE_HELP: &str = "; your `--output` format fails to provide enough variance to \
solve this problem automatically (did you forget to place a `%(num)d` substitution in there?)";

const MIB: usize = 1 << 20;

/// Resource budgets bounding the engine's memory; exceeding any of them
/// makes the next flush drain the corresponding structure.
#[derive(Clone, Debug)]
pub struct Budgets {
    /// Distinct base output paths tracked by the collision counter.
    pub max_seen: usize,
    /// `stat`-information cache entries.
    pub max_cached: usize,
    /// Intents deferred at once.
    pub max_deferred: usize,
    /// Extra intents allowed to accumulate beyond `max_deferred` while other
    /// budgets hold, so that a drain executes a sizable batch in one pass.
    pub max_batched: usize,
    /// Total memory account, in MiB.
    pub max_memory: usize,
    /// Treat every budget as infinite; drain only on the final flush.
    pub lazy: bool,
}

impl Default for Budgets {
    fn default() -> Self {
        Budgets {
            max_seen: 16384,
            max_cached: 8192,
            max_deferred: 1024,
            max_batched: 128,
            max_memory: 1024,
            lazy: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Options {
    /// Absolute root under which the template's output paths land.
    pub destination: PathBuf,
    /// Compiled output path template, `.wrr` extension included.
    pub format: OutputFormat,
    pub dry_run: bool,
    pub quiet: bool,
    pub errors: ErrorPolicy,
    /// Reporting channel terminator; `None` disables reporting entirely.
    pub terminator: Option<u8>,
    pub budgets: Budgets,
}

/// Where completed destinations are reported. The real sink is stdout; the
/// trait exists so tests can watch the channel, in the spirit of mocking
/// out the filesystem behind a trait.
pub trait ReportSink {
    fn report(&mut self, path: &Path, terminator: u8) -> Result<(), Error>;

    /// Makes everything reported so far durable on the channel; called once
    /// per flushed batch.
    fn sync(&mut self) -> Result<(), Error>;
}

pub struct StdoutSink(std::io::Stdout);

impl StdoutSink {
    pub fn new() -> Self {
        StdoutSink(std::io::stdout())
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportSink for StdoutSink {
    fn report(&mut self, path: &Path, terminator: u8) -> Result<(), Error> {
        use std::os::unix::ffi::OsStrExt;
        let mut lock = self.0.lock();
        lock.write_all(path.as_os_str().as_bytes())
            .and_then(|()| lock.write_all(&[terminator]))
            .map_err(|e| err!(e, msg("unable to write to the report stream")))
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.0
            .flush()
            .map_err(|e| err!(e, msg("unable to flush the report stream")))?;
        fs::fsync_maybe(self.0.as_raw_fd())
    }
}

/// The single memory account. Its value must equal the sum of
/// `approx_size()` over every live source and intent plus every key length
/// at each public entry and exit of the engine; tests recompute it.
#[derive(Debug, Default)]
struct Memory {
    consumption: usize,
}

impl Memory {
    fn add(&mut self, n: usize) {
        self.consumption += n;
    }

    fn sub(&mut self, n: usize) {
        self.consumption = self
            .consumption
            .checked_sub(n)
            .expect("memory accounting underflow");
    }
}

fn key_len(path: &Path) -> usize {
    path.as_os_str().len()
}

/// Ordered multiset of base output paths: how many times each has been
/// generated, so colliding placements get increasing `num` values. FIFO
/// eviction, oldest first.
struct SeenCounter {
    state: LinkedHashMap<PathBuf, u64, RandomState>,
}

impl SeenCounter {
    fn new() -> Self {
        SeenCounter {
            state: LinkedHashMap::with_hasher(RandomState::new()),
        }
    }

    fn len(&self) -> usize {
        self.state.len()
    }

    /// Returns the number of times `key` was seen before, then increments.
    fn count(&mut self, mem: &mut Memory, key: &Path) -> u64 {
        if let Some(n) = self.state.get_mut(key) {
            *n += 1;
            *n
        } else {
            mem.add(key_len(key));
            self.state.insert(key.to_path_buf(), 0);
            0
        }
    }

    fn pop(&mut self, mem: &mut Memory) -> Option<(PathBuf, u64)> {
        let (key, n) = self.state.pop_front()?;
        mem.sub(key_len(&key));
        Some((key, n))
    }
}

/// The organize engine for one destination.
///
/// Scoped acquisition: construct it, feed it via [`Organizer::emit`], and
/// call [`Organizer::finish`] on every exit path — including cancellation —
/// so queued intents are flushed before the process exits.
pub struct Organizer<I: DeferredIo> {
    opts: Options,
    cx: I::Ctx,
    actioning: String,
    mem: Memory,
    seen: SeenCounter,
    /// Pending placements, keyed by absolute destination path. At most one
    /// intent per destination at any time.
    intents: LinkedHashMap<PathBuf, I, RandomState>,
    /// What is currently believed to be on disk, keyed by absolute path.
    cache: LinkedHashMap<PathBuf, I::Source, RandomState>,
    sync: DeferredSync,
    report: Box<dyn ReportSink>,
    shutdown: shutdown::Receiver,
    executed: usize,
}

impl<I: DeferredIo> Organizer<I> {
    pub fn new(
        opts: Options,
        cx: I::Ctx,
        report: Box<dyn ReportSink>,
        shutdown: shutdown::Receiver,
    ) -> Self {
        let actioning = I::actioning(&cx).into_owned();
        Organizer {
            opts,
            cx,
            actioning,
            mem: Memory::default(),
            seen: SeenCounter::new(),
            intents: LinkedHashMap::with_hasher(RandomState::new()),
            cache: LinkedHashMap::with_hasher(RandomState::new()),
            sync: DeferredSync::default(),
            report,
            shutdown,
            executed: 0,
        }
    }

    /// Queues placement of one record, retrying with increasing `num` until
    /// the template yields a permitted destination.
    pub fn emit(&mut self, new_source: I::Source, rr: &Reqres) -> Result<(), Error> {
        let base_key = self
            .opts
            .destination
            .join(self.opts.format.expand(rr, 0)?);
        let mut prev: Option<PathBuf> = None;
        let (dest, had_intent) = loop {
            let num = self.seen.count(&mut self.mem, &base_key);
            let dest = if num == 0 {
                base_key.clone()
            } else {
                self.opts
                    .destination
                    .join(self.opts.format.expand(rr, num)?)
            };

            let old = self.cache.remove(&dest).map(|s| {
                self.mem.sub(s.approx_size() + key_len(&dest));
                s
            });
            let (intent, updated, permitted) = match self.intents.remove(&dest) {
                Some(mut i) => {
                    self.mem.sub(i.approx_size() + key_len(&dest));
                    let u = i.update_from(&self.cx, new_source.clone())?;
                    (Some(i), Some(u.source), u.permitted)
                }
                None => {
                    let d = I::defer(&self.cx, &dest, old, new_source.clone())?;
                    (d.intent, d.source, d.permitted)
                }
            };

            let has_intent = intent.is_some();
            if let Some(i) = intent {
                self.mem.add(i.approx_size() + key_len(&dest));
                let displaced = self.intents.insert(dest.clone(), i);
                assert!(
                    displaced.is_none(),
                    "duplicate intent for `{}`",
                    dest.display()
                );
            }
            if let Some(s) = updated {
                self.mem.add(s.approx_size() + key_len(&dest));
                self.cache.insert(dest.clone(), s);
            }

            if permitted {
                break (dest, has_intent);
            }
            if prev.as_ref() == Some(&dest) {
                bail!(
                    AlreadyExists,
                    msg(
                        "while {} `{}` -> `{}`: destination already exists{}{}",
                        self.actioning,
                        new_source.format_source(),
                        dest.display(),
                        VARIANCE_HELP,
                        NOT_ALLOWED
                    )
                );
            }
            prev = Some(dest);
        };

        if !had_intent {
            // Pure noop: the destination already holds this content. Report
            // immediately; there is nothing to make durable first.
            if let Some(t) = self.opts.terminator {
                self.report.report(&dest, t)?;
            }
        }

        if !self.opts.budgets.lazy {
            self.flush(false)?;
        }
        Ok(())
    }

    /// Drains whatever exceeds its budget; everything, on the final flush.
    pub fn flush(&mut self, final_: bool) -> Result<(), Error> {
        let b = &self.opts.budgets;
        let inf = usize::MAX;
        let (max_seen, max_cached, max_deferred, max_batched, max_memory) = if b.lazy {
            (inf, inf, inf, inf, inf)
        } else {
            (
                b.max_seen,
                b.max_cached,
                b.max_deferred,
                b.max_batched,
                b.max_memory.saturating_mul(MIB),
            )
        };
        let (mut max_deferred, max_memory) = if final_ {
            (0, 0)
        } else {
            (max_deferred, max_memory)
        };

        let mut num_deferred = self.intents.len();
        let mut num_cached = self.cache.len();
        let mut num_seen = self.seen.len();
        if num_deferred <= max_deferred
            && num_cached <= max_cached
            && num_seen <= max_seen
            && self.mem.consumption <= max_memory
        {
            return Ok(());
        }

        let mut done: Vec<PathBuf> = Vec::new();

        // Drain the seen counter first, executing any pending intent at an
        // evicted base path: once the engine forgets how many times it
        // generated a path, a later emit must find the file on disk to
        // number its own output correctly.
        while num_seen > 0 && (num_seen > max_seen || self.mem.consumption > max_memory) {
            self.check_cancelled(final_)?;
            let (key, _) = self.seen.pop(&mut self.mem).expect("num_seen > 0");
            num_seen -= 1;
            if let Some(intent) = self.intents.remove(&key) {
                self.complete_intent(key, intent, &mut done)?;
                num_deferred -= 1;
            }
        }

        if !final_
            && num_deferred <= max_deferred.saturating_add(max_batched)
            && self.mem.consumption <= max_memory
        {
            // There is room to keep deferring, so raise the bar: when the
            // engine finally does drain, it executes at least `max_batched`
            // actions in one pass, amortizing the directory fsyncs.
            max_deferred = max_deferred.saturating_add(max_batched);
        }

        while num_deferred > 0 && (num_deferred > max_deferred || self.mem.consumption > max_memory)
        {
            self.check_cancelled(final_)?;
            let (dest, intent) = self.intents.pop_front().expect("num_deferred > 0");
            self.complete_intent(dest, intent, &mut done)?;
            num_deferred -= 1;
        }

        self.sync.sync()?;

        if let Some(t) = self.opts.terminator {
            for dest in &done {
                self.report.report(dest, t)?;
            }
            self.report.sync()?;
        }

        self.sync.finish()?;

        while num_cached > 0 && (num_cached > max_cached || self.mem.consumption > max_memory) {
            let (path, source) = self.cache.pop_front().expect("num_cached > 0");
            num_cached -= 1;
            self.mem.sub(source.approx_size() + key_len(&path));
        }

        Ok(())
    }

    /// Flushes everything and checks the memory account drained to zero.
    pub fn finish(mut self) -> Result<(), Error> {
        self.flush(true)?;
        assert_eq!(self.mem.consumption, 0, "memory accounting leak");
        debug!(
            "executed {} placements ({} file fsyncs, {} dir fsyncs)",
            self.executed, self.sync.synced_files, self.sync.synced_dirs
        );
        Ok(())
    }

    /// Polls for cancellation before an intent is selected for execution.
    /// A final flush must drain even while unwinding from an interrupt;
    /// that is what keeps reported output consistent with disk.
    fn check_cancelled(&self, final_: bool) -> Result<(), Error> {
        if !final_ {
            self.shutdown
                .check()
                .map_err(|e| err!(Cancelled, msg("interrupted"), source(e)))?;
        }
        Ok(())
    }

    fn complete_intent(
        &mut self,
        dest: PathBuf,
        mut intent: I,
        done: &mut Vec<PathBuf>,
    ) -> Result<(), Error> {
        self.mem.sub(intent.approx_size() + key_len(&dest));

        if !self.opts.quiet {
            if self.opts.dry_run {
                info!(
                    "dry-run: (not) {}: `{}` -> `{}`",
                    self.actioning,
                    intent.format_source(),
                    dest.display()
                );
            } else {
                info!(
                    "{}: `{}` -> `{}`",
                    self.actioning,
                    intent.format_source(),
                    dest.display()
                );
            }
        }

        match intent.run(&self.cx, &dest, &mut self.sync, self.opts.dry_run) {
            Ok(updated) => {
                self.executed += 1;
                if self.opts.terminator.is_some() {
                    done.push(dest.clone());
                }
                if let Some(source) = updated {
                    if let Some(old) = self.cache.remove(&dest) {
                        self.mem.sub(old.approx_size() + key_len(&dest));
                    }
                    self.mem.add(source.approx_size() + key_len(&dest));
                    self.cache.insert(dest, source);
                }
                Ok(())
            }
            Err(e) => {
                if is_fatal(e.kind()) || self.opts.errors == ErrorPolicy::Fail {
                    return Err(err!(
                        e,
                        msg(
                            "while {} `{}` -> `{}`",
                            self.actioning,
                            intent.format_source(),
                            dest.display()
                        )
                    ));
                }
                if self.opts.errors == ErrorPolicy::Skip {
                    error!(
                        "while {} `{}` -> `{}`: {}",
                        self.actioning,
                        intent.format_source(),
                        dest.display(),
                        e.chain()
                    );
                }
                Ok(())
            }
        }
    }

    #[cfg(test)]
    fn recomputed_consumption(&self) -> usize {
        self.seen.state.keys().map(|k| key_len(k)).sum::<usize>()
            + self
                .intents
                .iter()
                .map(|(k, i)| i.approx_size() + key_len(k))
                .sum::<usize>()
            + self
                .cache
                .iter()
                .map(|(k, s)| s.approx_size() + key_len(k))
                .sum::<usize>()
    }

    #[cfg(test)]
    fn check_consumption(&self) {
        assert_eq!(self.mem.consumption, self.recomputed_consumption());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Reqres;
    use crate::testutil::{self, TestSink};

    fn opts(dest: &Path, template: &str, budgets: Budgets) -> Options {
        Options {
            destination: dest.to_path_buf(),
            format: OutputFormat::parse(template).unwrap(),
            dry_run: false,
            quiet: false,
            errors: ErrorPolicy::Fail,
            terminator: Some(b'\n'),
            budgets,
        }
    }

    fn organizer(
        dest: &Path,
        template: &str,
        action: Action,
        allow_updates: bool,
        budgets: Budgets,
        sink: &TestSink,
    ) -> Organizer<OrganizeIntent> {
        let (tx, rx) = shutdown::channel();
        std::mem::forget(tx);
        Organizer::new(
            opts(dest, template, budgets),
            OrganizeCtx {
                action,
                allow_updates,
            },
            Box::new(sink.clone()),
            rx,
        )
    }

    fn emit_file(org: &mut Organizer<OrganizeIntent>, path: &Path) -> Result<(), Error> {
        let rr = Reqres::read_file(path).unwrap();
        let meta = std::fs::metadata(path).unwrap();
        let src = FileSource::new(path.canonicalize().unwrap(), meta, Some(rr.stime()));
        let res = org.emit(src, &rr);
        org.check_consumption();
        res
    }

    /// A tempdir with canonicalized `src/` and `dst/` subdirectories.
    fn dirs() -> (tempfile::TempDir, PathBuf, PathBuf) {
        testutil::init();
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let src = root.join("src");
        let dst = root.join("dst");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dst).unwrap();
        (tmp, src, dst)
    }

    #[test]
    fn first_placement() {
        let (_tmp, src_dir, dst) = dirs();
        let rr = testutil::reqres("https://example.org/a", 1_000);
        let src = testutil::write_record(&src_dir, "r.wrr", &rr);
        let sink = TestSink::new();
        let mut org = organizer(
            &dst,
            "a/b/%(num)d.wrr",
            Action::Copy,
            false,
            Budgets::default(),
            &sink,
        );
        emit_file(&mut org, &src).unwrap();
        org.finish().unwrap();

        let placed = dst.join("a/b/0.wrr");
        assert_eq!(std::fs::read(&placed).unwrap(), rr.to_vec().unwrap());
        assert!(src.exists());
        assert_eq!(sink.lines(), vec![placed]);
        assert_eq!(sink.syncs(), 1);
    }

    #[test]
    fn rename_in_place_is_noop() {
        let (_tmp, src_dir, _dst) = dirs();
        let rr = testutil::reqres("https://example.org/a", 1_000);
        let src = testutil::write_record(&src_dir, "x.0.wrr", &rr);
        let before = std::fs::metadata(&src).unwrap().modified().unwrap();
        let sink = TestSink::new();
        // Destination is the source's own directory and the template
        // resolves to its current name.
        let mut org = organizer(
            &src_dir,
            "x.%(num)d.wrr",
            Action::Move,
            false,
            Budgets::default(),
            &sink,
        );
        emit_file(&mut org, &src).unwrap();
        assert_eq!(org.executed, 0);
        org.finish().unwrap();
        assert_eq!(sink.lines(), vec![src.clone()]);
        assert_eq!(std::fs::metadata(&src).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn reemit_after_placement_is_noop() {
        let (_tmp, src_dir, dst) = dirs();
        let rr = testutil::reqres("https://example.org/a", 1_000);
        let src = testutil::write_record(&src_dir, "r.wrr", &rr);
        let template = "%(hostname)s.%(num)d.wrr";

        let sink = TestSink::new();
        let mut org = organizer(&dst, template, Action::Copy, false, Budgets::default(), &sink);
        emit_file(&mut org, &src).unwrap();
        org.finish().unwrap();
        let placed = dst.join("example.org.0.wrr");
        let before = std::fs::metadata(&placed).unwrap().modified().unwrap();

        // A fresh run over the same input must change nothing and report the
        // same destination.
        let sink2 = TestSink::new();
        let mut org = organizer(&dst, template, Action::Copy, false, Budgets::default(), &sink2);
        emit_file(&mut org, &src).unwrap();
        assert_eq!(org.executed, 0);
        org.finish().unwrap();
        assert_eq!(sink2.lines(), vec![placed.clone()]);
        assert_eq!(std::fs::metadata(&placed).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn collision_gets_increasing_num() {
        let (_tmp, src_dir, dst) = dirs();
        let r1 = testutil::reqres_with_body("https://example.org/a", 1_000, b"one");
        let r2 = testutil::reqres_with_body("https://example.org/b", 2_000, b"two");
        let s1 = testutil::write_record(&src_dir, "1.wrr", &r1);
        let s2 = testutil::write_record(&src_dir, "2.wrr", &r2);
        let sink = TestSink::new();
        let mut org = organizer(
            &dst,
            "%(hostname)s.%(num)d.wrr",
            Action::Copy,
            false,
            Budgets::default(),
            &sink,
        );
        emit_file(&mut org, &s1).unwrap();
        emit_file(&mut org, &s2).unwrap();
        org.finish().unwrap();

        let p0 = dst.join("example.org.0.wrr");
        let p1 = dst.join("example.org.1.wrr");
        assert_eq!(std::fs::read(&p0).unwrap(), r1.to_vec().unwrap());
        assert_eq!(std::fs::read(&p1).unwrap(), r2.to_vec().unwrap());
        assert_eq!(sink.lines(), vec![p0, p1]);
    }

    #[test]
    fn variance_failure_without_num() {
        let (_tmp, src_dir, dst) = dirs();
        let r1 = testutil::reqres_with_body("https://example.org/a", 1_000, b"one");
        let r2 = testutil::reqres_with_body("https://example.org/b", 2_000, b"two");
        let s1 = testutil::write_record(&src_dir, "1.wrr", &r1);
        let s2 = testutil::write_record(&src_dir, "2.wrr", &r2);
        let sink = TestSink::new();
        let mut org = organizer(&dst, "fixed.wrr", Action::Copy, false, Budgets::default(), &sink);
        emit_file(&mut org, &s1).unwrap();
        let e = emit_file(&mut org, &s2).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::AlreadyExists);
        assert!(e.to_string().contains("%(num)d"), "{e}");

        // The scoped release still drains the first record's intent.
        org.finish().unwrap();
        assert_eq!(
            std::fs::read(dst.join("fixed.wrr")).unwrap(),
            r1.to_vec().unwrap()
        );
    }

    #[test]
    fn move_dedups_identical_content() {
        let (_tmp, src_dir, dst) = dirs();
        let rr = testutil::reqres("https://example.org/a", 1_000);
        let src = testutil::write_record(&src_dir, "r.wrr", &rr);
        let placed = testutil::write_record(&dst, "dup.0.wrr", &rr);
        let sink = TestSink::new();
        let mut org = organizer(
            &dst,
            "dup.%(num)d.wrr",
            Action::Move,
            false,
            Budgets::default(),
            &sink,
        );
        emit_file(&mut org, &src).unwrap();
        org.finish().unwrap();

        assert!(!src.exists(), "move-dedup must consume the source");
        assert_eq!(std::fs::read(&placed).unwrap(), rr.to_vec().unwrap());
        assert_eq!(sink.lines(), vec![placed]);
    }

    #[test]
    fn copy_and_hardlink_dedup_without_touching_source() {
        for action in [Action::Copy, Action::Hardlink] {
            let (_tmp, src_dir, dst) = dirs();
            let rr = testutil::reqres("https://example.org/a", 1_000);
            let src = testutil::write_record(&src_dir, "r.wrr", &rr);
            let placed = testutil::write_record(&dst, "dup.0.wrr", &rr);
            let sink = TestSink::new();
            let mut org = organizer(
                &dst,
                "dup.%(num)d.wrr",
                action,
                false,
                Budgets::default(),
                &sink,
            );
            emit_file(&mut org, &src).unwrap();
            assert_eq!(org.executed, 0, "{action:?} must be a pure noop");
            org.finish().unwrap();
            assert!(src.exists());
            assert_eq!(std::fs::read(&placed).unwrap(), rr.to_vec().unwrap());
            assert_eq!(sink.lines(), vec![placed]);
        }
    }

    #[test]
    fn symlink_noop_replacement_and_refusal() {
        let (_tmp, src_dir, dst) = dirs();
        let rr = testutil::reqres("https://example.org/a", 1_000);
        let src = testutil::write_record(&src_dir, "r.wrr", &rr);

        // An existing link to the same record is a noop.
        let link = dst.join("l.0.wrr");
        std::os::unix::fs::symlink(&src, &link).unwrap();
        let sink = TestSink::new();
        let mut org = organizer(
            &dst,
            "l.%(num)d.wrr",
            Action::Symlink,
            false,
            Budgets::default(),
            &sink,
        );
        emit_file(&mut org, &src).unwrap();
        assert_eq!(org.executed, 0);
        org.finish().unwrap();

        // A dangling link is replaceable.
        let dangling = dst.join("d.0.wrr");
        std::os::unix::fs::symlink(dst.join("nonexistent"), &dangling).unwrap();
        let sink = TestSink::new();
        let mut org = organizer(
            &dst,
            "d.%(num)d.wrr",
            Action::Symlink,
            false,
            Budgets::default(),
            &sink,
        );
        emit_file(&mut org, &src).unwrap();
        org.finish().unwrap();
        assert_eq!(std::fs::read_link(&dangling).unwrap(), src);

        // A symlink in the way of a non-symlink action is a safety refusal,
        // and so is the reverse.
        let sink = TestSink::new();
        let mut org = organizer(
            &dst,
            "l.%(num)d.wrr",
            Action::Copy,
            false,
            Budgets::default(),
            &sink,
        );
        let e = emit_file(&mut org, &src).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::FailedPrecondition);
        org.finish().unwrap();

        let sink = TestSink::new();
        let mut org = organizer(
            &dst,
            "dup.%(num)d.wrr",
            Action::Symlink,
            false,
            Budgets::default(),
            &sink,
        );
        testutil::write_record(&dst, "dup.0.wrr", &rr);
        let e = emit_file(&mut org, &src).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::FailedPrecondition);
        org.finish().unwrap();
    }

    #[test]
    fn newest_wins_under_allow_updates() {
        // Both emit orders must converge on the newer record's content.
        for flip in [false, true] {
            let (_tmp, src_dir, dst) = dirs();
            let older = testutil::reqres_with_body("https://example.org/a", 1_000, b"older");
            let newer = testutil::reqres_with_body("https://example.org/b", 2_000, b"newer");
            let s_old = testutil::write_record(&src_dir, "old.wrr", &older);
            let s_new = testutil::write_record(&src_dir, "new.wrr", &newer);
            let (first, second) = if flip { (&s_new, &s_old) } else { (&s_old, &s_new) };

            let sink = TestSink::new();
            let mut org = organizer(&dst, "latest.wrr", Action::Copy, true, Budgets::default(), &sink);
            emit_file(&mut org, first).unwrap();
            emit_file(&mut org, second).unwrap();
            assert_eq!(org.intents.len(), 1, "updates for one target must collapse");
            org.finish().unwrap();

            assert_eq!(
                std::fs::read(dst.join("latest.wrr")).unwrap(),
                newer.to_vec().unwrap()
            );
            // Copies never consume their sources.
            assert!(s_old.exists());
            assert!(s_new.exists());
        }
    }

    #[test]
    fn latest_move_replaces_flushed_placement() {
        let (_tmp, src_dir, dst) = dirs();
        let older = testutil::reqres_with_body("https://example.org/a", 1_000, b"older");
        let newer = testutil::reqres_with_body("https://example.org/b", 2_000, b"newer");
        let s_old = testutil::write_record(&src_dir, "old.wrr", &older);
        let s_new = testutil::write_record(&src_dir, "new.wrr", &newer);

        // Zero deferral: the older record is placed before the newer one
        // arrives, so the newer move replaces it on disk.
        let budgets = Budgets {
            max_deferred: 0,
            max_batched: 0,
            ..Budgets::default()
        };
        let sink = TestSink::new();
        let mut org = organizer(&dst, "latest.wrr", Action::Move, true, budgets, &sink);
        emit_file(&mut org, &s_old).unwrap();
        emit_file(&mut org, &s_new).unwrap();
        org.finish().unwrap();

        assert_eq!(
            std::fs::read(dst.join("latest.wrr")).unwrap(),
            newer.to_vec().unwrap()
        );
        assert!(!s_old.exists());
        assert!(!s_new.exists());
    }

    #[test]
    fn keep_refuses_nonidentical_and_noops_identical() {
        let (_tmp, src_dir, dst) = dirs();
        let r1 = testutil::reqres_with_body("https://example.org/a", 1_000, b"one");
        let r2 = testutil::reqres_with_body("https://example.org/b", 2_000, b"two");
        let s1 = testutil::write_record(&src_dir, "1.wrr", &r1);
        let s2 = testutil::write_record(&src_dir, "2.wrr", &r2);

        let sink = TestSink::new();
        let mut org = organizer(&dst, "fixed.wrr", Action::Copy, false, Budgets::default(), &sink);
        emit_file(&mut org, &s1).unwrap();
        org.finish().unwrap();

        // Non-identical content must fail...
        let sink = TestSink::new();
        let mut org = organizer(&dst, "fixed.wrr", Action::Copy, false, Budgets::default(), &sink);
        let e = emit_file(&mut org, &s2).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::AlreadyExists);
        org.finish().unwrap();
        assert_eq!(
            std::fs::read(dst.join("fixed.wrr")).unwrap(),
            r1.to_vec().unwrap()
        );

        // ...while identical content is a reported noop.
        let sink = TestSink::new();
        let mut org = organizer(&dst, "fixed.wrr", Action::Copy, false, Budgets::default(), &sink);
        emit_file(&mut org, &s1).unwrap();
        assert_eq!(org.executed, 0);
        org.finish().unwrap();
        assert_eq!(sink.lines(), vec![dst.join("fixed.wrr")]);
    }

    #[test]
    fn bigger_budgets_never_cost_more_syscalls() {
        let run = |budgets: Budgets| -> usize {
            let (_tmp, src_dir, dst) = dirs();
            let sink = TestSink::new();
            let mut org = organizer(
                &dst,
                "%(urlhash)s.%(num)d.wrr",
                Action::Copy,
                false,
                budgets,
                &sink,
            );
            for i in 0..6 {
                let rr = testutil::reqres(&format!("https://example.org/{i}"), 1_000 + i);
                let src = testutil::write_record(&src_dir, &format!("{i}.wrr"), &rr);
                emit_file(&mut org, &src).unwrap();
            }
            org.flush(true).unwrap();
            let syscalls = org.sync.synced_files + org.sync.synced_dirs;
            org.finish().unwrap();
            syscalls
        };

        let eager = run(Budgets {
            max_deferred: 0,
            max_batched: 0,
            ..Budgets::default()
        });
        let batched = run(Budgets::default());
        assert!(
            batched <= eager,
            "batched run used {batched} fsyncs vs {eager} eager"
        );
    }

    #[test]
    fn hysteresis_delays_the_drain_then_empties_a_batch() {
        let (_tmp, src_dir, dst) = dirs();
        let budgets = Budgets {
            max_deferred: 2,
            max_batched: 2,
            ..Budgets::default()
        };
        let sink = TestSink::new();
        let mut org = organizer(&dst, "%(urlhash)s.%(num)d.wrr", Action::Copy, false, budgets, &sink);
        let mut executed = Vec::new();
        for i in 0..5 {
            let rr = testutil::reqres(&format!("https://example.org/{i}"), 1_000 + i);
            let src = testutil::write_record(&src_dir, &format!("{i}.wrr"), &rr);
            emit_file(&mut org, &src).unwrap();
            executed.push(org.executed);
        }
        // Nothing runs until the widened band (max_deferred + max_batched)
        // is exceeded, then one pass drains down to max_deferred.
        assert_eq!(executed, vec![0, 0, 0, 0, 3]);
        org.finish().unwrap();
    }

    #[test]
    fn memory_account_stays_exact() {
        let (_tmp, src_dir, dst) = dirs();
        let sink = TestSink::new();
        let mut org = organizer(
            &dst,
            "%(hostname)s.%(num)d.wrr",
            Action::Copy,
            true,
            Budgets::default(),
            &sink,
        );
        for (i, (url, body)) in [
            ("https://example.org/a", &b"one"[..]),
            ("https://example.org/b", b"two"),
            ("https://other.example/a", b"three"),
            ("https://example.org/c", b"four"),
        ]
        .iter()
        .enumerate()
        {
            let rr = testutil::reqres_with_body(url, 1_000 + i as i64, body);
            let src = testutil::write_record(&src_dir, &format!("{i}.wrr"), &rr);
            emit_file(&mut org, &src).unwrap();
        }
        org.flush(false).unwrap();
        org.check_consumption();
        org.flush(true).unwrap();
        org.check_consumption();
        org.finish().unwrap();
    }

    #[test]
    fn seen_eviction_executes_pending_intent_before_forgetting() {
        let (_tmp, src_dir, dst) = dirs();
        let budgets = Budgets {
            max_seen: 1,
            ..Budgets::default()
        };
        let ra = testutil::reqres_with_body("https://a.example/", 1_000, b"first");
        let rb = testutil::reqres_with_body("https://b.example/", 2_000, b"second");
        let ra2 = testutil::reqres_with_body("https://a.example/other", 3_000, b"third");
        let sa = testutil::write_record(&src_dir, "a.wrr", &ra);
        let sb = testutil::write_record(&src_dir, "b.wrr", &rb);
        let sa2 = testutil::write_record(&src_dir, "a2.wrr", &ra2);

        let sink = TestSink::new();
        let mut org = organizer(
            &dst,
            "%(hostname)s.%(num)d.wrr",
            Action::Copy,
            false,
            budgets,
            &sink,
        );
        emit_file(&mut org, &sa).unwrap();
        // Evicts a.example's base path from the seen counter, which must
        // execute its pending intent so the next a.example record can see
        // the file and pick a fresh number.
        emit_file(&mut org, &sb).unwrap();
        assert_eq!(
            std::fs::read(dst.join("a.example.0.wrr")).unwrap(),
            ra.to_vec().unwrap()
        );
        emit_file(&mut org, &sa2).unwrap();
        org.finish().unwrap();

        assert_eq!(
            std::fs::read(dst.join("a.example.0.wrr")).unwrap(),
            ra.to_vec().unwrap()
        );
        assert_eq!(
            std::fs::read(dst.join("a.example.1.wrr")).unwrap(),
            ra2.to_vec().unwrap()
        );
    }

    #[test]
    fn interrupt_aborts_emit_but_final_flush_drains() {
        let (_tmp, src_dir, dst) = dirs();
        let rr = testutil::reqres("https://example.org/a", 1_000);
        let src = testutil::write_record(&src_dir, "r.wrr", &rr);
        let sink = TestSink::new();
        let (tx, rx) = shutdown::channel();
        let mut org: Organizer<OrganizeIntent> = Organizer::new(
            opts(
                &dst,
                "%(num)d.wrr",
                Budgets {
                    max_deferred: 0,
                    max_batched: 0,
                    ..Budgets::default()
                },
            ),
            OrganizeCtx {
                action: Action::Copy,
                allow_updates: false,
            },
            Box::new(sink.clone()),
            rx,
        );
        drop(tx);
        let e = emit_file(&mut org, &src).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::Cancelled);
        // The scoped release still flushes the queued intent.
        org.finish().unwrap();
        assert!(dst.join("0.wrr").exists());
    }

    #[test]
    fn dry_run_places_nothing() {
        let (_tmp, src_dir, dst) = dirs();
        let rr = testutil::reqres("https://example.org/a", 1_000);
        let src = testutil::write_record(&src_dir, "r.wrr", &rr);
        let sink = TestSink::new();
        let (tx, rx) = shutdown::channel();
        std::mem::forget(tx);
        let mut o = opts(&dst, "%(num)d.wrr", Budgets::default());
        o.dry_run = true;
        o.terminator = None;
        let mut org: Organizer<OrganizeIntent> = Organizer::new(
            o,
            OrganizeCtx {
                action: Action::Move,
                allow_updates: false,
            },
            Box::new(sink.clone()),
            rx,
        );
        emit_file(&mut org, &src).unwrap();
        org.finish().unwrap();
        assert!(src.exists());
        assert!(!dst.join("0.wrr").exists());
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn save_intent_writes_dedups_and_updates() {
        let (_tmp, _src_dir, dst) = dirs();
        let older = testutil::reqres_with_body("https://example.org/a", 1_000, b"older");
        let newer = testutil::reqres_with_body("https://example.org/b", 2_000, b"newer");
        let sink = TestSink::new();
        let (tx, rx) = shutdown::channel();
        std::mem::forget(tx);
        let mut org: Organizer<SaveIntent> = Organizer::new(
            opts(&dst, "latest.wrr", Budgets::default()),
            SaveCtx {
                allow_updates: true,
            },
            Box::new(sink.clone()),
            rx,
        );
        let emit = |org: &mut Organizer<SaveIntent>, rr: &Reqres, name: &str| {
            let res = org.emit(
                BytesSource::new(name.to_owned(), rr.to_vec().unwrap()),
                rr,
            );
            org.check_consumption();
            res
        };
        emit(&mut org, &older, "mem:0").unwrap();
        emit(&mut org, &newer, "mem:1").unwrap();
        // Identical re-save collapses to a noop against the queued intent.
        emit(&mut org, &newer, "mem:2").unwrap();
        org.finish().unwrap();
        assert_eq!(
            std::fs::read(dst.join("latest.wrr")).unwrap(),
            newer.to_vec().unwrap()
        );
        assert_eq!(sink.lines(), vec![dst.join("latest.wrr")]);
    }
}
