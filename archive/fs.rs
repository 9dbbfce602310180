// This file is part of wrrkit, a toolkit for web request/response archives.
// Copyright (C) 2025 The wrrkit Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Filesystem primitives for the organize engine.
//!
//! Every placement goes through one of the `atomic_*` operations below.
//! They never overwrite in place: replacements are staged under the
//! destination's name plus `.part` (which every other part of the toolkit
//! treats as invisible) and renamed over, and the fsyncs needed to make the
//! result durable are queued on a [`DeferredSync`] rather than issued
//! immediately, so a flush can coalesce them across a whole batch.

use std::collections::BTreeSet;
use std::fs::{File, Metadata};
use std::io::Write as _;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use base::{bail, err, Error};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::warn;

/// True iff the two refer to the same inode.
pub(crate) fn samestat(a: &Metadata, b: &Metadata) -> bool {
    a.dev() == b.dev() && a.ino() == b.ino()
}

/// Wraps an I/O error with the path it concerns; `ENAMETOOLONG` gets the
/// dedicated diagnostic since template-generated names are the usual culprit.
pub(crate) fn err_at(e: std::io::Error, doing: &str, path: &Path) -> Error {
    if e.raw_os_error() == Some(libc::ENAMETOOLONG) {
        return err!(
            InvalidArgument,
            msg("file name too long: `{}`", path.display()),
            source(e)
        );
    }
    err!(e, msg("unable to {doing} `{}`", path.display()))
}

fn err_at_nix(e: nix::Error, doing: &str, path: &Path) -> Error {
    err_at(std::io::Error::from_raw_os_error(e as i32), doing, path)
}

/// A file descriptor associated with a directory.
struct Fd(RawFd);

impl Drop for Fd {
    fn drop(&mut self) {
        if let Err(e) = nix::unistd::close(self.0) {
            warn!("unable to close directory fd: {e}");
        }
    }
}

impl Fd {
    /// Opens the given path as a directory.
    fn open(path: &Path) -> Result<Fd, nix::Error> {
        let fd = nix::fcntl::open(path, OFlag::O_DIRECTORY | OFlag::O_RDONLY, Mode::empty())?;
        Ok(Fd(fd))
    }

    /// `fsync`s this directory, committing its entries to permanent storage.
    fn sync(&self) -> Result<(), nix::Error> {
        nix::unistd::fsync(self.0)
    }
}

/// The deferred-sync log: everything that must reach permanent storage
/// before the flush controller may report its batch as placed, plus cleanups
/// that are only safe to run after that point.
#[derive(Default)]
pub struct DeferredSync {
    /// Newly written files, fsynced before their parent directories.
    files: Vec<(PathBuf, File)>,
    /// Parent directories of new/renamed entries, deduped.
    dirs: BTreeSet<PathBuf>,
    /// Source files to unlink once the batch is durable (cross-filesystem
    /// moves implemented as copy + delete).
    unlinks: Vec<PathBuf>,
    /// Running fsync totals, for the end-of-run debug line and for tests
    /// that check batching actually batches.
    pub(crate) synced_files: usize,
    pub(crate) synced_dirs: usize,
}

impl DeferredSync {
    pub(crate) fn defer_fsync(&mut self, path: PathBuf, f: File) {
        self.files.push((path, f));
    }

    pub(crate) fn defer_dirsync(&mut self, dir: PathBuf) {
        self.dirs.insert(dir);
    }

    pub(crate) fn defer_unlink(&mut self, path: PathBuf) {
        self.unlinks.push(path);
    }

    /// Executes all queued fsyncs, data before directory entries. Idempotent;
    /// a no-op on an empty log.
    pub fn sync(&mut self) -> Result<(), Error> {
        for (path, f) in self.files.drain(..) {
            // After an fsync failure the state of the file is unknown, so
            // there is no retrying; see the PostgreSQL "fsyncgate 2018"
            // discussions.
            f.sync_all()
                .map_err(|e| err!(DataLoss, msg("unable to sync `{}`", path.display()), source(e)))?;
            self.synced_files += 1;
        }
        let dirs = std::mem::take(&mut self.dirs);
        for dir in dirs {
            Fd::open(&dir)
                .and_then(|fd| fd.sync())
                .map_err(|e| {
                    err!(DataLoss, msg("unable to sync dir `{}`", dir.display()), source(e))
                })?;
            self.synced_dirs += 1;
        }
        Ok(())
    }

    /// Runs post-success cleanups. Idempotent; must be called after
    /// [`DeferredSync::sync`].
    pub fn finish(&mut self) -> Result<(), Error> {
        debug_assert!(self.files.is_empty() && self.dirs.is_empty());
        for path in self.unlinks.drain(..) {
            std::fs::remove_file(&path).map_err(|e| err_at(e, "unlink", &path))?;
        }
        Ok(())
    }
}

/// `<name>.part` beside the destination: the staging name for replacements.
fn part_path(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dst.with_file_name(name)
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent().unwrap_or_else(|| Path::new("/")).to_path_buf()
}

/// `rename` that refuses to clobber unless `replace`.
fn rename_checked(src: &Path, dst: &Path, replace: bool) -> Result<(), nix::Error> {
    if replace {
        nix::fcntl::renameat(None, src, None, dst)
    } else {
        nix::fcntl::renameat2(
            None,
            src,
            None,
            dst,
            nix::fcntl::RenameFlags::RENAME_NOREPLACE,
        )
    }
}

fn map_rename_err(e: nix::Error, dst: &Path) -> Error {
    match e {
        nix::Error::EEXIST => err!(AlreadyExists, msg("`{}` already exists", dst.display())),
        e => err_at_nix(e, "rename into", dst),
    }
}

/// Copies `src`'s bytes into place at `dst` via the `.part` staging name.
/// Queues the data fsync and the parent directory fsync; returns the
/// metadata of the file now at `dst`.
fn copy_into_place(
    src: &Path,
    dst: &Path,
    replace: bool,
    sync: &mut DeferredSync,
) -> Result<Metadata, Error> {
    let mut in_f = File::open(src).map_err(|e| err_at(e, "open", src))?;
    let part = part_path(dst);
    let mut out_f = File::create(&part).map_err(|e| err_at(e, "create", &part))?;
    std::io::copy(&mut in_f, &mut out_f).map_err(|e| err_at(e, "copy into", &part))?;
    let meta = out_f.metadata().map_err(|e| err_at(e, "stat", &part))?;
    if let Err(e) = rename_checked(&part, dst, replace) {
        let _ = std::fs::remove_file(&part);
        return Err(map_rename_err(e, dst));
    }
    sync.defer_fsync(dst.to_path_buf(), out_f);
    sync.defer_dirsync(parent_of(dst));
    Ok(meta)
}

/// Moves `src` to `dst`. Same-filesystem moves are a single `rename`;
/// `EXDEV` downgrades to copy + unlink, with the unlink deferred until the
/// copy (and its directory entry) are durable.
pub(crate) fn atomic_move(
    src: &Path,
    dst: &Path,
    replace: bool,
    sync: &mut DeferredSync,
) -> Result<(), Error> {
    match rename_checked(src, dst, replace) {
        Ok(()) => {
            sync.defer_dirsync(parent_of(dst));
            sync.defer_dirsync(parent_of(src));
            Ok(())
        }
        Err(nix::Error::EXDEV) => {
            copy_into_place(src, dst, replace, sync)?;
            sync.defer_dirsync(parent_of(src));
            sync.defer_unlink(src.to_path_buf());
            Ok(())
        }
        Err(e) => Err(map_rename_err(e, dst)),
    }
}

pub(crate) fn atomic_copy(
    src: &Path,
    dst: &Path,
    replace: bool,
    sync: &mut DeferredSync,
) -> Result<Metadata, Error> {
    copy_into_place(src, dst, replace, sync)
}

pub(crate) fn atomic_hardlink(
    src: &Path,
    dst: &Path,
    replace: bool,
    sync: &mut DeferredSync,
) -> Result<(), Error> {
    let link = |to: &Path| {
        nix::unistd::linkat(
            None,
            src,
            None,
            to,
            nix::unistd::LinkatFlags::SymlinkFollow,
        )
    };
    if replace {
        let part = part_path(dst);
        let _ = std::fs::remove_file(&part);
        link(&part).map_err(|e| err_at_nix(e, "hardlink to", &part))?;
        rename_checked(&part, dst, true).map_err(|e| map_rename_err(e, dst))?;
    } else {
        match link(dst) {
            Ok(()) => {}
            Err(nix::Error::EEXIST) => {
                bail!(AlreadyExists, msg("`{}` already exists", dst.display()))
            }
            Err(nix::Error::EXDEV) => {
                bail!(Unavailable, msg("can't hardlink across file systems"))
            }
            Err(e) => return Err(err_at_nix(e, "hardlink to", dst)),
        }
    }
    sync.defer_dirsync(parent_of(dst));
    Ok(())
}

pub(crate) fn atomic_symlink(
    src: &Path,
    dst: &Path,
    replace: bool,
    sync: &mut DeferredSync,
) -> Result<(), Error> {
    if replace {
        let part = part_path(dst);
        let _ = std::fs::remove_file(&part);
        std::os::unix::fs::symlink(src, &part).map_err(|e| err_at(e, "symlink at", &part))?;
        rename_checked(&part, dst, true).map_err(|e| map_rename_err(e, dst))?;
    } else {
        match std::os::unix::fs::symlink(src, dst) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                bail!(AlreadyExists, msg("`{}` already exists", dst.display()))
            }
            Err(e) => return Err(err_at(e, "symlink at", dst)),
        }
    }
    sync.defer_dirsync(parent_of(dst));
    Ok(())
}

/// Writes `data` into place at `dst` via the `.part` staging name.
pub(crate) fn atomic_write(
    data: &[u8],
    dst: &Path,
    replace: bool,
    sync: &mut DeferredSync,
) -> Result<Metadata, Error> {
    let part = part_path(dst);
    let mut out_f = File::create(&part).map_err(|e| err_at(e, "create", &part))?;
    out_f
        .write_all(data)
        .map_err(|e| err_at(e, "write into", &part))?;
    let meta = out_f.metadata().map_err(|e| err_at(e, "stat", &part))?;
    if let Err(e) = rename_checked(&part, dst, replace) {
        let _ = std::fs::remove_file(&part);
        return Err(map_rename_err(e, dst));
    }
    sync.defer_fsync(dst.to_path_buf(), out_f);
    sync.defer_dirsync(parent_of(dst));
    Ok(meta)
}

/// `mkdir -p` for the destination's parent, queueing its fsync.
pub(crate) fn ensure_parent(dst: &Path, sync: &mut DeferredSync) -> Result<(), Error> {
    let dir = parent_of(dst);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| err_at(e, "create directory", &dir))?;
        sync.defer_dirsync(dir);
    }
    Ok(())
}

/// The whole of `path`, or `None` if it doesn't exist.
pub(crate) fn read_file_maybe(path: &Path) -> Result<Option<Vec<u8>>, Error> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(err_at(e, "read", path)),
    }
}

/// True iff the file at `path` exists and holds exactly `data`. Checks the
/// length first so mismatches don't read the file at all.
pub(crate) fn file_content_equals(path: &Path, data: &[u8]) -> Result<bool, Error> {
    match std::fs::metadata(path) {
        Ok(m) if m.len() != data.len() as u64 => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(err_at(e, "stat", path)),
    }
    Ok(read_file_maybe(path)?.as_deref() == Some(data))
}

/// Fsync for the reporting stream, which may be a pipe or a terminal rather
/// than a file; kinds of descriptor that can't be fsynced are fine as-is.
pub(crate) fn fsync_maybe(fd: RawFd) -> Result<(), Error> {
    match nix::unistd::fsync(fd) {
        Ok(()) | Err(nix::Error::EINVAL) | Err(nix::Error::EOPNOTSUPP) | Err(nix::Error::EROFS) => {
            Ok(())
        }
        Err(e) => Err(err!(DataLoss, msg("unable to sync report stream"), source(e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_sync_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut sync = DeferredSync::default();
        sync.sync().unwrap();
        sync.finish().unwrap();

        let path = tmp.path().join("f");
        let f = File::create(&path).unwrap();
        sync.defer_fsync(path.clone(), f);
        sync.defer_dirsync(tmp.path().to_path_buf());
        sync.defer_dirsync(tmp.path().to_path_buf());
        sync.sync().unwrap();
        assert_eq!(sync.synced_files, 1);
        assert_eq!(sync.synced_dirs, 1); // deduped
        sync.sync().unwrap();
        assert_eq!(sync.synced_files, 1);
    }

    #[test]
    fn finish_unlinks_after_sync() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("victim");
        std::fs::write(&path, b"x").unwrap();
        let mut sync = DeferredSync::default();
        sync.defer_unlink(path.clone());
        sync.sync().unwrap();
        assert!(path.exists());
        sync.finish().unwrap();
        assert!(!path.exists());
        sync.finish().unwrap();
    }

    #[test]
    fn move_then_replace() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::write(&a, b"one").unwrap();
        let mut sync = DeferredSync::default();
        atomic_move(&a, &b, false, &mut sync).unwrap();
        assert!(!a.exists());
        assert_eq!(std::fs::read(&b).unwrap(), b"one");

        std::fs::write(&a, b"two").unwrap();
        let e = atomic_move(&a, &b, false, &mut sync).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::AlreadyExists);
        atomic_move(&a, &b, true, &mut sync).unwrap();
        assert_eq!(std::fs::read(&b).unwrap(), b"two");
        sync.sync().unwrap();
        sync.finish().unwrap();
    }

    #[test]
    fn copy_stages_through_part() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::write(&a, b"data").unwrap();
        let mut sync = DeferredSync::default();
        let meta = atomic_copy(&a, &b, false, &mut sync).unwrap();
        assert_eq!(meta.len(), 4);
        assert!(a.exists());
        assert_eq!(std::fs::read(&b).unwrap(), b"data");
        assert!(!tmp.path().join("b.part").exists());
        sync.sync().unwrap();
        assert!(sync.synced_files >= 1);
    }

    #[test]
    fn hardlink_and_symlink() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("a");
        std::fs::write(&a, b"data").unwrap();
        let mut sync = DeferredSync::default();

        let h = tmp.path().join("h");
        atomic_hardlink(&a, &h, false, &mut sync).unwrap();
        assert!(samestat(
            &std::fs::metadata(&a).unwrap(),
            &std::fs::metadata(&h).unwrap()
        ));
        let e = atomic_hardlink(&a, &h, false, &mut sync).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::AlreadyExists);

        let s = tmp.path().join("s");
        atomic_symlink(&a, &s, false, &mut sync).unwrap();
        assert_eq!(std::fs::read_link(&s).unwrap(), a);
        atomic_symlink(&h, &s, true, &mut sync).unwrap();
        assert_eq!(std::fs::read_link(&s).unwrap(), h);
        sync.sync().unwrap();
        sync.finish().unwrap();
    }

    #[test]
    fn content_equals_checks_len_first() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = tmp.path().join("a");
        std::fs::write(&a, b"abc").unwrap();
        assert!(file_content_equals(&a, b"abc").unwrap());
        assert!(!file_content_equals(&a, b"abcd").unwrap());
        assert!(!file_content_equals(&a, b"abd").unwrap());
        assert!(!file_content_equals(&tmp.path().join("nope"), b"").unwrap());
    }
}
