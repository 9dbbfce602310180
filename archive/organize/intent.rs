// This file is part of wrrkit, a toolkit for web request/response archives.
// Copyright (C) 2025 The wrrkit Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The intent protocol: how one pending placement is created, merged with a
//! later placement for the same destination, and finally executed.

use std::borrow::Cow;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use base::{bail, err, Error};

use super::NOT_ALLOWED;
use crate::fs::{self, DeferredSync};
use crate::record::{Reqres, Stime};

/// Which placement syscall family `organize` runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Move,
    Copy,
    Hardlink,
    Symlink,
}

impl Action {
    /// The CLI flag selecting this action, for diagnostics.
    pub fn flag(self) -> &'static str {
        match self {
            Action::Move => "move",
            Action::Copy => "copy",
            Action::Hardlink => "hardlink",
            Action::Symlink => "symlink",
        }
    }

    fn gerund(self) -> &'static str {
        match self {
            Action::Move => "moving",
            Action::Copy => "copying",
            Action::Hardlink => "hardlinking",
            Action::Symlink => "symlinking",
        }
    }
}

/// Something that identifies content a destination could be made to hold.
pub trait IoSource {
    /// Byte estimate for the memory account.
    fn approx_size(&self) -> usize;

    /// Display string for log lines.
    fn format_source(&self) -> Cow<'_, str>;
}

/// The outcome of re-targeting an existing disposition with a later source.
pub struct Update<S> {
    /// What the source cache should now believe is (or will be) at the
    /// destination.
    pub source: S,
    /// False iff applying `new` would overwrite non-identical content and
    /// updates are not allowed.
    pub permitted: bool,
    /// True iff the intent adopted the new source, i.e. the destination's
    /// eventual content changed.
    pub adopted: bool,
}

/// The initial disposition for a destination: maybe an intent to queue,
/// maybe a cache entry, and whether the placement may proceed at this path.
pub struct Deferral<I: DeferredIo> {
    pub intent: Option<I>,
    pub source: Option<I::Source>,
    pub permitted: bool,
}

/// One family of deferred placement operations. Exactly one intent per
/// destination is ever queued; the engine routes a later emit for the same
/// destination through [`DeferredIo::update_from`] instead of creating a
/// second one.
pub trait DeferredIo: Sized {
    type Source: IoSource + Clone;
    type Ctx;

    /// Gerund for log lines: "moving", "updating copy", ...
    fn actioning(cx: &Self::Ctx) -> Cow<'static, str>;

    /// Decides the initial disposition of placing `new` at `dest`, given
    /// what the cache believed was there (`old`, if anything).
    fn defer(
        cx: &Self::Ctx,
        dest: &Path,
        old: Option<Self::Source>,
        new: Self::Source,
    ) -> Result<Deferral<Self>, Error>;

    /// Merges a later placement for this intent's destination.
    fn update_from(&mut self, cx: &Self::Ctx, new: Self::Source) -> Result<Update<Self::Source>, Error>;

    /// Executes the placement. On success returns a source describing the
    /// new on-disk state at `dest`, for the cache. Must only be called once,
    /// by the flush controller.
    fn run(
        &mut self,
        cx: &Self::Ctx,
        dest: &Path,
        sync: &mut DeferredSync,
        dry_run: bool,
    ) -> Result<Option<Self::Source>, Error>;

    fn approx_size(&self) -> usize;
    fn format_source(&self) -> Cow<'_, str>;
}

/// A file on disk believed to hold a record, plus its lazily read stime.
#[derive(Clone, Debug)]
pub struct FileSource {
    pub abs_path: PathBuf,
    pub stat: Metadata,
    stime: Option<Stime>,
}

impl FileSource {
    pub fn new(abs_path: PathBuf, stat: Metadata, stime: Option<Stime>) -> Self {
        FileSource {
            abs_path,
            stat,
            stime,
        }
    }

    /// The record's stime, parsed on first need: from `data` if the caller
    /// already read the file, else from disk.
    fn stime(&mut self, data: Option<&[u8]>) -> Result<Stime, Error> {
        if let Some(s) = self.stime {
            return Ok(s);
        }
        let rr = match data {
            Some(d) => Reqres::from_slice(d)
                .map_err(|e| err!(e, msg("while parsing `{}`", self.abs_path.display())))?,
            None => Reqres::read_file(&self.abs_path)?,
        };
        self.stime = Some(rr.stime());
        Ok(rr.stime())
    }
}

impl IoSource for FileSource {
    fn approx_size(&self) -> usize {
        128 + self.abs_path.as_os_str().len()
    }

    fn format_source(&self) -> Cow<'_, str> {
        self.abs_path.to_string_lossy()
    }
}

pub struct OrganizeCtx {
    pub action: Action,
    pub allow_updates: bool,
}

/// A pending move/copy/hardlink/symlink of `source` to the destination it
/// is queued under. `exists` records whether the destination was present
/// when the disposition was made, i.e. whether executing is a replacement.
pub struct OrganizeIntent {
    source: FileSource,
    exists: bool,
}

impl DeferredIo for OrganizeIntent {
    type Source = FileSource;
    type Ctx = OrganizeCtx;

    fn actioning(cx: &OrganizeCtx) -> Cow<'static, str> {
        if cx.allow_updates {
            Cow::Owned(format!("updating {}", cx.action.flag()))
        } else {
            Cow::Borrowed(cx.action.gerund())
        }
    }

    fn defer(
        cx: &OrganizeCtx,
        dest: &Path,
        old: Option<FileSource>,
        new: FileSource,
    ) -> Result<Deferral<Self>, Error> {
        if new.abs_path == dest {
            // Hot path: renaming/linking a record to where it already lives.
            return Ok(Deferral {
                intent: None,
                source: old,
                permitted: true,
            });
        }

        let old = match old {
            Some(old) => old,
            None => match std::fs::symlink_metadata(dest) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(Deferral {
                        intent: Some(OrganizeIntent {
                            source: new.clone(),
                            exists: false,
                        }),
                        source: Some(new),
                        permitted: true,
                    });
                }
                Err(e) => return Err(fs::err_at(e, "stat", dest)),
                Ok(lst) if lst.file_type().is_symlink() => {
                    match std::fs::metadata(dest) {
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            // A dangling symlink may always be replaced.
                            return Ok(Deferral {
                                intent: Some(OrganizeIntent {
                                    source: new.clone(),
                                    exists: true,
                                }),
                                source: Some(new),
                                permitted: true,
                            });
                        }
                        Err(e) => return Err(fs::err_at(e, "stat", dest)),
                        Ok(target_stat) => {
                            if cx.action != Action::Symlink {
                                bail!(
                                    FailedPrecondition,
                                    msg(
                                        "`--{}` is set but `{}` exists and is a symlink{}",
                                        cx.action.flag(),
                                        dest.display(),
                                        NOT_ALLOWED
                                    )
                                );
                            }
                            // Adopt the link's resolved target as the current
                            // source, so an unchanged link is a noop and a
                            // replacement re-points at the newer record.
                            let real = std::fs::canonicalize(dest)
                                .map_err(|e| fs::err_at(e, "resolve", dest))?;
                            FileSource::new(real, target_stat, None)
                        }
                    }
                }
                Ok(_) if cx.action == Action::Symlink => {
                    bail!(
                        FailedPrecondition,
                        msg(
                            "`--symlink` is set but `{}` exists and is not a symlink{}",
                            dest.display(),
                            NOT_ALLOWED
                        )
                    );
                }
                Ok(lst) => FileSource::new(dest.to_path_buf(), lst, None),
            },
        };

        // Re-create the intent as if it had been generated from what is on
        // disk, then let the update protocol decide.
        let mut intent = OrganizeIntent {
            source: old,
            exists: true,
        };
        let u = intent.update_from(cx, new.clone())?;
        if cx.action == Action::Move && u.permitted {
            // Permitted moves always re-run, even when the contents already
            // match: dedup-via-move must still consume the source file.
            return Ok(Deferral {
                intent: Some(OrganizeIntent {
                    source: new.clone(),
                    exists: true,
                }),
                source: Some(new),
                permitted: true,
            });
        }
        if !u.adopted {
            // Disk already matches, or the update was refused: nothing to do
            // at this destination.
            return Ok(Deferral {
                intent: None,
                source: Some(u.source),
                permitted: u.permitted,
            });
        }
        Ok(Deferral {
            intent: Some(intent),
            source: Some(u.source),
            permitted: true,
        })
    }

    fn update_from(&mut self, cx: &OrganizeCtx, mut new: FileSource) -> Result<Update<FileSource>, Error> {
        if cx.action == Action::Symlink {
            if self.source.abs_path == new.abs_path {
                // Same link target.
                return Ok(Update {
                    source: self.source.clone(),
                    permitted: true,
                    adopted: false,
                });
            }
        } else {
            if fs::samestat(&self.source.stat, &new.stat) {
                // Same inode.
                return Ok(Update {
                    source: self.source.clone(),
                    permitted: true,
                    adopted: false,
                });
            }
            let disk_data = std::fs::read(&self.source.abs_path)
                .map_err(|e| fs::err_at(e, "read", &self.source.abs_path))?;
            if fs::file_content_equals(&new.abs_path, &disk_data)? {
                // Same bytes on disk.
                return Ok(Update {
                    source: self.source.clone(),
                    permitted: true,
                    adopted: false,
                });
            }
            if !cx.allow_updates {
                return Ok(Update {
                    source: self.source.clone(),
                    permitted: false,
                    adopted: false,
                });
            }
            let old_stime = self.source.stime(Some(&disk_data))?;
            let new_stime = new.stime(None)?;
            return Ok(self.adopt_if_newer(old_stime, new_stime, new));
        }

        if !cx.allow_updates {
            return Ok(Update {
                source: self.source.clone(),
                permitted: false,
                adopted: false,
            });
        }
        let old_stime = self.source.stime(None)?;
        let new_stime = new.stime(None)?;
        Ok(self.adopt_if_newer(old_stime, new_stime, new))
    }

    fn run(
        &mut self,
        cx: &OrganizeCtx,
        dest: &Path,
        sync: &mut DeferredSync,
        dry_run: bool,
    ) -> Result<Option<FileSource>, Error> {
        assert_ne!(self.source.abs_path, dest);
        if dry_run {
            // Nothing is created at `dest`; keep describing the source file
            // so later content comparisons read something that exists.
            return Ok(Some(self.source.clone()));
        }
        let moved = FileSource::new(
            dest.to_path_buf(),
            self.source.stat.clone(),
            self.source.stime,
        );
        fs::ensure_parent(dest, sync)?;
        let src = &self.source.abs_path;
        Ok(Some(match cx.action {
            Action::Move => {
                fs::atomic_move(src, dest, self.exists, sync)?;
                moved
            }
            Action::Copy => {
                let meta = fs::atomic_copy(src, dest, self.exists, sync)?;
                FileSource::new(dest.to_path_buf(), meta, self.source.stime)
            }
            Action::Hardlink => {
                fs::atomic_hardlink(src, dest, self.exists, sync)?;
                moved
            }
            Action::Symlink => {
                fs::atomic_symlink(src, dest, self.exists, sync)?;
                self.source.clone()
            }
        }))
    }

    fn approx_size(&self) -> usize {
        32 + self.source.approx_size()
    }

    fn format_source(&self) -> Cow<'_, str> {
        self.source.format_source()
    }
}

impl OrganizeIntent {
    fn adopt_if_newer(&mut self, old: Stime, new_stime: Stime, new: FileSource) -> Update<FileSource> {
        if old < new_stime {
            self.source = new;
            Update {
                source: self.source.clone(),
                permitted: true,
                adopted: true,
            }
        } else {
            Update {
                source: self.source.clone(),
                permitted: true,
                adopted: false,
            }
        }
    }
}

/// An in-memory record to be written out: the seam importers of foreign
/// capture formats hand their converted reqres to.
#[derive(Clone)]
pub struct BytesSource {
    display: String,
    data: Vec<u8>,
    stime: Option<Stime>,
}

impl BytesSource {
    pub fn new(display: String, data: Vec<u8>) -> Self {
        BytesSource {
            display,
            data,
            stime: None,
        }
    }

    fn stime(&mut self) -> Result<Stime, Error> {
        if let Some(s) = self.stime {
            return Ok(s);
        }
        let rr = Reqres::from_slice(&self.data)
            .map_err(|e| err!(e, msg("while parsing `{}`", self.display)))?;
        self.stime = Some(rr.stime());
        Ok(rr.stime())
    }
}

impl IoSource for BytesSource {
    fn approx_size(&self) -> usize {
        128 + self.display.len() + self.data.len()
    }

    fn format_source(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.display)
    }
}

pub struct SaveCtx {
    pub allow_updates: bool,
}

/// A pending file write of an in-memory record.
pub struct SaveIntent {
    source: BytesSource,
    exists: bool,
}

impl DeferredIo for SaveIntent {
    type Source = BytesSource;
    type Ctx = SaveCtx;

    fn actioning(cx: &SaveCtx) -> Cow<'static, str> {
        if cx.allow_updates {
            Cow::Borrowed("updating save")
        } else {
            Cow::Borrowed("saving")
        }
    }

    fn defer(
        cx: &SaveCtx,
        dest: &Path,
        old: Option<BytesSource>,
        new: BytesSource,
    ) -> Result<Deferral<Self>, Error> {
        let old = match old {
            Some(old) => old,
            None => match std::fs::symlink_metadata(dest) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(Deferral {
                        intent: Some(SaveIntent {
                            source: new.clone(),
                            exists: false,
                        }),
                        source: Some(new),
                        permitted: true,
                    });
                }
                Err(e) => return Err(fs::err_at(e, "stat", dest)),
                Ok(lst) if lst.file_type().is_symlink() => {
                    bail!(
                        FailedPrecondition,
                        msg("`{}` exists and is a symlink{}", dest.display(), NOT_ALLOWED)
                    );
                }
                Ok(_) => {
                    let data = std::fs::read(dest).map_err(|e| fs::err_at(e, "read", dest))?;
                    BytesSource::new(dest.to_string_lossy().into_owned(), data)
                }
            },
        };
        let mut intent = SaveIntent {
            source: old,
            exists: true,
        };
        let u = intent.update_from(cx, new)?;
        if !u.adopted {
            return Ok(Deferral {
                intent: None,
                source: Some(u.source),
                permitted: u.permitted,
            });
        }
        Ok(Deferral {
            intent: Some(intent),
            source: Some(u.source),
            permitted: true,
        })
    }

    fn update_from(&mut self, cx: &SaveCtx, mut new: BytesSource) -> Result<Update<BytesSource>, Error> {
        if self.source.data == new.data {
            return Ok(Update {
                source: self.source.clone(),
                permitted: true,
                adopted: false,
            });
        }
        if !cx.allow_updates {
            return Ok(Update {
                source: self.source.clone(),
                permitted: false,
                adopted: false,
            });
        }
        if self.source.stime()? < new.stime()? {
            self.source = new;
            Ok(Update {
                source: self.source.clone(),
                permitted: true,
                adopted: true,
            })
        } else {
            Ok(Update {
                source: self.source.clone(),
                permitted: true,
                adopted: false,
            })
        }
    }

    fn run(
        &mut self,
        _cx: &SaveCtx,
        dest: &Path,
        sync: &mut DeferredSync,
        dry_run: bool,
    ) -> Result<Option<BytesSource>, Error> {
        if dry_run {
            return Ok(Some(self.source.clone()));
        }
        let saved = BytesSource {
            display: dest.to_string_lossy().into_owned(),
            data: self.source.data.clone(),
            stime: self.source.stime,
        };
        fs::ensure_parent(dest, sync)?;
        fs::atomic_write(&self.source.data, dest, self.exists, sync)?;
        Ok(Some(saved))
    }

    fn approx_size(&self) -> usize {
        32 + self.source.approx_size()
    }

    fn format_source(&self) -> Cow<'_, str> {
        self.source.format_source()
    }
}
