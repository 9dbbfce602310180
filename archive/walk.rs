// This file is part of wrrkit, a toolkit for web request/response archives.
// Copyright (C) 2025 The wrrkit Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Walking archive trees and feeding records to a consumer.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use base::{err, shutdown, Error};
use tracing::error;
use walkdir::WalkDir;

use crate::fs::err_at;
use crate::record::Reqres;

/// Order in which records are visited. Placements for distinct destinations
/// are only deterministic across runs under `Sorted`/`Reversed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkOrder {
    Unsorted,
    Sorted,
    Reversed,
}

/// What to do when a single record cannot be read or placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
    Fail,
    Skip,
    Ignore,
}

impl FromStr for ErrorPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "fail" => Ok(ErrorPolicy::Fail),
            "skip" => Ok(ErrorPolicy::Skip),
            "ignore" => Ok(ErrorPolicy::Ignore),
            _ => Err(err!(
                InvalidArgument,
                msg("`--errors` must be one of fail/skip/ignore, not {s:?}")
            )),
        }
    }
}

/// True for failures that abort the run no matter the [`ErrorPolicy`]:
/// cancellation, engine bugs, lost durability, and the safety refusals
/// (would-overwrite, template variance) whose whole point is to stop before
/// data is lost.
pub(crate) fn is_fatal(kind: base::ErrorKind) -> bool {
    use base::ErrorKind::*;
    matches!(
        kind,
        Cancelled | Internal | DataLoss | FailedPrecondition | AlreadyExists
    )
}

pub(crate) fn apply_policy(errors: ErrorPolicy, e: Error) -> Result<(), Error> {
    if is_fatal(e.kind()) {
        return Err(e);
    }
    match errors {
        ErrorPolicy::Fail => Err(e),
        ErrorPolicy::Skip => {
            error!("{}", e.chain());
            Ok(())
        }
        ErrorPolicy::Ignore => Ok(()),
    }
}

fn is_part(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.as_encoded_bytes().ends_with(b".part"))
}

/// Walks `root` (a directory tree or a single file), parsing every record
/// and handing `(abs_path, rel_path, stat, reqres)` to `emit`.
///
/// Follows symlinks and reports each record under its resolved absolute
/// path. Skips in-progress `.part` files. Polls `shutdown` between records.
/// `errors` classifies both read/parse failures and failures returned by
/// `emit`.
pub fn walk_records<F>(
    root: &Path,
    order: WalkOrder,
    errors: ErrorPolicy,
    shutdown: &shutdown::Receiver,
    mut emit: F,
) -> Result<(), Error>
where
    F: FnMut(PathBuf, &Path, std::fs::Metadata, Reqres) -> Result<(), Error>,
{
    let mut walk = WalkDir::new(root).follow_links(true);
    walk = match order {
        WalkOrder::Unsorted => walk,
        WalkOrder::Sorted => walk.sort_by_file_name(),
        WalkOrder::Reversed => walk.sort_by(|a, b| b.file_name().cmp(a.file_name())),
    };
    for entry in walk {
        shutdown
            .check()
            .map_err(|e| err!(Cancelled, msg("interrupted"), source(e)))?;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                apply_policy(
                    errors,
                    err!(Unknown, msg("while walking `{}`", root.display()), source(e)),
                )?;
                continue;
            }
        };
        if !entry.file_type().is_file() || is_part(entry.path()) {
            continue;
        }
        let path = entry.path();
        let mut one = || -> Result<(), Error> {
            let abs = std::fs::canonicalize(path).map_err(|e| err_at(e, "resolve", path))?;
            let f = File::open(&abs).map_err(|e| err_at(e, "open", &abs))?;
            let meta = f.metadata().map_err(|e| err_at(e, "stat", &abs))?;
            let rr = Reqres::read_from(BufReader::new(f))
                .map_err(|e| err!(e, msg("while processing `{}`", path.display())))?;
            emit(abs, path, meta, rr)
        };
        if let Err(e) = one() {
            apply_policy(errors, e)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn collect(root: &Path, order: WalkOrder) -> Vec<PathBuf> {
        let (_tx, rx) = shutdown::channel();
        let mut seen = Vec::new();
        walk_records(root, order, ErrorPolicy::Fail, &rx, |_, rel, _, _| {
            seen.push(rel.to_path_buf());
            Ok(())
        })
        .unwrap();
        seen
    }

    #[test]
    fn ordering_and_part_skip() {
        testutil::init();
        let tmp = tempfile::TempDir::new().unwrap();
        let rr = testutil::reqres("https://example.org/", 0);
        testutil::write_record(tmp.path(), "b/2.wrr", &rr);
        testutil::write_record(tmp.path(), "a/1.wrr", &rr);
        testutil::write_record(tmp.path(), "a/0.wrr.part", &rr);

        let sorted = collect(tmp.path(), WalkOrder::Sorted);
        assert_eq!(
            sorted,
            vec![
                tmp.path().join("a/1.wrr"),
                tmp.path().join("b/2.wrr"),
            ]
        );
        let reversed = collect(tmp.path(), WalkOrder::Reversed);
        assert_eq!(
            reversed,
            vec![
                tmp.path().join("b/2.wrr"),
                tmp.path().join("a/1.wrr"),
            ]
        );
    }

    #[test]
    fn junk_skipped_or_fatal_per_policy() {
        testutil::init();
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("junk.wrr"), b"not cbor").unwrap();
        testutil::write_record(tmp.path(), "ok.wrr", &testutil::reqres("https://e.org/", 0));

        let (_tx, rx) = shutdown::channel();
        let mut n = 0;
        walk_records(
            tmp.path(),
            WalkOrder::Sorted,
            ErrorPolicy::Skip,
            &rx,
            |_, _, _, _| {
                n += 1;
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(n, 1);

        walk_records(
            tmp.path(),
            WalkOrder::Sorted,
            ErrorPolicy::Fail,
            &rx,
            |_, _, _, _| Ok(()),
        )
        .unwrap_err();
    }

    #[test]
    fn cancellation_wins_over_skip() {
        testutil::init();
        let tmp = tempfile::TempDir::new().unwrap();
        testutil::write_record(tmp.path(), "a.wrr", &testutil::reqres("https://e.org/", 0));
        let (tx, rx) = shutdown::channel();
        drop(tx);
        let e = walk_records(
            tmp.path(),
            WalkOrder::Sorted,
            ErrorPolicy::Skip,
            &rx,
            |_, _, _, _| Ok(()),
        )
        .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::Cancelled);
    }
}
