// This file is part of wrrkit, a toolkit for web request/response archives.
// Copyright (C) 2025 The wrrkit Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Subcommand to rename/move/copy/hardlink/symlink records based on their
//! contents.

use std::io::Read as _;
use std::path::{Path, PathBuf};

use archive::organize::{
    Action, Budgets, FileSource, Options, Organizer, OrganizeCtx, OrganizeIntent, StdoutSink,
};
use archive::output::OutputFormat;
use archive::record;
use archive::walk::{self, ErrorPolicy, WalkOrder};
use base::{bail, err, shutdown, Error};
use bpaf::{Bpaf, Parser};

/// Parses each record and renames/moves/copies/hardlinks/symlinks its file
/// to a destination path derived from the record's metadata.
///
/// Operations that could lead to accidental data loss are not permitted,
/// which is why the default `--output` template contains `%(num)d`.
#[derive(Bpaf, Debug)]
#[bpaf(command("organize"))]
pub struct Args {
    #[bpaf(external(action_arg))]
    action: Action,

    #[bpaf(external(updates_arg))]
    allow_updates: bool,

    /// Perform a trial run without any filesystem changes; implies no
    /// reporting.
    #[bpaf(long("dry-run"))]
    dry_run: bool,

    /// Don't log planned actions to stderr.
    #[bpaf(short('q'), long)]
    quiet: bool,

    /// What to do when a single record can't be read or placed.
    #[bpaf(long, argument("fail|skip|ignore"), fallback(ErrorPolicy::Fail))]
    errors: ErrorPolicy,

    #[bpaf(external(terminator_arg))]
    terminator: Option<u8>,

    #[bpaf(external(walk_arg))]
    walk: Option<WalkOrder>,

    /// Track at most this many distinct generated output paths; making this
    /// larger improves disk performance at the cost of memory.
    #[bpaf(long("seen-number"), argument("INT"), fallback(16384))]
    max_seen: usize,

    /// Cache stat information about this many files.
    #[bpaf(long("cache-number"), argument("INT"), fallback(8192))]
    max_cached: usize,

    /// Defer at most this many placements; zero applies every placement
    /// immediately.
    #[bpaf(long("defer-number"), argument("INT"), fallback(1024))]
    max_deferred: usize,

    /// Let up to this many extra placements accumulate so their fsyncs are
    /// applied together in a batch.
    #[bpaf(long("batch-number"), argument("INT"), fallback(128))]
    max_batched: usize,

    /// Memory budget for the caches and queues, in MiB.
    #[bpaf(long("max-memory"), argument("MIB"), fallback(1024))]
    max_memory: usize,

    /// Treat every budget as infinite: compute the desired filesystem state
    /// first, then perform all disk writes in a single batch.
    #[bpaf(long)]
    lazy: bool,

    /// Destination directory; when unset, each PATH must be a directory and
    /// is organized into itself.
    #[bpaf(short('t'), long("to"), argument("DESTINATION"))]
    destination: Option<PathBuf>,

    /// Template for generated output paths: an alias name or "format:"
    /// followed by a %-substitution template.
    #[bpaf(
        short('o'),
        long("output"),
        argument("FORMAT"),
        fallback("default".to_owned())
    )]
    output: String,

    /// Read additional NUL-terminated PATHs from stdin.
    #[bpaf(long)]
    stdin0: bool,

    /// Input files or directories.
    #[bpaf(positional("PATH"))]
    paths: Vec<PathBuf>,
}

fn action_arg() -> impl Parser<Action> {
    let move_ = bpaf::long("move")
        .help("move source files under DESTINATION (default)")
        .req_flag(Action::Move);
    let copy = bpaf::long("copy")
        .help("copy source files to files under DESTINATION")
        .req_flag(Action::Copy);
    let hardlink = bpaf::long("hardlink")
        .help("create hardlinks from source files to paths under DESTINATION")
        .req_flag(Action::Hardlink);
    let symlink = bpaf::long("symlink")
        .help("create symlinks from source files to paths under DESTINATION")
        .req_flag(Action::Symlink);
    bpaf::construct!([move_, copy, hardlink, symlink]).fallback(Action::Move)
}

fn updates_arg() -> impl Parser<bool> {
    let keep = bpaf::long("keep")
        .help("never replace existing files under DESTINATION (default); broken symlinks may still be replaced")
        .req_flag(false);
    let latest = bpaf::long("latest")
        .help("replace files under DESTINATION when the source record is newer")
        .req_flag(true);
    bpaf::construct!([keep, latest]).fallback(false)
}

fn terminator_arg() -> impl Parser<Option<u8>> {
    let zero = bpaf::long("zero-terminated")
        .help("terminate reported paths with NUL instead of newline")
        .req_flag(Some(0u8));
    let none = bpaf::long("no-report")
        .help("don't report placed paths on stdout")
        .req_flag(None);
    bpaf::construct!([zero, none]).fallback(Some(b'\n'))
}

fn walk_arg() -> impl Parser<Option<WalkOrder>> {
    let sorted = bpaf::long("walk-sorted")
        .help("process paths in lexicographic order (default, unless `--latest`)")
        .req_flag(Some(WalkOrder::Sorted));
    let reversed = bpaf::long("walk-reversed")
        .help("process paths in reverse lexicographic order (default under `--latest`)")
        .req_flag(Some(WalkOrder::Reversed));
    let unsorted = bpaf::long("walk-unsorted")
        .help("process paths in whatever order the filesystem returns them")
        .req_flag(Some(WalkOrder::Unsorted));
    bpaf::construct!([sorted, reversed, unsorted]).fallback(None)
}

pub fn run(args: Args, shutdown: shutdown::Receiver) -> Result<i32, Error> {
    let template = format!("{}.{}", OutputFormat::resolve(&args.output)?, record::FILE_EXT);
    let format = OutputFormat::parse(&template)?;
    let order = args.walk.unwrap_or(if args.allow_updates {
        WalkOrder::Reversed
    } else {
        WalkOrder::Sorted
    });
    let terminator = if args.dry_run { None } else { args.terminator };
    let budgets = Budgets {
        max_seen: args.max_seen,
        max_cached: args.max_cached,
        max_deferred: args.max_deferred,
        max_batched: args.max_batched,
        max_memory: args.max_memory,
        lazy: args.lazy,
    };

    let mut paths = args.paths.clone();
    if args.stdin0 {
        read_stdin0(&mut paths)?;
    }
    if paths.is_empty() {
        bail!(InvalidArgument, msg("no input PATHs given"));
    }
    match order {
        WalkOrder::Sorted => paths.sort(),
        WalkOrder::Reversed => {
            paths.sort();
            paths.reverse();
        }
        WalkOrder::Unsorted => {}
    }

    match &args.destination {
        Some(dest) => {
            let dest = absolutize(dest)?;
            organize_into(&args, &format, &dest, order, terminator, &budgets, &paths, &shutdown)?;
        }
        None => {
            if args.allow_updates {
                bail!(InvalidArgument, msg("`--latest` without `--to` is not allowed"));
            }
            // Each path is its own destination.
            for path in &paths {
                match std::fs::metadata(path) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        bail!(NotFound, msg("`{}` does not exist", path.display()))
                    }
                    Err(e) => return Err(err!(e, msg("unable to stat `{}`", path.display()))),
                    Ok(m) if !m.is_dir() => bail!(
                        InvalidArgument,
                        msg(
                            "`{}` is not a directory but no `--to` is specified",
                            path.display()
                        )
                    ),
                    Ok(_) => {}
                }
            }
            for path in &paths {
                let dest = absolutize(path)?;
                organize_into(
                    &args,
                    &format,
                    &dest,
                    order,
                    terminator,
                    &budgets,
                    std::slice::from_ref(path),
                    &shutdown,
                )?;
            }
        }
    }
    Ok(0)
}

/// Runs one engine over `paths` into `dest`, guaranteeing the final flush on
/// every exit path: queued placements are drained even when the walk stops
/// early (including on interrupt), so reported output stays consistent with
/// disk.
#[allow(clippy::too_many_arguments)]
fn organize_into(
    args: &Args,
    format: &OutputFormat,
    dest: &Path,
    order: WalkOrder,
    terminator: Option<u8>,
    budgets: &Budgets,
    paths: &[PathBuf],
    shutdown: &shutdown::Receiver,
) -> Result<(), Error> {
    let opts = Options {
        destination: dest.to_path_buf(),
        format: format.clone(),
        dry_run: args.dry_run,
        quiet: args.quiet,
        errors: args.errors,
        terminator,
        budgets: budgets.clone(),
    };
    let cx = OrganizeCtx {
        action: args.action,
        allow_updates: args.allow_updates,
    };
    let mut org: Organizer<OrganizeIntent> =
        Organizer::new(opts, cx, Box::new(StdoutSink::new()), shutdown.clone());

    let walked = (|| -> Result<(), Error> {
        for path in paths {
            walk::walk_records(path, order, args.errors, shutdown, |abs, _rel, stat, rr| {
                org.emit(FileSource::new(abs, stat, Some(rr.stime())), &rr)
            })?;
        }
        Ok(())
    })();
    let finished = org.finish();
    walked.and(finished)
}

fn read_stdin0(paths: &mut Vec<PathBuf>) -> Result<(), Error> {
    use std::os::unix::ffi::OsStringExt;
    let mut buf = Vec::new();
    std::io::stdin()
        .read_to_end(&mut buf)
        .map_err(|e| err!(e, msg("unable to read stdin")))?;
    let mut items: Vec<&[u8]> = buf.split(|b| *b == 0).collect();
    if items.pop() != Some(&b""[..]) {
        bail!(InvalidArgument, msg("`--stdin0` input format error"));
    }
    for item in items {
        paths.push(PathBuf::from(std::ffi::OsString::from_vec(item.to_vec())));
    }
    Ok(())
}

fn absolutize(path: &Path) -> Result<PathBuf, Error> {
    let res = if path.exists() {
        path.canonicalize()
    } else {
        std::path::absolute(path)
    };
    res.map_err(|e| err!(e, msg("unable to resolve `{}`", path.display())))
}
