// This file is part of wrrkit, a toolkit for web request/response archives.
// Copyright (C) 2025 The wrrkit Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

use base::Error;
use bpaf::Bpaf;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod cmds;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// wrrkit: a toolkit for on-disk archives of web request/response records.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the respective subcommands.
    Organize(#[bpaf(external(cmds::organize::args))] cmds::organize::Args),
}

impl Args {
    fn run(self, shutdown: base::shutdown::Receiver) -> Result<i32, Error> {
        match self {
            Args::Organize(a) => cmds::organize::run(a, shutdown),
        }
    }
}

fn main() {
    base::tracing_setup::install();

    let shutdown = match base::shutdown::install_signal_handlers() {
        Ok(rx) => rx,
        Err(e) => {
            eprintln!("unable to install signal handlers: {e}");
            std::process::exit(1);
        }
    };

    // Get the program name from the OS (e.g. if invoked via a symlink),
    // falling back to the crate name if conversion to a UTF-8 string fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("Parsed command-line arguments: {args:#?}");

    match args.run(shutdown) {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {rv}");
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }
}
