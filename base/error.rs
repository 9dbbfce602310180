// This file is part of wrrkit, a toolkit for web request/response archives.
// Copyright (C) 2025 The wrrkit Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error type carried through every fallible path in the workspace.
//!
//! Errors are classified by an [`ErrorKind`] so that callers can decide
//! whether a failure is record-local (skippable under `--errors`) or must
//! abort the run, without string-matching messages.

use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/0e00c430827e81d61e1e7164ef04ca21ccbfaa77/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link
/// for descriptions of each error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        })
    }
}

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug)]
struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<BoxedError>,
}

/// A classified error with an optional message and an optional source chain.
///
/// Construct via the [`err!`](crate::err) and [`bail!`](crate::bail) macros;
/// the first argument is either a bare [`ErrorKind`] variant or an existing
/// error whose kind (where one can be inferred) is carried over.
#[derive(Debug)]
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns a `Display` impl over this error and its whole cause chain,
    /// `: `-separated; the form everything user-visible is logged in.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.msg.as_deref() {
            Some(msg) => write!(f, "{}: {}", self.0.kind, msg),
            None => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// See [`Error::chain`].
pub struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(s) = source {
            write!(f, ": {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

/// Intermediate state for the [`err!`](crate::err) macro; not normally named
/// directly.
pub struct ErrorBuilder(Box<ErrorInner>);

impl ErrorBuilder {
    pub fn set_msg(mut self, msg: String) -> Self {
        self.0.msg = Some(msg);
        self
    }

    pub fn set_source<S: Into<BoxedError>>(mut self, source: S) -> Self {
        self.0.source = Some(source.into());
        self
    }

    pub fn build(self) -> Error {
        Error(self.0)
    }
}

impl From<ErrorKind> for ErrorBuilder {
    fn from(kind: ErrorKind) -> Self {
        ErrorBuilder(Box::new(ErrorInner {
            kind,
            msg: None,
            source: None,
        }))
    }
}

/// Wraps an existing [`Error`], keeping its kind and chaining it as a source.
impl From<Error> for ErrorBuilder {
    fn from(e: Error) -> Self {
        ErrorBuilder(Box::new(ErrorInner {
            kind: e.kind(),
            msg: None,
            source: Some(Box::new(e)),
        }))
    }
}

impl From<std::io::Error> for ErrorBuilder {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match e.kind() {
            IoKind::NotFound => ErrorKind::NotFound,
            IoKind::AlreadyExists => ErrorKind::AlreadyExists,
            IoKind::PermissionDenied => ErrorKind::PermissionDenied,
            IoKind::InvalidInput | IoKind::InvalidData => ErrorKind::InvalidArgument,
            IoKind::TimedOut => ErrorKind::DeadlineExceeded,
            IoKind::Interrupted => ErrorKind::Aborted,
            _ => ErrorKind::Unknown,
        };
        ErrorBuilder::from(kind).set_source(e)
    }
}

impl From<nix::Error> for ErrorBuilder {
    fn from(e: nix::Error) -> Self {
        let kind = match e {
            nix::Error::ENOENT => ErrorKind::NotFound,
            nix::Error::EEXIST => ErrorKind::AlreadyExists,
            nix::Error::EACCES | nix::Error::EPERM => ErrorKind::PermissionDenied,
            nix::Error::EINVAL | nix::Error::ENAMETOOLONG => ErrorKind::InvalidArgument,
            nix::Error::ENOSPC | nix::Error::EDQUOT => ErrorKind::ResourceExhausted,
            _ => ErrorKind::Unknown,
        };
        ErrorBuilder::from(kind).set_source(e)
    }
}

/// Builds an [`Error`].
///
/// The first argument is an `ErrorKind` variant name (in scope within the
/// macro) or any expression convertible to an [`ErrorBuilder`], optionally
/// followed by `msg(...)` (format args) and/or `source(...)`:
///
/// ```
/// use wrrkit_base::{err, ErrorKind};
/// let e = err!(NotFound, msg("no such archive {}", "x"));
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "Not found: no such archive x");
/// ```
#[macro_export]
macro_rules! err {
    ($builder:expr $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        $crate::ErrorBuilder::from($builder).build()
    }};
    ($builder:expr, msg($($msg:tt)*) $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        $crate::ErrorBuilder::from($builder)
            .set_msg(format!($($msg)*))
            .build()
    }};
    ($builder:expr, source($source:expr) $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        $crate::ErrorBuilder::from($builder)
            .set_source($source)
            .build()
    }};
    ($builder:expr, msg($($msg:tt)*), source($source:expr) $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        $crate::ErrorBuilder::from($builder)
            .set_msg(format!($($msg)*))
            .set_source($source)
            .build()
    }};
    ($builder:expr, source($source:expr), msg($($msg:tt)*) $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        $crate::ErrorBuilder::from($builder)
            .set_source($source)
            .set_msg(format!($($msg)*))
            .build()
    }};
}

/// Like [`err!`](crate::err), wrapped in `return Err(...)`.
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*))
    };
}
