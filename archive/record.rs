// This file is part of wrrkit, a toolkit for web request/response archives.
// Copyright (C) 2025 The wrrkit Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! The WRR record format: one HTTP request/response pair plus metadata,
//! serialized as a self-contained CBOR value.

use std::fmt;
use std::io::Read;
use std::path::Path;

use base::{bail, err, Error};
use serde::{Deserialize, Serialize};

/// Extension of finished record files. In-progress files carry an extra
/// `.part` suffix, which the walker and the organize engine both treat as
/// invisible.
pub const FILE_EXT: &str = "wrr";

const FORMAT_VERSION: u32 = 1;

/// Source time: milliseconds since the Unix epoch at which the request was
/// initiated. This is the value `organize --latest` compares to decide which
/// of two records mapping to the same output path is newer.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Stime(pub i64);

impl Stime {
    pub fn as_millis(self) -> i64 {
        self.0
    }

    fn to_utc(self) -> jiff::Zoned {
        let ts = jiff::Timestamp::from_millisecond(self.0).unwrap_or(jiff::Timestamp::UNIX_EPOCH);
        ts.to_zoned(jiff::tz::TimeZone::UTC)
    }
}

impl fmt::Display for Stime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_utc().timestamp())
    }
}

/// A field value produced for the output path template.
///
/// Integers stay integers so that `%(smonth)02d`-style zero padding can
/// apply; everything else is an already-rendered string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Field {
    Int(i64),
    Str(String),
}

/// One reqres. The body fields make the record self-contained; the engine
/// itself only ever looks at `stime` and the template fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reqres {
    pub version: u32,
    pub stime: Stime,
    pub method: String,
    pub url: String,
    pub status: Option<u16>,
    pub complete: bool,
    #[serde(default)]
    pub request_headers: Vec<(String, String)>,
    #[serde(default)]
    pub response_headers: Vec<(String, String)>,
    #[serde(default)]
    pub request_body: Vec<u8>,
    #[serde(default)]
    pub response_body: Vec<u8>,
}

impl Reqres {
    pub fn read_from<R: Read>(r: R) -> Result<Self, Error> {
        let rr: Reqres = serde_cbor::from_reader(r)
            .map_err(|e| err!(InvalidArgument, msg("unable to parse record"), source(e)))?;
        if rr.version != FORMAT_VERSION {
            bail!(
                Unimplemented,
                msg("unsupported record version {}", rr.version)
            );
        }
        Ok(rr)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        Self::read_from(data)
    }

    pub fn read_file(path: &Path) -> Result<Self, Error> {
        let f = std::fs::File::open(path)
            .map_err(|e| err!(e, msg("unable to open `{}`", path.display())))?;
        Self::read_from(std::io::BufReader::new(f))
            .map_err(|e| err!(e, msg("while parsing `{}`", path.display())))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, Error> {
        serde_cbor::to_vec(self).map_err(|e| err!(Internal, source(e)))
    }

    pub fn stime(&self) -> Stime {
        self.stime
    }

    /// `<code><C|I>`, e.g. `200C` for a complete 200 response; requests that
    /// never got a response render their code as 0.
    fn status_field(&self) -> String {
        format!(
            "{}{}",
            self.status.unwrap_or(0),
            if self.complete { 'C' } else { 'I' }
        )
    }

    /// Looks up a single template field by name; `None` for unknown names.
    pub fn format_field(&self, name: &str) -> Option<Field> {
        let t = self.stime.to_utc();
        Some(match name {
            "stime_ms" => Field::Int(self.stime.0),
            "syear" => Field::Int(t.year() as i64),
            "smonth" => Field::Int(t.month() as i64),
            "sday" => Field::Int(t.day() as i64),
            "shour" => Field::Int(t.hour() as i64),
            "sminute" => Field::Int(t.minute() as i64),
            "ssecond" => Field::Int(t.second() as i64),
            "method" => Field::Str(self.method.clone()),
            "status" => Field::Str(self.status_field()),
            "scheme" => Field::Str(self.parsed_url()?.scheme().to_owned()),
            "hostname" => Field::Str(self.parsed_url()?.host_str().unwrap_or("-").to_owned()),
            "netloc" => {
                let u = self.parsed_url()?;
                let host = u.host_str().unwrap_or("-");
                Field::Str(match u.port() {
                    Some(p) => format!("{host}:{p}"),
                    None => host.to_owned(),
                })
            }
            "filepath" => Field::Str(sanitized_path(&self.parsed_url()?)),
            "query" => Field::Str(self.parsed_url()?.query().unwrap_or("").replace('/', "_")),
            "oqm" => {
                let has_query = self
                    .parsed_url()
                    .is_some_and(|u| !u.query().unwrap_or("").is_empty());
                Field::Str(if has_query { "?" } else { "" }.to_owned())
            }
            "urlhash" => {
                let digest = blake3::hash(self.url.as_bytes());
                Field::Str(digest.to_hex()[..4].to_owned())
            }
            _ => return None,
        })
    }

    fn parsed_url(&self) -> Option<url::Url> {
        url::Url::parse(&self.url).ok()
    }
}

/// The URL path as a relative filesystem path: no empty, `.`, or `..`
/// segments (so a template can never climb out of the destination), with
/// directory-like URLs given an `index.html` leaf.
fn sanitized_path(u: &url::Url) -> String {
    let mut segments: Vec<&str> = u
        .path()
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .collect();
    if u.path().ends_with('/') || segments.is_empty() {
        segments.push("index.html");
    }
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn round_trip() {
        let rr = testutil::reqres("https://example.org/a/b?x=1", 1_600_000_000_123);
        let bytes = rr.to_vec().unwrap();
        let back = Reqres::from_slice(&bytes).unwrap();
        assert_eq!(rr, back);
    }

    #[test]
    fn rejects_future_version() {
        let mut rr = testutil::reqres("https://example.org/", 0);
        rr.version = 2;
        let bytes = serde_cbor::to_vec(&rr).unwrap();
        let e = Reqres::from_slice(&bytes).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::Unimplemented);
    }

    #[test]
    fn status_completeness_flag() {
        let mut rr = testutil::reqres("https://example.org/", 0);
        assert_eq!(rr.format_field("status"), Some(Field::Str("200C".into())));
        rr.complete = false;
        rr.status = None;
        assert_eq!(rr.format_field("status"), Some(Field::Str("0I".into())));
    }

    #[test]
    fn date_fields_are_utc() {
        // 2020-09-13T12:26:40.123Z.
        let rr = testutil::reqres("https://example.org/", 1_600_000_000_123);
        assert_eq!(rr.format_field("syear"), Some(Field::Int(2020)));
        assert_eq!(rr.format_field("smonth"), Some(Field::Int(9)));
        assert_eq!(rr.format_field("sday"), Some(Field::Int(13)));
        assert_eq!(rr.format_field("shour"), Some(Field::Int(12)));
    }

    #[test]
    fn url_fields() {
        let rr = testutil::reqres("https://example.org:8443/is/../a//b/?arg=1&p=a/b", 0);
        assert_eq!(rr.format_field("scheme"), Some(Field::Str("https".into())));
        assert_eq!(
            rr.format_field("netloc"),
            Some(Field::Str("example.org:8443".into()))
        );
        // `..` is gone and the trailing slash becomes an index.html leaf.
        assert_eq!(
            rr.format_field("filepath"),
            Some(Field::Str("a/b/index.html".into()))
        );
        assert_eq!(
            rr.format_field("query"),
            Some(Field::Str("arg=1&p=a_b".into()))
        );
        assert_eq!(rr.format_field("oqm"), Some(Field::Str("?".into())));
        assert_eq!(rr.format_field("nope"), None);
    }
}
