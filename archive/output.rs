// This file is part of wrrkit, a toolkit for web request/response archives.
// Copyright (C) 2025 The wrrkit Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Output path templates.
//!
//! A template is a `%`-substitution string over record fields plus the
//! engine-injected `num` collision counter, e.g.
//! `%(syear)d/%(smonth)02d/%(stime_ms)d.%(num)d`. Expansion is a pure
//! function of `(template, record, num)`.

use base::{bail, err, Error};

use crate::record::{Field, Reqres};

/// Named templates, for people who don't want to write one by hand.
///
/// Most end in `.%(num)d`: without the counter the engine cannot place two
/// distinct records whose other fields collide. `flat` deliberately omits it
/// and is only suitable for deduplicated/`--latest` layouts.
pub static ALIASES: &[(&str, &str)] = &[
    (
        "default",
        "%(syear)d/%(smonth)02d/%(sday)02d/%(shour)02d%(sminute)02d%(ssecond)02d_%(stime_ms)d_%(method)s_%(urlhash)s_%(status)s_%(hostname)s.%(num)d",
    ),
    ("short", "%(syear)d/%(smonth)02d/%(sday)02d/%(stime_ms)d.%(num)d"),
    (
        "surl-msn",
        "%(scheme)s/%(netloc)s/%(filepath)s%(oqm)s%(query)s_%(method)s_%(status)s.%(num)d",
    ),
    (
        "hupq-msn",
        "%(hostname)s/%(filepath)s%(oqm)s%(query)s_%(method)s_%(status)s.%(num)d",
    ),
    ("flat", "%(hostname)s_%(method)s_%(urlhash)s_%(status)s"),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Conv {
    Str,
    Int,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Sub {
        name: String,
        /// Zero-pad an `Int` to this width; 0 for no padding.
        width: usize,
        conv: Conv,
    },
}

/// A compiled output path template.
#[derive(Clone, Debug)]
pub struct OutputFormat {
    spec: String,
    segments: Vec<Segment>,
}

impl OutputFormat {
    /// Resolves an `--output` argument: either an alias name or `format:`
    /// followed by a raw template. The caller appends the `.wrr` extension.
    pub fn resolve(spec: &str) -> Result<String, Error> {
        if let Some(raw) = spec.strip_prefix("format:") {
            return Ok(raw.to_owned());
        }
        match ALIASES.iter().find(|(name, _)| *name == spec) {
            Some((_, template)) => Ok((*template).to_owned()),
            None => Err(err!(
                InvalidArgument,
                msg(
                    "unknown `--output` alias \"{spec}\", prepend \"format:\" if you want it \
                     to be interpreted as a %-substitution template"
                )
            )),
        }
    }

    pub fn parse(spec: &str) -> Result<Self, Error> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = spec.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => literal.push('%'),
                Some('(') => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some(')') => break,
                            Some(c) => name.push(c),
                            None => bail!(
                                InvalidArgument,
                                msg("unterminated substitution in `--output` format: {spec}")
                            ),
                        }
                    }
                    let mut width = 0usize;
                    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                        width = width * 10 + d as usize;
                        chars.next();
                    }
                    let conv = match chars.next() {
                        Some('s') => Conv::Str,
                        Some('d') => Conv::Int,
                        _ => bail!(
                            InvalidArgument,
                            msg("bad conversion for `%({name})` in `--output` format: {spec}")
                        ),
                    };
                    segments.push(Segment::Sub { name, width, conv });
                }
                _ => bail!(
                    InvalidArgument,
                    msg("stray `%` in `--output` format: {spec}")
                ),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(OutputFormat {
            spec: spec.to_owned(),
            segments,
        })
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }

    /// Expands the template for one record and one collision counter value.
    pub fn expand(&self, rr: &Reqres, num: u64) -> Result<String, Error> {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(l) => out.push_str(l),
                Segment::Sub { name, width, conv } => {
                    let field = if name == "num" {
                        Field::Int(num as i64)
                    } else {
                        rr.format_field(name).ok_or_else(|| {
                            err!(
                                InvalidArgument,
                                msg("unknown `--output` substitution `{name}`")
                            )
                        })?
                    };
                    let width = *width;
                    match (*conv, field) {
                        (Conv::Int, Field::Int(i)) => {
                            out.push_str(&format!("{i:0width$}"));
                        }
                        (Conv::Str, Field::Int(i)) => out.push_str(&i.to_string()),
                        (Conv::Str, Field::Str(s)) => out.push_str(&s),
                        (Conv::Int, Field::Str(_)) => bail!(
                            InvalidArgument,
                            msg("`%({name})d` is not numeric; use `%({name})s`")
                        ),
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn literal_and_escape() {
        let f = OutputFormat::parse("a%%b/%(num)d").unwrap();
        let rr = testutil::reqres("https://example.org/", 0);
        assert_eq!(f.expand(&rr, 3).unwrap(), "a%b/3");
    }

    #[test]
    fn zero_padding() {
        let f = OutputFormat::parse("%(smonth)02d-%(sday)02d").unwrap();
        // 2020-09-13.
        let rr = testutil::reqres("https://example.org/", 1_600_000_000_123);
        assert_eq!(f.expand(&rr, 0).unwrap(), "09-13");
    }

    #[test]
    fn num_varies() {
        let f = OutputFormat::parse("%(hostname)s.%(num)d").unwrap();
        let rr = testutil::reqres("https://example.org/", 0);
        assert_eq!(f.expand(&rr, 0).unwrap(), "example.org.0");
        assert_eq!(f.expand(&rr, 1).unwrap(), "example.org.1");
    }

    #[test]
    fn unknown_field_fails() {
        let f = OutputFormat::parse("%(bogus)s").unwrap();
        let rr = testutil::reqres("https://example.org/", 0);
        let e = f.expand(&rr, 0).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
    }

    #[test]
    fn parse_errors() {
        OutputFormat::parse("%(x").unwrap_err();
        OutputFormat::parse("%x").unwrap_err();
        OutputFormat::parse("%(x)q").unwrap_err();
    }

    #[test]
    fn aliases_expand() {
        let rr = testutil::reqres("https://example.org/is/?arg1=1&arg2=", 1_600_000_000_123);
        for (name, template) in ALIASES {
            let f = OutputFormat::parse(template)
                .unwrap_or_else(|e| panic!("alias {name}: {}", e.chain()));
            let out = f
                .expand(&rr, 0)
                .unwrap_or_else(|e| panic!("alias {name}: {}", e.chain()));
            assert!(!out.is_empty(), "alias {name} expanded to nothing");
            assert!(!out.starts_with('/'), "alias {name} is absolute: {out}");
        }
        let f = OutputFormat::parse(ALIASES[3].1).unwrap();
        assert_eq!(
            f.expand(&rr, 2).unwrap(),
            "example.org/is/index.html?arg1=1&arg2=_GET_200C.2"
        );
    }

    #[test]
    fn resolve_alias_or_format() {
        assert_eq!(OutputFormat::resolve("format:%(num)d").unwrap(), "%(num)d");
        assert!(OutputFormat::resolve("short").unwrap().contains("%(num)d"));
        OutputFormat::resolve("nope").unwrap_err();
    }
}
