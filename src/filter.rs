/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use log::warn;
use regex::Regex;

/// Half-open value interval mapped to a replacement literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub lower: i64,
    pub upper: i64,
    pub value: i64,
}

impl Interval {
    fn contains(&self, value: i64) -> bool {
        value >= self.lower && value < self.upper
    }
}

/// Per-function rewrite rule: which argument indices to keep and, per
/// index, which value intervals collapse to which literal.
///
/// Indices are keyed by their *string* token and iterate in lexicographic
/// order, so filters naming out-of-order or non-contiguous indices drop
/// the unnamed positions.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub func_name: String,
    indices: BTreeMap<String, Vec<Interval>>,
}

impl Filter {
    pub fn new(func_name: &str) -> Self {
        Filter {
            func_name: func_name.to_owned(),
            indices: BTreeMap::new(),
        }
    }

    fn insert_index(&mut self, index: &str) {
        self.indices.entry(index.to_owned()).or_default();
    }

    fn insert_interval(&mut self, index: &str, interval: Interval) {
        self.indices.entry(index.to_owned()).or_default().push(interval);
    }

    /// Build the rewritten argument list. Bucketed indices whose
    /// intervals all miss (or whose argument is not an integer) pass the
    /// argument through unchanged; indices beyond the argument list are
    /// dropped.
    pub fn apply(&self, args: &[Option<String>]) -> Vec<Option<String>> {
        let mut rewritten = Vec::with_capacity(self.indices.len());
        for (token, intervals) in &self.indices {
            let index: usize = token.parse().expect("validated during parsing");
            let Some(arg) = args.get(index) else {
                warn!(
                    "filter for '{}' names argument {} but the record has {}",
                    self.func_name,
                    index,
                    args.len()
                );
                continue;
            };
            let replacement = arg
                .as_deref()
                .and_then(|arg| arg.parse::<i64>().ok())
                .and_then(|value| intervals.iter().find(|iv| iv.contains(value)))
                .map(|iv| iv.value.to_string());
            rewritten.push(replacement.or_else(|| arg.clone()));
        }
        rewritten
    }
}

/// Rewrite `args` through every filter whose function name matches, in
/// declaration order. Records matching no filter pass through untouched.
pub fn rewrite_args(
    filters: &[Filter],
    func_name: &str,
    mut args: Vec<Option<String>>,
) -> Vec<Option<String>> {
    for filter in filters {
        if filter.func_name == func_name {
            args = filter.apply(&args);
        }
    }
    args
}

fn bracket_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)\[(.*)\]$").expect("static pattern"))
}

fn range_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+):(\d+)-(\d+)").expect("static pattern"))
}

/// Parse whitespace-tokenized filter lines: the first token names the
/// function, each further token is either a bare index or
/// `N[lo:hi-v,…]`. Malformed tokens are warned about and skipped.
pub fn parse_filters(text: &str) -> Vec<Filter> {
    let mut filters = Vec::new();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        let Some(func_name) = tokens.next() else {
            continue;
        };
        let mut filter = Filter::new(func_name);
        for token in tokens {
            if token.contains('[') {
                let Some(captures) = bracket_regex().captures(token) else {
                    warn!("invalid range format in filter token '{}'", token);
                    continue;
                };
                let index = &captures[1];
                for range in range_regex().captures_iter(&captures[2]) {
                    let (Ok(lower), Ok(upper), Ok(value)) =
                        (range[1].parse(), range[2].parse(), range[3].parse())
                    else {
                        warn!("interval out of range in filter token '{}'", token);
                        continue;
                    };
                    filter.insert_interval(index, Interval { lower, upper, value });
                }
            } else if token.bytes().all(|b| b.is_ascii_digit()) {
                filter.insert_index(token);
            } else {
                warn!("invalid index in filter token '{}'", token);
            }
        }
        // Intervals match in ascending lower-bound order.
        for intervals in filter.indices.values_mut() {
            intervals.sort_by_key(|iv| iv.lower);
        }
        filters.push(filter);
    }
    filters
}

/// Read a filter file; an unreadable file degrades to the empty filter
/// set so the trace is copied verbatim.
pub fn load_filters(path: &Path) -> Vec<Filter> {
    match fs::read_to_string(path) {
        Ok(text) => parse_filters(&text),
        Err(err) => {
            warn!(
                "unable to read filter file '{}': {}; continuing without filters",
                path.display(),
                err
            );
            Vec::new()
        }
    }
}
