use log::{debug, trace};
use serde::{Deserialize, Serialize};

/// Default ceiling (exclusive) for the longest `var` name of a minified file.
pub const DEFAULT_MAX_NAME_LEN: usize = 4;
/// Default ceiling (exclusive) for the average `var` name length of a minified file.
pub const DEFAULT_AVG_NAME_LEN: f64 = 3.0;

/// Characters after which a `/` opens a regular expression literal rather than a division.
const REGEX_PRECEDERS: &[u8] = b"=([,:";

/// Result of [`classify`]: a best-effort guess, not a certification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Minified {
    Yes,
    No,
    /// No `var` declarations were found to sample.
    Unknown,
}

impl Minified {
    pub fn is_yes(self) -> bool {
        self == Minified::Yes
    }
}

/// Name-length limits used by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub max_name_len: usize,
    pub avg_name_len: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_name_len: DEFAULT_MAX_NAME_LEN,
            avg_name_len: DEFAULT_AVG_NAME_LEN,
        }
    }
}

impl Thresholds {
    pub fn classify(&self, stats: &VarStatistics) -> Minified {
        if stats.count == 0 {
            return Minified::Unknown;
        }
        if stats.max < self.max_name_len && stats.average() < self.avg_name_len {
            Minified::Yes
        } else {
            Minified::No
        }
    }
}

/// Identifier statistics gathered from the `var` statements of a source file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarStatistics {
    pub count: usize,
    pub total_length: usize,
    pub max: usize,
    /// Declared names in source order.
    pub names: Vec<String>,
}

impl VarStatistics {
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_length as f64 / self.count as f64
        }
    }

    fn record(&mut self, name: &[u8]) {
        self.count += 1;
        self.total_length += name.len();
        self.max = self.max.max(name.len());
        self.names.push(String::from_utf8_lossy(name).into_owned());
    }
}

/// Guess whether `source` is already minified using the default thresholds.
pub fn classify(source: &str) -> Minified {
    classify_with(source, &Thresholds::default())
}

/// Guess whether `source` is already minified.
///
/// Only the names declared by `var` statements are sampled. Comments, strings
/// and regular expression literals are stripped first so their contents are
/// never mistaken for declarations.
pub fn classify_with(source: &str, thresholds: &Thresholds) -> Minified {
    let stats = var_statistics(source);
    let verdict = thresholds.classify(&stats);
    debug!(
        "classified {} bytes: {:?} (count={}, max={}, avg={:.2})",
        source.len(),
        verdict,
        stats.count,
        stats.max,
        stats.average()
    );
    verdict
}

/// Collect statistics for every `var` statement reachable at the top level of
/// the sanitized source.
///
/// A `var` nested inside the initializer of another `var` is skipped together
/// with that initializer.
pub fn var_statistics(source: &str) -> VarStatistics {
    let sanitized = sanitize(source);
    let buf = sanitized.as_bytes();
    let mut stats = VarStatistics::default();
    let mut offset = 0;
    while let Some(pos) = find_var_keyword(buf, offset) {
        offset = parse_var_statement(buf, pos + 4, &mut stats);
    }
    stats
}

/// Remove comments and empty every string and regular expression literal.
///
/// Strings keep their delimiters (`"abc"` → `""`) and regular expressions
/// collapse to `//`, so the shape of the surrounding code is preserved.
/// Unterminated literals and comments consume the rest of the buffer.
pub fn sanitize(source: &str) -> String {
    let buf = source.as_bytes();
    let len = buf.len();
    let mut out: Vec<u8> = Vec::with_capacity(len);
    let mut i = 0;
    let mut j = 0;
    while i < len {
        let c = buf[i];
        let next = buf.get(i + 1).copied();
        if c == b'/' && next == Some(b'/') {
            out.extend_from_slice(&buf[j..i]);
            // Keep the newline so adjacent lines do not fuse into one token.
            i = find_from(buf, i + 2, b"\n").unwrap_or(len);
            j = i;
        } else if c == b'/' && next == Some(b'*') {
            out.extend_from_slice(&buf[j..i]);
            i = find_from(buf, i + 2, b"*/").map_or(len, |p| p + 2);
            j = i;
        } else if matches!(c, b'\'' | b'"' | b'`') {
            out.extend_from_slice(&buf[j..i]);
            out.push(c);
            out.push(c);
            i = skip_literal(buf, i + 1, c);
            j = i;
        } else if c == b'/' && opens_regex(buf, i) {
            out.extend_from_slice(&buf[j..i]);
            out.extend_from_slice(b"//");
            i = skip_literal(buf, i + 1, b'/');
            j = i;
        } else {
            i += 1;
        }
    }
    if j < len {
        out.extend_from_slice(&buf[j..]);
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Find the next `var` keyword at or after `from` that is a whole word
/// followed by whitespace.
fn find_var_keyword(buf: &[u8], from: usize) -> Option<usize> {
    let mut from = from;
    while let Some(pos) = find_from(buf, from, b"var") {
        let word_start = pos == 0 || !is_ident_byte(buf[pos - 1]);
        let followed_by_space = buf.get(pos + 3).is_some_and(|b| b.is_ascii_whitespace());
        if word_start && followed_by_space {
            return Some(pos);
        }
        from = pos + 3;
    }
    None
}

/// Parse the declarator list `name [= expr] (, name [= expr])* ;`.
///
/// Returns the offset just past the statement. A statement that ends without
/// `;` (automatic semicolon insertion, `for (var k in o)`) stops at the first
/// token that is neither `,` nor `;`.
fn parse_var_statement(buf: &[u8], offset: usize, stats: &mut VarStatistics) -> usize {
    let len = buf.len();
    let mut offset = offset;
    while offset < len {
        offset = skip_spaces(buf, offset);
        let Some(end) = parse_name(buf, offset) else {
            trace!("var statement without a plain name at {offset}");
            return offset;
        };
        stats.record(&buf[offset..end]);
        offset = skip_spaces(buf, end);
        if buf.get(offset) == Some(&b'=') {
            offset = parse_expression(buf, offset + 1);
        }
        match buf.get(offset) {
            Some(b',') => offset += 1,
            Some(b';') => return offset + 1,
            Some(_) => return offset,
            None => {
                debug!("var statement runs to the end of the buffer");
                return len;
            }
        }
    }
    offset
}

/// Returns the end offset of the identifier starting at `offset`, if any.
fn parse_name(buf: &[u8], offset: usize) -> Option<usize> {
    let first = *buf.get(offset)?;
    if !(first.is_ascii_alphabetic() || first == b'$' || first == b'_') {
        return None;
    }
    let mut end = offset + 1;
    while end < buf.len() && is_ident_byte(buf[end]) {
        end += 1;
    }
    Some(end)
}

/// Skip an initializer expression, stopping at a top-level `,` or `;`, or at a
/// closer that belongs to an enclosing group.
fn parse_expression(buf: &[u8], offset: usize) -> usize {
    let len = buf.len();
    let mut offset = offset;
    while offset < len {
        match buf[offset] {
            b',' | b';' | b'}' | b')' | b']' => return offset,
            q @ (b'\'' | b'"' | b'`') => offset = skip_literal(buf, offset + 1, q),
            b'/' if opens_regex(buf, offset) => offset = skip_literal(buf, offset + 1, b'/'),
            open @ (b'{' | b'[' | b'(') => offset = parse_group(buf, offset + 1, open),
            _ => offset += 1,
        }
    }
    offset
}

/// Skip a bracketed group whose opener precedes `offset`, including every
/// group nested inside it. Returns the offset just past the matching closer.
fn parse_group(buf: &[u8], offset: usize, open: u8) -> usize {
    let len = buf.len();
    let mut closers = vec![closer_for(open)];
    let mut offset = offset;
    while offset < len {
        let c = buf[offset];
        if closers.last() == Some(&c) {
            closers.pop();
            offset += 1;
            if closers.is_empty() {
                return offset;
            }
            continue;
        }
        match c {
            q @ (b'\'' | b'"' | b'`') => offset = skip_literal(buf, offset + 1, q),
            b'/' if opens_regex(buf, offset) => offset = skip_literal(buf, offset + 1, b'/'),
            b'{' | b'[' | b'(' => {
                closers.push(closer_for(c));
                offset += 1;
            }
            _ => offset += 1,
        }
    }
    offset
}

/// Skip a string, template or regular expression literal whose opening
/// delimiter precedes `offset`. Returns the offset just past the closing
/// delimiter, or the buffer length when the literal is unterminated.
fn skip_literal(buf: &[u8], offset: usize, delim: u8) -> usize {
    let len = buf.len();
    let mut k = offset;
    while k < len {
        match buf[k] {
            b'\\' => k += 2,
            b'[' if delim == b'/' => {
                // A `/` inside a character class does not close the regex.
                k += 1;
                while k < len && buf[k] != b']' {
                    k += if buf[k] == b'\\' { 2 } else { 1 };
                }
                k += 1;
            }
            c if c == delim => return k + 1,
            _ => k += 1,
        }
    }
    len
}

/// A `/` opens a regex when the previous non-space byte is one of `= ( [ , :`.
fn opens_regex(buf: &[u8], pos: usize) -> bool {
    buf[..pos]
        .iter()
        .rev()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| REGEX_PRECEDERS.contains(b))
}

fn skip_spaces(buf: &[u8], offset: usize) -> usize {
    let mut offset = offset;
    while offset < buf.len() && buf[offset].is_ascii_whitespace() {
        offset += 1;
    }
    offset
}

fn closer_for(open: u8) -> u8 {
    match open {
        b'{' => b'}',
        b'[' => b']',
        _ => b')',
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn find_from(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
