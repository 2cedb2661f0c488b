// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Secret redaction and output-size limiting for shell/LLM step output (spec §4.2).
//!
//! Both pieces are written to work incrementally over a stream of byte chunks (shell
//! stdout/stderr arrives piecemeal) rather than requiring the whole output to be
//! buffered up front.

const REDACTED_TOKEN: &str = "***REDACTED***";
const SHORT_SECRET_THRESHOLD: usize = 6;
const TRUNCATION_MARKER: &str = "\n...[output truncated]";
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Replaces every occurrence of a configured secret value with [`REDACTED_TOKEN`].
///
/// Secrets shorter than [`SHORT_SECRET_THRESHOLD`] characters are only redacted at a
/// word boundary, so that e.g. a one-character secret `"a"` doesn't blank out every
/// `a` in unrelated output.
#[derive(Debug, Clone)]
pub struct Redactor {
    needles: Vec<String>,
    max_needle_len: usize,
}

impl Redactor {
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        let mut needles: Vec<String> = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        needles.sort_by_key(|b| std::cmp::Reverse(b.len()));
        needles.dedup();
        let max_needle_len = needles.iter().map(|s| s.len()).max().unwrap_or(0);
        Self {
            needles,
            max_needle_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    pub fn max_needle_len(&self) -> usize {
        self.max_needle_len
    }

    /// Redacts a complete, self-contained string.
    pub fn redact(&self, text: &str) -> String {
        self.redact_partial(text).0
    }

    /// Redacts as much of `text` as can be safely decided right now, returning the
    /// redacted prefix together with the byte offset of the first unconsumed char.
    ///
    /// The unconsumed suffix (if any) is a genuine partial prefix of some needle --
    /// holding it back rather than emitting it raw is what lets [`RedactionBuffer`]
    /// catch a secret whose bytes straddle two `push` calls.
    fn redact_partial(&self, text: &str) -> (String, usize) {
        if self.needles.is_empty() {
            return (text.to_string(), text.len());
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        let mut consumed = 0;
        'outer: while !rest.is_empty() {
            for needle in &self.needles {
                if needle.len() <= rest.len() {
                    if &rest[..needle.len()] == needle.as_str() {
                        let short = needle.chars().count() < SHORT_SECRET_THRESHOLD;
                        let boundary_ok = !short || {
                            let before_ok = out
                                .chars()
                                .last()
                                .map(|c| !c.is_alphanumeric() && c != '_')
                                .unwrap_or(true);
                            let after_ok = rest[needle.len()..]
                                .chars()
                                .next()
                                .map(|c| !c.is_alphanumeric() && c != '_')
                                .unwrap_or(true);
                            before_ok && after_ok
                        };
                        if boundary_ok {
                            out.push_str(REDACTED_TOKEN);
                            rest = &rest[needle.len()..];
                            consumed += needle.len();
                            continue 'outer;
                        }
                    }
                } else if needle.starts_with(rest) {
                    // `rest` can't fully match here yet, but it's a true prefix of a
                    // longer needle -- more bytes next push could complete it.
                    return (out, consumed);
                }
            }
            // Advance by one full char, never splitting a multi-byte UTF-8 sequence.
            let ch_len = rest.chars().next().map(char::len_utf8).unwrap_or(1);
            out.push_str(&rest[..ch_len]);
            rest = &rest[ch_len..];
            consumed += ch_len;
        }
        (out, consumed)
    }
}

/// Incremental redaction over a byte stream.
///
/// Each push redacts the *entire* buffered text except for a trailing suffix that is
/// a genuine partial prefix of some needle -- that suffix is held back so a secret
/// split across two `push` calls still gets caught once its tail arrives, instead of
/// a blind `max_needle_len`-sized hold-back that can let a complete-but-straddling
/// secret slip through unredacted.
pub struct RedactionBuffer {
    redactor: Redactor,
    pending: Vec<u8>,
}

impl RedactionBuffer {
    pub fn new(redactor: Redactor) -> Self {
        Self {
            redactor,
            pending: Vec::new(),
        }
    }

    /// Feeds a new chunk, returning the portion now safe to emit downstream.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        // Don't decode a trailing byte sequence that might still be an incomplete
        // UTF-8 character; wait for the rest of it before running redaction over it.
        let safe_len = char_boundary_at_or_before(&self.pending, self.pending.len());
        let (safe, straggler) = self.pending.split_at(safe_len);
        let text = String::from_utf8_lossy(safe).into_owned();
        let straggler = straggler.to_vec();
        let (redacted, consumed) = self.redactor.redact_partial(&text);
        let mut next_pending = text.as_bytes()[consumed..].to_vec();
        next_pending.extend_from_slice(&straggler);
        self.pending = next_pending;
        redacted
    }

    /// Flushes whatever remains (end of stream).
    pub fn finish(self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.redactor.redact(&text)
    }
}

fn char_boundary_at_or_before(bytes: &[u8], idx: usize) -> usize {
    let mut i = idx.min(bytes.len());
    while i > 0 && (bytes[i] & 0b1100_0000) == 0b1000_0000 {
        i -= 1;
    }
    i
}

/// Caps total output at a byte budget, appending a one-time truncation marker
/// (spec §4.7: shell steps default to a 1 MiB output cap).
pub struct OutputLimiter {
    max_bytes: usize,
    written: usize,
    truncated: bool,
}

impl OutputLimiter {
    pub fn new(max_bytes: Option<usize>) -> Self {
        Self {
            max_bytes: max_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES),
            written: 0,
            truncated: false,
        }
    }

    /// Returns the portion of `chunk` that fits under the cap, or `None` once the
    /// cap has already been reached and the marker has been emitted.
    pub fn feed(&mut self, chunk: &str) -> Option<String> {
        if self.truncated {
            return None;
        }
        let remaining = self.max_bytes.saturating_sub(self.written);
        if chunk.len() <= remaining {
            self.written += chunk.len();
            return Some(chunk.to_string());
        }
        let cut = char_boundary_at_or_before(chunk.as_bytes(), remaining);
        self.written += cut;
        self.truncated = true;
        let mut out = chunk[..cut].to_string();
        out.push_str(TRUNCATION_MARKER);
        Some(out)
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_known_secret() {
        let r = Redactor::new(["sk-super-secret-token".to_string()]);
        let out = r.redact("the key is sk-super-secret-token, keep it safe");
        assert_eq!(out, "the key is ***REDACTED***, keep it safe");
    }

    #[test]
    fn short_secret_only_redacted_at_word_boundary() {
        let r = Redactor::new(["pw".to_string()]);
        assert_eq!(r.redact("pwned"), "pwned");
        assert_eq!(r.redact("the pw is set"), "the ***REDACTED*** is set");
    }

    #[test]
    fn redaction_buffer_catches_secret_split_across_chunks() {
        let r = Redactor::new(["topsecretvalue".to_string()]);
        let mut buf = RedactionBuffer::new(r);
        let mut out = String::new();
        out.push_str(&buf.push(b"prefix tops"));
        out.push_str(&buf.push(b"ecretvalue suffix"));
        out.push_str(&buf.finish());
        assert!(out.contains("***REDACTED***"));
        assert!(!out.contains("topsecretvalue"));
    }

    #[test]
    fn output_limiter_truncates_once() {
        let mut lim = OutputLimiter::new(Some(10));
        let a = lim.feed("0123456789extra").unwrap();
        assert!(a.ends_with(TRUNCATION_MARKER));
        assert!(lim.truncated());
        assert!(lim.feed("more").is_none());
    }

    #[test]
    fn output_limiter_passes_through_under_cap() {
        let mut lim = OutputLimiter::new(Some(1024));
        assert_eq!(lim.feed("hello").unwrap(), "hello");
        assert!(!lim.truncated());
    }
}
