//! The *simple* and *relaxed* canonicalization algorithms (RFC 6376, §3.4).

use bstr::ByteSlice;
use std::mem;

const CRLF: &[u8] = b"\r\n";

/// A canonicalization algorithm name, as used in the `c=` tag.
///
/// Header and body canonicalization are chosen independently; an absent
/// choice means [`Simple`][Canonicalization::Simple].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Canonicalization {
    #[default]
    Simple,
    Relaxed,
}

impl Canonicalization {
    /// The name of this algorithm as it appears in `c=` tags.
    pub fn canonical_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Relaxed => "relaxed",
        }
    }

    pub(crate) fn from_tag(s: &str) -> Option<Self> {
        match s {
            "simple" => Some(Self::Simple),
            "relaxed" => Some(Self::Relaxed),
            _ => None,
        }
    }
}

/// Canonicalizes one complete header field, given as its raw bytes including
/// any folded continuation lines and the terminating CRLF.
pub fn canonicalize_header(algorithm: Canonicalization, field: &[u8]) -> Vec<u8> {
    match algorithm {
        Canonicalization::Simple => field.to_vec(),
        Canonicalization::Relaxed => canonicalize_header_relaxed(field),
    }
}

fn canonicalize_header_relaxed(field: &[u8]) -> Vec<u8> {
    fn is_ws(b: u8) -> bool {
        matches!(b, b' ' | b'\t' | b'\r' | b'\n')
    }

    let (name, value) = match field.iter().position(|&b| b == b':') {
        Some(i) => (&field[..i], &field[i + 1..]),
        None => (field, &field[field.len()..]),
    };

    let mut result = Vec::with_capacity(field.len());

    for &b in name.trim_with(char::is_whitespace) {
        result.push(b.to_ascii_lowercase());
    }
    result.push(b':');

    // compress WSP runs, including folds, to a single SP, then trim
    let mut collapsed = Vec::with_capacity(value.len());
    let mut compressing = false;
    for &b in value {
        if is_ws(b) {
            if !compressing {
                collapsed.push(b' ');
                compressing = true;
            }
        } else {
            collapsed.push(b);
            compressing = false;
        }
    }
    result.extend_from_slice(collapsed.trim_with(|c| c == ' '));

    result.extend_from_slice(CRLF);
    result
}

// Promote any LF without a preceding CR to CRLF.
fn fix_crlf(b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(b.len());
    for (i, &byte) in b.iter().enumerate() {
        if byte == b'\n' && (i == 0 || b[i - 1] != b'\r') {
            res.push(b'\r');
        }
        res.push(byte);
    }
    res
}

/// A streaming body canonicalizer.
///
/// Body bytes are passed through [`canon_chunk`][Self::canon_chunk] in
/// arbitrary chunks; each call returns the canonical bytes that are certain
/// to be kept, buffering a small tail (pending CR, trailing CRLF runs,
/// pending whitespace) until later input decides their fate.
/// [`finish`][Self::finish] returns the final bytes.
pub struct BodyCanonicalizer {
    algorithm: Canonicalization,
    crlf_buf: Vec<u8>,
    wsp_pending: bool,
    written: bool,
}

impl BodyCanonicalizer {
    pub fn new(algorithm: Canonicalization) -> Self {
        Self {
            algorithm,
            crlf_buf: Vec::new(),
            wsp_pending: false,
            written: false,
        }
    }

    pub fn simple() -> Self {
        Self::new(Canonicalization::Simple)
    }

    pub fn relaxed() -> Self {
        Self::new(Canonicalization::Relaxed)
    }

    pub fn canon_chunk(&mut self, chunk: &[u8]) -> Vec<u8> {
        match self.algorithm {
            Canonicalization::Simple => self.canon_chunk_simple(chunk),
            Canonicalization::Relaxed => self.canon_chunk_relaxed(chunk),
        }
    }

    fn canon_chunk_simple(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut b = mem::take(&mut self.crlf_buf);
        b.extend_from_slice(chunk);
        let mut b = fix_crlf(&b);

        let mut end = b.len();
        // a trailing CR may be completed to CRLF by the next chunk
        if end > 0 && b[end - 1] == b'\r' {
            end -= 1;
        }
        // hold back trailing CRLF runs until more content arrives
        while end >= 2 && b[end - 2] == b'\r' && b[end - 1] == b'\n' {
            end -= 2;
        }

        self.crlf_buf = b.split_off(end);
        b
    }

    fn canon_chunk_relaxed(&mut self, chunk: &[u8]) -> Vec<u8> {
        let b = fix_crlf(chunk);

        let mut canonical = Vec::with_capacity(b.len());
        for &ch in &b {
            if ch == b' ' || ch == b'\t' {
                self.wsp_pending = true;
            } else if ch == b'\r' || ch == b'\n' {
                // WSP before a line break is dropped
                self.wsp_pending = false;
                self.crlf_buf.push(ch);
            } else {
                if !self.crlf_buf.is_empty() {
                    canonical.append(&mut self.crlf_buf);
                }
                if self.wsp_pending {
                    canonical.push(b' ');
                    self.wsp_pending = false;
                }
                canonical.push(ch);
            }
        }

        if !self.written && !canonical.is_empty() {
            self.written = true;
        }
        canonical
    }

    pub fn finish(self) -> Vec<u8> {
        match self.algorithm {
            Canonicalization::Simple => {
                let mut result = Vec::new();
                // a bare CR at the end of input is kept literally
                if self.crlf_buf.last() == Some(&b'\r') {
                    result.extend_from_slice(&self.crlf_buf);
                }
                result.extend_from_slice(CRLF);
                result
            }
            Canonicalization::Relaxed => {
                if self.written {
                    CRLF.to_vec()
                } else {
                    Vec::new()
                }
            }
        }
    }
}
