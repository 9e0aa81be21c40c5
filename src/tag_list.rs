//! DKIM tag lists (RFC 6376, §3.2) and `DKIM-Signature` field formatting.

use std::collections::BTreeMap;

pub(crate) const SIGNATURE_FIELD_NAME: &str = "DKIM-Signature";

// Width of a header line of printable payload; a folded continuation takes
// 78 bytes including its CRLF and leading SP.
const LINE_WIDTH: isize = 75;

/// A parsed tag list. The map form loses the original tag order, which is
/// not significant in DKIM.
pub(crate) type TagMap = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct TagListSyntaxError;

/// Parses a `tag=value; tag=value` list.
///
/// Empty segments, including whitespace-only ones and a trailing `;`, are
/// skipped; a non-empty segment without `=` is a syntax error. Whitespace
/// around names and values is trimmed, whitespace inside values is kept.
/// The first occurrence of a duplicated tag wins.
pub(crate) fn parse_tag_map(s: &str) -> Result<TagMap, TagListSyntaxError> {
    let mut map = TagMap::new();

    for segment in s.split(';') {
        match segment.split_once('=') {
            Some((name, value)) => {
                let name = trim_ascii_ws(name);
                let value = trim_ascii_ws(value);
                map.entry(name.into()).or_insert_with(|| value.into());
            }
            None => {
                if !trim_ascii_ws(segment).is_empty() {
                    return Err(TagListSyntaxError);
                }
            }
        }
    }

    Ok(map)
}

fn trim_ascii_ws(s: &str) -> &str {
    s.trim_matches(|c| matches!(c, ' ' | '\t' | '\r' | '\n'))
}

/// Removes all whitespace from a tag value, undoing any folding.
pub(crate) fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Splits a colon-separated tag value, stripping whitespace from every
/// element.
pub(crate) fn parse_colon_separated(s: &str) -> Vec<String> {
    s.split(':').map(strip_whitespace).collect()
}

/// Formats a `DKIM-Signature` header field, folded to the 78-column
/// convention, without the terminating CRLF.
///
/// Tags are emitted in ascending order of value length, ties broken by name;
/// a `b` tag always comes last, on a continuation line of its own, so that
/// the verifier's stripping of its value cannot change the layout of the
/// other tags.
pub(crate) fn format_signature_field(params: &TagMap) -> String {
    let mut keys: Vec<&str> = params
        .keys()
        .map(String::as_str)
        .filter(|&k| k != "b")
        .collect();
    keys.sort_by(|a, b| {
        let (va, vb) = (&params[*a], &params[*b]);
        va.len().cmp(&vb.len()).then_with(|| a.cmp(b))
    });
    if params.contains_key("b") {
        keys.push("b");
    }

    let mut s = String::from(SIGNATURE_FIELD_NAME);
    s.push(':');

    let mut avail = LINE_WIDTH - SIGNATURE_FIELD_NAME.len() as isize - 2;

    for k in keys {
        let v = params[k].as_str();

        let chars = (k.len() + v.len() + 3) as isize; // SP k = v ;
        if avail < chars || k == "b" {
            s.push_str("\r\n");
            avail = LINE_WIDTH;
        }
        s.push(' ');

        avail -= chars;
        if avail < 0 {
            // Tag too long for a line of its own.
            if k == "h" {
                wrap_header_names(&mut s, v);
            } else {
                fold_long_tag(&mut s, k, v);
            }
        } else {
            s.push_str(k);
            s.push('=');
            s.push_str(v);
            s.push(';');
        }
    }

    s
}

// "Folding whitespace (FWS) MAY be included on either side of the colon
// separator." (§3.5) An oversized h= value is broken between header names
// only, never inside one.
fn wrap_header_names(s: &mut String, value: &str) {
    s.push_str("h=");

    let names: Vec<&str> = value.split(':').collect();
    let mut avail = LINE_WIDTH - " h=".len() as isize;

    for (i, name) in names.iter().enumerate() {
        let chars = name.len() as isize + 1;
        if avail < chars {
            avail = LINE_WIDTH;
            s.push_str("\r\n ");
        }
        avail -= chars;

        s.push_str(name);
        s.push(if i == names.len() - 1 { ';' } else { ':' });
    }
}

// Any other oversized tag is broken into fixed-width chunks. Tag values are
// printable ASCII, so byte boundaries are char boundaries.
fn fold_long_tag(s: &mut String, name: &str, value: &str) {
    let field = format!("{name}={value};");
    for (i, chunk) in field.as_bytes().chunks(LINE_WIDTH as usize).enumerate() {
        if i > 0 {
            s.push_str("\r\n ");
        }
        s.push_str(std::str::from_utf8(chunk).unwrap());
    }
}
