//! Message header reading, writing, and signed-field selection.

use crate::Error;
use bstr::ByteSlice;
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// An ordered list of complete header fields, each holding the raw bytes of
/// the field including any folded continuation lines and the terminating
/// CRLF. Order is preserved and duplicate names are allowed.
pub(crate) type Header = Vec<Vec<u8>>;

/// Reads the header section of a message, leaving the reader positioned at
/// the first body byte.
///
/// Continuation lines (starting with SP or HTAB) are appended to the
/// preceding field together with their CRLF. Lone LF line endings are
/// accepted and stored as CRLF. Reaching EOF before the blank separator line
/// is an error.
pub(crate) async fn read_header<R>(reader: &mut R) -> Result<Header, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = Header::new();

    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(Error::IncompleteHeader);
        }

        if line.ends_with(b"\n") {
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
        }

        if line.is_empty() {
            break;
        }

        if !header.is_empty() && (line[0] == b' ' || line[0] == b'\t') {
            let previous = header.last_mut().unwrap();
            previous.extend_from_slice(&line);
            previous.extend_from_slice(b"\r\n");
        } else {
            line.extend_from_slice(b"\r\n");
            header.push(line);
        }
    }

    Ok(header)
}

/// Writes a header block back out verbatim, followed by the blank separator
/// line.
pub(crate) async fn write_header<W>(writer: &mut W, header: &Header) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for field in header {
        writer.write_all(field).await?;
    }
    writer.write_all(b"\r\n").await
}

/// Splits a raw header field into its name and value, both trimmed of
/// surrounding whitespace.
pub(crate) fn parse_header_field(field: &[u8]) -> (&[u8], &[u8]) {
    fn trim(b: &[u8]) -> &[u8] {
        b.trim_with(char::is_whitespace)
    }

    match field.iter().position(|&b| b == b':') {
        Some(i) => (trim(&field[..i]), trim(&field[i + 1..])),
        None => (trim(field), &[]),
    }
}

/// Selects occurrences of signed header fields, consuming multiple
/// occurrences of one name from the bottom of the header upward
/// (RFC 6376, §5.4.2).
pub(crate) struct HeaderPicker<'a> {
    header: &'a Header,
    picked: HashMap<String, usize>,
}

impl<'a> HeaderPicker<'a> {
    pub fn new(header: &'a Header) -> Self {
        Self {
            header,
            picked: HashMap::new(),
        }
    }

    /// Returns the next unconsumed occurrence of `key`, or `None` when all
    /// occurrences are used up; a signed field that does not exist
    /// contributes nothing to the hash.
    pub fn pick(&mut self, key: &str) -> Option<&'a [u8]> {
        let key = key.to_ascii_lowercase();

        let mut at = self.picked.get(&key).copied().unwrap_or(0);
        for field in self.header.iter().rev() {
            let (name, _) = parse_header_field(field);
            if !name.eq_ignore_ascii_case(key.as_bytes()) {
                continue;
            }

            if at == 0 {
                *self.picked.entry(key).or_insert(0) += 1;
                return Some(field);
            }
            at -= 1;
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn read(s: &str) -> Result<Header, Error> {
        read_header(&mut BufReader::new(s.as_bytes())).await
    }

    #[tokio::test]
    async fn read_header_ok() {
        let header = read("From: <mistuha@kiminonawa.moe>\r\nSubject: Your Name\r\n\r\nbody")
            .await
            .unwrap();

        assert_eq!(
            header,
            vec![
                b"From: <mistuha@kiminonawa.moe>\r\n".to_vec(),
                b"Subject: Your Name\r\n".to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn read_header_continuation_lines() {
        let header = read("Subject: Kimi\r\n No Na\r\n\tWa\r\nTo: you\r\n\r\n")
            .await
            .unwrap();

        assert_eq!(
            header,
            vec![
                b"Subject: Kimi\r\n No Na\r\n\tWa\r\n".to_vec(),
                b"To: you\r\n".to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn read_header_lf_endings() {
        let header = read("From: a\nTo: b\n\n").await.unwrap();

        assert_eq!(header, vec![b"From: a\r\n".to_vec(), b"To: b\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn read_header_incomplete() {
        assert!(matches!(
            read("From: <mistuha@kiminonawa.moe>\r\nTo").await,
            Err(Error::IncompleteHeader)
        ));
    }

    #[test]
    fn parse_header_field_ok() {
        let (name, value) = parse_header_field(b"Subject : Your Name \r\n");

        assert_eq!(name, b"Subject");
        assert_eq!(value, b"Your Name");
    }

    #[test]
    fn picker_distinct_names() {
        let header = vec![b"from: fst\r\n".to_vec(), b"To: snd\r\n".to_vec()];

        let mut picker = HeaderPicker::new(&header);

        assert_eq!(picker.pick("From"), Some(&header[0][..]));
        assert_eq!(picker.pick("to"), Some(&header[1][..]));
        assert_eq!(picker.pick("subject"), None);
    }

    #[test]
    fn picker_consumes_bottom_to_top() {
        let header = vec![
            b"To: trd\r\n".to_vec(),
            b"To: snd\r\n".to_vec(),
            b"To: fst\r\n".to_vec(),
        ];

        let mut picker = HeaderPicker::new(&header);

        assert_eq!(picker.pick("to"), Some(&header[2][..]));
        assert_eq!(picker.pick("to"), Some(&header[1][..]));
        assert_eq!(picker.pick("to"), Some(&header[0][..]));
        assert_eq!(picker.pick("to"), None);
    }
}
