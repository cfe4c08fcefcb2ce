//! Stream framing helpers
//!
//! Link workers accumulate received bytes in a buffer; these helpers pull
//! complete frames off the front of it and leave partial input in place.

use bytes::{BufMut, Bytes, BytesMut};

/// Line delimiter for text protocols
pub const LF: u8 = b'\n';

/// Header terminator for HTTP-style messages
pub const CRLF_CRLF: &[u8] = b"\r\n\r\n";

/// Append `fields` joined by commas plus a line feed
pub fn encode_line<I, S>(buf: &mut BytesMut, fields: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut first = true;
    for field in fields {
        if !first {
            buf.put_u8(b',');
        }
        buf.put_slice(field.as_ref().as_bytes());
        first = false;
    }
    buf.put_u8(LF);
}

/// Take one line off the front of `buf`, without its terminator.
///
/// A trailing carriage return is stripped too. Returns `None` when no
/// complete line is buffered.
pub fn take_line(buf: &mut BytesMut) -> Option<Bytes> {
    let pos = buf.iter().position(|&b| b == LF)?;
    let mut line = buf.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(pos - 1);
    }
    Some(line.freeze())
}

/// Take `len` bytes off the front of `buf` if that many are buffered
pub fn take_exact(buf: &mut BytesMut, len: usize) -> Option<Bytes> {
    if buf.len() < len {
        return None;
    }
    Some(buf.split_to(len).freeze())
}

/// Discard bytes before the first `marker`, returning how many were dropped
pub fn sync_to(buf: &mut BytesMut, marker: u8) -> usize {
    match buf.iter().position(|&b| b == marker) {
        Some(pos) => {
            let _ = buf.split_to(pos);
            pos
        }
        None => {
            let n = buf.len();
            buf.clear();
            n
        }
    }
}

/// Find the first occurrence of `needle` in `haystack`
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
