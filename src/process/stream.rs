//! Line-buffered, encoding-tolerant relay of a child's stdout/stderr onto our own logs.
//!
//! Bytes are decoded as UTF-8 incrementally: a sequence split across two reads is held back
//! until the next read completes it, while a sequence that is simply invalid is replaced with
//! the Unicode replacement character, matching `String::from_utf8_lossy` but without ever
//! discarding a valid multi-byte tail that arrived early.

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::info;

/// Which pipe a relayed line came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn label(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Reads `reader` to EOF, decoding incrementally and flushing one log line per `\n` or `\r`,
/// plus a final flush of any trailing partial line once the stream ends.
pub async fn relay_lines<R>(supervisor: &str, stream: Stream, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut pending_bytes: Vec<u8> = Vec::new();
    let mut line = String::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        pending_bytes.extend_from_slice(&buf[..n]);
        let consumed = decode_into(&pending_bytes, &mut line, &mut |l| {
            info!(supervisor, stream = stream.label(), "{}", l);
        });
        pending_bytes.drain(..consumed);
    }

    if !pending_bytes.is_empty() {
        // EOF with an incomplete tail: decode what we can, replacing the rest.
        let lossy = String::from_utf8_lossy(&pending_bytes);
        line.push_str(&lossy);
    }
    if !line.is_empty() {
        info!(supervisor, stream = stream.label(), "{}", line);
    }
}

/// Decodes as much of `bytes` as is unambiguous, appending completed lines to `on_line` and
/// leftover characters to `line`. Returns the number of bytes consumed from `bytes` (the
/// remainder is an incomplete multi-byte sequence and must be retried after the next read).
fn decode_into(bytes: &[u8], line: &mut String, on_line: &mut impl FnMut(&str)) -> usize {
    let mut consumed = 0;
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                push_and_split(line, s, on_line);
                consumed += rest.len();
                break;
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                let (valid, after) = rest.split_at(valid_up_to);
                // SAFETY: `valid_up_to` bytes are guaranteed valid UTF-8 by `from_utf8`.
                push_and_split(line, std::str::from_utf8(valid).unwrap(), on_line);
                consumed += valid_up_to;

                match err.error_len() {
                    Some(bad_len) => {
                        // A genuinely invalid sequence: replace it and keep scanning.
                        line.push('\u{FFFD}');
                        consumed += bad_len;
                        rest = &after[bad_len..];
                    }
                    None => {
                        // Incomplete sequence at the end of what we have so far; wait for more bytes.
                        break;
                    }
                }
            }
        }
    }
    consumed
}

fn push_and_split(line: &mut String, s: &str, on_line: &mut impl FnMut(&str)) {
    for ch in s.chars() {
        if ch == '\n' || ch == '\r' {
            on_line(line);
            line.clear();
        } else {
            line.push(ch);
        }
    }
}
