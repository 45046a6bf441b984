//! yEnc encoding and decoding
//!
//! yEnc carries opaque bytes through 8-bit-clean NNTP: each byte is offset
//! by 42 mod 256; the few values that would collide with protocol framing
//! (NUL, CR, LF, `=`) are escaped as `=` followed by the value offset by a
//! further 64. Lines are wrapped at a fixed length, CRLF terminated.

use crate::error::{Error, Result};

/// Fixed line length used for outgoing articles
pub const LINE_LENGTH: usize = 128;

/// Body encoder seam for the article codec
pub trait Encoder: Send + Sync {
    /// Encode raw segment bytes into yEnc body lines
    fn encode(&self, data: &[u8]) -> Vec<u8>;
}

/// yEnc encoder producing CRLF-terminated lines of a fixed length
#[derive(Debug, Clone)]
pub struct YencEncoder {
    line_length: usize,
}

impl Default for YencEncoder {
    fn default() -> Self {
        Self {
            line_length: LINE_LENGTH,
        }
    }
}

impl YencEncoder {
    /// Encoder with a non-default line length (tests only use this)
    pub fn with_line_length(line_length: usize) -> Self {
        Self { line_length }
    }
}

impl Encoder for YencEncoder {
    fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + data.len() / self.line_length * 2 + 16);
        let mut col = 0usize;

        for &byte in data {
            let value = byte.wrapping_add(42);
            let escape = matches!(value, 0x00 | 0x0a | 0x0d | b'=')
                || (col == 0 && matches!(value, b'.' | b'\t' | b' '));

            if escape {
                out.push(b'=');
                out.push(value.wrapping_add(64));
                col += 2;
            } else {
                out.push(value);
                col += 1;
            }

            if col >= self.line_length {
                out.extend_from_slice(b"\r\n");
                col = 0;
            }
        }

        // The final partial line is left unterminated; the article footer
        // supplies the trailing CRLF.
        out
    }
}

/// Decode a yEnc article body into raw segment bytes.
///
/// Framing lines (`=ybegin`, `=ypart`, `=yend`) are skipped; escape
/// sequences and line breaks are undone. Used by the connection pool so
/// `fetch_body` yields the plaintext bytes the repair pipeline writes to
/// disk.
pub fn decode(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut escaped = false;

    for line in body.split(|&b| b == b'\n') {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        if line.starts_with(b"=ybegin") || line.starts_with(b"=ypart") || line.starts_with(b"=yend")
        {
            continue;
        }

        for &byte in line {
            if escaped {
                out.push(byte.wrapping_sub(64).wrapping_sub(42));
                escaped = false;
            } else if byte == b'=' {
                escaped = true;
            } else {
                out.push(byte.wrapping_sub(42));
            }
        }
        if escaped {
            return Err(Error::Other(
                "yEnc escape sequence truncated at end of line".to_string(),
            ));
        }
    }

    Ok(out)
}
