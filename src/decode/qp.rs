//! Streaming quoted-printable decoding (RFC 2045 §6.7).
//!
//! Works one line at a time: trailing whitespace is dropped, a final `=`
//! joins the line with the next (soft line break), and `=XX` becomes the byte
//! `0xXX`. Hard line breaks are kept as they appear in the input.
//!
//! Input is consumed at most [`MAX_CHUNK`] bytes at a time, so a payload with
//! overlong or missing line breaks never gets buffered whole. When a chunk
//! ends mid-line, only a trailing partial escape and trailing whitespace are
//! carried over to the next chunk.

use std::io::{self, BufRead, BufReader, Read};

/// Largest slice of one input line decoded in a single step.
pub const MAX_CHUNK: usize = 8 * 1024;

/// Decodes a quoted-printable stream.
pub struct QuotedPrintableDecoder<R: Read> {
    inner: BufReader<R>,
    /// Undecoded input: the carried tail of the current line plus new bytes.
    line: Vec<u8>,
    decoded: Vec<u8>,
    pos: usize,
    line_no: usize,
    /// Column within the current line where `line[0]` sits.
    column: usize,
}

impl<R: Read> QuotedPrintableDecoder<R> {
    pub fn new(raw: R) -> Self {
        Self {
            inner: BufReader::new(raw),
            line: Vec::with_capacity(128),
            decoded: Vec::with_capacity(128),
            pos: 0,
            line_no: 0,
            column: 0,
        }
    }

    /// Decode the next chunk of input into `self.decoded`. Returns `false` at EOF.
    fn fill(&mut self) -> io::Result<bool> {
        self.decoded.clear();
        self.pos = 0;
        let carried = self.line.len();
        let read = (&mut self.inner)
            .take(MAX_CHUNK as u64)
            .read_until(b'\n', &mut self.line)?;
        if read == 0 && carried == 0 {
            return Ok(false);
        }

        // Short of the limit without a newline means the input ended.
        let complete = self.line.ends_with(b"\n") || read < MAX_CHUNK;
        let result = if complete {
            decode_line(&self.line, &mut self.decoded).map(|()| self.line.len())
        } else {
            let cut = partial_cut(&self.line);
            decode_escapes(&self.line[..cut], &mut self.decoded).map(|()| cut)
        };
        let consumed = result.map_err(|col| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "invalid quoted-printable escape at line {}, column {}",
                    self.line_no + 1,
                    self.column + col + 1
                ),
            )
        })?;

        if complete {
            self.line.clear();
            self.line_no += 1;
            self.column = 0;
        } else {
            self.line.drain(..consumed);
            self.column += consumed;
        }
        Ok(true)
    }
}

impl<R: Read> Read for QuotedPrintableDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Soft-broken lines can decode to nothing; keep going until bytes or EOF.
        while self.pos >= self.decoded.len() {
            if !self.fill()? {
                return Ok(0);
            }
        }
        let available = &self.decoded[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// How much of an unfinished line can be decoded now.
///
/// Trailing whitespace may turn out to be padding before the line break, and
/// a trailing `=` or `=X` may be an escape or soft break split by the chunk
/// boundary. Both wait for more input.
fn partial_cut(chunk: &[u8]) -> usize {
    let content_end = chunk
        .iter()
        .rposition(|b| !matches!(b, b' ' | b'\t'))
        .map(|p| p + 1)
        .unwrap_or(0);
    // A run this long is not line padding; decode it as content.
    if chunk.len() - content_end > MAX_CHUNK {
        return chunk.len();
    }
    match &chunk[..content_end] {
        [.., b'='] => content_end - 1,
        [.., b'=', _] => content_end - 2,
        _ => content_end,
    }
}

/// Decode one raw line (including its terminator, if any) into `out`.
///
/// On a bad escape returns the column of the offending `=`.
fn decode_line(line: &[u8], out: &mut Vec<u8>) -> Result<(), usize> {
    let (body, ending): (&[u8], &[u8]) = if line.ends_with(b"\r\n") {
        (&line[..line.len() - 2], b"\r\n")
    } else if line.ends_with(b"\n") {
        (&line[..line.len() - 1], b"\n")
    } else {
        (line, b"")
    };

    // Transport may pad lines with whitespace; it is never content.
    let trimmed_len = body
        .iter()
        .rposition(|b| !matches!(b, b' ' | b'\t'))
        .map(|p| p + 1)
        .unwrap_or(0);
    let body = &body[..trimmed_len];

    let (body, soft_break) = match body.split_last() {
        Some((b'=', rest)) => (rest, true),
        _ => (body, false),
    };

    decode_escapes(body, out)?;
    if !soft_break {
        out.extend_from_slice(ending);
    }
    Ok(())
}

/// Decode `=XX` escapes in a slice that holds no line break or soft break.
fn decode_escapes(body: &[u8], out: &mut Vec<u8>) -> Result<(), usize> {
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            b'=' => {
                let hi = body.get(i + 1).and_then(|&c| hex_val(c));
                let lo = body.get(i + 2).and_then(|&c| hex_val(c));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                    }
                    _ => return Err(i),
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(())
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}
