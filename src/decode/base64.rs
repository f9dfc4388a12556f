//! Streaming base64 decoding for MIME bodies.

use std::io::{self, Read};

use ::base64::alphabet;
use ::base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use ::base64::engine::DecodePaddingMode;
use ::base64::read::DecoderReader;

/// Standard alphabet, padding optional, lenient about trailing bits.
static MIME_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Decodes a base64 stream wrapped at arbitrary line lengths.
pub struct Base64Decoder<R: Read> {
    inner: DecoderReader<'static, GeneralPurpose, SkipWhitespace<R>>,
}

impl<R: Read> Base64Decoder<R> {
    pub fn new(raw: R) -> Self {
        Self {
            inner: DecoderReader::new(SkipWhitespace { inner: raw }, &MIME_ENGINE),
        }
    }
}

impl<R: Read> Read for Base64Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Drops CR, LF, space and tab so line-wrapped input looks contiguous.
struct SkipWhitespace<R> {
    inner: R,
}

impl<R: Read> Read for SkipWhitespace<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let n = self.inner.read(buf)?;
            if n == 0 {
                return Ok(0);
            }
            let mut kept = 0;
            for i in 0..n {
                let b = buf[i];
                if !matches!(b, b'\r' | b'\n' | b' ' | b'\t') {
                    buf[kept] = b;
                    kept += 1;
                }
            }
            // A read of pure whitespace must not look like EOF.
            if kept > 0 {
                return Ok(kept);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode(input: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        Base64Decoder::new(Cursor::new(input.to_vec())).read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_decode_simple() {
        assert_eq!(decode(b"SGVsbG8sIHdvcmxkIQ==").unwrap(), b"Hello, world!");
    }

    #[test]
    fn test_decode_line_wrapped() {
        let input = b"SGVsbG8s\r\nIHdvcmxk\r\nIQ==\r\n";
        assert_eq!(decode(input).unwrap(), b"Hello, world!");
    }

    #[test]
    fn test_decode_without_padding() {
        assert_eq!(decode(b"aGk").unwrap(), b"hi");
    }

    #[test]
    fn test_decode_whitespace_only() {
        assert_eq!(decode(b"\r\n\r\n").unwrap(), b"");
    }

    #[test]
    fn test_decode_invalid_byte_is_invalid_data() {
        let err = decode(b"SGVs*G8=").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_large_input_in_small_reads() {
        let plain: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let encoded =
            ::base64::Engine::encode(&::base64::engine::general_purpose::STANDARD, &plain);
        let wrapped: Vec<u8> = encoded
            .as_bytes()
            .chunks(76)
            .flat_map(|line| line.iter().copied().chain(*b"\r\n"))
            .collect();

        let mut decoder = Base64Decoder::new(Cursor::new(wrapped));
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = decoder.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, plain);
    }
}
