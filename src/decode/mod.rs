//! Streaming Content-Transfer-Encoding decoders.
//!
//! Both decoders wrap any `Read` and yield decoded bytes incrementally.
//! Malformed input surfaces as an `InvalidData` error at the point it is
//! reached; nothing is validated up front.

pub mod base64;
pub mod qp;

use std::io::Read;

use crate::reference::TransferEncoding;

/// Wrap `raw` with the decoder for `encoding`.
///
/// Returns `Err(raw)` when the encoding needs no decoding, handing the
/// untouched stream back to the caller.
pub fn decoder_for<R>(
    encoding: Option<&TransferEncoding>,
    raw: R,
) -> std::result::Result<Box<dyn Read + Send>, R>
where
    R: Read + Send + 'static,
{
    match encoding {
        Some(TransferEncoding::Base64) => Ok(Box::new(self::base64::Base64Decoder::new(raw))),
        Some(TransferEncoding::QuotedPrintable) => {
            Ok(Box::new(self::qp::QuotedPrintableDecoder::new(raw)))
        }
        Some(TransferEncoding::Other(_)) | None => Err(raw),
    }
}
