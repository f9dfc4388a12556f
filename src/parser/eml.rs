//! Stage MIME parts of an `.eml` message as provided files.
//!
//! The part body is copied still transfer-encoded; the reference carries the
//! encoding so the gateway decodes it on read.

use mail_parser::{Encoding, MessageParser, MessagePart, MimeHeaders};
use serde::Serialize;

use crate::error::{Result, StashError};
use crate::provider::{provide_bytes, ProvidedFileProducer};
use crate::reference::ContentReference;

/// A part that can be staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartInfo {
    /// Position in the list returned by [`list_parts`].
    pub index: usize,
    /// Attachment file name, generated if missing.
    pub filename: String,
    /// MIME type, `application/octet-stream` if missing.
    pub content_type: String,
    /// Transfer encoding tag, `None` for 7bit/8bit/binary.
    pub encoding: Option<String>,
    /// Size of the still-encoded body.
    pub encoded_len: usize,
}

/// Result of staging one part.
#[derive(Debug, Clone)]
pub struct StagedPart {
    pub part: PartInfo,
    pub reference: ContentReference,
}

/// List the attachments of a message. A single-part message without
/// attachments yields its own body.
pub fn list_parts(raw_message: &[u8]) -> Result<Vec<PartInfo>> {
    let message_bytes = skip_from_line(raw_message);
    let msg = MessageParser::default()
        .parse(message_bytes)
        .ok_or_else(|| StashError::Mime("Failed to parse message".into()))?;

    Ok(stageable_parts(&msg)
        .into_iter()
        .enumerate()
        .map(|(index, part)| part_info(index, part, message_bytes))
        .collect())
}

/// Copy part `index` into a provided file and return its reference.
pub fn stage_part<P: ProvidedFileProducer + ?Sized>(
    producer: &P,
    raw_message: &[u8],
    index: usize,
) -> Result<StagedPart> {
    let message_bytes = skip_from_line(raw_message);
    let msg = MessageParser::default()
        .parse(message_bytes)
        .ok_or_else(|| StashError::Mime("Failed to parse message".into()))?;

    let parts = stageable_parts(&msg);
    let part = parts.get(index).copied().ok_or_else(|| {
        StashError::Mime(format!(
            "Part {index} not found (message has {} stageable parts)",
            parts.len()
        ))
    })?;

    let info = part_info(index, part, message_bytes);
    let body = encoded_body(part, message_bytes);
    let reference = provide_bytes(producer, body, info.encoding.as_deref(), &info.content_type)?;
    tracing::debug!(
        filename = %info.filename,
        encoding = ?info.encoding,
        bytes = body.len(),
        "Staged message part"
    );
    Ok(StagedPart {
        part: info,
        reference,
    })
}

fn stageable_parts<'a>(msg: &'a mail_parser::Message<'a>) -> Vec<&'a MessagePart<'a>> {
    let attachments: Vec<&MessagePart<'_>> = msg.attachments().collect();
    if attachments.is_empty() && msg.parts.len() == 1 {
        return msg.parts.iter().collect();
    }
    attachments
}

fn part_info(index: usize, part: &MessagePart<'_>, message_bytes: &[u8]) -> PartInfo {
    let filename = part
        .attachment_name()
        .map(String::from)
        .unwrap_or_else(|| format!("part_{index}"));

    let content_type = part
        .content_type()
        .map(|ct: &mail_parser::ContentType| {
            let main = ct.ctype();
            match ct.subtype() {
                Some(sub) => format!("{main}/{sub}"),
                None => main.to_string(),
            }
        })
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let encoding = match part.encoding {
        Encoding::Base64 => Some("base64".to_string()),
        Encoding::QuotedPrintable => Some("quoted-printable".to_string()),
        _ => None,
    };

    PartInfo {
        index,
        filename,
        content_type,
        encoding,
        encoded_len: encoded_body(part, message_bytes).len(),
    }
}

/// Raw (undecoded) body bytes of a part.
fn encoded_body<'a>(part: &MessagePart<'_>, message_bytes: &'a [u8]) -> &'a [u8] {
    let start = part.offset_body as usize;
    let end = part.offset_end as usize;
    message_bytes.get(start..end).unwrap_or_default()
}

/// Skip the `From ` separator line at the start of MBOX messages.
fn skip_from_line(data: &[u8]) -> &[u8] {
    // Handle BOM
    let data = if data.starts_with(&[0xEF, 0xBB, 0xBF]) {
        &data[3..]
    } else {
        data
    };

    if data.starts_with(b"From ") {
        if let Some(pos) = data.iter().position(|&b| b == b'\n') {
            return &data[pos + 1..];
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_from_line() {
        let data = b"From user@example.com Thu Jan 01 00:00:00 2024\nSubject: Test\n\nBody\n";
        assert!(skip_from_line(data).starts_with(b"Subject:"));
    }

    #[test]
    fn test_skip_from_line_no_from() {
        let data = b"Subject: Test\n\nBody\n";
        assert_eq!(skip_from_line(data), data);
    }
}
