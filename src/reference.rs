//! Opaque content references.
//!
//! A reference is a `content://` URL naming one stored file plus two query
//! tags: the optional transfer `encoding` and the mandatory `mime_type`.
//!
//! ```text
//! content://mailstash.decryptedfileprovider/decrypted/decrypted-8Hq2.tmp?encoding=base64&mime_type=image%2Fpng
//! ```
//!
//! All metadata lives in the reference; nothing is stored next to the file.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::{Result, StashError};
use crate::store::temp::{StoredFile, TempFileStore};

/// URL scheme of every reference.
pub const SCHEME: &str = "content";

const ENCODING_PARAM: &str = "encoding";
const MIME_TYPE_PARAM: &str = "mime_type";

/// Content-Transfer-Encoding named by a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEncoding {
    Base64,
    QuotedPrintable,
    /// Anything else (`7bit`, `binary`, `none`, future tags). Passed through raw.
    Other(String),
}

impl TransferEncoding {
    /// Classify a tag. Matching is case-insensitive, like MIME header values.
    pub fn from_tag(tag: &str) -> Self {
        let trimmed = tag.trim();
        if trimmed.eq_ignore_ascii_case("base64") {
            Self::Base64
        } else if trimmed.eq_ignore_ascii_case("quoted-printable") {
            Self::QuotedPrintable
        } else {
            Self::Other(trimmed.to_string())
        }
    }

    /// Tag as written into the reference.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Base64 => "base64",
            Self::QuotedPrintable => "quoted-printable",
            Self::Other(tag) => tag,
        }
    }

    /// `true` if the gateway interposes a decoder for this tag.
    pub fn needs_decoding(&self) -> bool {
        matches!(self, Self::Base64 | Self::QuotedPrintable)
    }
}

impl fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable, read-only locator for a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentReference {
    url: Url,
}

impl ContentReference {
    /// String form, safe to hand to another process.
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for ContentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl FromStr for ContentReference {
    type Err = StashError;

    /// Only checks that the input is a URL; structure is checked on decode.
    fn from_str(s: &str) -> Result<Self> {
        let url = Url::parse(s.trim())
            .map_err(|e| StashError::MalformedReference(format!("'{s}': {e}")))?;
        Ok(Self { url })
    }
}

/// Fields recovered from a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedReference {
    /// Absolute path of the stored file.
    pub path: PathBuf,
    /// File name inside the reserved directory.
    pub file_name: String,
    /// Transfer encoding, if the reference names one.
    pub encoding: Option<TransferEncoding>,
    /// MIME type of the decoded content.
    pub media_type: String,
}

/// Builds and parses references for one store and authority.
#[derive(Debug, Clone)]
pub struct ReferenceCodec {
    authority: String,
    store: TempFileStore,
}

impl ReferenceCodec {
    pub fn new(authority: impl Into<String>, store: TempFileStore) -> Self {
        Self {
            authority: authority.into(),
            store,
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Build a reference for `file`.
    ///
    /// `media_type` is mandatory. Unknown encodings are accepted and later
    /// served without decoding.
    pub fn encode(
        &self,
        file: &StoredFile,
        encoding: Option<&str>,
        media_type: &str,
    ) -> Result<ContentReference> {
        let media_type = media_type.trim();
        if media_type.is_empty() {
            return Err(StashError::MalformedReference(
                "media type is required".to_string(),
            ));
        }
        if !self.store.contains(file) {
            return Err(StashError::MalformedReference(format!(
                "'{}' is not inside the temp directory",
                file.path().display()
            )));
        }

        let mut url = Url::parse(&format!("{SCHEME}://{}/", self.authority)).map_err(|e| {
            StashError::MalformedReference(format!("bad authority '{}': {e}", self.authority))
        })?;
        url.path_segments_mut()
            .map_err(|_| StashError::MalformedReference("reference cannot hold a path".into()))?
            .clear()
            .push(self.store.directory_name())
            .push(file.name());
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(encoding) = encoding.map(str::trim).filter(|e| !e.is_empty()) {
                pairs.append_pair(ENCODING_PARAM, encoding);
            }
            pairs.append_pair(MIME_TYPE_PARAM, media_type);
        }
        Ok(ContentReference { url })
    }

    /// Parse a reference back into its parts. Pure, no filesystem access.
    pub fn decode(&self, reference: &ContentReference) -> Result<DecodedReference> {
        let url = &reference.url;
        if url.scheme() != SCHEME {
            return Err(malformed(reference, "unexpected scheme"));
        }
        if url.host_str() != Some(self.authority.as_str()) {
            return Err(malformed(reference, "unknown authority"));
        }

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.collect())
            .unwrap_or_default();
        let [directory, file_name] = segments.as_slice() else {
            return Err(malformed(reference, "expected /<directory>/<file>"));
        };
        if *directory != self.store.directory_name() {
            return Err(malformed(reference, "unknown directory"));
        }
        let file_name = percent_decode_str(file_name)
            .decode_utf8()
            .map_err(|_| malformed(reference, "file name is not UTF-8"))?
            .into_owned();
        let file = self.store.resolve(&file_name)?;

        let media_type = media_type_param(url)
            .ok_or_else(|| malformed(reference, "missing mime_type"))?;
        let encoding = url
            .query_pairs()
            .find(|(k, _)| k == ENCODING_PARAM)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.trim().is_empty())
            .map(|v| TransferEncoding::from_tag(&v));

        Ok(DecodedReference {
            path: file.path().to_path_buf(),
            file_name,
            encoding,
            media_type,
        })
    }

    /// MIME type tag of a reference.
    pub fn media_type(&self, reference: &ContentReference) -> Result<String> {
        media_type_param(&reference.url)
            .ok_or_else(|| malformed(reference, "missing mime_type"))
    }
}

fn media_type_param(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == MIME_TYPE_PARAM)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn malformed(reference: &ContentReference, reason: &str) -> StashError {
    StashError::MalformedReference(format!("{reason}: {reference}"))
}
