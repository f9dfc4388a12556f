//! Read-only access to stored files, decoded on the fly.
//!
//! Opening a reference with no (or an unknown) transfer encoding returns the
//! raw file. Base64 and quoted-printable references get a decoder plus a
//! bounded pipe, so the consumer reads plaintext through the same [`Read`]
//! interface either way.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::str::FromStr;

use tracing::{debug, error};

use crate::config::PipeConfig;
use crate::decode;
use crate::error::{Result, StashError};
use crate::pipe::{self, PipeReader};
use crate::reference::{ContentReference, ReferenceCodec, TransferEncoding};

/// Access mode requested by a consumer, written like `fopen`-style mode
/// strings (`r`, `w`, `wt`, `wa`, `rw`, `rwt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    WriteTruncate,
    WriteAppend,
    ReadWrite,
    ReadWriteTruncate,
}

impl FromStr for OpenMode {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(Self::Read),
            "w" => Ok(Self::Write),
            "wt" => Ok(Self::WriteTruncate),
            "wa" => Ok(Self::WriteAppend),
            "rw" => Ok(Self::ReadWrite),
            "rwt" => Ok(Self::ReadWriteTruncate),
            _ => Err(StashError::UnsupportedOperation("unknown open mode")),
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "r",
            Self::Write => "w",
            Self::WriteTruncate => "wt",
            Self::WriteAppend => "wa",
            Self::ReadWrite => "rw",
            Self::ReadWriteTruncate => "rwt",
        };
        f.write_str(s)
    }
}

enum StreamInner {
    Raw(File),
    Decoded(PipeReader),
}

/// Readable handle returned by [`DecodingGateway::open`].
///
/// Closing (explicitly or by drop) releases the underlying file exactly once.
pub struct ContentStream {
    inner: Option<StreamInner>,
}

impl ContentStream {
    /// `true` if bytes pass through a decoder.
    pub fn is_decoded(&self) -> bool {
        matches!(self.inner, Some(StreamInner::Decoded(_)))
    }

    /// Decoded bytes waiting in the pipe (always 0 for raw streams).
    pub fn buffered_bytes(&self) -> usize {
        match &self.inner {
            Some(StreamInner::Decoded(pipe)) => pipe.buffered_bytes(),
            _ => 0,
        }
    }

    /// Release the stream. Further reads fail; further closes do nothing.
    pub fn close(&mut self) {
        match self.inner.take() {
            Some(StreamInner::Decoded(mut pipe)) => pipe.close(),
            Some(StreamInner::Raw(file)) => drop(file),
            None => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

impl Read for ContentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Some(StreamInner::Raw(file)) => file.read(buf),
            Some(StreamInner::Decoded(pipe)) => pipe.read(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "content stream is closed",
            )),
        }
    }
}

impl fmt::Debug for ContentStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner {
            Some(StreamInner::Raw(_)) => "raw",
            Some(StreamInner::Decoded(_)) => "decoded",
            None => "closed",
        };
        f.debug_struct("ContentStream").field("state", &state).finish()
    }
}

/// Resolves references and serves decoded content.
#[derive(Debug, Clone)]
pub struct DecodingGateway {
    codec: ReferenceCodec,
    pipe: PipeConfig,
}

impl DecodingGateway {
    pub fn new(codec: ReferenceCodec, pipe: PipeConfig) -> Self {
        Self { codec, pipe }
    }

    /// Open a reference. Only [`OpenMode::Read`] is supported.
    pub fn open(&self, reference: &ContentReference, mode: OpenMode) -> Result<ContentStream> {
        if mode != OpenMode::Read {
            return Err(StashError::UnsupportedOperation(
                "content references are read-only",
            ));
        }
        let decoded = self.codec.decode(reference)?;
        let raw = File::open(&decoded.path).map_err(|e| StashError::open(&decoded.path, e))?;

        if let Some(TransferEncoding::Other(tag)) = &decoded.encoding {
            debug!(encoding = %tag, "Unsupported encoding, returning raw stream");
        }

        let inner = match decode::decoder_for(decoded.encoding.as_ref(), raw) {
            Err(raw) => StreamInner::Raw(raw),
            Ok(decoder) => {
                let pipe = pipe::spawn_drain(decoder, &self.pipe).map_err(|e| {
                    error!(error = %e, "Failed to create decoding pipe");
                    StashError::Unavailable(e)
                })?;
                debug!(
                    file = %decoded.file_name,
                    encoding = ?decoded.encoding,
                    "Serving decoded stream"
                );
                StreamInner::Decoded(pipe)
            }
        };
        Ok(ContentStream { inner: Some(inner) })
    }

    /// MIME type of a reference. No filesystem access.
    pub fn media_type(&self, reference: &ContentReference) -> Result<String> {
        self.codec.media_type(reference)
    }

    /// Deletion is owned by the store and the cleanup sweep, never by consumers.
    pub fn delete(&self, _reference: &ContentReference) -> Result<()> {
        Err(StashError::UnsupportedOperation(
            "deleting through a content reference",
        ))
    }

    pub fn codec(&self) -> &ReferenceCodec {
        &self.codec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::temp::TempFileStore;
    use std::io::Write;

    fn gateway(tmp: &tempfile::TempDir) -> (TempFileStore, DecodingGateway) {
        let store = TempFileStore::new(tmp.path().join("decrypted"), "decrypted-");
        let codec = ReferenceCodec::new("mailstash.test", store.clone());
        (store, DecodingGateway::new(codec, PipeConfig::default()))
    }

    fn stored(
        store: &TempFileStore,
        gateway: &DecodingGateway,
        bytes: &[u8],
        encoding: Option<&str>,
    ) -> ContentReference {
        let file = store.create_file().unwrap();
        let mut w = file.writer().unwrap();
        w.write_all(bytes).unwrap();
        w.flush().unwrap();
        gateway
            .codec()
            .encode(&file, encoding, "text/plain")
            .unwrap()
    }

    fn read_all(stream: &mut ContentStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_open_mode_parsing() {
        assert_eq!("r".parse::<OpenMode>().unwrap(), OpenMode::Read);
        assert_eq!("rwt".parse::<OpenMode>().unwrap(), OpenMode::ReadWriteTruncate);
        assert!("x".parse::<OpenMode>().is_err());
        assert_eq!(OpenMode::WriteAppend.to_string(), "wa");
    }

    #[test]
    fn test_passthrough_without_encoding() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, gateway) = gateway(&tmp);
        let reference = stored(&store, &gateway, b"SGVsbG8=", None);

        let mut stream = gateway.open(&reference, OpenMode::Read).unwrap();
        assert!(!stream.is_decoded());
        assert_eq!(read_all(&mut stream), b"SGVsbG8=");
    }

    #[test]
    fn test_passthrough_unknown_encoding() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, gateway) = gateway(&tmp);
        let reference = stored(&store, &gateway, b"=C3=A9", Some("8bit"));

        let mut stream = gateway.open(&reference, OpenMode::Read).unwrap();
        assert!(!stream.is_decoded());
        assert_eq!(read_all(&mut stream), b"=C3=A9");
    }

    #[test]
    fn test_base64_decoded() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, gateway) = gateway(&tmp);
        let reference = stored(&store, &gateway, b"SGVsbG8s\r\nIHdvcmxkIQ==\r\n", Some("base64"));

        let mut stream = gateway.open(&reference, OpenMode::Read).unwrap();
        assert!(stream.is_decoded());
        assert_eq!(read_all(&mut stream), b"Hello, world!");
    }

    #[test]
    fn test_quoted_printable_decoded() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, gateway) = gateway(&tmp);
        let reference = stored(
            &store,
            &gateway,
            b"Caf=C3=A9 con =\r\nle=C3=B1a",
            Some("Quoted-Printable"),
        );

        let mut stream = gateway.open(&reference, OpenMode::Read).unwrap();
        assert_eq!(read_all(&mut stream), "Café con leña".as_bytes());
    }

    #[test]
    fn test_non_read_modes_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, gateway) = gateway(&tmp);
        let reference = stored(&store, &gateway, b"x", None);
        for mode in [OpenMode::Write, OpenMode::ReadWrite, OpenMode::WriteAppend] {
            assert!(matches!(
                gateway.open(&reference, mode),
                Err(StashError::UnsupportedOperation(_))
            ));
        }
    }

    #[test]
    fn test_delete_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, gateway) = gateway(&tmp);
        let reference = stored(&store, &gateway, b"x", None);
        assert!(matches!(
            gateway.delete(&reference),
            Err(StashError::UnsupportedOperation(_))
        ));
        assert_eq!(store.list_files().len(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, gateway) = gateway(&tmp);
        let reference = stored(&store, &gateway, b"aGVsbG8=", Some("base64"));

        let mut stream = gateway.open(&reference, OpenMode::Read).unwrap();
        stream.close();
        stream.close();
        assert!(stream.is_closed());
        assert!(stream.read(&mut [0u8; 4]).is_err());
    }
}
