//! The file provider: store, references, decoding and cleanup wired together.
//!
//! Producers (decryption, signature verification) ask for a file, write the
//! payload, and turn the file into a reference. Consumers (viewers, other
//! apps) only ever see the reference.

use std::sync::Arc;

use crate::cleanup::CleanupScheduler;
use crate::config::Config;
use crate::error::{Result, StashError};
use crate::gateway::{ContentStream, DecodingGateway, OpenMode};
use crate::reference::{ContentReference, ReferenceCodec};
use crate::signal::SignalSource;
use crate::store::temp::{StoredFile, TempFileStore};

/// What a producer of decrypted content needs.
pub trait ProvidedFileProducer {
    /// Allocate an empty temp file for the payload.
    fn create_provided_file(&self) -> Result<StoredFile>;

    /// Turn a written file into a reference.
    fn reference_for_file(
        &self,
        file: &StoredFile,
        encoding: Option<&str>,
        media_type: &str,
    ) -> Result<ContentReference>;
}

/// What a consumer of decoded content needs.
pub trait DecodedContentSource {
    /// Open the decoded bytes behind a reference.
    fn open_for_read(&self, reference: &ContentReference) -> Result<ContentStream>;

    /// MIME type of the decoded bytes.
    fn media_type_of(&self, reference: &ContentReference) -> Result<String>;
}

/// Owns a temp file store and everything that hangs off it.
#[derive(Clone)]
pub struct FileProvider {
    store: TempFileStore,
    gateway: DecodingGateway,
    scheduler: CleanupScheduler,
}

impl FileProvider {
    /// Provider at the configured location.
    pub fn new(config: &Config, signals: Arc<dyn SignalSource>) -> Self {
        Self::with_store(TempFileStore::from_config(config), config, signals)
    }

    /// Provider over an explicit store (tests, embedding).
    pub fn with_store(
        store: TempFileStore,
        config: &Config,
        signals: Arc<dyn SignalSource>,
    ) -> Self {
        let codec = ReferenceCodec::new(&config.store.authority, store.clone());
        let gateway = DecodingGateway::new(codec, config.pipe.clone());
        let scheduler = CleanupScheduler::attach(store.clone(), signals, &config.cleanup);
        Self {
            store,
            gateway,
            scheduler,
        }
    }

    /// Open with an explicit mode. Anything but read is refused.
    pub fn open(&self, reference: &ContentReference, mode: OpenMode) -> Result<ContentStream> {
        self.gateway.open(reference, mode)
    }

    /// Always fails: deletion belongs to the cleanup sweep.
    pub fn delete(&self, reference: &ContentReference) -> Result<()> {
        self.gateway.delete(reference)
    }

    /// Parse a reference string handed in from outside.
    pub fn parse_reference(&self, reference: &str) -> Result<ContentReference> {
        let parsed: ContentReference = reference.parse()?;
        self.gateway.codec().decode(&parsed)?;
        Ok(parsed)
    }

    pub fn store(&self) -> &TempFileStore {
        &self.store
    }

    pub fn scheduler(&self) -> &CleanupScheduler {
        &self.scheduler
    }
}

impl ProvidedFileProducer for FileProvider {
    fn create_provided_file(&self) -> Result<StoredFile> {
        self.scheduler.on_file_created();
        self.store.create_file()
    }

    fn reference_for_file(
        &self,
        file: &StoredFile,
        encoding: Option<&str>,
        media_type: &str,
    ) -> Result<ContentReference> {
        self.gateway.codec().encode(file, encoding, media_type)
    }
}

impl DecodedContentSource for FileProvider {
    fn open_for_read(&self, reference: &ContentReference) -> Result<ContentStream> {
        self.gateway.open(reference, OpenMode::Read)
    }

    fn media_type_of(&self, reference: &ContentReference) -> Result<String> {
        self.gateway.media_type(reference)
    }
}

/// Write `bytes` into a fresh provided file and return its reference.
pub fn provide_bytes<P: ProvidedFileProducer + ?Sized>(
    producer: &P,
    bytes: &[u8],
    encoding: Option<&str>,
    media_type: &str,
) -> Result<ContentReference> {
    use std::io::Write;

    let file = producer.create_provided_file()?;
    let mut writer = file.writer()?;
    writer
        .write_all(bytes)
        .and_then(|()| writer.flush())
        .map_err(|e| StashError::io(file.path(), e))?;
    producer.reference_for_file(&file, encoding, media_type)
}
