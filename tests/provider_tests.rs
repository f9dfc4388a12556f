//! Integration tests for providing, referencing and reading decoded content.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;

use mailstash::config::Config;
use mailstash::error::StashError;
use mailstash::gateway::OpenMode;
use mailstash::parser::eml;
use mailstash::provider::{
    provide_bytes, DecodedContentSource, FileProvider, ProvidedFileProducer,
};
use mailstash::reference::{ContentReference, TransferEncoding};
use mailstash::signal::SignalBus;
use mailstash::store::temp::TempFileStore;

fn provider_in(tmp: &tempfile::TempDir, config: &Config) -> FileProvider {
    let store = TempFileStore::new(tmp.path().join("decrypted"), "decrypted-");
    let bus = SignalBus::spawn().unwrap();
    FileProvider::with_store(store, config, bus)
}

fn read_all(provider: &FileProvider, reference: &ContentReference) -> Vec<u8> {
    let mut stream = provider.open_for_read(reference).unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    out
}

// ─── Test 1: References round-trip through their string form ────────

#[test]
fn test_reference_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = provider_in(&tmp, &Config::default());
    let file = provider.create_provided_file().unwrap();

    for (encoding, media_type) in [
        (None, "text/plain"),
        (Some("base64"), "image/png"),
        (Some("quoted-printable"), "text/html; charset=utf-8"),
        (Some("x-custom"), "application/octet-stream"),
    ] {
        let reference = provider
            .reference_for_file(&file, encoding, media_type)
            .unwrap();
        let parsed = provider.parse_reference(reference.as_str()).unwrap();
        assert_eq!(parsed, reference);
        assert_eq!(provider.media_type_of(&parsed).unwrap(), media_type);
        assert!(parsed.as_str().contains(file.name()));
        match encoding {
            Some(tag) => assert!(parsed.as_str().contains(&format!("encoding={}", tag))),
            None => assert!(!parsed.as_str().contains("encoding=")),
        }
    }
    assert_eq!(
        TransferEncoding::from_tag("x-custom"),
        TransferEncoding::Other("x-custom".into())
    );
}

// ─── Test 2: Pass-through returns the stored bytes unchanged ────────

#[test]
fn test_passthrough_fidelity() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = provider_in(&tmp, &Config::default());
    let payload: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();

    let plain = provide_bytes(&provider, &payload, None, "application/octet-stream").unwrap();
    let unknown = provide_bytes(&provider, &payload, Some("binary"), "application/pdf").unwrap();

    assert_eq!(read_all(&provider, &plain), payload);
    assert_eq!(read_all(&provider, &unknown), payload);
}

// ─── Test 3: Base64 and quoted-printable are decoded on read ────────

#[test]
fn test_decode_correctness() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = provider_in(&tmp, &Config::default());
    let plaintext = "Grüße aus Köln — quoted-printable and base64 alike.\r\n".repeat(40);

    let encoded = base64::engine::general_purpose::STANDARD.encode(plaintext.as_bytes());
    let wrapped = encoded
        .as_bytes()
        .chunks(76)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join("\r\n");
    let b64 = provide_bytes(&provider, wrapped.as_bytes(), Some("base64"), "text/plain").unwrap();
    assert_eq!(read_all(&provider, &b64), plaintext.as_bytes());

    let qp_line = "Gr=C3=BC=C3=9Fe aus K=C3=B6ln =E2=80=94 \
                   quoted-printable and base64 alike=\r\n.\r\n";
    let qp_body = qp_line.repeat(40);
    let qp = provide_bytes(
        &provider,
        qp_body.as_bytes(),
        Some("quoted-printable"),
        "text/plain",
    )
    .unwrap();
    assert_eq!(read_all(&provider, &qp), plaintext.as_bytes());
}

// ─── Test 4: Malformed payload fails at the point it is reached ─────

#[test]
fn test_midstream_decode_error() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = provider_in(&tmp, &Config::default());
    let body = b"first line\r\nbroken =G1\r\n";
    let reference =
        provide_bytes(&provider, body, Some("quoted-printable"), "text/plain").unwrap();

    let mut stream = provider.open_for_read(&reference).unwrap();
    let mut out = Vec::new();
    let err = stream.read_to_end(&mut out).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    assert_eq!(out, b"first line\r\n");
}

// ─── Test 5: A reference outliving its file is "not found" ──────────

#[test]
fn test_not_found_after_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = provider_in(&tmp, &Config::default());
    let file = provider.create_provided_file().unwrap();
    file.writer().unwrap().write_all(b"aGVsbG8=").unwrap();
    let reference = provider
        .reference_for_file(&file, Some("base64"), "text/plain")
        .unwrap();

    assert!(provider.store().delete_file(&file));

    let err = provider.open_for_read(&reference).unwrap_err();
    assert!(matches!(err, StashError::NotFound(_)), "got {err:?}");
    assert!(err.is_retryable());
    // Metadata is still answerable: it lives in the reference.
    assert_eq!(provider.media_type_of(&reference).unwrap(), "text/plain");
}

// ─── Test 6: Consumers cannot write or delete ───────────────────────

#[test]
fn test_consumer_interface_is_read_only() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = provider_in(&tmp, &Config::default());
    let reference = provide_bytes(&provider, b"data", None, "text/plain").unwrap();

    for mode in ["w", "wt", "wa", "rw", "rwt"] {
        let mode: OpenMode = mode.parse().unwrap();
        assert!(matches!(
            provider.open(&reference, mode),
            Err(StashError::UnsupportedOperation(_))
        ));
    }
    assert!(matches!(
        provider.delete(&reference),
        Err(StashError::UnsupportedOperation(_))
    ));
    assert_eq!(read_all(&provider, &reference), b"data");
}

// ─── Test 7: Slow consumer, large payload, bounded memory ───────────

#[test]
fn test_backpressure_bounds_memory() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.pipe.capacity_chunks = 2;
    config.pipe.chunk_size = 1024;
    let provider = provider_in(&tmp, &config);

    let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 241) as u8).collect();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&payload);
    let reference =
        provide_bytes(&provider, encoded.as_bytes(), Some("base64"), "application/octet-stream")
            .unwrap();

    let mut stream = provider.open_for_read(&reference).unwrap();
    assert!(stream.is_decoded());
    std::thread::sleep(Duration::from_millis(200));
    assert!(
        stream.buffered_bytes() <= 3 * 1024,
        "pipe buffered {} bytes",
        stream.buffered_bytes()
    );

    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    assert_eq!(out.len(), payload.len());
    assert!(out == payload);
}

// ─── Test 8: Closing early stops the drain ──────────────────────────

#[test]
fn test_close_early_then_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.pipe.capacity_chunks = 1;
    config.pipe.chunk_size = 512;
    let provider = provider_in(&tmp, &config);

    let encoded = base64::engine::general_purpose::STANDARD.encode(vec![0x42u8; 1024 * 1024]);
    let reference =
        provide_bytes(&provider, encoded.as_bytes(), Some("base64"), "text/plain").unwrap();

    let mut stream = provider.open_for_read(&reference).unwrap();
    let mut first = [0u8; 16];
    stream.read_exact(&mut first).unwrap();
    assert_eq!(first, [0x42u8; 16]);

    stream.close();
    stream.close();
    assert!(stream.is_closed());
    drop(stream);

    let files = provider.store().list_files();
    assert_eq!(files.len(), 1);
    assert!(provider.store().delete_file(&files[0]));
}

// ─── Test 9: Staging an attachment from a message ───────────────────

#[test]
fn test_stage_attachment_from_eml() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = provider_in(&tmp, &Config::default());
    let attachment = b"%PDF-1.4 pretend this is a decrypted document\n";
    let encoded = base64::engine::general_purpose::STANDARD.encode(attachment);

    let message = format!(
        "From: Alice <alice@example.com>\r\n\
         To: Bob <bob@example.com>\r\n\
         Subject: Report\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
         \r\n\
         --XYZ\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         See attached.\r\n\
         --XYZ\r\n\
         Content-Type: application/pdf; name=\"report.pdf\"\r\n\
         Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n\
         {encoded}\r\n\
         --XYZ--\r\n"
    );

    let parts = eml::list_parts(message.as_bytes()).unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].filename, "report.pdf");
    assert_eq!(parts[0].content_type, "application/pdf");
    assert_eq!(parts[0].encoding.as_deref(), Some("base64"));

    let staged = eml::stage_part(&provider, message.as_bytes(), 0).unwrap();
    assert_eq!(
        provider.media_type_of(&staged.reference).unwrap(),
        "application/pdf"
    );
    assert_eq!(read_all(&provider, &staged.reference), attachment);

    assert!(matches!(
        eml::stage_part(&provider, message.as_bytes(), 5),
        Err(StashError::Mime(_))
    ));
}

// ─── Test 10: Producers and consumers can share one provider ────────

#[test]
fn test_concurrent_producers_and_consumers() {
    let tmp = tempfile::tempdir().unwrap();
    let provider = Arc::new(provider_in(&tmp, &Config::default()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let provider = Arc::clone(&provider);
            std::thread::spawn(move || {
                let text = format!("message number {i}\n").repeat(500);
                let encoded = base64::engine::general_purpose::STANDARD.encode(&text);
                let reference =
                    provide_bytes(&*provider, encoded.as_bytes(), Some("base64"), "text/plain")
                        .unwrap();
                let mut out = String::new();
                provider
                    .open_for_read(&reference)
                    .unwrap()
                    .read_to_string(&mut out)
                    .unwrap();
                assert_eq!(out, text);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(provider.store().list_files().len(), 8);
}
