//! Bounded producer/consumer pipe between a decoder and the consumer.
//!
//! A drain thread reads decoded bytes from the source in `chunk_size` pieces
//! and sends them over a `sync_channel` holding at most `capacity_chunks`
//! chunks. When the consumer is slow the drain thread blocks on `send`; when
//! the consumer closes its end, the next `send` fails and the drain thread
//! drops the source, releasing the underlying file.

use std::io::{self, ErrorKind, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::config::PipeConfig;

type Chunk = io::Result<Vec<u8>>;

/// Start draining `source` on a background thread.
///
/// Fails only if the thread cannot be spawned.
pub fn spawn_drain<R>(source: R, config: &PipeConfig) -> io::Result<PipeReader>
where
    R: Read + Send + 'static,
{
    let capacity = config.capacity_chunks.max(1);
    let chunk_size = config.chunk_size.max(1);
    let (tx, rx) = mpsc::sync_channel::<Chunk>(capacity);
    let buffered = Arc::new(AtomicUsize::new(0));

    let drain_buffered = Arc::clone(&buffered);
    let handle = thread::Builder::new()
        .name("mailstash-drain".to_string())
        .spawn(move || drain(source, tx, chunk_size, drain_buffered))?;

    Ok(PipeReader {
        rx: Some(rx),
        drain: Some(handle),
        current: Vec::new(),
        pos: 0,
        failed: None,
        buffered,
    })
}

fn drain<R: Read>(
    mut source: R,
    tx: SyncSender<Chunk>,
    chunk_size: usize,
    buffered: Arc<AtomicUsize>,
) {
    let mut buf = vec![0u8; chunk_size];
    let mut total: u64 = 0;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Decoding failed mid-stream");
                let _ = tx.send(Err(e));
                break;
            }
        };
        buffered.fetch_add(n, Ordering::SeqCst);
        if tx.send(Ok(buf[..n].to_vec())).is_err() {
            buffered.fetch_sub(n, Ordering::SeqCst);
            debug!(total, "Consumer closed the pipe, stopping drain");
            return;
        }
        total += n as u64;
    }
    debug!(total, "Drain finished");
}

/// Read end of the pipe.
pub struct PipeReader {
    rx: Option<Receiver<Chunk>>,
    drain: Option<JoinHandle<()>>,
    current: Vec<u8>,
    pos: usize,
    failed: Option<(ErrorKind, String)>,
    buffered: Arc<AtomicUsize>,
}

impl PipeReader {
    /// Decoded bytes sent by the drain thread but not yet taken by `read`.
    ///
    /// Never more than `(capacity_chunks + 1) * chunk_size`: the queue plus the
    /// one chunk a blocked `send` is holding.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst) + (self.current.len() - self.pos)
    }

    /// `true` once the drain thread has exited.
    pub fn is_drain_finished(&self) -> bool {
        self.drain.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Close the read end and wait for the drain thread to let go of its
    /// source. Safe to call more than once.
    pub fn close(&mut self) {
        // Dropping the receiver fails the drain thread's pending send.
        if self.rx.take().is_none() {
            return;
        }
        self.current = Vec::new();
        self.pos = 0;
        if let Some(handle) = self.drain.take() {
            if handle.join().is_err() {
                warn!("Drain thread panicked");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.rx.is_none()
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some((kind, msg)) = &self.failed {
            return Err(io::Error::new(*kind, msg.clone()));
        }
        while self.pos >= self.current.len() {
            let Some(rx) = &self.rx else {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "pipe is closed"));
            };
            match rx.recv() {
                Ok(Ok(chunk)) => {
                    self.buffered.fetch_sub(chunk.len(), Ordering::SeqCst);
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => {
                    self.failed = Some((e.kind(), e.to_string()));
                    return Err(e);
                }
                // Sender gone without an error: clean end of stream.
                Err(_) => return Ok(0),
            }
        }
        let available = &self.current[self.pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}
