use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use common::protocol::DeviceCommand;
use common::{LabError, Result, SharedDiagnostics};

const READ_CHUNK: usize = 128;
const READ_BACKOFF: Duration = Duration::from_millis(200);
/// Pending bytes without a newline beyond this are line noise and get dropped.
const MAX_PENDING: usize = 64 * 1024;

/// Receives every decoded text line while registered on a [`Transport`].
pub trait LineConsumer: Send + Sync {
    fn handle_line(&self, line: &str);
}

impl<F> LineConsumer for F
where
    F: Fn(&str) + Send + Sync,
{
    fn handle_line(&self, line: &str) {
        self(line)
    }
}

pub type SharedConsumer = Arc<dyn LineConsumer>;

pub type ByteReader = Box<dyn Read + Send>;
pub type ByteWriter = Box<dyn Write + Send>;

/// Owns the serial connection, its reader thread and the single line consumer.
///
/// Clones share the same connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    writer: Mutex<Option<ByteWriter>>,
    consumer: Mutex<Option<SharedConsumer>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    open: AtomicBool,
    // Bumped on every attach/close; a reader thread exits once it no longer matches.
    generation: AtomicU64,
    diagnostics: Arc<SharedDiagnostics>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(Arc::new(SharedDiagnostics::default()))
    }
}

impl Transport {
    pub fn new(diagnostics: Arc<SharedDiagnostics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(None),
                consumer: Mutex::new(None),
                reader: Mutex::new(None),
                open: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                diagnostics,
            }),
        }
    }

    pub fn diagnostics(&self) -> &Arc<SharedDiagnostics> {
        &self.inner.diagnostics
    }

    /// Open a serial port, closing any previous connection first.
    pub fn open(&self, port: &str, baud: u32, timeout: Duration) -> Result<()> {
        self.close();
        let serial = serialport::new(port, baud)
            .timeout(timeout)
            .open()
            .map_err(|e| LabError::Connection(format!("{port}: {e}")))?;
        let reader = serial
            .try_clone()
            .map_err(|e| LabError::Connection(format!("{port}: {e}")))?;
        info!("Opened {} @ {} baud", port, baud);
        self.attach(Box::new(reader), Box::new(serial));
        Ok(())
    }

    /// Run the transport over arbitrary byte streams. The reader should time
    /// out periodically so that `close` is observed promptly.
    pub fn attach(&self, reader: ByteReader, writer: ByteWriter) {
        self.close();

        if let Ok(mut slot) = self.inner.writer.lock() {
            *slot = Some(writer);
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.open.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || reader_loop(inner, reader, generation));
        match spawned {
            Ok(handle) => {
                if let Ok(mut slot) = self.inner.reader.lock() {
                    *slot = Some(handle);
                }
            }
            Err(e) => {
                warn!("Could not start reader thread: {}", e);
                self.close();
            }
        }
    }

    /// Idempotent. Stops the reader thread and drops the port handle.
    pub fn close(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let was_open = self.inner.open.swap(false, Ordering::SeqCst);

        let handle = self.inner.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Reader thread panicked");
            }
        }
        if let Ok(mut slot) = self.inner.writer.lock() {
            slot.take();
        }
        if was_open {
            info!("Serial link closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Register `consumer` (or nobody) and return the previous registration.
    pub fn set_line_consumer(&self, consumer: Option<SharedConsumer>) -> Option<SharedConsumer> {
        match self.inner.consumer.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, consumer),
            Err(_) => None,
        }
    }

    /// Clear the registration only if `consumer` still holds it.
    pub fn release_line_consumer(&self, consumer: &SharedConsumer) -> bool {
        let Ok(mut slot) = self.inner.consumer.lock() else {
            return false;
        };
        if slot.as_ref().is_some_and(|current| same_consumer(current, consumer)) {
            *slot = None;
            true
        } else {
            false
        }
    }

    pub fn has_line_consumer(&self) -> bool {
        self.inner.consumer.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Write `text` plus a newline. Does nothing when the link is closed.
    pub fn write_line(&self, text: &str) {
        if !self.is_open() {
            return;
        }
        let Ok(mut slot) = self.inner.writer.lock() else {
            return;
        };
        let Some(writer) = slot.as_mut() else {
            return;
        };
        let result = writer
            .write_all(text.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        match result {
            Ok(()) => debug!("-> {}", text),
            Err(e) => warn!("Write of {:?} failed: {}", text, e),
        }
    }

    pub fn send(&self, command: DeviceCommand) {
        self.write_line(&command.to_string());
    }
}

fn same_consumer(a: &SharedConsumer, b: &SharedConsumer) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn dispatch(&self, line: &str) {
        self.diagnostics.record_line();
        let consumer = self.consumer.lock().ok().and_then(|slot| slot.clone());
        if let Some(consumer) = consumer {
            consumer.handle_line(line);
        }
    }
}

fn reader_loop(inner: Arc<Inner>, mut reader: ByteReader, generation: u64) {
    let mut pending: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; READ_CHUNK];

    while inner.is_current(generation) {
        match reader.read(&mut chunk) {
            Ok(0) => {
                info!("Serial device hung up");
                if inner.is_current(generation) {
                    inner.open.store(false, Ordering::SeqCst);
                }
                break;
            }
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=pos).collect();
                    let Some(line) = decode_text(&raw[..raw.len() - 1]) else {
                        continue;
                    };
                    if !inner.is_current(generation) {
                        return;
                    }
                    inner.dispatch(&line);
                }
                if pending.len() > MAX_PENDING {
                    debug!("Dropping {} bytes without line terminator", pending.len());
                    inner.diagnostics.record_anomaly();
                    pending.clear();
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof
                ) =>
            {
                warn!("Serial link lost: {}", e);
                if inner.is_current(generation) {
                    inner.open.store(false, Ordering::SeqCst);
                }
                break;
            }
            Err(e) => {
                inner.diagnostics.record_read_error();
                debug!("Read error, retrying: {}", e);
                thread::sleep(READ_BACKOFF);
            }
        }
    }
}

// Invalid UTF-8 is dropped rather than replaced.
fn decode_text(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw).replace(char::REPLACEMENT_CHARACTER, "");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
