//! In-memory stand-in for a serial port.
//!
//! [`mock_link`] returns the device end plus the reader/writer pair to hand
//! to [`crate::Transport::attach`]. Dropping the [`MockDevice`] looks like a
//! hang-up to the host.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::transport::{ByteReader, ByteWriter};

pub const MOCK_READ_TIMEOUT: Duration = Duration::from_millis(20);

type Chunk = std::result::Result<Vec<u8>, ErrorKind>;

pub struct MockDevice {
    to_host: Sender<Chunk>,
    from_host: Mutex<HostOutput>,
}

struct HostOutput {
    rx: Receiver<Vec<u8>>,
    partial: Vec<u8>,
}

struct MockReader {
    rx: Receiver<Chunk>,
    pending: Vec<u8>,
    timeout: Duration,
}

struct MockWriter {
    tx: Sender<Vec<u8>>,
}

pub fn mock_link() -> (MockDevice, ByteReader, ByteWriter) {
    mock_link_with_timeout(MOCK_READ_TIMEOUT)
}

pub fn mock_link_with_timeout(timeout: Duration) -> (MockDevice, ByteReader, ByteWriter) {
    let (to_host, host_rx) = mpsc::channel();
    let (host_tx, from_host) = mpsc::channel();
    let device = MockDevice {
        to_host,
        from_host: Mutex::new(HostOutput {
            rx: from_host,
            partial: Vec::new(),
        }),
    };
    let reader = MockReader {
        rx: host_rx,
        pending: Vec::new(),
        timeout,
    };
    (device, Box::new(reader), Box::new(MockWriter { tx: host_tx }))
}

impl MockDevice {
    pub fn send_bytes(&self, bytes: &[u8]) {
        // an empty chunk would read as end-of-stream
        if bytes.is_empty() {
            return;
        }
        let _ = self.to_host.send(Ok(bytes.to_vec()));
    }

    pub fn send_line(&self, line: &str) {
        self.send_bytes(format!("{line}\n").as_bytes());
    }

    /// Make the next host read fail with `kind`.
    pub fn inject_error(&self, kind: ErrorKind) {
        let _ = self.to_host.send(Err(kind));
    }

    /// Complete lines the host has written so far.
    pub fn written_lines(&self) -> Vec<String> {
        let Ok(mut output) = self.from_host.lock() else {
            return Vec::new();
        };
        while let Ok(bytes) = output.rx.try_recv() {
            output.partial.extend_from_slice(&bytes);
        }
        output.take_lines()
    }

    /// Wait up to `timeout` for the next complete line written by the host.
    /// Lines returned by earlier calls are not repeated.
    pub fn next_written_line(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut output = self.from_host.lock().ok()?;
        loop {
            if let Some(line) = output.take_one_line() {
                return Some(line);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match output.rx.recv_timeout(remaining) {
                Ok(bytes) => output.partial.extend_from_slice(&bytes),
                Err(_) => return None,
            }
        }
    }

    /// `true` once the host side has dropped its writer.
    pub fn host_disconnected(&self) -> bool {
        let Ok(mut output) = self.from_host.lock() else {
            return true;
        };
        loop {
            match output.rx.try_recv() {
                Ok(bytes) => output.partial.extend_from_slice(&bytes),
                Err(mpsc::TryRecvError::Empty) => return false,
                Err(mpsc::TryRecvError::Disconnected) => return true,
            }
        }
    }
}

impl HostOutput {
    fn take_one_line(&mut self) -> Option<String> {
        let pos = self.partial.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.partial.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&raw[..raw.len() - 1]).trim().to_string())
    }

    fn take_lines(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.take_one_line()).collect()
    }
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(Ok(bytes)) => self.pending = bytes,
                Ok(Err(kind)) => return Err(io::Error::new(kind, "injected read error")),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(ErrorKind::TimedOut, "read timed out"))
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "device gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
