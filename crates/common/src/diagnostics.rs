use std::sync::atomic::{AtomicU64, Ordering};

/// Link health counters shared by the reader thread, the engine and the front-end.
#[derive(Default, Debug)]
pub struct SharedDiagnostics {
    pub lines_received: AtomicU64,
    pub protocol_anomalies: AtomicU64,
    pub device_faults: AtomicU64,
    pub link_timeouts: AtomicU64,
    pub read_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub lines_received: u64,
    pub protocol_anomalies: u64,
    pub device_faults: u64,
    pub link_timeouts: u64,
    pub read_errors: u64,
}

impl SharedDiagnostics {
    pub fn record_line(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_anomaly(&self) {
        self.protocol_anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_fault(&self) {
        self.device_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_link_timeout(&self) {
        self.link_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            lines_received: self.lines_received.load(Ordering::Relaxed),
            protocol_anomalies: self.protocol_anomalies.load(Ordering::Relaxed),
            device_faults: self.device_faults.load(Ordering::Relaxed),
            link_timeouts: self.link_timeouts.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}
