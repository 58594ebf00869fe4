use std::collections::BTreeMap;

pub mod config;
pub mod dataset;
pub mod diagnostics;
pub mod error;
pub mod pid;
pub mod protocol;

pub use config::LabConfig;
pub use dataset::RecordedDataset;
pub use diagnostics::SharedDiagnostics;
pub use error::{LabError, Result};

/// Sensor key to reading. Keys are free-form and never filtered out.
pub type SensorValues = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    /// Seconds since the run's time basis.
    pub t_s: f64,
    pub values: SensorValues,
}

/// Converts device timestamps into elapsed run time.
///
/// The first numeric `t_ms` of a run becomes the zero reference; samples
/// without a device timestamp fall back to the host clock.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeBasis {
    t0_ms: Option<f64>,
}

impl TimeBasis {
    pub fn reset(&mut self) {
        self.t0_ms = None;
    }

    pub fn origin_ms(&self) -> Option<f64> {
        self.t0_ms
    }

    pub fn elapsed_s(&mut self, t_ms: Option<f64>, host_elapsed_s: f64) -> f64 {
        match t_ms {
            Some(t_ms) => {
                let t0 = *self.t0_ms.get_or_insert(t_ms);
                ((t_ms - t0) / 1000.0).max(0.0)
            }
            None => host_elapsed_s.max(0.0),
        }
    }
}
