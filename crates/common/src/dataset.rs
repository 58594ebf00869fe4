use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{error, info};

use crate::config::ExportConfig;
use crate::error::{LabError, Result};
use crate::SensorSample;

/// Samples recorded during one run.
///
/// Cloning is cheap: clones share the same storage, so the engine can keep
/// appending while the session hands the dataset to an exporter.
#[derive(Clone, Default)]
pub struct RecordedDataset {
    samples: Arc<Mutex<Vec<SensorSample>>>,
}

impl RecordedDataset {
    pub fn new() -> Self {
        Self {
            samples: Arc::new(Mutex::new(Vec::with_capacity(4_096))),
        }
    }

    pub fn record(&self, sample: SensorSample) {
        if let Ok(mut data) = self.samples.lock() {
            data.push(sample);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut data) = self.samples.lock() {
            data.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<SensorSample> {
        self.samples.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Write the dataset as a delimited table. Never fails: problems are
    /// logged and reported as `false`.
    pub fn export_csv(
        &self,
        path: impl AsRef<Path>,
        allowed: Option<&BTreeSet<String>>,
        format: &ExportConfig,
    ) -> bool {
        let path = path.as_ref();
        match self.write_csv(path, allowed, format) {
            Ok(rows) => {
                info!("Saved {} rows to {}", rows, path.display());
                true
            }
            Err(e) => {
                error!("Export to {} failed: {}", path.display(), e);
                false
            }
        }
    }

    pub fn write_csv(
        &self,
        path: &Path,
        allowed: Option<&BTreeSet<String>>,
        format: &ExportConfig,
    ) -> Result<usize> {
        let file = File::create(path)?;
        self.write_table(file, allowed, format)
    }

    pub fn write_table<W: Write>(
        &self,
        out: W,
        allowed: Option<&BTreeSet<String>>,
        format: &ExportConfig,
    ) -> Result<usize> {
        let data = self.snapshot();
        if data.is_empty() {
            return Err(LabError::Export("no data recorded".into()));
        }
        let delimiter = u8::try_from(format.delimiter)
            .map_err(|_| LabError::Export(format!("delimiter {:?} is not ASCII", format.delimiter)))?;

        let columns = columns(&data, allowed);
        let mut wtr = csv::WriterBuilder::new().delimiter(delimiter).from_writer(out);

        let mut header = vec!["t_s".to_string()];
        header.extend(columns.iter().cloned());
        wtr.write_record(&header)?;

        for sample in &data {
            let mut row = Vec::with_capacity(columns.len() + 1);
            row.push(number(sample.t_s, Some(3), format.decimal_comma));
            for key in &columns {
                row.push(
                    sample
                        .values
                        .get(key)
                        .map(|v| number(*v, None, format.decimal_comma))
                        .unwrap_or_default(),
                );
            }
            wtr.write_record(&row)?;
        }
        wtr.flush()?;
        Ok(data.len())
    }
}

// Keys in order of first appearance, filtered by the allow-list.
fn columns(data: &[SensorSample], allowed: Option<&BTreeSet<String>>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut columns = Vec::new();
    for key in data.iter().flat_map(|s| s.values.keys()) {
        if allowed.is_some_and(|a| !a.contains(key)) {
            continue;
        }
        if seen.insert(key.clone()) {
            columns.push(key.clone());
        }
    }
    columns
}

fn number(value: f64, decimals: Option<usize>, decimal_comma: bool) -> String {
    let text = match decimals {
        Some(d) => format!("{value:.d$}"),
        None => value.to_string(),
    };
    if decimal_comma {
        text.replace('.', ",")
    } else {
        text
    }
}
