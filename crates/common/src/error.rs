//! Error taxonomy shared by every crate in the workspace.
//!
//! Only connection failures, rejected configuration and explicit handshake
//! timeouts travel through `Result`. Protocol anomalies are counted in
//! [`crate::SharedDiagnostics`] and logged, never returned.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LabError>;

#[derive(Error, Debug)]
pub enum LabError {
    /// The serial device could not be opened or the link is gone.
    #[error("connection error: {0}")]
    Connection(String),

    /// A procedure or controller was built with values it cannot accept.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The device did not answer in time.
    #[error("link timeout: {0}")]
    LinkTimeout(String),

    /// Nothing to export, or writing the table failed.
    #[error("export failed: {0}")]
    Export(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
