//! Measurement runs on top of a [`link::Transport`].
//!
//! A [`Session`] owns the link and hands each [`Procedure`] to a fresh
//! [`MeasurementEngine`], which reports back through a [`RunEvent`] channel.

pub mod engine;
pub mod procedure;
pub mod regulation;
pub mod session;

pub use engine::{EngineTiming, FinishReason, MeasurementEngine, RunEvent, RunState};
pub use procedure::{Procedure, ProcedureKind, DEFAULT_DURATION};
pub use session::Session;
