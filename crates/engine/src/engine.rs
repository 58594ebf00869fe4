use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, sleep_until};

use common::config::TimingConfig;
use common::protocol::{decode_line, DataFrame, DeviceCommand, Message};
use common::{
    LabError, RecordedDataset, Result, SensorSample, SensorValues, SharedDiagnostics, TimeBasis,
};
use link::{LineConsumer, SharedConsumer, Transport};

use crate::procedure::Procedure;
use crate::regulation::Regulator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Stopped from the foreground.
    Stopped,
    /// The procedure ran for its full duration.
    Completed,
    /// No sample arrived within the no-data timeout; the link was closed.
    DataTimeout,
    /// The run was started without an open link.
    LinkUnavailable,
}

/// Notifications delivered to the foreground, in order.
/// `Finished` is always the last event of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Data { t_s: f64, values: SensorValues },
    /// Fraction of the planned duration, in `[0, 1]`.
    Progress(f64),
    DeviceFault(String),
    Finished(FinishReason),
}

/// Pauses the engine itself needs, independent of any procedure.
#[derive(Debug, Clone, Copy)]
pub struct EngineTiming {
    pub settle: Duration,
    pub poll: Duration,
}

impl Default for EngineTiming {
    fn default() -> Self {
        let timing = TimingConfig::default();
        Self {
            settle: timing.settle(),
            poll: timing.watchdog_poll(),
        }
    }
}

impl TryFrom<&TimingConfig> for EngineTiming {
    type Error = LabError;

    fn try_from(timing: &TimingConfig) -> Result<Self> {
        timing.validate()?;
        let engine_timing = Self {
            settle: timing.settle(),
            poll: timing.watchdog_poll(),
        };
        engine_timing.validate()?;
        Ok(engine_timing)
    }
}

impl EngineTiming {
    /// A zero poll interval would turn the watchdog into a busy loop.
    pub fn validate(&self) -> Result<()> {
        if self.poll.is_zero() {
            return Err(LabError::Configuration("watchdog poll interval must be positive".into()));
        }
        Ok(())
    }
}

/// Drives one procedure: device setup, sample collection, watchdog and
/// shutdown. Clones share the same run.
#[derive(Clone)]
pub struct MeasurementEngine {
    core: Arc<EngineCore>,
}

struct EngineCore {
    procedure: Procedure,
    transport: Transport,
    diagnostics: Arc<SharedDiagnostics>,
    timing: EngineTiming,
    dataset: RecordedDataset,
    events: UnboundedSender<RunEvent>,
    run: Mutex<RunInner>,
    // Held while run-scoped commands go out, so nothing follows STOP and the
    // safety commands. Never taken while holding `run`.
    wire: Mutex<()>,
}

// Everything the reader thread, the watchdog and the foreground all touch.
struct RunInner {
    state: RunState,
    generation: u64,
    started: Instant,
    last_data: Instant,
    time_basis: TimeBasis,
    regulator: Option<Regulator>,
}

enum Verdict {
    Continue,
    Timeout,
    Complete,
}

impl MeasurementEngine {
    /// Rejects an invalid procedure or timing with a configuration error.
    pub fn new(
        procedure: Procedure,
        transport: Transport,
        timing: EngineTiming,
    ) -> Result<(Self, UnboundedReceiver<RunEvent>)> {
        procedure.validate()?;
        timing.validate()?;
        let regulator = procedure.regulation.as_ref().map(Regulator::new).transpose()?;
        let (events, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let core = EngineCore {
            diagnostics: transport.diagnostics().clone(),
            procedure,
            transport,
            timing,
            dataset: RecordedDataset::new(),
            events,
            run: Mutex::new(RunInner {
                state: RunState::Idle,
                generation: 0,
                started: now,
                last_data: now,
                time_basis: TimeBasis::default(),
                regulator,
            }),
            wire: Mutex::new(()),
        };
        Ok((Self { core: Arc::new(core) }, rx))
    }

    pub fn procedure(&self) -> &Procedure {
        &self.core.procedure
    }

    pub fn duration(&self) -> Duration {
        self.core.procedure.duration
    }

    pub fn dataset(&self) -> RecordedDataset {
        self.core.dataset.clone()
    }

    pub fn state(&self) -> RunState {
        self.core.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Begin a run. Does nothing if one is already in progress.
    ///
    /// Without an open link the run finishes straight away with
    /// [`FinishReason::LinkUnavailable`].
    pub async fn start(&self) {
        let core = &self.core;
        let generation = {
            let mut run = core.lock();
            if run.state != RunState::Idle {
                debug!("start ignored: run already {:?}", run.state);
                return;
            }
            let now = Instant::now();
            run.state = RunState::Running;
            run.generation += 1;
            run.started = now;
            run.last_data = now;
            run.time_basis.reset();
            if let Some(regulator) = run.regulator.as_mut() {
                regulator.reset();
            }
            run.generation
        };
        core.dataset.clear();

        if !core.transport.is_open() {
            warn!("{}: link is not open", core.procedure.kind);
            core.stop(FinishReason::LinkUnavailable);
            return;
        }

        info!(
            "{} started ({}s)",
            core.procedure.kind,
            core.procedure.duration.as_secs_f64()
        );
        core.transport
            .set_line_consumer(Some(core.clone() as SharedConsumer));
        tokio::spawn(watchdog(core.clone(), generation));

        let mut sequence = core.procedure.setup_commands();
        if let Some(rate) = core.procedure.effective_rate() {
            sequence.push(DeviceCommand::SetRate(rate));
        }
        for command in sequence {
            if !core.send_in_run(generation, &[command]) {
                debug!("start sequence abandoned before {command}");
                return;
            }
            sleep(core.timing.settle).await;
        }
        if !core.send_in_run(generation, &[DeviceCommand::Start]) {
            debug!("run ended before START");
        }
    }

    /// End the run. Safe to call at any time and from any thread; only the
    /// first call of a run has an effect.
    pub fn stop(&self) {
        self.core.stop(FinishReason::Stopped);
    }

    /// Clamped into the procedure's range. `None` when the procedure does
    /// not regulate.
    pub fn set_target_temperature(&self, target_c: f64) -> Option<f64> {
        let mut run = self.core.lock();
        let applied = run.regulator.as_mut()?.set_target(target_c);
        info!("regulation target set to {applied:.1}°C");
        Some(applied)
    }

    pub fn target_temperature(&self) -> Option<f64> {
        self.core.lock().regulator.as_ref().map(Regulator::target)
    }

    /// Feed one line as if it came from the link.
    pub fn handle_line(&self, line: &str) {
        self.core.handle_line(line);
    }
}

impl EngineCore {
    fn lock(&self) -> MutexGuard<'_, RunInner> {
        // every writer leaves RunInner consistent, so poisoning is ignored
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, generation: u64) -> bool {
        let run = self.lock();
        run.generation == generation && run.state == RunState::Running
    }

    fn lock_wire(&self) -> MutexGuard<'_, ()> {
        self.wire.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send `commands` only if run `generation` is still running. `stop`
    /// leaves `Running` before it takes the wire, so a `false` here means
    /// STOP is already on its way and these commands must not follow it.
    fn send_in_run(&self, generation: u64, commands: &[DeviceCommand]) -> bool {
        let _wire = self.lock_wire();
        if !self.is_current(generation) {
            return false;
        }
        for command in commands {
            self.transport.send(*command);
        }
        true
    }

    fn stop(self: &Arc<Self>, reason: FinishReason) {
        {
            let mut run = self.lock();
            if run.state != RunState::Running {
                return;
            }
            run.state = RunState::Stopping;
        }

        if self.transport.is_open() {
            let _wire = self.lock_wire();
            self.transport.send(DeviceCommand::Stop);
            for command in self.procedure.safety_commands() {
                self.transport.send(command);
            }
        }
        let me: SharedConsumer = self.clone();
        self.transport.release_line_consumer(&me);

        let mut run = self.lock();
        run.state = RunState::Idle;
        info!(
            "{} finished: {:?}, {} samples",
            self.procedure.kind,
            reason,
            self.dataset.len()
        );
        let _ = self.events.send(RunEvent::Finished(reason));
    }

    /// Returns the actuator commands the sample calls for; the caller sends
    /// them once `run` is released.
    fn record_frame(&self, run: &mut RunInner, frame: DataFrame) -> Vec<DeviceCommand> {
        if frame.values.is_empty() {
            return Vec::new();
        }
        let now = Instant::now();
        run.last_data = now;
        let host_elapsed = now.duration_since(run.started).as_secs_f64();
        let t_s = run.time_basis.elapsed_s(frame.t_ms, host_elapsed);

        let mut values = frame.values;
        let commands = match run.regulator.as_mut() {
            Some(regulator) => regulator.on_sample(&mut values, now),
            None => Vec::new(),
        };

        self.dataset.record(SensorSample {
            t_s,
            values: values.clone(),
        });
        let _ = self.events.send(RunEvent::Data { t_s, values });
        commands
    }

    fn check(&self, generation: u64) -> Option<Verdict> {
        let run = self.lock();
        if run.generation != generation || run.state != RunState::Running {
            return None;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(run.started);
        let fraction =
            (elapsed.as_secs_f64() / self.procedure.duration.as_secs_f64()).clamp(0.0, 1.0);
        let _ = self.events.send(RunEvent::Progress(fraction));

        let verdict = if now.duration_since(run.last_data) > self.procedure.no_data_timeout {
            Verdict::Timeout
        } else if elapsed >= self.procedure.duration {
            Verdict::Complete
        } else {
            Verdict::Continue
        };
        Some(verdict)
    }
}

impl LineConsumer for EngineCore {
    fn handle_line(&self, line: &str) {
        let Some(message) = decode_line(line) else {
            debug!("unrecognised line dropped: {line:?}");
            self.diagnostics.record_anomaly();
            return;
        };

        let mut run = self.lock();
        if run.state != RunState::Running {
            return;
        }
        match message {
            Message::Data(frame) => {
                let generation = run.generation;
                let commands = self.record_frame(&mut run, frame);
                drop(run);
                if !commands.is_empty() && !self.send_in_run(generation, &commands) {
                    debug!("actuator update dropped: run already stopping");
                }
            }
            Message::Error(msg) => {
                warn!("device reported: {msg}");
                self.diagnostics.record_device_fault();
                let _ = self.events.send(RunEvent::DeviceFault(msg));
            }
            Message::Ack => {}
            Message::Hello(_) => debug!("hello during run ignored"),
            Message::Unknown(kind) => debug!("message type {kind:?} ignored"),
        }
    }
}

async fn watchdog(core: Arc<EngineCore>, generation: u64) {
    let mut next_heartbeat = core.procedure.heartbeat.map(|p| Instant::now() + p);
    let mut next_tick = tokio::time::Instant::now();

    loop {
        let Some(verdict) = core.check(generation) else {
            return;
        };

        if let (Some(due), Some(period)) = (next_heartbeat, core.procedure.heartbeat) {
            if Instant::now() >= due {
                core.transport.send(DeviceCommand::Ping);
                next_heartbeat = Some(due + period);
            }
        }

        match verdict {
            Verdict::Continue => {}
            Verdict::Timeout => {
                warn!(
                    "no data for {:.1}s, closing link",
                    core.procedure.no_data_timeout.as_secs_f64()
                );
                core.diagnostics.record_link_timeout();
                core.transport.close();
                core.stop(FinishReason::DataTimeout);
                return;
            }
            Verdict::Complete => {
                core.stop(FinishReason::Completed);
                return;
            }
        }

        next_tick += core.timing.poll;
        sleep_until(next_tick).await;
    }
}
