use std::fmt;
use std::time::Duration;

use common::config::TimingConfig;
use common::pid::PiSettings;
use common::protocol::{DeviceCommand, PwmChannel};
use common::{LabError, Result};

/// Used when nothing more specific is known about a run's length.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(60);

const MAX_RATE_HZ: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcedureKind {
    Streaming,
    Slow,
    Resistive,
    TimeResponse,
    Regulation,
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcedureKind::Streaming => "Short capture",
            ProcedureKind::Slow => "Slow capture",
            ProcedureKind::Resistive => "Resistive sensors",
            ProcedureKind::TimeResponse => "Time response",
            ProcedureKind::Regulation => "Temperature regulation",
        };
        f.write_str(name)
    }
}

/// Actuator output applied before the run starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PwmPreset {
    pub channel: u8,
    pub percent: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegulationSettings {
    pub target_c: f64,
    pub min_target_c: f64,
    pub max_target_c: f64,
    pub controller: PiSettings,
}

/// Everything that distinguishes one measurement procedure from another.
///
/// The generic lifecycle lives in the engine; a procedure only selects
/// which optional capabilities it uses: device setup before the run,
/// actuator shutdown after it, and closed-loop regulation per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Procedure {
    pub kind: ProcedureKind,
    pub duration: Duration,
    /// `SET RATE` is only sent for a positive rate.
    pub sample_rate_hz: Option<f64>,
    pub no_data_timeout: Duration,
    pub heartbeat: Option<Duration>,
    pub pwm_preset: Option<PwmPreset>,
    pub adc_filter: Option<bool>,
    /// Force both actuator channels to zero after `STOP`.
    pub zero_actuators_on_stop: bool,
    pub regulation: Option<RegulationSettings>,
}

impl Procedure {
    fn base(kind: ProcedureKind, duration_s: u64, rate_hz: f64) -> Self {
        let timing = TimingConfig::default();
        Self {
            kind,
            duration: Duration::from_secs(duration_s),
            sample_rate_hz: Some(rate_hz),
            no_data_timeout: timing.no_data_timeout(),
            heartbeat: Some(timing.heartbeat()),
            pwm_preset: None,
            adc_filter: None,
            zero_actuators_on_stop: false,
            regulation: None,
        }
    }

    pub fn streaming() -> Self {
        Self::base(ProcedureKind::Streaming, 11, 1.0)
    }

    pub fn slow() -> Self {
        Self::base(ProcedureKind::Slow, 120, 0.5)
    }

    pub fn resistive(pwm_channel: u8, pwm_percent: u8, adc_filter: bool) -> Self {
        Self {
            pwm_preset: Some(PwmPreset {
                channel: pwm_channel,
                percent: pwm_percent,
            }),
            adc_filter: Some(adc_filter),
            zero_actuators_on_stop: true,
            ..Self::base(ProcedureKind::Resistive, 3600, 1.0)
        }
    }

    /// Like [`Procedure::resistive`] but with the ADC filter always off.
    pub fn time_response(pwm_channel: u8, pwm_percent: u8) -> Self {
        Self {
            kind: ProcedureKind::TimeResponse,
            duration: Duration::from_secs(600),
            ..Self::resistive(pwm_channel, pwm_percent, false)
        }
    }

    pub fn regulation(target_c: f64, controller: PiSettings) -> Self {
        Self {
            zero_actuators_on_stop: true,
            regulation: Some(RegulationSettings {
                target_c,
                min_target_c: 18.0,
                max_target_c: 40.0,
                controller,
            }),
            ..Self::base(ProcedureKind::Regulation, 3600, 1.0)
        }
    }

    /// Only meaningful for regulation; other procedures are returned unchanged.
    pub fn with_target_range(mut self, min_c: f64, max_c: f64) -> Self {
        if let Some(regulation) = self.regulation.as_mut() {
            regulation.min_target_c = min_c;
            regulation.max_target_c = max_c;
        }
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_sample_rate(mut self, rate_hz: Option<f64>) -> Self {
        self.sample_rate_hz = rate_hz;
        self
    }

    pub fn with_no_data_timeout(mut self, timeout: Duration) -> Self {
        self.no_data_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Option<Duration>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Apply the configured watchdog and heartbeat periods.
    pub fn with_timing(self, timing: &TimingConfig) -> Self {
        let heartbeat = (timing.heartbeat_ms > 0).then(|| timing.heartbeat());
        self.with_no_data_timeout(timing.no_data_timeout())
            .with_heartbeat(heartbeat)
    }

    pub fn validate(&self) -> Result<()> {
        let reject = |msg: String| Err(LabError::Configuration(format!("{}: {}", self.kind, msg)));

        if self.duration.is_zero() {
            return reject("duration must be positive".into());
        }
        if self.no_data_timeout.is_zero() {
            return reject("no-data timeout must be positive".into());
        }
        if self.heartbeat.is_some_and(|h| h.is_zero()) {
            return reject("heartbeat period must be positive".into());
        }
        if let Some(rate) = self.sample_rate_hz {
            if !rate.is_finite() || rate > MAX_RATE_HZ {
                return reject(format!("sample rate {rate} Hz outside (0, {MAX_RATE_HZ}]"));
            }
        }
        if let Some(preset) = self.pwm_preset {
            if PwmChannel::from_index(preset.channel).is_none() {
                return reject(format!("unknown PWM channel {}", preset.channel));
            }
            if preset.percent > 100 {
                return reject(format!("PWM value {}% above 100%", preset.percent));
            }
        }
        if let Some(regulation) = &self.regulation {
            if !regulation.target_c.is_finite() {
                return reject("regulation target must be a finite temperature".into());
            }
            let (min, max) = (regulation.min_target_c, regulation.max_target_c);
            if !(min.is_finite() && max.is_finite() && min <= max) {
                return reject(format!("regulation target range [{min}, {max}] is unusable"));
            }
            regulation.controller.validate()?;
        }
        Ok(())
    }

    /// Commands sent before the generic `SET RATE` / `START` sequence.
    pub fn setup_commands(&self) -> Vec<DeviceCommand> {
        let mut commands = Vec::new();
        if let Some(preset) = self.pwm_preset {
            if let Some(channel) = PwmChannel::from_index(preset.channel) {
                commands.push(DeviceCommand::SetPwm {
                    channel,
                    percent: preset.percent,
                });
            }
        }
        if let Some(on) = self.adc_filter {
            commands.push(DeviceCommand::SetFilter(on));
        }
        commands
    }

    /// Commands sent after `STOP`.
    pub fn safety_commands(&self) -> Vec<DeviceCommand> {
        if !self.zero_actuators_on_stop {
            return Vec::new();
        }
        [PwmChannel::Heater, PwmChannel::Cooler]
            .into_iter()
            .map(|channel| DeviceCommand::SetPwm { channel, percent: 0 })
            .collect()
    }

    pub fn effective_rate(&self) -> Option<f64> {
        self.sample_rate_hz.filter(|r| *r > 0.0)
    }
}
