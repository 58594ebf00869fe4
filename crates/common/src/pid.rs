use std::time::{Duration, Instant};

use log::debug;
use serde::Deserialize;

use crate::error::{LabError, Result};

/// Samples further apart than this are not integrated.
pub const STALE_INPUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct GainSet {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PiSettings {
    pub heat: GainSet,
    pub cool: GainSet,
    pub out_min: f64,
    pub out_max: f64,
    /// Integral accumulates only while |error| is below this.
    pub int_active_threshold: f64,
    /// Integral is held while |error| is below this.
    pub deadband: f64,
    /// Zero a stale integral when the error changes sign against it.
    pub reset_integral_on_reversal: bool,
}

impl Default for PiSettings {
    fn default() -> Self {
        Self {
            heat: GainSet { kp: 30.0, ki: 2.0, kd: 900.0 },
            cool: GainSet { kp: 40.0, ki: 0.4, kd: 800.0 },
            out_min: -100.0,
            out_max: 100.0,
            int_active_threshold: 0.25,
            deadband: 0.0,
            reset_integral_on_reversal: false,
        }
    }
}

impl PiSettings {
    pub fn validate(&self) -> Result<()> {
        let gains = [self.heat, self.cool];
        if gains
            .iter()
            .flat_map(|g| [g.kp, g.ki, g.kd])
            .any(|v| !v.is_finite() || v < 0.0)
        {
            return Err(LabError::Configuration(
                "controller gains must be finite and non-negative".into(),
            ));
        }
        if !(self.out_min.is_finite() && self.out_max.is_finite() && self.out_min < self.out_max) {
            return Err(LabError::Configuration(format!(
                "output range [{}, {}] is empty",
                self.out_min, self.out_max
            )));
        }
        if !(self.deadband >= 0.0 && self.int_active_threshold >= self.deadband) {
            return Err(LabError::Configuration(format!(
                "need 0 <= deadband ({}) <= int_active_threshold ({})",
                self.deadband, self.int_active_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Heat,
    Cool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerState {
    pub integral: f64,
    pub last_sample_time: Option<Instant>,
    pub last_filtered_input: f64,
    pub last_error: f64,
    filter_primed: bool,
}

/// PI controller with derivative braking, split into heat and cool gain sets.
///
/// The output is a signed percentage: positive drives the heater, negative
/// the cooler (see [`SplitRange`]).
#[derive(Debug)]
pub struct PiController {
    settings: PiSettings,
    state: ControllerState,
}

impl PiController {
    pub fn new(settings: PiSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            state: ControllerState::default(),
        })
    }

    pub fn reset(&mut self) {
        self.state = ControllerState::default();
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn settings(&self) -> &PiSettings {
        &self.settings
    }

    pub fn update(&mut self, setpoint: f64, measured: f64) -> f64 {
        self.update_at(setpoint, measured, Instant::now())
    }

    /// A non-finite setpoint or measurement yields 0 and leaves the state untouched.
    pub fn update_at(&mut self, setpoint: f64, measured: f64, now: Instant) -> f64 {
        if !(setpoint.is_finite() && measured.is_finite()) {
            debug!("controller input not finite ({setpoint}, {measured}), skipping step");
            return 0.0;
        }
        let Some(last_time) = self.state.last_sample_time else {
            self.state.last_sample_time = Some(now);
            self.state.last_error = setpoint - measured;
            self.state.last_filtered_input = measured;
            return 0.0;
        };

        if now <= last_time {
            return 0.0;
        }
        let elapsed = now - last_time;
        self.state.last_sample_time = Some(now);
        if elapsed > STALE_INPUT {
            debug!("controller input stale ({:.1}s), skipping step", elapsed.as_secs_f64());
            return 0.0;
        }
        let dt = elapsed.as_secs_f64();

        let previous_input = self.state.last_filtered_input;
        let filtered = if self.state.filter_primed {
            0.5 * measured + 0.5 * previous_input
        } else {
            measured
        };
        self.state.filter_primed = true;
        self.state.last_filtered_input = filtered;

        let error = setpoint - filtered;
        self.state.last_error = error;

        let (mode, gains) = if error > 0.0 {
            (ControlMode::Heat, self.settings.heat)
        } else {
            (ControlMode::Cool, self.settings.cool)
        };

        if self.settings.reset_integral_on_reversal
            && error != 0.0
            && self.state.integral != 0.0
            && error.signum() != self.state.integral.signum()
        {
            self.state.integral = 0.0;
        }

        let magnitude = error.abs();
        let mut accumulated = 0.0;
        if magnitude < self.settings.deadband {
            // hold
        } else if magnitude < self.settings.int_active_threshold {
            accumulated = error * dt;
            self.state.integral += accumulated;
        } else {
            self.state.integral = 0.0;
        }

        let input_rate = (filtered - previous_input) / dt;

        let (p_term, i_term, d_term) = if error == 0.0 {
            (0.0, self.state.integral, 0.0)
        } else {
            (
                gains.kp * error,
                gains.ki * self.state.integral,
                -gains.kd * input_rate,
            )
        };

        let mut output = p_term + i_term + d_term;
        if output > self.settings.out_max {
            output = self.settings.out_max;
            if error > 0.0 {
                self.state.integral -= accumulated;
            }
        } else if output < self.settings.out_min {
            output = self.settings.out_min;
            if error < 0.0 {
                self.state.integral -= accumulated;
            }
        }

        debug!(
            "[{:?}] err={:.3} P={:.1} I={:.1} D={:.1} out={:.0}%",
            mode, error, p_term, i_term, d_term, output
        );
        output
    }
}

/// Heater and cooler duty derived from one signed controller output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitRange {
    pub heat: u8,
    pub cool: u8,
}

impl SplitRange {
    pub fn from_output(output: f64) -> Self {
        let percent = |v: f64| v.abs().round().clamp(0.0, 100.0) as u8;
        if output > 0.0 {
            Self { heat: percent(output), cool: 0 }
        } else {
            Self { heat: 0, cool: percent(output) }
        }
    }
}
