use std::time::Instant;

use log::{debug, info};

use common::pid::{PiController, SplitRange};
use common::protocol::{DeviceCommand, PwmChannel};
use common::{LabError, Result, SensorValues};

use crate::procedure::RegulationSettings;

/// Preferred controller input, then its fallback.
pub const INPUT_KEYS: [&str; 2] = ["T_TMP", "T_BME"];

pub const KEY_PWM_HEAT: &str = "PWM_HEAT";
pub const KEY_PWM_COOL: &str = "PWM_COOL";
pub const KEY_TARGET: &str = "Target";

/// Closed-loop hook run once per received sample during a regulation run.
#[derive(Debug)]
pub struct Regulator {
    controller: PiController,
    target_c: f64,
    min_target_c: f64,
    max_target_c: f64,
    applied: SplitRange,
}

impl Regulator {
    pub fn new(settings: &RegulationSettings) -> Result<Self> {
        let (min, max) = (settings.min_target_c, settings.max_target_c);
        if !(min.is_finite() && max.is_finite() && min <= max) {
            return Err(LabError::Configuration(format!(
                "regulation target range [{min}, {max}] is unusable"
            )));
        }
        let controller = PiController::new(settings.controller.clone())?;
        let mut regulator = Self {
            controller,
            target_c: settings.target_c,
            min_target_c: settings.min_target_c,
            max_target_c: settings.max_target_c,
            applied: SplitRange::default(),
        };
        regulator.set_target(settings.target_c);
        Ok(regulator)
    }

    pub fn target(&self) -> f64 {
        self.target_c
    }

    /// Clamps into the allowed range and returns the value actually used.
    /// A non-finite request keeps the current target.
    pub fn set_target(&mut self, target_c: f64) -> f64 {
        if target_c.is_finite() {
            self.target_c = target_c.clamp(self.min_target_c, self.max_target_c);
        }
        self.target_c
    }

    /// Forget controller history and the last duty applied to the rig.
    pub fn reset(&mut self) {
        self.controller.reset();
        self.applied = SplitRange::default();
    }

    pub fn applied(&self) -> SplitRange {
        self.applied
    }

    /// Run one control step on `values`.
    ///
    /// Appends the duty and target columns to `values` and returns the PWM
    /// commands to send; a channel is only commanded when its duty changed.
    /// Samples without a usable temperature leave everything untouched.
    pub fn on_sample(&mut self, values: &mut SensorValues, now: Instant) -> Vec<DeviceCommand> {
        let Some(measured) = INPUT_KEYS
            .iter()
            .find_map(|k| values.get(*k).copied().filter(|v| v.is_finite()))
        else {
            debug!("regulation skipped: no temperature in sample");
            return Vec::new();
        };

        let output = self.controller.update_at(self.target_c, measured, now);
        let duty = SplitRange::from_output(output);

        let mut commands = Vec::new();
        if duty.heat != self.applied.heat {
            commands.push(DeviceCommand::SetPwm {
                channel: PwmChannel::Heater,
                percent: duty.heat,
            });
        }
        if duty.cool != self.applied.cool {
            commands.push(DeviceCommand::SetPwm {
                channel: PwmChannel::Cooler,
                percent: duty.cool,
            });
        }
        if !commands.is_empty() {
            info!(
                "regulation: {:.2}°C -> {:.2}°C, heat {}% cool {}%",
                measured, self.target_c, duty.heat, duty.cool
            );
        }
        self.applied = duty;

        values.insert(KEY_PWM_HEAT.to_string(), f64::from(duty.heat));
        values.insert(KEY_PWM_COOL.to_string(), f64::from(duty.cool));
        values.insert(KEY_TARGET.to_string(), self.target_c);
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::pid::PiSettings;
    use std::time::Duration;

    fn settings(target_c: f64) -> RegulationSettings {
        RegulationSettings {
            target_c,
            min_target_c: 18.0,
            max_target_c: 40.0,
            controller: PiSettings::default(),
        }
    }

    fn reading(key: &str, value: f64) -> SensorValues {
        [(key.to_string(), value)].into_iter().collect()
    }

    #[test]
    fn target_is_clamped_on_creation_and_update() {
        let mut regulator = Regulator::new(&settings(55.0)).unwrap();
        assert_eq!(regulator.target(), 40.0);
        assert_eq!(regulator.set_target(3.0), 18.0);
        assert_eq!(regulator.set_target(27.5), 27.5);
    }

    #[test]
    fn unusable_target_range_is_rejected() {
        for (min, max) in [(f64::NAN, 40.0), (18.0, f64::INFINITY), (40.0, 18.0)] {
            let bad = RegulationSettings {
                min_target_c: min,
                max_target_c: max,
                ..settings(25.0)
            };
            assert!(matches!(Regulator::new(&bad), Err(LabError::Configuration(_))));
        }
        let mut regulator = Regulator::new(&settings(25.0)).unwrap();
        assert_eq!(regulator.set_target(f64::NAN), 25.0);
    }

    #[test]
    fn non_finite_reading_does_not_disable_control() {
        let mut regulator = Regulator::new(&settings(25.0)).unwrap();
        let t0 = Instant::now();
        regulator.on_sample(&mut reading("T_BME", 20.0), t0);
        regulator.on_sample(&mut reading("T_BME", f64::INFINITY), t0 + Duration::from_secs(1));

        let mut values = reading("T_BME", 20.0);
        regulator.on_sample(&mut values, t0 + Duration::from_secs(2));
        assert!(regulator.applied().heat > 0);
        assert_eq!(regulator.applied().cool, 0);
        assert!(values[KEY_PWM_HEAT] > 0.0);
    }

    #[test]
    fn first_sample_annotates_without_commanding() {
        let mut regulator = Regulator::new(&settings(30.0)).unwrap();
        let mut values = reading("T_TMP", 20.0);
        let commands = regulator.on_sample(&mut values, Instant::now());

        assert!(commands.is_empty());
        assert_eq!(values[KEY_PWM_HEAT], 0.0);
        assert_eq!(values[KEY_PWM_COOL], 0.0);
        assert_eq!(values[KEY_TARGET], 30.0);
    }

    #[test]
    fn commands_only_change_in_duty() {
        let mut regulator = Regulator::new(&settings(30.0)).unwrap();
        let t0 = Instant::now();
        regulator.on_sample(&mut reading("T_TMP", 20.0), t0);

        let mut values = reading("T_TMP", 20.0);
        let commands = regulator.on_sample(&mut values, t0 + Duration::from_secs(1));
        assert_eq!(
            commands,
            vec![DeviceCommand::SetPwm { channel: PwmChannel::Heater, percent: 100 }]
        );
        assert_eq!(values[KEY_PWM_HEAT], 100.0);

        // still saturated: nothing new to send
        let commands = regulator.on_sample(&mut reading("T_TMP", 20.0), t0 + Duration::from_secs(2));
        assert!(commands.is_empty());
        assert_eq!(regulator.applied(), SplitRange { heat: 100, cool: 0 });
    }

    #[test]
    fn switching_to_cooling_commands_both_channels() {
        let mut regulator = Regulator::new(&settings(30.0)).unwrap();
        let t0 = Instant::now();
        regulator.on_sample(&mut reading("T_TMP", 20.0), t0);
        regulator.on_sample(&mut reading("T_TMP", 20.0), t0 + Duration::from_secs(1));

        regulator.reset();
        regulator.set_target(18.0);
        regulator.on_sample(&mut reading("T_TMP", 35.0), t0 + Duration::from_secs(2));
        // history is gone, so the restart re-sends nothing until a real step
        assert_eq!(regulator.applied(), SplitRange::default());
        let commands = regulator.on_sample(&mut reading("T_TMP", 35.0), t0 + Duration::from_secs(3));
        assert_eq!(
            commands,
            vec![DeviceCommand::SetPwm { channel: PwmChannel::Cooler, percent: 100 }]
        );
    }

    #[test]
    fn falls_back_to_bme_and_skips_samples_without_temperature() {
        let mut regulator = Regulator::new(&settings(25.0)).unwrap();
        let mut values = reading("T_BME", 24.0);
        regulator.on_sample(&mut values, Instant::now());
        assert!(values.contains_key(KEY_TARGET));

        let mut values = reading("V_ADS_R", 1.5);
        assert!(regulator.on_sample(&mut values, Instant::now()).is_empty());
        assert_eq!(values.len(), 1);
    }
}
