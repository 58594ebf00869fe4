//! Software model of the rig firmware, for running the host without hardware.
//!
//! Speaks the same line protocol as the microcontroller: announces itself with
//! `hello`, streams `data` at the configured rate while started, acknowledges
//! commands, and drops both actuators when no command arrived for
//! [`RigConfig::safety_timeout`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info};
use serde_json::{json, Map, Value};

use common::protocol::{DeviceCommand, PwmChannel};

use crate::mock::{mock_link, MockDevice};
use crate::transport::{ByteReader, ByteWriter};

const TICK: Duration = Duration::from_millis(10);
const MAX_RATE_HZ: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct RigConfig {
    pub bme: bool,
    pub tmp: bool,
    pub adc: bool,
    pub dallas: u32,
    pub ambient_c: f64,
    /// Device uptime at attach; data timestamps never start at zero.
    pub boot_ms: u64,
    pub safety_timeout: Duration,
    pub send_hello: bool,
    /// Accept commands but never stream samples.
    pub mute_data: bool,
    /// Degrees per second at 100 % duty.
    pub heater_rate: f64,
    pub cooler_rate: f64,
    /// Time constant of the passive drift toward ambient, seconds.
    pub ambient_tau_s: f64,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            bme: true,
            tmp: true,
            adc: true,
            dallas: 2,
            ambient_c: 22.0,
            boot_ms: 4_250,
            safety_timeout: Duration::from_secs(3),
            send_hello: true,
            mute_data: false,
            heater_rate: 0.2,
            cooler_rate: 0.15,
            ambient_tau_s: 120.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RigState {
    pub running: bool,
    pub rate_hz: f64,
    pub heater: u8,
    pub cooler: u8,
    pub filter: bool,
    pub temperature_c: f64,
    pub samples_sent: u64,
    pub commands: Vec<String>,
}

/// Handle to a running simulated rig. Dropping it stops the simulation and
/// looks like a hang-up to the host.
pub struct SimulatedRig {
    state: Arc<Mutex<RigState>>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedRig {
    pub fn spawn(config: RigConfig) -> (Self, ByteReader, ByteWriter) {
        let (device, reader, writer) = mock_link();
        let state = Arc::new(Mutex::new(RigState {
            running: false,
            rate_hz: 1.0,
            heater: 0,
            cooler: 0,
            filter: true,
            temperature_c: config.ambient_c,
            samples_sent: 0,
            commands: Vec::new(),
        }));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("simulated-rig".into())
                .spawn(move || run_rig(config, device, state, shutdown))
                .ok()
        };

        (
            Self {
                state,
                shutdown,
                thread,
            },
            reader,
            writer,
        )
    }

    pub fn state(&self) -> RigState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimulatedRig {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_rig(
    config: RigConfig,
    device: MockDevice,
    state: Arc<Mutex<RigState>>,
    shutdown: Arc<AtomicBool>,
) {
    let boot = Instant::now();
    let uptime_ms = || config.boot_ms + boot.elapsed().as_millis() as u64;
    let mut last_command = Instant::now();
    let mut next_sample = Instant::now();
    let mut next_tick = Instant::now();
    let mut cycle: u64 = 0;

    if config.send_hello {
        device.send_line(&hello(&config).to_string());
    }
    info!("Simulated rig up (ambient {:.1} C)", config.ambient_c);

    while !shutdown.load(Ordering::Relaxed) && !device.host_disconnected() {
        next_tick += TICK;
        if let Some(wait) = next_tick.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }

        let Ok(mut rig) = state.lock() else {
            break;
        };

        for line in device.written_lines() {
            last_command = Instant::now();
            rig.commands.push(line.clone());
            match DeviceCommand::parse(&line) {
                Some(command) => apply(&mut rig, command, &device, &mut next_sample),
                None => debug!("rig: ignoring {:?}", line),
            }
        }

        if rig.running && last_command.elapsed() > config.safety_timeout {
            info!("Simulated rig: command watchdog expired, actuators off");
            rig.running = false;
            rig.heater = 0;
            rig.cooler = 0;
        }

        let dt = TICK.as_secs_f64();
        let drift = (config.ambient_c - rig.temperature_c) / config.ambient_tau_s;
        let drive = config.heater_rate * f64::from(rig.heater) / 100.0
            - config.cooler_rate * f64::from(rig.cooler) / 100.0;
        rig.temperature_c += (drift + drive) * dt;

        if rig.running && !config.mute_data && Instant::now() >= next_sample {
            next_sample += Duration::from_secs_f64(1.0 / rig.rate_hz);
            device.send_line(&sample(&config, &rig, uptime_ms(), cycle).to_string());
            rig.samples_sent += 1;
            cycle += 1;
        }
    }
}

fn apply(rig: &mut RigState, command: DeviceCommand, device: &MockDevice, next_sample: &mut Instant) {
    match command {
        DeviceCommand::Start => {
            rig.running = true;
            *next_sample = Instant::now();
            device.send_line(r#"{"type":"ack","cmd":"start"}"#);
        }
        DeviceCommand::Stop => {
            rig.running = false;
            rig.heater = 0;
            rig.cooler = 0;
            device.send_line(r#"{"type":"ack","cmd":"stop"}"#);
        }
        DeviceCommand::SetRate(hz) if hz > 0.0 && hz <= MAX_RATE_HZ => {
            rig.rate_hz = hz;
            device.send_line(&json!({"type": "ack", "cmd": "set_rate", "rate_hz": hz}).to_string());
        }
        DeviceCommand::SetRate(_) => {
            device.send_line(r#"{"type":"error","msg":"invalid_rate"}"#);
        }
        DeviceCommand::SetPwm { channel, percent } => {
            let percent = percent.min(100);
            match channel {
                PwmChannel::Heater => rig.heater = percent,
                PwmChannel::Cooler => rig.cooler = percent,
            }
            device.send_line(r#"{"type":"ack","cmd":"set_pwm"}"#);
        }
        DeviceCommand::SetFilter(on) => {
            rig.filter = on;
            device.send_line(r#"{"type":"ack","cmd":"set_filter"}"#);
        }
        DeviceCommand::Ping => {}
    }
}

fn hello(config: &RigConfig) -> Value {
    json!({
        "type": "hello",
        "device": "temp-lab-sim",
        "bme": config.bme,
        "dallas": config.dallas,
        "adc": config.adc,
        "tmp": config.tmp,
    })
}

fn sample(config: &RigConfig, rig: &RigState, t_ms: u64, cycle: u64) -> Value {
    let noise = |phase: f64| (cycle as f64 * 0.7 + phase).sin() * 0.02;
    let t = rig.temperature_c;

    let mut fields = Map::new();
    fields.insert("type".into(), json!("data"));
    fields.insert("t_ms".into(), json!(t_ms));
    if config.bme {
        fields.insert("T_BME".into(), json!(t + 0.3 + noise(0.0)));
    }
    if config.tmp {
        fields.insert("T_TMP".into(), json!(t + noise(1.0)));
    }
    if config.adc {
        // NTC divider: voltage falls as temperature rises
        let smoothing = if rig.filter { 0.2 } else { 1.0 };
        let v_ntc = 1.65 - 0.012 * (t - 25.0) + noise(2.0) * smoothing;
        fields.insert("V_ADS_NTC".into(), json!(v_ntc));
        fields.insert("V_ADS_R".into(), json!(3.3 - v_ntc));
        fields.insert("V_ESP_NTC".into(), json!(v_ntc + noise(3.0) * 5.0));
        fields.insert("V_ESP_R".into(), json!(3.3 - v_ntc + noise(4.0) * 5.0));
    }
    for i in 0..config.dallas {
        fields.insert(format!("T_DS{i}"), json!(t - 0.1 * f64::from(i) + noise(5.0 + f64::from(i))));
    }
    Value::Object(fields)
}
