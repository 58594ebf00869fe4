mod menu;

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use tokio::runtime::Runtime;

use common::config::load_config;
use common::LabConfig;
use engine::{FinishReason, Procedure, RunEvent, Session};
use link::{RigConfig, SimulatedRig};

const DEFAULT_CONFIG: &str = "configs/lab.toml";

struct Console {
    rt: Runtime,
    session: Session,
    // keeps the simulated rig alive while it is the connected device
    rig: Option<SimulatedRig>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let config = if Path::new(&config_path).exists() {
        load_config(&config_path).with_context(|| format!("loading {config_path}"))?
    } else {
        warn!("{config_path} not found, using built-in defaults");
        LabConfig::default()
    };

    println!("===========================================");
    println!("Welcome to the Thermal Lab Console");
    println!("===========================================");

    let mut console = Console {
        rt: Runtime::new().context("starting async runtime")?,
        session: Session::new(config),
        rig: None,
    };

    loop {
        menu::show_menu(console.session.is_connected());

        match menu::get_user_choice() {
            Ok(1) => console.connect_serial(),
            Ok(2) => console.connect_simulator(),
            Ok(3) => console.run_procedure(),
            Ok(4) => console.export(),
            Ok(5) => console.show_diagnostics(),
            Ok(6) => console.disconnect(),
            Ok(7) => break,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            _ => println!("Invalid choice. Please select 1-7."),
        }
    }

    console.disconnect();
    println!("Goodbye!");
    Ok(())
}

impl Console {
    fn connect_serial(&mut self) {
        println!("\n=== Connect to Serial Port ===");
        let ports = link::available_ports();
        if ports.is_empty() {
            println!("No serial ports detected.");
        } else {
            for (i, port) in ports.iter().enumerate() {
                println!("{}. {}", i + 1, port);
            }
        }

        let fallback = self
            .session
            .config()
            .serial
            .port
            .clone()
            .or_else(|| ports.first().cloned())
            .unwrap_or_default();
        let answer = menu::prompt_text("Port (name or number)", &fallback);
        let port = answer
            .parse::<usize>()
            .ok()
            .and_then(|n| ports.get(n.wrapping_sub(1)).cloned())
            .unwrap_or(answer);
        if port.is_empty() {
            println!("No port selected.");
            return;
        }

        self.rig = None;
        match self.rt.block_on(self.session.connect(&port)) {
            Ok(_) => self.print_capabilities(),
            Err(e) => println!("Connection failed: {e}"),
        }
    }

    fn connect_simulator(&mut self) {
        println!("\n=== Connect to Simulated Rig ===");
        let ambient = menu::prompt("Ambient temperature (°C)", 22.0);
        let (rig, reader, writer) = SimulatedRig::spawn(RigConfig {
            ambient_c: ambient,
            ..RigConfig::default()
        });

        match self.rt.block_on(self.session.attach(reader, writer)) {
            Ok(_) => {
                self.rig = Some(rig);
                self.print_capabilities();
            }
            Err(e) => println!("Simulated rig did not answer: {e}"),
        }
    }

    fn print_capabilities(&self) {
        println!("Connected. Sensors: {}", self.session.sensor_keys().join(", "));
    }

    fn choose_procedure(&self) -> Option<Procedure> {
        let config = self.session.config();
        menu::show_procedures();
        let procedure = match menu::get_user_choice() {
            Ok(1) => Procedure::streaming(),
            Ok(2) => Procedure::slow(),
            Ok(3) => {
                let channel = menu::prompt("PWM channel (0 heater, 1 cooler)", 0u8);
                let percent = menu::prompt("PWM value (%)", 0u8);
                let filter = menu::confirm("Enable ADC filter?");
                Procedure::resistive(channel, percent, filter)
            }
            Ok(4) => {
                let channel = menu::prompt("PWM channel (0 heater, 1 cooler)", 0u8);
                let percent = menu::prompt("PWM value (%)", 50u8);
                Procedure::time_response(channel, percent)
            }
            Ok(5) => {
                let regulation = &config.regulation;
                let target = menu::prompt("Target temperature (°C)", regulation.target_c);
                let clamped = regulation.clamp_target(target);
                if clamped != target {
                    println!("Target limited to {clamped:.1} °C");
                }
                Procedure::regulation(clamped, config.controller.clone())
                    .with_target_range(regulation.min_target_c, regulation.max_target_c)
            }
            _ => {
                println!("Invalid choice.");
                return None;
            }
        };

        let minutes = menu::prompt("Duration in minutes (0 keeps the default)", 0.0_f64);
        let procedure = procedure.with_timing(&config.timing);
        if minutes > 0.0 && minutes.is_finite() {
            Some(procedure.with_duration(std::time::Duration::from_secs_f64(minutes * 60.0)))
        } else {
            Some(procedure)
        }
    }

    fn run_procedure(&mut self) {
        println!("\n=== Run a Procedure ===");
        if !self.session.is_connected() {
            println!("Connect to a rig first.");
            return;
        }
        let Some(procedure) = self.choose_procedure() else {
            return;
        };

        println!(
            "Running {} for {:.0} s. Press Ctrl-C to stop early.",
            procedure.kind,
            procedure.duration.as_secs_f64()
        );
        let session = &mut self.session;
        let outcome = self.rt.block_on(async {
            let mut events = match session.start(procedure).await {
                Ok(events) => events,
                Err(e) => return Err(e),
            };
            let mut samples = 0usize;
            let mut last_decile = 0u32;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(RunEvent::Data { t_s, values }) => {
                            samples += 1;
                            let line: Vec<String> = values
                                .iter()
                                .map(|(k, v)| format!("{k}={v:.2}"))
                                .collect();
                            println!("[{t_s:>8.3}s] {}", line.join("  "));
                        }
                        Some(RunEvent::Progress(fraction)) => {
                            let decile = (fraction * 10.0).floor() as u32;
                            if decile > last_decile {
                                last_decile = decile;
                                println!("-- {:>3.0}% --", fraction * 100.0);
                            }
                        }
                        Some(RunEvent::DeviceFault(msg)) => println!("!! Device error: {msg}"),
                        Some(RunEvent::Finished(reason)) => return Ok((reason, samples)),
                        None => return Ok((FinishReason::Stopped, samples)),
                    },
                    _ = tokio::signal::ctrl_c() => {
                        println!("\nStopping...");
                        session.stop();
                    }
                }
            }
        });

        match outcome {
            Ok((reason, samples)) => {
                let summary = match reason {
                    FinishReason::Completed => "completed",
                    FinishReason::Stopped => "stopped",
                    FinishReason::DataTimeout => "aborted: rig stopped sending data, link closed",
                    FinishReason::LinkUnavailable => "aborted: link not available",
                };
                println!("Run {summary}. {samples} samples recorded.");
            }
            Err(e) => println!("Could not start run: {e}"),
        }
        menu::wait_for_enter();
    }

    fn export(&self) {
        println!("\n=== Export Last Run ===");
        let path = menu::prompt_text("Output file", "measurement.csv");
        let columns = menu::prompt_text("Columns to keep (comma separated, empty for all)", "");
        let allowed: BTreeSet<String> = columns
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        let allowed = (!allowed.is_empty()).then_some(&allowed);

        if self.session.export(&path, allowed) {
            println!("Saved {path}.");
        } else {
            println!("Nothing exported (see log).");
        }
    }

    fn show_diagnostics(&self) {
        let d = self.session.diagnostics().snapshot();
        println!("\n=== Link Diagnostics ===");
        println!("- Lines received: {}", d.lines_received);
        println!("- Unrecognised lines: {}", d.protocol_anomalies);
        println!("- Device errors: {}", d.device_faults);
        println!("- Link timeouts: {}", d.link_timeouts);
        println!("- Read errors: {}", d.read_errors);
        if let Some(rig) = &self.rig {
            let state = rig.state();
            println!(
                "- Simulated rig: {:.2} °C, heater {}%, cooler {}%",
                state.temperature_c, state.heater, state.cooler
            );
        }
    }

    fn disconnect(&mut self) {
        self.session.disconnect();
        self.rig = None;
    }
}
