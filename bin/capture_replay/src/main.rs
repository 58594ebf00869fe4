use std::collections::BTreeMap;
use std::env;
use std::fs;

use anyhow::{bail, Context, Result};
use criterion::{black_box, Criterion};
use log::{info, warn};

use common::config::{load_config, ExportConfig};
use common::protocol::{decode_line, DeviceCapabilities, Message};
use common::{RecordedDataset, SensorSample, TimeBasis};

/// What a capture contained, line by line.
#[derive(Default)]
struct Replay {
    lines: usize,
    acks: usize,
    unrecognised: usize,
    device_errors: Vec<String>,
    capabilities: Option<DeviceCapabilities>,
    dataset: RecordedDataset,
}

/// Decode a captured session. Frames without a device timestamp are placed
/// at `index / rate_hz`.
fn replay<'a>(lines: impl IntoIterator<Item = &'a str>, rate_hz: f64) -> Replay {
    let mut result = Replay {
        dataset: RecordedDataset::new(),
        ..Replay::default()
    };
    let mut basis = TimeBasis::default();
    let mut frames = 0usize;

    for line in lines.into_iter().map(str::trim).filter(|l| !l.is_empty()) {
        result.lines += 1;
        match decode_line(line) {
            Some(Message::Data(frame)) if !frame.values.is_empty() => {
                let host_s = frames as f64 / rate_hz;
                let t_s = basis.elapsed_s(frame.t_ms, host_s);
                result.dataset.record(SensorSample {
                    t_s,
                    values: frame.values,
                });
                frames += 1;
            }
            Some(Message::Data(_)) => result.unrecognised += 1,
            Some(Message::Hello(caps)) => result.capabilities = Some(caps),
            Some(Message::Ack) => result.acks += 1,
            Some(Message::Error(msg)) => result.device_errors.push(msg),
            Some(Message::Unknown(_)) | None => result.unrecognised += 1,
        }
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ColumnStats {
    count: usize,
    min: f64,
    max: f64,
    mean: f64,
}

fn column_stats(samples: &[SensorSample]) -> BTreeMap<String, ColumnStats> {
    let mut sums: BTreeMap<String, (usize, f64, f64, f64)> = BTreeMap::new();
    for (key, value) in samples.iter().flat_map(|s| s.values.iter()) {
        let entry = sums
            .entry(key.clone())
            .or_insert((0, f64::INFINITY, f64::NEG_INFINITY, 0.0));
        entry.0 += 1;
        entry.1 = entry.1.min(*value);
        entry.2 = entry.2.max(*value);
        entry.3 += value;
    }
    sums.into_iter()
        .map(|(key, (count, min, max, total))| {
            (key, ColumnStats { count, min, max, mean: total / count as f64 })
        })
        .collect()
}

fn print_summary(path: &str, replay: &Replay) {
    let samples = replay.dataset.snapshot();

    println!("\n=== {} ===", path);
    println!("Lines: {}", replay.lines);
    println!("Samples: {}", samples.len());
    println!("Acks: {}", replay.acks);
    println!("Unrecognised: {}", replay.unrecognised);
    if let Some(caps) = replay.capabilities {
        println!("Announced sensors: {}", caps.sensor_keys().join(", "));
    }
    if let Some(last) = samples.last() {
        println!("Span: {:.3} s", last.t_s);
    }
    for msg in &replay.device_errors {
        println!("Device error: {}", msg);
    }

    let stats = column_stats(&samples);
    if !stats.is_empty() {
        println!("\n{:<12} {:>6} {:>10} {:>10} {:>10}", "column", "n", "min", "mean", "max");
        for (key, s) in stats {
            println!(
                "{:<12} {:>6} {:>10.3} {:>10.3} {:>10.3}",
                key, s.count, s.min, s.mean, s.max
            );
        }
    }
}

fn benchmark_decode(c: &mut Criterion, lines: &[String]) {
    c.bench_function("decode_line", |b| {
        b.iter(|| {
            for line in lines {
                black_box(decode_line(black_box(line)));
            }
        });
    });
}

fn benchmark_replay(c: &mut Criterion, lines: &[String], rate_hz: f64) {
    c.bench_function("replay_capture", |b| {
        b.iter(|| {
            let replay = replay(lines.iter().map(String::as_str), black_box(rate_hz));
            black_box(replay.dataset.len());
        });
    });
}

struct Args {
    capture: String,
    export: Option<String>,
    config: Option<String>,
    rate_hz: f64,
    criterion: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = env::args().skip(1);
    let mut parsed = Args {
        capture: String::new(),
        export: None,
        config: None,
        rate_hz: 1.0,
        criterion: false,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--export" => parsed.export = Some(args.next().context("--export needs a path")?),
            "--config" => parsed.config = Some(args.next().context("--config needs a path")?),
            "--rate" => {
                let value = args.next().context("--rate needs a value")?;
                parsed.rate_hz = value.parse().with_context(|| format!("bad rate {value:?}"))?;
            }
            "--criterion" => parsed.criterion = true,
            other if parsed.capture.is_empty() => parsed.capture = other.to_string(),
            other => bail!("unexpected argument {other:?}"),
        }
    }
    if parsed.capture.is_empty() {
        bail!("no capture file given");
    }
    if !(parsed.rate_hz.is_finite() && parsed.rate_hz > 0.0) {
        bail!("rate must be positive");
    }
    Ok(parsed)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Usage: capture_replay <capture_file> [--rate HZ] [--config FILE] [--export OUT.csv] [--criterion]");
            eprintln!("Example: capture_replay logs/session.txt --export session.csv");
            std::process::exit(1);
        }
    };

    let text = fs::read_to_string(&args.capture)
        .with_context(|| format!("reading {}", args.capture))?;
    let lines: Vec<String> = text.lines().map(str::to_string).collect();
    info!("Replaying {} lines from {}", lines.len(), args.capture);

    let result = replay(lines.iter().map(String::as_str), args.rate_hz);
    print_summary(&args.capture, &result);

    if let Some(out) = &args.export {
        let format = match &args.config {
            Some(path) => load_config(path).with_context(|| format!("loading {path}"))?.export,
            None => ExportConfig::default(),
        };
        if !result.dataset.export_csv(out, None, &format) {
            warn!("Nothing written to {}", out);
        }
    }

    if args.criterion {
        println!("\nRunning decode benchmarks...");
        let mut criterion = Criterion::default()
            .sample_size(20)
            .measurement_time(std::time::Duration::from_secs(5));
        benchmark_decode(&mut criterion, &lines);
        benchmark_replay(&mut criterion, &lines, args.rate_hz);
        println!("Check the target/criterion directory for detailed HTML reports.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPTURE: &str = r#"
{"type":"hello","device":"rig","bme":true,"tmp":true,"adc":false,"dallas":1}
{"type":"ack","cmd":"start"}
{"type":"data","t_ms":10500,"T_BME":22.5,"T_TMP":22.25,"T_DS0":22.0}
garbage line
{"type":"data","t_ms":11500,"T_BME":22.75,"T_TMP":22.5,"T_DS0":22.0}
{"type":"error","msg":"dallas_missing"}
{"type":"data","t_ms":12500,"T_BME":23.0}
"#;

    #[test]
    fn replay_classifies_every_line() {
        let result = replay(CAPTURE.lines(), 1.0);
        assert_eq!(result.lines, 7);
        assert_eq!(result.acks, 1);
        assert_eq!(result.unrecognised, 1);
        assert_eq!(result.device_errors, vec!["dallas_missing".to_string()]);
        assert_eq!(result.capabilities.map(|c| c.dallas), Some(1));

        let times: Vec<f64> = result.dataset.snapshot().iter().map(|s| s.t_s).collect();
        assert_eq!(times, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn legacy_capture_is_spaced_by_rate() {
        let result = replay(["T_BME=20.0", "T_BME=20.5", "T_BME=21.0"], 2.0);
        let times: Vec<f64> = result.dataset.snapshot().iter().map(|s| s.t_s).collect();
        assert_eq!(times, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn stats_cover_each_column_separately() {
        let result = replay(CAPTURE.lines(), 1.0);
        let stats = column_stats(&result.dataset.snapshot());
        assert_eq!(stats["T_BME"].count, 3);
        assert_eq!(stats["T_BME"].min, 22.5);
        assert_eq!(stats["T_BME"].max, 23.0);
        assert_eq!(stats["T_DS0"].count, 2);
        assert_eq!(stats["T_DS0"].mean, 22.0);
    }
}
