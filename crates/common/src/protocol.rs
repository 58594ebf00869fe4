//! Wire codec for the rig's serial protocol.
//!
//! Device to host: one JSON object per line (`hello`, `data`, `ack`, `error`),
//! with a legacy `KEY=VALUE; ...` text record accepted as a fallback.
//! Host to device: plain text commands, see [`DeviceCommand`].
//!
//! Every decoder here is total: bad input yields `None` or an empty map.

use std::fmt;

use serde_json::{Map, Value};

use crate::SensorValues;

/// A decoded JSON object straight off the wire.
pub type JsonMessage = Map<String, Value>;

/// Marker a legacy text line must contain to count as a data record.
pub const LEGACY_MARKER: &str = "T_BME";

const RESERVED_FIELDS: [&str; 2] = ["type", "t_ms"];

pub fn decode_json(line: &str) -> Option<JsonMessage> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

pub fn decode_legacy(line: &str) -> SensorValues {
    let mut result = SensorValues::new();
    if !line.contains(LEGACY_MARKER) {
        return result;
    }

    for part in line.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() {
            continue;
        }
        // the float parser also accepts "inf", "infinity" and "-nan"
        match value.replace(',', ".").parse::<f64>() {
            Ok(parsed) if parsed.is_finite() => {
                result.insert(key.to_string(), parsed);
            }
            _ => {}
        }
    }
    result
}

/// Numeric sensor fields of a `data` message. Anything else yields an empty map.
pub fn extract_data_values(message: &JsonMessage) -> SensorValues {
    if message_type(message) != Some("data") {
        return SensorValues::new();
    }

    message
        .iter()
        .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
        .filter_map(|(key, value)| match value {
            Value::Number(n) => n.as_f64().map(|v| (key.clone(), v)),
            _ => None,
        })
        .collect()
}

pub fn message_type(message: &JsonMessage) -> Option<&str> {
    message.get("type").and_then(Value::as_str)
}

/// Device timestamp of a message, if it carries a numeric `t_ms`.
pub fn timestamp_ms(message: &JsonMessage) -> Option<f64> {
    message.get("t_ms").and_then(Value::as_f64)
}

/// Capability announcement sent once by the device after connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub bme: bool,
    pub tmp: bool,
    pub adc: bool,
    pub dallas: u32,
}

impl DeviceCapabilities {
    pub fn from_hello(message: &JsonMessage) -> Self {
        Self {
            bme: flag(message.get("bme")),
            tmp: flag(message.get("tmp")),
            adc: flag(message.get("adc")),
            dallas: count(message.get("dallas")),
        }
    }

    /// Sensor keys the device will report in its `data` messages.
    pub fn sensor_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if self.bme {
            keys.push("T_BME".to_string());
        }
        if self.tmp {
            keys.push("T_TMP".to_string());
        }
        if self.adc {
            keys.extend(
                ["V_ADS_R", "V_ADS_NTC", "V_ESP_R", "V_ESP_NTC"]
                    .iter()
                    .map(|k| k.to_string()),
            );
        }
        keys.extend((0..self.dallas).map(|i| format!("T_DS{i}")));
        keys
    }
}

// Firmware revisions disagree on whether flags are JSON booleans or strings.
fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn count(value: Option<&Value>) -> u32 {
    match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// One sample as it came off the wire, before any time basis is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub t_ms: Option<f64>,
    pub values: SensorValues,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(DeviceCapabilities),
    Data(DataFrame),
    Ack,
    Error(String),
    /// Valid JSON object with a type we do not handle.
    Unknown(Option<String>),
}

/// Classify a raw line. `None` means it matched no known scheme.
pub fn decode_line(line: &str) -> Option<Message> {
    if let Some(message) = decode_json(line) {
        let decoded = match message_type(&message) {
            Some("hello") => Message::Hello(DeviceCapabilities::from_hello(&message)),
            Some("data") => Message::Data(DataFrame {
                t_ms: timestamp_ms(&message),
                values: extract_data_values(&message),
            }),
            Some("ack") => Message::Ack,
            Some("error") => Message::Error(
                message
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_string(),
            ),
            other => Message::Unknown(other.map(str::to_string)),
        };
        return Some(decoded);
    }

    let values = decode_legacy(line);
    if values.is_empty() {
        None
    } else {
        Some(Message::Data(DataFrame { t_ms: None, values }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PwmChannel {
    Heater,
    Cooler,
}

impl PwmChannel {
    pub fn index(self) -> u8 {
        match self {
            PwmChannel::Heater => 0,
            PwmChannel::Cooler => 1,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(PwmChannel::Heater),
            1 => Some(PwmChannel::Cooler),
            _ => None,
        }
    }
}

/// Host to device commands. `Display` renders the wire form without the newline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    SetRate(f64),
    Start,
    Stop,
    SetPwm { channel: PwmChannel, percent: u8 },
    SetFilter(bool),
    Ping,
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::SetRate(hz) => write!(f, "SET RATE {hz}"),
            DeviceCommand::Start => write!(f, "START"),
            DeviceCommand::Stop => write!(f, "STOP"),
            DeviceCommand::SetPwm { channel, percent } => {
                write!(f, "SET PWM {} {}", channel.index(), percent)
            }
            DeviceCommand::SetFilter(on) => write!(f, "SET FILTER {}", u8::from(*on)),
            DeviceCommand::Ping => write!(f, "PING"),
        }
    }
}

impl DeviceCommand {
    /// Parse a command line as the firmware would (case-insensitive).
    pub fn parse(line: &str) -> Option<Self> {
        let upper = line.trim().to_ascii_uppercase();
        let mut words = upper.split_whitespace();
        match (words.next()?, words.next()) {
            ("START", None) => Some(DeviceCommand::Start),
            ("STOP", None) => Some(DeviceCommand::Stop),
            ("PING", None) => Some(DeviceCommand::Ping),
            ("SET", Some("RATE")) => words.next()?.parse().ok().map(DeviceCommand::SetRate),
            ("SET", Some("FILTER")) => match words.next()? {
                "0" => Some(DeviceCommand::SetFilter(false)),
                "1" => Some(DeviceCommand::SetFilter(true)),
                _ => None,
            },
            ("SET", Some("PWM")) => {
                let channel = PwmChannel::from_index(words.next()?.parse().ok()?)?;
                let percent = words.next()?.parse().ok()?;
                Some(DeviceCommand::SetPwm { channel, percent })
            }
            _ => None,
        }
    }
}
