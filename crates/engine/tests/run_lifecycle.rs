use std::io::{self, Write};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;

use common::pid::PiSettings;
use engine::{EngineTiming, FinishReason, MeasurementEngine, Procedure, RunEvent, RunState};
use link::mock::{mock_link, MockDevice};
use link::transport::ByteWriter;
use link::Transport;

fn fast() -> EngineTiming {
    EngineTiming {
        settle: Duration::from_millis(5),
        poll: Duration::from_millis(10),
    }
}

fn linked() -> (MockDevice, Transport) {
    let (device, reader, writer) = mock_link();
    let transport = Transport::default();
    transport.attach(reader, writer);
    (device, transport)
}

async fn next_event(rx: &mut UnboundedReceiver<RunEvent>) -> RunEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("engine went quiet")
        .expect("event channel closed")
}

/// Everything up to and including `Finished`.
async fn until_finished(rx: &mut UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches!(event, RunEvent::Finished(_));
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Next event that is not a progress report.
async fn next_notable(rx: &mut UnboundedReceiver<RunEvent>) -> RunEvent {
    loop {
        match next_event(rx).await {
            RunEvent::Progress(_) => continue,
            other => return other,
        }
    }
}

fn finishes(events: &[RunEvent]) -> Vec<FinishReason> {
    events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Finished(reason) => Some(*reason),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn silent_device_times_out_once_and_closes_link() {
    let (device, transport) = linked();
    let procedure = Procedure::streaming()
        .with_duration(Duration::from_secs(30))
        .with_no_data_timeout(Duration::from_millis(150))
        .with_heartbeat(None);
    let (engine, mut rx) = MeasurementEngine::new(procedure, transport.clone(), fast()).unwrap();

    engine.start().await;
    let events = until_finished(&mut rx).await;

    assert_eq!(finishes(&events), vec![FinishReason::DataTimeout]);
    assert!(!transport.is_open());
    assert_eq!(engine.state(), RunState::Idle);
    assert_eq!(transport.diagnostics().snapshot().link_timeouts, 1);
    // the link was already gone, so no STOP could be sent
    assert_eq!(device.written_lines(), vec!["SET RATE 1", "START"]);

    engine.handle_line(r#"{"type":"data","t_ms":1,"T_BME":20.0}"#);
    engine.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.dataset().is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn repeated_start_and_stop_are_idempotent() {
    let (device, transport) = linked();
    let procedure = Procedure::streaming().with_heartbeat(None);
    let (engine, mut rx) = MeasurementEngine::new(procedure, transport.clone(), fast()).unwrap();

    engine.start().await;
    engine.start().await;
    assert!(engine.is_running());
    engine.stop();
    engine.stop();

    let events = until_finished(&mut rx).await;
    assert_eq!(finishes(&events), vec![FinishReason::Stopped]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(device.written_lines(), vec!["SET RATE 1", "START", "STOP"]);
    assert!(!transport.has_line_consumer());
    transport.close();
}

#[tokio::test]
async fn resistive_run_configures_rig_and_zeroes_actuators() {
    let (device, transport) = linked();
    let procedure = Procedure::resistive(0, 40, true).with_heartbeat(None);
    let (engine, mut rx) = MeasurementEngine::new(procedure, transport.clone(), fast()).unwrap();

    engine.start().await;
    engine.stop();
    until_finished(&mut rx).await;

    assert_eq!(
        device.written_lines(),
        vec![
            "SET PWM 0 40",
            "SET FILTER 1",
            "SET RATE 1",
            "START",
            "STOP",
            "SET PWM 0 0",
            "SET PWM 1 0",
        ]
    );
    transport.close();
}

#[tokio::test]
async fn incoming_lines_become_events_in_order() {
    let (device, transport) = linked();
    let procedure = Procedure::streaming().with_heartbeat(None);
    let (engine, mut rx) = MeasurementEngine::new(procedure, transport.clone(), fast()).unwrap();
    engine.start().await;

    device.send_line(r#"{"type":"data","t_ms":48200,"T_BME":24.5,"T_DS0":23.0}"#);
    device.send_line(r#"{"type":"ack","cmd":"start"}"#);
    device.send_line("#### rig rebooting");
    device.send_line(r#"{"type":"data","t_ms":49200,"T_BME":24.6}"#);
    device.send_line(r#"{"type":"error","msg":"overheat"}"#);
    device.send_line(r#"{"type":"data","t_ms":50700,"T_BME":24.8}"#);

    let mut times = Vec::new();
    let mut faults = Vec::new();
    while times.len() < 3 {
        match next_notable(&mut rx).await {
            RunEvent::Data { t_s, values } => {
                assert!(values.contains_key("T_BME"));
                assert!(!values.contains_key("t_ms"));
                times.push(t_s);
            }
            RunEvent::DeviceFault(msg) => faults.push(msg),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(times, vec![0.0, 1.0, 2.5]);
    assert_eq!(faults, vec!["overheat".to_string()]);

    let diagnostics = transport.diagnostics().snapshot();
    assert_eq!(diagnostics.device_faults, 1);
    assert_eq!(diagnostics.protocol_anomalies, 1);
    assert_eq!(engine.dataset().len(), 3);

    engine.stop();
    transport.close();
}

#[tokio::test]
async fn legacy_frames_fall_back_to_host_time() {
    let (device, transport) = linked();
    let procedure = Procedure::streaming().with_heartbeat(None);
    let (engine, mut rx) = MeasurementEngine::new(procedure, transport.clone(), fast()).unwrap();
    engine.start().await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    device.send_line("T_BME=24,5;T_TMP=24.25");
    let RunEvent::Data { t_s, values } = next_notable(&mut rx).await else {
        panic!("expected data");
    };
    assert!(t_s > 0.0 && t_s < 5.0, "host-timed sample at {t_s}");
    assert_eq!(values["T_BME"], 24.5);
    assert_eq!(values["T_TMP"], 24.25);

    engine.stop();
    transport.close();
}

#[tokio::test]
async fn restart_resets_time_basis_and_dataset() {
    let (_device, transport) = linked();
    let procedure = Procedure::streaming().with_heartbeat(None);
    let (engine, mut rx) = MeasurementEngine::new(procedure, transport.clone(), fast()).unwrap();

    engine.start().await;
    engine.handle_line(r#"{"type":"data","t_ms":1000,"T_BME":20.0}"#);
    engine.handle_line(r#"{"type":"data","t_ms":3000,"T_BME":20.0}"#);
    engine.stop();
    until_finished(&mut rx).await;
    assert_eq!(engine.dataset().len(), 2);

    engine.start().await;
    assert!(engine.dataset().is_empty());
    engine.handle_line(r#"{"type":"data","t_ms":90000,"T_BME":20.0}"#);
    let RunEvent::Data { t_s, .. } = next_notable(&mut rx).await else {
        panic!("expected data");
    };
    assert_eq!(t_s, 0.0);

    engine.stop();
    transport.close();
}

#[tokio::test]
async fn full_duration_completes_with_progress_and_heartbeats() {
    let (device, transport) = linked();
    let procedure = Procedure::streaming()
        .with_duration(Duration::from_millis(300))
        .with_heartbeat(Some(Duration::from_millis(50)));
    let (engine, mut rx) = MeasurementEngine::new(procedure, transport.clone(), fast()).unwrap();
    engine.start().await;

    let events = until_finished(&mut rx).await;
    assert_eq!(finishes(&events), vec![FinishReason::Completed]);

    let progress: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));

    let lines = device.written_lines();
    assert!(lines.iter().filter(|l| *l == "PING").count() >= 2, "{lines:?}");
    assert_eq!(lines.last().map(String::as_str), Some("STOP"));
    assert!(transport.is_open());
    transport.close();
}

#[tokio::test]
async fn regulation_commands_actuators_only_when_duty_changes() {
    let (device, transport) = linked();
    let procedure = Procedure::regulation(30.0, PiSettings::default()).with_heartbeat(None);
    let (engine, mut rx) = MeasurementEngine::new(procedure, transport.clone(), fast()).unwrap();
    engine.start().await;

    device.send_line(r#"{"type":"data","t_ms":1000,"T_TMP":20.0,"T_BME":21.0}"#);
    let RunEvent::Data { values, .. } = next_notable(&mut rx).await else {
        panic!("expected data");
    };
    assert_eq!(values["PWM_HEAT"], 0.0);
    assert_eq!(values["PWM_COOL"], 0.0);
    assert_eq!(values["Target"], 30.0);

    for t_ms in [2000, 3000] {
        tokio::time::sleep(Duration::from_millis(20)).await;
        device.send_line(&format!(r#"{{"type":"data","t_ms":{t_ms},"T_TMP":20.0}}"#));
        let RunEvent::Data { values, .. } = next_notable(&mut rx).await else {
            panic!("expected data");
        };
        assert_eq!(values["PWM_HEAT"], 100.0);
    }

    assert_eq!(engine.set_target_temperature(55.0), Some(40.0));
    engine.stop();
    until_finished(&mut rx).await;

    assert_eq!(
        device.written_lines(),
        vec![
            "SET RATE 1",
            "START",
            "SET PWM 0 100",
            "STOP",
            "SET PWM 0 0",
            "SET PWM 1 0",
        ]
    );
    let recorded = engine.dataset().snapshot();
    assert_eq!(recorded.len(), 3);
    assert!(recorded.iter().all(|s| s.values.contains_key("Target")));
    transport.close();
}

#[tokio::test]
async fn stop_during_setup_keeps_start_off_the_wire() {
    let (device, transport) = linked();
    let procedure = Procedure::resistive(0, 40, true).with_heartbeat(None);
    let timing = EngineTiming {
        settle: Duration::from_millis(200),
        poll: Duration::from_millis(10),
    };
    let (engine, mut rx) = MeasurementEngine::new(procedure, transport.clone(), timing).unwrap();

    let starter = tokio::spawn({
        let engine = engine.clone();
        async move { engine.start().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.stop();
    starter.await.unwrap();

    assert_eq!(finishes(&until_finished(&mut rx).await), vec![FinishReason::Stopped]);
    assert_eq!(
        device.written_lines(),
        vec!["SET PWM 0 40", "STOP", "SET PWM 0 0", "SET PWM 1 0"]
    );
    transport.close();
}

/// Delays every `SET PWM` write, like a congested serial port.
struct SlowPwmWriter {
    inner: ByteWriter,
    delay: Duration,
}

impl Write for SlowPwmWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.starts_with(b"SET PWM") {
            std::thread::sleep(self.delay);
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[tokio::test]
async fn slow_actuator_write_does_not_block_run_state() {
    let (device, reader, writer) = mock_link();
    let transport = Transport::default();
    transport.attach(
        reader,
        Box::new(SlowPwmWriter {
            inner: writer,
            delay: Duration::from_millis(400),
        }),
    );
    let procedure = Procedure::regulation(30.0, PiSettings::default()).with_heartbeat(None);
    let (engine, mut rx) = MeasurementEngine::new(procedure, transport.clone(), fast()).unwrap();
    engine.start().await;

    device.send_line(r#"{"type":"data","t_ms":1000,"T_TMP":20.0}"#);
    next_notable(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    device.send_line(r#"{"type":"data","t_ms":2000,"T_TMP":20.0}"#);
    next_notable(&mut rx).await;

    // the reader thread is now inside the heater write
    tokio::time::sleep(Duration::from_millis(50)).await;
    let asked = Instant::now();
    assert!(engine.is_running());
    assert_eq!(engine.target_temperature(), Some(30.0));
    assert!(asked.elapsed() < Duration::from_millis(200));

    engine.stop();
    until_finished(&mut rx).await;
    assert_eq!(
        device.written_lines(),
        vec![
            "SET RATE 1",
            "START",
            "SET PWM 0 100",
            "STOP",
            "SET PWM 0 0",
            "SET PWM 1 0",
        ]
    );
    transport.close();
}
