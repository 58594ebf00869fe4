use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use common::protocol::{decode_line, DeviceCapabilities, Message};
use common::{LabConfig, LabError, RecordedDataset, Result, SharedDiagnostics};
use link::transport::{ByteReader, ByteWriter};
use link::{SharedConsumer, Transport};

use crate::engine::{EngineTiming, MeasurementEngine, RunEvent};
use crate::procedure::{Procedure, DEFAULT_DURATION};

/// One connection to a rig and the most recent run on it.
pub struct Session {
    config: LabConfig,
    transport: Transport,
    capabilities: Option<DeviceCapabilities>,
    engine: Option<MeasurementEngine>,
}

impl Session {
    pub fn new(config: LabConfig) -> Self {
        Self {
            config,
            transport: Transport::new(Arc::new(SharedDiagnostics::default())),
            capabilities: None,
            engine: None,
        }
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn diagnostics(&self) -> &Arc<SharedDiagnostics> {
        self.transport.diagnostics()
    }

    /// Open a serial port and wait for the rig's `hello`.
    pub async fn connect(&mut self, port: &str) -> Result<DeviceCapabilities> {
        self.disconnect();
        let waiter = HelloWaiter::install(&self.transport);
        let serial = &self.config.serial;
        if let Err(e) = self.transport.open(port, serial.baud, serial.read_timeout()) {
            self.transport.release_line_consumer(&waiter.consumer);
            return Err(e);
        }
        self.handshake(waiter).await
    }

    /// Like [`Session::connect`] over already-open byte streams.
    pub async fn attach(&mut self, reader: ByteReader, writer: ByteWriter) -> Result<DeviceCapabilities> {
        self.disconnect();
        let waiter = HelloWaiter::install(&self.transport);
        self.transport.attach(reader, writer);
        self.handshake(waiter).await
    }

    async fn handshake(&mut self, waiter: HelloWaiter) -> Result<DeviceCapabilities> {
        let wait = self.config.timing.handshake_timeout();
        let outcome = tokio::time::timeout(wait, waiter.hello).await;
        self.transport.release_line_consumer(&waiter.consumer);

        match outcome {
            Ok(Ok(capabilities)) => {
                info!("Rig ready: {:?}", capabilities);
                self.capabilities = Some(capabilities);
                Ok(capabilities)
            }
            _ => {
                warn!("No hello within {:.1}s, closing link", wait.as_secs_f64());
                self.transport.diagnostics().record_link_timeout();
                self.transport.close();
                Err(LabError::LinkTimeout(format!(
                    "no hello within {} ms",
                    wait.as_millis()
                )))
            }
        }
    }

    /// Stop any run and close the link. Idempotent.
    pub fn disconnect(&mut self) {
        self.stop();
        self.transport.close();
        self.capabilities = None;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    pub fn capabilities(&self) -> Option<DeviceCapabilities> {
        self.capabilities
    }

    /// Sensor columns the connected rig announced, in display order.
    pub fn sensor_keys(&self) -> Vec<String> {
        self.capabilities
            .map(|c| c.sensor_keys())
            .unwrap_or_default()
    }

    /// Start `procedure`, replacing any previous run. The returned channel
    /// yields this run's events and ends with [`RunEvent::Finished`].
    pub async fn start(&mut self, procedure: Procedure) -> Result<UnboundedReceiver<RunEvent>> {
        self.stop();
        let timing = EngineTiming::try_from(&self.config.timing)?;
        let (engine, events) = MeasurementEngine::new(procedure, self.transport.clone(), timing)?;
        self.engine = Some(engine.clone());
        engine.start().await;
        Ok(events)
    }

    pub fn stop(&self) {
        if let Some(engine) = &self.engine {
            engine.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.engine.as_ref().is_some_and(MeasurementEngine::is_running)
    }

    /// Planned length of the current or last run.
    pub fn duration(&self) -> Duration {
        self.engine
            .as_ref()
            .map(MeasurementEngine::duration)
            .unwrap_or(DEFAULT_DURATION)
    }

    /// `None` unless the current run regulates temperature.
    pub fn set_target_temperature(&self, target_c: f64) -> Option<f64> {
        self.engine.as_ref()?.set_target_temperature(target_c)
    }

    pub fn dataset(&self) -> Option<RecordedDataset> {
        self.engine.as_ref().map(MeasurementEngine::dataset)
    }

    /// Export the last run's samples. `false` if there is nothing to write
    /// or the file could not be written.
    pub fn export(&self, path: impl AsRef<Path>, allowed: Option<&BTreeSet<String>>) -> bool {
        match self.dataset() {
            Some(dataset) => dataset.export_csv(path, allowed, &self.config.export),
            None => {
                warn!("Nothing to export: no run yet");
                false
            }
        }
    }
}

// Registered before the link opens so an immediate `hello` is not missed.
struct HelloWaiter {
    consumer: SharedConsumer,
    hello: oneshot::Receiver<DeviceCapabilities>,
}

impl HelloWaiter {
    fn install(transport: &Transport) -> Self {
        let (tx, hello) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let consumer: SharedConsumer = Arc::new(move |line: &str| {
            if let Some(Message::Hello(capabilities)) = decode_line(line) {
                if let Some(tx) = slot.lock().ok().and_then(|mut s| s.take()) {
                    let _ = tx.send(capabilities);
                }
            }
        });
        transport.set_line_consumer(Some(consumer.clone()));
        Self { consumer, hello }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
