//! Simulated SCPI power supply shared by the integration tests.
//!
//! The responder understands a small command set:
//!
//! ```text
//! VOLT <v> / VOLT?        setpoint, clamped to VOLTAGE_LIMIT
//! OUTP ON|OFF / OUTP?     output enable ("1" / "0")
//! DISP:TEXT "<text>"      front panel text
//! *IDN? *RST *CLS *OPC?   common commands
//! SYST:ERR?               pops the error queue, "+0,..." when empty
//! ```
//!
//! An unknown header queues `-113,"Undefined header"` and produces no reply,
//! so the exchange fails on read and the error drain finds the entry.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use daq_props::config::PropertyDefaults;
use daq_props::{
    AppResult, AsyncProperty, DaqError, Device, DeviceAction, DeviceDriver, DeviceState, MessageChannel,
    MockTransport, MockTransportHandle, Registry, ScpiVocabulary,
};
use parking_lot::Mutex;
use tokio::sync::watch;

pub const IDN: &str = "ACME,PSU-3000,SN42,1.2";
pub const VOLTAGE_LIMIT: f64 = 30.0;
pub const NO_ERROR: &str = "+0,\"No error\"";
pub const UNDEFINED_HEADER: &str = "-113,\"Undefined header\"";
pub const DATA_TYPE_ERROR: &str = "-104,\"Data type error\"";

#[derive(Debug, Default)]
pub struct PsuState {
    pub voltage: f64,
    pub output: bool,
    pub display: String,
    pub errors: VecDeque<String>,
}

/// Shared front panel of the simulated supply.
#[derive(Clone, Default)]
pub struct SimulatedPsu {
    pub state: Arc<Mutex<PsuState>>,
}

impl SimulatedPsu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer one written frame.
    pub fn respond(&self, frame: &str) -> Option<String> {
        let mut state = self.state.lock();
        let mut replies = Vec::new();

        for command in frame.split(';').map(str::trim) {
            let (header, argument) = match command.split_once(' ') {
                Some((h, a)) => (h, Some(a.trim())),
                None => (command, None),
            };
            match (header.to_uppercase().as_str(), argument) {
                ("*CLS", None) => state.errors.clear(),
                ("*RST", None) => {
                    state.voltage = 0.0;
                    state.output = false;
                    state.display.clear();
                }
                ("*OPC?", None) => replies.push("1".to_string()),
                ("*IDN?", None) => replies.push(IDN.to_string()),
                ("SYST:ERR?", None) => {
                    let entry = state.errors.pop_front();
                    replies.push(entry.unwrap_or_else(|| NO_ERROR.to_string()));
                }
                ("VOLT?", None) => replies.push(state.voltage.to_string()),
                ("VOLT", Some(value)) => match value.parse::<f64>() {
                    Ok(v) => state.voltage = v.clamp(0.0, VOLTAGE_LIMIT),
                    Err(_) => {
                        state.errors.push_back(DATA_TYPE_ERROR.to_string());
                        return None;
                    }
                },
                ("OUTP?", None) => replies.push(if state.output { "1" } else { "0" }.to_string()),
                ("OUTP", Some(value)) => state.output = value.eq_ignore_ascii_case("ON"),
                ("DISP:TEXT", Some(text)) => state.display = text.trim_matches('"').to_string(),
                _ => {
                    state.errors.push_back(UNDEFINED_HEADER.to_string());
                    return None;
                }
            }
        }

        if replies.is_empty() {
            None
        } else {
            Some(replies.join(";"))
        }
    }

    pub fn voltage(&self) -> f64 {
        self.state.lock().voltage
    }

    pub fn output(&self) -> bool {
        self.state.lock().output
    }

    pub fn display(&self) -> String {
        self.state.lock().display.clone()
    }
}

/// Driver for the simulated supply.
#[derive(Default)]
pub struct PsuDriver {
    pub fail_initialize: bool,
    pub fail_deinitialize: bool,
    pub initialize_calls: AtomicUsize,
    pub deinitialize_calls: AtomicUsize,
    /// Device state as seen from inside the lifecycle hooks.
    pub hook_states: Mutex<Vec<DeviceState>>,
    pub state_watch: Mutex<Option<watch::Receiver<DeviceState>>>,
}

impl PsuDriver {
    /// Let the hooks record the device state they run in.
    pub fn watch_device(&self, device: &Device) {
        *self.state_watch.lock() = Some(device.subscribe_state());
    }

    fn record_state(&self) {
        if let Some(state) = self.state_watch.lock().as_ref() {
            self.hook_states.lock().push(*state.borrow());
        }
    }
}

fn parse_reply<T: std::str::FromStr>(property: &str, reply: &str) -> AppResult<T> {
    reply.trim().parse().map_err(|_| DaqError::InvalidValue {
        property: property.to_string(),
        message: format!("unparseable reply '{reply}'"),
    })
}

#[async_trait]
impl DeviceDriver for PsuDriver {
    fn declare(&self, channel: &MessageChannel, registry: &mut Registry) -> AppResult<()> {
        let (get_ch, set_ch) = (channel.clone(), channel.clone());
        registry.property(
            AsyncProperty::read_write(
                "voltage",
                0.0,
                move || {
                    let ch = get_ch.clone();
                    Box::pin(async move { parse_reply::<f64>("voltage", &ch.send_message("VOLT?").await?) })
                },
                move |v: f64| {
                    let ch = set_ch.clone();
                    Box::pin(async move { ch.send_message(&format!("VOLT {v}")).await.map(|_| ()) })
                },
            )
            .with_unit("V"),
        )?;

        let (get_ch, set_ch) = (channel.clone(), channel.clone());
        registry.property(AsyncProperty::read_write(
            "output",
            false,
            move || {
                let ch = get_ch.clone();
                Box::pin(async move { Ok(ch.send_message("OUTP?").await?.trim() == "1") })
            },
            move |on: bool| {
                let ch = set_ch.clone();
                Box::pin(async move {
                    let state = if on { "ON" } else { "OFF" };
                    ch.send_message(&format!("OUTP {state}")).await.map(|_| ())
                })
            },
        ))?;

        let ch = channel.clone();
        registry.property(AsyncProperty::write_only(
            "display",
            String::new(),
            move |text: String| {
                let ch = ch.clone();
                Box::pin(async move {
                    ch.send_message(&format!("DISP:TEXT \"{text}\"")).await.map(|_| ())
                })
            },
        ))?;

        let ch = channel.clone();
        registry.property(AsyncProperty::read_only("identity", String::new(), move || {
            let ch = ch.clone();
            Box::pin(async move { ch.get_identifier().await })
        }))?;

        let ch = channel.clone();
        registry.action(DeviceAction::new("reset", move || {
            let ch = ch.clone();
            Box::pin(async move { ch.reset().await })
        }))?;

        Ok(())
    }

    async fn initialize(&self, channel: &MessageChannel) -> AppResult<()> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        self.record_state();
        if self.fail_initialize {
            channel.send_message("SELFTEST").await?;
        }
        channel.get_identifier().await.map(|_| ())
    }

    async fn deinitialize(&self, channel: &MessageChannel) -> AppResult<()> {
        self.deinitialize_calls.fetch_add(1, Ordering::SeqCst);
        self.record_state();
        if self.fail_deinitialize {
            channel.send_message("SHUTDOWN").await?;
        }
        channel.send_message("OUTP OFF").await.map(|_| ())
    }
}

/// Everything a test needs to drive and inspect one simulated supply.
pub struct Bench {
    pub device: Device,
    pub psu: SimulatedPsu,
    pub wire: MockTransportHandle,
    pub driver: Arc<PsuDriver>,
}

pub fn bench_with(driver: PsuDriver, latency: Option<Duration>) -> Bench {
    bench_configured(driver, latency, PropertyDefaults::default())
}

pub fn bench_configured(
    driver: PsuDriver,
    latency: Option<Duration>,
    defaults: PropertyDefaults,
) -> Bench {
    let psu = SimulatedPsu::new();
    let responder = psu.clone();
    let mut transport = MockTransport::new().with_responder(move |frame| responder.respond(frame));
    if let Some(latency) = latency {
        transport = transport.with_latency(latency);
    }
    let wire = transport.handle();
    let driver = Arc::new(driver);
    let device = Device::with_property_defaults(
        "psu",
        Box::new(transport),
        ScpiVocabulary::default(),
        defaults,
        driver.clone(),
    )
    .expect("driver declarations are valid");

    Bench {
        device,
        psu,
        wire,
        driver,
    }
}

pub fn bench() -> Bench {
    bench_with(PsuDriver::default(), None)
}

pub async fn connected_bench() -> Bench {
    let bench = bench();
    bench.device.connect().await.expect("connect");
    bench.wire.clear_log();
    bench
}
