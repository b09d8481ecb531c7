//! Sensor node controller
//!
//! Drives the duty cycle
//!
//! ```text
//! Init -> Acquisition -> Transmission -> SleepMode -> (Wakeup) -> Acquisition
//!   ^                                                                |
//!   +---------------------------- Error <------------ any failure ---+
//! ```
//!
//! Deep sleep is modelled as a process restart with one retained value: before
//! powering down the next state is saved to a `RetainedStore`, and `boot`
//! branches on it instead of assuming a cold start.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiDevice;
use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;
use crate::sensors::{Sensor, SensorError, SensorKind};
use crate::task::{acquire, SensorContext};
use crate::Sx127x;

/// Node controller state, retained across deep sleep
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeState {
    Init,
    Acquisition,
    Transmission,
    SleepMode,
    Wakeup,
    Error,
}

/// Why execution (re)started
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WakeCause {
    /// Cold start, retained state is ignored
    PowerOn,
    /// The sleep timer expired
    Timer,
    /// An external wake source (pin, touch) fired
    External,
}

/// Node errors, each one routes the controller to `NodeState::Error`
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("radio not detected after {attempts} polls")]
    RadioNotDetected { attempts: u32 },

    #[error("sensor error: {0}")]
    Sensor(#[from] SensorError),

    #[error("no connectivity after {0:?}")]
    ConnectivityTimeout(Duration),

    #[error("radio error: {0}")]
    Radio(String),

    #[error("retained state error: {0}")]
    Store(#[from] io::Error),

    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Memory that survives deep sleep
pub trait RetainedStore {
    fn load(&mut self) -> io::Result<Option<NodeState>>;
    fn save(&mut self, state: NodeState) -> io::Result<()>;
}

/// In-memory retained store, clones share the value
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<Option<NodeState>>>,
}

impl MemoryStore {
    pub fn get(&self) -> Option<NodeState> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RetainedStore for MemoryStore {
    fn load(&mut self) -> io::Result<Option<NodeState>> {
        Ok(self.get())
    }

    fn save(&mut self, state: NodeState) -> io::Result<()> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
        Ok(())
    }
}

/// Retained store backed by a JSON file, surviving real process restarts
#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RetainedStore for FileStore {
    fn load(&mut self) -> io::Result<Option<NodeState>> {
        let f = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let state = serde_json::from_reader(BufReader::new(f))?;
        Ok(Some(state))
    }

    fn save(&mut self, state: NodeState) -> io::Result<()> {
        fs::write(&self.path, serde_json::to_vec(&state)?)
    }
}

/// Low power control
pub trait PowerControl {
    /// Power down for `duration`, returning what woke the node
    fn deep_sleep(&mut self, duration: Duration) -> WakeCause;

    /// Wait without powering down
    fn idle(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Sleeps the calling thread, always woken by the timer
#[derive(Clone, Debug, Default)]
pub struct ThreadSleep;

impl PowerControl for ThreadSleep {
    fn deep_sleep(&mut self, duration: Duration) -> WakeCause {
        thread::sleep(duration);
        WakeCause::Timer
    }
}

/// Network link bring-up, retried internally by the implementation
pub trait LinkManager {
    /// Wait up to `timeout` for the link, true once connected
    fn wait_connected(&mut self, timeout: Duration) -> bool;
}

/// Link manager for nodes without a network dependency
#[derive(Clone, Debug, Default)]
pub struct AlwaysConnected;

impl LinkManager for AlwaysConnected {
    fn wait_connected(&mut self, _timeout: Duration) -> bool {
        true
    }
}

/// Transmitted record, one optional field per sensor kind
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Reading {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub press: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hum: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dust: Option<f32>,
}

impl Reading {
    /// Set the field for `kind`, rounded to two decimals
    pub fn set(&mut self, kind: SensorKind, value: f32) {
        let value = Some(round2(value));
        match kind {
            SensorKind::Temperature => self.temp = value,
            SensorKind::Pressure => self.press = value,
            SensorKind::Humidity => self.hum = value,
            SensorKind::Sound => self.sound = value,
            SensorKind::Dust => self.dust = value,
        }
    }

    /// Collect the current averages of all sensor tasks
    pub fn from_contexts(contexts: &[SensorContext]) -> Self {
        let mut r = Self::default();
        for c in contexts {
            r.set(c.kind(), c.average());
        }
        r
    }

    /// Compact JSON record, non-finite values encode as `null`
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn round2(v: f32) -> f32 {
    ((v as f64 * 100.0).round() / 100.0) as f32
}

/// Node controller state machine
pub struct NodeController<Spi, Rst, Delay> {
    radio: Sx127x<Spi, Rst, Delay>,
    sensors: Vec<SensorContext>,
    link: Box<dyn LinkManager>,
    store: Box<dyn RetainedStore>,
    power: Box<dyn PowerControl>,
    config: NodeConfig,

    state: NodeState,
    wake_cause: WakeCause,
    last_payload: Option<String>,
}

impl<Spi, Rst, Delay> NodeController<Spi, Rst, Delay>
where
    Spi: SpiDevice,
    Rst: OutputPin,
    Delay: DelayNs,
{
    /// Create a controller, spawning one sampling task per sensor
    pub fn new(
        radio: Sx127x<Spi, Rst, Delay>,
        sensors: Vec<Box<dyn Sensor>>,
        link: Box<dyn LinkManager>,
        store: Box<dyn RetainedStore>,
        power: Box<dyn PowerControl>,
        config: NodeConfig,
    ) -> Result<Self, NodeError> {
        let sensors = sensors
            .into_iter()
            .map(|s| SensorContext::spawn(s, config.sample_count, config.sample_interval))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            radio,
            sensors,
            link,
            store,
            power,
            config,
            state: NodeState::Init,
            wake_cause: WakeCause::PowerOn,
            last_payload: None,
        })
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn wake_cause(&self) -> WakeCause {
        self.wake_cause
    }

    pub fn radio(&self) -> &Sx127x<Spi, Rst, Delay> {
        &self.radio
    }

    pub fn sensors(&self) -> &[SensorContext] {
        &self.sensors
    }

    /// Last record handed to the radio
    pub fn last_payload(&self) -> Option<&str> {
        self.last_payload.as_deref()
    }

    /// Select the entry state from the wake cause and the retained state
    pub fn boot(&mut self, cause: WakeCause) -> NodeState {
        self.state = self.wake(cause);
        info!("boot ({:?}) -> {:?}", cause, self.state);
        self.state
    }

    fn wake(&mut self, cause: WakeCause) -> NodeState {
        self.wake_cause = cause;

        let stored = match self.store.load() {
            Ok(s) => s,
            Err(e) => {
                warn!("retained state unreadable ({}), cold starting", e);
                None
            }
        };

        let next = match (cause, stored) {
            (WakeCause::PowerOn, _) | (_, None) | (_, Some(NodeState::Init)) => {
                return NodeState::Init
            }
            (WakeCause::External, Some(NodeState::Acquisition)) => NodeState::Wakeup,
            (_, Some(s)) => s,
        };

        // registers survived, only the driver's cached view needs rebuilding
        match self.radio.resume() {
            Ok(()) => next,
            Err(e) => {
                error!("radio resume failed: {:?}", e);
                NodeState::Error
            }
        }
    }

    /// Run one state and transition, returning the new state
    pub fn step(&mut self) -> NodeState {
        let next = match self.state {
            NodeState::Init => self.enter(Self::initialize, NodeState::Acquisition),
            NodeState::Acquisition => self.enter(Self::acquire, NodeState::Transmission),
            NodeState::Transmission => self.enter(Self::transmit, NodeState::SleepMode),
            NodeState::SleepMode => self.sleep(),
            NodeState::Wakeup => {
                info!("woken by {:?}", self.wake_cause);
                NodeState::Acquisition
            }
            NodeState::Error => {
                self.power.idle(self.config.error_cooldown);
                NodeState::Init
            }
        };

        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
        next
    }

    /// Cycle forever
    pub fn run(&mut self) -> ! {
        loop {
            self.step();
        }
    }

    /// Stop the sensor tasks and return the radio
    pub fn shutdown(self) -> Sx127x<Spi, Rst, Delay> {
        for s in self.sensors {
            s.shutdown();
        }
        self.radio
    }

    fn enter(
        &mut self,
        f: fn(&mut Self) -> Result<(), NodeError>,
        next: NodeState,
    ) -> NodeState {
        match f(self) {
            Ok(()) => next,
            Err(e) => {
                error!("{:?} failed: {}", self.state, e);
                NodeState::Error
            }
        }
    }

    fn initialize(&mut self) -> Result<(), NodeError> {
        let timeout = self.config.connect_timeout;
        if !self.link.wait_connected(timeout) {
            return Err(NodeError::ConnectivityTimeout(timeout));
        }

        let outcome = self.radio.init().map_err(radio_error)?;
        if !outcome.completed {
            return Err(NodeError::RadioNotDetected {
                attempts: outcome.attempts,
            });
        }

        self.radio
            .configure(&self.config.radio)
            .map_err(radio_error)?;

        for s in self.sensors.iter_mut() {
            s.probe()?;
        }

        Ok(())
    }

    fn acquire(&mut self) -> Result<(), NodeError> {
        acquire(&mut self.sensors)?;
        Ok(())
    }

    fn transmit(&mut self) -> Result<(), NodeError> {
        let payload = Reading::from_contexts(&self.sensors).to_json()?;
        info!("sending {}", payload);

        let outcome = self
            .radio
            .send_packet(payload.as_bytes())
            .map_err(radio_error)?;
        if !outcome.completed {
            warn!(
                "transmission unconfirmed, {} packets lost",
                self.radio.packets_lost()
            );
        }

        self.last_payload = Some(payload);
        Ok(())
    }

    fn sleep(&mut self) -> NodeState {
        if let Err(e) = self.store.save(NodeState::Acquisition) {
            error!("failed to retain state: {}", e);
            return NodeState::Error;
        }

        if let Err(e) = self.radio.close() {
            warn!("radio sleep failed: {:?}", e);
        }

        info!("sleeping for {:?}", self.config.sleep_duration);
        let cause = self.power.deep_sleep(self.config.sleep_duration);

        let next = self.wake(cause);
        info!("wake ({:?}) -> {:?}", cause, next);
        next
    }
}

fn radio_error<E: core::fmt::Debug>(e: E) -> NodeError {
    NodeError::Radio(format!("{:?}", e))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock::{SimChip, SimDelay, SimReset};
    use crate::registers::Reg;
    use crate::sensors::from_fn;

    /// Records requested sleeps, waking with a fixed cause
    #[derive(Clone)]
    struct RecordingPower {
        cause: WakeCause,
        sleeps: Arc<Mutex<Vec<Duration>>>,
        idles: Arc<Mutex<Vec<Duration>>>,
    }

    impl RecordingPower {
        fn new(cause: WakeCause) -> Self {
            Self {
                cause,
                sleeps: Arc::default(),
                idles: Arc::default(),
            }
        }
    }

    impl PowerControl for RecordingPower {
        fn deep_sleep(&mut self, duration: Duration) -> WakeCause {
            self.sleeps.lock().unwrap().push(duration);
            self.cause
        }

        fn idle(&mut self, duration: Duration) {
            self.idles.lock().unwrap().push(duration);
        }
    }

    struct NoLink;

    impl LinkManager for NoLink {
        fn wait_connected(&mut self, _timeout: Duration) -> bool {
            false
        }
    }

    fn config() -> NodeConfig {
        NodeConfig {
            sample_count: 3,
            sample_interval: Duration::ZERO,
            ..NodeConfig::default()
        }
    }

    fn node(
        chip: &SimChip,
        store: MemoryStore,
        power: RecordingPower,
        link: Box<dyn LinkManager>,
    ) -> NodeController<SimChip, SimReset, SimDelay> {
        let radio = Sx127x::new(chip.clone(), chip.reset_pin(), SimDelay::default());
        let sensors: Vec<Box<dyn Sensor>> = vec![
            Box::new(from_fn(SensorKind::Temperature, || Ok(21.5))),
            Box::new(from_fn(SensorKind::Humidity, || Ok(40.123))),
        ];

        NodeController::new(
            radio,
            sensors,
            link,
            Box::new(store),
            Box::new(power),
            config(),
        )
        .unwrap()
    }

    #[test]
    fn reading_json_skips_absent_fields() {
        let mut r = Reading::default();
        r.set(SensorKind::Temperature, 21.5);
        r.set(SensorKind::Pressure, 1013.25);
        r.set(SensorKind::Sound, 65.0);

        assert_eq!(
            r.to_json().unwrap(),
            r#"{"temp":21.5,"press":1013.25,"sound":65.0}"#
        );
    }

    #[test]
    fn reading_rounds_and_nulls() {
        let mut r = Reading::default();
        r.set(SensorKind::Humidity, 54.9970703125);
        r.set(SensorKind::Dust, f32::NAN);

        assert_eq!(r.to_json().unwrap(), r#"{"hum":55.0,"dust":null}"#);
    }

    #[test]
    fn boot_branches_on_retained_state() {
        let chip = SimChip::new();
        let mut store = MemoryStore::default();
        let mut n = node(
            &chip,
            store.clone(),
            RecordingPower::new(WakeCause::Timer),
            Box::new(AlwaysConnected),
        );

        assert_eq!(n.boot(WakeCause::Timer), NodeState::Init);

        store.save(NodeState::Acquisition).unwrap();
        assert_eq!(n.boot(WakeCause::PowerOn), NodeState::Init);
        assert_eq!(n.boot(WakeCause::Timer), NodeState::Acquisition);
        assert_eq!(n.boot(WakeCause::External), NodeState::Wakeup);
        assert_eq!(n.step(), NodeState::Acquisition);
    }

    #[test]
    fn full_cycle_sleeps_and_resumes_acquisition() {
        let chip = SimChip::new();
        let store = MemoryStore::default();
        let power = RecordingPower::new(WakeCause::Timer);
        let mut n = node(&chip, store.clone(), power.clone(), Box::new(AlwaysConnected));

        assert_eq!(n.boot(WakeCause::PowerOn), NodeState::Init);
        assert_eq!(n.step(), NodeState::Acquisition);
        assert_eq!(n.step(), NodeState::Transmission);
        assert_eq!(n.step(), NodeState::SleepMode);

        let payload = r#"{"temp":21.5,"hum":40.12}"#;
        assert_eq!(n.last_payload(), Some(payload));
        assert_eq!(chip.transmitted(), vec![payload.as_bytes().to_vec()]);

        assert_eq!(n.step(), NodeState::Acquisition);
        assert_eq!(store.get(), Some(NodeState::Acquisition));
        assert_eq!(*power.sleeps.lock().unwrap(), vec![Duration::from_secs(60)]);
        assert_eq!(n.radio().mode(), crate::Mode::Sleep);

        // the configured link survives the sleep
        assert_eq!(chip.reg(Reg::FrfMsb), 0xd9);
        assert_eq!(n.step(), NodeState::Transmission);
    }

    #[test]
    fn missing_radio_cools_down_and_retries() {
        let chip = SimChip::with_version(0x00);
        let power = RecordingPower::new(WakeCause::Timer);
        let mut n = node(
            &chip,
            MemoryStore::default(),
            power.clone(),
            Box::new(AlwaysConnected),
        );

        n.boot(WakeCause::PowerOn);
        assert_eq!(n.step(), NodeState::Error);
        assert_eq!(n.step(), NodeState::Init);
        assert_eq!(*power.idles.lock().unwrap(), vec![Duration::from_secs(5)]);
        assert!(chip.transmitted().is_empty());
    }

    #[test]
    fn link_timeout_is_an_error() {
        let chip = SimChip::new();
        let mut n = node(
            &chip,
            MemoryStore::default(),
            RecordingPower::new(WakeCause::Timer),
            Box::new(NoLink),
        );

        n.boot(WakeCause::PowerOn);
        assert_eq!(n.step(), NodeState::Error);
        assert!(chip.writes().is_empty());
    }

    #[test]
    fn lost_transmission_still_sleeps() {
        let chip = SimChip::new();
        chip.set_tx_responsive(false);
        let mut n = node(
            &chip,
            MemoryStore::default(),
            RecordingPower::new(WakeCause::Timer),
            Box::new(AlwaysConnected),
        );

        n.boot(WakeCause::PowerOn);
        n.step();
        n.step();
        assert_eq!(n.step(), NodeState::SleepMode);
        assert_eq!(n.radio().packets_lost(), 1);
    }

    #[test]
    fn file_store_round_trip() {
        let path = std::env::temp_dir().join(format!("lora-node-state-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let mut store = FileStore::new(&path);

        assert_eq!(store.load().unwrap(), None);
        store.save(NodeState::Acquisition).unwrap();
        assert_eq!(
            FileStore::new(&path).load().unwrap(),
            Some(NodeState::Acquisition)
        );

        std::fs::remove_file(&path).unwrap();
    }
}
