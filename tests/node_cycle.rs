//! Node duty cycle through the public API, on the simulated transceiver

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lora_sensor_node::config::{GatewayConfig, NodeConfig};
use lora_sensor_node::gateway::{Gateway, WriteForwarder};
use lora_sensor_node::mock::{SimChip, SimDelay};
use lora_sensor_node::node::{
    AlwaysConnected, FileStore, MemoryStore, NodeController, NodeState, PowerControl,
    RetainedStore, WakeCause,
};
use lora_sensor_node::sensors::{from_fn, Sensor, SensorKind};
use lora_sensor_node::{Mode, Sx127x};

struct TimerWake {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl PowerControl for TimerWake {
    fn deep_sleep(&mut self, duration: Duration) -> WakeCause {
        self.sleeps.lock().unwrap().push(duration);
        WakeCause::Timer
    }

    fn idle(&mut self, _duration: Duration) {}
}

fn counting(kind: SensorKind, value: f32, reads: &Arc<AtomicUsize>) -> Box<dyn Sensor> {
    let reads = reads.clone();
    Box::new(from_fn(kind, move || {
        reads.fetch_add(1, Ordering::SeqCst);
        Ok(value)
    }))
}

fn config() -> NodeConfig {
    NodeConfig {
        sample_count: 10,
        sample_interval: Duration::ZERO,
        ..NodeConfig::default()
    }
}

#[test]
fn acquisition_barrier_and_payload() -> anyhow::Result<()> {
    let chip = SimChip::new();
    let radio = Sx127x::new(chip.clone(), chip.reset_pin(), SimDelay::default());
    let reads = Arc::new(AtomicUsize::new(0));

    let sensors = vec![
        counting(SensorKind::Temperature, 21.5, &reads),
        counting(SensorKind::Pressure, 1013.25, &reads),
        counting(SensorKind::Sound, 65.0, &reads),
    ];
    let sleeps = Arc::new(Mutex::new(vec![]));

    let mut node = NodeController::new(
        radio,
        sensors,
        Box::new(AlwaysConnected),
        Box::new(MemoryStore::default()),
        Box::new(TimerWake {
            sleeps: sleeps.clone(),
        }),
        config(),
    )?;

    assert_eq!(node.boot(WakeCause::PowerOn), NodeState::Init);
    assert_eq!(node.step(), NodeState::Acquisition);
    assert_eq!(node.step(), NodeState::Transmission);

    // every sensor completed all samples before the barrier released
    assert_eq!(reads.load(Ordering::SeqCst), 30);
    assert!(node.sensors().iter().all(|s| s.samples().len() == 10));

    assert_eq!(node.step(), NodeState::SleepMode);
    assert_eq!(
        chip.transmitted(),
        vec![br#"{"temp":21.5,"press":1013.25,"sound":65.0}"#.to_vec()]
    );

    assert_eq!(node.step(), NodeState::Acquisition);
    assert_eq!(*sleeps.lock().unwrap(), vec![Duration::from_secs(60)]);

    node.shutdown();
    Ok(())
}

#[test]
fn node_to_gateway_round_trip() -> anyhow::Result<()> {
    let node_chip = SimChip::new();
    let radio = Sx127x::new(node_chip.clone(), node_chip.reset_pin(), SimDelay::default());
    let sensors: Vec<Box<dyn Sensor>> = vec![
        Box::new(from_fn(SensorKind::Temperature, || Ok(19.25))),
        Box::new(from_fn(SensorKind::Humidity, || Ok(48.0))),
    ];

    let mut node = NodeController::new(
        radio,
        sensors,
        Box::new(AlwaysConnected),
        Box::new(MemoryStore::default()),
        Box::new(TimerWake {
            sleeps: Arc::default(),
        }),
        config(),
    )?;

    node.boot(WakeCause::PowerOn);
    for _ in 0..3 {
        node.step();
    }
    let sent = node.last_payload().map(str::to_string);
    assert_eq!(sent.as_deref(), Some(r#"{"temp":19.25,"hum":48.0}"#));

    let gw_chip = SimChip::new();
    let delay = SimDelay::default();
    let radio = Sx127x::new(gw_chip.clone(), gw_chip.reset_pin(), delay.clone());
    let mut gateway = Gateway::new(
        radio,
        delay,
        WriteForwarder::new(Vec::new()),
        Box::new(AlwaysConnected),
        GatewayConfig::default(),
    );
    gateway.start()?;
    assert_eq!(gateway.radio_mut().mode(), Mode::RxContinuous);

    for packet in node_chip.transmitted() {
        gw_chip.deliver(&packet);
    }
    assert!(gateway.process_one()?);

    let out = String::from_utf8(gateway.forwarder().get_ref().clone())?;
    assert_eq!(out, format!("{}\n", sent.unwrap_or_default()));

    Ok(())
}

#[test]
fn retained_state_survives_restart() -> anyhow::Result<()> {
    let path = std::env::temp_dir().join(format!("lora-node-it-{}.json", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let chip = SimChip::new();
    {
        let radio = Sx127x::new(chip.clone(), chip.reset_pin(), SimDelay::default());
        let mut node = NodeController::new(
            radio,
            vec![Box::new(from_fn(SensorKind::Dust, || Ok(12.0))) as Box<dyn Sensor>],
            Box::new(AlwaysConnected),
            Box::new(FileStore::new(&path)),
            Box::new(TimerWake {
                sleeps: Arc::default(),
            }),
            config(),
        )?;

        node.boot(WakeCause::PowerOn);
        for _ in 0..3 {
            node.step();
        }
        assert_eq!(node.state(), NodeState::SleepMode);
        node.step();
    }

    assert_eq!(FileStore::new(&path).load()?, Some(NodeState::Acquisition));

    // a new process over the same, still configured, transceiver
    let radio = Sx127x::new(chip.clone(), chip.reset_pin(), SimDelay::default());
    let mut node = NodeController::new(
        radio,
        vec![Box::new(from_fn(SensorKind::Dust, || Ok(12.0))) as Box<dyn Sensor>],
        Box::new(AlwaysConnected),
        Box::new(FileStore::new(&path)),
        Box::new(TimerWake {
            sleeps: Arc::default(),
        }),
        config(),
    )?;

    assert_eq!(node.boot(WakeCause::Timer), NodeState::Acquisition);
    assert_eq!(node.radio().mode(), Mode::Sleep);
    node.step();
    assert_eq!(node.step(), NodeState::SleepMode);
    assert_eq!(chip.transmitted().len(), 2);
    assert_eq!(chip.transmitted()[1], br#"{"dust":12.0}"#.to_vec());

    std::fs::remove_file(&path)?;
    Ok(())
}
