//! Per-sensor sampling tasks
//!
//! Each sensor runs on its own thread, parked on a start command. On start it
//! takes `sample_count` timed readings into the buffer it was handed, averages
//! them and hands the buffer back with the result. The buffer is owned by the
//! task only between start and done, which is the only window it is written.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::sensors::{Sensor, SensorError, SensorKind};

enum Command {
    Probe,
    Start(Vec<f32>),
}

enum Report {
    Probed(Result<(), SensorError>),
    Done { buffer: Vec<f32>, average: f32 },
}

/// Controller side of one sensor task
pub struct SensorContext {
    kind: SensorKind,
    commands: SyncSender<Command>,
    reports: Receiver<Report>,

    /// `None` while the task holds the buffer
    buffer: Option<Vec<f32>>,
    average: f32,

    handle: JoinHandle<()>,
}

impl SensorContext {
    /// Spawn the sampling thread for `sensor`
    pub fn spawn<S>(sensor: S, sample_count: usize, interval: Duration) -> Result<Self, SensorError>
    where
        S: Sensor + 'static,
    {
        let kind = sensor.kind();
        let (commands, command_rx) = sync_channel(1);
        let (report_tx, reports) = sync_channel(1);

        let handle = thread::Builder::new()
            .name(format!("sensor-{}", kind))
            .spawn(move || run(sensor, interval, command_rx, report_tx))?;

        Ok(Self {
            kind,
            commands,
            reports,
            buffer: Some(vec![f32::NAN; sample_count]),
            average: f32::NAN,
            handle,
        })
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Average of the last completed cycle, NaN before the first one
    pub fn average(&self) -> f32 {
        self.average
    }

    /// Samples of the last completed cycle, empty while a cycle is running
    pub fn samples(&self) -> &[f32] {
        self.buffer.as_deref().unwrap_or(&[])
    }

    pub fn is_running(&self) -> bool {
        self.buffer.is_none()
    }

    /// Probe the underlying peripheral from its own thread
    pub fn probe(&mut self) -> Result<(), SensorError> {
        if self.is_running() {
            return Err(SensorError::Bus(format!("{} sensor busy", self.kind)));
        }

        self.send(Command::Probe)?;
        match self.recv()? {
            Report::Probed(r) => r,
            Report::Done { .. } => Err(SensorError::TaskStopped(self.kind)),
        }
    }

    /// Release the start signal, handing the sample buffer to the task
    pub fn start(&mut self) -> Result<(), SensorError> {
        let buffer = self
            .buffer
            .take()
            .ok_or_else(|| SensorError::Bus(format!("{} sensor already started", self.kind)))?;

        self.send(Command::Start(buffer))
    }

    /// Block until the running cycle signals done, returning its average
    pub fn wait(&mut self) -> Result<f32, SensorError> {
        match self.recv()? {
            Report::Done { buffer, average } => {
                self.buffer = Some(buffer);
                self.average = average;
                Ok(average)
            }
            Report::Probed(_) => Err(SensorError::TaskStopped(self.kind)),
        }
    }

    /// Stop the task and wait for its thread to exit
    pub fn shutdown(self) {
        let Self {
            kind,
            commands,
            handle,
            ..
        } = self;

        drop(commands);
        if handle.join().is_err() {
            error!("{} sensor task panicked", kind);
        }
    }

    fn send(&mut self, cmd: Command) -> Result<(), SensorError> {
        self.commands
            .send(cmd)
            .map_err(|_| SensorError::TaskStopped(self.kind))
    }

    fn recv(&mut self) -> Result<Report, SensorError> {
        self.reports
            .recv()
            .map_err(|_| SensorError::TaskStopped(self.kind))
    }
}

/// Start every task at once then wait on each, returning once all are done
///
/// If a task fails to start, the ones already started are still waited on so
/// they hold their buffers again, and the first error is returned.
pub fn acquire(contexts: &mut [SensorContext]) -> Result<(), SensorError> {
    let mut first_err = None;
    let mut started = 0;

    for c in contexts.iter_mut() {
        match c.start() {
            Ok(()) => started += 1,
            Err(e) => {
                first_err = Some(e);
                break;
            }
        }
    }

    for c in contexts[..started].iter_mut() {
        match c.wait() {
            Ok(average) => debug!("{} average {}", c.kind(), average),
            Err(e) => {
                error!("{} sensor cycle failed: {}", c.kind(), e);
                first_err.get_or_insert(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Arithmetic mean over the finite samples, NaN when there are none
pub fn mean(samples: &[f32]) -> f32 {
    let (sum, n) = samples
        .iter()
        .filter(|s| s.is_finite())
        .fold((0.0f64, 0usize), |(sum, n), s| (sum + *s as f64, n + 1));

    if n == 0 {
        f32::NAN
    } else {
        (sum / n as f64) as f32
    }
}

fn run<S: Sensor>(
    mut sensor: S,
    interval: Duration,
    commands: Receiver<Command>,
    reports: SyncSender<Report>,
) {
    let kind = sensor.kind();

    while let Ok(cmd) = commands.recv() {
        let report = match cmd {
            Command::Probe => Report::Probed(sensor.probe()),
            Command::Start(mut buffer) => {
                for slot in buffer.iter_mut() {
                    *slot = match sensor.read() {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("{} read failed: {}", kind, e);
                            f32::NAN
                        }
                    };

                    if !interval.is_zero() {
                        thread::sleep(interval);
                    }
                }

                let average = mean(&buffer);
                Report::Done { buffer, average }
            }
        };

        if reports.send(report).is_err() {
            break;
        }
    }

    debug!("{} task exiting", kind);
}
