//! Fakes shared by the module tests: a scripted button, a recording LED
//! panel, a manual clock, an in-memory device inventory, and a recording
//! process runner. Nothing here ships in the library.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::DeviceInfoProvider;
use crate::error::CloneError;
use crate::executor::ProcessRunner;
use crate::model::{DeviceInfo, DevicePair, Indicator};
use crate::orchestrator::{Clock, IndicatorPanel, SignalSource};

pub(crate) fn device(kernel_name: &str, size_gb: f64) -> DeviceInfo {
    DeviceInfo {
        path: format!("/dev/{kernel_name}"),
        kernel_name: kernel_name.to_string(),
        size_bytes: (size_gb * 1e9) as u64,
        size_gb,
        model: "Unknown".to_string(),
    }
}

#[derive(Default)]
pub(crate) struct FakeProvider {
    pub names: Vec<String>,
    pub sectors: HashMap<String, u64>,
    pub models: HashMap<String, String>,
    pub by_id: HashMap<String, String>,
    pub boot: Option<String>,
    pub partitions: HashMap<String, Vec<String>>,
    pub fs_types: HashMap<String, String>,
    pub mount_points: HashMap<String, String>,
    pub fail_scan: bool,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, kernel_name: &str, sectors: u64) {
        self.names.push(kernel_name.to_string());
        self.sectors.insert(kernel_name.to_string(), sectors);
    }

    pub fn add_device_without_size(&mut self, kernel_name: &str) {
        self.names.push(kernel_name.to_string());
    }

    pub fn set_model(&mut self, kernel_name: &str, model: &str) {
        self.models
            .insert(kernel_name.to_string(), model.to_string());
    }

    pub fn set_by_id(&mut self, kernel_name: &str, path: &str) {
        self.by_id.insert(kernel_name.to_string(), path.to_string());
    }

    pub fn add_partition(&mut self, parent: &str, partition: &str, fs_type: Option<&str>) {
        self.partitions
            .entry(parent.to_string())
            .or_default()
            .push(partition.to_string());
        if let Some(fs_type) = fs_type {
            self.fs_types
                .insert(format!("/dev/{partition}"), fs_type.to_string());
        }
    }

    pub fn set_mount_point(&mut self, device_path: &str, mount: &str) {
        self.mount_points
            .insert(device_path.to_string(), mount.to_string());
    }
}

impl DeviceInfoProvider for FakeProvider {
    fn block_devices(&self) -> Result<Vec<String>, CloneError> {
        if self.fail_scan {
            return Err(CloneError::DetectionFailed("scan unavailable".to_string()));
        }
        Ok(self.names.clone())
    }

    fn sector_count(&self, kernel_name: &str) -> Option<u64> {
        self.sectors.get(kernel_name).copied()
    }

    fn model(&self, kernel_name: &str) -> Option<String> {
        self.models.get(kernel_name).cloned()
    }

    fn by_id_path(&self, kernel_name: &str) -> Option<String> {
        self.by_id.get(kernel_name).cloned()
    }

    fn boot_device(&self) -> Option<String> {
        self.boot.clone()
    }

    fn partitions(&self, kernel_name: &str) -> Vec<String> {
        self.partitions.get(kernel_name).cloned().unwrap_or_default()
    }

    fn filesystem_type(&self, device_path: &str) -> Option<String> {
        self.fs_types.get(device_path).cloned()
    }

    fn mount_point(&self, device_path: &str) -> Option<String> {
        self.mount_points.get(device_path).cloned()
    }
}

/// Builds a validated pair straight from a fake inventory.
pub(crate) fn pair_of(provider: &FakeProvider, source: &str, dest: &str) -> DevicePair {
    let info = |name: &str| {
        let size_bytes = provider.sectors.get(name).copied().unwrap_or(0) * 512;
        DeviceInfo {
            path: provider
                .by_id
                .get(name)
                .cloned()
                .unwrap_or_else(|| format!("/dev/{name}")),
            kernel_name: name.to_string(),
            size_bytes,
            size_gb: (size_bytes as f64 / 1e9 * 100.0).round() / 100.0,
            model: "Unknown".to_string(),
        }
    };
    DevicePair {
        source: info(source),
        destination: info(dest),
        ok: true,
        reason: None,
    }
}

#[derive(Default)]
pub(crate) struct RecordingRunner {
    calls: RefCell<Vec<Vec<String>>>,
    fail_on: RefCell<Option<String>>,
    stream_lines: RefCell<Vec<String>>,
}

impl RecordingRunner {
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, program: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|argv| argv[0] == program)
            .count()
    }

    /// Every later invocation of `program` exits non-zero.
    pub fn fail_on(&self, program: &str) {
        *self.fail_on.borrow_mut() = Some(program.to_string());
    }

    pub fn set_stream_lines(&self, lines: Vec<String>) {
        *self.stream_lines.borrow_mut() = lines;
    }

    fn record(&self, argv: &[&str]) -> Result<(), CloneError> {
        let argv_owned = argv.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        self.calls.borrow_mut().push(argv_owned);
        if self.fail_on.borrow().as_deref() == Some(argv[0]) {
            return Err(CloneError::CommandFailed {
                command: argv.join(" "),
                code: 1,
            });
        }
        Ok(())
    }
}

impl ProcessRunner for RecordingRunner {
    fn run(&self, argv: &[&str]) -> Result<(), CloneError> {
        self.record(argv)
    }

    fn run_streaming(
        &self,
        argv: &[&str],
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), CloneError> {
        for line in self.stream_lines.borrow().iter() {
            on_line(line);
        }
        self.record(argv)
    }
}

/// Replays a fixed sequence of signal samples, then reads inactive. Can
/// set a cancel flag after a given number of samples (an interrupt mid
/// press) or once the script runs out, so loop tests terminate.
pub(crate) struct ScriptedSignal {
    script: VecDeque<bool>,
    consumed: usize,
    cancel_after: Option<(usize, Arc<AtomicBool>)>,
    cancel_when_exhausted: Option<Arc<AtomicBool>>,
}

impl ScriptedSignal {
    pub fn new(samples: Vec<bool>) -> Self {
        Self {
            script: samples.into(),
            consumed: 0,
            cancel_after: None,
            cancel_when_exhausted: None,
        }
    }

    pub fn cancel_after(mut self, samples: usize, flag: Arc<AtomicBool>) -> Self {
        self.cancel_after = Some((samples, flag));
        self
    }

    pub fn cancel_when_exhausted(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_when_exhausted = Some(flag);
        self
    }
}

impl SignalSource for ScriptedSignal {
    fn is_activated(&mut self) -> bool {
        let sample = match self.script.pop_front() {
            Some(sample) => sample,
            None => {
                if let Some(flag) = &self.cancel_when_exhausted {
                    flag.store(true, Ordering::SeqCst);
                }
                false
            }
        };
        self.consumed += 1;
        if let Some((samples, flag)) = &self.cancel_after {
            if self.consumed >= *samples {
                flag.store(true, Ordering::SeqCst);
            }
        }
        sample
    }
}

/// Records every indicator write and tracks which lamps are lit; flags a
/// violation if two lamps are ever lit at once.
#[derive(Default)]
pub(crate) struct RecordingPanel {
    pub events: Vec<(Indicator, bool)>,
    pub lit: HashSet<Indicator>,
    pub overlap: bool,
}

impl IndicatorPanel for RecordingPanel {
    fn set(&mut self, indicator: Indicator, on: bool) {
        if on {
            if !self.lit.is_empty() && !self.lit.contains(&indicator) {
                self.overlap = true;
            }
            self.lit.insert(indicator);
        } else {
            self.lit.remove(&indicator);
        }
        self.events.push((indicator, on));
    }
}

/// Manual clock: `sleep` advances time instantly.
#[derive(Default)]
pub(crate) struct TestClock {
    now: Duration,
}

impl Clock for TestClock {
    fn monotonic(&self) -> Duration {
        self.now
    }

    fn sleep(&mut self, duration: Duration) {
        self.now += duration;
    }
}
