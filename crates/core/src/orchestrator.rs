use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{DeviceCatalog, DeviceInfoProvider};
use crate::classify::classify;
use crate::executor::{CloneExecutor, ProcessRunner};
use crate::model::{CloneOutcome, CloneReport, Indicator, OperatorState, REPORT_VERSION};

/// How long the Done indicator stays lit after a successful clone.
const DONE_DWELL: Duration = Duration::from_secs(5);
/// Error signalling: the Ready indicator flashes this many times.
const ERROR_FLASHES: u32 = 5;
const ERROR_FLASH_INTERVAL: Duration = Duration::from_millis(200);
/// Idle blink: Ready is lit for the first half second of every two.
const READY_BLINK_PERIOD: Duration = Duration::from_secs(2);
const READY_BLINK_ON: Duration = Duration::from_millis(500);

/// Start trigger for a clone attempt. Level-read; the orchestrator applies
/// edge detection on top.
pub trait SignalSource {
    fn is_activated(&mut self) -> bool;
}

/// Front-panel indicator lamps.
pub trait IndicatorPanel {
    fn set(&mut self, indicator: Indicator, on: bool);

    fn clear_all(&mut self) {
        for indicator in Indicator::ALL {
            self.set(indicator, false);
        }
    }
}

/// Time source for the polling loop, behind a trait so tests advance time
/// instantly instead of sleeping for real.
pub trait Clock {
    fn monotonic(&self) -> Duration;
    fn sleep(&mut self, duration: Duration);
}

/// Wall-clock backed implementation for the appliance itself.
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Tuning for [`Orchestrator::run_loop`].
pub struct LoopOptions {
    /// Signal sampling interval while idle.
    pub poll_interval: Duration,
    /// Stop after this many completed attempts. `None` runs until
    /// cancelled.
    pub max_attempts: Option<u64>,
    /// Cooperative shutdown flag, checked between polls. An in-flight
    /// clone always runs to completion.
    pub cancel_flag: Option<Arc<AtomicBool>>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_attempts: None,
            cancel_flag: None,
        }
    }
}

impl LoopOptions {
    fn cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Drives the whole appliance: polls the start signal, runs detection,
/// classification and cloning as one blocking attempt, and keeps the
/// indicator panel truthful throughout. Owns the operator state; nothing
/// else mutates it.
pub struct Orchestrator<'a> {
    signal: &'a mut dyn SignalSource,
    panel: &'a mut dyn IndicatorPanel,
    clock: &'a mut dyn Clock,
    provider: &'a dyn DeviceInfoProvider,
    runner: &'a dyn ProcessRunner,
    scratch_dir: PathBuf,
    state: OperatorState,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        signal: &'a mut dyn SignalSource,
        panel: &'a mut dyn IndicatorPanel,
        clock: &'a mut dyn Clock,
        provider: &'a dyn DeviceInfoProvider,
        runner: &'a dyn ProcessRunner,
    ) -> Self {
        Self {
            signal,
            panel,
            clock,
            provider,
            runner,
            scratch_dir: PathBuf::from("/mnt"),
            state: OperatorState::default(),
        }
    }

    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    pub fn state(&self) -> OperatorState {
        self.state
    }

    /// Single mutation path for operator state. All lamps go out before
    /// the new state's lamp comes on, so no two are ever lit together.
    fn transition(&mut self, state: OperatorState) {
        debug!("state: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.panel.clear_all();
        match state {
            // Ready blinks from the polling loop rather than holding a
            // solid lamp.
            OperatorState::Ready | OperatorState::Error => {}
            OperatorState::Detecting => self.panel.set(Indicator::Ready, true),
            OperatorState::Cloning => self.panel.set(Indicator::Cloning, true),
            OperatorState::Done => self.panel.set(Indicator::Done, true),
        }
    }

    /// Idle-state heartbeat. A no-op outside Ready.
    fn blink_ready(&mut self) {
        if self.state != OperatorState::Ready {
            return;
        }
        let phase = self.clock.monotonic().as_millis() % READY_BLINK_PERIOD.as_millis();
        self.panel
            .set(Indicator::Ready, phase < READY_BLINK_ON.as_millis());
    }

    /// Visually distinct failure signal: the Ready lamp flashes five
    /// times, then the appliance settles back into the idle blink.
    fn error_pattern(&mut self) {
        for _ in 0..ERROR_FLASHES {
            self.panel.set(Indicator::Ready, false);
            self.clock.sleep(ERROR_FLASH_INTERVAL);
            self.panel.set(Indicator::Ready, true);
            self.clock.sleep(ERROR_FLASH_INTERVAL);
        }
        self.panel.set(Indicator::Ready, false);
    }

    /// One full attempt: detect, classify, validate, clone. Never panics
    /// and never aborts the process; every failure is folded into the
    /// returned report and the Error indicator pattern.
    pub fn run_attempt(&mut self) -> CloneReport {
        let attempt_id = Uuid::new_v4().to_string();
        let started_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        info!("clone attempt {attempt_id} started");

        self.transition(OperatorState::Detecting);
        let devices = DeviceCatalog::new(self.provider).list_candidates();
        info!("detected {} candidate device(s)", devices.len());

        let (pair, outcome) = match classify(&devices) {
            Err(err) => {
                warn!("{err}");
                (None, CloneOutcome::failure(err.to_string()))
            }
            Ok(pair) if !pair.ok => {
                let reason = pair
                    .reason
                    .clone()
                    .unwrap_or_else(|| "validation failed".to_string());
                warn!("clone pair rejected: {reason}");
                (Some(pair), CloneOutcome::failure(reason))
            }
            Ok(pair) => {
                self.transition(OperatorState::Cloning);
                let executor = CloneExecutor::new(self.runner, self.provider)
                    .with_scratch_dir(self.scratch_dir.clone());
                let result = executor.clone_pair(&pair, &mut |line| info!("progress: {line}"));
                let outcome = match result {
                    Ok(()) => CloneOutcome::success(),
                    Err(err) => {
                        warn!("clone failed: {err}");
                        CloneOutcome::failure(err.to_string())
                    }
                };
                (Some(pair), outcome)
            }
        };

        if outcome.succeeded {
            info!("clone attempt {attempt_id} succeeded");
            self.transition(OperatorState::Done);
            self.clock.sleep(DONE_DWELL);
        } else {
            self.transition(OperatorState::Error);
            self.error_pattern();
        }
        self.transition(OperatorState::Ready);

        let finished_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        CloneReport {
            report_version: REPORT_VERSION.to_string(),
            attempt_id,
            started_at,
            finished_at,
            source: pair.as_ref().map(|p| p.source.clone()),
            destination: pair.as_ref().map(|p| p.destination.clone()),
            outcome,
        }
    }

    /// Polls the start signal forever (or until cancelled), launching one
    /// attempt as soon as the signal asserts. After the attempt the loop
    /// drains the still-held signal before re-arming, so holding it
    /// triggers exactly one clone. A requested shutdown always wins: once
    /// the cancel flag is set no new attempt starts.
    pub fn run_loop(&mut self, options: &LoopOptions, on_report: &mut dyn FnMut(&CloneReport)) {
        info!("appliance ready, waiting for start signal");
        let mut attempts = 0u64;
        'poll: loop {
            if options.cancelled() {
                info!("shutdown requested, leaving polling loop");
                break;
            }
            self.blink_ready();

            if self.signal.is_activated() {
                if options.cancelled() {
                    info!("shutdown requested, ignoring start signal");
                    break;
                }
                let report = self.run_attempt();
                on_report(&report);
                attempts += 1;
                if options.max_attempts.is_some_and(|max| attempts >= max) {
                    break;
                }
                // drain the held signal so one press is one attempt
                while self.signal.is_activated() {
                    if options.cancelled() {
                        info!("shutdown requested, leaving polling loop");
                        break 'poll;
                    }
                    self.clock.sleep(options.poll_interval);
                }
                continue;
            }
            self.clock.sleep(options.poll_interval);
        }
        self.panel.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    use super::{LoopOptions, Orchestrator};
    use crate::model::{Indicator, OperatorState};
    use crate::test_support::{
        FakeProvider, RecordingPanel, RecordingRunner, ScriptedSignal, TestClock,
    };

    fn two_disk_provider() -> FakeProvider {
        let mut provider = FakeProvider::new();
        provider.add_device("sdc", 62_500_000);
        provider.add_device("sdd", 1_953_125_000);
        provider
    }

    #[test]
    fn held_signal_triggers_exactly_one_attempt() {
        let provider = two_disk_provider();
        let runner = RecordingRunner::default();
        let cancel = Arc::new(AtomicBool::new(false));
        let mut signal =
            ScriptedSignal::new(vec![true, true, true, true]).cancel_when_exhausted(cancel.clone());
        let mut panel = RecordingPanel::default();
        let mut clock = TestClock::default();

        let mut reports = Vec::new();
        let mut orchestrator =
            Orchestrator::new(&mut signal, &mut panel, &mut clock, &provider, &runner);
        orchestrator.run_loop(
            &LoopOptions {
                cancel_flag: Some(cancel),
                ..LoopOptions::default()
            },
            &mut |report| reports.push(report.clone()),
        );

        assert_eq!(reports.len(), 1);
        assert!(reports[0].outcome.succeeded);
        assert_eq!(runner.count("dd"), 1);
    }

    #[test]
    fn cancel_while_signal_held_never_starts_a_clone() {
        let provider = two_disk_provider();
        let runner = RecordingRunner::default();
        // shutdown arrives together with the press, before any release
        let cancel = Arc::new(AtomicBool::new(false));
        let mut signal =
            ScriptedSignal::new(vec![true, true, true, true]).cancel_after(1, cancel.clone());
        let mut panel = RecordingPanel::default();
        let mut clock = TestClock::default();

        let mut reports = Vec::new();
        let mut orchestrator =
            Orchestrator::new(&mut signal, &mut panel, &mut clock, &provider, &runner);
        orchestrator.run_loop(
            &LoopOptions {
                cancel_flag: Some(cancel),
                ..LoopOptions::default()
            },
            &mut |report| reports.push(report.clone()),
        );
        drop(orchestrator);

        assert!(reports.is_empty());
        assert!(runner.calls().is_empty());
        assert!(panel.lit.is_empty());
    }

    #[test]
    fn successful_attempt_lights_done_then_returns_to_ready() {
        let provider = two_disk_provider();
        let runner = RecordingRunner::default();
        let mut signal = ScriptedSignal::new(vec![]);
        let mut panel = RecordingPanel::default();
        let mut clock = TestClock::default();

        let mut orchestrator =
            Orchestrator::new(&mut signal, &mut panel, &mut clock, &provider, &runner);
        let report = orchestrator.run_attempt();
        assert!(report.outcome.succeeded);
        assert_eq!(report.outcome.error_detail, None);
        assert_eq!(orchestrator.state(), OperatorState::Ready);

        assert!(panel.events.contains(&(Indicator::Done, true)));
        assert!(!panel.overlap, "indicator overlap: {:?}", panel.events);
        assert!(panel.lit.is_empty());
    }

    #[test]
    fn single_device_fails_without_touching_any_tool() {
        let mut provider = FakeProvider::new();
        provider.add_device("sdc", 62_500_000);
        let runner = RecordingRunner::default();
        let mut signal = ScriptedSignal::new(vec![]);
        let mut panel = RecordingPanel::default();
        let mut clock = TestClock::default();

        let mut orchestrator =
            Orchestrator::new(&mut signal, &mut panel, &mut clock, &provider, &runner);
        let report = orchestrator.run_attempt();

        assert!(!report.outcome.succeeded);
        assert!(report
            .outcome
            .error_detail
            .as_deref()
            .is_some_and(|detail| detail.contains("found 1")));
        assert_eq!(report.source, None);
        assert_eq!(report.destination, None);
        assert!(runner.calls().is_empty());
        assert_eq!(orchestrator.state(), OperatorState::Ready);
    }

    #[test]
    fn failed_copy_signals_error_and_never_lights_done() {
        let provider = two_disk_provider();
        let runner = RecordingRunner::default();
        runner.fail_on("dd");
        let mut signal = ScriptedSignal::new(vec![]);
        let mut panel = RecordingPanel::default();
        let mut clock = TestClock::default();

        let mut orchestrator =
            Orchestrator::new(&mut signal, &mut panel, &mut clock, &provider, &runner);
        let report = orchestrator.run_attempt();
        assert_eq!(orchestrator.state(), OperatorState::Ready);
        drop(orchestrator);

        assert!(!report.outcome.succeeded);
        assert!(report
            .outcome
            .error_detail
            .as_deref()
            .is_some_and(|detail| detail.contains("dd")));
        assert!(!panel.events.contains(&(Indicator::Done, true)));
        assert!(!panel.overlap, "indicator overlap: {:?}", panel.events);
        assert!(panel.lit.is_empty());
    }

    #[test]
    fn oversized_source_is_rejected_before_any_tool_runs() {
        let mut provider = FakeProvider::new();
        // both round to 32.00 GB, so the stable sort keeps first-seen
        // order and the byte-level check catches the extra sector
        provider.add_device("sdc", 62_500_001);
        provider.add_device("sdd", 62_500_000);
        let runner = RecordingRunner::default();
        let mut signal = ScriptedSignal::new(vec![]);
        let mut panel = RecordingPanel::default();
        let mut clock = TestClock::default();

        let mut orchestrator =
            Orchestrator::new(&mut signal, &mut panel, &mut clock, &provider, &runner);
        let report = orchestrator.run_attempt();

        assert!(!report.outcome.succeeded);
        assert_eq!(
            report.outcome.error_detail.as_deref(),
            Some("destination too small")
        );
        // the rejected pair is still reported for diagnostics
        assert!(report.source.is_some());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn ready_blink_follows_the_clock_phase() {
        let provider = two_disk_provider();
        let runner = RecordingRunner::default();
        let mut signal = ScriptedSignal::new(vec![]);
        let mut panel = RecordingPanel::default();
        let mut clock = TestClock::default();

        let mut orchestrator =
            Orchestrator::new(&mut signal, &mut panel, &mut clock, &provider, &runner);
        orchestrator.blink_ready();
        orchestrator.clock.sleep(Duration::from_millis(600));
        orchestrator.blink_ready();
        orchestrator.clock.sleep(Duration::from_millis(1400));
        orchestrator.blink_ready();
        drop(orchestrator);

        assert_eq!(
            panel.events,
            vec![
                (Indicator::Ready, true),
                (Indicator::Ready, false),
                (Indicator::Ready, true),
            ]
        );
    }

    #[test]
    fn loop_honours_max_attempts_and_clears_the_panel() {
        let provider = two_disk_provider();
        let runner = RecordingRunner::default();
        let mut signal = ScriptedSignal::new(vec![true, false, true, false, true, false]);
        let mut panel = RecordingPanel::default();
        let mut clock = TestClock::default();

        let mut reports = Vec::new();
        let mut orchestrator =
            Orchestrator::new(&mut signal, &mut panel, &mut clock, &provider, &runner);
        orchestrator.run_loop(
            &LoopOptions {
                max_attempts: Some(2),
                ..LoopOptions::default()
            },
            &mut |report| reports.push(report.clone()),
        );
        drop(orchestrator);

        assert_eq!(reports.len(), 2);
        assert_eq!(runner.count("dd"), 2);
        assert!(panel.lit.is_empty());
    }
}
