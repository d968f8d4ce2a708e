//! Physical and simulated front-panel hardware. The real implementations
//! talk to sysfs GPIO value files; the simulated ones let the appliance
//! loop run on a development machine with no wiring at all.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use sdcc_core::{
    CloneError, DeviceInfoProvider, Indicator, IndicatorPanel, ProcessRunner, SignalSource,
};

/// Start button on a sysfs GPIO value file. Wired active-low: the input
/// reads `0` while the button is held.
pub struct GpioSignal {
    value_path: PathBuf,
}

impl GpioSignal {
    pub fn new(value_path: impl Into<PathBuf>) -> Self {
        Self {
            value_path: value_path.into(),
        }
    }
}

impl SignalSource for GpioSignal {
    fn is_activated(&mut self) -> bool {
        match fs::read_to_string(&self.value_path) {
            Ok(value) => value.trim() == "0",
            Err(err) => {
                debug!("button read failed ({}): {err}", self.value_path.display());
                false
            }
        }
    }
}

/// Three status LEDs, one sysfs GPIO value file each.
pub struct GpioPanel {
    ready: PathBuf,
    cloning: PathBuf,
    done: PathBuf,
}

impl GpioPanel {
    pub fn new(
        ready: impl Into<PathBuf>,
        cloning: impl Into<PathBuf>,
        done: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ready: ready.into(),
            cloning: cloning.into(),
            done: done.into(),
        }
    }
}

impl IndicatorPanel for GpioPanel {
    fn set(&mut self, indicator: Indicator, on: bool) {
        let path = match indicator {
            Indicator::Ready => &self.ready,
            Indicator::Cloning => &self.cloning,
            Indicator::Done => &self.done,
        };
        if let Err(err) = fs::write(path, if on { "1" } else { "0" }) {
            warn!("led write failed ({}): {err}", path.display());
        }
    }
}

/// Presses the virtual button once every `interval` polls.
pub struct SimulatedSignal {
    interval: u64,
    until_press: u64,
}

impl SimulatedSignal {
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            until_press: interval,
        }
    }
}

impl SignalSource for SimulatedSignal {
    fn is_activated(&mut self) -> bool {
        if self.until_press == 0 {
            self.until_press = self.interval;
            info!("[simulated] button pressed");
            return true;
        }
        self.until_press -= 1;
        false
    }
}

/// Logs LED transitions instead of driving pins. Only changes are logged,
/// so the idle blink does not flood the output.
#[derive(Default)]
pub struct SimulatedPanel {
    lit: [bool; 3],
}

impl IndicatorPanel for SimulatedPanel {
    fn set(&mut self, indicator: Indicator, on: bool) {
        let slot = match indicator {
            Indicator::Ready => 0,
            Indicator::Cloning => 1,
            Indicator::Done => 2,
        };
        if self.lit[slot] != on {
            self.lit[slot] = on;
            info!(
                "[simulated] {:?} led {}",
                indicator,
                if on { "on" } else { "off" }
            );
        }
    }
}

/// Fixed two-card bench inventory: a 32 GB partitioned flash drive, a 1 TB
/// backup disk and a 64 GB card that classification leaves aside.
pub struct SimulatedProvider;

impl DeviceInfoProvider for SimulatedProvider {
    fn block_devices(&self) -> Result<Vec<String>, CloneError> {
        Ok(vec![
            "sdc".to_string(),
            "sdd".to_string(),
            "sde".to_string(),
        ])
    }

    fn sector_count(&self, kernel_name: &str) -> Option<u64> {
        match kernel_name {
            "sdc" => Some(62_500_000),
            "sdd" => Some(1_953_125_000),
            "sde" => Some(125_000_000),
            _ => None,
        }
    }

    fn model(&self, kernel_name: &str) -> Option<String> {
        match kernel_name {
            "sdc" => Some("USB_Flash_Drive".to_string()),
            "sdd" => Some("Backup_Plus_HDD".to_string()),
            "sde" => Some("SD_Card_Reader".to_string()),
            _ => None,
        }
    }

    fn by_id_path(&self, kernel_name: &str) -> Option<String> {
        match kernel_name {
            "sdc" => Some("/dev/disk/by-id/usb-Test_Flash_123456-0:0".to_string()),
            _ => None,
        }
    }

    fn boot_device(&self) -> Option<String> {
        Some("mmcblk0".to_string())
    }

    fn partitions(&self, kernel_name: &str) -> Vec<String> {
        match kernel_name {
            "sdc" => vec!["sdc1".to_string(), "sdc2".to_string()],
            _ => Vec::new(),
        }
    }

    fn filesystem_type(&self, device_path: &str) -> Option<String> {
        match device_path {
            "/dev/sdc1" => Some("vfat".to_string()),
            "/dev/sdc2" => Some("ext4".to_string()),
            _ => None,
        }
    }

    fn mount_point(&self, _device_path: &str) -> Option<String> {
        None
    }
}

/// Logs every command instead of spawning it and fabricates progress
/// output for the streaming ones.
pub struct SimulatedRunner;

impl ProcessRunner for SimulatedRunner {
    fn run(&self, argv: &[&str]) -> Result<(), CloneError> {
        info!("[simulated] {}", argv.join(" "));
        Ok(())
    }

    fn run_streaming(
        &self,
        argv: &[&str],
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), CloneError> {
        info!("[simulated] {}", argv.join(" "));
        for percent in [25, 50, 75, 100] {
            on_line(&format!("{percent}% copied"));
        }
        Ok(())
    }
}
