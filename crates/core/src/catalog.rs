use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use sysinfo::Disks;
use tracing::{debug, info, warn};

use crate::error::CloneError;
use crate::model::DeviceInfo;

const SECTOR_SIZE: u64 = 512;

/// Everything the core needs to know about attached block devices, kept
/// behind a trait so detection and clone logic run against fakes in tests.
/// The real implementation is [`SysBlockProvider`].
pub trait DeviceInfoProvider {
    /// Kernel names of all block devices (e.g. `sda`, `mmcblk0`).
    fn block_devices(&self) -> Result<Vec<String>, CloneError>;

    /// Raw 512-byte-sector count for a device. `None` when unreadable.
    fn sector_count(&self, kernel_name: &str) -> Option<u64>;

    /// Hardware model string, if the device exposes one.
    fn model(&self, kernel_name: &str) -> Option<String>;

    /// Stable `/dev/disk/by-id` alias resolving to this device, if any.
    fn by_id_path(&self, kernel_name: &str) -> Option<String>;

    /// Kernel name of the device backing the root filesystem.
    fn boot_device(&self) -> Option<String>;

    /// Kernel names of a device's partitions, in partition-table order.
    fn partitions(&self, kernel_name: &str) -> Vec<String>;

    /// Probed filesystem type for a partition node, lowercased.
    fn filesystem_type(&self, device_path: &str) -> Option<String>;

    /// Current mount point of a device node, if it is mounted.
    fn mount_point(&self, device_path: &str) -> Option<String>;
}

/// Enumerates clone candidates from a [`DeviceInfoProvider`], applying the
/// policy filters that keep the appliance from eating its own boot medium.
pub struct DeviceCatalog<'a> {
    provider: &'a dyn DeviceInfoProvider,
}

impl<'a> DeviceCatalog<'a> {
    pub fn new(provider: &'a dyn DeviceInfoProvider) -> Self {
        Self { provider }
    }

    /// Lists candidate devices for cloning. Fails softly: a device whose
    /// metadata cannot be read is skipped and logged, never aborting the
    /// scan. Loopback/ramdisk pseudo-devices and the boot device are
    /// excluded unconditionally.
    pub fn list_candidates(&self) -> Vec<DeviceInfo> {
        let names = match self.provider.block_devices() {
            Ok(names) => names,
            Err(err) => {
                warn!("device scan failed: {err}");
                return Vec::new();
            }
        };
        let boot = self.provider.boot_device();

        let mut seen = HashSet::new();
        let mut devices = Vec::new();
        for name in names {
            if name.starts_with("loop") || name.starts_with("ram") {
                continue;
            }
            if let Some(boot) = &boot {
                if name.starts_with(boot.as_str()) {
                    info!("skipping boot device: /dev/{name}");
                    continue;
                }
            }
            // Aliases of an already-seen physical device collapse onto the
            // first entry, whose canonical path prefers the by-id form.
            if !seen.insert(name.clone()) {
                debug!("duplicate candidate for /dev/{name} ignored");
                continue;
            }

            let Some(sectors) = self.provider.sector_count(&name) else {
                warn!("skipping /dev/{name}: size unreadable");
                continue;
            };
            let size_bytes = sectors * SECTOR_SIZE;
            let model = self
                .provider
                .model(&name)
                .filter(|model| !model.is_empty())
                .unwrap_or_else(|| "Unknown".to_string());
            let path = self
                .provider
                .by_id_path(&name)
                .unwrap_or_else(|| format!("/dev/{name}"));

            devices.push(DeviceInfo {
                path,
                kernel_name: name,
                size_bytes,
                size_gb: round_gb(size_bytes),
                model,
            });
        }
        devices
    }
}

/// Decimal gigabytes rounded to two places. The rounding point is fixed
/// here, before any size comparison, so independent detection passes can
/// never disagree on classification.
fn round_gb(size_bytes: u64) -> f64 {
    (size_bytes as f64 / 1e9 * 100.0).round() / 100.0
}

/// Linux implementation backed by `/sys/block`, `/dev/disk/by-id`,
/// `/proc/mounts` and `blkid`. All roots are injectable for tests.
pub struct SysBlockProvider {
    sys_block: PathBuf,
    by_id: PathBuf,
    mounts: PathBuf,
    boot_override: Option<String>,
}

impl Default for SysBlockProvider {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
            by_id: PathBuf::from("/dev/disk/by-id"),
            mounts: PathBuf::from("/proc/mounts"),
            boot_override: None,
        }
    }
}

impl SysBlockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a provider rooted at arbitrary paths. Used by tests with a
    /// synthetic sysfs tree; the boot device is pinned rather than probed.
    pub fn with_roots(
        sys_block: impl Into<PathBuf>,
        by_id: impl Into<PathBuf>,
        mounts: impl Into<PathBuf>,
        boot_device: Option<String>,
    ) -> Self {
        Self {
            sys_block: sys_block.into(),
            by_id: by_id.into(),
            mounts: mounts.into(),
            boot_override: boot_device,
        }
    }

    fn read_sys_file(&self, kernel_name: &str, file: &str) -> Option<String> {
        let path = self.sys_block.join(kernel_name).join(file);
        fs::read_to_string(path)
            .ok()
            .map(|content| content.trim().to_string())
    }
}

impl DeviceInfoProvider for SysBlockProvider {
    fn block_devices(&self) -> Result<Vec<String>, CloneError> {
        let entries = fs::read_dir(&self.sys_block)
            .map_err(|err| CloneError::DetectionFailed(err.to_string()))?;
        let mut names = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            // /sys/block entries are symlinks to device directories.
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn sector_count(&self, kernel_name: &str) -> Option<u64> {
        self.read_sys_file(kernel_name, "size")?.parse().ok()
    }

    fn model(&self, kernel_name: &str) -> Option<String> {
        self.read_sys_file(kernel_name, "device/model")
    }

    fn by_id_path(&self, kernel_name: &str) -> Option<String> {
        let entries = fs::read_dir(&self.by_id).ok()?;
        for entry in entries.filter_map(Result::ok) {
            let Ok(target) = fs::canonicalize(entry.path()) else {
                continue;
            };
            if target.file_name().is_some_and(|name| name == kernel_name) {
                return Some(entry.path().to_string_lossy().to_string());
            }
        }
        None
    }

    fn boot_device(&self) -> Option<String> {
        if let Some(boot) = &self.boot_override {
            return Some(boot.clone());
        }
        let disks = Disks::new_with_refreshed_list();
        for disk in disks.iter() {
            if disk.mount_point() == Path::new("/") {
                let node = PathBuf::from("/dev").join(disk.name());
                let name = node.file_name()?.to_string_lossy().to_string();
                return Some(parent_kernel_name(&name));
            }
        }
        None
    }

    fn partitions(&self, kernel_name: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.sys_block.join(kernel_name)) else {
            return Vec::new();
        };
        let mut partitions = entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with(kernel_name) && name.len() > kernel_name.len())
            .collect::<Vec<_>>();
        partitions.sort();
        partitions
    }

    fn filesystem_type(&self, device_path: &str) -> Option<String> {
        let output = Command::new("blkid")
            .args(["-s", "TYPE", "-o", "value", device_path])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let fs_type = String::from_utf8_lossy(&output.stdout)
            .trim()
            .to_lowercase();
        (!fs_type.is_empty()).then_some(fs_type)
    }

    fn mount_point(&self, device_path: &str) -> Option<String> {
        let resolved = fs::canonicalize(device_path)
            .map(|path| path.to_string_lossy().to_string())
            .unwrap_or_else(|_| device_path.to_string());
        let table = fs::read_to_string(&self.mounts).ok()?;
        for line in table.lines() {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount = fields.next()?;
            if device == device_path || device == resolved {
                return Some(mount.to_string());
            }
        }
        None
    }
}

/// Strips a partition suffix off a kernel name (`sda1` -> `sda`,
/// `mmcblk0p2` -> `mmcblk0`). Used to exclude the boot device's parent.
fn parent_kernel_name(name: &str) -> String {
    if name.starts_with("mmcblk") || name.starts_with("nvme") {
        if let Some(index) = name.rfind('p') {
            return name[..index].to_string();
        }
        return name.to_string();
    }
    name.trim_end_matches(|c: char| c.is_ascii_digit())
        .to_string()
}
