use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use tracing::{debug, info, warn};

use crate::catalog::DeviceInfoProvider;
use crate::error::CloneError;
use crate::model::{CloneStrategy, DevicePair, PartitionDescriptor};
use crate::strategy::{mkfs_argv, select_strategy};

/// Narrow seam over external tool invocation. The clone control logic only
/// ever talks to subprocesses through this trait, so it runs unchanged
/// against a recording fake in tests.
pub trait ProcessRunner {
    /// Runs a command to completion, discarding output. Non-zero exit is
    /// an error.
    fn run(&self, argv: &[&str]) -> Result<(), CloneError>;

    /// Runs a command to completion, forwarding each output line. Must not
    /// return before the process has fully terminated: progress output is
    /// drained to EOF and the exit status is always awaited, so "success"
    /// can never race ahead of the tool's own flushing.
    fn run_streaming(
        &self,
        argv: &[&str],
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), CloneError>;
}

/// Real runner backed by `std::process::Command`.
pub struct CommandRunner;

impl ProcessRunner for CommandRunner {
    fn run(&self, argv: &[&str]) -> Result<(), CloneError> {
        let command = argv.join(" ");
        info!("executing: {command}");
        let output = Command::new(argv[0])
            .args(&argv[1..])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| CloneError::CommandSpawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                warn!("{}: {}", argv[0], stderr.trim());
            }
            return Err(CloneError::CommandFailed {
                command,
                code: output.status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    fn run_streaming(
        &self,
        argv: &[&str],
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), CloneError> {
        let command = argv.join(" ");
        info!("executing: {command}");
        let mut child = Command::new(argv[0])
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CloneError::CommandSpawn {
                command: command.clone(),
                source,
            })?;

        // Tools like dd report progress on stderr. It is drained on a
        // helper thread so a chatty stream cannot deadlock against the
        // stdout read; its lines are forwarded once the stream closes.
        let stderr_lines = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                BufReader::new(stderr)
                    .lines()
                    .map_while(Result::ok)
                    .collect::<Vec<_>>()
            })
        });

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(line) => on_line(&line),
                    Err(_) => break,
                }
            }
        }
        if let Some(handle) = stderr_lines {
            if let Ok(lines) = handle.join() {
                for line in &lines {
                    on_line(line);
                }
            }
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(CloneError::CommandFailed {
                command,
                code: status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

/// Tracks mounts performed during a clone so they can be released on every
/// exit path. Unmount failures are logged, not propagated: cleanup is
/// best-effort and must never mask the original error.
struct MountSession<'a> {
    runner: &'a dyn ProcessRunner,
    mounted: Vec<PathBuf>,
}

impl<'a> MountSession<'a> {
    fn new(runner: &'a dyn ProcessRunner) -> Self {
        Self {
            runner,
            mounted: Vec::new(),
        }
    }

    fn mount(&mut self, device: &str, target: &Path) -> Result<(), CloneError> {
        fs::create_dir_all(target)?;
        let target_str = target.to_string_lossy();
        self.runner.run(&["mount", device, &target_str])?;
        self.mounted.push(target.to_path_buf());
        Ok(())
    }

    fn release_all(&mut self) {
        // reverse order: last mounted, first released
        while let Some(target) = self.mounted.pop() {
            let target_str = target.to_string_lossy();
            if let Err(err) = self.runner.run(&["umount", &target_str]) {
                warn!("failed to unmount {}: {err}", target.display());
            }
        }
    }
}

/// Executes a validated clone. Both entry points are blocking and
/// synchronous; any subprocess exiting non-zero is fatal for the whole
/// attempt. Size constraints were already checked by classification and
/// are not re-validated here.
pub struct CloneExecutor<'a> {
    runner: &'a dyn ProcessRunner,
    provider: &'a dyn DeviceInfoProvider,
    scratch_dir: PathBuf,
}

impl<'a> CloneExecutor<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, provider: &'a dyn DeviceInfoProvider) -> Self {
        Self {
            runner,
            provider,
            scratch_dir: PathBuf::from("/mnt"),
        }
    }

    /// Where temporary mount points for content copies get created.
    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    /// Clones a validated pair. Partition-aware when the source exposes a
    /// partition table, whole-device otherwise.
    pub fn clone_pair(
        &self,
        pair: &DevicePair,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<(), CloneError> {
        let partitions = self.provider.partitions(&pair.source.kernel_name);
        if partitions.is_empty() {
            info!(
                "no partitions found on {}; using whole-device copy",
                pair.source.path
            );
            return self.whole_device_copy(&pair.source.path, &pair.destination.path, on_progress);
        }
        self.partition_aware_copy(pair, &partitions, on_progress)
    }

    /// Block-for-block copy of the entire source onto the destination,
    /// followed by a forced flush of buffered writes before success is
    /// reported. The unconditional, always-safe fallback.
    pub fn whole_device_copy(
        &self,
        source: &str,
        dest: &str,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<(), CloneError> {
        let if_arg = format!("if={source}");
        let of_arg = format!("of={dest}");
        self.runner.run_streaming(
            &["dd", &if_arg, &of_arg, "bs=4M", "status=progress", "conv=fsync"],
            on_progress,
        )?;
        self.runner.run(&["sync"])
    }

    /// Replicates the partition table, then clones each source partition
    /// with the strategy its filesystem calls for. The first failure
    /// abandons all remaining partitions; no partial success is reported.
    pub fn partition_aware_copy(
        &self,
        pair: &DevicePair,
        partitions: &[String],
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<(), CloneError> {
        let source_dev = format!("/dev/{}", pair.source.kernel_name);
        let dest_dev = format!("/dev/{}", pair.destination.kernel_name);

        info!("replicating partition table {source_dev} -> {dest_dev}");
        self.runner.run(&["sgdisk", "-R", &dest_dev, &source_dev])?;
        self.runner.run(&["partprobe", &dest_dev])?;

        let mut mounts = MountSession::new(self.runner);
        let result = self.copy_partitions(pair, partitions, &mut mounts, on_progress);
        // Scoped acquisition: whatever is still mounted when we get here,
        // success or failure, gets released before control returns.
        mounts.release_all();
        result
    }

    fn copy_partitions(
        &self,
        pair: &DevicePair,
        partitions: &[String],
        mounts: &mut MountSession<'_>,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<(), CloneError> {
        for partition in partitions {
            let descriptor = self.describe_partition(pair, partition);
            debug!(
                "partition {} ({}) -> {}",
                descriptor.source_path, descriptor.fs_type, descriptor.dest_path
            );
            match select_strategy(&descriptor.fs_type) {
                CloneStrategy::FilesystemAware => {
                    self.filesystem_copy(&descriptor, mounts, on_progress)?
                }
                CloneStrategy::RawBlockCopy => {
                    info!(
                        "raw copy for {} (type {})",
                        descriptor.source_path, descriptor.fs_type
                    );
                    self.whole_device_copy(
                        &descriptor.source_path,
                        &descriptor.dest_path,
                        on_progress,
                    )?
                }
            }
        }
        Ok(())
    }

    fn describe_partition(&self, pair: &DevicePair, partition: &str) -> PartitionDescriptor {
        let source_path = format!("/dev/{partition}");
        let number = partition
            .strip_prefix(pair.source.kernel_name.as_str())
            .unwrap_or(partition)
            .trim_start_matches('p');
        let fs_type = self
            .provider
            .filesystem_type(&source_path)
            .unwrap_or_else(|| "unknown".to_string());
        PartitionDescriptor {
            source_path,
            dest_path: partition_node(&pair.destination.kernel_name, number),
            fs_type,
        }
    }

    /// Fresh filesystem on the destination partition, then a content-level
    /// copy. The source is mounted only if it is not already mounted, and
    /// every mount performed here is released by the caller's session.
    fn filesystem_copy(
        &self,
        descriptor: &PartitionDescriptor,
        mounts: &mut MountSession<'_>,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<(), CloneError> {
        let Some(argv) = mkfs_argv(&descriptor.fs_type, &descriptor.dest_path) else {
            // The selector guarantees a known type here; treat a miss as a
            // raw-copy fallback rather than failing the attempt.
            return self.whole_device_copy(
                &descriptor.source_path,
                &descriptor.dest_path,
                on_progress,
            );
        };
        let argv_refs = argv.iter().map(String::as_str).collect::<Vec<_>>();
        self.runner.run(&argv_refs)?;

        let dest_mount = self.scratch_dir.join("clone-dest");
        mounts.mount(&descriptor.dest_path, &dest_mount)?;

        let source_root = match self.provider.mount_point(&descriptor.source_path) {
            Some(existing) => PathBuf::from(existing),
            None => {
                let source_mount = self.scratch_dir.join("clone-source");
                mounts.mount(&descriptor.source_path, &source_mount)?;
                source_mount
            }
        };

        let source_arg = format!("{}/", source_root.display());
        let dest_arg = format!("{}/", dest_mount.display());
        self.runner.run_streaming(
            &[
                "rsync",
                "-avh",
                "--progress",
                "--exclude",
                "/lost+found",
                &source_arg,
                &dest_arg,
            ],
            &mut |line| {
                // progress for content copies comes from rsync's
                // incremental percentage output
                if line.contains('%') {
                    on_progress(line);
                }
            },
        )?;

        // free the scratch mount points for the next partition
        mounts.release_all();
        Ok(())
    }
}

/// Device node for partition `number` of `parent` under udev naming rules:
/// parents ending in a digit get a `p` separator (`mmcblk1` -> `mmcblk1p2`).
fn partition_node(parent: &str, number: &str) -> String {
    if parent.ends_with(|c: char| c.is_ascii_digit()) {
        format!("/dev/{parent}p{number}")
    } else {
        format!("/dev/{parent}{number}")
    }
}
