//! Host probe capability
//!
//! Looks up per-PID credentials and working directory, system uptime and
//! filesystem free space. The production implementation reads procfs; on
//! platforms without it every probe answers [`ProbeError::Unsupported`]
//! and callers degrade accordingly.

use std::path::{Path, PathBuf};

use crate::error::ProbeError;

/// Host introspection used by the file-transfer engine and heartbeat.
pub trait HostProbe: Send + Sync {
    /// Real uid of the process `pid`.
    fn uid_of_pid(&self, pid: u32) -> Result<u32, ProbeError>;

    /// Real gid of the process `pid`.
    fn gid_of_pid(&self, pid: u32) -> Result<u32, ProbeError>;

    /// Current working directory of the process `pid`.
    fn cwd_of_pid(&self, pid: u32) -> Result<PathBuf, ProbeError>;

    /// Path behind file descriptor `fd` of the process `pid`.
    fn path_of_pid_fd(&self, pid: u32, fd: u32) -> Result<PathBuf, ProbeError>;

    /// System uptime in seconds; 0 when unknown.
    fn uptime_seconds(&self) -> u32;

    /// Succeeds when the filesystem holding `path` has at least `need`
    /// bytes available, otherwise returns [`ProbeError::NoSpace`].
    fn free_space_for(&self, path: &Path, need: u64) -> Result<(), ProbeError>;
}

/// procfs-backed [`HostProbe`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcProbe;

#[cfg(unix)]
mod unix {
    use std::fs;
    use std::io::{BufRead, BufReader};
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    use std::path::{Path, PathBuf};

    use super::{HostProbe, ProcProbe};
    use crate::error::ProbeError;

    impl HostProbe for ProcProbe {
        fn uid_of_pid(&self, pid: u32) -> Result<u32, ProbeError> {
            read_status_id(pid, "Uid:", "uid")
        }

        fn gid_of_pid(&self, pid: u32) -> Result<u32, ProbeError> {
            read_status_id(pid, "Gid:", "gid")
        }

        fn cwd_of_pid(&self, pid: u32) -> Result<PathBuf, ProbeError> {
            Ok(fs::read_link(format!("/proc/{pid}/cwd"))?)
        }

        fn path_of_pid_fd(&self, pid: u32, fd: u32) -> Result<PathBuf, ProbeError> {
            Ok(fs::read_link(format!("/proc/{pid}/fd/{fd}"))?)
        }

        fn uptime_seconds(&self) -> u32 {
            fs::read_to_string("/proc/uptime")
                .ok()
                .and_then(|s| s.split_whitespace().next()?.parse::<f64>().ok())
                .map(|secs| secs as u32)
                .unwrap_or(0)
        }

        fn free_space_for(&self, path: &Path, need: u64) -> Result<(), ProbeError> {
            let mount = find_mount_point(path)?;

            let avail = if mount.fstype == "ramfs" {
                available_ram()?
            } else {
                available_space(&mount.mount_point)?
            };

            if need > avail {
                return Err(ProbeError::NoSpace { need, avail });
            }

            Ok(())
        }
    }

    struct MountInfo {
        mount_point: PathBuf,
        fstype: String,
    }

    /// Parse `/proc/<pid>/status` for a `Uid:`/`Gid:` line. The real id is
    /// the first field after the label.
    fn read_status_id(pid: u32, label: &str, what: &'static str) -> Result<u32, ProbeError> {
        let file = fs::File::open(format!("/proc/{pid}/status"))?;

        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Some(rest) = line.strip_prefix(label) {
                return rest
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or(ProbeError::Parse { pid, what });
            }
        }

        Err(ProbeError::Parse { pid, what })
    }

    /// Find the mount entry holding `path`: an exact mount-point match wins,
    /// otherwise the last entry on the same device. `rootfs` is skipped so
    /// the overmounted root is reported instead.
    fn find_mount_point(path: &Path) -> Result<MountInfo, ProbeError> {
        let meta = fs::metadata(path)?;

        if meta.file_type().is_block_device() || meta.file_type().is_char_device() {
            return Err(ProbeError::MountPointNotFound(path.to_path_buf()));
        }

        let device = meta.dev();
        let mut best: Option<MountInfo> = None;

        let file = fs::File::open("/proc/mounts")?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let mut fields = line.split_whitespace();
            let (Some(_dev), Some(mount_point), Some(fstype)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            if fstype == "rootfs" {
                continue;
            }

            if Path::new(mount_point) == path {
                return Ok(MountInfo {
                    mount_point: mount_point.into(),
                    fstype: fstype.to_string(),
                });
            }

            if let Ok(m) = fs::metadata(mount_point) {
                if m.dev() == device {
                    best = Some(MountInfo {
                        mount_point: mount_point.into(),
                        fstype: fstype.to_string(),
                    });
                }
            }
        }

        best.ok_or_else(|| ProbeError::MountPointNotFound(path.to_path_buf()))
    }

    /// ramfs has no backing store, so "free space" is free RAM.
    fn available_ram() -> Result<u64, ProbeError> {
        let file = fs::File::open("/proc/meminfo")?;

        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Some(rest) = line.strip_prefix("MemAvailable:") {
                let kib: u64 = rest
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or(ProbeError::Parse {
                        pid: 0,
                        what: "MemAvailable",
                    })?;
                return Ok(kib * 1024);
            }
        }

        Err(ProbeError::Parse {
            pid: 0,
            what: "MemAvailable",
        })
    }

    fn available_space(mount_point: &Path) -> Result<u64, ProbeError> {
        let stat = nix::sys::statfs::statfs(mount_point)
            .map_err(|e| ProbeError::Io(std::io::Error::from(e)))?;

        Ok(stat.blocks_available() as u64 * stat.block_size() as u64)
    }

}

#[cfg(not(unix))]
impl HostProbe for ProcProbe {
    fn uid_of_pid(&self, _pid: u32) -> Result<u32, ProbeError> {
        Err(ProbeError::Unsupported)
    }

    fn gid_of_pid(&self, _pid: u32) -> Result<u32, ProbeError> {
        Err(ProbeError::Unsupported)
    }

    fn cwd_of_pid(&self, _pid: u32) -> Result<PathBuf, ProbeError> {
        Err(ProbeError::Unsupported)
    }

    fn path_of_pid_fd(&self, _pid: u32, _fd: u32) -> Result<PathBuf, ProbeError> {
        Err(ProbeError::Unsupported)
    }

    fn uptime_seconds(&self) -> u32 {
        0
    }

    fn free_space_for(&self, _path: &Path, _need: u64) -> Result<(), ProbeError> {
        Err(ProbeError::Unsupported)
    }
}
