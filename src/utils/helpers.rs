/// Helper utilities for the QiTlalli backup CLI

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::utils::COMPOSE_FILE;

/// Get the project root directory (where docker-compose.yml is located)
pub fn get_project_root() -> Result<PathBuf> {
    use crate::utils::AppConfig;

    // 1. Check environment variable
    if let Ok(project_root) = std::env::var("QITLALLI_PROJECT_ROOT") {
        let path = PathBuf::from(project_root);
        if path.join(COMPOSE_FILE).exists() {
            return Ok(path);
        }
    }

    // 2. Check saved configuration
    if let Ok(config) = AppConfig::load() {
        if let Some(root) = config.project_root {
            let path = PathBuf::from(&root);
            if path.join(COMPOSE_FILE).exists() {
                return Ok(path);
            }
        }
    }

    // 3. Search for docker-compose.yml in current and parent directories
    let current_dir = std::env::current_dir()
        .context("Failed to get current directory")?;

    if let Some(found) = find_compose_root(&current_dir) {
        if let Ok(mut config) = AppConfig::load() {
            let _ = config.set_project_root(found.clone());
        }
        return Ok(found);
    }

    anyhow::bail!(
        "Could not find the QiTlalli project (no {} found)\n\n\
        Option 1 - Set environment variable:\n\
          export QITLALLI_PROJECT_ROOT=/path/to/qitlalli\n\n\
        Option 2 - Run from the project directory:\n\
          cd /path/to/qitlalli && qitlalli-backup backup list\n\n\
        Option 3 - Pass it explicitly:\n\
          qitlalli-backup --project-root /path/to/qitlalli backup list",
        COMPOSE_FILE
    )
}

/// Walk up from `start` looking for a directory containing docker-compose.yml
pub fn find_compose_root(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(d) = dir {
        if d.join(COMPOSE_FILE).exists() {
            return Some(d.to_path_buf());
        }
        dir = d.parent();
    }
    None
}

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format duration to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// SHA-256 of a file, hex encoded. Streams the file.
pub fn sha256_file<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Recursively copy `src` into `dst`, overwriting files that exist in both.
/// Files only present in `dst` are left alone. Returns the number of files copied.
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Remove everything inside `dir` but keep `dir` itself (it may be a mount point)
pub fn clear_dir_contents(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        return fs::create_dir_all(dir);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }

    Ok(())
}

/// Total size of a file or directory tree in bytes
pub fn path_size(path: &Path) -> u64 {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return 0;
    };

    if !metadata.is_dir() {
        return metadata.len();
    }

    fs::read_dir(path)
        .map(|entries| {
            entries
                .flatten()
                .map(|entry| path_size(&entry.path()))
                .sum()
        })
        .unwrap_or(0)
}

/// Free space on the disk holding `path`, if it can be determined
pub fn available_space(path: &Path) -> Option<u64> {
    use sysinfo::Disks;

    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();

    // Longest mount point that prefixes the path wins
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Parse Docker container status to simplified state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Paused,
    Restarting,
    Dead,
    Unknown,
}

impl From<&str> for ContainerState {
    fn from(status: &str) -> Self {
        let status_lower = status.to_lowercase();
        if status_lower.contains("up") || status_lower.contains("running") {
            ContainerState::Running
        } else if status_lower.contains("paused") {
            ContainerState::Paused
        } else if status_lower.contains("restarting") {
            ContainerState::Restarting
        } else if status_lower.contains("dead") || status_lower.contains("removing") {
            ContainerState::Dead
        } else if status_lower.contains("exited") || status_lower.contains("stopped") {
            ContainerState::Stopped
        } else {
            ContainerState::Unknown
        }
    }
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Running => "Running",
            ContainerState::Stopped => "Stopped",
            ContainerState::Paused => "Paused",
            ContainerState::Restarting => "Restarting",
            ContainerState::Dead => "Dead",
            ContainerState::Unknown => "Unknown",
        }
    }
}
