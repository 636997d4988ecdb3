//! Config files from the mounted ConfigMap and output files shared with the
//! host through a bind mount.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{HostUpgradesError, Result};

pub const FILE_MODE_DEFAULT: u32 = 0o644;
pub const FILE_MODE_SCRIPT: u32 = 0o755;

/// Config directory (optional) and host mount.
///
/// The host mount is assumed to be visible at the same path on the host, so
/// paths returned here can be handed to commands executed on the host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    config_path: Option<PathBuf>,
    mount: PathBuf,
}

impl HostConfig {
    /// A missing config directory means "no config files". The host mount is
    /// required.
    pub fn load(config_path: &Path, host_mount: &Path) -> Result<Self> {
        let config_path = if test_dir(config_path)? {
            info!(config_path = %config_path.display(), "Loading host config files");
            Some(config_path.to_path_buf())
        } else {
            info!(config_path = %config_path.display(), "No host config directory");
            None
        };

        if !test_dir(host_mount)? {
            return Err(HostUpgradesError::Host(format!(
                "Host mount {} does not exist",
                host_mount.display()
            )));
        }

        Ok(Self {
            config_path,
            mount: host_mount.to_path_buf(),
        })
    }

    pub fn mount(&self) -> &Path {
        &self.mount
    }

    pub fn host_path(&self, name: &str) -> PathBuf {
        self.mount.join(name)
    }

    fn config_file(&self, name: &str) -> Option<PathBuf> {
        self.config_path.as_ref().map(|path| path.join(name))
    }

    /// Whether a regular config file with this name was provided.
    pub fn file_exists(&self, name: &str) -> Result<bool> {
        let Some(path) = self.config_file(name) else {
            return Ok(false);
        };

        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(true),
            Ok(_) => Err(HostUpgradesError::Host(format!(
                "Not a file: {}",
                path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("stat", &path, e)),
        }
    }

    /// Atomically write a file into the host mount, returning its host path.
    pub fn write_host_file(&self, name: &str, contents: &[u8], mode: u32) -> Result<PathBuf> {
        let path = self.host_path(name);
        let temp = self.host_path(&format!("{}.tmp", name));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&temp)
            .map_err(|e| io_error("create", &temp, e))?;
        file.write_all(contents)
            .map_err(|e| io_error("write", &temp, e))?;
        file.sync_all().map_err(|e| io_error("sync", &temp, e))?;
        drop(file);

        fs::rename(&temp, &path).map_err(|e| io_error("rename", &path, e))?;

        debug!(path = %path.display(), bytes = contents.len(), "Wrote host file");
        Ok(path)
    }

    /// Copy a config file into the host mount, returning its host path.
    pub fn copy_host_file(&self, name: &str) -> Result<PathBuf> {
        let source = self
            .config_file(name)
            .ok_or_else(|| HostUpgradesError::Host(format!("No config file {}", name)))?;
        let contents = fs::read(&source).map_err(|e| io_error("read", &source, e))?;

        self.write_host_file(name, &contents, FILE_MODE_DEFAULT)
    }

    pub fn read_host_file(&self, name: &str) -> Result<String> {
        let path = self.host_path(name);
        fs::read_to_string(&path).map_err(|e| io_error("read", &path, e))
    }

    /// Modification time of a host file, `None` if it does not exist.
    pub fn stat_host_file(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let path = self.host_path(name);

        match fs::metadata(&path) {
            Ok(meta) => {
                let modified = meta.modified().map_err(|e| io_error("stat", &path, e))?;
                Ok(Some(DateTime::<Utc>::from(modified)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("stat", &path, e)),
        }
    }
}

fn test_dir(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(true),
        Ok(_) => Err(HostUpgradesError::Host(format!(
            "Not a directory: {}",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error("stat", path, e)),
    }
}

fn io_error(op: &str, path: &Path, err: std::io::Error) -> HostUpgradesError {
    HostUpgradesError::Host(format!("Failed to {} {}: {}", op, path.display(), err))
}
