//! Mount daemon configuration.
//!
//! ```yaml
//! backing_dir: /srv/data
//! mountpoint: /mnt/versioned
//! control_socket: /run/versionfs.sock
//! allow_other: false
//! ```
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fuse::mount::MountSettings;

fn default_fs_name() -> String {
    "versionfs".into()
}

fn default_unprivileged() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Directory whose files get versioned.
    pub backing_dir: PathBuf,
    pub mountpoint: PathBuf,
    /// Unix socket for administrative requests; none disables the channel.
    #[serde(default)]
    pub control_socket: Option<PathBuf>,
    #[serde(default = "default_fs_name")]
    pub fs_name: String,
    #[serde(default = "default_unprivileged")]
    pub unprivileged: bool,
    #[serde(default)]
    pub allow_other: bool,
    /// Attribute and entry cache lifetime handed to the kernel.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backing_dir: Option<PathBuf>,
    pub mountpoint: Option<PathBuf>,
    pub control_socket: Option<PathBuf>,
    pub fs_name: Option<String>,
    pub privileged: bool,
    pub allow_other: bool,
    pub ttl_secs: Option<u64>,
}

impl Config {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn mount_settings(&self) -> MountSettings {
        MountSettings {
            fs_name: self.fs_name.clone(),
            allow_other: self.allow_other,
        }
    }

    /// Build a config from the CLI alone; both directories are required.
    pub fn from_overrides(o: Overrides) -> Result<Self> {
        let (Some(backing_dir), Some(mountpoint)) = (o.backing_dir.clone(), o.mountpoint.clone())
        else {
            bail!("--backing and --mountpoint are required without --config");
        };
        let mut cfg = Config {
            backing_dir,
            mountpoint,
            control_socket: None,
            fs_name: default_fs_name(),
            unprivileged: default_unprivileged(),
            allow_other: false,
            ttl_secs: default_ttl_secs(),
        };
        cfg.apply(o);
        Ok(cfg)
    }

    pub fn apply(&mut self, o: Overrides) {
        if let Some(v) = o.backing_dir {
            self.backing_dir = v;
        }
        if let Some(v) = o.mountpoint {
            self.mountpoint = v;
        }
        if let Some(v) = o.control_socket {
            self.control_socket = Some(v);
        }
        if let Some(v) = o.fs_name {
            self.fs_name = v;
        }
        if o.privileged {
            self.unprivileged = false;
        }
        if o.allow_other {
            self.allow_other = true;
        }
        if let Some(v) = o.ttl_secs {
            self.ttl_secs = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backing_dir.is_dir() {
            bail!("backing dir {} is not a directory", self.backing_dir.display());
        }
        if !self.mountpoint.is_dir() {
            bail!("mountpoint {} is not a directory", self.mountpoint.display());
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
