//! Mount helpers for starting/stopping the FUSE session
//!
//! Notes:
//! - Only supported on Linux. Unprivileged mounts go through fusermount3.
//! - Thin wrappers over rfuse3 raw Session APIs.

use std::path::Path;

use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};

use super::VersionFs;
use crate::backend::Backend;

/// Mount-time knobs taken from the daemon configuration.
#[derive(Clone, Debug)]
pub struct MountSettings {
    pub fs_name: String,
    pub allow_other: bool,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            fs_name: "versionfs".into(),
            allow_other: false,
        }
    }
}

fn mount_options(settings: &MountSettings) -> MountOptions {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let mut mo = MountOptions::default();
    mo.fs_name(&settings.fs_name).uid(uid).gid(gid);
    if settings.allow_other {
        mo.allow_other(true);
    }
    mo
}

/// Mount `fs` on an empty directory through fusermount3.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged<B: Backend + 'static>(
    fs: VersionFs<B>,
    mount_point: impl AsRef<Path>,
    settings: &MountSettings,
) -> std::io::Result<MountHandle> {
    Session::new(mount_options(settings))
        .mount_with_unprivileged(fs, mount_point.as_ref())
        .await
}

/// Mount `fs` directly; needs CAP_SYS_ADMIN.
#[cfg(target_os = "linux")]
pub async fn mount_privileged<B: Backend + 'static>(
    fs: VersionFs<B>,
    mount_point: impl AsRef<Path>,
    settings: &MountSettings,
) -> std::io::Result<MountHandle> {
    Session::new(mount_options(settings))
        .mount(fs, mount_point.as_ref())
        .await
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged<B: Backend + 'static>(
    _fs: VersionFs<B>,
    _mount_point: impl AsRef<Path>,
    _settings: &MountSettings,
) -> std::io::Result<MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}

#[cfg(not(target_os = "linux"))]
pub async fn mount_privileged<B: Backend + 'static>(
    fs: VersionFs<B>,
    mount_point: impl AsRef<Path>,
    settings: &MountSettings,
) -> std::io::Result<MountHandle> {
    mount_unprivileged(fs, mount_point, settings).await
}
