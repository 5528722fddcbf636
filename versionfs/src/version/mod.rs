//! Version-retention engine
//!
//! Every tracked file keeps at most [`CAPACITY`] backup slots next to it in
//! the backing directory, named `.backup.<file>.<index>`. Indices come from a
//! per-file counter; it only moves backwards when the newest slot is deleted,
//! so the name of a live slot is never reused.
//!
//! Submodules:
//! - `meta`: the four window counters stored as attributes on the tracked file
//! - `ring`: backup creation with eviction, and version deletion with
//!   boundary repair, serialized per tracked file
//! - `snapshot`: copies the tracked file's content into a new slot
//! - `query`: list / view / restore / delete built on the ring
pub mod meta;
pub mod query;
pub mod ring;
pub mod snapshot;

use crate::error::{Result, VersionError};

/// Maximum number of live backup slots per tracked file.
pub const CAPACITY: u32 = 4;

/// Largest payload a single View request may return.
pub const MAX_VIEW_SIZE: usize = 4096;

/// Reserved name prefix of backup slots; never used by ordinary files.
pub const BACKUP_PREFIX: &str = ".backup.";

/// Name of the slot holding version `index` of `file_name`.
pub fn backup_name(file_name: &str, index: u32) -> String {
    format!("{BACKUP_PREFIX}{file_name}.{index}")
}

pub fn is_backup_name(name: &str) -> bool {
    name.starts_with(BACKUP_PREFIX)
}

/// Index of `entry` if it is a backup slot of `file_name`.
///
/// `.backup.a.b.1` belongs to `a.b`, never to `a`: the part after the file
/// name must be a bare index.
pub fn slot_index(file_name: &str, entry: &str) -> Option<u32> {
    let rest = entry.strip_prefix(BACKUP_PREFIX)?.strip_prefix(file_name)?;
    let digits = rest.strip_prefix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Version selector carried by administrative requests.
///
/// Raw encoding: `-2` oldest, `-1` newest, `0` the whole live range,
/// `N > 0` a specific index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionFlag {
    Oldest,
    Newest,
    All,
    Index(u32),
}

impl VersionFlag {
    pub fn as_raw(self) -> i32 {
        match self {
            VersionFlag::Oldest => -2,
            VersionFlag::Newest => -1,
            VersionFlag::All => 0,
            VersionFlag::Index(n) => n as i32,
        }
    }
}

impl TryFrom<i32> for VersionFlag {
    type Error = VersionError;

    fn try_from(raw: i32) -> Result<Self> {
        match raw {
            -2 => Ok(VersionFlag::Oldest),
            -1 => Ok(VersionFlag::Newest),
            0 => Ok(VersionFlag::All),
            n if n > 0 => Ok(VersionFlag::Index(n as u32)),
            n => Err(VersionError::invalid(format!("bad version flag {n}"))),
        }
    }
}
