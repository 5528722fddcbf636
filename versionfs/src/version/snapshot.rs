//! Materializes backup slots.

use std::sync::Arc;

use super::backup_name;
use crate::backend::{Backend, ObjectHandle};
use crate::error::{Result, VersionError};

/// Permission bits of a new backup slot.
pub const SLOT_MODE: u32 = 0o644;

/// Result of writing a slot that this call created.
#[derive(Debug)]
pub enum SlotWrite {
    Complete(ObjectHandle),
    /// The slot exists but the copy into it failed or came up short.
    Partial(ObjectHandle, VersionError),
}

pub struct SnapshotWriter<B: Backend> {
    backend: Arc<B>,
}

impl<B: Backend> SnapshotWriter<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Create the slot for version `index` of `tracked` and copy the tracked
    /// file's current bytes into it.
    ///
    /// `Err` means no slot was created: `AlreadyExists` if the name is
    /// taken, `Io` for any other create failure. A slot whose copy fails is
    /// left in place and reported as [`SlotWrite::Partial`].
    pub async fn write_slot(&self, tracked: &ObjectHandle, index: u32) -> Result<SlotWrite> {
        let dir = tracked.parent();
        let name = backup_name(tracked.name(), index);
        let slot = match self.backend.create(&dir, &name, SLOT_MODE).await {
            Ok(slot) => slot,
            Err(e @ VersionError::AlreadyExists(_)) => return Err(e),
            Err(e) => return Err(VersionError::io(format!("create {name}: {e}"))),
        };

        let size = match self.backend.stat(tracked).await {
            Ok(attr) => attr.size,
            Err(e) => return Ok(SlotWrite::Partial(slot, e)),
        };
        match self.backend.copy_range(tracked, &slot, size).await {
            Ok(copied) if copied < size => {
                let e = VersionError::io(format!(
                    "short copy into {slot}: {copied} of {size} bytes"
                ));
                Ok(SlotWrite::Partial(slot, e))
            }
            Ok(_) => Ok(SlotWrite::Complete(slot)),
            Err(e) => Ok(SlotWrite::Partial(slot, e)),
        }
    }

    /// [`write_slot`](Self::write_slot) with a partial copy reported as its error.
    pub async fn snapshot(&self, tracked: &ObjectHandle, index: u32) -> Result<ObjectHandle> {
        match self.write_slot(tracked, index).await? {
            SlotWrite::Complete(slot) => Ok(slot),
            SlotWrite::Partial(_, e) => Err(e),
        }
    }
}
