//! Bounded ring of backup slots per tracked file.
//!
//! The window only records its boundaries (`min`, `max`, `cur`) and a live
//! count, not which indices are live. Removing a boundary slot therefore
//! scans for the next surviving slot, while removing an interior slot just
//! decrements the count and leaves a hole.
//!
//! Every mutation runs under a [`WindowGuard`], an exclusive per-file lock
//! held across the whole read-modify-write of the counters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::meta::{MetaFields, MetaStore, VersionMeta};
use super::snapshot::{SlotWrite, SnapshotWriter};
use super::{CAPACITY, backup_name, slot_index};
use crate::backend::{AttrMode, Backend, ObjectHandle};
use crate::error::{Result, VersionError};

/// Proof that the caller holds the version lock of one tracked file.
pub struct WindowGuard {
    file: ObjectHandle,
    _guard: OwnedMutexGuard<()>,
}

impl WindowGuard {
    pub fn file(&self) -> &ObjectHandle {
        &self.file
    }
}

pub struct RingManager<B: Backend> {
    backend: Arc<B>,
    meta: MetaStore<B>,
    writer: SnapshotWriter<B>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<B: Backend> RingManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            meta: MetaStore::new(backend.clone()),
            writer: SnapshotWriter::new(backend.clone()),
            backend,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn meta(&self) -> &MetaStore<B> {
        &self.meta
    }

    /// Take the version lock of `file`, waiting for any other mutator.
    pub async fn lock(&self, file: &ObjectHandle) -> WindowGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            // an entry referenced only by the table has no holder and no waiter
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(file.path().to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        WindowGuard {
            file: file.clone(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Handle of the slot holding version `index`, or `NotFound`.
    pub async fn slot(&self, file: &ObjectHandle, index: u32) -> Result<ObjectHandle> {
        self.backend
            .lookup(&file.parent(), &backup_name(file.name(), index))
            .await
    }

    pub async fn slot_exists(&self, file: &ObjectHandle, index: u32) -> Result<bool> {
        match self.slot(file, index).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn remove_slot(&self, file: &ObjectHandle, index: u32) -> Result<()> {
        let name = backup_name(file.name(), index);
        self.backend.unlink(&file.parent(), &name).await
    }

    /// First surviving index in `from..=to`.
    async fn scan_forward(&self, file: &ObjectHandle, from: u32, to: u32) -> Result<Option<u32>> {
        for i in from..=to {
            if self.slot_exists(file, i).await? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Last surviving index in `to..=from`, scanning downwards.
    async fn scan_backward(&self, file: &ObjectHandle, from: u32, to: u32) -> Result<Option<u32>> {
        for i in (to..=from).rev() {
            if self.slot_exists(file, i).await? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Drop the oldest slot of a full window and advance its boundaries.
    async fn evict_oldest(&self, file: &ObjectHandle, meta: &mut VersionMeta) -> Result<()> {
        let candidate_max = meta.max + 1;
        let new_min = self
            .scan_forward(file, meta.min + 1, candidate_max - 1)
            .await?
            .ok_or_else(|| {
                VersionError::not_found(format!(
                    "{file}: no surviving slot after {} ({meta})",
                    meta.min
                ))
            })?;

        let old_min = meta.min;
        self.remove_slot(file, old_min).await?;
        meta.min = new_min;
        meta.max = candidate_max;
        meta.num -= 1;
        self.meta
            .set(
                file,
                meta,
                MetaFields::MIN | MetaFields::MAX | MetaFields::NUM,
                AttrMode::ReplaceExisting,
            )
            .await?;
        info!("[ring] {file}: evicted version {old_min}, window now {meta}");
        Ok(())
    }

    /// Create a new backup of the guarded file, evicting the oldest slot
    /// first when the window is full. Returns the new slot.
    pub async fn create_backup(&self, guard: &WindowGuard) -> Result<ObjectHandle> {
        let file = guard.file();
        let mut meta = self.meta.load_or_init(file).await?;

        if meta.num >= CAPACITY {
            self.evict_oldest(file, &mut meta).await?;
        }

        meta.cur += 1;
        self.meta
            .set(file, &meta, MetaFields::CUR, AttrMode::ReplaceExisting)
            .await?;

        let written = match self.writer.write_slot(file, meta.cur).await {
            // nothing live sits above `cur`, so a slot here is left over from
            // an earlier file of the same name
            Err(VersionError::AlreadyExists(_)) => {
                warn!("[ring] {file}: replacing stale slot {}", meta.cur);
                self.remove_slot(file, meta.cur).await?;
                self.writer.write_slot(file, meta.cur).await?
            }
            other => other?,
        };

        match written {
            SlotWrite::Complete(slot) => {
                meta.num += 1;
                self.meta
                    .set(file, &meta, MetaFields::NUM, AttrMode::ReplaceExisting)
                    .await?;
                debug!("[ring] {file}: created version {}, window now {meta}", meta.cur);
                Ok(slot)
            }
            SlotWrite::Partial(slot, e) => {
                // a slot left behind by a failed copy still counts as live
                meta.num += 1;
                if let Err(e) = self
                    .meta
                    .set(file, &meta, MetaFields::NUM, AttrMode::ReplaceExisting)
                    .await
                {
                    warn!("[ring] {file}: failed to count partial slot {slot}: {e}");
                }
                Err(e)
            }
        }
    }

    /// Remove every backup slot of the guarded file. Used once the tracked
    /// file itself is gone; returns how many slots were removed.
    pub async fn purge_slots(&self, guard: &WindowGuard) -> Result<usize> {
        let file = guard.file();
        let dir = file.parent();
        let mut removed = 0;
        for entry in self.backend.enumerate(&dir).await? {
            if slot_index(file.name(), &entry.name).is_some() {
                self.backend.unlink(&dir, &entry.name).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("[ring] {file}: purged {removed} backup slots");
        }
        Ok(removed)
    }

    /// Remove version `index` of the guarded file and repair the window.
    ///
    /// A missing slot fails with `NotFound` before any counter is touched.
    pub async fn delete_version(&self, guard: &WindowGuard, index: u32) -> Result<VersionMeta> {
        let file = guard.file();
        let mut meta = self.meta.get(file).await?;
        self.remove_slot(file, index).await?;

        if index == meta.min {
            if meta.min == meta.cur {
                meta = VersionMeta::default();
            } else {
                match self.scan_forward(file, meta.min + 1, meta.cur).await? {
                    Some(i) => meta.min = i,
                    None => warn!("[ring] {file}: no slot survives above {index}, min left at {}", meta.min),
                }
                meta.num = meta.num.saturating_sub(1);
            }
        } else if index == meta.max {
            if meta.num == 1 {
                meta = VersionMeta::default();
            } else {
                meta.num = meta.num.saturating_sub(1);
                match self
                    .scan_backward(file, meta.cur.saturating_sub(1), meta.min)
                    .await?
                {
                    Some(i) => {
                        meta.cur = i;
                        meta.max = i;
                    }
                    None => warn!("[ring] {file}: no slot survives below {index}, max left at {}", meta.max),
                }
            }
        } else {
            meta.num = meta.num.saturating_sub(1);
        }

        self.meta
            .set(file, &meta, MetaFields::ALL, AttrMode::ReplaceExisting)
            .await?;
        debug!("[ring] {file}: deleted version {index}, window now {meta}");
        Ok(meta)
    }
}
