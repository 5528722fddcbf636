//! Typed access to the version window stored on a tracked file.

use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

use crate::backend::{AttrMode, Backend, ObjectHandle};
use crate::error::{Result, VersionError};

pub const MIN_KEY: &str = "user.min_version";
pub const MAX_KEY: &str = "user.max_version";
pub const CUR_KEY: &str = "user.cur_version";
pub const NUM_KEY: &str = "user.num_version";

/// The four counters describing a tracked file's retained history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionMeta {
    /// Oldest live index in the window.
    pub min: u32,
    /// Newest index allocated to the window.
    pub max: u32,
    /// Most recently created index, 0 before the first backup.
    pub cur: u32,
    /// Number of live slots.
    pub num: u32,
}

impl Default for VersionMeta {
    fn default() -> Self {
        Self {
            min: 1,
            max: 4,
            cur: 0,
            num: 0,
        }
    }
}

impl fmt::Display for VersionMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "min={} max={} cur={} num={}",
            self.min, self.max, self.cur, self.num
        )
    }
}

bitflags! {
    /// Selects which counters a `set` call writes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MetaFields: u8 {
        const MIN = 1;
        const MAX = 1 << 1;
        const CUR = 1 << 2;
        const NUM = 1 << 3;
        const ALL = Self::MIN.bits() | Self::MAX.bits() | Self::CUR.bits() | Self::NUM.bits();
    }
}

fn encode(v: u32) -> [u8; 4] {
    (v as i32).to_ne_bytes()
}

fn decode(key: &str, raw: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| VersionError::io(format!("{key}: expected 4 bytes, got {}", raw.len())))?;
    let v = i32::from_ne_bytes(bytes);
    u32::try_from(v).map_err(|_| VersionError::io(format!("{key}: negative counter {v}")))
}

/// Reads and writes the window counters. Makes no atomicity guarantee;
/// callers serialize through the ring manager's per-file lock.
pub struct MetaStore<B: Backend> {
    backend: Arc<B>,
}

impl<B: Backend> MetaStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    async fn get_one(&self, file: &ObjectHandle, key: &str) -> Result<u32> {
        match self.backend.get_attribute(file, key).await? {
            Some(raw) => decode(key, &raw),
            None => Err(VersionError::not_found(format!("{file}: {key} not set"))),
        }
    }

    /// Load all four counters. `NotFound` if the window was never initialized.
    pub async fn get(&self, file: &ObjectHandle) -> Result<VersionMeta> {
        Ok(VersionMeta {
            min: self.get_one(file, MIN_KEY).await?,
            max: self.get_one(file, MAX_KEY).await?,
            cur: self.get_one(file, CUR_KEY).await?,
            num: self.get_one(file, NUM_KEY).await?,
        })
    }

    /// Write the selected counters of `meta`, in max, min, cur, num order.
    pub async fn set(
        &self,
        file: &ObjectHandle,
        meta: &VersionMeta,
        fields: MetaFields,
        mode: AttrMode,
    ) -> Result<()> {
        let plan = [
            (MetaFields::MAX, MAX_KEY, meta.max),
            (MetaFields::MIN, MIN_KEY, meta.min),
            (MetaFields::CUR, CUR_KEY, meta.cur),
            (MetaFields::NUM, NUM_KEY, meta.num),
        ];
        for (field, key, value) in plan {
            if fields.contains(field) {
                self.backend
                    .set_attribute(file, key, &encode(value), mode)
                    .await?;
            }
        }
        Ok(())
    }

    /// Write the default window if absent. Calling it again is a no-op.
    pub async fn initialize(&self, file: &ObjectHandle) -> Result<()> {
        let defaults = VersionMeta::default();
        let plan = [
            (MAX_KEY, defaults.max),
            (MIN_KEY, defaults.min),
            (CUR_KEY, defaults.cur),
            (NUM_KEY, defaults.num),
        ];
        for (key, value) in plan {
            match self
                .backend
                .set_attribute(file, key, &encode(value), AttrMode::CreateIfAbsent)
                .await
            {
                Ok(()) | Err(VersionError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// `get`, initializing the default window first when it is missing.
    pub async fn load_or_init(&self, file: &ObjectHandle) -> Result<VersionMeta> {
        match self.get(file).await {
            Err(e) if e.is_not_found() => {
                self.initialize(file).await?;
                self.get(file).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    async fn tracked(be: &MemoryBackend) -> ObjectHandle {
        be.create(&ObjectHandle::root(), "t.txt", 0o644).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_before_initialize_is_not_found() {
        let be = Arc::new(MemoryBackend::new());
        let f = tracked(&be).await;
        let store = MetaStore::new(be.clone());
        assert!(store.get(&f).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let be = Arc::new(MemoryBackend::new());
        let f = tracked(&be).await;
        let store = MetaStore::new(be.clone());
        store.initialize(&f).await.unwrap();
        let custom = VersionMeta {
            min: 2,
            max: 5,
            cur: 5,
            num: 4,
        };
        store
            .set(&f, &custom, MetaFields::ALL, AttrMode::ReplaceExisting)
            .await
            .unwrap();
        store.initialize(&f).await.unwrap();
        assert_eq!(store.get(&f).await.unwrap(), custom);
    }

    #[tokio::test]
    async fn test_set_selected_fields_only() {
        let be = Arc::new(MemoryBackend::new());
        let f = tracked(&be).await;
        let store = MetaStore::new(be.clone());
        let meta = store.load_or_init(&f).await.unwrap();
        assert_eq!(meta, VersionMeta::default());

        let next = VersionMeta {
            cur: 1,
            num: 9,
            ..meta
        };
        store
            .set(&f, &next, MetaFields::CUR, AttrMode::ReplaceExisting)
            .await
            .unwrap();
        let got = store.get(&f).await.unwrap();
        assert_eq!(got.cur, 1);
        assert_eq!(got.num, 0);
    }

    #[tokio::test]
    async fn test_unsupported_backend_surfaces() {
        let be = Arc::new(MemoryBackend::without_attributes());
        let f = tracked(&be).await;
        let store = MetaStore::new(be.clone());
        assert!(matches!(
            store.initialize(&f).await,
            Err(VersionError::Unsupported(_))
        ));
        assert!(matches!(
            store.get(&f).await,
            Err(VersionError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_counter_is_io_error() {
        let be = Arc::new(MemoryBackend::new());
        let f = tracked(&be).await;
        let store = MetaStore::new(be.clone());
        store.initialize(&f).await.unwrap();
        be.set_attribute(&f, NUM_KEY, b"xy", AttrMode::ReplaceExisting)
            .await
            .unwrap();
        assert!(matches!(store.get(&f).await, Err(VersionError::Io(_))));
    }
}
