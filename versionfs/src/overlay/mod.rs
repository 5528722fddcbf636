//! Versioning overlay over a [`Backend`].
//!
//! Ordinary traffic passes straight through to the backing store. Each open
//! handle gets its own [`OpenSession`] whose dirty flag is raised by a
//! successful write; releasing a dirty session of a tracked file takes a
//! backup through the ring manager. Directory listings hide backup slots.
pub mod filter;

use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{Backend, DirEntry, ObjectAttr, ObjectHandle, ObjectKind};
use crate::control::{Dispatcher, RawRequest};
use crate::error::{Result, VersionError};
use crate::version::is_backup_name;
use crate::version::query::QueryEngine;
use crate::version::ring::RingManager;

/// State of one open handle.
#[derive(Clone, Debug)]
pub struct OpenSession {
    pub object: ObjectHandle,
    pub dirty: bool,
}

impl OpenSession {
    /// Only ordinary files get backups; slots opened directly never do.
    fn versioned(&self) -> bool {
        !is_backup_name(self.object.name())
    }
}

pub struct VersionedOverlay<B: Backend> {
    backend: Arc<B>,
    ring: Arc<RingManager<B>>,
    dispatcher: Arc<Dispatcher<B>>,
    sessions: Mutex<HashMap<u64, OpenSession>>,
    next_fh: AtomicU64,
}

impl<B: Backend> VersionedOverlay<B> {
    pub fn new(backend: Arc<B>) -> Self {
        let ring = Arc::new(RingManager::new(backend.clone()));
        let query = Arc::new(QueryEngine::new(backend.clone(), ring.clone()));
        let dispatcher = Arc::new(Dispatcher::new(backend.clone(), query));
        Self {
            backend,
            ring,
            dispatcher,
            sessions: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn ring(&self) -> &Arc<RingManager<B>> {
        &self.ring
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher<B>> {
        self.dispatcher.clone()
    }

    fn session(&self, fh: u64) -> Result<OpenSession> {
        self.sessions
            .lock()
            .unwrap()
            .get(&fh)
            .cloned()
            .ok_or_else(|| VersionError::invalid(format!("unknown file handle {fh}")))
    }

    /// Register a new session on an already resolved file.
    pub fn open_handle(&self, object: ObjectHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .unwrap()
            .insert(fh, OpenSession { object, dirty: false });
        fh
    }

    /// Open an existing regular file by path.
    pub async fn open(&self, path: &str) -> Result<u64> {
        let object = self.backend.resolve(path).await?;
        self.open_object(object).await
    }

    pub async fn open_object(&self, object: ObjectHandle) -> Result<u64> {
        if self.backend.stat(&object).await?.kind != ObjectKind::File {
            return Err(VersionError::invalid(format!("{object} is not a regular file")));
        }
        Ok(self.open_handle(object))
    }

    /// Create a regular file under `parent` and open a session on it.
    pub async fn create(&self, parent: &ObjectHandle, name: &str, mode: u32) -> Result<(ObjectHandle, u64)> {
        if is_backup_name(name) {
            return Err(VersionError::invalid(format!("{name}: reserved backup name")));
        }
        let object = self.backend.create(parent, name, mode).await?;
        let fh = self.open_handle(object.clone());
        Ok((object, fh))
    }

    pub async fn mkdir(&self, parent: &ObjectHandle, name: &str, mode: u32) -> Result<ObjectHandle> {
        if is_backup_name(name) {
            return Err(VersionError::invalid(format!("{name}: reserved backup name")));
        }
        self.backend.mkdir(parent, name, mode).await
    }

    pub async fn read(&self, fh: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        let session = self.session(fh)?;
        self.backend.read(&session.object, offset, len).await
    }

    /// Write through and mark the session dirty when the write succeeded.
    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let session = self.session(fh)?;
        let written = self.backend.write(&session.object, offset, data).await?;
        if let Some(s) = self.sessions.lock().unwrap().get_mut(&fh) {
            s.dirty = true;
        }
        Ok(written)
    }

    pub async fn truncate(&self, object: &ObjectHandle, len: u64) -> Result<()> {
        self.backend.truncate(object, len).await
    }

    pub fn is_dirty(&self, fh: u64) -> Option<bool> {
        self.sessions.lock().unwrap().get(&fh).map(|s| s.dirty)
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Close a session. A dirty session of a tracked file is backed up first;
    /// a failed backup is logged and the handle is released regardless.
    pub async fn release(&self, fh: u64) {
        let Some(session) = self.sessions.lock().unwrap().remove(&fh) else {
            warn!("[overlay] release of unknown handle {fh}");
            return;
        };
        if !session.dirty || !session.versioned() {
            return;
        }

        let guard = self.ring.lock(&session.object).await;
        match self.ring.create_backup(&guard).await {
            Ok(slot) => debug!("[overlay] {}: backed up to {slot}", session.object),
            Err(e) => error!("[overlay] {}: close-time backup failed: {e}", session.object),
        }
    }

    /// Visible entries of `dir` after the cursor `offset`.
    pub async fn readdir(&self, dir: &ObjectHandle, offset: u64) -> Result<Vec<DirEntry>> {
        let entries = self.backend.enumerate(dir).await?;
        Ok(filter::visible_entries(entries, offset))
    }

    pub async fn lookup(&self, parent: &ObjectHandle, name: &str) -> Result<ObjectHandle> {
        self.backend.lookup(parent, name).await
    }

    pub async fn stat(&self, object: &ObjectHandle) -> Result<ObjectAttr> {
        self.backend.stat(object).await
    }

    /// Unlink a file and drop its backup slots, so a file created later
    /// under the same name starts with an empty history.
    pub async fn unlink(&self, parent: &ObjectHandle, name: &str) -> Result<()> {
        if is_backup_name(name) {
            return Err(VersionError::invalid(format!("{name}: reserved backup name")));
        }
        let file = parent.child(name);
        let guard = self.ring.lock(&file).await;
        self.backend.unlink(parent, name).await?;
        if let Err(e) = self.ring.purge_slots(&guard).await {
            warn!("[overlay] {file}: unlinked but slots remain: {e}");
        }
        Ok(())
    }

    pub async fn rmdir(&self, parent: &ObjectHandle, name: &str) -> Result<()> {
        self.backend.rmdir(parent, name).await
    }

    /// Run an administrative request against the tracked file at `path`.
    pub async fn control(&self, path: &str, request: &RawRequest) -> Result<Vec<u8>> {
        let mut out = BytesMut::new();
        self.dispatcher.dispatch(path, request, &mut out).await?;
        Ok(out.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::control::Opcode;
    use crate::version::meta::VersionMeta;

    fn overlay() -> VersionedOverlay<MemoryBackend> {
        VersionedOverlay::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_clean_close_takes_no_backup() {
        let ov = overlay();
        let (file, fh) = ov.create(&ObjectHandle::root(), "a", 0o644).await.unwrap();
        assert_eq!(ov.read(fh, 0, 16).await.unwrap(), b"");
        ov.release(fh).await;
        assert!(ov.ring().meta().get(&file).await.unwrap_err().is_not_found());
        assert_eq!(ov.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_dirty_close_takes_backup() {
        let ov = overlay();
        let (file, fh) = ov.create(&ObjectHandle::root(), "a", 0o644).await.unwrap();
        ov.write(fh, 0, b"first").await.unwrap();
        assert_eq!(ov.is_dirty(fh), Some(true));
        ov.release(fh).await;

        let meta = ov.ring().meta().get(&file).await.unwrap();
        assert_eq!(meta, VersionMeta { min: 1, max: 4, cur: 1, num: 1 });
        assert_eq!(ov.backend().contents("/.backup.a.1").unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_dirty_flags_are_per_session() {
        let ov = overlay();
        let root = ObjectHandle::root();
        let (a, fa) = ov.create(&root, "a", 0o644).await.unwrap();
        let (b, fb) = ov.create(&root, "b", 0o644).await.unwrap();
        let fa2 = ov.open("/a").await.unwrap();

        ov.write(fa, 0, b"x").await.unwrap();
        assert_eq!(ov.is_dirty(fa), Some(true));
        assert_eq!(ov.is_dirty(fa2), Some(false));
        assert_eq!(ov.is_dirty(fb), Some(false));

        ov.release(fb).await;
        ov.release(fa2).await;
        assert!(ov.ring().meta().get(&b).await.unwrap_err().is_not_found());
        assert!(ov.ring().meta().get(&a).await.unwrap_err().is_not_found());

        ov.release(fa).await;
        assert_eq!(ov.ring().meta().get(&a).await.unwrap().num, 1);
    }

    #[tokio::test]
    async fn test_two_writers_each_back_up() {
        let ov = overlay();
        let (file, f1) = ov.create(&ObjectHandle::root(), "s", 0o644).await.unwrap();
        let f2 = ov.open("/s").await.unwrap();
        ov.write(f1, 0, b"one").await.unwrap();
        ov.write(f2, 0, b"two").await.unwrap();
        ov.release(f1).await;
        ov.release(f2).await;
        assert_eq!(ov.ring().meta().get(&file).await.unwrap().num, 2);
    }

    #[tokio::test]
    async fn test_backup_failure_does_not_fail_close() {
        let ov = VersionedOverlay::new(Arc::new(MemoryBackend::without_attributes()));
        let (_, fh) = ov.create(&ObjectHandle::root(), "a", 0o644).await.unwrap();
        ov.write(fh, 0, b"data").await.unwrap();
        ov.release(fh).await;
        assert_eq!(ov.open_sessions(), 0);
        assert!(!ov.backend().exists("/.backup.a.1"));
    }

    #[tokio::test]
    async fn test_slots_are_never_versioned() {
        let ov = overlay();
        let (_, fh) = ov.create(&ObjectHandle::root(), "a", 0o644).await.unwrap();
        ov.write(fh, 0, b"v1").await.unwrap();
        ov.release(fh).await;

        let slot = ov.open("/.backup.a.1").await.unwrap();
        ov.write(slot, 0, b"edited").await.unwrap();
        ov.release(slot).await;
        assert!(!ov.backend().exists("/.backup..backup.a.1.1"));
    }

    #[tokio::test]
    async fn test_reserved_names_are_refused() {
        let ov = overlay();
        let err = ov.create(&ObjectHandle::root(), ".backup.x.1", 0o644).await.unwrap_err();
        assert!(matches!(err, VersionError::InvalidArgument(_)));
        let err = ov.mkdir(&ObjectHandle::root(), ".backup.d", 0o755).await.unwrap_err();
        assert!(matches!(err, VersionError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_unlink_of_slot_is_refused() {
        let ov = overlay();
        let (_, fh) = ov.create(&ObjectHandle::root(), "a", 0o644).await.unwrap();
        ov.write(fh, 0, b"v1").await.unwrap();
        ov.release(fh).await;

        let err = ov.unlink(&ObjectHandle::root(), ".backup.a.1").await.unwrap_err();
        assert!(matches!(err, VersionError::InvalidArgument(_)));
        assert!(ov.backend().exists("/.backup.a.1"));
    }

    #[tokio::test]
    async fn test_recreated_file_starts_clean() {
        let ov = overlay();
        let root = ObjectHandle::root();
        let (_, fh) = ov.create(&root, "a", 0o644).await.unwrap();
        ov.write(fh, 0, b"OLD FILE").await.unwrap();
        ov.release(fh).await;
        // a neighbour whose name extends "a" keeps its history
        let (_, fh) = ov.create(&root, "a.b", 0o644).await.unwrap();
        ov.write(fh, 0, b"other").await.unwrap();
        ov.release(fh).await;

        ov.unlink(&root, "a").await.unwrap();
        assert!(!ov.backend().exists("/.backup.a.1"));
        assert!(ov.backend().exists("/.backup.a.b.1"));

        let (file, fh) = ov.create(&root, "a", 0o644).await.unwrap();
        ov.write(fh, 0, b"new").await.unwrap();
        ov.release(fh).await;

        let meta = ov.ring().meta().get(&file).await.unwrap();
        assert_eq!(meta, VersionMeta { min: 1, max: 4, cur: 1, num: 1 });
        let view = ov.control("/a", &RawRequest::new(Opcode::View, Some(-1), 4096)).await.unwrap();
        assert_eq!(view, b"new");
    }

    #[tokio::test]
    async fn test_readdir_hides_slots() {
        let ov = overlay();
        let root = ObjectHandle::root();
        for name in ["a", "b"] {
            let (_, fh) = ov.create(&root, name, 0o644).await.unwrap();
            ov.write(fh, 0, name.as_bytes()).await.unwrap();
            ov.release(fh).await;
        }
        let names: Vec<String> = ov
            .readdir(&root, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_control_round_trip() {
        let ov = overlay();
        let (_, fh) = ov.create(&ObjectHandle::root(), "a", 0o644).await.unwrap();
        ov.write(fh, 0, b"hello").await.unwrap();
        ov.release(fh).await;

        let list = ov.control("/a", &RawRequest::new(Opcode::List, Some(0), 0)).await.unwrap();
        assert_eq!(list, b":1");
        let view = ov.control("/a", &RawRequest::new(Opcode::View, Some(1), 3)).await.unwrap();
        assert_eq!(view, b"hel");
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let ov = overlay();
        assert!(matches!(
            ov.read(42, 0, 1).await,
            Err(VersionError::InvalidArgument(_))
        ));
        ov.release(42).await;
    }
}
