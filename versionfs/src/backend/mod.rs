//! Object proxy layer consumed by the overlay.
//!
//! Responsibilities:
//! - Map a virtual path onto a backing object and hand out stable handles.
//! - Pass ordinary read/write/truncate traffic through to the backing store.
//! - Store the per-file version counters as named attributes.
//!
//! Submodules:
//! - `localfs`: host directory backend (tokio::fs + xattr)
//! - `memory`: in-process backend used by tests and demos
pub mod localfs;
pub mod memory;

use async_trait::async_trait;
use std::fmt;

use crate::error::{Result, VersionError};

/// Handle to a backing object: its normalized path below the backing root.
///
/// Two lookups of the same path yield equal handles.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    path: String,
}

impl ObjectHandle {
    pub fn root() -> Self {
        Self { path: "/".into() }
    }

    pub fn new(path: &str) -> Self {
        Self {
            path: norm_path(path),
        }
    }

    /// Like [`new`](Self::new), but for untrusted input: a `..` component
    /// would escape the backing root and is refused.
    pub fn parse(path: &str) -> Result<Self> {
        if path.split('/').any(|c| c == "..") {
            return Err(VersionError::invalid(format!("{path}: parent components not allowed")));
        }
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// Final path component; empty for the root.
    pub fn name(&self) -> &str {
        let n = self.path.rfind('/').unwrap_or(0);
        &self.path[n + 1..]
    }

    pub fn parent(&self) -> ObjectHandle {
        let n = self.path.rfind('/').unwrap_or(0);
        if n == 0 {
            ObjectHandle::root()
        } else {
            ObjectHandle {
                path: self.path[..n].into(),
            }
        }
    }

    pub fn child(&self, name: &str) -> ObjectHandle {
        if self.is_root() {
            ObjectHandle::new(name)
        } else {
            ObjectHandle::new(&format!("{}/{}", self.path, name))
        }
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Check a single directory entry name handed in from outside.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(VersionError::invalid(format!("invalid entry name {name:?}")));
    }
    Ok(())
}

pub(crate) fn norm_path(p: &str) -> String {
    let parts: Vec<&str> = p
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Dir,
}

#[derive(Clone, Debug)]
pub struct ObjectAttr {
    pub kind: ObjectKind,
    pub size: u64,
    pub mode: u32,
}

/// One entry of a backing directory listing.
///
/// `offset` is the cursor a caller passes back to resume after this entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: ObjectKind,
    pub offset: u64,
}

/// Semantics of an attribute write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrMode {
    /// Fail with `AlreadyExists` if the key is present.
    CreateIfAbsent,
    /// Fail with `NotFound` if the key is absent.
    ReplaceExisting,
}

/// Narrow interface the overlay consumes from the backing store.
///
/// All calls are fallible and may block on I/O.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open an existing object by path.
    async fn resolve(&self, path: &str) -> Result<ObjectHandle>;

    async fn lookup(&self, parent: &ObjectHandle, name: &str) -> Result<ObjectHandle>;

    async fn create(&self, parent: &ObjectHandle, name: &str, mode: u32) -> Result<ObjectHandle>;

    async fn mkdir(&self, parent: &ObjectHandle, name: &str, mode: u32) -> Result<ObjectHandle>;

    async fn unlink(&self, parent: &ObjectHandle, name: &str) -> Result<()>;

    async fn rmdir(&self, parent: &ObjectHandle, name: &str) -> Result<()>;

    async fn stat(&self, obj: &ObjectHandle) -> Result<ObjectAttr>;

    async fn read(&self, obj: &ObjectHandle, offset: u64, len: usize) -> Result<Vec<u8>>;

    async fn write(&self, obj: &ObjectHandle, offset: u64, data: &[u8]) -> Result<usize>;

    async fn truncate(&self, obj: &ObjectHandle, len: u64) -> Result<()>;

    /// Copy up to `len` bytes from the start of `src` to the start of `dst`,
    /// returning the number of bytes transferred.
    async fn copy_range(&self, src: &ObjectHandle, dst: &ObjectHandle, len: u64) -> Result<u64>;

    /// `Ok(None)` when the key is absent, `Unsupported` when the object cannot carry attributes.
    async fn get_attribute(&self, obj: &ObjectHandle, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set_attribute(
        &self,
        obj: &ObjectHandle,
        key: &str,
        value: &[u8],
        mode: AttrMode,
    ) -> Result<()>;

    /// List a directory in the backing store's order.
    async fn enumerate(&self, dir: &ObjectHandle) -> Result<Vec<DirEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_normalize_paths() {
        assert_eq!(ObjectHandle::new("a//b/./c/"), ObjectHandle::new("/a/b/c"));
        assert_eq!(ObjectHandle::new("").path(), "/");
        let h = ObjectHandle::new("/a/b/c.txt");
        assert_eq!(h.name(), "c.txt");
        assert_eq!(h.parent().path(), "/a/b");
        assert_eq!(ObjectHandle::new("/top").parent(), ObjectHandle::root());
        assert_eq!(ObjectHandle::root().child("x").path(), "/x");
        assert_eq!(h.parent().child("d").path(), "/a/b/d");
    }

    #[test]
    fn untrusted_paths_cannot_climb_out() {
        assert_eq!(ObjectHandle::parse("/a/./b").unwrap().path(), "/a/b");
        assert!(ObjectHandle::parse("/../outside/secret").is_err());
        assert!(ObjectHandle::parse("a/../../b").is_err());
        assert!(ObjectHandle::parse("..").is_err());
        assert!(ObjectHandle::parse("/a/..b").is_ok());

        assert!(check_name("notes.txt").is_ok());
        for bad in ["", ".", "..", "a/b", "../x"] {
            assert!(check_name(bad).is_err(), "{bad:?} accepted");
        }
    }
}
