//! In-process backend: a path-keyed tree held in memory.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{AttrMode, Backend, DirEntry, ObjectAttr, ObjectHandle, ObjectKind, check_name};
use crate::error::{Result, VersionError};

struct Node {
    kind: ObjectKind,
    mode: u32,
    data: Vec<u8>,
    attrs: HashMap<String, Vec<u8>>,
    // insertion order is the enumeration order
    children: Vec<String>,
}

impl Node {
    fn dir(mode: u32) -> Self {
        Self {
            kind: ObjectKind::Dir,
            mode,
            data: Vec::new(),
            attrs: HashMap::new(),
            children: Vec::new(),
        }
    }

    fn file(mode: u32) -> Self {
        Self {
            kind: ObjectKind::File,
            mode,
            data: Vec::new(),
            attrs: HashMap::new(),
            children: Vec::new(),
        }
    }
}

pub struct MemoryBackend {
    nodes: Mutex<HashMap<String, Node>>,
    attributes: bool,
    copy_limit: Mutex<Option<u64>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::dir(0o755));
        Self {
            nodes: Mutex::new(nodes),
            attributes: true,
            copy_limit: Mutex::new(None),
        }
    }

    /// A store whose objects reject every attribute call with `Unsupported`.
    pub fn without_attributes() -> Self {
        Self {
            attributes: false,
            ..Self::new()
        }
    }

    /// Cap every `copy_range` at `limit` bytes to simulate short copies.
    pub fn set_copy_limit(&self, limit: Option<u64>) {
        *self.copy_limit.lock().unwrap() = limit;
    }

    pub fn exists(&self, path: &str) -> bool {
        let path = ObjectHandle::new(path);
        self.nodes.lock().unwrap().contains_key(path.path())
    }

    /// Raw content of a file, bypassing handles.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let path = ObjectHandle::new(path);
        self.nodes
            .lock()
            .unwrap()
            .get(path.path())
            .map(|n| n.data.clone())
    }

    fn insert_child(&self, parent: &ObjectHandle, name: &str, node: Node) -> Result<ObjectHandle> {
        check_name(name)?;
        let child = parent.child(name);
        let mut nodes = self.nodes.lock().unwrap();
        match nodes.get(parent.path()) {
            None => return Err(VersionError::not_found(parent.path())),
            Some(p) if p.kind != ObjectKind::Dir => {
                return Err(VersionError::invalid(format!("{parent} is not a directory")));
            }
            _ => {}
        }
        if nodes.contains_key(child.path()) {
            return Err(VersionError::AlreadyExists(child.path().into()));
        }
        nodes.insert(child.path().into(), node);
        if let Some(p) = nodes.get_mut(parent.path()) {
            p.children.push(name.to_string());
        }
        Ok(child)
    }

    fn remove_child(&self, parent: &ObjectHandle, name: &str, kind: ObjectKind) -> Result<()> {
        check_name(name)?;
        let child = parent.child(name);
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get(child.path())
            .ok_or_else(|| VersionError::not_found(child.path()))?;
        if node.kind != kind {
            return Err(VersionError::invalid(format!("{child}: wrong object kind")));
        }
        if !node.children.is_empty() {
            return Err(VersionError::io(format!("{child}: directory not empty")));
        }
        nodes.remove(child.path());
        if let Some(p) = nodes.get_mut(parent.path()) {
            p.children.retain(|c| c != name);
        }
        Ok(())
    }

    fn check_attributes(&self, obj: &ObjectHandle) -> Result<()> {
        if self.attributes {
            Ok(())
        } else {
            Err(VersionError::Unsupported(format!(
                "{obj}: attributes not supported"
            )))
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn resolve(&self, path: &str) -> Result<ObjectHandle> {
        let h = ObjectHandle::parse(path)?;
        if self.nodes.lock().unwrap().contains_key(h.path()) {
            Ok(h)
        } else {
            Err(VersionError::not_found(h.path()))
        }
    }

    async fn lookup(&self, parent: &ObjectHandle, name: &str) -> Result<ObjectHandle> {
        check_name(name)?;
        let child = parent.child(name);
        if self.nodes.lock().unwrap().contains_key(child.path()) {
            Ok(child)
        } else {
            Err(VersionError::not_found(child.path()))
        }
    }

    async fn create(&self, parent: &ObjectHandle, name: &str, mode: u32) -> Result<ObjectHandle> {
        self.insert_child(parent, name, Node::file(mode))
    }

    async fn mkdir(&self, parent: &ObjectHandle, name: &str, mode: u32) -> Result<ObjectHandle> {
        self.insert_child(parent, name, Node::dir(mode))
    }

    async fn unlink(&self, parent: &ObjectHandle, name: &str) -> Result<()> {
        self.remove_child(parent, name, ObjectKind::File)
    }

    async fn rmdir(&self, parent: &ObjectHandle, name: &str) -> Result<()> {
        self.remove_child(parent, name, ObjectKind::Dir)
    }

    async fn stat(&self, obj: &ObjectHandle) -> Result<ObjectAttr> {
        let nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get(obj.path())
            .ok_or_else(|| VersionError::not_found(obj.path()))?;
        Ok(ObjectAttr {
            kind: node.kind,
            size: node.data.len() as u64,
            mode: node.mode,
        })
    }

    async fn read(&self, obj: &ObjectHandle, offset: u64, len: usize) -> Result<Vec<u8>> {
        let nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get(obj.path())
            .ok_or_else(|| VersionError::not_found(obj.path()))?;
        let start = (offset as usize).min(node.data.len());
        let end = start.saturating_add(len).min(node.data.len());
        Ok(node.data[start..end].to_vec())
    }

    async fn write(&self, obj: &ObjectHandle, offset: u64, data: &[u8]) -> Result<usize> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(obj.path())
            .ok_or_else(|| VersionError::not_found(obj.path()))?;
        let start = offset as usize;
        let end = start + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    async fn truncate(&self, obj: &ObjectHandle, len: u64) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(obj.path())
            .ok_or_else(|| VersionError::not_found(obj.path()))?;
        node.data.resize(len as usize, 0);
        Ok(())
    }

    async fn copy_range(&self, src: &ObjectHandle, dst: &ObjectHandle, len: u64) -> Result<u64> {
        let limit = *self.copy_limit.lock().unwrap();
        let mut nodes = self.nodes.lock().unwrap();
        let data = {
            let s = nodes
                .get(src.path())
                .ok_or_else(|| VersionError::not_found(src.path()))?;
            let mut n = (len as usize).min(s.data.len());
            if let Some(limit) = limit {
                n = n.min(limit as usize);
            }
            s.data[..n].to_vec()
        };
        let d = nodes
            .get_mut(dst.path())
            .ok_or_else(|| VersionError::not_found(dst.path()))?;
        if d.data.len() < data.len() {
            d.data.resize(data.len(), 0);
        }
        d.data[..data.len()].copy_from_slice(&data);
        Ok(data.len() as u64)
    }

    async fn get_attribute(&self, obj: &ObjectHandle, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_attributes(obj)?;
        let nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get(obj.path())
            .ok_or_else(|| VersionError::not_found(obj.path()))?;
        Ok(node.attrs.get(key).cloned())
    }

    async fn set_attribute(
        &self,
        obj: &ObjectHandle,
        key: &str,
        value: &[u8],
        mode: AttrMode,
    ) -> Result<()> {
        self.check_attributes(obj)?;
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(obj.path())
            .ok_or_else(|| VersionError::not_found(obj.path()))?;
        let present = node.attrs.contains_key(key);
        match mode {
            AttrMode::CreateIfAbsent if present => {
                return Err(VersionError::AlreadyExists(format!("{obj}: {key}")));
            }
            AttrMode::ReplaceExisting if !present => {
                return Err(VersionError::not_found(format!("{obj}: {key}")));
            }
            _ => {}
        }
        node.attrs.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn enumerate(&self, dir: &ObjectHandle) -> Result<Vec<DirEntry>> {
        let nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get(dir.path())
            .ok_or_else(|| VersionError::not_found(dir.path()))?;
        if node.kind != ObjectKind::Dir {
            return Err(VersionError::invalid(format!("{dir} is not a directory")));
        }
        let mut out = Vec::with_capacity(node.children.len());
        for (i, name) in node.children.iter().enumerate() {
            let Some(child) = nodes.get(dir.child(name).path()) else {
                continue;
            };
            out.push(DirEntry {
                name: name.clone(),
                kind: child.kind,
                offset: i as u64 + 1,
            });
        }
        Ok(out)
    }
}
