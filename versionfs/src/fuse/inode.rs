//! Inode numbers handed to the kernel, mapped onto backing paths.

use std::collections::HashMap;

use crate::backend::ObjectHandle;

pub const ROOT_INO: u64 = 1;

pub struct InodeTable {
    paths: HashMap<u64, ObjectHandle>,
    inodes: HashMap<ObjectHandle, u64>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inodes: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.paths.insert(ROOT_INO, ObjectHandle::root());
        table.inodes.insert(ObjectHandle::root(), ROOT_INO);
        table
    }

    /// Inode of `handle`, allocating one on first sight.
    pub fn ino_of(&mut self, handle: &ObjectHandle) -> u64 {
        if let Some(ino) = self.inodes.get(handle) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.paths.insert(ino, handle.clone());
        self.inodes.insert(handle.clone(), ino);
        ino
    }

    pub fn handle(&self, ino: u64) -> Option<ObjectHandle> {
        self.paths.get(&ino).cloned()
    }

    /// Drop the mapping of a removed object. The root is never dropped.
    pub fn remove(&mut self, handle: &ObjectHandle) {
        if handle.is_root() {
            return;
        }
        if let Some(ino) = self.inodes.remove(handle) {
            self.paths.remove(&ino);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_and_allocation() {
        let mut t = InodeTable::new();
        assert_eq!(t.handle(ROOT_INO), Some(ObjectHandle::root()));
        let a = ObjectHandle::new("/a");
        let ino = t.ino_of(&a);
        assert_eq!(ino, 2);
        assert_eq!(t.ino_of(&ObjectHandle::new("a/")), ino);
        assert_eq!(t.handle(ino), Some(a.clone()));

        t.remove(&a);
        assert_eq!(t.handle(ino), None);
        assert_ne!(t.ino_of(&a), ino);

        t.remove(&ObjectHandle::root());
        assert_eq!(t.handle(ROOT_INO), Some(ObjectHandle::root()));
    }
}
