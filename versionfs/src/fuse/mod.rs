//! FUSE adapter
//!
//! Exposes a [`VersionedOverlay`] to the kernel through `rfuse3`.
//!
//! Main components:
//! - `inode`: inode number <-> backing path table, root inode 1
//! - `mount`: mount helpers over `rfuse3::raw::Session`
//! - the `Filesystem` implementation for [`VersionFs`], which resolves
//!   inodes to backing handles and forwards to the overlay. Opens get an
//!   overlay session each; `release` is where close-time backups happen.
pub mod inode;
pub mod mount;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::Result as FuseResult;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::backend::{Backend, ObjectAttr, ObjectHandle, ObjectKind};
use crate::overlay::VersionedOverlay;
use inode::InodeTable;

const MAX_WRITE: NonZeroU32 = match NonZeroU32::new(1024 * 1024) {
    Some(n) => n,
    None => NonZeroU32::MIN,
};

// "." and ".." take the first two directory offsets
const DOT_ENTRIES: u64 = 2;

pub struct VersionFs<B: Backend> {
    overlay: Arc<VersionedOverlay<B>>,
    inodes: Mutex<InodeTable>,
    ttl: Duration,
}

impl<B: Backend> VersionFs<B> {
    pub fn new(overlay: Arc<VersionedOverlay<B>>, ttl: Duration) -> Self {
        Self {
            overlay,
            inodes: Mutex::new(InodeTable::new()),
            ttl,
        }
    }

    pub fn overlay(&self) -> &Arc<VersionedOverlay<B>> {
        &self.overlay
    }

    fn handle_of(&self, ino: u64) -> FuseResult<ObjectHandle> {
        self.inodes
            .lock()
            .unwrap()
            .handle(ino)
            .ok_or_else(|| libc::ENOENT.into())
    }

    fn ino_of(&self, handle: &ObjectHandle) -> u64 {
        self.inodes.lock().unwrap().ino_of(handle)
    }

    fn forget_handle(&self, handle: &ObjectHandle) {
        self.inodes.lock().unwrap().remove(handle);
    }

    async fn dir_of(&self, ino: u64) -> FuseResult<ObjectHandle> {
        let dir = self.handle_of(ino)?;
        let attr = self.overlay.stat(&dir).await.map_err(|e| e.errno())?;
        if attr.kind != ObjectKind::Dir {
            return Err(libc::ENOTDIR.into());
        }
        Ok(dir)
    }

    async fn entry_of(&self, handle: &ObjectHandle, req: &Request) -> FuseResult<ReplyEntry> {
        let attr = self.overlay.stat(handle).await.map_err(|e| e.errno())?;
        Ok(ReplyEntry {
            ttl: self.ttl,
            attr: to_fuse_attr(self.ino_of(handle), &attr, req),
            generation: 0,
        })
    }
}

impl<B: Backend + 'static> Filesystem for VersionFs<B> {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        info!("[fuse] init");
        Ok(ReplyInit {
            max_write: MAX_WRITE,
        })
    }

    async fn destroy(&self, _req: Request) {
        let open = self.overlay.open_sessions();
        if open > 0 {
            warn!("[fuse] destroy with {open} open sessions");
        }
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let dir = self.handle_of(parent)?;
        let child = self
            .overlay
            .lookup(&dir, &name.to_string_lossy())
            .await
            .map_err(|e| e.errno())?;
        self.entry_of(&child, &req).await
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let handle = self.handle_of(ino)?;
        let attr = self.overlay.stat(&handle).await.map_err(|e| e.errno())?;
        Ok(ReplyAttr {
            ttl: self.ttl,
            attr: to_fuse_attr(ino, &attr, &req),
        })
    }

    // only size changes are supported
    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let handle = self.handle_of(ino)?;
        if let Some(size) = set_attr.size {
            self.overlay
                .truncate(&handle, size)
                .await
                .map_err(|e| e.errno())?;
        }
        let attr = self.overlay.stat(&handle).await.map_err(|e| e.errno())?;
        Ok(ReplyAttr {
            ttl: self.ttl,
            attr: to_fuse_attr(ino, &attr, &req),
        })
    }

    async fn open(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let handle = self.handle_of(ino)?;
        let attr = self.overlay.stat(&handle).await.map_err(|e| e.errno())?;
        if attr.kind == ObjectKind::Dir {
            return Err(libc::EISDIR.into());
        }
        let fh = self
            .overlay
            .open_object(handle)
            .await
            .map_err(|e| e.errno())?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let dir = self.dir_of(parent).await?;
        let (object, fh) = self
            .overlay
            .create(&dir, &name.to_string_lossy(), mode & 0o7777)
            .await
            .map_err(|e| e.errno())?;
        let attr = self.overlay.stat(&object).await.map_err(|e| e.errno())?;
        Ok(ReplyCreated {
            ttl: self.ttl,
            attr: to_fuse_attr(self.ino_of(&object), &attr, &req),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = self
            .overlay
            .read(fh, offset, size as usize)
            .await
            .map_err(|e| e.errno())?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let written = self
            .overlay
            .write(fh, offset, data)
            .await
            .map_err(|e| e.errno())?;
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    // close-time backups happen here and never fail the close
    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.overlay.release(fh).await;
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        self.dir_of(ino).await?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let dir = self.dir_of(ino).await?;
        let offset = offset.max(0) as u64;
        let parent_ino = self.ino_of(&dir.parent());

        let mut all: Vec<DirectoryEntry> = Vec::new();
        for (i, (name, inode)) in [(".", ino), ("..", parent_ino)].into_iter().enumerate() {
            let entry_offset = i as u64 + 1;
            if entry_offset > offset {
                all.push(DirectoryEntry {
                    inode,
                    kind: FuseFileType::Directory,
                    name: OsString::from(name),
                    offset: entry_offset as i64,
                });
            }
        }

        let cursor = offset.saturating_sub(DOT_ENTRIES);
        let entries = self
            .overlay
            .readdir(&dir, cursor)
            .await
            .map_err(|e| e.errno())?;
        for e in entries {
            let child = dir.child(&e.name);
            all.push(DirectoryEntry {
                inode: self.ino_of(&child),
                kind: to_fuse_kind(e.kind),
                name: OsString::from(e.name),
                offset: (e.offset + DOT_ENTRIES) as i64,
            });
        }

        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(all.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let dir = self.dir_of(ino).await?;
        let parent = dir.parent();

        let mut all: Vec<DirectoryEntryPlus> = Vec::new();
        for (i, (name, handle)) in [(".", &dir), ("..", &parent)].into_iter().enumerate() {
            let entry_offset = i as u64 + 1;
            if entry_offset <= offset {
                continue;
            }
            let attr = self.overlay.stat(handle).await.map_err(|e| e.errno())?;
            let inode = self.ino_of(handle);
            all.push(DirectoryEntryPlus {
                inode,
                generation: 0,
                kind: FuseFileType::Directory,
                name: OsString::from(name),
                offset: entry_offset as i64,
                attr: to_fuse_attr(inode, &attr, &req),
                entry_ttl: self.ttl,
                attr_ttl: self.ttl,
            });
        }

        let cursor = offset.saturating_sub(DOT_ENTRIES);
        let entries = self
            .overlay
            .readdir(&dir, cursor)
            .await
            .map_err(|e| e.errno())?;
        for e in entries {
            let child = dir.child(&e.name);
            // raced with an unlink
            let Ok(attr) = self.overlay.stat(&child).await else {
                continue;
            };
            let inode = self.ino_of(&child);
            all.push(DirectoryEntryPlus {
                inode,
                generation: 0,
                kind: to_fuse_kind(e.kind),
                name: OsString::from(e.name),
                offset: (e.offset + DOT_ENTRIES) as i64,
                attr: to_fuse_attr(inode, &attr, &req),
                entry_ttl: self.ttl,
                attr_ttl: self.ttl,
            });
        }

        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(all.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let dir = self.dir_of(parent).await?;
        let child = self
            .overlay
            .mkdir(&dir, &name.to_string_lossy(), mode & 0o7777 & !umask)
            .await
            .map_err(|e| e.errno())?;
        self.entry_of(&child, &req).await
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let dir = self.dir_of(parent).await?;
        let name = name.to_string_lossy();
        let child = dir.child(&name);
        let attr = self.overlay.stat(&child).await.map_err(|e| e.errno())?;
        if attr.kind == ObjectKind::Dir {
            return Err(libc::EISDIR.into());
        }
        self.overlay
            .unlink(&dir, &name)
            .await
            .map_err(|e| e.errno())?;
        self.forget_handle(&child);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let dir = self.dir_of(parent).await?;
        let name = name.to_string_lossy();
        let child = dir.child(&name);
        let attr = self.overlay.stat(&child).await.map_err(|e| e.errno())?;
        if attr.kind != ObjectKind::Dir {
            return Err(libc::ENOTDIR.into());
        }
        self.overlay
            .rmdir(&dir, &name)
            .await
            .map_err(|e| e.errno())?;
        self.forget_handle(&child);
        Ok(())
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    // the inode table lives as long as the mount
    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn to_fuse_kind(k: ObjectKind) -> FuseFileType {
    match k {
        ObjectKind::Dir => FuseFileType::Directory,
        ObjectKind::File => FuseFileType::RegularFile,
    }
}

fn to_fuse_attr(ino: u64, attr: &ObjectAttr, req: &Request) -> FileAttr {
    let now = Timestamp::from(SystemTime::now());
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: now,
        mtime: now,
        ctime: now,
        #[cfg(target_os = "macos")]
        crtime: now,
        kind: to_fuse_kind(attr.kind),
        perm: (attr.mode & 0o7777) as u16,
        nlink: if attr.kind == ObjectKind::Dir { 2 } else { 1 },
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}
