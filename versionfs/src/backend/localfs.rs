//! Host directory backend: every object lives below `root`, attributes are
//! stored as extended attributes on the host file.

use async_trait::async_trait;
use std::ffi::CString;
use std::io::SeekFrom;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{AttrMode, Backend, DirEntry, ObjectAttr, ObjectHandle, ObjectKind, check_name};
use crate::error::{Result, VersionError};

pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, obj: &ObjectHandle) -> PathBuf {
        self.root.join(obj.path().trim_start_matches('/'))
    }
}

fn kind_of(ft: std::fs::FileType) -> ObjectKind {
    if ft.is_dir() {
        ObjectKind::Dir
    } else {
        ObjectKind::File
    }
}

fn set_xattr_blocking(path: &Path, key: &str, value: &[u8], mode: AttrMode) -> std::io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let ckey =
        CString::new(key).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let flags = match mode {
        AttrMode::CreateIfAbsent => libc::XATTR_CREATE,
        AttrMode::ReplaceExisting => libc::XATTR_REPLACE,
    };
    // SAFETY: both strings are NUL-terminated and `value` outlives the call.
    let ret = unsafe {
        libc::setxattr(
            cpath.as_ptr(),
            ckey.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[async_trait]
impl Backend for LocalFsBackend {
    async fn resolve(&self, path: &str) -> Result<ObjectHandle> {
        let h = ObjectHandle::parse(path)?;
        fs::symlink_metadata(self.path_for(&h)).await?;
        Ok(h)
    }

    async fn lookup(&self, parent: &ObjectHandle, name: &str) -> Result<ObjectHandle> {
        check_name(name)?;
        let child = parent.child(name);
        fs::symlink_metadata(self.path_for(&child)).await?;
        Ok(child)
    }

    async fn create(&self, parent: &ObjectHandle, name: &str, mode: u32) -> Result<ObjectHandle> {
        check_name(name)?;
        let child = parent.child(name);
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(self.path_for(&child))
            .await?;
        Ok(child)
    }

    async fn mkdir(&self, parent: &ObjectHandle, name: &str, mode: u32) -> Result<ObjectHandle> {
        check_name(name)?;
        let child = parent.child(name);
        fs::DirBuilder::new()
            .mode(mode)
            .create(self.path_for(&child))
            .await?;
        Ok(child)
    }

    async fn unlink(&self, parent: &ObjectHandle, name: &str) -> Result<()> {
        check_name(name)?;
        fs::remove_file(self.path_for(&parent.child(name))).await?;
        Ok(())
    }

    async fn rmdir(&self, parent: &ObjectHandle, name: &str) -> Result<()> {
        check_name(name)?;
        fs::remove_dir(self.path_for(&parent.child(name))).await?;
        Ok(())
    }

    async fn stat(&self, obj: &ObjectHandle) -> Result<ObjectAttr> {
        use std::os::unix::fs::PermissionsExt;
        let md = fs::symlink_metadata(self.path_for(obj)).await?;
        Ok(ObjectAttr {
            kind: kind_of(md.file_type()),
            size: md.len(),
            mode: md.permissions().mode() & 0o7777,
        })
    }

    async fn read(&self, obj: &ObjectHandle, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut f = fs::File::open(self.path_for(obj)).await?;
        f.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len);
        f.take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, obj: &ObjectHandle, offset: u64, data: &[u8]) -> Result<usize> {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .open(self.path_for(obj))
            .await?;
        f.seek(SeekFrom::Start(offset)).await?;
        f.write_all(data).await?;
        f.flush().await?;
        Ok(data.len())
    }

    async fn truncate(&self, obj: &ObjectHandle, len: u64) -> Result<()> {
        let f = fs::OpenOptions::new()
            .write(true)
            .open(self.path_for(obj))
            .await?;
        f.set_len(len).await?;
        Ok(())
    }

    async fn copy_range(&self, src: &ObjectHandle, dst: &ObjectHandle, len: u64) -> Result<u64> {
        let src = fs::File::open(self.path_for(src)).await?;
        let mut dst = fs::OpenOptions::new()
            .write(true)
            .open(self.path_for(dst))
            .await?;
        let mut limited = src.take(len);
        let n = tokio::io::copy(&mut limited, &mut dst).await?;
        dst.flush().await?;
        Ok(n)
    }

    async fn get_attribute(&self, obj: &ObjectHandle, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(obj);
        let key = key.to_string();
        let value = tokio::task::spawn_blocking(move || xattr::get(&path, &key))
            .await
            .map_err(|e| VersionError::io(e.to_string()))??;
        Ok(value)
    }

    async fn set_attribute(
        &self,
        obj: &ObjectHandle,
        key: &str,
        value: &[u8],
        mode: AttrMode,
    ) -> Result<()> {
        let path = self.path_for(obj);
        let key = key.to_string();
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || set_xattr_blocking(&path, &key, &value, mode))
            .await
            .map_err(|e| VersionError::io(e.to_string()))??;
        Ok(())
    }

    async fn enumerate(&self, dir: &ObjectHandle) -> Result<Vec<DirEntry>> {
        let mut rd = fs::read_dir(self.path_for(dir)).await?;
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await? {
            let kind = kind_of(entry.file_type().await?);
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                offset: out.len() as u64 + 1,
            });
        }
        Ok(out)
    }
}
