//! Control channel: administrative requests against one tracked file.
//!
//! A request arrives as an untyped [`RawRequest`] (opcode, signed flag, read
//! size), is validated into a [`ControlRequest`] and executed by the
//! [`Dispatcher`] against the query engine. List and View write their result
//! into the caller's output buffer; Restore and Delete only report status.
pub mod server;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backend::{Backend, ObjectHandle, ObjectKind};
use crate::error::{Result, VersionError};
use crate::version::query::QueryEngine;
use crate::version::{MAX_VIEW_SIZE, VersionFlag, is_backup_name};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Opcode {
    List = 1,
    View = 2,
    Restore = 3,
    Delete = 4,
}

impl TryFrom<u32> for Opcode {
    type Error = VersionError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            1 => Ok(Opcode::List),
            2 => Ok(Opcode::View),
            3 => Ok(Opcode::Restore),
            4 => Ok(Opcode::Delete),
            other => Err(VersionError::invalid(format!("unknown opcode {other}"))),
        }
    }
}

/// Request exactly as a caller sends it, before validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRequest {
    pub opcode: u32,
    #[serde(default)]
    pub flag: Option<i32>,
    #[serde(default)]
    pub read_size: u32,
}

impl RawRequest {
    pub fn new(opcode: Opcode, flag: Option<i32>, read_size: u32) -> Self {
        Self {
            opcode: opcode as u32,
            flag,
            read_size,
        }
    }
}

/// A validated administrative request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    List { flag: VersionFlag },
    View { flag: VersionFlag, read_size: usize },
    Restore { flag: VersionFlag },
    Delete { flag: VersionFlag },
}

fn required_flag(op: Opcode, flag: Option<i32>) -> Result<VersionFlag> {
    let raw = flag.ok_or_else(|| VersionError::invalid(format!("{op:?} requires a flag")))?;
    VersionFlag::try_from(raw)
}

impl TryFrom<&RawRequest> for ControlRequest {
    type Error = VersionError;

    fn try_from(raw: &RawRequest) -> Result<Self> {
        let op = Opcode::try_from(raw.opcode)?;
        Ok(match op {
            Opcode::List => ControlRequest::List {
                flag: required_flag(op, raw.flag)?,
            },
            Opcode::View => {
                let read_size = raw.read_size as usize;
                if read_size > MAX_VIEW_SIZE {
                    return Err(VersionError::invalid(format!(
                        "read size {read_size} exceeds {MAX_VIEW_SIZE}"
                    )));
                }
                ControlRequest::View {
                    // View reads the newest version when no flag is given
                    flag: VersionFlag::try_from(raw.flag.unwrap_or(-1))?,
                    read_size,
                }
            }
            Opcode::Restore => ControlRequest::Restore {
                flag: required_flag(op, raw.flag)?,
            },
            Opcode::Delete => ControlRequest::Delete {
                flag: required_flag(op, raw.flag)?,
            },
        })
    }
}

pub struct Dispatcher<B: Backend> {
    backend: Arc<B>,
    query: Arc<QueryEngine<B>>,
}

impl<B: Backend> Dispatcher<B> {
    pub fn new(backend: Arc<B>, query: Arc<QueryEngine<B>>) -> Self {
        Self { backend, query }
    }

    async fn tracked_file(&self, path: &str) -> Result<ObjectHandle> {
        let file = self.backend.resolve(path).await?;
        if is_backup_name(file.name()) {
            return Err(VersionError::invalid(format!("{file} is a backup slot")));
        }
        if self.backend.stat(&file).await?.kind != ObjectKind::File {
            return Err(VersionError::invalid(format!("{file} is not a regular file")));
        }
        Ok(file)
    }

    /// Validate `raw`, run it against the file at `path` and append any
    /// result bytes to `out`.
    pub async fn dispatch(&self, path: &str, raw: &RawRequest, out: &mut BytesMut) -> Result<()> {
        let request = ControlRequest::try_from(raw)?;
        let file = self.tracked_file(path).await?;
        debug!("[control] {file}: {request:?}");
        self.execute(&file, request, out).await
    }

    pub async fn execute(
        &self,
        file: &ObjectHandle,
        request: ControlRequest,
        out: &mut BytesMut,
    ) -> Result<()> {
        match request {
            ControlRequest::List { flag } => {
                let mut listing = String::new();
                self.query.list(file, flag, &mut listing).await?;
                out.extend_from_slice(listing.as_bytes());
            }
            ControlRequest::View { flag, read_size } => {
                let data = self.query.view(file, flag, read_size).await?;
                out.extend_from_slice(&data);
            }
            ControlRequest::Restore { flag } => self.query.restore(file, flag).await?,
            ControlRequest::Delete { flag } => self.query.delete(file, flag).await?,
        }
        Ok(())
    }
}
