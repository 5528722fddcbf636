use std::io;

use thiserror::Error;

/// Errors surfaced by the version-retention engine and its backends.
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

pub type Result<T> = std::result::Result<T, VersionError>;

impl VersionError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// libc errno used when the error crosses the FUSE or control boundary.
    /// The FUSE adapter relies on `i32: Into<rfuse3::Errno>` to reply with it.
    pub fn errno(&self) -> i32 {
        match self {
            VersionError::NotFound(_) => libc::ENOENT,
            VersionError::Unsupported(_) => libc::ENOTSUP,
            VersionError::InvalidArgument(_) => libc::EINVAL,
            VersionError::AlreadyExists(_) => libc::EEXIST,
            VersionError::Io(_) => libc::EIO,
            VersionError::OutOfMemory(_) => libc::ENOMEM,
        }
    }

    /// Rebuild an error from an errno received over the control socket.
    pub fn from_errno(errno: i32, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match errno {
            libc::ENOENT => VersionError::NotFound(msg),
            libc::ENOTSUP => VersionError::Unsupported(msg),
            libc::EINVAL => VersionError::InvalidArgument(msg),
            libc::EEXIST => VersionError::AlreadyExists(msg),
            libc::ENOMEM => VersionError::OutOfMemory(msg),
            _ => VersionError::Io(msg),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VersionError::NotFound(_))
    }
}

impl From<io::Error> for VersionError {
    fn from(e: io::Error) -> Self {
        // xattr calls report missing keys and unsupported filesystems as raw errnos.
        match e.raw_os_error() {
            Some(libc::ENODATA) => return VersionError::NotFound(e.to_string()),
            Some(libc::ENOTSUP) => return VersionError::Unsupported(e.to_string()),
            Some(libc::EEXIST) => return VersionError::AlreadyExists(e.to_string()),
            _ => {}
        }
        match e.kind() {
            io::ErrorKind::NotFound => VersionError::NotFound(e.to_string()),
            io::ErrorKind::Unsupported => VersionError::Unsupported(e.to_string()),
            io::ErrorKind::AlreadyExists => VersionError::AlreadyExists(e.to_string()),
            io::ErrorKind::InvalidInput => VersionError::InvalidArgument(e.to_string()),
            io::ErrorKind::OutOfMemory => VersionError::OutOfMemory(e.to_string()),
            _ => VersionError::Io(e.to_string()),
        }
    }
}

impl From<VersionError> for io::Error {
    fn from(e: VersionError) -> Self {
        io::Error::from_raw_os_error(e.errno())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_onto_kinds() {
        let e: VersionError = io::Error::from_raw_os_error(libc::ENODATA).into();
        assert!(e.is_not_found());
        let e: VersionError = io::Error::from_raw_os_error(libc::ENOTSUP).into();
        assert!(matches!(e, VersionError::Unsupported(_)));
        let e: VersionError = io::Error::new(io::ErrorKind::AlreadyExists, "x").into();
        assert!(matches!(e, VersionError::AlreadyExists(_)));
        let e: VersionError = io::Error::other("boom").into();
        assert!(matches!(e, VersionError::Io(_)));
    }

    #[test]
    fn errno_round_trips_through_control_replies() {
        for err in [
            VersionError::not_found("a"),
            VersionError::invalid("b"),
            VersionError::io("c"),
            VersionError::OutOfMemory("d".into()),
        ] {
            let back = VersionError::from_errno(err.errno(), err.to_string());
            assert_eq!(back.errno(), err.errno());
        }
    }
}
