use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Adapter-level error, mapped to a POSIX code at the kernel boundary.
///
/// Remote failures never appear here synchronously; the adapter either waits
/// (bounded) or returns one of these.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no such object")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("already exists")]
    Exists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("access denied")]
    AccessDenied,
    #[error("no such attribute: {0}")]
    NoXattr(String),
    #[error("attribute not writable: {0}")]
    ReadOnlyXattr(String),
    #[error("timed out waiting for content")]
    WaitTimeout,
    #[error("cache busy: {0}")]
    CacheBusy(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

impl Error {
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::NotADirectory => libc::ENOTDIR,
            Error::IsADirectory => libc::EISDIR,
            Error::Exists => libc::EEXIST,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::AccessDenied => libc::EACCES,
            Error::NoXattr(_) => libc::ENODATA,
            Error::ReadOnlyXattr(_) => libc::EACCES,
            Error::CacheBusy(_) => libc::EBUSY,
            Error::WaitTimeout | Error::Io(_) | Error::Store(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::NotFound.errno(), libc::ENOENT);
        assert_eq!(Error::AccessDenied.errno(), libc::EACCES);
        assert_eq!(Error::WaitTimeout.errno(), libc::EIO);
        assert_eq!(Error::NoXattr("user.foo".into()).errno(), libc::ENODATA);
    }
}
