use libc::{EACCES, EAGAIN, EBADF, EINVAL, ENFILE, ENOMEM, EPERM};
use thiserror::Error;

/// Everything that can go wrong while tracking or reporting. Detected heap
/// violations are not errors, see [`crate::alloc::registry::Violation`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("could not mmap() {size} bytes, errno() = {}", errno_name(*.errno))]
    Mmap { size: usize, errno: i32 },
    #[error("{kind} pool has no pool ids left")]
    PoolExhausted { kind: &'static str },
    #[error("{operation} requires call-stack tracking, which is disabled")]
    FeatureDisabled { operation: &'static str },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("diagnostic worker has stopped")]
    WorkerStopped,
    #[error("cannot wait for the diagnostic worker from inside a bypass")]
    InsideBypass,
    #[error("malformed mapping line: {line}")]
    MapsParse { line: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Name an errno value that `mmap()` is documented to return
pub fn errno_name(errno: i32) -> &'static str {
    match errno {
        ENOMEM => "ENOMEM",
        EACCES => "EACCES",
        EAGAIN => "EAGAIN",
        EBADF => "EBADF",
        EINVAL => "EINVAL",
        ENFILE => "ENFILE",
        EPERM => "EPERM",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmap_error_names_errno() {
        let e = Error::Mmap {
            size: 4096,
            errno: ENOMEM,
        };
        assert_eq!(e.to_string(), "could not mmap() 4096 bytes, errno() = ENOMEM");
        assert_eq!(errno_name(-1), "unknown");
    }
}
