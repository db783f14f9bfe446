//! Error types for kernel bridge operations

use crate::engine::ReturnCode;
use thiserror::Error;

/// BSD errno values reported by the C-level interface
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EINVAL: i32 = 22;
}

/// Kernel bridge errors
#[derive(Debug, Error)]
pub enum KernelError {
    /// Rejected before crossing the privilege boundary
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The privileged call failed, returned an unexpected output count,
    /// moved an unexpected number of bytes, or reported a non-zero status
    #[error("I/O error: {0}")]
    Io(String),

    /// The engine completed the call but reported a non-zero status
    #[error("{operation} failed with engine status {code}")]
    Status { operation: &'static str, code: i32 },

    /// The privileged call itself failed with this return code
    #[error("{operation} returned {code}")]
    Engine {
        operation: &'static str,
        code: ReturnCode,
    },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Open failed: {0}")]
    OpenFailed(String),

    #[error("Out of memory: cannot allocate {0} bytes for data segment")]
    OutOfMemory(usize),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl KernelError {
    /// The errno a C caller of the interface would have seen
    pub fn errno(&self) -> i32 {
        match self {
            KernelError::InvalidArgument(_) | KernelError::Config(_) => errno::EINVAL,
            KernelError::Io(_) | KernelError::OpenFailed(_) | KernelError::Engine { .. } => {
                errno::EIO
            }
            KernelError::Status { code, .. } => *code,
            KernelError::ServiceUnavailable(_) => errno::ENOENT,
            KernelError::OutOfMemory(_) => errno::ENOMEM,
        }
    }
}

impl From<KernelError> for std::io::Error {
    fn from(err: KernelError) -> Self {
        let kind = match err {
            KernelError::InvalidArgument(_) | KernelError::Config(_) => {
                std::io::ErrorKind::InvalidInput
            }
            KernelError::ServiceUnavailable(_) => std::io::ErrorKind::NotFound,
            KernelError::OutOfMemory(_) => std::io::ErrorKind::OutOfMemory,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// Result type for kernel bridge operations
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(KernelError::InvalidArgument("x".into()).errno(), errno::EINVAL);
        assert_eq!(KernelError::Io("x".into()).errno(), errno::EIO);
        assert_eq!(KernelError::ServiceUnavailable("x".into()).errno(), errno::ENOENT);
        assert_eq!(KernelError::OutOfMemory(12).errno(), errno::ENOMEM);
        assert_eq!(
            KernelError::Status { operation: "send", code: 32 }.errno(),
            32
        );
    }

    #[test]
    fn test_into_io_error() {
        let err: std::io::Error = KernelError::InvalidArgument("bad session".into()).into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("bad session"));

        let err: std::io::Error = KernelError::OutOfMemory(4096).into();
        assert_eq!(err.kind(), std::io::ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_engine_return_code_kept() {
        let err = KernelError::Engine {
            operation: "Close",
            code: ReturnCode::NOT_FOUND,
        };
        assert_eq!(err.errno(), errno::EIO);
        assert_eq!(err.to_string(), "Close returned 0xe00002f0");
    }
}
