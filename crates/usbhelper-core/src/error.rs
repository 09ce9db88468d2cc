//! Session-level error taxonomy.

use thiserror::Error;

use crate::config::{NOT_CONNECTED, TRANSFER_FAILED};
use crate::descriptor::Direction;
use crate::host::{HostError, TransferError};

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    NotFound { vid: u16, pid: u16 },

    #[error("No device given")]
    NoDevice,

    #[error("Permission denied for device")]
    PermissionDenied,

    #[error("No permission answer after {timeout_ms}ms")]
    PermissionTimeout { timeout_ms: u64 },

    #[error("Failed to open device: {0}")]
    OpenFailed(#[source] HostError),

    #[error("Interface {0} not found")]
    InterfaceNotFound(u8),

    #[error("Failed to claim interface: {0}")]
    ClaimFailed(#[source] HostError),

    #[error("Not connected")]
    NotConnected,

    #[error("No {0} endpoint on claimed interface")]
    EndpointMissing(Direction),

    #[error("Length {length} exceeds buffer of {available} bytes")]
    InvalidLength { length: usize, available: usize },

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Host error: {0}")]
    Host(#[source] HostError),
}

impl From<HostError> for HelperError {
    fn from(e: HostError) -> Self {
        match e {
            HostError::Transfer(t) => HelperError::Transfer(t),
            other => HelperError::Host(other),
        }
    }
}

impl HelperError {
    /// Integer status in the `bulkTransfer` convention: `NOT_CONNECTED` when
    /// no connection is open, `TRANSFER_FAILED` for everything else.
    pub fn status_code(&self) -> i32 {
        match self {
            HelperError::NotConnected => NOT_CONNECTED,
            _ => TRANSFER_FAILED,
        }
    }
}

/// Fold a write result into the legacy integer status code.
pub fn status_code(result: &Result<usize, HelperError>) -> i32 {
    match result {
        Ok(n) => i32::try_from(*n).unwrap_or(i32::MAX),
        Err(e) => e.status_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_connected_code_is_reserved() {
        assert_eq!(status_code(&Err(HelperError::NotConnected)), -2);
        assert_eq!(
            status_code(&Err(HelperError::Transfer(TransferError::Timeout))),
            -1
        );
        assert_eq!(status_code(&Ok(64)), 64);
    }

    #[test]
    fn test_host_transfer_error_unwraps() {
        let e: HelperError = HostError::Transfer(TransferError::Stall).into();
        assert!(matches!(e, HelperError::Transfer(TransferError::Stall)));
    }
}
