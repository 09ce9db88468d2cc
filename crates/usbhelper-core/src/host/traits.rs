//! USB host boundary.
//!
//! Defines the `UsbHost`, `UsbDevice` and `UsbConnection` traits that wrap
//! the operating system's USB host API, so the session can run against
//! nusb in production and a mock in tests.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::descriptor::{EndpointDescriptor, InterfaceDescriptor};
use crate::permission::PermissionResponder;

/// Failure of a single transfer, as reported by the host stack.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Stall,

    #[error("device disconnected")]
    Disconnected,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("hardware fault or protocol violation")]
    Fault,

    #[error("invalid transfer argument")]
    InvalidArgument,

    #[error("unknown transfer error: {0}")]
    Unknown(String),
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    #[error("Failed to open device: {0}")]
    Open(String),

    #[error("Failed to claim interface {interface}: {message}")]
    Claim { interface: u8, message: String },

    #[error("Failed to release interface {interface}: {message}")]
    Release { interface: u8, message: String },

    #[error("Failed to close connection: {0}")]
    Close(String),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("A request is already in flight on this connection")]
    RequestInFlight,

    #[error("No request is in flight on this connection")]
    NoRequest,
}

/// Identifier handed out by `UsbConnection::queue_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A queued request that has completed.
#[derive(Debug)]
pub struct CompletedRequest {
    pub id: RequestId,
    /// Bytes actually received.
    pub data: Vec<u8>,
    pub status: Result<(), TransferError>,
}

/// A device as seen during enumeration.
pub trait UsbDevice: Clone + fmt::Debug + Send + 'static {
    /// Host-specific device name (bus path or node).
    fn name(&self) -> String;

    fn vendor_id(&self) -> u16;

    fn product_id(&self) -> u16;
}

/// An open connection to one device.
pub trait UsbConnection: Send {
    /// Look up an interface of the active configuration by index.
    fn interface(&self, index: u8) -> Option<InterfaceDescriptor>;

    /// Claim an interface. With `force`, detach any kernel driver first.
    fn claim_interface(
        &mut self,
        interface: &InterfaceDescriptor,
        force: bool,
    ) -> Result<(), HostError>;

    fn release_interface(&mut self, interface: &InterfaceDescriptor) -> Result<(), HostError>;

    /// Blocking bulk OUT transfer. Returns bytes written.
    fn bulk_transfer(
        &mut self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, HostError>;

    /// Queue a single IN request of `len` bytes.
    ///
    /// Only one request may be outstanding; a second call before the first
    /// completes returns `HostError::RequestInFlight`.
    fn queue_request(
        &mut self,
        endpoint: &EndpointDescriptor,
        len: usize,
    ) -> Result<RequestId, HostError>;

    /// Wait for the next completed request. `Ok(None)` on timeout.
    fn request_wait(&mut self, timeout: Duration) -> Result<Option<CompletedRequest>, HostError>;

    /// Cancel and forget any outstanding request.
    fn cancel_requests(&mut self);

    fn close(&mut self) -> Result<(), HostError>;
}

/// The host's USB manager.
pub trait UsbHost: Send + Sync {
    type Device: UsbDevice;
    type Connection: UsbConnection;

    /// All currently attached devices, in host enumeration order.
    fn device_list(&self) -> Result<Vec<Self::Device>, HostError>;

    fn has_permission(&self, device: &Self::Device) -> bool;

    /// Ask the host to obtain permission for `device`.
    ///
    /// The host fulfills `responder` exactly once, from any thread, when the
    /// user (or policy) answers.
    fn request_permission(
        &self,
        device: &Self::Device,
        responder: PermissionResponder<Self::Device>,
    );

    fn open_device(&self, device: &Self::Device) -> Result<Self::Connection, HostError>;
}
