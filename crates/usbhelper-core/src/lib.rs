//! usbhelper-core: find, authorize, open and talk to one USB device.
//!
//! The crate wraps a host USB stack behind a small session object. It does
//! not schedule or retry transfers; the host stack does all real work.
//!
//! # Architecture
//!
//! - **Host**: USB host abstraction (`UsbHost` trait; nusb, mock)
//! - **Permission**: one-shot permission listener shared with the host
//! - **Session**: discovery, open/claim, bulk write/read, close
//! - **Events**: Observer pattern for UI decoupling
//! - **Config**: target IDs and timeouts, loadable from TOML
//!
//! # Example
//!
//! ```no_run
//! use usbhelper_core::{HelperConfig, NusbHost, UsbSession};
//!
//! let config = HelperConfig {
//!     vendor_id: 0x1209,
//!     product_id: 0x0001,
//!     ..Default::default()
//! };
//!
//! let mut session = UsbSession::new(NusbHost::new(), config);
//! let device = session.require_device().expect("device not attached");
//! session.open(Some(&device)).expect("open failed");
//! session.write(b"ping", 4, session.config().write_timeout()).expect("write failed");
//! let reply = session.read(session.config().read_timeout()).expect("read failed");
//! println!("{:02X?}", reply);
//! session.close();
//! ```

pub mod config;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod host;
pub mod permission;
pub mod session;

// Re-exports for convenience
pub use config::{HelperConfig, INTERFACE_INDEX, NOT_CONNECTED, TRANSFER_FAILED};
pub use descriptor::{
    DeviceId, Direction, EndpointDescriptor, EndpointPair, InterfaceDescriptor, TransferKind,
};
pub use error::{HelperError, status_code};
pub use events::{NullObserver, PacketDirection, TracingObserver, UsbEvent, UsbObserver};
pub use host::{
    HostError, MockHost, NusbHost, TransferError, UsbConnection, UsbDevice, UsbHost,
};
pub use permission::{PermissionOutcome, PermissionResponder, PermissionResult};
pub use session::{CloseOutcome, UsbSession};
