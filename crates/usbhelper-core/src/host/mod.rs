//! Host USB backends.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockConnection, MockDevice, MockHost};
pub use nusb::{NusbConnection, NusbDevice, NusbHost};
pub use traits::{
    CompletedRequest, HostError, RequestId, TransferError, UsbConnection, UsbDevice, UsbHost,
};
