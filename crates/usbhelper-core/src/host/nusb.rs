//! nusb-based USB host implementation.

use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, In, Out};
use nusb::{Endpoint, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, warn};

use super::traits::{
    CompletedRequest, HostError, RequestId, TransferError, UsbConnection, UsbDevice, UsbHost,
};
use crate::descriptor::{Direction, EndpointDescriptor, InterfaceDescriptor, TransferKind};
use crate::permission::PermissionResponder;

/// Attached device discovered by nusb.
#[derive(Debug, Clone)]
pub struct NusbDevice {
    info: nusb::DeviceInfo,
}

impl NusbDevice {
    #[cfg(target_os = "linux")]
    fn node_path(&self) -> String {
        format!(
            "/dev/bus/usb/{:03}/{:03}",
            self.info.busnum(),
            self.info.device_address()
        )
    }
}

impl UsbDevice for NusbDevice {
    #[cfg(target_os = "linux")]
    fn name(&self) -> String {
        self.node_path()
    }

    #[cfg(not(target_os = "linux"))]
    fn name(&self) -> String {
        format!("{}-{}", self.info.bus_id(), self.info.device_address())
    }

    fn vendor_id(&self) -> u16 {
        self.info.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.info.product_id()
    }
}

/// nusb-based USB host.
///
/// Desktop hosts have no interactive permission prompt: access is decided by
/// the device node's permissions (Linux) or granted at open time (macOS,
/// Windows).
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbHost;

impl NusbHost {
    pub fn new() -> Self {
        Self
    }
}

impl UsbHost for NusbHost {
    type Device = NusbDevice;
    type Connection = NusbConnection;

    fn device_list(&self) -> Result<Vec<NusbDevice>, HostError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| HostError::Enumeration(e.to_string()))?;
        Ok(devices.map(|info| NusbDevice { info }).collect())
    }

    #[cfg(target_os = "linux")]
    fn has_permission(&self, device: &NusbDevice) -> bool {
        let path = device.node_path();
        match std::fs::OpenOptions::new().read(true).write(true).open(&path) {
            Ok(_) => true,
            Err(e) => {
                debug!(path = %path, error = %e, "No access to device node");
                false
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn has_permission(&self, _device: &NusbDevice) -> bool {
        true
    }

    fn request_permission(&self, device: &NusbDevice, responder: PermissionResponder<NusbDevice>) {
        // Nothing to prompt; answer from current access right away.
        if self.has_permission(device) {
            responder.grant(device.clone());
        } else {
            warn!(
                device = %device.name(),
                "No permission prompt on this host; grant access to the device node (udev rule)"
            );
            responder.deny(Some(device.clone()));
        }
    }

    #[instrument(level = "info", skip(self, device), fields(device = %device.name()))]
    fn open_device(&self, device: &NusbDevice) -> Result<NusbConnection, HostError> {
        let handle = device
            .info
            .open()
            .wait()
            .map_err(|e| HostError::Open(e.to_string()))?;

        info!(
            vendor_id = %format!("{:04X}", device.vendor_id()),
            product_id = %format!("{:04X}", device.product_id()),
            "Device opened"
        );

        Ok(NusbConnection {
            device: Some(handle),
            interface: None,
            in_endpoint: None,
            out_endpoint: None,
            pending: None,
            next_id: 0,
        })
    }
}

/// Open nusb device with at most one claimed interface.
pub struct NusbConnection {
    device: Option<nusb::Device>,
    interface: Option<Interface>,
    in_endpoint: Option<Endpoint<Bulk, In>>,
    out_endpoint: Option<Endpoint<Bulk, Out>>,
    pending: Option<RequestId>,
    next_id: u64,
}

fn map_transfer_error(e: nusb::transfer::TransferError) -> TransferError {
    use nusb::transfer::TransferError as E;
    match e {
        E::Cancelled => TransferError::Cancelled,
        E::Stall => TransferError::Stall,
        E::Disconnected => TransferError::Disconnected,
        E::Fault => TransferError::Fault,
        E::InvalidArgument => TransferError::InvalidArgument,
        other => TransferError::Unknown(other.to_string()),
    }
}

/// How long to wait for each cancelled IN completion to come back.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Submission queue of an IN endpoint, as seen by cancellation.
trait CancelQueue {
    fn outstanding(&self) -> usize;
    fn cancel_all(&mut self);
    /// Reap one completion; `false` if none arrived within `timeout`.
    fn reap_one(&mut self, timeout: Duration) -> bool;
}

impl CancelQueue for Endpoint<Bulk, In> {
    fn outstanding(&self) -> usize {
        self.pending()
    }

    fn cancel_all(&mut self) {
        Endpoint::cancel_all(self);
    }

    fn reap_one(&mut self, timeout: Duration) -> bool {
        self.wait_next_complete(timeout).is_some()
    }
}

/// Cancel everything queued and reap the cancelled completions.
/// Returns the number still outstanding afterwards.
fn drain_cancelled<Q: CancelQueue>(queue: &mut Q, timeout: Duration) -> usize {
    queue.cancel_all();
    while queue.outstanding() > 0 {
        if !queue.reap_one(timeout) {
            warn!(
                outstanding = queue.outstanding(),
                "Cancelled IN transfers did not complete"
            );
            break;
        }
    }
    queue.outstanding()
}

/// A new IN request may only be queued on an idle endpoint.
fn ensure_idle(tracked: Option<RequestId>, outstanding: usize) -> Result<(), HostError> {
    if tracked.is_some() || outstanding > 0 {
        return Err(HostError::RequestInFlight);
    }
    Ok(())
}

fn map_transfer_kind(kind: nusb::descriptors::TransferType) -> TransferKind {
    use nusb::descriptors::TransferType as T;
    match kind {
        T::Control => TransferKind::Control,
        T::Isochronous => TransferKind::Isochronous,
        T::Bulk => TransferKind::Bulk,
        T::Interrupt => TransferKind::Interrupt,
    }
}

impl NusbConnection {
    fn claimed(&self) -> Result<&Interface, HostError> {
        self.interface
            .as_ref()
            .ok_or(HostError::Transfer(TransferError::InvalidArgument))
    }

    fn out_endpoint(&mut self, address: u8) -> Result<&mut Endpoint<Bulk, Out>, HostError> {
        let cached = self
            .out_endpoint
            .as_ref()
            .is_some_and(|ep| ep.endpoint_address() == address);
        if !cached {
            self.out_endpoint = None;
            let ep = self.claimed()?.endpoint::<Bulk, Out>(address).map_err(|e| {
                debug!(address = %format!("0x{:02X}", address), error = %e, "OUT endpoint unavailable");
                HostError::Transfer(TransferError::InvalidArgument)
            })?;
            self.out_endpoint = Some(ep);
        }
        self.out_endpoint
            .as_mut()
            .ok_or(HostError::Transfer(TransferError::InvalidArgument))
    }

    fn in_endpoint(&mut self, address: u8) -> Result<&mut Endpoint<Bulk, In>, HostError> {
        let cached = self
            .in_endpoint
            .as_ref()
            .is_some_and(|ep| ep.endpoint_address() == address);
        if !cached {
            self.in_endpoint = None;
            let ep = self.claimed()?.endpoint::<Bulk, In>(address).map_err(|e| {
                debug!(address = %format!("0x{:02X}", address), error = %e, "IN endpoint unavailable");
                HostError::Transfer(TransferError::InvalidArgument)
            })?;
            self.in_endpoint = Some(ep);
        }
        self.in_endpoint
            .as_mut()
            .ok_or(HostError::Transfer(TransferError::InvalidArgument))
    }
}

impl UsbConnection for NusbConnection {
    fn interface(&self, index: u8) -> Option<InterfaceDescriptor> {
        let device = self.device.as_ref()?;
        let config = match device.active_configuration() {
            Ok(config) => config,
            Err(e) => {
                debug!(error = %e, "No active configuration, using first descriptor");
                device.configurations().next()?
            }
        };

        let group = config
            .interfaces()
            .find(|iface| iface.interface_number() == index)?;
        // Alternate setting 0 only.
        let alt = group.alt_settings().next()?;

        let endpoints = alt
            .endpoints()
            .map(|ep| EndpointDescriptor {
                address: ep.address(),
                direction: match ep.direction() {
                    nusb::transfer::Direction::In => Direction::In,
                    nusb::transfer::Direction::Out => Direction::Out,
                },
                kind: map_transfer_kind(ep.transfer_type()),
                max_packet_size: ep.max_packet_size(),
            })
            .collect();

        Some(InterfaceDescriptor {
            number: index,
            endpoints,
        })
    }

    fn claim_interface(
        &mut self,
        interface: &InterfaceDescriptor,
        force: bool,
    ) -> Result<(), HostError> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| HostError::Claim {
                interface: interface.number,
                message: "connection closed".into(),
            })?;

        let claimed = if force {
            device.detach_and_claim_interface(interface.number).wait()
        } else {
            device.claim_interface(interface.number).wait()
        };

        let claimed = claimed.map_err(|e| HostError::Claim {
            interface: interface.number,
            message: e.to_string(),
        })?;
        self.interface = Some(claimed);
        Ok(())
    }

    fn release_interface(&mut self, interface: &InterfaceDescriptor) -> Result<(), HostError> {
        self.in_endpoint = None;
        self.out_endpoint = None;
        self.pending = None;
        // nusb releases the claim when the last handle is dropped.
        match self.interface.take() {
            Some(_) => Ok(()),
            None => Err(HostError::Release {
                interface: interface.number,
                message: "interface not claimed".into(),
            }),
        }
    }

    #[instrument(skip(self, endpoint, data), fields(ep = %format!("0x{:02X}", endpoint.address), len = data.len()))]
    fn bulk_transfer(
        &mut self,
        endpoint: &EndpointDescriptor,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, HostError> {
        let ep = self.out_endpoint(endpoint.address)?;
        let completion = ep.transfer_blocking(Buffer::from(data.to_vec()), timeout);
        // transfer_blocking only cancels when the timeout expires.
        completion.status.map_err(|e| match map_transfer_error(e) {
            TransferError::Cancelled => TransferError::Timeout,
            other => other,
        })?;

        debug!(bytes_written = completion.actual_len, "Write complete");
        Ok(completion.actual_len)
    }

    fn queue_request(
        &mut self,
        endpoint: &EndpointDescriptor,
        len: usize,
    ) -> Result<RequestId, HostError> {
        ensure_idle(self.pending, 0)?;
        let ep = self.in_endpoint(endpoint.address)?;
        // Completions left over from an earlier cancel would be mistaken
        // for the reply to this request.
        if ep.outstanding() > 0 {
            let left = drain_cancelled(&mut *ep, CANCEL_DRAIN_TIMEOUT);
            ensure_idle(None, left)?;
        }
        let buffer = ep.allocate(len);
        ep.submit(buffer);

        self.next_id += 1;
        let id = RequestId(self.next_id);
        self.pending = Some(id);
        Ok(id)
    }

    fn request_wait(&mut self, timeout: Duration) -> Result<Option<CompletedRequest>, HostError> {
        let id = self.pending.ok_or(HostError::NoRequest)?;
        let ep = self
            .in_endpoint
            .as_mut()
            .ok_or(HostError::NoRequest)?;

        let Some(completion) = ep.wait_next_complete(timeout) else {
            return Ok(None);
        };
        self.pending = None;

        let status = completion.status.map_err(map_transfer_error);
        let actual = completion.actual_len.min(completion.buffer.len());
        Ok(Some(CompletedRequest {
            id,
            data: completion.buffer[..actual].to_vec(),
            status,
        }))
    }

    fn cancel_requests(&mut self) {
        self.pending = None;
        if let Some(ep) = self.in_endpoint.as_mut() {
            let left = drain_cancelled(ep, CANCEL_DRAIN_TIMEOUT);
            if left > 0 {
                debug!(outstanding = left, "IN endpoint still busy after cancel");
            }
        }
    }

    fn close(&mut self) -> Result<(), HostError> {
        self.in_endpoint = None;
        self.out_endpoint = None;
        self.interface = None;
        self.pending = None;
        match self.device.take() {
            Some(_) => Ok(()),
            None => Err(HostError::Close("connection already closed".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    /// Queue whose cancelled transfers come back one per reap, up to
    /// `stuck` of them never returning.
    struct FakeQueue {
        queued: usize,
        stuck: usize,
        cancelled: bool,
        reaps: usize,
    }

    impl FakeQueue {
        fn new(queued: usize, stuck: usize) -> Self {
            Self {
                queued,
                stuck,
                cancelled: false,
                reaps: 0,
            }
        }
    }

    impl CancelQueue for FakeQueue {
        fn outstanding(&self) -> usize {
            self.queued
        }

        fn cancel_all(&mut self) {
            self.cancelled = true;
        }

        fn reap_one(&mut self, _timeout: Duration) -> bool {
            self.reaps += 1;
            if !self.cancelled || self.queued <= self.stuck {
                return false;
            }
            self.queued -= 1;
            true
        }
    }

    #[test]
    fn test_drain_reaps_every_cancelled_transfer() {
        let mut queue = FakeQueue::new(3, 0);

        assert_eq!(drain_cancelled(&mut queue, Duration::ZERO), 0);
        assert!(queue.cancelled);
        assert_eq!(queue.reaps, 3);
        ensure_idle(None, queue.outstanding()).unwrap();
    }

    #[test]
    fn test_drain_stops_on_stuck_transfer() {
        let mut queue = FakeQueue::new(2, 1);

        let left = drain_cancelled(&mut queue, Duration::ZERO);
        assert_eq!(left, 1);
        assert_eq!(queue.reaps, 2);
        assert!(matches!(
            ensure_idle(None, left),
            Err(HostError::RequestInFlight)
        ));
    }

    #[test]
    fn test_drain_idle_queue() {
        let mut queue = FakeQueue::new(0, 0);

        assert_eq!(drain_cancelled(&mut queue, Duration::ZERO), 0);
        assert_eq!(queue.reaps, 0);
    }

    #[test]
    fn test_tracked_request_blocks_queueing() {
        assert!(matches!(
            ensure_idle(Some(RequestId(1)), 0),
            Err(HostError::RequestInFlight)
        ));
        ensure_idle(None, 0).unwrap();
    }
}
