//! USB session - owns the host handle, the matched device and its connection.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::config::{HelperConfig, INTERFACE_INDEX};
use crate::descriptor::{Direction, EndpointPair, InterfaceDescriptor};
use crate::error::HelperError;
use crate::events::{PacketDirection, TracingObserver, UsbEvent, UsbObserver};
use crate::host::{HostError, UsbConnection, UsbDevice, UsbHost};
use crate::permission::{PermissionOutcome, PermissionSlot};

/// Number of payload bytes copied into packet events.
const PACKET_PREVIEW_LEN: usize = 32;

/// Result of `UsbSession::close`. Closing never fails; teardown errors are
/// reported here instead.
#[derive(Debug)]
pub enum CloseOutcome {
    /// Nothing was open.
    NotOpen,
    Closed,
    /// State was cleared, but releasing or closing reported errors.
    ClosedWithWarnings(Vec<HostError>),
}

impl CloseOutcome {
    pub fn is_clean(&self) -> bool {
        !matches!(self, CloseOutcome::ClosedWithWarnings(_))
    }
}

struct OpenConnection<C> {
    connection: C,
    interface: InterfaceDescriptor,
    endpoints: EndpointPair,
}

/// Session over one USB device.
///
/// Holds at most one open connection. Connection operations take `&mut self`;
/// only the permission listener is shared with the host's callback thread.
pub struct UsbSession<H: UsbHost, O: UsbObserver = TracingObserver> {
    host: H,
    config: HelperConfig,
    observer: Arc<O>,
    permission: PermissionSlot,
    device: Option<H::Device>,
    connection: Option<OpenConnection<H::Connection>>,
}

impl<H: UsbHost> UsbSession<H, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(host: H, config: HelperConfig) -> Self {
        Self::with_observer(host, config, Arc::new(TracingObserver))
    }
}

impl<H: UsbHost, O: UsbObserver> UsbSession<H, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(host: H, config: HelperConfig, observer: Arc<O>) -> Self {
        Self {
            host,
            config,
            observer,
            permission: PermissionSlot::new(),
            device: None,
            connection: None,
        }
    }

    pub fn config(&self) -> &HelperConfig {
        &self.config
    }

    /// Every attached device, in host enumeration order.
    pub fn list_devices(&self) -> Result<Vec<H::Device>, HelperError> {
        Ok(self.host.device_list()?)
    }

    fn find_matching(&self) -> Result<Option<H::Device>, HelperError> {
        let id = self.config.device_id();
        let devices = self.host.device_list()?;
        debug!(count = devices.len(), "Enumerated USB devices");

        for device in devices {
            debug!(
                name = %device.name(),
                vid = %format!("{:04X}", device.vendor_id()),
                pid = %format!("{:04X}", device.product_id()),
                "Checking device"
            );
            if id.matches(device.vendor_id(), device.product_id()) {
                return Ok(Some(device));
            }
        }
        Ok(None)
    }

    /// Find the first attached device with the configured VID/PID and
    /// remember it as the current device.
    pub fn find_device(&mut self) -> Result<Option<H::Device>, HelperError> {
        let id = self.config.device_id();
        match self.find_matching()? {
            Some(device) => {
                self.observer.on_event(&UsbEvent::DeviceFound {
                    id,
                    name: device.name(),
                });
                self.device = Some(device.clone());
                Ok(Some(device))
            }
            None => {
                self.observer.on_event(&UsbEvent::DeviceNotFound { id });
                Ok(None)
            }
        }
    }

    /// Like `find_device`, but a missing device is an error.
    pub fn require_device(&mut self) -> Result<H::Device, HelperError> {
        let id = self.config.device_id();
        self.find_device()?.ok_or(HelperError::NotFound {
            vid: id.vendor_id,
            pid: id.product_id,
        })
    }

    /// Whether a device with the configured VID/PID is attached.
    pub fn has_device(&self) -> bool {
        match self.find_matching() {
            Ok(found) => {
                if found.is_none() {
                    debug!(id = %self.config.device_id(), "Selected USB device not present");
                }
                found.is_some()
            }
            Err(e) => {
                warn!(error = %e, "Device enumeration failed");
                false
            }
        }
    }

    /// Device remembered by the last successful `find_device` or `open`.
    pub fn current_device(&self) -> Option<&H::Device> {
        self.device.as_ref()
    }

    pub fn check_permission(&self, device: &H::Device) -> bool {
        self.host.has_permission(device)
    }

    /// Acquire permission for `device`.
    ///
    /// If permission is already held `on_granted` runs before this returns.
    /// Otherwise a listener is registered and the host prompts; exactly one
    /// of the callbacks runs later, possibly on another thread, unless the
    /// listener is released first.
    pub fn request_permission<G, N>(&self, device: &H::Device, on_granted: G, on_denied: N)
    where
        O: 'static,
        G: FnOnce() + Send + 'static,
        N: FnOnce() + Send + 'static,
    {
        if self.host.has_permission(device) {
            self.observer.on_event(&UsbEvent::PermissionHeld {
                name: device.name(),
            });
            on_granted();
            return;
        }

        let granted_observer = Arc::clone(&self.observer);
        let denied_observer = Arc::clone(&self.observer);
        let responder = self.permission.register(
            move || {
                granted_observer.on_event(&UsbEvent::PermissionResolved {
                    outcome: PermissionOutcome::Granted,
                });
                on_granted();
            },
            move || {
                denied_observer.on_event(&UsbEvent::PermissionResolved {
                    outcome: PermissionOutcome::Denied,
                });
                on_denied();
            },
        );

        self.observer.on_event(&UsbEvent::PermissionRequested {
            name: device.name(),
        });
        self.host.request_permission(device, responder);
    }

    /// Request permission and block until the host answers or `timeout`
    /// elapses. On timeout the listener is released.
    pub fn request_permission_blocking(
        &self,
        device: &H::Device,
        timeout: Duration,
    ) -> Result<PermissionOutcome, HelperError>
    where
        O: 'static,
    {
        let (tx, rx) = mpsc::channel();
        let tx_denied = tx.clone();
        self.request_permission(
            device,
            move || {
                let _ = tx.send(PermissionOutcome::Granted);
            },
            move || {
                let _ = tx_denied.send(PermissionOutcome::Denied);
            },
        );

        match rx.recv_timeout(timeout) {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                self.release_permission_listener();
                Err(HelperError::PermissionTimeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Make sure the process may use `device`, prompting if needed.
    pub fn ensure_permission(
        &self,
        device: &H::Device,
        timeout: Duration,
    ) -> Result<(), HelperError>
    where
        O: 'static,
    {
        if self.check_permission(device) {
            return Ok(());
        }
        match self.request_permission_blocking(device, timeout)? {
            PermissionOutcome::Granted => Ok(()),
            PermissionOutcome::Denied => Err(HelperError::PermissionDenied),
        }
    }

    /// Unregister the pending permission listener. Safe to call when none
    /// is registered. Returns whether one was pending.
    pub fn release_permission_listener(&self) -> bool {
        let released = self.permission.release();
        if released {
            debug!("Permission listener released");
        }
        released
    }

    pub fn permission_pending(&self) -> bool {
        self.permission.is_pending()
    }

    /// Open `device`, claim interface 0 and resolve its endpoints.
    ///
    /// An already open connection is closed first. `None` fails with
    /// `NoDevice` and leaves any connection that is already open untouched.
    pub fn open(&mut self, device: Option<&H::Device>) -> Result<(), HelperError> {
        let Some(device) = device else {
            debug!("open: no device given");
            return Err(HelperError::NoDevice);
        };

        if self.connection.is_some() {
            info!("Closing previous connection before reopening");
            self.close();
        }

        let mut connection = self.host.open_device(device).map_err(|e| {
            error!(device = %device.name(), error = %e, "Open failed");
            self.observer.on_event(&UsbEvent::Error {
                message: e.to_string(),
            });
            HelperError::OpenFailed(e)
        })?;

        let Some(interface) = connection.interface(INTERFACE_INDEX) else {
            warn!(interface = INTERFACE_INDEX, "USB interface not found");
            close_after_failed_open(&mut connection);
            return Err(HelperError::InterfaceNotFound(INTERFACE_INDEX));
        };

        if let Err(e) = connection.claim_interface(&interface, true) {
            warn!(interface = interface.number, error = %e, "USB interface claim refused");
            close_after_failed_open(&mut connection);
            return Err(HelperError::ClaimFailed(e));
        }

        let endpoints = EndpointPair::classify(&interface.endpoints);
        for ep in &interface.endpoints {
            debug!(endpoint = %ep, "Found endpoint");
        }

        self.observer.on_event(&UsbEvent::Opened {
            interface: interface.number,
            input: endpoints.input,
            output: endpoints.output,
        });

        self.device = Some(device.clone());
        self.connection = Some(OpenConnection {
            connection,
            interface,
            endpoints,
        });
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Endpoints of the open connection; empty when closed.
    pub fn endpoints(&self) -> EndpointPair {
        self.connection
            .as_ref()
            .map(|open| open.endpoints)
            .unwrap_or_default()
    }

    pub fn claimed_interface(&self) -> Option<&InterfaceDescriptor> {
        self.connection.as_ref().map(|open| &open.interface)
    }

    /// Send `data[..length]` in one blocking bulk transfer on the OUT
    /// endpoint. Returns bytes written. No retry.
    #[instrument(skip(self, data), fields(available = data.len()))]
    pub fn write(
        &mut self,
        data: &[u8],
        length: usize,
        timeout: Duration,
    ) -> Result<usize, HelperError> {
        let Some(open) = self.connection.as_mut() else {
            debug!("Write without open connection");
            return Err(HelperError::NotConnected);
        };
        if length > data.len() {
            return Err(HelperError::InvalidLength {
                length,
                available: data.len(),
            });
        }
        let endpoint = open
            .endpoints
            .output
            .ok_or(HelperError::EndpointMissing(Direction::Out))?;

        let payload = &data[..length];
        match open.connection.bulk_transfer(&endpoint, payload, timeout) {
            Ok(written) => {
                debug!(code_out = written, "Bulk transfer complete");
                self.observer.on_event(&UsbEvent::Packet {
                    direction: PacketDirection::Tx,
                    length: written,
                    data: Some(payload.iter().take(PACKET_PREVIEW_LEN).copied().collect()),
                });
                Ok(written)
            }
            Err(e) => {
                warn!(error = %e, "Bulk transfer failed");
                Err(e.into())
            }
        }
    }

    /// Receive one packet from the IN endpoint.
    ///
    /// Queues a single request sized to the endpoint's max packet size and
    /// waits up to `timeout` for it. `Ok(None)` when there is no IN endpoint,
    /// the wait times out, or a different request completes.
    #[instrument(skip(self))]
    pub fn read(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, HelperError> {
        let Some(open) = self.connection.as_mut() else {
            return Ok(None);
        };
        let Some(endpoint) = open.endpoints.input else {
            return Ok(None);
        };
        if endpoint.max_packet_size == 0 {
            warn!(endpoint = %endpoint, "IN endpoint reports zero max packet size");
            return Ok(None);
        }

        let id = open
            .connection
            .queue_request(&endpoint, endpoint.max_packet_size)?;

        let completed = match open.connection.request_wait(timeout) {
            Ok(Some(completed)) => completed,
            Ok(None) => {
                debug!(request = %id, "No data before timeout");
                open.connection.cancel_requests();
                return Ok(None);
            }
            Err(e) => {
                open.connection.cancel_requests();
                return Err(e.into());
            }
        };

        if completed.id != id {
            warn!(expected = %id, completed = %completed.id, "Unexpected request completed");
            return Ok(None);
        }
        completed.status?;

        debug!(bytes_read = completed.data.len(), data = ?completed.data, "Received data");
        self.observer.on_event(&UsbEvent::Packet {
            direction: PacketDirection::Rx,
            length: completed.data.len(),
            data: Some(
                completed
                    .data
                    .iter()
                    .take(PACKET_PREVIEW_LEN)
                    .copied()
                    .collect(),
            ),
        });
        Ok(Some(completed.data))
    }

    /// Release the interface, close the connection and forget both
    /// endpoints. Never fails.
    pub fn close(&mut self) -> CloseOutcome {
        let Some(mut open) = self.connection.take() else {
            return CloseOutcome::NotOpen;
        };

        let mut warnings = Vec::new();
        open.connection.cancel_requests();
        if let Err(e) = open.connection.release_interface(&open.interface) {
            warn!(error = %e, "Error releasing interface");
            warnings.push(e);
        }
        if let Err(e) = open.connection.close() {
            warn!(error = %e, "Error closing connection");
            warnings.push(e);
        }

        self.observer.on_event(&UsbEvent::Closed {
            warnings: warnings.len(),
        });

        if warnings.is_empty() {
            CloseOutcome::Closed
        } else {
            CloseOutcome::ClosedWithWarnings(warnings)
        }
    }
}

fn close_after_failed_open<C: UsbConnection>(connection: &mut C) {
    if let Err(e) = connection.close() {
        warn!(error = %e, "Error closing connection after failed open");
    }
}

impl<H: UsbHost, O: UsbObserver> Drop for UsbSession<H, O> {
    fn drop(&mut self) {
        self.release_permission_listener();
        self.close();
    }
}
