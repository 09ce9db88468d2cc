//! Event system for UI decoupling.
//!
//! Lets the CLI (or an embedding app) follow what a session does without
//! coupling it to the session internals.

use std::fmt;

use crate::descriptor::{DeviceId, EndpointDescriptor};
use crate::permission::PermissionOutcome;

/// Events emitted by a `UsbSession`.
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// A device matching the configured IDs was found.
    DeviceFound { id: DeviceId, name: String },
    /// Enumeration finished without a match.
    DeviceNotFound { id: DeviceId },
    /// Permission was already held; no prompt needed.
    PermissionHeld { name: String },
    /// A permission prompt was handed to the host.
    PermissionRequested { name: String },
    /// The host answered a permission prompt.
    PermissionResolved { outcome: PermissionOutcome },
    /// Interface claimed and endpoints resolved.
    Opened {
        interface: u8,
        input: Option<EndpointDescriptor>,
        output: Option<EndpointDescriptor>,
    },
    /// Connection torn down. `warnings` counts swallowed teardown errors.
    Closed { warnings: usize },
    /// Bulk data sent/received.
    Packet {
        direction: PacketDirection,
        length: usize,
        /// Leading bytes of the payload.
        data: Option<Vec<u8>>,
    },
    /// Operation failed.
    Error { message: String },
}

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Device)
    Rx, // Receive (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving session events.
///
/// Permission events may arrive on the host's callback thread.
pub trait UsbObserver: Send + Sync {
    fn on_event(&self, event: &UsbEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UsbObserver for NullObserver {
    fn on_event(&self, _event: &UsbEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

fn endpoint_label(ep: &Option<EndpointDescriptor>) -> String {
    match ep {
        Some(ep) => format!("0x{:02X}", ep.address),
        None => "none".to_string(),
    }
}

impl UsbObserver for TracingObserver {
    fn on_event(&self, event: &UsbEvent) {
        match event {
            UsbEvent::DeviceFound { id, name } => {
                tracing::info!(id = %id, name = %name, "Found USB device");
            }
            UsbEvent::DeviceNotFound { id } => {
                tracing::warn!(id = %id, "Selected USB device not present");
            }
            UsbEvent::PermissionHeld { name } => {
                tracing::debug!(name = %name, "Permission already held");
            }
            UsbEvent::PermissionRequested { name } => {
                tracing::info!(name = %name, "Requesting USB permission");
            }
            UsbEvent::PermissionResolved { outcome } => {
                tracing::info!(outcome = %outcome, "Permission resolved");
            }
            UsbEvent::Opened {
                interface,
                input,
                output,
            } => {
                tracing::info!(
                    interface = interface,
                    in_ep = %endpoint_label(input),
                    out_ep = %endpoint_label(output),
                    "USB device connected"
                );
            }
            UsbEvent::Closed { warnings } => {
                if *warnings == 0 {
                    tracing::debug!("Device closed");
                } else {
                    tracing::warn!(warnings = warnings, "Device closed with errors");
                }
            }
            UsbEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "USB Packet");
            }
            UsbEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Observer that records every event, for assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<UsbEvent>>,
    }

    impl UsbObserver for RecordingObserver {
        fn on_event(&self, event: &UsbEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_recording_observer() {
        let obs = RecordingObserver::default();
        obs.on_event(&UsbEvent::Closed { warnings: 0 });
        obs.on_event(&UsbEvent::Packet {
            direction: PacketDirection::Tx,
            length: 3,
            data: Some(vec![1, 2, 3]),
        });
        let events = obs.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], UsbEvent::Closed { warnings: 0 }));
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(PacketDirection::Tx.to_string(), "TX");
        assert_eq!(PacketDirection::Rx.to_string(), "RX");
    }
}
