//! Plain descriptor values shared by every host backend.

use std::fmt;

/// Vendor/product pair identifying the target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceId {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// True if the given IDs name this device.
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)
    }
}

/// Endpoint direction, relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device -> host.
    In,
    /// Host -> device.
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address.
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

/// Endpoint transfer type as declared in its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Control => write!(f, "Control"),
            TransferKind::Isochronous => write!(f, "Isochronous"),
            TransferKind::Bulk => write!(f, "Bulk"),
            TransferKind::Interrupt => write!(f, "Interrupt"),
        }
    }
}

/// A single endpoint of a claimed interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    pub max_packet_size: usize,
}

impl EndpointDescriptor {
    /// Bulk endpoint with direction taken from the address.
    pub fn bulk(address: u8, max_packet_size: usize) -> Self {
        Self {
            address,
            direction: Direction::from_address(address),
            kind: TransferKind::Bulk,
            max_packet_size,
        }
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:02X} {} {} mps={}",
            self.address, self.kind, self.direction, self.max_packet_size
        )
    }
}

/// Interface as found in the active configuration (alternate setting 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// IN/OUT endpoints resolved from an interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointPair {
    pub input: Option<EndpointDescriptor>,
    pub output: Option<EndpointDescriptor>,
}

impl EndpointPair {
    /// Classify endpoints by direction. The last endpoint seen in each
    /// direction wins.
    pub fn classify(endpoints: &[EndpointDescriptor]) -> Self {
        let mut pair = Self::default();
        for ep in endpoints {
            match ep.direction {
                Direction::In => pair.input = Some(*ep),
                Direction::Out => pair.output = Some(*ep),
            }
        }
        pair
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_from_address() {
        assert_eq!(Direction::from_address(0x81), Direction::In);
        assert_eq!(Direction::from_address(0x02), Direction::Out);
    }

    #[test]
    fn test_classify_last_wins() {
        let eps = [
            EndpointDescriptor::bulk(0x81, 64),
            EndpointDescriptor::bulk(0x01, 64),
            EndpointDescriptor::bulk(0x82, 512),
        ];
        let pair = EndpointPair::classify(&eps);
        assert_eq!(pair.input.unwrap().address, 0x82);
        assert_eq!(pair.output.unwrap().address, 0x01);
    }

    #[test]
    fn test_classify_missing_direction() {
        let pair = EndpointPair::classify(&[EndpointDescriptor::bulk(0x81, 64)]);
        assert!(pair.input.is_some());
        assert!(pair.output.is_none());
    }

    #[test]
    fn test_device_id_display() {
        let id = DeviceId::new(0x2D40, 0x00B7);
        assert_eq!(id.to_string(), "2D40:00B7");
        assert!(id.matches(0x2D40, 0x00B7));
        assert!(!id.matches(0x2D40, 0x0000));
    }
}
