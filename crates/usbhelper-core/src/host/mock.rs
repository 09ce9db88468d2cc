//! Mock USB host for testing.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{
    CompletedRequest, HostError, RequestId, TransferError, UsbConnection, UsbDevice, UsbHost,
};
use crate::descriptor::{EndpointDescriptor, InterfaceDescriptor};
use crate::permission::PermissionResponder;

/// Simulated attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDevice {
    name: String,
    vid: u16,
    pid: u16,
    interfaces: Vec<InterfaceDescriptor>,
}

impl MockDevice {
    pub fn new(name: &str, vid: u16, pid: u16) -> Self {
        Self {
            name: name.to_string(),
            vid,
            pid,
            interfaces: Vec::new(),
        }
    }

    pub fn with_interface(mut self, interface: InterfaceDescriptor) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Add interface 0 with one bulk IN and one bulk OUT endpoint.
    pub fn with_bulk_pair(self, in_addr: u8, out_addr: u8, max_packet_size: usize) -> Self {
        let number = self.interfaces.len() as u8;
        self.with_interface(InterfaceDescriptor {
            number,
            endpoints: vec![
                EndpointDescriptor::bulk(in_addr, max_packet_size),
                EndpointDescriptor::bulk(out_addr, max_packet_size),
            ],
        })
    }
}

impl UsbDevice for MockDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}

#[derive(Default)]
struct MockState {
    devices: Vec<MockDevice>,
    fail_enumeration: bool,
    /// Names of devices the process already holds permission for.
    permitted: HashSet<String>,
    /// Responders the "user" has not answered yet.
    permission_requests: Vec<PermissionResponder<MockDevice>>,
    permission_request_count: usize,
    auto_answer: Option<bool>,
    fail_open: bool,
    fail_claim: bool,
    fail_release: bool,
    fail_close: bool,
    opens: usize,
    closes: usize,
    releases: usize,
    /// (interface number, force) for each claim.
    claims: Vec<(u8, bool)>,
    write_log: Vec<Vec<u8>>,
    write_error: Option<TransferError>,
    read_queue: VecDeque<Result<Vec<u8>, TransferError>>,
    mismatch_completions: bool,
    cancels: usize,
}

/// Mock host with scriptable devices, permissions and transfers.
///
/// Clones share state, so a test can keep one handle while the session owns
/// another.
#[derive(Clone, Default)]
pub struct MockHost {
    state: Arc<Mutex<MockState>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a device. Enumeration order is attach order.
    pub fn attach(&self, device: MockDevice) {
        self.state().devices.push(device);
    }

    pub fn detach_all(&self) {
        self.state().devices.clear();
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.state().fail_enumeration = fail;
    }

    /// Mark permission as already held for `device`.
    pub fn grant_permission(&self, device: &MockDevice) {
        self.state().permitted.insert(device.name.clone());
    }

    /// Answer every future permission prompt immediately.
    pub fn auto_answer(&self, granted: Option<bool>) {
        self.state().auto_answer = granted;
    }

    /// Take the responders for prompts that are still unanswered.
    pub fn take_permission_requests(&self) -> Vec<PermissionResponder<MockDevice>> {
        std::mem::take(&mut self.state().permission_requests)
    }

    pub fn permission_request_count(&self) -> usize {
        self.state().permission_request_count
    }

    pub fn fail_open(&self, fail: bool) {
        self.state().fail_open = fail;
    }

    pub fn fail_claim(&self, fail: bool) {
        self.state().fail_claim = fail;
    }

    pub fn fail_release(&self, fail: bool) {
        self.state().fail_release = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.state().fail_close = fail;
    }

    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    pub fn release_count(&self) -> usize {
        self.state().releases
    }

    pub fn claims(&self) -> Vec<(u8, bool)> {
        self.state().claims.clone()
    }

    /// Get all captured writes.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().write_log.clone()
    }

    /// Make every following write fail with `error`.
    pub fn fail_writes(&self, error: Option<TransferError>) {
        self.state().write_error = error;
    }

    /// Queue a packet to be returned by the next IN request.
    pub fn queue_read(&self, data: &[u8]) {
        self.state().read_queue.push_back(Ok(data.to_vec()));
    }

    pub fn queue_read_error(&self, error: TransferError) {
        self.state().read_queue.push_back(Err(error));
    }

    /// Report completions under a request id nobody submitted.
    pub fn mismatch_completions(&self, mismatch: bool) {
        self.state().mismatch_completions = mismatch;
    }

    pub fn cancel_count(&self) -> usize {
        self.state().cancels
    }
}

impl UsbHost for MockHost {
    type Device = MockDevice;
    type Connection = MockConnection;

    fn device_list(&self) -> Result<Vec<MockDevice>, HostError> {
        let state = self.state();
        if state.fail_enumeration {
            return Err(HostError::Enumeration("mock enumeration failure".into()));
        }
        Ok(state.devices.clone())
    }

    fn has_permission(&self, device: &MockDevice) -> bool {
        self.state().permitted.contains(&device.name)
    }

    fn request_permission(&self, device: &MockDevice, responder: PermissionResponder<MockDevice>) {
        let answer = {
            let mut state = self.state();
            state.permission_request_count += 1;
            state.auto_answer
        };
        match answer {
            Some(true) => {
                self.state().permitted.insert(device.name.clone());
                responder.grant(device.clone());
            }
            Some(false) => {
                responder.deny(Some(device.clone()));
            }
            None => self.state().permission_requests.push(responder),
        }
    }

    fn open_device(&self, device: &MockDevice) -> Result<MockConnection, HostError> {
        let mut state = self.state();
        state.opens += 1;
        if state.fail_open {
            return Err(HostError::Open("mock open failure".into()));
        }
        if !state.devices.contains(device) {
            return Err(HostError::Open(format!("{} is not attached", device.name)));
        }
        Ok(MockConnection {
            state: Arc::clone(&self.state),
            device: device.clone(),
            claimed: None,
            pending: None,
            next_id: 0,
            closed: false,
        })
    }
}

/// Connection produced by `MockHost::open_device`.
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
    device: MockDevice,
    claimed: Option<u8>,
    pending: Option<(RequestId, usize)>,
    next_id: u64,
    closed: bool,
}

impl MockConnection {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl UsbConnection for MockConnection {
    fn interface(&self, index: u8) -> Option<InterfaceDescriptor> {
        self.device.interfaces.get(index as usize).cloned()
    }

    fn claim_interface(
        &mut self,
        interface: &InterfaceDescriptor,
        force: bool,
    ) -> Result<(), HostError> {
        let mut state = self.state();
        state.claims.push((interface.number, force));
        if state.fail_claim {
            return Err(HostError::Claim {
                interface: interface.number,
                message: "mock claim failure".into(),
            });
        }
        drop(state);
        self.claimed = Some(interface.number);
        Ok(())
    }

    fn release_interface(&mut self, interface: &InterfaceDescriptor) -> Result<(), HostError> {
        let mut state = self.state();
        state.releases += 1;
        if state.fail_release {
            return Err(HostError::Release {
                interface: interface.number,
                message: "mock release failure".into(),
            });
        }
        drop(state);
        self.claimed = None;
        Ok(())
    }

    fn bulk_transfer(
        &mut self,
        _endpoint: &EndpointDescriptor,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, HostError> {
        if self.closed {
            return Err(TransferError::Disconnected.into());
        }
        let mut state = self.state();
        if let Some(error) = state.write_error.clone() {
            return Err(error.into());
        }
        state.write_log.push(data.to_vec());
        Ok(data.len())
    }

    fn queue_request(
        &mut self,
        _endpoint: &EndpointDescriptor,
        len: usize,
    ) -> Result<RequestId, HostError> {
        if self.pending.is_some() {
            return Err(HostError::RequestInFlight);
        }
        self.next_id += 1;
        let id = RequestId(self.next_id);
        self.pending = Some((id, len));
        Ok(id)
    }

    fn request_wait(&mut self, _timeout: Duration) -> Result<Option<CompletedRequest>, HostError> {
        let Some((id, len)) = self.pending else {
            return Err(HostError::NoRequest);
        };
        let mut state = self.state();
        // Nothing queued behaves like the device staying silent until timeout.
        let Some(packet) = state.read_queue.pop_front() else {
            return Ok(None);
        };
        let id = if state.mismatch_completions {
            RequestId(id.0 + 1000)
        } else {
            id
        };
        drop(state);
        self.pending = None;

        let completed = match packet {
            Ok(mut data) => {
                data.truncate(len);
                CompletedRequest {
                    id,
                    data,
                    status: Ok(()),
                }
            }
            Err(e) => CompletedRequest {
                id,
                data: Vec::new(),
                status: Err(e),
            },
        };
        Ok(Some(completed))
    }

    fn cancel_requests(&mut self) {
        if self.pending.take().is_some() {
            self.state().cancels += 1;
        }
    }

    fn close(&mut self) -> Result<(), HostError> {
        self.closed = true;
        let mut state = self.state();
        state.closes += 1;
        if state.fail_close {
            return Err(HostError::Close("mock close failure".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> MockDevice {
        MockDevice::new("/dev/bus/usb/001/004", 0x1234, 0x5678).with_bulk_pair(0x81, 0x01, 64)
    }

    #[test]
    fn test_mock_enumeration_order() {
        let host = MockHost::new();
        host.attach(MockDevice::new("a", 1, 1));
        host.attach(MockDevice::new("b", 2, 2));
        let names: Vec<_> = host
            .device_list()
            .unwrap()
            .iter()
            .map(|d| d.name())
            .collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_mock_single_request_in_flight() {
        let host = MockHost::new();
        let dev = device();
        host.attach(dev.clone());
        let mut conn = host.open_device(&dev).unwrap();
        let ep = EndpointDescriptor::bulk(0x81, 64);

        conn.queue_request(&ep, 64).unwrap();
        assert!(matches!(
            conn.queue_request(&ep, 64),
            Err(HostError::RequestInFlight)
        ));

        conn.cancel_requests();
        assert_eq!(host.cancel_count(), 1);
        assert!(conn.queue_request(&ep, 64).is_ok());
    }

    #[test]
    fn test_mock_read_truncates_to_request() {
        let host = MockHost::new();
        let dev = device();
        host.attach(dev.clone());
        host.queue_read(&[1, 2, 3, 4]);
        let mut conn = host.open_device(&dev).unwrap();
        let ep = EndpointDescriptor::bulk(0x81, 2);

        let id = conn.queue_request(&ep, 2).unwrap();
        let done = conn.request_wait(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(done.id, id);
        assert_eq!(done.data, [1, 2]);
    }

    #[test]
    fn test_mock_write_capture() {
        let host = MockHost::new();
        let dev = device();
        host.attach(dev.clone());
        let mut conn = host.open_device(&dev).unwrap();
        let ep = EndpointDescriptor::bulk(0x01, 64);

        conn.bulk_transfer(&ep, b"Hello", Duration::ZERO).unwrap();
        conn.bulk_transfer(&ep, b"World", Duration::ZERO).unwrap();
        assert_eq!(host.writes(), [b"Hello".to_vec(), b"World".to_vec()]);

        conn.close().unwrap();
        assert_eq!(host.close_count(), 1);
        assert!(conn.bulk_transfer(&ep, b"late", Duration::ZERO).is_err());
    }
}
