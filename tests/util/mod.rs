#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use usb_gadget::descriptor::EndpointDescriptor;
use usb_gadget::{
    Completion, CompletionTarget, EndpointTransport, SetupPacket, SubmitError, TransferRequest,
    TransferStatus, TransportError,
};

pub const DEFAULT_CONTROLLER: &str = "udc";

/// Byte the fake writes over released buffers so stale data can never be
/// mistaken for received payload.
pub const POISON: u8 = 0xdb;

#[derive(Default)]
struct Inner {
    enabled: Option<EndpointDescriptor>,
    enable_calls: usize,
    disable_calls: usize,
    fail_next_enable: bool,
    fail_next_submit: bool,
    fail_next_control: bool,
    pending: Option<(TransferRequest, Arc<dyn CompletionTarget>)>,
    control_replies: Vec<(Vec<u8>, bool)>,
}

/// Test double for the hardware transport. Tests play the host role through
/// `deliver`/`deliver_status`; the fake enforces the one-outstanding-request
/// invariant and poisons buffers it releases.
pub struct FakeTransport {
    controller_name: String,
    controller_tag: Option<u8>,
    ep0_max_packet: u8,
    inner: Mutex<Inner>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_CONTROLLER, Some(1), 64)
    }

    pub fn with_config(controller_name: &str, controller_tag: Option<u8>, ep0_max_packet: u8) -> Self {
        Self {
            controller_name: controller_name.to_string(),
            controller_tag,
            ep0_max_packet,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn fail_next_enable(&self) {
        self.lock().fail_next_enable = true;
    }

    pub fn fail_next_submit(&self) {
        self.lock().fail_next_submit = true;
    }

    pub fn fail_next_control(&self) {
        self.lock().fail_next_control = true;
    }

    pub fn enabled_endpoint(&self) -> Option<EndpointDescriptor> {
        self.lock().enabled
    }

    pub fn enable_calls(&self) -> usize {
        self.lock().enable_calls
    }

    pub fn disable_calls(&self) -> usize {
        self.lock().disable_calls
    }

    pub fn control_replies(&self) -> Vec<(Vec<u8>, bool)> {
        self.lock().control_replies.clone()
    }

    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub fn wait_pending(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.has_pending() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn take_pending(&self) -> (TransferRequest, Arc<dyn CompletionTarget>) {
        self.lock()
            .pending
            .take()
            .expect("no receive request outstanding")
    }

    /// Completes the outstanding receive with `data`, short-read style when
    /// less than the requested length. The unwritten tail is poisoned so a
    /// consumer copying past the actual length would be caught.
    pub fn deliver(&self, data: &[u8]) {
        let (mut request, target) = self.take_pending();
        let requested = request.requested_len();
        let actual = data.len().min(requested);
        let buf = request.bytes_mut();
        buf[..actual].copy_from_slice(&data[..actual]);
        buf[actual..].fill(POISON);

        let status = if actual == requested {
            TransferStatus::Completed { actual }
        } else {
            TransferStatus::ShortRead { actual }
        };
        target.complete(Completion { request, status });
    }

    /// Completes the outstanding receive with a non-data status. The whole
    /// buffer is poisoned: none of it is valid payload.
    pub fn deliver_status(&self, status: TransferStatus) {
        let (mut request, target) = self.take_pending();
        request.bytes_mut().fill(POISON);
        target.complete(Completion { request, status });
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointTransport for FakeTransport {
    fn controller_name(&self) -> &str {
        &self.controller_name
    }

    fn controller_tag(&self) -> Option<u8> {
        self.controller_tag
    }

    fn ep0_max_packet(&self) -> u8 {
        self.ep0_max_packet
    }

    fn enable(&self, endpoint: &EndpointDescriptor) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.fail_next_enable {
            inner.fail_next_enable = false;
            return Err(TransportError::Rejected("injected enable failure".into()));
        }
        inner.enabled = Some(*endpoint);
        inner.enable_calls += 1;
        Ok(())
    }

    fn disable(&self) {
        let pending = {
            let mut inner = self.lock();
            inner.enabled = None;
            inner.disable_calls += 1;
            inner.pending.take()
        };
        // Quiesce before returning: the in-flight request is forced to an
        // Aborted completion, delivered outside our own lock.
        if let Some((mut request, target)) = pending {
            request.bytes_mut().fill(POISON);
            target.complete(Completion {
                request,
                status: TransferStatus::Aborted,
            });
        }
    }

    fn submit(
        &self,
        request: TransferRequest,
        target: Arc<dyn CompletionTarget>,
    ) -> Result<(), SubmitError> {
        let mut inner = self.lock();
        if inner.fail_next_submit {
            inner.fail_next_submit = false;
            return Err(SubmitError {
                request,
                kind: TransportError::Rejected("injected submit failure".into()),
            });
        }
        if inner.enabled.is_none() {
            return Err(SubmitError {
                request,
                kind: TransportError::NotEnabled,
            });
        }
        assert!(
            inner.pending.is_none(),
            "second receive request submitted while one is outstanding"
        );
        inner.pending = Some((request, target));
        Ok(())
    }

    fn submit_control(&self, data: &[u8], zlp: bool) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.fail_next_control {
            inner.fail_next_control = false;
            return Err(TransportError::Rejected("injected ep0 failure".into()));
        }
        inner.control_replies.push((data.to_vec(), zlp));
        Ok(())
    }
}

pub fn setup(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
    SetupPacket {
        request_type,
        request,
        value,
        index,
        length,
    }
}

pub fn get_descriptor(descriptor_type: u8, descriptor_index: u8, length: u16) -> SetupPacket {
    setup(
        0x80,
        usb_gadget::usb::USB_REQUEST_GET_DESCRIPTOR,
        (u16::from(descriptor_type) << 8) | u16::from(descriptor_index),
        0,
        length,
    )
}

pub fn set_configuration(value: u16) -> SetupPacket {
    setup(0x00, usb_gadget::usb::USB_REQUEST_SET_CONFIGURATION, value, 0, 0)
}
