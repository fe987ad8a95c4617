//! Gadget runtime state: bind/unbind lifecycle, the configuration manager,
//! and the bridge that hands a completed bulk transfer to a blocked consumer.
//!
//! Two execution contexts meet here. The transport's completion context calls
//! [`CompletionTarget::complete`] and must never block; the consumer context
//! calls [`UsbGadget::read`] and suspends on a condvar until the slot is
//! filled. The receive slot is written only under the state mutex before the
//! wake is issued, so the consumer can never observe a partial write.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use thiserror::Error;

use crate::descriptor::{
    ConfigurationDescriptor, DescriptorCatalog, DescriptorError, DeviceDescriptor,
    EndpointDescriptor, InterfaceDescriptor, StringTable, DRIVER_PRODUCT_ID, DRIVER_VENDOR_ID,
    LOOPBACK_CONFIG_VALUE, STRING_LOOPBACK, STRING_MANUFACTURER, STRING_PRODUCT, STRING_SERIAL,
};
use crate::transport::{
    Completion, CompletionTarget, EndpointTransport, OutOfMemory, TransferRequest, TransferStatus,
    TransportError,
};
use crate::usb::{
    USB_CLASS_VENDOR_SPEC, USB_CONFIG_ATT_ONE, USB_CONFIG_ATT_SELFPOWER, USB_DIR_OUT,
    USB_ENDPOINT_XFER_BULK,
};

/// Per-transfer receive buffer size. Also the maximum payload a single
/// `read` can return.
pub const BULK_BUFFER_LEN: usize = 128;

const BULK_OUT_ADDRESS: u8 = USB_DIR_OUT | 0x01;
const BULK_MAX_PACKET: u16 = 64;

const MANUFACTURER_BASE: &str = "usb-gadget";
const PRODUCT_NAME: &str = "Bulk loopback gadget";
const LOOPBACK_CONFIG_NAME: &str = "loop input to output";
// Long enough that the string descriptor spans more than one ep0 packet.
const SERIAL_NUMBER: &str = "0123456789.0123456789.0123456789";

#[derive(Debug, Error)]
pub enum BindError {
    #[error("control endpoint reports a zero maximum packet size")]
    InvalidEp0MaxPacket,
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration value {0}")]
    UnknownConfiguration(u8),
    #[error("failed to enable the data endpoint")]
    EnableFailed(#[source] TransportError),
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("device is not configured")]
    Unconfigured,
    #[error("a receive request is already outstanding on this stream")]
    Busy,
    #[error("host disconnected")]
    Disconnected,
    #[error("host sent more data than the transfer buffer could hold")]
    Overflow,
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
    #[error("failed to submit the receive request")]
    Submit(#[source] TransportError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConfigState {
    Unconfigured,
    Configured(u8),
}

/// What a finished receive left for the consumer.
#[derive(Debug)]
enum ReceiveOutcome {
    Data(Vec<u8>),
    Disconnected,
    Overflowed,
}

/// Single-slot hand-off between the completion context and the consumer.
/// Overwritten, never queued; `Pending` is what makes a second concurrent
/// read refuse with `Busy`.
#[derive(Debug)]
enum ReceiveSlot {
    Idle,
    Pending,
    Ready(ReceiveOutcome),
}

#[derive(Debug)]
struct GadgetState {
    config: ConfigState,
    slot: ReceiveSlot,
    stall_events: u64,
}

pub(crate) struct GadgetShared {
    pub(crate) transport: Arc<dyn EndpointTransport>,
    pub(crate) catalog: DescriptorCatalog,
    /// Serializes configuration transitions and straddles the transport
    /// enable/disable calls. Always acquired before `state`, and never held
    /// by the completion context.
    config_op: Mutex<()>,
    state: Mutex<GadgetState>,
    wake: Condvar,
}

impl GadgetShared {
    fn lock_state(&self) -> MutexGuard<'_, GadgetState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_config_op(&self) -> MutexGuard<'_, ()> {
        match self.config_op.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, GadgetState>) -> MutexGuard<'a, GadgetState> {
        match self.wake.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn note_protocol_stall(&self) {
        self.lock_state().stall_events += 1;
    }
}

impl CompletionTarget for GadgetShared {
    fn complete(&self, completion: Completion) {
        let Completion { request, status } = completion;

        let mut st = self.lock_state();
        if !matches!(st.slot, ReceiveSlot::Pending) {
            // Stale completion for a read that already resolved (e.g. its
            // submit raced with a teardown). Dropping the request releases
            // the buffer, same as every other path out of here.
            return;
        }
        st.slot = ReceiveSlot::Ready(match status {
            TransferStatus::Completed { actual } | TransferStatus::ShortRead { actual } => {
                let len = actual.min(request.requested_len());
                ReceiveOutcome::Data(request.bytes()[..len].to_vec())
            }
            TransferStatus::Aborted | TransferStatus::Disconnected => ReceiveOutcome::Disconnected,
            TransferStatus::Overflowed => ReceiveOutcome::Overflowed,
        });
        // `request` is dropped here: the single release path for every
        // status outcome. The slot write committed above, under the mutex,
        // before any waiter can run.
        self.wake.notify_all();
    }
}

/// Handle to one bound gadget. Cheap to clone; all clones share the same
/// underlying state.
#[derive(Clone)]
pub struct UsbGadget {
    pub(crate) shared: Arc<GadgetShared>,
}

impl UsbGadget {
    /// Binds the function to a transport: computes the bind-time descriptor
    /// fields (ep0 max packet, controller revision tag, manufacturer string)
    /// and assembles the descriptor catalog.
    pub fn bind(transport: Arc<dyn EndpointTransport>) -> Result<Self, BindError> {
        let ep0_max_packet = transport.ep0_max_packet();
        if ep0_max_packet == 0 {
            return Err(BindError::InvalidEp0MaxPacket);
        }

        let bcd_device = match transport.controller_tag() {
            Some(tag) => 0x0200 + u16::from(tag),
            None => {
                tracing::warn!(
                    controller = transport.controller_name(),
                    "controller not recognized, using placeholder bcdDevice"
                );
                0x9999
            }
        };

        let mut strings = StringTable::en_us();
        strings.insert(
            STRING_MANUFACTURER,
            format!("{MANUFACTURER_BASE} with {}", transport.controller_name()),
        );
        strings.insert(STRING_PRODUCT, PRODUCT_NAME);
        strings.insert(STRING_SERIAL, SERIAL_NUMBER);
        strings.insert(STRING_LOOPBACK, LOOPBACK_CONFIG_NAME);

        let catalog = DescriptorCatalog::new(
            DeviceDescriptor {
                bcd_usb: 0x0110,
                device_class: USB_CLASS_VENDOR_SPEC,
                device_sub_class: 0,
                device_protocol: 0,
                max_packet_size0: ep0_max_packet,
                id_vendor: DRIVER_VENDOR_ID,
                id_product: DRIVER_PRODUCT_ID,
                bcd_device,
                i_manufacturer: STRING_MANUFACTURER,
                i_product: STRING_PRODUCT,
                i_serial_number: STRING_SERIAL,
                num_configurations: 1,
            },
            ConfigurationDescriptor {
                num_interfaces: 1,
                configuration_value: LOOPBACK_CONFIG_VALUE,
                i_configuration: STRING_LOOPBACK,
                attributes: USB_CONFIG_ATT_ONE | USB_CONFIG_ATT_SELFPOWER,
                max_power: 1,
            },
            InterfaceDescriptor {
                interface_number: 0,
                alternate_setting: 0,
                num_endpoints: 1,
                interface_class: USB_CLASS_VENDOR_SPEC,
                interface_sub_class: 0,
                interface_protocol: 0,
                i_interface: STRING_LOOPBACK,
            },
            EndpointDescriptor {
                address: BULK_OUT_ADDRESS,
                attributes: USB_ENDPOINT_XFER_BULK,
                max_packet_size: BULK_MAX_PACKET,
                interval: 0,
            },
            strings,
        )?;

        Ok(Self {
            shared: Arc::new(GadgetShared {
                transport,
                catalog,
                config_op: Mutex::new(()),
                state: Mutex::new(GadgetState {
                    config: ConfigState::Unconfigured,
                    slot: ReceiveSlot::Idle,
                    stall_events: 0,
                }),
                wake: Condvar::new(),
            }),
        })
    }

    /// Current configuration value, `None` when unconfigured.
    pub fn configuration(&self) -> Option<u8> {
        match self.shared.lock_state().config {
            ConfigState::Unconfigured => None,
            ConfigState::Configured(value) => Some(value),
        }
    }

    /// Number of control requests rejected with a stall so far.
    pub fn stall_events(&self) -> u64 {
        self.shared.lock_state().stall_events
    }

    /// Applies a SET_CONFIGURATION value. Zero deconfigures; the modeled
    /// loopback value enables the data endpoint; anything else is rejected.
    pub fn set_configuration(&self, value: u16) -> Result<(), ConfigError> {
        let _op = self.shared.lock_config_op();
        let value = (value & 0x00ff) as u8;

        if value == 0 {
            self.teardown();
            return Ok(());
        }
        if value != LOOPBACK_CONFIG_VALUE {
            return Err(ConfigError::UnknownConfiguration(value));
        }

        {
            let st = self.shared.lock_state();
            // Re-selecting the active configuration is a no-op, not a
            // double-enable.
            if st.config == ConfigState::Configured(value) {
                return Ok(());
            }
        }

        match self.shared.transport.enable(self.shared.catalog.endpoint()) {
            Ok(()) => {
                self.shared.lock_state().config = ConfigState::Configured(value);
                tracing::debug!(configuration = value, "data endpoint enabled");
                Ok(())
            }
            Err(err) => {
                self.shared.lock_state().config = ConfigState::Unconfigured;
                tracing::warn!(error = %err, "endpoint enable failed, configuration rejected");
                Err(ConfigError::EnableFailed(err))
            }
        }
    }

    /// Host-disconnect path: tears the configuration down and wakes any
    /// blocked consumer with the disconnected outcome.
    pub fn disconnect(&self) {
        let _op = self.shared.lock_config_op();
        self.teardown();
    }

    /// Caller holds `config_op`. The state mutex is only taken briefly so the
    /// transport's abort completion (which also takes it) cannot deadlock
    /// against us while `disable` blocks on quiescence.
    fn teardown(&self) {
        let was_configured = {
            let mut st = self.shared.lock_state();
            let was = matches!(st.config, ConfigState::Configured(_));
            st.config = ConfigState::Unconfigured;
            was
        };
        if !was_configured {
            return;
        }

        // Blocks until any in-flight receive has been quiesced via an
        // Aborted completion.
        self.shared.transport.disable();

        let mut st = self.shared.lock_state();
        if matches!(st.slot, ReceiveSlot::Pending) {
            // The transport owed us an abort completion and did not deliver
            // one; the consumer must still never block past teardown.
            st.slot = ReceiveSlot::Ready(ReceiveOutcome::Disconnected);
            self.shared.wake.notify_all();
        }
    }

    /// Blocking consumer read: submits one receive request sized to
    /// [`BULK_BUFFER_LEN`], suspends until its completion arrives, and copies
    /// the received bytes into `buf`. Returns the number of bytes copied.
    ///
    /// At most one read may be outstanding per gadget; a concurrent call
    /// fails with [`ReadError::Busy`]. A failed submit propagates and is
    /// never retried here.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, ReadError> {
        {
            let mut st = self.shared.lock_state();
            if !matches!(st.config, ConfigState::Configured(_)) {
                return Err(ReadError::Unconfigured);
            }
            if !matches!(st.slot, ReceiveSlot::Idle) {
                return Err(ReadError::Busy);
            }
            st.slot = ReceiveSlot::Pending;
        }

        let request = match TransferRequest::allocate(BULK_BUFFER_LEN) {
            Ok(request) => request,
            Err(err) => {
                self.reset_slot();
                return Err(ReadError::OutOfMemory(err));
            }
        };

        let target: Arc<dyn CompletionTarget> = self.shared.clone();
        if let Err(err) = self.shared.transport.submit(request, target) {
            // The refused request comes back inside the error and is
            // released right here when it drops.
            self.reset_slot();
            return Err(ReadError::Submit(err.kind));
        }

        let mut st = self.shared.lock_state();
        while matches!(st.slot, ReceiveSlot::Pending) {
            st = self.shared.wait(st);
        }
        let outcome = match std::mem::replace(&mut st.slot, ReceiveSlot::Idle) {
            ReceiveSlot::Ready(outcome) => outcome,
            // Only a teardown racing the submit failure path can leave the
            // slot non-Ready; surface it as a disconnect.
            _ => ReceiveOutcome::Disconnected,
        };
        drop(st);

        match outcome {
            ReceiveOutcome::Data(bytes) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok(len)
            }
            ReceiveOutcome::Disconnected => Err(ReadError::Disconnected),
            ReceiveOutcome::Overflowed => Err(ReadError::Overflow),
        }
    }

    fn reset_slot(&self) {
        self.shared.lock_state().slot = ReceiveSlot::Idle;
    }
}
