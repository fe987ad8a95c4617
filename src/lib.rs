//! Device-side USB function core: control-transfer enumeration plus a bulk
//! OUT receive path bridged to a blocking consumer.
//!
//! The crate sits between a hardware transport (anything implementing
//! [`EndpointTransport`]) and a local consumer calling [`UsbGadget::read`].
//! The transport feeds SETUP packets to [`UsbGadget::handle_setup`] and
//! delivers bulk completions through [`CompletionTarget`]; everything else —
//! descriptors, configuration state, the single-slot receive hand-off — lives
//! here.

pub mod control;
pub mod descriptor;
pub mod gadget;
pub mod transport;
pub mod usb;

pub use control::ControlReply;
pub use gadget::{BindError, ConfigError, ReadError, UsbGadget, BULK_BUFFER_LEN};
pub use transport::{
    Completion, CompletionTarget, EndpointTransport, OutOfMemory, SubmitError, TransferRequest,
    TransferStatus, TransportError,
};
pub use usb::SetupPacket;
