//! Control-transfer state machine for ep0.
//!
//! One SETUP packet in, one reply out: either a payload clamped to the
//! requested length or a stall. Control handling is serialized by the
//! transport (one request fully resolved before the next arrives), so no
//! extra locking is needed around the dispatch itself.

use crate::descriptor::DescriptorError;
use crate::gadget::UsbGadget;
use crate::usb::{
    SetupPacket, USB_DESCRIPTOR_TYPE_CONFIGURATION, USB_DESCRIPTOR_TYPE_DEVICE,
    USB_DESCRIPTOR_TYPE_STRING, USB_DIR_IN, USB_REQUEST_GET_DESCRIPTOR,
    USB_REQUEST_SET_CONFIGURATION,
};

/// Outcome of one control request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlReply {
    /// Payload for the data stage (possibly empty for status-only requests)
    /// plus whether the transport must append a zero-length packet.
    Data { bytes: Vec<u8>, zlp: bool },
    /// Protocol error or unsupported request.
    Stall,
}

impl ControlReply {
    /// Short-transfer termination rule, computed rather than set per request:
    /// a trailing ZLP is needed exactly when the payload is shorter than the
    /// host asked for and lands on a packet boundary.
    fn data(bytes: Vec<u8>, setup: SetupPacket, ep0_max_packet: u8) -> Self {
        let zlp = bytes.len() < usize::from(setup.length)
            && bytes.len() % usize::from(ep0_max_packet) == 0;
        ControlReply::Data { bytes, zlp }
    }

    pub fn is_stall(&self) -> bool {
        matches!(self, ControlReply::Stall)
    }
}

impl UsbGadget {
    /// Resolves one control request against the descriptor catalog and the
    /// configuration manager. Pure with respect to the transport: nothing is
    /// submitted (see [`UsbGadget::handle_setup`]).
    pub fn handle_control(&self, setup: SetupPacket) -> ControlReply {
        let ep0_max_packet = self.shared.catalog.ep0_max_packet();

        match setup.request {
            USB_REQUEST_GET_DESCRIPTOR if setup.request_type == USB_DIR_IN => {
                match self.descriptor_reply(setup) {
                    Ok(bytes) => ControlReply::data(bytes, setup, ep0_max_packet),
                    Err(err) => {
                        tracing::warn!(
                            value = setup.value,
                            index = setup.index,
                            error = %err,
                            "GET_DESCRIPTOR rejected"
                        );
                        self.shared.note_protocol_stall();
                        ControlReply::Stall
                    }
                }
            }
            USB_REQUEST_SET_CONFIGURATION if setup.request_type == 0x00 => {
                match self.set_configuration(setup.value) {
                    Ok(()) => ControlReply::data(Vec::new(), setup, ep0_max_packet),
                    Err(err) => {
                        tracing::warn!(
                            value = setup.value,
                            error = %err,
                            "SET_CONFIGURATION rejected"
                        );
                        self.shared.note_protocol_stall();
                        ControlReply::Stall
                    }
                }
            }
            _ => {
                tracing::warn!(
                    request_type = setup.request_type,
                    request = setup.request,
                    value = setup.value,
                    index = setup.index,
                    length = setup.length,
                    "unsupported control request"
                );
                self.shared.note_protocol_stall();
                ControlReply::Stall
            }
        }
    }

    /// Transport-facing entry point: resolves the request and queues any
    /// reply on the control endpoint. A submission failure is reported to
    /// the host as a stall.
    pub fn handle_setup(&self, setup: SetupPacket) -> ControlReply {
        let reply = self.handle_control(setup);
        if let ControlReply::Data { bytes, zlp } = &reply {
            if let Err(err) = self.shared.transport.submit_control(bytes, *zlp) {
                tracing::warn!(error = %err, "control response submission failed");
                return ControlReply::Stall;
            }
        }
        reply
    }

    fn descriptor_reply(&self, setup: SetupPacket) -> Result<Vec<u8>, DescriptorError> {
        let max_len = usize::from(setup.length);
        match setup.descriptor_type() {
            USB_DESCRIPTOR_TYPE_DEVICE => Ok(self.shared.catalog.device_descriptor(max_len)),
            USB_DESCRIPTOR_TYPE_CONFIGURATION => {
                Ok(self.shared.catalog.configuration_descriptor(max_len))
            }
            USB_DESCRIPTOR_TYPE_STRING => {
                self.shared
                    .catalog
                    .string_descriptor(setup.descriptor_index(), setup.index, max_len)
            }
            descriptor_type => Err(DescriptorError::UnsupportedType { descriptor_type }),
        }
    }
}
