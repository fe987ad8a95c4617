//! Wire-level USB protocol types shared by the rest of the crate.
//!
//! Constants follow the USB 2.0 specification chapter 9 naming; only the
//! subset this gadget actually speaks is defined here.

pub const USB_DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const USB_DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const USB_DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub const USB_DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const USB_DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;

pub const USB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const USB_REQUEST_SET_CONFIGURATION: u8 = 0x09;

/// bmRequestType direction bit (device-to-host when set).
pub const USB_DIR_IN: u8 = 0x80;
/// bEndpointAddress direction bit (host-to-device when clear).
pub const USB_DIR_OUT: u8 = 0x00;

pub const USB_CLASS_VENDOR_SPEC: u8 = 0xff;

/// bmAttributes transfer-type field, bulk.
pub const USB_ENDPOINT_XFER_BULK: u8 = 0x02;

/// Configuration bmAttributes: bit 7 is reserved-set, bit 6 is self-powered.
pub const USB_CONFIG_ATT_ONE: u8 = 1 << 7;
pub const USB_CONFIG_ATT_SELFPOWER: u8 = 1 << 6;

pub const LANGID_EN_US: u16 = 0x0409;

/// An ep0 SETUP packet, already byte-order decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn is_device_to_host(self) -> bool {
        self.request_type & USB_DIR_IN != 0
    }

    /// Descriptor type selector of a GET_DESCRIPTOR request (high byte of wValue).
    pub fn descriptor_type(self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Descriptor index of a GET_DESCRIPTOR request (low byte of wValue).
    pub fn descriptor_index(self) -> u8 {
        (self.value & 0x00ff) as u8
    }
}
