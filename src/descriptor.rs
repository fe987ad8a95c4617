//! Descriptor catalog: the static device/configuration/interface/endpoint and
//! string records, plus their canonical binary serialization.
//!
//! Layouts are the fixed structures of USB 2.0 chapter 9: Device is 18 bytes,
//! Configuration is a 9-byte header followed by the concatenated interface
//! (9 bytes) and endpoint (7 bytes) records with `wTotalLength` patched at
//! offset 2, and String descriptors are (length, type, UTF-16LE payload).

use std::collections::BTreeMap;

use thiserror::Error;

use crate::usb::{
    LANGID_EN_US, USB_DESCRIPTOR_TYPE_CONFIGURATION, USB_DESCRIPTOR_TYPE_DEVICE,
    USB_DESCRIPTOR_TYPE_ENDPOINT, USB_DESCRIPTOR_TYPE_INTERFACE, USB_DESCRIPTOR_TYPE_STRING,
};

pub const DRIVER_VENDOR_ID: u16 = 0xefef;
pub const DRIVER_PRODUCT_ID: u16 = 0x0036;

/// bConfigurationValue of the single modeled (loopback) configuration.
pub const LOOPBACK_CONFIG_VALUE: u8 = 2;

pub const STRING_MANUFACTURER: u8 = 25;
pub const STRING_PRODUCT: u8 = 42;
pub const STRING_SERIAL: u8 = 101;
pub const STRING_LOOPBACK: u8 = 249;

/// A string descriptor payload is length-prefixed by a single byte, which
/// bounds the UTF-16LE payload at 126 code units.
const STRING_PAYLOAD_MAX: usize = 252;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("no string descriptor at index {index}")]
    StringNotFound { index: u8 },
    #[error("unsupported language id {langid:#06x}")]
    UnsupportedLanguage { langid: u16 },
    #[error("unsupported descriptor type {descriptor_type:#04x}")]
    UnsupportedType { descriptor_type: u8 },
    #[error("descriptor references string index {index} missing from the table")]
    MissingString { index: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn serialize(&self) -> [u8; 18] {
        let bcd_usb = self.bcd_usb.to_le_bytes();
        let id_vendor = self.id_vendor.to_le_bytes();
        let id_product = self.id_product.to_le_bytes();
        let bcd_device = self.bcd_device.to_le_bytes();
        [
            18,
            USB_DESCRIPTOR_TYPE_DEVICE,
            bcd_usb[0],
            bcd_usb[1],
            self.device_class,
            self.device_sub_class,
            self.device_protocol,
            self.max_packet_size0,
            id_vendor[0],
            id_vendor[1],
            id_product[0],
            id_product[1],
            bcd_device[0],
            bcd_device[1],
            self.i_manufacturer,
            self.i_product,
            self.i_serial_number,
            self.num_configurations,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub i_configuration: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigurationDescriptor {
    /// Header only; `wTotalLength` is left zero and patched by the catalog
    /// once the full composition is known.
    fn serialize_header(&self) -> [u8; 9] {
        [
            9,
            USB_DESCRIPTOR_TYPE_CONFIGURATION,
            0,
            0,
            self.num_interfaces,
            self.configuration_value,
            self.i_configuration,
            self.attributes,
            self.max_power,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    fn serialize(&self) -> [u8; 9] {
        [
            9,
            USB_DESCRIPTOR_TYPE_INTERFACE,
            self.interface_number,
            self.alternate_setting,
            self.num_endpoints,
            self.interface_class,
            self.interface_sub_class,
            self.interface_protocol,
            self.i_interface,
        ]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn serialize(&self) -> [u8; 7] {
        let max_packet = self.max_packet_size.to_le_bytes();
        [
            7,
            USB_DESCRIPTOR_TYPE_ENDPOINT,
            self.address,
            self.attributes,
            max_packet[0],
            max_packet[1],
            self.interval,
        ]
    }
}

/// Index-to-string map backing STRING descriptor requests.
///
/// Index 0 is reserved by the standard for the language-ID list and is served
/// directly from `language`.
#[derive(Clone, Debug)]
pub struct StringTable {
    language: u16,
    strings: BTreeMap<u8, String>,
}

impl StringTable {
    pub fn new(language: u16) -> Self {
        Self {
            language,
            strings: BTreeMap::new(),
        }
    }

    pub fn en_us() -> Self {
        Self::new(LANGID_EN_US)
    }

    pub fn insert(&mut self, index: u8, value: impl Into<String>) {
        self.strings.insert(index, value.into());
    }

    pub fn contains(&self, index: u8) -> bool {
        self.strings.contains_key(&index)
    }

    fn serialize(&self, index: u8, langid: u16) -> Result<Vec<u8>, DescriptorError> {
        if index == 0 {
            let lang = self.language.to_le_bytes();
            return Ok(vec![4, USB_DESCRIPTOR_TYPE_STRING, lang[0], lang[1]]);
        }
        // Hosts are expected to echo a language id learned from index 0; a
        // zero langid is tolerated because real host stacks send it while
        // probing.
        if langid != 0 && langid != self.language {
            return Err(DescriptorError::UnsupportedLanguage { langid });
        }
        let value = self
            .strings
            .get(&index)
            .ok_or(DescriptorError::StringNotFound { index })?;

        let mut out = Vec::with_capacity(2 + value.len() * 2);
        out.push(0);
        out.push(USB_DESCRIPTOR_TYPE_STRING);
        for unit in value.encode_utf16() {
            if out.len() + 2 > 2 + STRING_PAYLOAD_MAX {
                break;
            }
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out[0] = out.len() as u8;
        Ok(out)
    }
}

/// The assembled descriptor set served to the host.
///
/// Holds exactly one configuration with one interface and one bulk OUT
/// endpoint; the serialization helpers clamp their output to the control
/// transfer's requested length.
#[derive(Clone, Debug)]
pub struct DescriptorCatalog {
    device: DeviceDescriptor,
    config: ConfigurationDescriptor,
    interface: InterfaceDescriptor,
    endpoint: EndpointDescriptor,
    strings: StringTable,
}

impl DescriptorCatalog {
    /// Validates the string-index invariant at construction: every index any
    /// descriptor references must exist in the table.
    pub fn new(
        device: DeviceDescriptor,
        config: ConfigurationDescriptor,
        interface: InterfaceDescriptor,
        endpoint: EndpointDescriptor,
        strings: StringTable,
    ) -> Result<Self, DescriptorError> {
        let referenced = [
            device.i_manufacturer,
            device.i_product,
            device.i_serial_number,
            config.i_configuration,
            interface.i_interface,
        ];
        for index in referenced {
            if index != 0 && !strings.contains(index) {
                return Err(DescriptorError::MissingString { index });
            }
        }
        Ok(Self {
            device,
            config,
            interface,
            endpoint,
            strings,
        })
    }

    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    pub fn ep0_max_packet(&self) -> u8 {
        self.device.max_packet_size0
    }

    pub fn device_descriptor(&self, max_len: usize) -> Vec<u8> {
        clamp(self.device.serialize().to_vec(), max_len)
    }

    /// Concatenates configuration + interface + endpoint and patches the
    /// aggregate `wTotalLength` field; never hand-maintained.
    pub fn configuration_descriptor(&self, max_len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + 9 + 7);
        out.extend_from_slice(&self.config.serialize_header());
        out.extend_from_slice(&self.interface.serialize());
        out.extend_from_slice(&self.endpoint.serialize());

        let total = out.len() as u16;
        out[2..4].copy_from_slice(&total.to_le_bytes());
        clamp(out, max_len)
    }

    pub fn string_descriptor(
        &self,
        index: u8,
        langid: u16,
        max_len: usize,
    ) -> Result<Vec<u8>, DescriptorError> {
        Ok(clamp(self.strings.serialize(index, langid)?, max_len))
    }
}

fn clamp(mut bytes: Vec<u8>, max_len: usize) -> Vec<u8> {
    bytes.truncate(max_len);
    bytes
}
