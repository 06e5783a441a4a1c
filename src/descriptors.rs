//! USB descriptor model
//!
//! The engine itself only needs two things from descriptors: the device
//! descriptor's configuration count (checked during enumeration) and an
//! endpoint lookup over the active configuration for the max-packet-size
//! helper. Backends hand the device descriptor over as the raw 18-byte block
//! together with its byte order, and hand the active configuration over
//! already parsed into the types below.

use byteorder::{ByteOrder, LittleEndian, NativeEndian};

use crate::{Error, Result};

/// Length of the standard USB device descriptor.
pub const DEVICE_DESC_LENGTH: usize = 18;

/// Maximum number of configurations a conforming device may report.
pub const USB_MAXCONFIG: u8 = 8;

/// The standard USB device descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub bcd_usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// Parse the raw 18-byte descriptor block.
    ///
    /// `host_endian` tells whether the backend already converted the
    /// multi-byte fields to host byte order; otherwise they are in bus order
    /// (little-endian).
    pub fn parse(raw: &[u8; DEVICE_DESC_LENGTH], host_endian: bool) -> DeviceDescriptor {
        let u16_at = |off: usize| {
            if host_endian {
                NativeEndian::read_u16(&raw[off..off + 2])
            } else {
                LittleEndian::read_u16(&raw[off..off + 2])
            }
        };

        DeviceDescriptor {
            length: raw[0],
            descriptor_type: raw[1],
            bcd_usb: u16_at(2),
            class: raw[4],
            sub_class: raw[5],
            protocol: raw[6],
            max_packet_size0: raw[7],
            vendor_id: u16_at(8),
            product_id: u16_at(10),
            bcd_device: u16_at(12),
            manufacturer_index: raw[14],
            product_index: raw[15],
            serial_number_index: raw[16],
            num_configurations: raw[17],
        }
    }
}

/// A parsed configuration descriptor, as provided by the backend.
#[derive(Debug, Clone, Default)]
pub struct ConfigDescriptor {
    /// bConfigurationValue
    pub value: u8,
    /// One entry per interface, each holding its alternate settings.
    pub interfaces: Vec<Interface>,
}

/// All alternate settings of one interface.
#[derive(Debug, Clone, Default)]
pub struct Interface {
    pub altsettings: Vec<InterfaceDescriptor>,
}

/// One alternate setting of an interface.
#[derive(Debug, Clone, Default)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub class: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// One endpoint of an alternate setting.
#[derive(Debug, Clone, Default)]
pub struct EndpointDescriptor {
    /// bEndpointAddress, direction bit included
    pub address: u8,
    /// bmAttributes
    pub attributes: u8,
    /// wMaxPacketSize
    pub max_packet_size: u16,
    /// bInterval
    pub interval: u8,
}

impl ConfigDescriptor {
    /// Find `endpoint` anywhere in this configuration and return its
    /// wMaxPacketSize. Searches every alternate setting of every interface.
    pub fn max_packet_size(&self, endpoint: u8) -> Result<u16> {
        for iface in &self.interfaces {
            for alt in &iface.altsettings {
                for ep in &alt.endpoints {
                    if ep.address == endpoint {
                        return Ok(ep.max_packet_size);
                    }
                }
            }
        }
        Err(Error::NotFound)
    }
}
