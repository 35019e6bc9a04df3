//! Catalog of the serial adapters attached to the host.
//!
//! Only USB-serial bridges whose `vendor:product` pair is on the allow-list are
//! reported. The catalog is advisory: an enumeration failure yields an empty
//! list, never an error.

use std::{fmt, str::FromStr};

use log::{debug, info};
use serialport::{available_ports, SerialPortType};

// =============================================================================
// Public Interface
// =============================================================================

/// A USB `vendor:product` identifier pair.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}
impl UsbId {
    pub const fn new(vid: u16, pid: u16) -> Self {
        UsbId { vid, pid }
    }

    /// The bridge chips found on the taximeter boards: WCH CH340, Silicon
    /// Labs CP210x and FTDI FT232R.
    pub fn known_bridges() -> Vec<UsbId> {
        vec![
            UsbId::new(0x1A86, 0x7523),
            UsbId::new(0x10C4, 0xEA60),
            UsbId::new(0x0403, 0x6001),
        ]
    }
}
impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vid, self.pid)
    }
}
impl FromStr for UsbId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(2, ':');
        let mut hex = |what: &str| {
            parts
                .next()
                .and_then(|p| u16::from_str_radix(p, 16).ok())
                .ok_or_else(|| format!("invalid {} id in `{}`", what, s))
        };
        let vid = hex("vendor")?;
        let pid = hex("product")?;
        Ok(UsbId { vid, pid })
    }
}

/// A snapshot of one recognized serial adapter.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SerialPortInfo {
    /// The device path, e.g. `/dev/ttyUSB0` or `COM4`.
    pub device_path: String,
    pub description: String,
    /// `USB VID:PID=xxxx:xxxx SER=...`
    pub hardware_id: String,
}

/// Enumerates the serial devices of the host and keeps the ones matching
/// `allowed`.
pub fn list_ports(allowed: &[UsbId]) -> Vec<SerialPortInfo> {
    match available_ports() {
        Ok(ports) => filter_ports(ports, allowed),
        Err(ref e) => {
            info!("error: {}", e.to_string());
            vec![]
        }
    }
}

/// Whether `path` is currently one of the recognized serial adapters.
pub fn is_port_connected(path: &str, allowed: &[UsbId]) -> bool {
    list_ports(allowed).iter().any(|p| p.device_path == path)
}

// =============================================================================
// Private stuff
// =============================================================================

fn filter_ports(ports: Vec<serialport::SerialPortInfo>, allowed: &[UsbId]) -> Vec<SerialPortInfo> {
    let mut usb_ports = vec![];
    for p in ports {
        match p.port_type {
            SerialPortType::UsbPort(info) => {
                let id = UsbId::new(info.vid, info.pid);
                if !allowed.contains(&id) {
                    debug!("ignoring {} ({})", p.port_name, id);
                    continue;
                }
                let description = match (&info.manufacturer, &info.product) {
                    (None, None) => p.port_name.clone(),
                    (manufacturer, product) => format!(
                        "{} / {}",
                        manufacturer.as_ref().map_or("", String::as_str),
                        product.as_ref().map_or("", String::as_str)
                    ),
                };
                let hardware_id = match &info.serial_number {
                    Some(serial) => format!("USB VID:PID={} SER={}", id, serial),
                    None => format!("USB VID:PID={}", id),
                };
                usb_ports.push(SerialPortInfo {
                    device_path: p.port_name,
                    description,
                    hardware_id,
                });
            }
            // Without a USB id there is nothing to match against
            _ => debug!("ignoring non-USB port {}", p.port_name),
        }
    }
    usb_ports
}

// =============================================================================
// Unit Tests
// =============================================================================
