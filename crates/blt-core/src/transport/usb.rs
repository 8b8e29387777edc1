//! nusb-based USB transport.
//!
//! The target enumerates as a vendor-specific device with one bulk IN and one
//! bulk OUT endpoint on interface 0. Packets are framed like on the serial
//! link, `[len][packet]`, and each frame fits one 64 byte bulk transfer.

use std::io::{Read, Write};
use std::time::Duration;

use nusb::transfer::{Bulk, In, Out};
use nusb::{Interface, MaybeFuture, list_devices};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::traits::{Transport, TransportError, TransportKind};

/// Bulk transfer size used by the bootloader.
pub const USB_TRANSFER_SIZE: usize = 64;
pub const USB_MAX_PACKET: usize = USB_TRANSFER_SIZE - 1;

/// USB device selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbSettings {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: 0x1D50,
            product_id: 0x60AC,
        }
    }
}

struct UsbLink {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
}

/// nusb-based USB transport.
pub struct UsbTransport {
    settings: UsbSettings,
    link: Option<UsbLink>,
}

impl UsbTransport {
    pub fn new(settings: UsbSettings) -> Self {
        Self {
            settings,
            link: None,
        }
    }

    pub fn settings(&self) -> &UsbSettings {
        &self.settings
    }

    fn connect(&self) -> Result<UsbLink, TransportError> {
        let vid = self.settings.vendor_id;
        let pid = self.settings.product_id;
        let channel = format!("USB {vid:04X}:{pid:04X}");
        let open_failed = |message: String| TransportError::OpenFailed {
            channel: channel.clone(),
            message,
        };

        let device_info = list_devices()
            .wait()
            .map_err(|e| open_failed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        let device = device_info
            .open()
            .wait()
            .map_err(|e| open_failed(e.to_string()))?;
        let interface = device
            .claim_interface(0)
            .wait()
            .map_err(|e| open_failed(format!("claim interface 0: {e}")))?;

        // Find BULK endpoints
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != 0 {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                            if ep.direction() == nusb::transfer::Direction::In {
                                in_endpoint = ep.address();
                            } else {
                                out_endpoint = ep.address();
                            }
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 || out_endpoint == 0 {
            return Err(open_failed("bulk IN/OUT endpoints not found".into()));
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            out_ep = %format!("0x{:02X}", out_endpoint),
            "USB device opened"
        );

        Ok(UsbLink {
            interface,
            in_endpoint,
            out_endpoint,
        })
    }
}

impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::XcpV10Usb
    }

    #[instrument(level = "info", skip(self), fields(vid = format!("{:04X}", self.settings.vendor_id), pid = format!("{:04X}", self.settings.product_id)))]
    fn open(&mut self) -> Result<(), TransportError> {
        if self.link.is_none() {
            self.link = Some(self.connect()?);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.link.take().is_some() {
            info!("USB device released");
        }
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    #[instrument(skip(self, request), fields(len = request.len()))]
    fn transact(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::NotOpen)?;
        if request.is_empty() || request.len() > USB_MAX_PACKET {
            return Err(TransportError::FrameTooLong {
                len: request.len(),
                max: USB_MAX_PACKET,
            });
        }

        let mut frame = Vec::with_capacity(USB_TRANSFER_SIZE);
        frame.push(request.len() as u8);
        frame.extend_from_slice(request);

        let out = link
            .interface
            .endpoint::<Bulk, Out>(link.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        let mut writer = out.writer(USB_TRANSFER_SIZE);
        writer
            .write_all(&frame)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let inp = link
            .interface
            .endpoint::<Bulk, In>(link.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        let mut reader = inp.reader(USB_TRANSFER_SIZE).with_read_timeout(timeout);
        let mut buf = [0u8; USB_TRANSFER_SIZE];
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(TransportError::timeout(timeout));
            }
            Err(e) => return Err(TransportError::ReadFailed(e.to_string())),
        };

        let packet = unframe(&buf[..n])?;
        debug!(bytes_read = n, "USB exchange complete");
        Ok(packet)
    }

    fn max_packet_len(&self) -> usize {
        USB_MAX_PACKET
    }
}

/// Strip the length byte from one received transfer.
fn unframe(transfer: &[u8]) -> Result<Vec<u8>, TransportError> {
    let Some((&len, rest)) = transfer.split_first() else {
        return Err(TransportError::Malformed("empty USB transfer".into()));
    };
    let len = len as usize;
    if len > rest.len() {
        return Err(TransportError::Malformed(format!(
            "short USB frame: {} bytes for a {len} byte packet",
            rest.len()
        )));
    }
    Ok(rest[..len].to_vec())
}
