//! Transport layer module.

pub mod can;
pub mod loopback;
pub mod mock;
pub mod serial;
pub mod traits;
pub mod usb;

use serde::{Deserialize, Serialize};

pub use can::{CanDriver, CanMessage, CanSettings, CanTransport};
pub use loopback::LoopbackTransport;
pub use mock::{MockReply, MockTransport};
pub use serial::{SerialSettings, SerialTransport};
pub use traits::{Transport, TransportError, TransportKind};
pub use usb::{UsbSettings, UsbTransport};

/// Per-channel settings, one variant per [`TransportKind`] that takes any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportSettings {
    Serial(SerialSettings),
    Can(CanSettings),
    Usb(UsbSettings),
}

impl TransportSettings {
    /// Whether these settings belong to `kind`.
    pub fn matches(&self, kind: TransportKind) -> bool {
        matches!(
            (self, kind),
            (TransportSettings::Serial(_), TransportKind::XcpV10Rs232)
                | (TransportSettings::Can(_), TransportKind::XcpV10Can)
                | (TransportSettings::Usb(_), TransportKind::XcpV10Usb)
        )
    }
}

/// Why a transport could not be built from a kind and its settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuildError {
    /// Settings given for a different transport kind.
    SettingsMismatch,
    /// The kind cannot run without settings.
    SettingsRequired,
}

/// Construct the transport for `kind`, using defaults where settings are
/// optional.
pub(crate) fn build(
    kind: TransportKind,
    settings: Option<TransportSettings>,
) -> Result<Box<dyn Transport>, BuildError> {
    if let Some(s) = &settings
        && !s.matches(kind)
    {
        return Err(BuildError::SettingsMismatch);
    }

    let transport: Box<dyn Transport> = match (kind, settings) {
        (TransportKind::XcpV10Rs232, Some(TransportSettings::Serial(s))) if !s.port.is_empty() => {
            Box::new(SerialTransport::new(s))
        }
        (TransportKind::XcpV10Rs232, _) => return Err(BuildError::SettingsRequired),
        (TransportKind::XcpV10Can, Some(TransportSettings::Can(s))) => {
            Box::new(CanTransport::new(s))
        }
        (TransportKind::XcpV10Can, _) => Box::new(CanTransport::new(CanSettings::default())),
        (TransportKind::XcpV10Usb, Some(TransportSettings::Usb(s))) => {
            Box::new(UsbTransport::new(s))
        }
        (TransportKind::XcpV10Usb, _) => Box::new(UsbTransport::new(UsbSettings::default())),
        (TransportKind::Loopback, _) => Box::new(LoopbackTransport::new()),
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_defaults() {
        let can = build(TransportKind::XcpV10Can, None).unwrap();
        assert_eq!(can.kind(), TransportKind::XcpV10Can);
        assert_eq!(can.max_packet_len(), 8);

        let usb = build(TransportKind::XcpV10Usb, None).unwrap();
        assert_eq!(usb.kind(), TransportKind::XcpV10Usb);
    }

    #[test]
    fn test_serial_needs_port() {
        assert_eq!(
            build(TransportKind::XcpV10Rs232, None).err(),
            Some(BuildError::SettingsRequired)
        );
        assert_eq!(
            build(
                TransportKind::XcpV10Rs232,
                Some(TransportSettings::Serial(SerialSettings::default()))
            )
            .err(),
            Some(BuildError::SettingsRequired)
        );
        let serial = build(
            TransportKind::XcpV10Rs232,
            Some(TransportSettings::Serial(SerialSettings {
                port: "/dev/ttyUSB0".into(),
                baudrate: 115200,
            })),
        )
        .unwrap();
        assert!(!serial.is_open());
    }

    #[test]
    fn test_settings_mismatch() {
        assert_eq!(
            build(
                TransportKind::XcpV10Can,
                Some(TransportSettings::Usb(UsbSettings::default()))
            )
            .err(),
            Some(BuildError::SettingsMismatch)
        );
        assert_eq!(
            build(
                TransportKind::Loopback,
                Some(TransportSettings::Can(CanSettings::default()))
            )
            .err(),
            Some(BuildError::SettingsMismatch)
        );
    }
}
