//! Class of Device (CoD) decoding.
//!
//! BlueZ exposes the 24-bit Class of Device of BR/EDR devices as the `Class` property. Bits 2-7
//! hold the minor class, bits 8-12 the major class, bits 13-23 the major service classes.

use core::fmt;

bitflags::bitflags! {
    /// Major service classes advertised in the Class of Device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServiceClasses: u32 {
        const LIMITED_DISCOVERABLE = 1 << 13;
        const LE_AUDIO = 1 << 14;
        const POSITIONING = 1 << 16;
        const NETWORKING = 1 << 17;
        const RENDERING = 1 << 18;
        const CAPTURING = 1 << 19;
        const OBJECT_TRANSFER = 1 << 20;
        const AUDIO = 1 << 21;
        const TELEPHONY = 1 << 22;
        const INFORMATION = 1 << 23;
    }
}

/// A raw Class of Device value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceClass(pub u32);

impl DeviceClass {
    pub fn major(self) -> u8 {
        ((self.0 >> 8) & 0x1f) as u8
    }

    pub fn minor(self) -> u8 {
        ((self.0 >> 2) & 0x3f) as u8
    }

    pub fn service_classes(self) -> ServiceClasses {
        ServiceClasses::from_bits_truncate(self.0)
    }

    pub fn kind(self) -> DeviceKind {
        use DeviceKind::*;

        match (self.major(), self.minor()) {
            (0x01, 0x03) => Laptop,
            (0x01, 0x04) => Handheld,
            (0x01, 0x06) => WearableComputer,
            (0x01, _) => Computer,
            (0x02, 0x01) => CellularPhone,
            (0x02, 0x03) => Smartphone,
            (0x02, _) => Phone,
            (0x04, 0x01) => Headset,
            (0x04, 0x08) => Speaker,
            (0x04, 0x0c) => Headphones,
            (0x04, 0x10) => PortableAudio,
            (0x04, 0x14) => CarAudio,
            (0x04, _) => AudioDevice,
            (0x05, _) => Peripheral,
            (0x06, _) => Imaging,
            (0x07, _) => Wearable,
            (0x08, _) => Toy,
            (0x09, _) => Health,
            _ => Unknown,
        }
    }
}

/// Coarse device type derived from the [`DeviceClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceKind {
    Computer,
    Laptop,
    Handheld,
    WearableComputer,
    Phone,
    CellularPhone,
    Smartphone,
    AudioDevice,
    Headset,
    Speaker,
    Headphones,
    PortableAudio,
    CarAudio,
    Peripheral,
    Imaging,
    Wearable,
    Toy,
    Health,
    Unknown,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceKind::Computer => "Computer",
            DeviceKind::Laptop => "Laptop",
            DeviceKind::Handheld => "Handheld PC/PDA",
            DeviceKind::WearableComputer => "Wearable Computer",
            DeviceKind::Phone => "Phone",
            DeviceKind::CellularPhone => "Cellular Phone",
            DeviceKind::Smartphone => "Smartphone",
            DeviceKind::AudioDevice => "Audio Device",
            DeviceKind::Headset => "Headset",
            DeviceKind::Speaker => "Speaker",
            DeviceKind::Headphones => "Headphones",
            DeviceKind::PortableAudio => "Portable Audio",
            DeviceKind::CarAudio => "Car Audio",
            DeviceKind::Peripheral => "Peripheral",
            DeviceKind::Imaging => "Imaging Device",
            DeviceKind::Wearable => "Wearable",
            DeviceKind::Toy => "Toy",
            DeviceKind::Health => "Health Device",
            DeviceKind::Unknown => "Unknown Device",
        };
        f.write_str(s)
    }
}
