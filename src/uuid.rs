//! Bluetooth UUIDs and the service classes devices advertise.

use core::fmt;
use std::str::FromStr;

/// A 128-bit UUID identifying a Bluetooth service class or profile.
///
/// Assigned numbers published by the Bluetooth SIG are 16-bit aliases of UUIDs derived from
/// the Bluetooth base UUID; [`Uuid::from_u16`] and [`Uuid::as_u16`] convert between the two.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid([u8; 16]);

impl Uuid {
    const BASE: [u8; 16] = [
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34,
        0xfb,
    ];

    /// Creates a [`Uuid`] from a 16-bit alias.
    pub const fn from_u16(short: u16) -> Self {
        let [hi, lo] = short.to_be_bytes();
        let mut bytes = Self::BASE;
        bytes[2] = hi;
        bytes[3] = lo;
        Self(bytes)
    }

    /// Returns the 16-bit alias if this [`Uuid`] is derived from the Bluetooth base UUID.
    pub fn as_u16(&self) -> Option<u16> {
        if self.0[..2] == [0, 0] && self.0[4..] == Self::BASE[4..] {
            Some(u16::from_be_bytes([self.0[2], self.0[3]]))
        } else {
            None
        }
    }
}

impl FromStr for Uuid {
    type Err = ParseUuidError;

    /// Parses the hyphenated form, eg. `0000110b-0000-1000-8000-00805f9b34fb`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

        let mut out = [0; 16];
        let mut i = 0;
        let mut groups = 0;
        for (group, len) in s.split('-').zip(GROUPS) {
            if group.len() != len {
                return Err(ParseUuidError(ErrorKind::GroupLength));
            }
            for pair in group.as_bytes().chunks(2) {
                let hi = nibble(pair[0])?;
                let lo = nibble(pair[1])?;
                out[i] = (hi << 4) | lo;
                i += 1;
            }
            groups += 1;
        }

        if groups != GROUPS.len() || s.split('-').count() != GROUPS.len() {
            return Err(ParseUuidError(ErrorKind::GroupCount));
        }

        Ok(Self(out))
    }
}

fn nibble(digit: u8) -> Result<u8, ParseUuidError> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(ParseUuidError(ErrorKind::InvalidDigit)),
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The error type returned by the [`FromStr`] implementation of [`Uuid`].
#[derive(Debug)]
pub struct ParseUuidError(ErrorKind);

#[derive(Debug)]
enum ErrorKind {
    InvalidDigit,
    GroupLength,
    GroupCount,
}

impl fmt::Display for ParseUuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match &self.0 {
            ErrorKind::InvalidDigit => "invalid hex digit",
            ErrorKind::GroupLength => "hyphen-separated group has the wrong length",
            ErrorKind::GroupCount => "expected 5 hyphen-separated groups",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ParseUuidError {}

macro_rules! services {
    ($( $(#[$m:meta])* $name:ident = $alias:literal, $label:literal; )*) => {
        /// Service classes the settings UI knows how to describe.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum Service {
            $( $(#[$m])* $name, )*
        }

        impl Service {
            const ALL: &'static [Service] = &[$( Service::$name, )*];

            /// Returns the 16-bit assigned number of this service class.
            pub const fn alias(self) -> u16 {
                match self {
                    $( Service::$name => $alias, )*
                }
            }

            /// Returns a human-readable name.
            pub const fn label(self) -> &'static str {
                match self {
                    $( Service::$name => $label, )*
                }
            }
        }
    };
}

services! {
    SerialPort = 0x1101, "Serial Port";
    DialUpNetworking = 0x1103, "Dial-Up Networking";
    IrmcSync = 0x1104, "IrMC Sync";
    /// OBEX Object Push, required for sending files.
    ObjectPush = 0x1105, "Object Push";
    FileTransfer = 0x1106, "File Transfer";
    Headset = 0x1108, "Headset";
    AudioSource = 0x110a, "Audio Source";
    AudioSink = 0x110b, "Audio Sink";
    RemoteControlTarget = 0x110c, "A/V Remote Control Target";
    AdvancedAudioDistribution = 0x110d, "Advanced Audio Distribution";
    RemoteControl = 0x110e, "A/V Remote Control";
    HeadsetAudioGateway = 0x1112, "Headset Audio Gateway";
    NetworkAccessPoint = 0x1116, "Network Access Point";
    GroupNetwork = 0x1117, "Group Network";
    HandsFree = 0x111e, "Hands-Free";
    HandsFreeAudioGateway = 0x111f, "Hands-Free Audio Gateway";
    HumanInterfaceDevice = 0x1124, "Human Interface Device";
    PhoneBookAccess = 0x112f, "Phone Book Access";
    MessageNotification = 0x1132, "Message Notification";
    MessageAccess = 0x1134, "Message Access";
    PnpInformation = 0x1200, "PnP Information";
    GenericAccess = 0x1800, "Generic Access";
    GenericAttribute = 0x1801, "Generic Attribute";
    DeviceInformation = 0x180a, "Device Information";
    Battery = 0x180f, "Battery";
}

impl Service {
    pub const fn uuid(self) -> Uuid {
        Uuid::from_u16(self.alias())
    }

    /// Looks up the service class identified by `uuid`.
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        let alias = uuid.as_u16()?;
        Self::ALL.iter().copied().find(|s| s.alias() == alias)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
