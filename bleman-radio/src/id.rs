use std::fmt::{self, Display};
use std::str::FromStr;

use btuuid::BluetoothUuid;
use uuid::Uuid;

/// A stable identifier for a remote peripheral.
///
/// Stacks that expose the device address (BlueZ, Android, embedded controllers) use
/// [`PeripheralId::Address`]; stacks that hide it behind a per-host identifier (CoreBluetooth) use
/// [`PeripheralId::Uuid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeripheralId {
    /// A 48-bit device address, most significant byte first.
    Address([u8; 6]),
    Uuid(Uuid),
}

impl From<Uuid> for PeripheralId {
    fn from(uuid: Uuid) -> Self {
        PeripheralId::Uuid(uuid)
    }
}

impl From<[u8; 6]> for PeripheralId {
    fn from(address: [u8; 6]) -> Self {
        PeripheralId::Address(address)
    }
}

impl Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeripheralId::Address(a) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                a[0], a[1], a[2], a[3], a[4], a[5]
            ),
            PeripheralId::Uuid(uuid) => uuid.hyphenated().fmt(f),
        }
    }
}

/// Returned when a string is neither a colon-separated device address nor a UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePeripheralIdError(String);

impl Display for ParsePeripheralIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid peripheral identifier {:?}", self.0)
    }
}

impl std::error::Error for ParsePeripheralIdError {}

impl FromStr for PeripheralId {
    type Err = ParsePeripheralIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(uuid) = Uuid::parse_str(s) {
            return Ok(PeripheralId::Uuid(uuid));
        }

        let err = || ParsePeripheralIdError(s.to_owned());
        let mut address = [0u8; 6];
        let mut parts = s.split(':');
        for byte in address.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2 && p.bytes().all(|b| b.is_ascii_hexdigit()))
                .ok_or_else(err)?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| err())?;
        }
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(PeripheralId::Address(address))
    }
}

/// A characteristic, qualified by the service that contains it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    pub service: BluetoothUuid,
    pub characteristic: BluetoothUuid,
}

impl CharacteristicId {
    pub fn new(service: BluetoothUuid, characteristic: BluetoothUuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.service, self.characteristic)
    }
}

/// The stack's handle for an established link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionHandle(pub u16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_display() {
        let id: PeripheralId = "C0:FF:EE:00:12:AB".parse().unwrap();
        assert_eq!(id, PeripheralId::Address([0xc0, 0xff, 0xee, 0x00, 0x12, 0xab]));
        assert_eq!(id.to_string(), "C0:FF:EE:00:12:AB");
    }

    #[test]
    fn uuid_identifiers_parse() {
        let id: PeripheralId = "6f1b2e1c-8f0a-4a52-9a8e-5b0f3f5d2c11".parse().unwrap();
        assert!(matches!(id, PeripheralId::Uuid(_)));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!("C0:FF:EE:00:12".parse::<PeripheralId>().is_err());
        assert!("C0:FF:EE:00:12:AB:01".parse::<PeripheralId>().is_err());
        assert!("C0:FF:EE:00:12:ZZ".parse::<PeripheralId>().is_err());
        assert!("+F:FF:EE:00:12:AB".parse::<PeripheralId>().is_err());
        assert!("C0:FF:EE:00:12:-1".parse::<PeripheralId>().is_err());
    }
}
