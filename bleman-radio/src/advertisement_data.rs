use std::collections::HashMap;

use btuuid::BluetoothUuid;

/// Data included in a Bluetooth advertisement or scan reponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementData {
    /// The (possibly shortened) local name of the device (CSS §A.1.2)
    pub local_name: Option<String>,
    /// Manufacturer specific data (CSS §A.1.4)
    pub manufacturer_data: Option<ManufacturerData>,
    /// Service associated data (CSS §A.1.11)
    pub service_data: HashMap<BluetoothUuid, Vec<u8>>,
    /// Advertised GATT service UUIDs (CSS §A.1.1)
    pub service_uuids: Vec<BluetoothUuid>,
    pub overflow_service_uuids: Vec<BluetoothUuid>,
    /// Transmitted power level (CSS §A.1.5)
    pub tx_power_level: Option<i16>,
    /// Set to true for connectable advertising packets
    pub is_connectable: bool,
    /// Solicited GATT service UUIDs (CSS §A.1.10)
    pub solicited_service_uuids: Vec<BluetoothUuid>,
}

/// Manufacturer specific data included in Bluetooth advertisements. See the Bluetooth Core Specification Supplement
/// §A.1.4 for details.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ManufacturerData {
    /// Company identifier (defined [here](https://www.bluetooth.com/specifications/assigned-numbers/company-identifiers/))
    pub company_id: u16,
    /// Manufacturer specific data
    pub data: Vec<u8>,
}

const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_INCOMPLETE_UUID32: u8 = 0x04;
const AD_COMPLETE_UUID32: u8 = 0x05;
const AD_INCOMPLETE_UUID128: u8 = 0x06;
const AD_COMPLETE_UUID128: u8 = 0x07;
const AD_SHORTENED_LOCAL_NAME: u8 = 0x08;
const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_TX_POWER_LEVEL: u8 = 0x0a;
const AD_SOLICITED_UUID16: u8 = 0x14;
const AD_SOLICITED_UUID128: u8 = 0x15;
const AD_SERVICE_DATA_UUID16: u8 = 0x16;
const AD_SOLICITED_UUID32: u8 = 0x1f;
const AD_SERVICE_DATA_UUID32: u8 = 0x20;
const AD_SERVICE_DATA_UUID128: u8 = 0x21;
const AD_MANUFACTURER_DATA: u8 = 0xff;

impl AdvertisementData {
    /// Decodes the AD structures of a raw advertising or scan response payload (Core Specification Vol 3,
    /// Part C, §11).
    ///
    /// Decoding stops at the first zero-length or truncated structure. Unrecognized AD types are
    /// skipped. `is_connectable` is a property of the advertising PDU, not of its payload, and is
    /// left `false`.
    pub fn parse(data: &[u8]) -> Self {
        let mut adv = AdvertisementData::default();

        let mut rest = data;
        while let [len, tail @ ..] = rest {
            let len = *len as usize;
            if len == 0 || len > tail.len() {
                break;
            }
            let (structure, next) = tail.split_at(len);
            rest = next;

            let (ad_type, value) = (structure[0], &structure[1..]);
            match ad_type {
                AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                    adv.service_uuids.extend(uuids(value, 2))
                }
                AD_INCOMPLETE_UUID32 | AD_COMPLETE_UUID32 => {
                    adv.service_uuids.extend(uuids(value, 4))
                }
                AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                    adv.service_uuids.extend(uuids(value, 16))
                }
                AD_SOLICITED_UUID16 => adv.solicited_service_uuids.extend(uuids(value, 2)),
                AD_SOLICITED_UUID32 => adv.solicited_service_uuids.extend(uuids(value, 4)),
                AD_SOLICITED_UUID128 => adv.solicited_service_uuids.extend(uuids(value, 16)),
                AD_COMPLETE_LOCAL_NAME => {
                    adv.local_name = Some(String::from_utf8_lossy(value).into_owned())
                }
                AD_SHORTENED_LOCAL_NAME if adv.local_name.is_none() => {
                    adv.local_name = Some(String::from_utf8_lossy(value).into_owned())
                }
                AD_TX_POWER_LEVEL => {
                    if let [level] = value {
                        adv.tx_power_level = Some(i16::from(*level as i8));
                    }
                }
                AD_SERVICE_DATA_UUID16 => insert_service_data(&mut adv, value, 2),
                AD_SERVICE_DATA_UUID32 => insert_service_data(&mut adv, value, 4),
                AD_SERVICE_DATA_UUID128 => insert_service_data(&mut adv, value, 16),
                AD_MANUFACTURER_DATA if value.len() >= 2 => {
                    adv.manufacturer_data = Some(ManufacturerData {
                        company_id: u16::from_le_bytes([value[0], value[1]]),
                        data: value[2..].to_vec(),
                    });
                }
                _ => {}
            }
        }

        adv
    }

    /// Whether this advertisement names any of `services`, either in its service lists or as a
    /// service data key.
    pub fn advertises_any(&self, services: &[BluetoothUuid]) -> bool {
        services.iter().any(|service| {
            self.service_uuids.contains(service)
                || self.overflow_service_uuids.contains(service)
                || self.service_data.contains_key(service)
        })
    }
}

/// UUIDs packed back to back, each `len` bytes long and little-endian on the air.
fn uuids(value: &[u8], len: usize) -> impl Iterator<Item = BluetoothUuid> + '_ {
    value
        .chunks_exact(len)
        .filter_map(|c| BluetoothUuid::from_le_slice(c).ok())
}

fn insert_service_data(adv: &mut AdvertisementData, value: &[u8], uuid_len: usize) {
    if value.len() < uuid_len {
        return;
    }
    let (uuid, data) = value.split_at(uuid_len);
    if let Ok(uuid) = BluetoothUuid::from_le_slice(uuid) {
        adv.service_data.insert(uuid, data.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_structures() {
        let raw = [
            0x02, 0x01, 0x06, // flags
            0x05, 0x03, 0x0d, 0x18, 0x0f, 0x18, // heart rate, battery
            0x06, 0x09, b'H', b'R', b'M', b'-', b'1', // complete local name
            0x02, 0x0a, 0xf4, // tx power -12 dBm
            0x05, 0xff, 0x4c, 0x00, 0xaa, 0xbb, // manufacturer data
            0x04, 0x16, 0x0f, 0x18, 0x64, // battery service data
        ];

        let adv = AdvertisementData::parse(&raw);
        assert_eq!(
            adv.service_uuids,
            vec![BluetoothUuid::from_u16(0x180d), BluetoothUuid::from_u16(0x180f)]
        );
        assert_eq!(adv.local_name.as_deref(), Some("HRM-1"));
        assert_eq!(adv.tx_power_level, Some(-12));
        assert_eq!(
            adv.manufacturer_data,
            Some(ManufacturerData {
                company_id: 0x004c,
                data: vec![0xaa, 0xbb],
            })
        );
        assert_eq!(
            adv.service_data.get(&BluetoothUuid::from_u16(0x180f)),
            Some(&vec![0x64])
        );
        assert!(adv.advertises_any(&[BluetoothUuid::from_u16(0x180d)]));
        assert!(!adv.advertises_any(&[BluetoothUuid::from_u16(0x1812)]));
    }

    #[test]
    fn parses_wide_service_uuids() {
        let custom: u128 = 0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e;
        let mut raw = vec![0x05, 0x05, 0x78, 0x56, 0x34, 0x12];
        raw.extend([0x11, 0x07]);
        raw.extend(custom.to_le_bytes());
        raw.extend([0x07, 0x20, 0x78, 0x56, 0x34, 0x12, 0x01, 0x02]);

        let adv = AdvertisementData::parse(&raw);
        assert_eq!(
            adv.service_uuids,
            vec![
                BluetoothUuid::from_u32(0x1234_5678),
                BluetoothUuid::from_u128(custom),
            ]
        );
        assert_eq!(
            adv.service_data.get(&BluetoothUuid::from_u32(0x1234_5678)),
            Some(&vec![0x01, 0x02])
        );
    }

    #[test]
    fn complete_name_wins_over_shortened() {
        let raw = [0x03, 0x09, b'A', b'B', 0x02, 0x08, b'A'];
        let adv = AdvertisementData::parse(&raw);
        assert_eq!(adv.local_name.as_deref(), Some("AB"));
    }

    #[test]
    fn stops_at_truncated_structure() {
        let raw = [0x03, 0x03, 0x0d, 0x18, 0x09, 0x09, b'x'];
        let adv = AdvertisementData::parse(&raw);
        assert_eq!(adv.service_uuids, vec![BluetoothUuid::from_u16(0x180d)]);
        assert_eq!(adv.local_name, None);
    }
}
