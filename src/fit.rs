//! Minimal FIT encoder for weigh-in uploads.
//!
//! Produces a single-record FIT container: file header, a `file_id`
//! message, a `weight_scale` message when any body-composition field is
//! set, an optional `blood_pressure` message, and the trailing CRC-16.
//! Only the fields Garmin needs for a weigh-in are emitted; this is not a
//! general FIT writer.

use chrono::{DateTime, Utc};

use crate::models::SourceMeasurement;

/// FIT timestamps count seconds since 1989-12-31T00:00:00Z, not the Unix
/// epoch. 631065600 is that instant in Unix seconds.
pub const FIT_EPOCH_OFFSET: i64 = 631_065_600;

const HEADER_SIZE: u8 = 14;
const PROTOCOL_VERSION: u8 = 0x20; // 2.0
const PROFILE_VERSION: u16 = 2132;

// Global message numbers
const MSG_FILE_ID: u16 = 0;
const MSG_WEIGHT_SCALE: u16 = 30;
const MSG_BLOOD_PRESSURE: u16 = 51;

// FIT base types
const BASE_ENUM: u8 = 0x00;
const BASE_UINT8: u8 = 0x02;
const BASE_UINT16: u8 = 0x84;
const BASE_UINT32: u8 = 0x86;
const BASE_UINT32Z: u8 = 0x8C;

const FILE_TYPE_WEIGHT: u8 = 9;
const MANUFACTURER_DEVELOPMENT: u16 = 255;

/// Convert a wall-clock instant to FIT epoch seconds.
pub fn fit_timestamp(date: DateTime<Utc>) -> u32 {
    (date.timestamp() - FIT_EPOCH_OFFSET) as u32
}

/// FIT CRC-16 (the CRC-16/ARC polynomial, nibble-table implementation
/// from the FIT SDK).
pub fn crc16(data: &[u8]) -> u16 {
    const TABLE: [u16; 16] = [
        0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
        0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
    ];

    let mut crc: u16 = 0;
    for &byte in data {
        // low nibble
        let tmp = TABLE[(crc & 0x0F) as usize];
        crc = (crc >> 4) & 0x0FFF;
        crc = crc ^ tmp ^ TABLE[(byte & 0x0F) as usize];
        // high nibble
        let tmp = TABLE[(crc & 0x0F) as usize];
        crc = (crc >> 4) & 0x0FFF;
        crc = crc ^ tmp ^ TABLE[((byte >> 4) & 0x0F) as usize];
    }
    crc
}

/// One field slot in a definition message: (field number, size, base type).
type FieldDef = (u8, u8, u8);

fn write_definition(out: &mut Vec<u8>, local: u8, global: u16, fields: &[FieldDef]) {
    out.push(0x40 | local);
    out.push(0x00); // reserved
    out.push(0x00); // little-endian
    out.extend_from_slice(&global.to_le_bytes());
    out.push(fields.len() as u8);
    for &(num, size, base) in fields {
        out.push(num);
        out.push(size);
        out.push(base);
    }
}

/// kg / percent fields carry two decimal places: value * 100 as u16.
fn scaled_u16(value: f64) -> [u8; 2] {
    ((value * 100.0).round() as u16).to_le_bytes()
}

/// Encode one measurement as a FIT weigh-in file.
///
/// Infallible for well-formed input; NaN or negative fields are caller
/// bugs, not runtime errors to recover from.
pub fn encode(m: &SourceMeasurement) -> Vec<u8> {
    let timestamp = fit_timestamp(m.date);
    let mut records = Vec::new();

    // file_id: identity record carrying the creation timestamp
    write_definition(
        &mut records,
        0,
        MSG_FILE_ID,
        &[
            (0, 1, BASE_ENUM),    // type
            (1, 2, BASE_UINT16),  // manufacturer
            (2, 2, BASE_UINT16),  // product
            (3, 4, BASE_UINT32Z), // serial_number
            (4, 4, BASE_UINT32),  // time_created
        ],
    );
    records.push(0x00);
    records.push(FILE_TYPE_WEIGHT);
    records.extend_from_slice(&MANUFACTURER_DEVELOPMENT.to_le_bytes());
    records.extend_from_slice(&0u16.to_le_bytes()); // product
    records.extend_from_slice(&1u32.to_le_bytes()); // serial_number
    records.extend_from_slice(&timestamp.to_le_bytes());

    if m.has_body_composition() {
        // Definition lists only the fields this measurement carries,
        // keeping the record free of invalid-value placeholders.
        let mut fields: Vec<FieldDef> = vec![(253, 4, BASE_UINT32)];
        if m.weight.is_some() {
            fields.push((0, 2, BASE_UINT16));
        }
        if m.fat_ratio.is_some() {
            fields.push((1, 2, BASE_UINT16));
        }
        if m.hydration.is_some() {
            fields.push((2, 2, BASE_UINT16));
        }
        if m.bone_mass.is_some() {
            fields.push((4, 2, BASE_UINT16));
        }
        if m.muscle_mass.is_some() {
            fields.push((5, 2, BASE_UINT16));
        }
        write_definition(&mut records, 1, MSG_WEIGHT_SCALE, &fields);

        records.push(0x01);
        records.extend_from_slice(&timestamp.to_le_bytes());
        for value in [
            m.weight,
            m.fat_ratio,
            m.hydration,
            m.bone_mass,
            m.muscle_mass,
        ]
        .into_iter()
        .flatten()
        {
            records.extend_from_slice(&scaled_u16(value));
        }
    }

    if m.has_blood_pressure() {
        let mut fields: Vec<FieldDef> = vec![
            (253, 4, BASE_UINT32),
            (0, 2, BASE_UINT16), // systolic_pressure
            (1, 2, BASE_UINT16), // diastolic_pressure
        ];
        if m.heart_pulse.is_some() {
            fields.push((6, 1, BASE_UINT8)); // heart_rate
        }
        write_definition(&mut records, 2, MSG_BLOOD_PRESSURE, &fields);

        records.push(0x02);
        records.extend_from_slice(&timestamp.to_le_bytes());
        // Pressures are integer mmHg on the wire
        records.extend_from_slice(&(m.systolic.unwrap_or_default().round() as u16).to_le_bytes());
        records.extend_from_slice(&(m.diastolic.unwrap_or_default().round() as u16).to_le_bytes());
        if let Some(pulse) = m.heart_pulse {
            records.push(pulse.round() as u8);
        }
    }

    let mut out = Vec::with_capacity(HEADER_SIZE as usize + records.len() + 2);
    out.push(HEADER_SIZE);
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&PROFILE_VERSION.to_le_bytes());
    out.extend_from_slice(&(records.len() as u32).to_le_bytes());
    out.extend_from_slice(b".FIT");
    let header_crc = crc16(&out[0..12]);
    out.extend_from_slice(&header_crc.to_le_bytes());

    out.extend_from_slice(&records);

    let file_crc = crc16(&out);
    out.extend_from_slice(&file_crc.to_le_bytes());

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(iso: &str) -> DateTime<Utc> {
        iso.parse().unwrap()
    }

    #[test]
    fn crc16_known_vectors() {
        // CRC-16/ARC check values
        assert_eq!(crc16(&[]), 0x0000);
        assert_eq!(crc16(b"123456789"), 0xBB3D);
        assert_eq!(crc16(&[0x01]), 0xC0C1);
    }

    #[test]
    fn fit_timestamp_uses_garmin_epoch() {
        let date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            fit_timestamp(date),
            (date.timestamp() - 631_065_600) as u32
        );
        assert_eq!(fit_timestamp(date), 1_073_001_600);

        // At the FIT epoch itself the timestamp is zero
        let epoch = Utc.with_ymd_and_hms(1989, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(fit_timestamp(epoch), 0);
    }

    #[test]
    fn encode_weight_only_golden() {
        let mut m = SourceMeasurement::empty(at("2024-01-01T00:00:00Z"));
        m.weight = Some(75.0);

        let bytes = encode(&m);

        // header: size, protocol, profile version, data size, ".FIT", crc
        assert_eq!(bytes[0], 14);
        assert_eq!(bytes[1], 0x20);
        assert_eq!(&bytes[2..4], &2132u16.to_le_bytes());
        assert_eq!(&bytes[4..8], &54u32.to_le_bytes());
        assert_eq!(&bytes[8..12], b".FIT");
        assert_eq!(&bytes[12..14], &crc16(&bytes[0..12]).to_le_bytes());

        // file_id definition: 5 fields
        assert_eq!(
            &bytes[14..35],
            &[
                0x40, 0x00, 0x00, 0x00, 0x00, 0x05, // header, global 0, 5 fields
                0x00, 0x01, 0x00, // type: enum
                0x01, 0x02, 0x84, // manufacturer: u16
                0x02, 0x02, 0x84, // product: u16
                0x03, 0x04, 0x8C, // serial_number: u32z
                0x04, 0x04, 0x86, // time_created: u32
            ]
        );
        // file_id data: weight file, dev manufacturer, fit-epoch timestamp
        assert_eq!(
            &bytes[35..49],
            &[
                0x00, 0x09, 0xFF, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x80, 0xB4, 0xF4,
                0x3F,
            ]
        );

        // weight_scale definition: timestamp + weight only
        assert_eq!(
            &bytes[49..61],
            &[
                0x41, 0x00, 0x00, 0x1E, 0x00, 0x02, // header, global 30, 2 fields
                0xFD, 0x04, 0x86, // timestamp: u32
                0x00, 0x02, 0x84, // weight: u16, scale 100
            ]
        );
        // weight_scale data: 75.00 kg -> 7500
        assert_eq!(&bytes[61..68], &[0x01, 0x80, 0xB4, 0xF4, 0x3F, 0x4C, 0x1D]);

        // trailing CRC over everything before it
        assert_eq!(bytes.len(), 70);
        assert_eq!(&bytes[68..70], &crc16(&bytes[0..68]).to_le_bytes());
    }

    #[test]
    fn encode_full_body_composition() {
        let mut m = SourceMeasurement::empty(at("2024-06-15T07:30:00Z"));
        m.weight = Some(80.25);
        m.fat_ratio = Some(18.5);
        m.hydration = Some(55.0);
        m.bone_mass = Some(3.2);
        m.muscle_mass = Some(60.1);

        let bytes = encode(&m);

        // weight_scale definition carries all six fields
        let def_start = 49;
        assert_eq!(bytes[def_start], 0x41);
        assert_eq!(&bytes[def_start + 3..def_start + 5], &30u16.to_le_bytes());
        assert_eq!(bytes[def_start + 5], 6);

        // data record: timestamp then the five scaled values in field order
        let data_start = def_start + 6 + 6 * 3;
        assert_eq!(bytes[data_start], 0x01);
        let values = &bytes[data_start + 5..data_start + 15];
        assert_eq!(&values[0..2], &8025u16.to_le_bytes());
        assert_eq!(&values[2..4], &1850u16.to_le_bytes());
        assert_eq!(&values[4..6], &5500u16.to_le_bytes());
        assert_eq!(&values[6..8], &320u16.to_le_bytes());
        assert_eq!(&values[8..10], &6010u16.to_le_bytes());
    }

    #[test]
    fn encode_blood_pressure_record() {
        let mut m = SourceMeasurement::empty(at("2024-03-10T08:00:00Z"));
        m.systolic = Some(121.4);
        m.diastolic = Some(79.6);
        m.heart_pulse = Some(58.0);

        let bytes = encode(&m);

        // No body composition fields set -> no weight_scale message; the
        // blood_pressure definition follows file_id directly.
        let def_start = 49;
        assert_eq!(bytes[def_start], 0x42);
        assert_eq!(&bytes[def_start + 3..def_start + 5], &51u16.to_le_bytes());
        assert_eq!(bytes[def_start + 5], 4);

        let data_start = def_start + 6 + 4 * 3;
        assert_eq!(bytes[data_start], 0x02);
        // Integer-rounded pressures, u8 heart rate
        assert_eq!(
            &bytes[data_start + 5..data_start + 9],
            &[121, 0, 80, 0]
        );
        assert_eq!(bytes[data_start + 9], 58);
    }

    #[test]
    fn encode_omits_blood_pressure_without_both_pressures() {
        let mut m = SourceMeasurement::empty(at("2024-03-10T08:00:00Z"));
        m.weight = Some(70.0);
        m.systolic = Some(120.0); // no diastolic

        let bytes = encode(&m);
        // file_id + weight_scale only: same length as the weight-only case
        assert_eq!(bytes.len(), 70);
    }
}
