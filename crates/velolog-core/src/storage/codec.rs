//! Fixed binary layout of a sensor record on flash.
//!
//! Binary format (little-endian, no implicit padding):
//! - magic: 4 bytes (u32, 0xABCD1234)
//! - temperature, humidity, pressure, gas_resistance: 16 bytes (4 × f32)
//! - pm2_5, pm5, pm10, padding: 8 bytes (4 × u16)
//! - co2, latitude, longitude, timestamp: 16 bytes (4 × u32)
//! - flags: 1 byte (bit 0 = fake GPS), reserved: 3 bytes
//! - checksum: 4 bytes (u32)

use log::{error, warn};

use super::ERASED_BYTE;
use crate::{config::ChecksumPolicy, sensors::SensorData};

/// Marks a slot that holds a written record
pub const RECORD_MAGIC: u32 = 0xABCD_1234;

/// Bytes occupied by one serialized record
pub const RECORD_SIZE: usize = 52;

/// Leading bytes inspected to tell an erased slot from a written one
pub const ERASED_CHECK_LEN: usize = 16;

const FLAG_FAKE_GPS: u8 = 0x01;

const MAGIC_OFFSET: usize = 0;
const CHECKSUM_OFFSET: usize = 48;

const TEMPERATURE_RANGE: core::ops::RangeInclusive<f32> = -50.0..=100.0;
const HUMIDITY_RANGE: core::ops::RangeInclusive<f32> = 0.0..=100.0;
const TIMESTAMP_RANGE: core::ops::RangeInclusive<u32> = 1_600_000_000..=2_000_000_000;

/// Outcome of decoding one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Magic and checksum match
    Intact,
    /// Checksum mismatch, accepted because the values look plausible
    Recovered,
    /// Slot was never written since the last erase
    Erased,
    /// Slot holds something other than a record
    BadMagic,
    /// Magic matches but the checksum does not
    BadChecksum,
}

impl RecordStatus {
    /// Whether the decoded record carries real data
    pub const fn is_readable(self) -> bool {
        matches!(self, Self::Intact | Self::Recovered)
    }
}

/// Record exactly as laid out on flash.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SerializedRecord {
    pub magic: u32,
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
    pub gas_resistance: f32,
    pub pm2_5: u16,
    pub pm5: u16,
    pub pm10: u16,
    pub padding: u16,
    pub co2: u32,
    pub latitude: u32,
    pub longitude: u32,
    pub timestamp: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
    pub checksum: u32,
}

impl SerializedRecord {
    /// Build the on-flash form of `data` with magic and checksum filled in.
    pub fn encode(data: &SensorData) -> Self {
        let mut record = Self {
            magic: RECORD_MAGIC,
            temperature: data.temperature,
            humidity: data.humidity,
            pressure: data.pressure,
            gas_resistance: data.gas_resistance,
            pm2_5: data.pm2_5,
            pm5: data.pm5,
            pm10: data.pm10,
            padding: 0,
            co2: data.co2,
            latitude: data.latitude as u32,
            longitude: data.longitude as u32,
            timestamp: data.timestamp,
            flags: if data.is_fake_gps { FLAG_FAKE_GPS } else { 0 },
            reserved: [0; 3],
            checksum: 0,
        };
        record.checksum = record.compute_checksum();
        record
    }

    /// Seeded additive checksum over the key numeric fields.
    ///
    /// Only the low six decimal digits of latitude/longitude and the
    /// truncated ×100 temperature/humidity take part. Pressure, gas
    /// resistance and pm5 are not covered.
    pub fn compute_checksum(&self) -> u32 {
        let temperature = (self.temperature * 100.0) as i32;
        let humidity = (self.humidity * 100.0) as i32;

        RECORD_MAGIC
            .wrapping_add(self.co2)
            .wrapping_add(u32::from(self.pm2_5))
            .wrapping_add(u32::from(self.pm10))
            .wrapping_add(self.timestamp)
            .wrapping_add(self.latitude % 1_000_000)
            .wrapping_add(self.longitude % 1_000_000)
            .wrapping_add(temperature as u32)
            .wrapping_add(humidity as u32)
            .wrapping_add(u32::from(self.flags))
    }

    pub fn to_sensor_data(&self) -> SensorData {
        SensorData {
            timestamp: self.timestamp,
            latitude: self.latitude as i32,
            longitude: self.longitude as i32,
            temperature: self.temperature,
            humidity: self.humidity,
            pressure: self.pressure,
            gas_resistance: self.gas_resistance,
            pm2_5: self.pm2_5,
            pm5: self.pm5,
            pm10: self.pm10,
            co2: self.co2,
            is_fake_gps: self.flags & FLAG_FAKE_GPS != 0,
        }
    }

    /// Converts the record to its on-flash bytes.
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        let mut offset = 0;

        let mut put = |field: &[u8]| {
            bytes[offset..offset + field.len()].copy_from_slice(field);
            offset += field.len();
        };

        put(&self.magic.to_le_bytes());
        put(&self.temperature.to_le_bytes());
        put(&self.humidity.to_le_bytes());
        put(&self.pressure.to_le_bytes());
        put(&self.gas_resistance.to_le_bytes());
        put(&self.pm2_5.to_le_bytes());
        put(&self.pm5.to_le_bytes());
        put(&self.pm10.to_le_bytes());
        put(&self.padding.to_le_bytes());
        put(&self.co2.to_le_bytes());
        put(&self.latitude.to_le_bytes());
        put(&self.longitude.to_le_bytes());
        put(&self.timestamp.to_le_bytes());
        put(&[self.flags]);
        put(&self.reserved);
        put(&self.checksum.to_le_bytes());

        bytes
    }

    /// Creates a record from its on-flash bytes.
    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at =
            |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

        Self {
            magic: u32_at(MAGIC_OFFSET),
            temperature: f32::from_bits(u32_at(4)),
            humidity: f32::from_bits(u32_at(8)),
            pressure: f32::from_bits(u32_at(12)),
            gas_resistance: f32::from_bits(u32_at(16)),
            pm2_5: u16_at(20),
            pm5: u16_at(22),
            pm10: u16_at(24),
            padding: u16_at(26),
            co2: u32_at(28),
            latitude: u32_at(32),
            longitude: u32_at(36),
            timestamp: u32_at(40),
            flags: bytes[44],
            reserved: [bytes[45], bytes[46], bytes[47]],
            checksum: u32_at(CHECKSUM_OFFSET),
        }
    }
}

/// Serialize `data` into the first [`RECORD_SIZE`] bytes of `out`.
pub fn serialize_into(data: &SensorData, out: &mut [u8]) {
    out[..RECORD_SIZE].copy_from_slice(&SerializedRecord::encode(data).to_bytes());
}

pub fn serialize(data: &SensorData) -> [u8; RECORD_SIZE] {
    SerializedRecord::encode(data).to_bytes()
}

/// Decode a slot. Anything that is not readable decodes to
/// [`SensorData::error`], never to a partially filled record.
pub fn deserialize(bytes: &[u8], policy: ChecksumPolicy) -> (SensorData, RecordStatus) {
    let Some(bytes) = bytes.first_chunk::<RECORD_SIZE>() else {
        error!("FLASH: record buffer too short: {} bytes", bytes.len());
        return (SensorData::error(), RecordStatus::BadMagic);
    };

    if is_erased(bytes) {
        return (SensorData::error(), RecordStatus::Erased);
    }

    let record = SerializedRecord::from_bytes(bytes);
    if record.magic != RECORD_MAGIC {
        error!("FLASH: invalid magic number in record: {:#010x}", record.magic);
        return (SensorData::error(), RecordStatus::BadMagic);
    }

    let expected = SerializedRecord {
        checksum: 0,
        ..record
    }
    .compute_checksum();
    if expected == record.checksum {
        return (record.to_sensor_data(), RecordStatus::Intact);
    }

    error!(
        "FLASH: checksum mismatch: stored {:#010x}, computed {:#010x}",
        record.checksum, expected
    );

    let data = record.to_sensor_data();
    match policy {
        ChecksumPolicy::Plausible if is_plausible(&data) => {
            warn!("FLASH: checksum mismatch but values are plausible, recovering record");
            (data, RecordStatus::Recovered)
        }
        _ => (SensorData::error(), RecordStatus::BadChecksum),
    }
}

/// Whether the leading bytes are all in the erased state
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .take(ERASED_CHECK_LEN)
        .all(|&byte| byte == ERASED_BYTE)
}

/// Whether the whole slot is still erased, so it can be programmed in place
pub fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().take(RECORD_SIZE).all(|&byte| byte == ERASED_BYTE)
}

/// Leading magic word of a slot
pub fn read_magic(bytes: &[u8]) -> Option<u32> {
    bytes.first_chunk::<4>().map(|word| u32::from_le_bytes(*word))
}

/// Temperature, humidity and timestamp all within physically sensible ranges
pub fn is_plausible(data: &SensorData) -> bool {
    TEMPERATURE_RANGE.contains(&data.temperature)
        && HUMIDITY_RANGE.contains(&data.humidity)
        && TIMESTAMP_RANGE.contains(&data.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SensorData {
        SensorData {
            timestamp: 1_700_000_000,
            latitude: 515_074_000,
            longitude: -1_278_000,
            temperature: 21.37,
            humidity: 48.5,
            pressure: 1013.25,
            gas_resistance: 52_000.0,
            pm2_5: 12,
            pm5: 17,
            pm10: 25,
            co2: 612,
            is_fake_gps: true,
        }
    }

    #[test]
    fn test_layout_offsets() {
        let bytes = serialize(&sample());
        assert_eq!(bytes.len(), RECORD_SIZE);
        assert_eq!(read_magic(&bytes), Some(RECORD_MAGIC));
        assert_eq!(&bytes[20..22], &12u16.to_le_bytes());
        assert_eq!(&bytes[26..28], &[0, 0], "padding must be zero");
        assert_eq!(&bytes[28..32], &612u32.to_le_bytes());
        assert_eq!(&bytes[40..44], &1_700_000_000u32.to_le_bytes());
        assert_eq!(bytes[44], FLAG_FAKE_GPS);
        assert_eq!(&bytes[45..48], &[0, 0, 0], "reserved must be zero");
    }

    #[test]
    fn test_round_trip_is_exact() {
        let data = sample();
        let (decoded, status) = deserialize(&serialize(&data), ChecksumPolicy::Strict);
        assert_eq!(status, RecordStatus::Intact);
        assert_eq!(decoded, data);
        assert_eq!(decoded.temperature.to_bits(), data.temperature.to_bits());
    }

    #[test]
    fn test_checksum_matches_reference_arithmetic() {
        let data = sample();
        let record = SerializedRecord::encode(&data);
        let expected = 0xABCD_1234u32
            .wrapping_add(612)
            .wrapping_add(12)
            .wrapping_add(25)
            .wrapping_add(1_700_000_000)
            .wrapping_add(515_074_000 % 1_000_000)
            .wrapping_add((-1_278_000i32 as u32) % 1_000_000)
            .wrapping_add((21.37f32 * 100.0) as i32 as u32)
            .wrapping_add(4850)
            .wrapping_add(1);
        assert_eq!(record.checksum, expected);
    }

    #[test]
    fn test_erased_slot_is_not_corrupt() {
        let bytes = [ERASED_BYTE; RECORD_SIZE];
        let (decoded, status) = deserialize(&bytes, ChecksumPolicy::Strict);
        assert_eq!(status, RecordStatus::Erased);
        assert!(!decoded.is_valid());
    }

    #[test]
    fn test_bad_magic_decodes_to_error_record() {
        let mut bytes = serialize(&sample());
        bytes[0..4].copy_from_slice(&0u32.to_le_bytes());
        let (decoded, status) = deserialize(&bytes, ChecksumPolicy::Plausible);
        assert_eq!(status, RecordStatus::BadMagic);
        assert_eq!(decoded, SensorData::error());
    }

    #[test]
    fn test_strict_policy_rejects_checksum_mismatch() {
        let mut bytes = serialize(&sample());
        bytes[28] ^= 0x01; // co2
        let (decoded, status) = deserialize(&bytes, ChecksumPolicy::Strict);
        assert_eq!(status, RecordStatus::BadChecksum);
        assert_eq!(decoded, SensorData::error());
    }

    #[test]
    fn test_plausible_policy_recovers_sensible_values() {
        let mut bytes = serialize(&sample());
        bytes[28] ^= 0x01;
        let (decoded, status) = deserialize(&bytes, ChecksumPolicy::Plausible);
        assert_eq!(status, RecordStatus::Recovered);
        assert_eq!(decoded.co2, 612 ^ 0x01);
        assert_eq!(decoded.timestamp, 1_700_000_000);
    }

    #[test]
    fn test_plausible_policy_still_rejects_nonsense() {
        let mut data = sample();
        data.timestamp = 1_000;
        let mut bytes = serialize(&data);
        bytes[CHECKSUM_OFFSET] ^= 0xFF;
        let (decoded, status) = deserialize(&bytes, ChecksumPolicy::Plausible);
        assert_eq!(status, RecordStatus::BadChecksum);
        assert!(!decoded.is_valid());
    }

    #[test]
    fn test_plausibility_bounds_are_inclusive() {
        let mut data = sample();
        data.temperature = -50.0;
        data.humidity = 100.0;
        data.timestamp = 2_000_000_000;
        assert!(is_plausible(&data));
        data.temperature = 100.5;
        assert!(!is_plausible(&data));
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let (decoded, status) = deserialize(&[0u8; 10], ChecksumPolicy::Strict);
        assert_eq!(status, RecordStatus::BadMagic);
        assert!(!decoded.is_valid());
    }
}
