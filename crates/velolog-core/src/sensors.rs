//! Sensor record handed between the sampling loop, the flash store and the
//! upload layer.

use core::fmt::Display;

use serde::{Deserialize, Serialize};

/// One combined reading of every sensor on the bike.
///
/// Latitude and longitude are fixed-point degrees × 10^7. A `timestamp` of
/// zero means the record is invalid (never captured, or a failed read from
/// flash) and it is dropped from every "load all" result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    /// Seconds since the Unix epoch, taken from GPS
    pub timestamp: u32,
    /// Degrees × 10^7
    pub latitude: i32,
    /// Degrees × 10^7
    pub longitude: i32,
    /// °C
    pub temperature: f32,
    /// %RH
    pub humidity: f32,
    /// hPa
    pub pressure: f32,
    /// Ohms
    pub gas_resistance: f32,
    /// µg/m³
    pub pm2_5: u16,
    /// µg/m³
    pub pm5: u16,
    /// µg/m³
    pub pm10: u16,
    /// ppm
    pub co2: u32,
    /// Set when the position came from the simulated-GPS test mode
    pub is_fake_gps: bool,
}

impl SensorData {
    /// The sentinel returned for any record that cannot be read back.
    ///
    /// Every field is zero, so `is_valid()` is false.
    pub const fn error() -> Self {
        Self {
            timestamp: 0,
            latitude: 0,
            longitude: 0,
            temperature: 0.0,
            humidity: 0.0,
            pressure: 0.0,
            gas_resistance: 0.0,
            pm2_5: 0,
            pm5: 0,
            pm10: 0,
            co2: 0,
            is_fake_gps: false,
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.timestamp != 0
    }
}

impl Display for SensorData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "[SensorData] timestamp: {}, temperature: {:.2}°C, humidity: {:.2}%, co2: {} ppm, pm2.5: {}, fake_gps: {}",
            self.timestamp, self.temperature, self.humidity, self.co2, self.pm2_5, self.is_fake_gps
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_record_is_invalid() {
        let error = SensorData::error();
        assert!(!error.is_valid());
        assert_eq!(error, SensorData::default());
    }

    #[test]
    fn test_timestamped_record_is_valid() {
        let data = SensorData {
            timestamp: 1_700_000_000,
            ..SensorData::default()
        };
        assert!(data.is_valid());
    }
}
