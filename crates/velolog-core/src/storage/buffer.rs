use embedded_hal::delay::DelayNs;
use heapless::Vec;
use log::{info, warn};

use super::{error::StoreError, flash::FlashDevice, flash_log::FlashLog};
use crate::sensors::SensorData;

/// Readings collected in RAM between flash writes.
///
/// Flash writes are slow and wear the part, so readings are gathered here
/// and written with one count update per flush, e.g. right before the device
/// goes to sleep.
///
/// ## Usage
///
/// ```rust,ignore
/// let mut pending: ReadingBuffer<16> = ReadingBuffer::new();
///
/// if pending.is_full() {
///     pending.flush(&mut log)?;
/// }
/// if let Err(dropped) = pending.push(reading) {
///     warn!("dropping reading at {}", dropped.timestamp);
/// }
/// ```
#[derive(Debug, Default)]
pub struct ReadingBuffer<const N: usize> {
    readings: Vec<SensorData, N>,
}

impl<const N: usize> ReadingBuffer<N> {
    pub const fn new() -> Self {
        Self {
            readings: Vec::new(),
        }
    }

    /// Queue a reading. A full buffer hands it back.
    pub fn push(&mut self, reading: SensorData) -> Result<(), SensorData> {
        self.readings.push(reading)
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.readings.is_full()
    }

    pub fn readings(&self) -> &[SensorData] {
        &self.readings
    }

    /// Write every queued reading to `log`, returning how many were
    /// written.
    ///
    /// On error only the readings the log did not commit stay queued: a
    /// batch that fell back to single appends may have stored a prefix
    /// before failing, and retrying that prefix would duplicate it.
    pub fn flush<F, D>(&mut self, log: &mut FlashLog<F, D>) -> Result<u32, StoreError>
    where
        F: FlashDevice,
        D: DelayNs,
    {
        if self.readings.is_empty() {
            return Ok(0);
        }

        let before = log.count();
        if let Err(e) = log.append_batch(&self.readings) {
            let queued = self.readings.len();
            let committed = (log.count().saturating_sub(before) as usize).min(queued);
            self.readings.rotate_left(committed);
            self.readings.truncate(queued - committed);
            warn!(
                "FLASH: flush failed after {} of {} buffered readings, keeping the rest: {}",
                committed, queued, e
            );
            return Err(e);
        }

        let flushed = self.readings.len() as u32;
        self.readings.clear();
        info!("FLASH: flushed {} buffered readings", flushed);
        Ok(flushed)
    }
}
