//! The durable, append-only record log.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──init──► Ready ──unrecoverable flash failure──► Disabled
//! ```
//!
//! `Disabled` keeps the device running without persistence: appends succeed
//! without touching flash and reads return nothing.
//!
//! ## Write ordering
//!
//! A record is written and verified before the persisted count is advanced.
//! Power loss between the two leaves the record invisible, never half
//! visible.

use alloc::{boxed::Box, vec::Vec};

use embedded_hal::delay::DelayNs;
use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};
use log::{debug, error, info, trace, warn};

use super::{
    codec::{self, RECORD_MAGIC, RECORD_SIZE, RecordStatus},
    error::StoreError,
    flash::FlashDevice,
    layout::{RECORDS_PER_SECTOR, StorageLayout},
    safe_flash::SafeFlash,
    ERASED_BYTE, ERASED_WORD, PAGE_SIZE, SECTOR_SIZE, WORD_SIZE,
};
use crate::{
    config::{ChecksumPolicy, DebugLevel, StoreConfig},
    sensors::SensorData,
};

const SECTOR_BYTES: usize = SECTOR_SIZE as usize;

/// Readback tolerance for temperature and humidity
const FLOAT_TOLERANCE: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Ready,
    /// Memory-only: flash I/O is off, either administratively or after an
    /// unrecoverable failure
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// Flash is in use
    Ready,
    /// Running memory-only
    Degraded,
}

/// Repair performed while initialising
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Count word was erased and no records were found: fresh region
    FirstUse,
    /// Count word was erased but committed records were found and recounted
    CountRebuilt { count: u32 },
    /// Count word exceeded capacity; the region was reset
    CountOverCapacity { found: u32 },
    /// Count was non-zero but record 0 carried no valid magic; the region
    /// was reset
    PayloadMismatch { magic: u32 },
}

/// What `init` found and did. Initialisation never fails: a store that
/// cannot use its flash reports `Degraded` and carries on memory-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitReport {
    pub status: InitStatus,
    pub recovery: Option<Recovery>,
    pub count: u32,
}

/// Append-only sensor record store on one NOR flash region.
///
/// The caller serialises access; there is one store per flash region.
///
/// ## Usage
///
/// ```rust,ignore
/// let mut log = FlashLog::new(flash, delay, &StoreConfig::default());
/// log.init();
///
/// log.append(&reading)?;
/// let records = log.read_all();
/// ```
pub struct FlashLog<F, D>
where
    F: FlashDevice,
    D: DelayNs,
{
    io: SafeFlash<F, D>,
    /// Reusable read-modify-write buffer, one sector
    scratch: Box<[u8; SECTOR_BYTES]>,
    state: StoreState,
    /// Records committed to flash
    count: u32,
    checksum_policy: ChecksumPolicy,
}

impl<F, D> FlashLog<F, D>
where
    F: FlashDevice,
    D: DelayNs,
{
    /// Create a store over `flash`. Nothing is read or written until
    /// [`init`](Self::init).
    pub fn new(flash: F, delay: D, config: &StoreConfig) -> Self {
        let layout = StorageLayout::new(config.flash_offset, config.sector_count);
        let mut io = SafeFlash::new(flash, delay, layout, config.debug_level);
        io.set_enabled(config.flash_enabled);

        Self {
            io,
            scratch: Box::new([ERASED_BYTE; SECTOR_BYTES]),
            state: if config.flash_enabled {
                StoreState::Uninitialized
            } else {
                StoreState::Disabled
            },
            count: 0,
            checksum_policy: config.checksum_policy,
        }
    }

    /// Read and validate the persisted count, repairing the region when it
    /// is inconsistent.
    pub fn init(&mut self) -> InitReport {
        let layout = *self.io.layout();
        info!("FLASH: initializing flash storage at {:#010x}", layout.base());
        info!(
            "FLASH: debug level = {:?}, flash enabled = {}",
            self.io.debug_level(),
            self.io.is_enabled()
        );

        if !self.io.is_enabled() {
            info!("FLASH: [DISABLED] operating in memory-only mode (no flash writes)");
            self.state = StoreState::Disabled;
            self.count = 0;
            return InitReport {
                status: InitStatus::Degraded,
                recovery: None,
                count: 0,
            };
        }

        if !self.io.geometry_matches() {
            error!(
                "FLASH: device erases {} bytes and writes {} bytes at a time, store needs {} and {}",
                F::ERASE_SIZE,
                F::WRITE_SIZE,
                SECTOR_SIZE,
                WORD_SIZE
            );
            return self.degrade(None);
        }

        if !self.io.fits_device() {
            error!(
                "FLASH: store ends at {:#010x}, beyond the {} byte device",
                layout.end(),
                self.io.device().capacity()
            );
            return self.degrade(None);
        }

        let stored = match self.io.read_word(layout.count_address()) {
            Ok(word) => word,
            Err(_) => return self.degrade(None),
        };
        info!("FLASH: read stored count: {} ({:#010x})", stored, stored);

        let recovery = if stored == ERASED_WORD {
            match self.recover_erased_count() {
                Ok(recovery) => Some(recovery),
                Err(recovery) => return self.degrade(Some(recovery)),
            }
        } else if stored > layout.capacity() {
            error!(
                "FLASH: invalid count ({}) exceeds maximum ({}), resetting storage",
                stored,
                layout.capacity()
            );
            let recovery = Recovery::CountOverCapacity { found: stored };
            if self.reset().is_err() {
                return self.degrade(Some(recovery));
            }
            Some(recovery)
        } else {
            info!("FLASH: found valid count: {}", stored);
            self.count = stored;
            match self.check_first_record() {
                Ok(recovery) => recovery,
                Err(recovery) => return self.degrade(Some(recovery)),
            }
        };

        self.state = StoreState::Ready;
        info!(
            "FLASH: initialization complete, storage can hold {} records, {} currently stored",
            layout.capacity(),
            self.count
        );

        if self.count > 0 && self.io.debug_level() >= DebugLevel::Verbose {
            if let Ok(bytes) = self.io.read(layout.data_start(), codec::ERASED_CHECK_LEN) {
                trace!("FLASH: first record data preview: {:02x?}", bytes);
            }
        }

        InitReport {
            status: InitStatus::Ready,
            recovery,
            count: self.count,
        }
    }

    /// Erased count word: either a fresh region, or the count sector was
    /// lost mid-update after records had been committed.
    fn recover_erased_count(&mut self) -> Result<Recovery, Recovery> {
        let committed = self.scan_committed();
        let recovery = if committed == 0 {
            info!("FLASH: first-time initialization (all 0xFF)");
            Recovery::FirstUse
        } else {
            warn!(
                "FLASH: count is erased but {} committed records were found, rebuilding count",
                committed
            );
            Recovery::CountRebuilt { count: committed }
        };

        self.count = 0;
        match self.write_count(committed) {
            Ok(()) => {
                self.count = committed;
                Ok(recovery)
            }
            Err(_) => {
                error!("FLASH: failed to initialize count");
                Err(recovery)
            }
        }
    }

    /// Records from slot 0 that decode intact, up to the first one that does
    /// not
    fn scan_committed(&self) -> u32 {
        let layout = self.io.layout();
        (0..layout.capacity())
            .take_while(|&index| {
                self.io
                    .read(layout.record_address(index), RECORD_SIZE)
                    .map(|bytes| {
                        codec::deserialize(bytes, ChecksumPolicy::Strict).1 == RecordStatus::Intact
                    })
                    .unwrap_or(false)
            })
            .count() as u32
    }

    /// A non-zero count must be backed by a record in slot 0.
    fn check_first_record(&mut self) -> Result<Option<Recovery>, Recovery> {
        if self.count == 0 {
            return Ok(None);
        }

        let address = self.io.layout().data_start();
        let magic = self.io.read_word(address).unwrap_or(ERASED_WORD);
        debug!("FLASH: testing first record at {:#010x}, magic={:#010x}", address, magic);

        if magic == RECORD_MAGIC {
            info!("FLASH: found valid data signature");
            return Ok(None);
        }

        if magic == ERASED_WORD {
            warn!("FLASH: count > 0 but data area contains 0xFF values");
        } else {
            warn!("FLASH: count > 0 but data has invalid magic number: {:#010x}", magic);
        }
        warn!("FLASH: detected inconsistency between count and data, resetting storage");

        let recovery = Recovery::PayloadMismatch { magic };
        match self.reset() {
            Ok(()) => Ok(Some(recovery)),
            Err(_) => Err(recovery),
        }
    }

    fn degrade(&mut self, recovery: Option<Recovery>) -> InitReport {
        error!("FLASH: continuing in memory-only mode");
        self.io.set_enabled(false);
        self.state = StoreState::Disabled;
        self.count = 0;
        InitReport {
            status: InitStatus::Degraded,
            recovery,
            count: 0,
        }
    }

    /// Durably append one record.
    pub fn append(&mut self, data: &SensorData) -> Result<(), StoreError> {
        match self.state {
            StoreState::Uninitialized => return Err(StoreError::NotInitialized),
            StoreState::Disabled => {
                if self.io.debug_level() >= DebugLevel::Normal {
                    debug!("FLASH: [DISABLED] skipping sensor data save (memory-only mode)");
                }
                return Ok(());
            }
            StoreState::Ready => {}
        }

        let capacity = self.capacity();
        if self.count >= capacity {
            error!("FLASH: no space left for new records (max: {})", capacity);
            return Err(StoreError::Full { capacity });
        }

        let index = self.count;
        let address = self.io.layout().record_address(index);
        let sector = StorageLayout::sector_of(address);
        if self.io.debug_level() >= DebugLevel::Normal {
            debug!(
                "FLASH: writing record {} at {:#010x} (page {:#010x}, sector {:#010x})",
                index,
                address,
                StorageLayout::page_of(address),
                sector
            );
        }

        let offset = (address - sector) as usize;
        self.rewrite_sector(sector, |scratch| {
            codec::serialize_into(data, &mut scratch[offset..offset + RECORD_SIZE]);
        })?;
        self.verify_record(index, data)?;

        self.count = index + 1;
        if self.io.debug_level() >= DebugLevel::Normal {
            debug!("FLASH: successfully saved record {}", index);
        }

        if let Err(e) = self.write_count(self.count) {
            self.count = self.rolled_back_count(e, index);
            return Err(e);
        }
        Ok(())
    }

    /// Append several records with one count update.
    ///
    /// The destination slots past the count are erased, so the records are
    /// programmed in place without erasing their sectors. If any slot is not
    /// blank (payload left over from an interrupted append) the batch falls
    /// back to single appends.
    pub fn append_batch(&mut self, records: &[SensorData]) -> Result<(), StoreError> {
        match self.state {
            StoreState::Uninitialized => return Err(StoreError::NotInitialized),
            StoreState::Disabled => {
                if self.io.debug_level() >= DebugLevel::Normal {
                    debug!(
                        "FLASH: [DISABLED] skipping batch of {} records (memory-only mode)",
                        records.len()
                    );
                }
                return Ok(());
            }
            StoreState::Ready => {}
        }

        if records.is_empty() {
            return Ok(());
        }

        let capacity = self.capacity();
        let fits = u32::try_from(records.len())
            .ok()
            .filter(|&n| n <= capacity - self.count);
        let Some(len) = fits else {
            error!(
                "FLASH: batch of {} records does not fit ({} of {} used)",
                records.len(),
                self.count,
                capacity
            );
            return Err(StoreError::Full { capacity });
        };

        let first = self.count;
        let layout = *self.io.layout();
        let all_blank = (first..first + len).all(|index| {
            self.io
                .read(layout.record_address(index), RECORD_SIZE)
                .map(codec::is_blank)
                .unwrap_or(false)
        });
        if !all_blank {
            warn!("FLASH: batch destination is not blank, falling back to single appends");
            return records.iter().try_for_each(|data| self.append(data));
        }

        let mut index = first;
        let mut remaining = records;
        while !remaining.is_empty() {
            let sector = StorageLayout::sector_of(layout.record_address(index));
            let room = (RECORDS_PER_SECTOR - index % RECORDS_PER_SECTOR) as usize;
            let (chunk, rest) = remaining.split_at(room.min(remaining.len()));

            self.scratch
                .copy_from_slice(self.io.read(sector, SECTOR_BYTES)?);
            for (slot, data) in (index..).zip(chunk) {
                let offset = (layout.record_address(slot) - sector) as usize;
                codec::serialize_into(data, &mut self.scratch[offset..offset + RECORD_SIZE]);
            }

            // Only the touched pages; bytes already on flash are rewritten
            // with their own value, which leaves them unchanged.
            let last = index + chunk.len() as u32 - 1;
            let start = StorageLayout::page_of(layout.record_address(index));
            let end = StorageLayout::page_of(layout.record_address(last)) + PAGE_SIZE;
            self.io.program(
                start,
                &self.scratch[(start - sector) as usize..(end - sector) as usize],
            )?;
            for (slot, data) in (index..).zip(chunk) {
                self.verify_record(slot, data)?;
            }

            index += chunk.len() as u32;
            remaining = rest;
        }

        self.count = first + len;
        if let Err(e) = self.write_count(self.count) {
            self.count = self.rolled_back_count(e, first);
            return Err(e);
        }

        info!("FLASH: saved batch of {} records, {} stored", len, self.count);
        Ok(())
    }

    /// In-memory count after a failed count update: whatever provably is on
    /// flash.
    fn rolled_back_count(&self, error: StoreError, previous: u32) -> u32 {
        match error {
            StoreError::CountVerify { found, .. } if found <= self.capacity() => found,
            _ => previous,
        }
    }

    /// Read-modify-write of one sector through the scratch buffer: copy it,
    /// let `patch` change part of it, erase, program it back.
    fn rewrite_sector(
        &mut self,
        sector: u32,
        patch: impl FnOnce(&mut [u8]),
    ) -> Result<(), StoreError> {
        self.scratch
            .copy_from_slice(self.io.read(sector, SECTOR_BYTES)?);
        patch(&mut self.scratch[..]);

        if let Err(e) = self.io.erase(sector, SECTOR_SIZE) {
            error!("FLASH: failed to erase sector {:#010x}", sector);
            return Err(e);
        }
        if let Err(e) = self.io.program(sector, &self.scratch[..]) {
            error!("FLASH: failed to program sector {:#010x}", sector);
            return Err(e);
        }
        Ok(())
    }

    /// Re-read a just-written record and compare the key fields.
    fn verify_record(&self, index: u32, expected: &SensorData) -> Result<(), StoreError> {
        let address = self.io.layout().record_address(index);
        let bytes = self.io.read(address, RECORD_SIZE)?;

        if self.io.debug_level() >= DebugLevel::Verbose {
            trace!(
                "FLASH: raw bytes at {:#010x}: {:02x?}",
                address,
                &bytes[..codec::ERASED_CHECK_LEN]
            );
        }

        let magic = codec::read_magic(bytes).unwrap_or(0);
        if magic != RECORD_MAGIC {
            error!(
                "FLASH: magic number verification failed, expected {:#010x}, got {:#010x}",
                RECORD_MAGIC, magic
            );
            return Err(StoreError::RecordVerify { index });
        }

        let (readback, _) = codec::deserialize(bytes, ChecksumPolicy::Strict);
        let mut failed = false;
        if differs(readback.temperature, expected.temperature) {
            error!(
                "FLASH: temperature verification failed: {:.2} != {:.2}",
                readback.temperature, expected.temperature
            );
            failed = true;
        }
        if differs(readback.humidity, expected.humidity) {
            error!(
                "FLASH: humidity verification failed: {:.2} != {:.2}",
                readback.humidity, expected.humidity
            );
            failed = true;
        }
        if readback.co2 != expected.co2 {
            error!("FLASH: co2 verification failed: {} != {}", readback.co2, expected.co2);
            failed = true;
        }
        if readback.timestamp != expected.timestamp {
            error!(
                "FLASH: timestamp verification failed: {} != {}",
                readback.timestamp, expected.timestamp
            );
            failed = true;
        }

        if failed {
            error!("FLASH: data verification failed, record {} may be corrupted", index);
            return Err(StoreError::RecordVerify { index });
        }
        Ok(())
    }

    /// Persist `value` as the count, rewriting the count sector.
    fn write_count(&mut self, value: u32) -> Result<(), StoreError> {
        let address = self.io.layout().count_address();
        self.rewrite_sector(address, |scratch| {
            scratch[..4].copy_from_slice(&value.to_le_bytes());
        })?;

        let found = self.io.read_word(address)?;
        if self.io.is_enabled() && found != value {
            error!("FLASH: count verification failed: {} != {}", found, value);
            return Err(StoreError::CountVerify {
                expected: value,
                found,
            });
        }
        Ok(())
    }

    /// Read one record. Anything unreadable comes back as
    /// [`SensorData::error`].
    pub fn read(&self, index: u32) -> SensorData {
        if self.state != StoreState::Ready {
            debug!("FLASH: read of record {} while {:?}", index, self.state);
            return SensorData::error();
        }
        if index >= self.count {
            error!(
                "FLASH: attempted to read index {} but only {} records stored",
                index, self.count
            );
            return SensorData::error();
        }

        let address = self.io.layout().record_address(index);
        let Ok(bytes) = self.io.read(address, RECORD_SIZE) else {
            return SensorData::error();
        };
        if self.io.debug_level() >= DebugLevel::Verbose {
            trace!(
                "FLASH: raw bytes for record {} at {:#010x}: {:02x?}",
                index,
                address,
                &bytes[..codec::ERASED_CHECK_LEN]
            );
        }

        if codec::is_erased(bytes) {
            error!("FLASH: record {} appears to be erased (all 0xFF)", index);
            return SensorData::error();
        }

        let magic = codec::read_magic(bytes).unwrap_or(0);
        if magic != RECORD_MAGIC {
            error!("FLASH: invalid magic number in record {}: {:#010x}", index, magic);
            return SensorData::error();
        }

        let (data, status) = codec::deserialize(bytes, self.checksum_policy);
        if !status.is_readable() {
            error!("FLASH: record {} is corrupt ({:?})", index, status);
            return SensorData::error();
        }

        if !codec::is_plausible(&data) {
            warn!("FLASH: record {} contains suspicious values: {}", index, data);
        } else if self.io.debug_level() >= DebugLevel::Normal {
            debug!("FLASH: loaded record {}: {}", index, data);
        }
        data
    }

    /// Every readable record, in insertion order. Unreadable records are
    /// skipped.
    pub fn read_all(&self) -> Vec<SensorData> {
        if self.state != StoreState::Ready || self.count == 0 {
            info!("FLASH: no records found to load or flash disabled");
            return Vec::new();
        }

        info!("FLASH: loading {} records from flash", self.count);
        let mut records = Vec::with_capacity(self.count as usize);
        for index in 0..self.count {
            let data = self.read(index);
            if data.is_valid() {
                records.push(data);
            } else {
                warn!("FLASH: skipping invalid record at index {}", index);
            }
        }

        info!(
            "FLASH: loaded {} valid records (out of {} total)",
            records.len(),
            self.count
        );
        records
    }

    /// Erase every sector of the store and write a zero count.
    pub fn erase(&mut self) -> Result<(), StoreError> {
        if self.state == StoreState::Disabled {
            info!("FLASH: [DISABLED] skipping storage erase");
            self.count = 0;
            return Ok(());
        }

        let layout = *self.io.layout();
        info!(
            "FLASH: erasing {} sectors starting at {:#010x}",
            layout.sector_count(),
            layout.base()
        );
        self.io.erase(layout.base(), layout.region_len())?;
        self.count = 0;

        self.io
            .program(layout.count_address(), &0u32.to_le_bytes())?;
        let found = self.io.read_word(layout.count_address())?;
        if found != 0 {
            error!("FLASH: failed to reset count after erase");
            return Err(StoreError::CountVerify { expected: 0, found });
        }

        self.state = StoreState::Ready;
        info!("FLASH: storage erased, ready for new records");
        Ok(())
    }

    /// Erase every sector and rewrite the whole count sector with a zero
    /// count.
    pub fn reset(&mut self) -> Result<(), StoreError> {
        if self.state == StoreState::Disabled {
            info!("FLASH: [DISABLED] skipping storage reset");
            self.count = 0;
            return Ok(());
        }

        let layout = *self.io.layout();
        info!("FLASH: completely erasing flash storage area");
        if let Err(e) = self.io.erase(layout.base(), layout.region_len()) {
            error!("FLASH: failed to erase storage during reset");
            return Err(e);
        }
        self.count = 0;

        self.scratch.fill(ERASED_BYTE);
        self.scratch[..4].copy_from_slice(&0u32.to_le_bytes());
        if let Err(e) = self.io.program(layout.count_address(), &self.scratch[..]) {
            error!("FLASH: failed to write count (0) during reset");
            return Err(e);
        }

        self.state = StoreState::Ready;
        info!("FLASH: storage reset complete, all data and count have been erased");
        Ok(())
    }

    /// Log the count word and the leading bytes of up to `max_records`
    /// records.
    pub fn dump_raw(&self, max_records: u32) {
        let layout = self.io.layout();
        match self.io.read_word(layout.count_address()) {
            Ok(count) => info!(
                "FLASH: count value at {:#010x}: {}",
                layout.count_address(),
                count
            ),
            Err(_) => return,
        }

        for index in 0..self.count.min(max_records) {
            let address = layout.record_address(index);
            if let Ok(bytes) = self.io.read(address, codec::ERASED_CHECK_LEN) {
                info!("FLASH: record {} at {:#010x}: {:02x?}", index, address, bytes);
            }
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn capacity(&self) -> u32 {
        self.io.layout().capacity()
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.capacity()
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    pub fn layout(&self) -> &StorageLayout {
        self.io.layout()
    }

    /// Turning flash off switches to memory-only mode; turning it back on
    /// requires another [`init`](Self::init) to re-read the count.
    pub fn set_flash_enabled(&mut self, enabled: bool) {
        self.io.set_enabled(enabled);
        if enabled {
            if self.state == StoreState::Disabled {
                self.state = StoreState::Uninitialized;
            }
        } else {
            self.state = StoreState::Disabled;
            self.count = 0;
        }
    }

    pub fn is_flash_enabled(&self) -> bool {
        self.io.is_enabled()
    }

    pub fn set_debug_level(&mut self, level: DebugLevel) {
        self.io.set_debug_level(level);
    }

    pub fn flash(&self) -> &F {
        self.io.device()
    }

    pub fn flash_mut(&mut self) -> &mut F {
        self.io.device_mut()
    }

    pub fn delay(&self) -> &D {
        self.io.delay()
    }

    /// Give the flash and delay back, e.g. to simulate a reboot
    pub fn release(self) -> (F, D) {
        self.io.release()
    }
}

fn differs(a: f32, b: f32) -> bool {
    let delta = a - b;
    delta > FLOAT_TOLERANCE || delta < -FLOAT_TOLERANCE
}
