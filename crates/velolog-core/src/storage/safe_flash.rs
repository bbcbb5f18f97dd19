//! Guarded access to the physical erase/program primitives.
//!
//! Every operation is checked for alignment and bounds before the hardware
//! is touched, runs with interrupts disabled, waits for the flash to settle
//! and is read back through the XIP window before it is reported as done.
//!
//! The read-back samples: erase checks the first, middle and last word,
//! program checks the leading bytes of every page it wrote. Records get a
//! field-level check on top of this in the log itself.

use embedded_hal::delay::DelayNs;
use embedded_storage::nor_flash::{NorFlash, NorFlashError, ReadNorFlash};
use log::{debug, error, trace};

use super::{
    error::StoreError, flash::FlashDevice, layout::StorageLayout, ERASED_WORD, PAGE_SIZE,
    SECTOR_SIZE, SETTLE_DELAY_MS, WORD_SIZE,
};
use crate::config::DebugLevel;

/// Bytes shown in verbose byte previews
const PREVIEW_LEN: usize = 16;

/// Leading bytes of each programmed page that are read back
const VERIFY_LEN: usize = 16;

pub struct SafeFlash<F, D>
where
    F: FlashDevice,
    D: DelayNs,
{
    flash: F,
    delay: D,
    layout: StorageLayout,
    /// When false, erase/program succeed without touching the hardware
    enabled: bool,
    debug_level: DebugLevel,
}

impl<F, D> SafeFlash<F, D>
where
    F: FlashDevice,
    D: DelayNs,
{
    pub fn new(flash: F, delay: D, layout: StorageLayout, debug_level: DebugLevel) -> Self {
        Self {
            flash,
            delay,
            layout,
            enabled: true,
            debug_level,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn debug_level(&self) -> DebugLevel {
        self.debug_level
    }

    pub fn set_debug_level(&mut self, level: DebugLevel) {
        self.debug_level = level;
    }

    pub fn device(&self) -> &F {
        &self.flash
    }

    pub fn device_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn delay(&self) -> &D {
        &self.delay
    }

    pub fn release(self) -> (F, D) {
        (self.flash, self.delay)
    }

    /// Whether the whole store fits on the device
    pub fn fits_device(&self) -> bool {
        self.layout.end() as usize <= self.flash.capacity()
    }

    /// Whether the device erases exactly one sector at a time and accepts
    /// word-aligned writes
    pub fn geometry_matches(&self) -> bool {
        F::ERASE_SIZE == SECTOR_SIZE as usize && WORD_SIZE as usize % F::WRITE_SIZE == 0
    }

    /// Direct view of flash contents, no copy
    pub fn read(&self, address: u32, len: usize) -> Result<&[u8], StoreError> {
        self.flash.mapped(address, len).ok_or_else(|| {
            error!("FLASH: read of {} bytes at {:#010x} is outside the device", len, address);
            StoreError::Device { address }
        })
    }

    pub fn read_word(&self, address: u32) -> Result<u32, StoreError> {
        let bytes = self.read(address, WORD_SIZE as usize)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Erase whole sectors and check that they read back erased.
    pub fn erase(&mut self, address: u32, len: u32) -> Result<(), StoreError> {
        if !self.enabled {
            if self.debug_level >= DebugLevel::Normal {
                debug!("FLASH: [DISABLED] skipping erase at {:#010x} ({} bytes)", address, len);
            }
            return Ok(());
        }

        if address % SECTOR_SIZE != 0 {
            error!("FLASH: erase address {:#010x} is not sector-aligned", address);
            return Err(StoreError::Misaligned {
                address,
                alignment: SECTOR_SIZE,
            });
        }
        if len == 0 || len % SECTOR_SIZE != 0 {
            error!("FLASH: erase length {} is not a whole number of sectors", len);
            return Err(StoreError::Misaligned {
                address: address.wrapping_add(len),
                alignment: SECTOR_SIZE,
            });
        }
        if !self.layout.contains(address, len) {
            error!("FLASH: erase of {:#010x}+{} leaves the store", address, len);
            return Err(StoreError::OutOfRegion { address });
        }

        if self.debug_level >= DebugLevel::Normal {
            debug!("FLASH: erasing {:#010x} ({} bytes)", address, len);
        }
        if self.debug_level >= DebugLevel::Verbose {
            trace!("FLASH: disabling interrupts for erase");
        }
        let flash = &mut self.flash;
        let result = critical_section::with(|_| flash.erase(address, address + len));
        if self.debug_level >= DebugLevel::Verbose {
            trace!("FLASH: interrupts restored after erase");
        }
        if let Err(e) = result {
            error!("FLASH: erase at {:#010x} failed: {:?} ({:?})", address, e, e.kind());
            return Err(StoreError::Device { address });
        }

        self.delay.delay_ms(SETTLE_DELAY_MS);

        let middle = address + (len / 2) / WORD_SIZE * WORD_SIZE;
        let end = address + len - WORD_SIZE;
        for sample in [address, middle, end] {
            let word = self.read_word(sample)?;
            if word != ERASED_WORD {
                error!(
                    "FLASH: erase verification failed at {:#010x}: {:#010x} (expected {:#010x})",
                    sample, word, ERASED_WORD
                );
                return Err(StoreError::EraseVerify { address });
            }
        }

        if self.debug_level >= DebugLevel::Normal {
            debug!("FLASH: erase at {:#010x} succeeded", address);
        }
        Ok(())
    }

    /// Program `data` at a word-aligned address and check it reads back.
    ///
    /// The buffer is issued in page-bounded bursts, so it may span any
    /// number of pages. The first bytes of each burst are verified.
    pub fn program(&mut self, address: u32, data: &[u8]) -> Result<(), StoreError> {
        if !self.enabled {
            if self.debug_level >= DebugLevel::Normal {
                debug!(
                    "FLASH: [DISABLED] skipping program at {:#010x} ({} bytes)",
                    address,
                    data.len()
                );
            }
            return Ok(());
        }

        if address % WORD_SIZE != 0 {
            error!("FLASH: program address {:#010x} is not word-aligned", address);
            return Err(StoreError::Misaligned {
                address,
                alignment: WORD_SIZE,
            });
        }
        let Ok(len) = u32::try_from(data.len()) else {
            return Err(StoreError::OutOfRegion { address });
        };
        if !self.layout.contains(address, len) {
            error!("FLASH: program of {:#010x}+{} leaves the store", address, len);
            return Err(StoreError::OutOfRegion { address });
        }

        if self.debug_level >= DebugLevel::Normal {
            debug!("FLASH: programming {:#010x} ({} bytes)", address, len);
        }
        if self.debug_level >= DebugLevel::Verbose {
            trace!(
                "FLASH: first bytes to program: {:02x?}",
                &data[..data.len().min(PREVIEW_LEN)]
            );
            trace!("FLASH: disabling interrupts for program");
        }

        let mut offset = 0usize;
        while offset < data.len() {
            let burst_address = address + offset as u32;
            let room = (PAGE_SIZE - burst_address % PAGE_SIZE) as usize;
            let burst = &data[offset..data.len().min(offset + room)];

            let flash = &mut self.flash;
            let result = critical_section::with(|_| flash.write(burst_address, burst));
            if let Err(e) = result {
                error!(
                    "FLASH: program at {:#010x} failed: {:?} ({:?})",
                    burst_address,
                    e,
                    e.kind()
                );
                return Err(StoreError::Device {
                    address: burst_address,
                });
            }
            offset += burst.len();
        }

        if self.debug_level >= DebugLevel::Verbose {
            trace!("FLASH: interrupts restored after program");
        }

        self.delay.delay_ms(SETTLE_DELAY_MS);

        let mut offset = 0usize;
        while offset < data.len() {
            let burst_address = address + offset as u32;
            let room = (PAGE_SIZE - burst_address % PAGE_SIZE) as usize;
            let burst = offset..data.len().min(offset + room);
            let checked = burst.start..burst.end.min(burst.start + VERIFY_LEN);

            let written = self.read(burst_address, checked.len())?;
            let expected = &data[checked.clone()];
            if let Some(at) = written.iter().zip(expected).position(|(got, want)| got != want) {
                error!(
                    "FLASH: program verification failed at {:#010x}: expected {:#04x}, got {:#04x}",
                    burst_address + at as u32,
                    expected[at],
                    written[at]
                );
                return Err(StoreError::ProgramVerify {
                    address,
                    offset: (checked.start + at) as u32,
                });
            }
            offset = burst.end;
        }

        if self.debug_level >= DebugLevel::Normal {
            debug!("FLASH: program at {:#010x} succeeded", address);
        }
        Ok(())
    }
}
