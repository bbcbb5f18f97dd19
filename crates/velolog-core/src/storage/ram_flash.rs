//! NOR flash simulated in RAM, for host tests and the desktop simulator.
//!
//! Behaves like the real part where the store relies on it: erase works on
//! whole sectors and sets bytes to `0xFF`, write clears bits only, must be
//! word aligned and must not cross a page. On top of that it can inject the
//! faults a worn or brown-out-prone flash produces.

use alloc::vec::Vec;
use core::ops::Range;

use embedded_hal::delay::DelayNs;
use embedded_storage::nor_flash::{
    ErrorType, MultiwriteNorFlash, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use thiserror_no_std::Error;

use super::{flash::FlashDevice, ERASED_BYTE, PAGE_SIZE, SECTOR_SIZE, WORD_SIZE};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamFlashError {
    #[error("range outside the device")]
    OutOfBounds,
    #[error("misaligned operation")]
    Misaligned,
    #[error("program crosses a page boundary")]
    CrossesPage,
    #[error("injected device failure")]
    Injected,
}

impl NorFlashError for RamFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Self::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            Self::Misaligned => NorFlashErrorKind::NotAligned,
            Self::CrossesPage | Self::Injected => NorFlashErrorKind::Other,
        }
    }
}

/// Simulated flash chip.
#[derive(Debug, Clone)]
pub struct RamFlash {
    data: Vec<u8>,
    /// Operations touching this range report success but change nothing
    stuck: Option<Range<u32>>,
    /// Operations touching this range report a device error
    failing: Option<Range<u32>>,
    /// Program disturb: every write covering the address also clears these
    /// bits there, after the written bytes have landed
    disturb: Option<(u32, u8)>,
    /// Physical operations left before the power goes; afterwards every
    /// operation is lost
    power_budget: Option<u32>,
    erase_count: u32,
    program_count: u32,
}

impl RamFlash {
    /// A fully erased chip of `size` bytes (rounded up to whole sectors)
    pub fn new(size: u32) -> Self {
        let size = size.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
        Self::from_image(alloc::vec![ERASED_BYTE; size as usize])
    }

    /// A chip whose contents are `image`, e.g. a snapshot taken before a
    /// simulated reboot
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            data: image,
            stuck: None,
            failing: None,
            disturb: None,
            power_budget: None,
            erase_count: 0,
            program_count: 0,
        }
    }

    pub fn image(&self) -> &[u8] {
        &self.data
    }

    pub fn into_image(self) -> Vec<u8> {
        self.data
    }

    /// Overwrite bytes directly, ignoring NOR semantics (corruption scenarios)
    pub fn poke(&mut self, offset: u32, bytes: &[u8]) {
        let start = offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Make every erase/program touching `range` silently do nothing
    pub fn set_stuck(&mut self, range: Option<Range<u32>>) {
        self.stuck = range;
    }

    /// Make every erase/program touching `range` return an error
    pub fn set_failing(&mut self, range: Option<Range<u32>>) {
        self.failing = range;
    }

    /// Make every write covering `address` also clear the `mask` bits there
    pub fn set_disturb(&mut self, disturb: Option<(u32, u8)>) {
        self.disturb = disturb;
    }

    /// Lose power after `operations` more erase/program calls
    pub fn cut_power_after(&mut self, operations: u32) {
        self.power_budget = Some(operations);
    }

    pub fn restore_power(&mut self) {
        self.power_budget = None;
    }

    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }

    pub fn program_count(&self) -> u32 {
        self.program_count
    }

    fn bounds(&self, offset: u32, len: u32) -> Result<Range<usize>, RamFlashError> {
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .filter(|&end| end <= self.data.len())
            .ok_or(RamFlashError::OutOfBounds)?;
        Ok(start..end)
    }

    fn overlaps(range: &Option<Range<u32>>, offset: u32, len: u32) -> bool {
        range
            .as_ref()
            .is_some_and(|r| offset < r.end && r.start < offset.saturating_add(len))
    }

    /// Whether this operation should take effect
    fn powered(&mut self, offset: u32, len: u32) -> Result<bool, RamFlashError> {
        if Self::overlaps(&self.failing, offset, len) {
            return Err(RamFlashError::Injected);
        }

        match self.power_budget.as_mut() {
            Some(0) => return Ok(false),
            Some(budget) => *budget -= 1,
            None => {}
        }

        Ok(!Self::overlaps(&self.stuck, offset, len))
    }
}

impl ErrorType for RamFlash {
    type Error = RamFlashError;
}

impl ReadNorFlash for RamFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.bounds(offset, bytes.len() as u32)?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for RamFlash {
    const WRITE_SIZE: usize = WORD_SIZE as usize;
    const ERASE_SIZE: usize = SECTOR_SIZE as usize;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % SECTOR_SIZE != 0 || to % SECTOR_SIZE != 0 || to < from {
            return Err(RamFlashError::Misaligned);
        }
        let len = to - from;
        let range = self.bounds(from, len)?;
        if self.powered(from, len)? {
            self.data[range].fill(ERASED_BYTE);
            self.erase_count += 1;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset % WORD_SIZE != 0 {
            return Err(RamFlashError::Misaligned);
        }
        let len = bytes.len() as u32;
        if offset % PAGE_SIZE + len > PAGE_SIZE {
            return Err(RamFlashError::CrossesPage);
        }
        let range = self.bounds(offset, len)?;
        if self.powered(offset, len)? {
            for (cell, &byte) in self.data[range].iter_mut().zip(bytes) {
                *cell &= byte;
            }
            if let Some((address, mask)) = self.disturb {
                if (offset..offset + len).contains(&address) {
                    self.data[address as usize] &= !mask;
                }
            }
            self.program_count += 1;
        }
        Ok(())
    }
}

/// Bits only ever go from 1 to 0, so rewriting a byte with its current value
/// is harmless.
impl MultiwriteNorFlash for RamFlash {}

impl FlashDevice for RamFlash {
    fn mapped(&self, offset: u32, len: usize) -> Option<&[u8]> {
        let start = offset as usize;
        self.data.get(start..start.checked_add(len)?)
    }
}

/// Delay that only accounts for the time it would have waited.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimDelay {
    elapsed_ns: u64,
}

impl SimDelay {
    pub const fn new() -> Self {
        Self { elapsed_ns: 0 }
    }

    pub const fn elapsed_ms(&self) -> u64 {
        self.elapsed_ns / 1_000_000
    }
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns += u64::from(ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_chip_is_erased() {
        let flash = RamFlash::new(SECTOR_SIZE + 1);
        assert_eq!(flash.capacity(), 2 * SECTOR_SIZE as usize);
        assert!(flash.image().iter().all(|&b| b == ERASED_BYTE));
    }

    #[test]
    fn test_program_only_clears_bits() {
        let mut flash = RamFlash::new(SECTOR_SIZE);
        flash.write(0, &[0x0F, 0xF0, 0xAA, 0x55]).unwrap();
        flash.write(0, &[0xFF, 0x0F, 0xFF, 0xFF]).unwrap();
        assert_eq!(flash.mapped(0, 4).unwrap(), &[0x0F, 0x00, 0xAA, 0x55]);
    }

    #[test]
    fn test_erase_restores_sector() {
        let mut flash = RamFlash::new(2 * SECTOR_SIZE);
        flash.write(SECTOR_SIZE, &[0; 16]).unwrap();
        flash.erase(SECTOR_SIZE, 2 * SECTOR_SIZE).unwrap();
        assert!(flash.mapped(SECTOR_SIZE, 16).unwrap().iter().all(|&b| b == ERASED_BYTE));
        assert_eq!(flash.erase_count(), 1);
    }

    #[test]
    fn test_alignment_and_page_rules() {
        let mut flash = RamFlash::new(SECTOR_SIZE);
        assert_eq!(flash.erase(256, 256 + SECTOR_SIZE), Err(RamFlashError::Misaligned));
        assert_eq!(flash.write(2, &[0; 4]), Err(RamFlashError::Misaligned));
        assert_eq!(flash.write(252, &[0; 8]), Err(RamFlashError::CrossesPage));
        assert_eq!(flash.write(SECTOR_SIZE, &[0; 4]), Err(RamFlashError::OutOfBounds));
    }

    #[test]
    fn test_stuck_range_ignores_writes() {
        let mut flash = RamFlash::new(SECTOR_SIZE);
        flash.set_stuck(Some(0..16));
        flash.write(0, &[0; 4]).unwrap();
        assert_eq!(flash.mapped(0, 4).unwrap(), &[0xFF; 4]);
        flash.write(16, &[0; 4]).unwrap();
        assert_eq!(flash.mapped(16, 4).unwrap(), &[0; 4]);
    }

    #[test]
    fn test_failing_range_reports_errors() {
        let mut flash = RamFlash::new(SECTOR_SIZE);
        flash.set_failing(Some(0..SECTOR_SIZE));
        assert_eq!(flash.erase(0, SECTOR_SIZE), Err(RamFlashError::Injected));
        assert_eq!(
            flash.write(0, &[0; 4]).unwrap_err().kind(),
            NorFlashErrorKind::Other
        );
    }

    #[test]
    fn test_read_copies_out() {
        let mut flash = RamFlash::new(SECTOR_SIZE);
        flash.write(8, &[1, 2, 3, 4]).unwrap();
        let mut bytes = [0u8; 4];
        flash.read(8, &mut bytes).unwrap();
        assert_eq!(bytes, [1, 2, 3, 4]);
        assert_eq!(
            flash.read(SECTOR_SIZE - 2, &mut bytes).unwrap_err().kind(),
            NorFlashErrorKind::OutOfBounds
        );
    }

    #[test]
    fn test_disturb_clears_bits_after_write() {
        let mut flash = RamFlash::new(SECTOR_SIZE);
        flash.set_disturb(Some((70, 0x01)));
        flash.write(64, &[0xFF; 16]).unwrap();
        assert_eq!(flash.mapped(70, 1).unwrap(), &[0xFE]);
        // writes elsewhere leave it alone
        flash.write(128, &[0x00; 4]).unwrap();
        assert_eq!(flash.mapped(69, 3).unwrap(), &[0xFF, 0xFE, 0xFF]);
    }

    #[test]
    fn test_power_cut_drops_later_operations() {
        let mut flash = RamFlash::new(SECTOR_SIZE);
        flash.cut_power_after(1);
        flash.write(0, &[0; 4]).unwrap();
        flash.write(4, &[0; 4]).unwrap();
        assert_eq!(flash.mapped(0, 8).unwrap(), &[0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
        flash.restore_power();
        flash.write(4, &[0; 4]).unwrap();
        assert_eq!(flash.mapped(4, 4).unwrap(), &[0; 4]);
    }

    #[test]
    fn test_sim_delay_accumulates() {
        let mut delay = SimDelay::new();
        delay.delay_ms(50);
        delay.delay_ms(50);
        assert_eq!(delay.elapsed_ms(), 100);
    }
}
