use log::{info, warn};

use super::{codec::RECORD_SIZE, PAGE_SIZE, SECTOR_SIZE};
use crate::config::{DEFAULT_FLASH_OFFSET, MIN_SECTOR_COUNT};

/// Records that fit in one page without straddling its end.
pub const RECORDS_PER_PAGE: u32 = PAGE_SIZE / RECORD_SIZE as u32;

const PAGES_PER_SECTOR: u32 = SECTOR_SIZE / PAGE_SIZE;

/// Records held by one data sector
pub const RECORDS_PER_SECTOR: u32 = PAGES_PER_SECTOR * RECORDS_PER_PAGE;

/// Highest sector-aligned address a store may end at
pub const MAX_END: u32 = u32::MAX - u32::MAX % SECTOR_SIZE;

/// Physical placement of a record store, fixed for the store's lifetime.
///
/// ```text
/// base ──► count sector (4 KiB) ──► data sectors (sector_count - 1)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageLayout {
    base: u32,
    sector_count: u32,
    data_start: u32,
    capacity: u32,
}

impl StorageLayout {
    /// Compute the layout for a store at `flash_offset` spanning `sector_count`
    /// sectors.
    ///
    /// An offset of 0 selects the default offset. A misaligned offset is
    /// rounded down, never up, so the store stays inside the region the
    /// caller reserved.
    ///
    /// The store always ends at or below [`MAX_END`]: a base too close to the
    /// top of the address space is lowered and a sector count that would run
    /// past it is cut. Such a layout will not fit any real device, so `init`
    /// degrades instead of the arithmetic overflowing.
    pub fn new(flash_offset: u32, sector_count: u32) -> Self {
        let requested = if flash_offset == 0 {
            DEFAULT_FLASH_OFFSET
        } else {
            flash_offset
        };

        let aligned = requested - requested % SECTOR_SIZE;
        if aligned != requested {
            warn!(
                "FLASH: aligning flash offset to sector boundary: {:#010x} -> {:#010x}",
                requested, aligned
            );
        }

        let highest_base = MAX_END - MIN_SECTOR_COUNT * SECTOR_SIZE;
        let base = aligned.min(highest_base);
        if base != aligned {
            warn!(
                "FLASH: flash offset {:#010x} leaves no room for the store, using {:#010x}",
                aligned, base
            );
        }

        let max_sectors = (MAX_END - base) / SECTOR_SIZE;
        let sector_count = sector_count.max(MIN_SECTOR_COUNT);
        if sector_count > max_sectors {
            warn!(
                "FLASH: {} sectors run past the address space, limiting to {}",
                sector_count, max_sectors
            );
        }
        let sector_count = sector_count.min(max_sectors);
        let data_start = base + SECTOR_SIZE;
        let data_pages = (sector_count - 1) * PAGES_PER_SECTOR;
        let capacity = data_pages * RECORDS_PER_PAGE;

        info!(
            "FLASH: layout offset {:#010x}, data start {:#010x}, capacity {} records",
            base, data_start, capacity
        );

        Self {
            base,
            sector_count,
            data_start,
            capacity,
        }
    }

    /// Aligned start of the store; also the address of the count word
    pub const fn base(&self) -> u32 {
        self.base
    }

    pub const fn count_address(&self) -> u32 {
        self.base
    }

    pub const fn data_start(&self) -> u32 {
        self.data_start
    }

    pub const fn sector_count(&self) -> u32 {
        self.sector_count
    }

    /// Bytes covered by the store, count sector included
    pub const fn region_len(&self) -> u32 {
        self.sector_count * SECTOR_SIZE
    }

    /// First byte past the store
    pub const fn end(&self) -> u32 {
        self.base + self.region_len()
    }

    /// Maximum number of records
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Flash address of record `index`.
    ///
    /// Records are packed per page so none straddles a page boundary; a
    /// record that would cross into the next page starts on that page
    /// instead, leaving the previous page's tail erased.
    pub const fn record_address(&self, index: u32) -> u32 {
        let page = index / RECORDS_PER_PAGE;
        let slot = index % RECORDS_PER_PAGE;
        self.data_start + page * PAGE_SIZE + slot * RECORD_SIZE as u32
    }

    /// Start of the sector holding `address`
    pub const fn sector_of(address: u32) -> u32 {
        address - address % SECTOR_SIZE
    }

    /// Start of the page holding `address`
    pub const fn page_of(address: u32) -> u32 {
        address - address % PAGE_SIZE
    }

    /// Whether `[address, address + len)` lies inside the store
    pub const fn contains(&self, address: u32, len: u32) -> bool {
        address >= self.base && len <= self.region_len() && address - self.base <= self.region_len() - len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_offset_uses_default() {
        let layout = StorageLayout::new(0, 32);
        assert_eq!(layout.base(), DEFAULT_FLASH_OFFSET);
        assert_eq!(layout.data_start(), DEFAULT_FLASH_OFFSET + SECTOR_SIZE);
    }

    #[test]
    fn test_misaligned_offset_rounds_down() {
        let layout = StorageLayout::new(0x1_0ABC, 4);
        assert_eq!(layout.base(), 0x1_0000);
        assert_eq!(layout.count_address(), 0x1_0000);
        assert_eq!(layout.data_start(), 0x1_1000);
    }

    #[test]
    fn test_capacity_excludes_count_sector() {
        let layout = StorageLayout::new(SECTOR_SIZE, 32);
        // 31 data sectors × 16 pages × 4 records
        assert_eq!(RECORDS_PER_PAGE, 4);
        assert_eq!(layout.capacity(), 31 * 16 * 4);
    }

    #[test]
    fn test_sector_count_has_a_floor() {
        let layout = StorageLayout::new(SECTOR_SIZE, 0);
        assert_eq!(layout.sector_count(), MIN_SECTOR_COUNT);
        assert_eq!(layout.capacity(), 16 * RECORDS_PER_PAGE);
    }

    #[test]
    fn test_records_never_straddle_pages() {
        let layout = StorageLayout::new(SECTOR_SIZE, 8);
        for index in 0..layout.capacity() {
            let address = layout.record_address(index);
            let page_offset = address % PAGE_SIZE;
            assert!(page_offset + RECORD_SIZE as u32 <= PAGE_SIZE, "record {index} straddles");
            assert!(layout.contains(address, RECORD_SIZE as u32));
        }
    }

    #[test]
    fn test_fifth_record_moves_to_next_page() {
        let layout = StorageLayout::new(SECTOR_SIZE, 4);
        assert_eq!(layout.record_address(3), layout.data_start() + 3 * RECORD_SIZE as u32);
        assert_eq!(layout.record_address(4), layout.data_start() + PAGE_SIZE);
    }

    #[test]
    fn test_contains_rejects_outside_ranges() {
        let layout = StorageLayout::new(SECTOR_SIZE, 2);
        assert!(layout.contains(layout.base(), layout.region_len()));
        assert!(!layout.contains(layout.base() - 4, 4));
        assert!(!layout.contains(layout.end() - 2, 4));
        assert!(!layout.contains(layout.end(), 1));
    }

    #[test]
    fn test_offset_near_top_of_address_space_is_clamped() {
        let layout = StorageLayout::new(0xFFFF_F000, 2);
        assert_eq!(layout.sector_count(), 2);
        assert_eq!(layout.end(), MAX_END);
        assert_eq!(layout.base() % SECTOR_SIZE, 0);
        assert!(layout.contains(layout.record_address(layout.capacity() - 1), RECORD_SIZE as u32));

        let layout = StorageLayout::new(u32::MAX, 2);
        assert!(layout.end() <= MAX_END);
    }

    #[test]
    fn test_huge_sector_count_is_clamped() {
        let layout = StorageLayout::new(SECTOR_SIZE, 2_000_000);
        assert_eq!(layout.sector_count(), (MAX_END - SECTOR_SIZE) / SECTOR_SIZE);
        assert_eq!(layout.end(), MAX_END);
        assert_eq!(layout.region_len(), MAX_END - SECTOR_SIZE);
        assert_eq!(layout.record_address(layout.capacity()), layout.end());
    }
}
