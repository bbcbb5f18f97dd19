//! Append-only sensor record store on raw NOR flash.
//!
//! ## On-flash layout
//!
//! ```text
//! sector 0        count: u32 little-endian, rest of the sector erased
//! sector 1..N     data pages, each holding RECORDS_PER_PAGE back-to-back
//!                 records followed by an erased tail
//! ```
//!
//! A record is only visible once the count covers it: payload is written and
//! verified first, the count is advanced second.

pub mod buffer;
pub mod codec;
pub mod error;
pub mod flash;
pub mod flash_log;
pub mod layout;
#[cfg(any(test, feature = "sim"))]
pub mod ram_flash;
pub mod safe_flash;

pub use buffer::ReadingBuffer;
pub use codec::{RecordStatus, RECORD_SIZE};
pub use error::StoreError;
pub use flash::FlashDevice;
pub use flash_log::{FlashLog, InitReport, InitStatus, Recovery, StoreState};
pub use layout::StorageLayout;
#[cfg(any(test, feature = "sim"))]
pub use ram_flash::{RamFlash, SimDelay};
pub use safe_flash::SafeFlash;

/// Minimum erasable unit
pub const SECTOR_SIZE: u32 = 4096;

/// Maximum programmable unit; a program must not cross a page boundary
pub const PAGE_SIZE: u32 = 256;

/// Program addresses must be aligned to this
pub const WORD_SIZE: u32 = 4;

/// Value of every byte after an erase
pub const ERASED_BYTE: u8 = 0xFF;

/// Value of every word after an erase
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// Wait after each erase/program for the flash to finish internally
pub const SETTLE_DELAY_MS: u32 = 50;
