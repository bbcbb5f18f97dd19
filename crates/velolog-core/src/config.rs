use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

/// Default start of the record store: 1.75 MiB into a 2 MiB flash, above the
/// firmware image.
pub const DEFAULT_FLASH_OFFSET: u32 = 1792 * 1024;

/// Sectors reserved for the store, count sector included.
pub const DEFAULT_SECTOR_COUNT: u32 = 32;

/// One count sector plus at least one data sector.
pub const MIN_SECTOR_COUNT: u32 = 2;

/// A configuration value that names no known setting.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigParseError {
    #[error("unknown debug level, expected minimal, normal, verbose or a number")]
    DebugLevel,
    #[error("unknown checksum policy, expected strict or plausible")]
    ChecksumPolicy,
}

/// Verbosity of the flash store diagnostics. Never changes behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DebugLevel {
    /// Errors, warnings and lifecycle events only
    Minimal,
    /// Adds one event per erase/program/record write
    #[default]
    Normal,
    /// Adds interrupt bracketing and raw byte previews
    Verbose,
}

impl DebugLevel {
    /// Map a numeric verbosity (0 = minimal, 1 = normal, 2 = verbose).
    /// Out-of-range values clamp to the nearest level.
    pub const fn from_level(level: i32) -> Self {
        if level <= 0 {
            Self::Minimal
        } else if level == 1 {
            Self::Normal
        } else {
            Self::Verbose
        }
    }
}

impl FromStr for DebugLevel {
    type Err = ConfigParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minimal" => Ok(Self::Minimal),
            "normal" => Ok(Self::Normal),
            "verbose" => Ok(Self::Verbose),
            other => other
                .parse::<i32>()
                .map(Self::from_level)
                .map_err(|_| ConfigParseError::DebugLevel),
        }
    }
}

/// What the codec does when a record's stored checksum does not match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumPolicy {
    /// Any mismatch makes the record corrupt
    #[default]
    Strict,
    /// Accept a mismatching record whose temperature, humidity and timestamp
    /// are all plausible, with a warning
    Plausible,
}

impl FromStr for ChecksumPolicy {
    type Err = ConfigParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Self::Strict),
            "plausible" => Ok(Self::Plausible),
            _ => Err(ConfigParseError::ChecksumPolicy),
        }
    }
}

/// Configuration of one flash record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Byte offset of the store in the flash address space.
    /// 0 selects [`DEFAULT_FLASH_OFFSET`]. Rounded down to a sector boundary.
    pub flash_offset: u32,
    /// Sectors reserved for the store, count sector included
    pub sector_count: u32,
    pub debug_level: DebugLevel,
    /// `false` starts the store in memory-only mode
    pub flash_enabled: bool,
    pub checksum_policy: ChecksumPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flash_offset: 0,
            sector_count: DEFAULT_SECTOR_COUNT,
            debug_level: DebugLevel::Normal,
            flash_enabled: true,
            checksum_policy: ChecksumPolicy::Strict,
        }
    }
}

impl StoreConfig {
    pub fn with_offset(flash_offset: u32) -> Self {
        Self {
            flash_offset,
            ..Self::default()
        }
    }
}
