//! Hardware-independent core library for velolog
//!
//! This crate contains the platform-agnostic part of the bicycle-mounted
//! air-quality logger: the sensor record model and the append-only record
//! store that persists readings to raw NOR flash.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets and desktop hosts (for the simulator and tests).
//! The physical flash is reached only through [`storage::FlashDevice`].

#![no_std]

extern crate alloc;

pub mod config;
pub mod sensors;
pub mod storage;

pub use config::{ChecksumPolicy, ConfigParseError, DebugLevel, StoreConfig};
pub use sensors::SensorData;
