//! Desktop simulator for the velolog flash record store.
//!
//! Runs the store against a simulated 2 MiB NOR flash chip and walks it
//! through a day in the life of the logger: a ride of buffered readings,
//! a power cycle, on-flash corruption, a power cut in the middle of a write,
//! and finally the upload-and-erase cycle.
//!
//! # Environment
//!
//! Read after loading `.env` from the working directory.
//!
//! | Variable                  | Meaning                                   |
//! |---------------------------|-------------------------------------------|
//! | `VELOLOG_FLASH_OFFSET`    | Store offset in bytes (decimal or `0x`)   |
//! | `VELOLOG_SECTORS`         | Sectors reserved for the store            |
//! | `VELOLOG_DEBUG_LEVEL`     | `minimal`, `normal`, `verbose` or 0-2     |
//! | `VELOLOG_CHECKSUM_POLICY` | `strict` or `plausible`                   |
//! | `VELOLOG_RECORDS`         | Readings generated for the ride           |
//!
//! `RUST_LOG` controls the log output as usual for `env_logger`.

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{error, info, warn};
use serde::Serialize;

use velolog_core::storage::{
    FlashLog, InitStatus, PAGE_SIZE, RamFlash, ReadingBuffer, SECTOR_SIZE, SimDelay,
    StoreError,
};
use velolog_core::{SensorData, StoreConfig};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Size of the simulated flash chip
const CHIP_SIZE: u32 = 2 * 1024 * 1024;

/// Readings generated when `VELOLOG_RECORDS` is not set
const DEFAULT_RIDE_RECORDS: u32 = 120;

/// Seconds between two readings on a ride
const SAMPLE_INTERVAL_SECS: u32 = 5;

/// Readings kept in RAM between flash writes
const BUFFERED_READINGS: usize = 16;

/// Records sent in one upload request
const UPLOAD_CHUNK: usize = 8;

/// Body buffer for one upload request
const UPLOAD_BODY_SIZE: usize = 4096;

/// Ride start, degrees × 10^7 (Amsterdam Centraal)
const START_LATITUDE: i32 = 523_791_000;
const START_LONGITUDE: i32 = 48_997_000;

type Store = FlashLog<RamFlash, SimDelay>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

struct SimConfig {
    store: StoreConfig,
    ride_records: u32,
}

fn parse_u32(value: &str) -> Option<u32> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Apply the environment variable `key` through `parse`, keeping the current
/// value when it is unset or invalid.
fn override_from_env<T>(key: &str, target: &mut T, parse: impl Fn(&str) -> Option<T>) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match parse(raw.trim()) {
        Some(value) => *target = value,
        None => warn!("Ignoring invalid {}={:?}", key, raw),
    }
}

fn load_config() -> SimConfig {
    let mut store = StoreConfig::default();
    let mut ride_records = DEFAULT_RIDE_RECORDS;

    override_from_env("VELOLOG_FLASH_OFFSET", &mut store.flash_offset, parse_u32);
    override_from_env("VELOLOG_SECTORS", &mut store.sector_count, parse_u32);
    override_from_env("VELOLOG_DEBUG_LEVEL", &mut store.debug_level, |s| {
        FromStr::from_str(&s.to_ascii_lowercase()).ok()
    });
    override_from_env("VELOLOG_CHECKSUM_POLICY", &mut store.checksum_policy, |s| {
        FromStr::from_str(&s.to_ascii_lowercase()).ok()
    });
    override_from_env("VELOLOG_RECORDS", &mut ride_records, parse_u32);

    SimConfig {
        store,
        ride_records,
    }
}

// ---------------------------------------------------------------------------
// Mock data generation
// ---------------------------------------------------------------------------

/// Generates a plausible ride: a slow drift north-east through town with
/// air quality that varies along the way.
struct MockRide {
    timestamp: u32,
    step: u32,
}

impl MockRide {
    fn new(start: u32) -> Self {
        Self {
            timestamp: start,
            step: 0,
        }
    }

    fn next_reading(&mut self) -> SensorData {
        let t = f64::from(self.step * SAMPLE_INTERVAL_SECS);
        self.step += 1;
        self.timestamp += SAMPLE_INTERVAL_SECS;

        // Temperature: 14–20 °C as the ride passes shade and sun
        let temperature = 17.0 + 2.5 * (t / 240.0).sin() + 0.5 * (t / 41.0).cos();

        // Humidity: 55–75 %
        let humidity = 65.0 + 8.0 * (t / 300.0).sin() + 2.0 * (t / 29.0).cos();

        // PM2.5 peaks near traffic
        let pm2_5 = 8.0 + 6.0 * (t / 90.0).sin().abs() + 2.0 * (t / 17.0).cos();

        // CO₂: 420–560 ppm
        let co2 = 480.0 + 60.0 * (t / 150.0).sin() + 20.0 * (t / 33.0).cos();

        let pressure = 1012.0 + 0.8 * (t / 600.0).sin();
        let gas_resistance = 80_000.0 + 15_000.0 * (t / 200.0).cos();

        // ~4 m/s, mostly north
        let latitude = START_LATITUDE + (self.step * 180) as i32;
        let longitude = START_LONGITUDE + (self.step * 70) as i32;

        SensorData {
            timestamp: self.timestamp,
            latitude,
            longitude,
            temperature: temperature as f32,
            humidity: humidity as f32,
            pressure: pressure as f32,
            gas_resistance: gas_resistance as f32,
            pm2_5: pm2_5 as u16,
            pm5: (pm2_5 * 1.4) as u16,
            pm10: (pm2_5 * 1.9) as u16,
            co2: co2 as u32,
            is_fake_gps: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Upload payload
// ---------------------------------------------------------------------------

/// Body of one upload request, as the upload layer sends it.
#[derive(Serialize)]
struct UploadPayload<'a> {
    device: &'a str,
    first_index: u32,
    records: &'a [SensorData],
}

/// Render stored records into upload bodies and return how many bytes the
/// upload would send.
fn render_upload(records: &[SensorData]) -> usize {
    let mut body = [0u8; UPLOAD_BODY_SIZE];
    let mut total = 0;

    for (chunk_index, chunk) in records.chunks(UPLOAD_CHUNK).enumerate() {
        let payload = UploadPayload {
            device: "velolog-sim",
            first_index: (chunk_index * UPLOAD_CHUNK) as u32,
            records: chunk,
        };

        match serde_json_core::to_slice(&payload, &mut body) {
            Ok(len) => {
                if chunk_index == 0 {
                    info!(
                        "First upload body: {}",
                        String::from_utf8_lossy(&body[..len])
                    );
                }
                total += len;
            }
            Err(e) => error!("Failed to render upload chunk {}: {:?}", chunk_index, e),
        }
    }

    total
}

// ---------------------------------------------------------------------------
// Scenario steps
// ---------------------------------------------------------------------------

fn open(flash: RamFlash, config: &StoreConfig) -> Store {
    let mut store = FlashLog::new(flash, SimDelay::new(), config);
    let report = store.init();
    match report.status {
        InitStatus::Ready => info!(
            "Store ready: {} of {} records used, recovery {:?}",
            report.count,
            store.capacity(),
            report.recovery
        ),
        InitStatus::Degraded => warn!(
            "Store degraded to memory-only mode, recovery {:?}",
            report.recovery
        ),
    }
    store
}

/// A power cycle: the chip keeps its contents, everything else starts over.
fn power_cycle(store: Store, config: &StoreConfig) -> Store {
    let (flash, delay) = store.release();
    info!(
        "Power cycle ({} ms spent waiting for flash)",
        delay.elapsed_ms()
    );
    open(RamFlash::from_image(flash.into_image()), config)
}

fn ride(store: &mut Store, records: u32) -> Result<(), StoreError> {
    let start = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1_700_000_000);
    let mut sensors = MockRide::new(start);
    let mut pending: ReadingBuffer<BUFFERED_READINGS> = ReadingBuffer::new();

    for _ in 0..records {
        let reading = sensors.next_reading();
        if pending.is_full() {
            pending.flush(store)?;
        }
        if let Err(dropped) = pending.push(reading) {
            warn!("Reading buffer full, dropping reading at {}", dropped.timestamp);
        }
        if store.is_full() {
            warn!("Store full, stopping the ride early");
            break;
        }
    }

    // before sleep
    pending.flush(store)?;
    info!("Ride finished: {} records stored", store.count());
    Ok(())
}

fn corrupt_record(store: &mut Store, index: u32) {
    if index >= store.count() {
        return;
    }
    let address = store.layout().record_address(index);
    store.flash_mut().poke(address, &0u32.to_le_bytes());
    warn!("Overwrote the magic of record {} with garbage", index);

    let readable = store.read_all().len();
    info!(
        "{} of {} records still readable after corruption",
        readable,
        store.count()
    );
}

fn interrupted_append(store: Store, config: &StoreConfig) -> Store {
    let mut store = store;
    let before = store.count();

    // lose power once the payload sector is erased and reprogrammed, before
    // the count sector is touched
    store.flash_mut().cut_power_after(1 + SECTOR_SIZE / PAGE_SIZE);
    let reading = MockRide::new(1_800_000_000).next_reading();
    match store.append(&reading) {
        Ok(()) => warn!("Append unexpectedly survived the power cut"),
        Err(e) => info!("Append interrupted by power loss: {}", e),
    }

    let store = power_cycle(store, config);
    info!(
        "Count before the cut: {}, after reboot: {}",
        before,
        store.count()
    );
    store
}

fn run(config: &SimConfig) -> Result<(), StoreError> {
    let mut store = open(RamFlash::new(CHIP_SIZE), &config.store);

    ride(&mut store, config.ride_records)?;
    let mut store = power_cycle(store, &config.store);

    corrupt_record(&mut store, 1);
    store.dump_raw(4);

    let mut store = interrupted_append(store, &config.store);

    let records = store.read_all();
    let bytes = render_upload(&records);
    info!(
        "Upload of {} records would send {} bytes in {} requests",
        records.len(),
        bytes,
        records.len().div_ceil(UPLOAD_CHUNK)
    );

    store.erase()?;
    info!("Storage erased after upload, {} records stored", store.count());

    let store = power_cycle(store, &config.store);
    info!("Next boot starts with {} records", store.count());
    Ok(())
}

fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    info!("Starting velolog simulator");
    let config = load_config();
    info!(
        "Store at {:#010x}, {} sectors, debug {:?}, checksum {:?}, {} ride readings",
        config.store.flash_offset,
        config.store.sector_count,
        config.store.debug_level,
        config.store.checksum_policy,
        config.ride_records
    );

    if let Err(e) = run(&config) {
        error!("Simulation stopped: {}", e);
        std::process::exit(1);
    }

    info!("Simulator exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use velolog_core::DebugLevel;

    #[test]
    fn test_ride_stores_every_reading() {
        let config = StoreConfig {
            flash_offset: SECTOR_SIZE,
            sector_count: 4,
            debug_level: DebugLevel::Minimal,
            ..StoreConfig::default()
        };
        let mut store = open(RamFlash::new(8 * SECTOR_SIZE), &config);

        // crosses two full buffers and leaves a partial one for the final flush
        let readings = 2 * BUFFERED_READINGS as u32 + 8;
        ride(&mut store, readings).unwrap();

        let records = store.read_all();
        assert_eq!(records.len(), readings as usize);
        assert!(
            records
                .windows(2)
                .all(|pair| pair[1].timestamp == pair[0].timestamp + SAMPLE_INTERVAL_SECS)
        );
    }
}
