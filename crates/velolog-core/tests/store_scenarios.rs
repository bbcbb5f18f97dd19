//! Whole-store scenarios against the simulated flash chip: what a rider's
//! device goes through between two uploads.

use velolog_core::{
    storage::{
        FlashLog, InitStatus, RamFlash, Recovery, SimDelay, StoreError, PAGE_SIZE, SECTOR_SIZE,
    },
    DebugLevel, SensorData, StoreConfig,
};

/// A 2 MiB part, like the logger's flash chip
const CHIP_SIZE: u32 = 2 * 1024 * 1024;

type Store = FlashLog<RamFlash, SimDelay>;

fn small_config(sector_count: u32) -> StoreConfig {
    StoreConfig {
        flash_offset: 4 * SECTOR_SIZE,
        sector_count,
        debug_level: DebugLevel::Minimal,
        ..StoreConfig::default()
    }
}

fn open(flash: RamFlash, config: &StoreConfig) -> Store {
    let mut store = FlashLog::new(flash, SimDelay::new(), config);
    assert_eq!(store.init().status, InitStatus::Ready);
    store
}

fn power_cycle(store: Store, config: &StoreConfig) -> Store {
    let (flash, _) = store.release();
    open(RamFlash::from_image(flash.image().to_vec()), config)
}

fn reading(timestamp: u32) -> SensorData {
    SensorData {
        timestamp,
        latitude: 482_081_000,
        longitude: 163_738_000,
        temperature: 23.4,
        humidity: 38.0,
        pressure: 987.2,
        gas_resistance: 120_500.0,
        pm2_5: 7,
        pm5: 11,
        pm10: 16,
        co2: 501,
        is_fake_gps: false,
    }
}

#[test]
fn test_end_to_end_three_readings() {
    let config = StoreConfig::default();
    let mut store = open(RamFlash::new(CHIP_SIZE), &config);
    assert!(store.capacity() >= 100);

    let timestamps = [1_700_000_000, 1_700_000_060, 1_700_000_120];
    for ts in timestamps {
        store.append(&reading(ts)).unwrap();
    }

    assert_eq!(store.count(), 3);
    let all = store.read_all();
    assert_eq!(
        all.iter().map(|r| r.timestamp).collect::<Vec<_>>(),
        timestamps.to_vec()
    );
    assert_eq!(all[0], reading(1_700_000_000));
    assert_eq!(store.read(1).timestamp, 1_700_000_060);
    assert!(!store.is_full());
}

#[test]
fn test_garbage_magic_hides_only_that_record() {
    let config = small_config(4);
    let mut store = open(RamFlash::new(CHIP_SIZE), &config);
    for ts in [1_700_000_000, 1_700_000_060, 1_700_000_120] {
        store.append(&reading(ts)).unwrap();
    }

    let first = store.layout().record_address(0);
    store.flash_mut().poke(first, &0u32.to_le_bytes());

    assert_eq!(store.count(), 3);
    let sentinel = store.read(0);
    assert_eq!(sentinel.timestamp, 0);
    assert_eq!(sentinel, SensorData::error());

    let remaining = store.read_all();
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].timestamp, 1_700_000_060);
    assert_eq!(remaining[1].timestamp, 1_700_000_120);
}

#[test]
fn test_garbage_magic_at_boot_resets_store() {
    let config = small_config(4);
    let mut store = open(RamFlash::new(CHIP_SIZE), &config);
    for ts in [1_700_000_000, 1_700_000_060, 1_700_000_120] {
        store.append(&reading(ts)).unwrap();
    }
    let first = store.layout().record_address(0);
    store.flash_mut().poke(first, &0u32.to_le_bytes());

    let (flash, _) = store.release();
    let mut store = FlashLog::new(flash, SimDelay::new(), &config);
    let report = store.init();
    assert_eq!(report.recovery, Some(Recovery::PayloadMismatch { magic: 0 }));
    assert_eq!(store.count(), 0);
}

#[test]
fn test_crash_between_payload_and_count() {
    let config = small_config(4);
    let mut store = open(RamFlash::new(CHIP_SIZE), &config);
    store.append(&reading(1_700_000_000)).unwrap();
    store.append(&reading(1_700_000_060)).unwrap();

    // The payload sector's erase and its 16 page programs go through, then
    // the power is lost before the count sector is touched.
    store.flash_mut().cut_power_after(1 + SECTOR_SIZE / PAGE_SIZE);
    assert!(store.append(&reading(1_700_000_120)).is_err());
    assert_eq!(store.count(), 2);

    let mut store = power_cycle(store, &config);
    assert_eq!(store.count(), 2);
    for index in 0..store.count() {
        assert!(store.read(index).is_valid(), "record {index} unreadable");
    }
    assert!(!store.read(2).is_valid());

    store.append(&reading(1_700_000_180)).unwrap();
    assert_eq!(store.read(2).timestamp, 1_700_000_180);
}

#[test]
fn test_stuck_count_sector_keeps_count() {
    let config = small_config(4);
    let mut store = open(RamFlash::new(CHIP_SIZE), &config);
    store.append(&reading(1_700_000_000)).unwrap();

    let count_sector = store.layout().count_address();
    store
        .flash_mut()
        .set_stuck(Some(count_sector..count_sector + SECTOR_SIZE));
    assert!(matches!(
        store.append(&reading(1_700_000_060)),
        Err(StoreError::EraseVerify { .. })
    ));
    assert_eq!(store.count(), 1);

    let store = power_cycle(store, &config);
    assert_eq!(store.count(), 1);
    assert_eq!(store.read_all(), vec![reading(1_700_000_000)]);
}

#[test]
fn test_append_succeeds_exactly_capacity_times() {
    let config = small_config(2);
    let mut store = open(RamFlash::new(CHIP_SIZE), &config);
    store.reset().unwrap();

    let capacity = store.capacity();
    for i in 0..capacity {
        store.append(&reading(1_700_000_000 + i)).unwrap();
    }
    assert!(store.is_full());

    assert_eq!(
        store.append(&reading(1_800_000_000)),
        Err(StoreError::Full { capacity })
    );
    assert_eq!(store.count(), capacity);

    let store = power_cycle(store, &config);
    assert_eq!(store.count(), capacity);
    assert_eq!(store.read(capacity - 1).timestamp, 1_700_000_000 + capacity - 1);
}

#[test]
fn test_erase_twice_in_a_row() {
    let config = small_config(3);
    let mut store = open(RamFlash::new(CHIP_SIZE), &config);
    for i in 0..10 {
        store.append(&reading(1_700_000_000 + i)).unwrap();
    }

    store.erase().unwrap();
    assert_eq!(store.count(), 0);
    store.erase().unwrap();
    assert_eq!(store.count(), 0);

    let store = power_cycle(store, &config);
    assert_eq!(store.count(), 0);
    assert!(store.read_all().is_empty());
}

#[test]
fn test_upload_cycle_refills_after_erase() {
    let config = small_config(3);
    let mut store = open(RamFlash::new(CHIP_SIZE), &config);
    let ride: Vec<SensorData> = (0..40).map(|i| reading(1_700_000_000 + i * 5)).collect();
    store.append_batch(&ride).unwrap();
    assert_eq!(store.read_all(), ride);

    store.erase().unwrap();
    store.append_batch(&ride[..5]).unwrap();
    assert_eq!(store.read_all(), ride[..5].to_vec());
}
