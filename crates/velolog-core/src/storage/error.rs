use thiserror_no_std::Error;

/// Failures of the flash record store.
///
/// All of these are ordinary outcomes on a field device; none of them leaves
/// the in-memory count ahead of what is on flash.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("store used before init")]
    NotInitialized,
    #[error("storage full ({capacity} records)")]
    Full { capacity: u32 },
    #[error("address {address:#010x} is not {alignment}-byte aligned")]
    Misaligned { address: u32, alignment: u32 },
    #[error("address {address:#010x} is outside the store")]
    OutOfRegion { address: u32 },
    #[error("flash device error at {address:#010x}")]
    Device { address: u32 },
    #[error("erase verification failed at sector {address:#010x}")]
    EraseVerify { address: u32 },
    #[error("program verification failed at {address:#010x} (+{offset})")]
    ProgramVerify { address: u32, offset: u32 },
    #[error("record {index} did not read back as written")]
    RecordVerify { index: u32 },
    #[error("count verification failed: expected {expected}, found {found}")]
    CountVerify { expected: u32, found: u32 },
}
