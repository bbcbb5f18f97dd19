use embedded_storage::nor_flash::MultiwriteNorFlash;

/// Raw NOR flash as seen by the record store.
///
/// Writes go through the `embedded-storage` NOR primitives; reads go through
/// the memory-mapped (XIP) window instead of [`ReadNorFlash::read`], so
/// records are decoded in place. The store disables interrupts around every
/// `erase`/`write` call, never lets a `write` cross a page and verifies the
/// result itself, so implementations only have to issue the operation.
///
/// Multiwrite is required: the batch path reprograms bytes that are already
/// on flash with their own value.
///
/// [`ReadNorFlash::read`]: embedded_storage::nor_flash::ReadNorFlash::read
pub trait FlashDevice: MultiwriteNorFlash {
    /// Direct view of `len` bytes at `offset`, without copying.
    /// `None` if the range is outside the device.
    fn mapped(&self, offset: u32, len: usize) -> Option<&[u8]>;
}
