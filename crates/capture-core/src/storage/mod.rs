//! Block-granular storage for the capture log.
//!
//! The address space of a [`FlashMedium`] is split by a [`MemoryRegion`] into
//! a reserved configuration prefix (`used_blocks` blocks) and the sample-log
//! suffix. All accesses go through [`BlockStore`], which clamps every length
//! to the region so no caller can reach past its end.

mod ram_flash;

pub use ram_flash::{FlashMode, RamFlash};

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, warn};

use crate::error::{CaptureError, Result, StorageOp, expect_transfer};

/// Block count of the RAM region emulating flash
pub const RAM_N_BLOCKS: u32 = 112;
/// Block size of the RAM region emulating flash
pub const RAM_BLOCK_SIZE: u32 = 512;
/// Nominal erase time per block in milliseconds
pub const RAM_ERASE_TIME_MS: u32 = 10;

/// A durable (or emulated) storage medium.
///
/// Addresses are absolute medium addresses. Every method returns the number
/// of bytes actually transferred; the medium itself does no bounds clamping
/// beyond refusing what it cannot do.
pub trait FlashMedium {
    /// Total number of addressable bytes.
    fn capacity(&self) -> u32;

    /// Value every byte holds right after an erase.
    fn erased_value(&self) -> u8;

    fn read(&mut self, address: u32, buf: &mut [u8]) -> u32;

    fn write(&mut self, address: u32, data: &[u8]) -> u32;

    fn erase(&mut self, address: u32, len: u32) -> u32;
}

/// Geometry of the region handed to a [`BlockStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Medium address of the first byte of the region
    pub base_offset: u32,
    /// Erase granularity in bytes
    pub block_size: u32,
    /// Number of blocks in the region
    pub block_count: u32,
    /// Blocks reserved for configuration at the start of the region
    pub used_blocks: u32,
    /// Nominal time to erase one block
    pub erase_time_ms: u32,
}

impl MemoryRegion {
    /// Create a region reserving enough whole blocks for `config_size` bytes.
    pub const fn new(
        base_offset: u32,
        block_size: u32,
        block_count: u32,
        config_size: u32,
        erase_time_ms: u32,
    ) -> Self {
        let used_blocks = if block_size == 0 {
            0
        } else {
            config_size.div_ceil(block_size)
        };
        Self {
            base_offset,
            block_size,
            block_count,
            used_blocks,
            erase_time_ms,
        }
    }

    /// Total size of the region in bytes
    pub const fn size(&self) -> u32 {
        self.block_size * self.block_count
    }

    /// Offset added to every sample-relative address
    pub const fn sample_offset(&self) -> u32 {
        self.used_blocks * self.block_size
    }

    /// Length of `[address, address + len)` once clipped to the region.
    pub const fn clamp(&self, address: u32, len: u32) -> u32 {
        let remaining = self.size().saturating_sub(address);
        if len > remaining { remaining } else { len }
    }
}

/// Bounds-checked, partitioned access to a [`FlashMedium`]
pub struct BlockStore<M: FlashMedium> {
    medium: M,
    region: MemoryRegion,
}

impl<M: FlashMedium> BlockStore<M> {
    pub fn new(medium: M, region: MemoryRegion) -> Self {
        debug_assert!(
            region.base_offset + region.size() <= medium.capacity(),
            "region exceeds medium"
        );
        Self { medium, region }
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn block_size(&self) -> u32 {
        self.region.block_size
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    pub fn medium_mut(&mut self) -> &mut M {
        &mut self.medium
    }

    pub fn erased_value(&self) -> u8 {
        self.medium.erased_value()
    }

    fn clamped(&self, address: u32, requested: u32) -> u32 {
        let actual = self.region.clamp(address, requested);
        if actual != requested {
            warn!(
                "{}",
                CaptureError::StorageBoundsClamped {
                    address,
                    requested,
                    actual,
                }
            );
        }
        actual
    }

    /// Read into `buf` from a region-relative address. Returns bytes read.
    pub fn read_data(&mut self, address: u32, buf: &mut [u8]) -> u32 {
        let len = self.clamped(address, buf.len() as u32);
        if len == 0 {
            return 0;
        }
        self.medium
            .read(self.region.base_offset + address, &mut buf[..len as usize])
    }

    /// Write `data` at a region-relative address. Returns bytes written.
    pub fn write_data(&mut self, address: u32, data: &[u8]) -> u32 {
        let len = self.clamped(address, data.len() as u32);
        if len == 0 {
            return 0;
        }
        self.medium
            .write(self.region.base_offset + address, &data[..len as usize])
    }

    /// Erase `len` bytes at a region-relative address. Returns bytes erased.
    pub fn erase_data(&mut self, address: u32, len: u32) -> u32 {
        let len = self.clamped(address, len);
        if len == 0 {
            return 0;
        }
        self.medium.erase(self.region.base_offset + address, len)
    }

    pub fn read_sample_data(&mut self, address: u32, buf: &mut [u8]) -> u32 {
        let offset = self.region.sample_offset();
        self.read_data(offset + address, buf)
    }

    pub fn write_sample_data(&mut self, address: u32, data: &[u8]) -> u32 {
        let offset = self.region.sample_offset();
        self.write_data(offset + address, data)
    }

    pub fn erase_sample_data(&mut self, address: u32, len: u32) -> u32 {
        let offset = self.region.sample_offset();
        self.erase_data(offset + address, len)
    }

    /// Write sample data, failing unless every byte landed.
    pub fn write_sample_exact(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let n = self.write_sample_data(address, data);
        expect_transfer(StorageOp::Write, address, data.len() as u32, n)
    }

    /// Read sample data, failing unless `buf` was filled.
    pub fn read_sample_exact(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        let requested = buf.len() as u32;
        let n = self.read_sample_data(address, buf);
        expect_transfer(StorageOp::Read, address, requested, n)
    }

    /// Erase sample data, failing unless the whole range was erased.
    pub fn erase_sample_exact(&mut self, address: u32, len: u32) -> Result<()> {
        let n = self.erase_sample_data(address, len);
        expect_transfer(StorageOp::Erase, address, len, n)
    }

    pub fn available_sample_blocks(&self) -> u32 {
        self.region.block_count.saturating_sub(self.region.used_blocks)
    }

    pub fn available_sample_bytes(&self) -> u32 {
        self.available_sample_blocks() * self.region.block_size
    }

    /// Erase the whole configuration prefix and write `config` at its start.
    pub fn save_config(&mut self, config: &[u8]) -> Result<()> {
        let used_bytes = self.region.sample_offset();
        if config.len() as u32 > used_bytes {
            return Err(CaptureError::Config(CaptureError::message(
                "config larger than reserved blocks",
            )));
        }
        let n = self.erase_data(0, used_bytes);
        expect_transfer(StorageOp::Erase, 0, used_bytes, n)?;
        let n = self.write_data(0, config);
        expect_transfer(StorageOp::Write, 0, config.len() as u32, n)?;
        debug!("Saved {} config bytes", config.len());
        Ok(())
    }

    /// Read the start of the configuration prefix into `config`.
    pub fn load_config(&mut self, config: &mut [u8]) -> Result<()> {
        let requested = config.len() as u32;
        let n = self.read_data(0, config);
        expect_transfer(StorageOp::Read, 0, requested, n)
    }
}

/// A [`BlockStore`] shared between the foreground session and the producer
/// callback.
///
/// Every access runs inside a critical section so a callback can never
/// observe a half-finished foreground operation.
pub struct SharedBlockStore<M: FlashMedium> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<BlockStore<M>>>,
}

impl<M: FlashMedium> SharedBlockStore<M> {
    pub const fn new(store: BlockStore<M>) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(store)),
        }
    }

    /// Run `f` with exclusive access to the store.
    pub fn with<R>(&self, f: impl FnOnce(&mut BlockStore<M>) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }

    pub fn into_inner(self) -> BlockStore<M> {
        self.inner.into_inner().into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> BlockStore<RamFlash> {
        let region = MemoryRegion::new(0, 64, 8, 100, 10);
        BlockStore::new(RamFlash::new(64, 8), region)
    }

    #[test]
    fn test_region_reserves_whole_blocks() {
        let region = MemoryRegion::new(0, 64, 8, 100, 10);
        assert_eq!(region.used_blocks, 2);
        assert_eq!(region.sample_offset(), 128);
        assert_eq!(region.size(), 512);

        let exact = MemoryRegion::new(0, 64, 8, 64, 10);
        assert_eq!(exact.used_blocks, 1);
    }

    #[test]
    fn test_clamp_all_addresses() {
        let region = MemoryRegion::new(0, 64, 8, 0, 10);
        let size = region.size();
        for addr in (0..size).step_by(7) {
            for len in [0, 1, 13, 64, 511, 512, 4096] {
                assert_eq!(region.clamp(addr, len), len.min(size - addr));
            }
        }
        assert_eq!(region.clamp(size, 10), 0);
        assert_eq!(region.clamp(size + 100, 10), 0);
    }

    #[test]
    fn test_oversized_write_touches_nothing_outside() {
        let mut flash = RamFlash::new(64, 10);
        flash.erase(0, 640);
        let region = MemoryRegion::new(64, 64, 8, 0, 10);
        let mut store = BlockStore::new(flash, region);

        let data = [0xAB; 200];
        let n = store.write_data(450, &data);
        assert_eq!(n, 62);

        let bytes = store.medium().as_bytes();
        // Region occupies medium bytes [64, 576)
        assert!(bytes[..64].iter().all(|&b| b == 0));
        assert!(bytes[64 + 450..576].iter().all(|&b| b == 0xAB));
        assert!(bytes[576..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sample_round_trip_at_offset() {
        let mut store = store();
        let available = store.available_sample_bytes();
        assert_eq!(available, 6 * 64);

        store.erase_sample_data(0, available);
        let header_offset = 36;
        let payload: alloc::vec::Vec<u8> = (0..(available - header_offset))
            .map(|i| (i * 7) as u8)
            .collect();
        store.write_sample_exact(header_offset, &payload).unwrap();

        let mut back = alloc::vec![0u8; payload.len()];
        store.read_sample_exact(header_offset, &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_sample_ops_never_reach_config() {
        let mut store = store();
        store.save_config(b"config!").unwrap();
        store.erase_sample_data(0, u32::MAX);
        store.write_sample_data(0, &[0x55; 1024]);

        let mut cfg = [0u8; 7];
        store.load_config(&mut cfg).unwrap();
        assert_eq!(&cfg, b"config!");
    }

    #[test]
    fn test_short_erase_is_an_error() {
        let mut store = store();
        let err = store.erase_sample_exact(0, 10_000).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::StorageOpFailed {
                op: StorageOp::Erase,
                requested: 10_000,
                actual: 384,
                ..
            }
        ));
    }

    #[test]
    fn test_config_larger_than_prefix_rejected() {
        let mut store = store();
        assert!(matches!(
            store.save_config(&[1u8; 200]),
            Err(CaptureError::Config(_))
        ));
    }

    #[test]
    fn test_shared_store_access() {
        let shared = SharedBlockStore::new(store());
        shared.with(|s| s.erase_sample_data(0, 64));
        let n = shared.with(|s| s.write_sample_data(0, &[1, 2, 3, 4]));
        assert_eq!(n, 4);
        let mut store = shared.into_inner();
        let mut buf = [0u8; 4];
        store.read_sample_exact(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
