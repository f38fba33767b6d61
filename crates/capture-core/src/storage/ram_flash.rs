use alloc::vec;
use alloc::vec::Vec;

use log::warn;

use super::FlashMedium;

/// Value of an erased byte in the RAM emulation
const RAM_ERASED_VALUE: u8 = 0x00;

/// How [`RamFlash`] treats a write to bytes programmed since their last erase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMode {
    /// Overwrite silently, like plain RAM
    Permissive,
    /// Refuse the write and count a violation, like NOR flash would corrupt
    Strict,
}

/// RAM region emulating flash block semantics.
///
/// Tracks which bytes were programmed since their last erase so that tests can
/// detect erase-before-write violations even though RAM itself would accept
/// them.
pub struct RamFlash {
    memory: Vec<u8>,
    programmed: Vec<bool>,
    block_size: u32,
    mode: FlashMode,
    violations: u32,
}

impl RamFlash {
    /// A permissive, fully erased RAM flash of `block_count` blocks.
    pub fn new(block_size: u32, block_count: u32) -> Self {
        let size = (block_size * block_count) as usize;
        Self {
            memory: vec![RAM_ERASED_VALUE; size],
            programmed: vec![false; size],
            block_size,
            mode: FlashMode::Permissive,
            violations: 0,
        }
    }

    /// Same as [`RamFlash::new`] with dirty tracking enforced.
    ///
    /// Starts with every byte unerased, like factory flash of unknown
    /// content; nothing can be written until it is erased.
    pub fn strict(block_size: u32, block_count: u32) -> Self {
        let mut flash = Self::new(block_size, block_count);
        flash.programmed.fill(true);
        flash.mode = FlashMode::Strict;
        flash
    }

    pub fn mode(&self) -> FlashMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: FlashMode) {
        self.mode = mode;
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Writes that hit bytes programmed since their last erase
    pub fn violations(&self) -> u32 {
        self.violations
    }

    /// Raw view of the whole medium
    pub fn as_bytes(&self) -> &[u8] {
        &self.memory
    }

    /// Range of `len` bytes at `address`, clipped to the medium
    fn span(&self, address: u32, len: usize) -> core::ops::Range<usize> {
        let start = (address as usize).min(self.memory.len());
        let end = start.saturating_add(len).min(self.memory.len());
        start..end
    }
}

impl FlashMedium for RamFlash {
    fn capacity(&self) -> u32 {
        self.memory.len() as u32
    }

    fn erased_value(&self) -> u8 {
        RAM_ERASED_VALUE
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> u32 {
        let span = self.span(address, buf.len());
        let n = span.len();
        buf[..n].copy_from_slice(&self.memory[span]);
        n as u32
    }

    fn write(&mut self, address: u32, data: &[u8]) -> u32 {
        let span = self.span(address, data.len());
        if self.programmed[span.clone()].iter().any(|&p| p) {
            self.violations += 1;
            warn!(
                "Write to unerased flash at {:#x} (block {})",
                address,
                address / self.block_size.max(1)
            );
            if self.mode == FlashMode::Strict {
                return 0;
            }
        }
        let n = span.len();
        self.memory[span.clone()].copy_from_slice(&data[..n]);
        self.programmed[span].fill(true);
        n as u32
    }

    fn erase(&mut self, address: u32, len: u32) -> u32 {
        let span = self.span(address, len as usize);
        self.memory[span.clone()].fill(RAM_ERASED_VALUE);
        self.programmed[span.clone()].fill(false);
        span.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_flash_is_erased() {
        let flash = RamFlash::new(16, 4);
        assert_eq!(flash.capacity(), 64);
        assert!(flash.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_erase_resets_to_erased_value() {
        let mut flash = RamFlash::new(16, 4);
        flash.write(0, &[0xFF; 64]);
        assert_eq!(flash.erase(8, 16), 16);
        assert!(flash.as_bytes()[8..24].iter().all(|&b| b == 0));
        assert_eq!(flash.as_bytes()[7], 0xFF);
        assert_eq!(flash.as_bytes()[24], 0xFF);
    }

    #[test]
    fn test_permissive_overwrite_is_counted() {
        let mut flash = RamFlash::new(16, 4);
        assert_eq!(flash.write(0, &[1, 2, 3]), 3);
        assert_eq!(flash.write(1, &[9]), 1);
        assert_eq!(&flash.as_bytes()[..3], &[1, 9, 3]);
        assert_eq!(flash.violations(), 1);
    }

    #[test]
    fn test_strict_mode_refuses_write_without_erase() {
        let mut flash = RamFlash::strict(16, 4);
        flash.erase(0, 16);
        assert_eq!(flash.write(4, &[1, 2, 3, 4]), 4);
        assert_eq!(flash.write(6, &[7, 7]), 0);
        assert_eq!(flash.violations(), 1);
        assert_eq!(&flash.as_bytes()[4..8], &[1, 2, 3, 4]);

        flash.erase(0, 16);
        assert_eq!(flash.write(6, &[7, 7]), 2);
        assert_eq!(flash.violations(), 1);
    }

    #[test]
    fn test_fresh_strict_flash_is_not_erased() {
        let mut flash = RamFlash::strict(16, 4);
        assert_eq!(flash.write(20, &[1, 2]), 0);
        assert_eq!(flash.violations(), 1);
        assert_eq!(&flash.as_bytes()[20..22], &[0, 0]);

        // Only the erased block opens up
        flash.erase(16, 16);
        assert_eq!(flash.write(20, &[1, 2]), 2);
        assert_eq!(flash.write(36, &[3]), 0);
        assert_eq!(flash.violations(), 2);
    }

    #[test]
    fn test_access_past_end_is_clipped() {
        let mut flash = RamFlash::new(16, 2);
        let mut buf = [0u8; 8];
        assert_eq!(flash.read(28, &mut buf), 4);
        assert_eq!(flash.write(40, &[1]), 0);
        assert_eq!(flash.erase(30, 100), 2);
    }
}
