//! VDP video RAM
//!
//! 128 KiB of main VRAM plus the optional 64 KiB expansion RAM that some machines populate.
//! Reads and writes carry no timing of their own; the access-slot schedule arbitrates when a
//! transaction may actually happen.

use bincode::{Decode, Encode};
use msx_common::boxedarray::BoxedByteArray;

pub const VRAM_LEN: usize = 128 * 1024;
pub const EXPANSION_VRAM_LEN: usize = 64 * 1024;

/// Addresses with this bit set target the expansion RAM space.
pub const EXPANSION_BASE: u32 = 0x20000;

#[derive(Debug, Clone, Encode, Decode)]
pub struct Vram {
    main: BoxedByteArray<VRAM_LEN>,
    expansion: Option<BoxedByteArray<EXPANSION_VRAM_LEN>>,
}

impl Vram {
    #[must_use]
    pub fn new(has_expansion_ram: bool) -> Self {
        Self {
            main: BoxedByteArray::new(),
            expansion: has_expansion_ram.then(BoxedByteArray::new),
        }
    }

    #[must_use]
    pub fn has_expansion_ram(&self) -> bool {
        self.expansion.is_some()
    }

    #[inline]
    #[must_use]
    pub fn read(&self, address: u32) -> u8 {
        if address & EXPANSION_BASE != 0 {
            match &self.expansion {
                Some(ram) => ram[address as usize & (EXPANSION_VRAM_LEN - 1)],
                // Unpopulated expansion space reads back open bus
                None => 0xFF,
            }
        } else {
            self.main[address as usize & (VRAM_LEN - 1)]
        }
    }

    #[inline]
    pub fn write(&mut self, address: u32, value: u8) {
        if address & EXPANSION_BASE != 0 {
            if let Some(ram) = &mut self.expansion {
                ram[address as usize & (EXPANSION_VRAM_LEN - 1)] = value;
            }
        } else {
            self.main[address as usize & (VRAM_LEN - 1)] = value;
        }
    }
}
