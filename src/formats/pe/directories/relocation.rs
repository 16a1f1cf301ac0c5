//! Base relocation blocks

use crate::formats::pe::types::*;
use crate::formats::pe::Image;

pub const IMAGE_REL_BASED_ABSOLUTE: u8 = 0;
pub const IMAGE_REL_BASED_HIGHLOW: u8 = 3;
pub const IMAGE_REL_BASED_DIR64: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    pub kind: u8,
    /// Offset within the block's page
    pub offset: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocationBlock {
    pub page_rva: u32,
    pub entries: Vec<RelocationEntry>,
}

impl RelocationBlock {
    /// RVAs patched by the loader, padding entries excluded.
    pub fn targets(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries
            .iter()
            .filter(|e| e.kind != IMAGE_REL_BASED_ABSOLUTE)
            .map(move |e| self.page_rva + u32::from(e.offset))
    }
}

pub struct RelocationDirectory<'a> {
    image: &'a Image,
    dir: DataDirectory,
}

impl<'a> RelocationDirectory<'a> {
    pub fn new(image: &'a Image) -> Self {
        Self {
            image,
            dir: image.data_directory(IMAGE_DIRECTORY_ENTRY_BASERELOC),
        }
    }

    pub fn is_present(&self) -> bool {
        self.dir.is_present()
    }

    pub fn blocks(&self) -> Result<Vec<RelocationBlock>> {
        let mut blocks = Vec::new();
        if !self.is_present() {
            return Ok(blocks);
        }
        let mut at = 0u32;
        while at + 8 <= self.dir.size {
            let rva = self.dir.virtual_address + at;
            let page_rva = self.image.read_at_rva::<u32>(rva)?;
            let block_size = self.image.read_at_rva::<u32>(rva + 4)?;
            if block_size < 8 || at + block_size > self.dir.size {
                return Err(PeError::MalformedRelocationTable);
            }
            let mut entries = Vec::with_capacity(((block_size - 8) / 2) as usize);
            for i in 0..(block_size - 8) / 2 {
                let raw = self.image.read_at_rva::<u16>(rva + 8 + i * 2)?;
                entries.push(RelocationEntry {
                    kind: (raw >> 12) as u8,
                    offset: raw & 0x0FFF,
                });
            }
            blocks.push(RelocationBlock { page_rva, entries });
            at += block_size;
        }
        Ok(blocks)
    }

    pub fn entry_count(&self) -> usize {
        self.blocks()
            .map(|b| b.iter().map(|blk| blk.targets().count()).sum())
            .unwrap_or(0)
    }

    /// Whether any relocation touches a byte in `range`
    pub fn covers(&self, range: std::ops::Range<u32>) -> bool {
        self.blocks()
            .map(|b| {
                b.iter()
                    .flat_map(|blk| blk.targets())
                    .any(|t| t < range.end && t + 8 > range.start)
            })
            .unwrap_or(false)
    }
}
