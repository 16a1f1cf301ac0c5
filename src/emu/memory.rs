//! Sparse guest memory made of page-aligned regions.

use crate::emu::{EmuError, Result};
use crate::formats::pe::PAGE_SIZE;

struct Region {
    base: u64,
    data: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }
}

#[derive(Default)]
pub(crate) struct GuestMemory {
    regions: Vec<Region>,
}

impl GuestMemory {
    pub(crate) fn map(&mut self, address: u64, size: u64) -> Result<()> {
        let page = u64::from(PAGE_SIZE);
        let base = address & !(page - 1);
        let end = address
            .checked_add(size)
            .and_then(|e| e.checked_add(page - 1))
            .map(|e| e & !(page - 1))
            .ok_or(EmuError::MapOverlap { address })?;
        if end <= base {
            return Ok(());
        }
        if self.regions.iter().any(|r| base < r.end() && r.base < end) {
            return Err(EmuError::MapOverlap { address });
        }
        self.regions.push(Region {
            base,
            data: vec![0; (end - base) as usize],
        });
        self.regions.sort_by_key(|r| r.base);
        Ok(())
    }

    pub(crate) fn is_mapped(&self, address: u64) -> bool {
        self.regions.iter().any(|r| address >= r.base && address < r.end())
    }

    fn region_index(&self, address: u64) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| address >= r.base && address < r.end())
    }

    pub(crate) fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let unmapped = EmuError::Unmapped {
            address,
            size: buf.len(),
        };
        let mut done = 0usize;
        while done < buf.len() {
            let at = address.wrapping_add(done as u64);
            let idx = self.region_index(at).ok_or_else(|| unmapped.clone())?;
            let region = &self.regions[idx];
            let start = (at - region.base) as usize;
            let n = (region.data.len() - start).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&region.data[start..start + n]);
            done += n;
        }
        Ok(())
    }

    pub(crate) fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        // Validate first so a failed write leaves memory untouched.
        let mut probe = vec![0u8; data.len()];
        self.read(address, &mut probe)?;
        let mut done = 0usize;
        while done < data.len() {
            let at = address.wrapping_add(done as u64);
            let idx = self.region_index(at).ok_or(EmuError::Unmapped {
                address,
                size: data.len(),
            })?;
            let region = &mut self.regions[idx];
            let start = (at - region.base) as usize;
            let n = (region.data.len() - start).min(data.len() - done);
            region.data[start..start + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Up to `max` bytes starting at `address`, stopping at unmapped memory.
    pub(crate) fn fetch(&self, address: u64, max: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max);
        let mut byte = [0u8; 1];
        for i in 0..max {
            if self.read(address.wrapping_add(i as u64), &mut byte).is_err() {
                break;
            }
            out.push(byte[0]);
        }
        out
    }
}
