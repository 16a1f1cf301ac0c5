//! Process collaborators: module enumeration and memory snapshots.
//!
//! Attaching to a live OS process is left to callers. The engine only needs
//! a [`ProcessSource`]; [`SnapshotProcess`] serves modules dumped elsewhere.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::formats::pe::Bitness;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("invalid process handle")]
    InvalidHandle,
    #[error("unable to enumerate modules: {0}")]
    ModuleList(String),
    #[error("unable to read {size:#x} bytes at {address:#x}")]
    Read { address: u64, size: usize },
}

/// One module loaded in the analyzed process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub path: String,
    pub base: u64,
    pub size: u64,
}

impl ModuleInfo {
    pub fn new<S: Into<String>>(path: S, base: u64, size: u64) -> Self {
        Self {
            path: path.into(),
            base,
            size,
        }
    }

    /// Final path component; both separators are honoured.
    pub fn file_name(&self) -> &str {
        self.path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.path)
    }

    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    /// Whether `address` lies within `[base, base + size)`.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }
}

/// Bytes read from a module; `complete` is false when some pages failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub bytes: Vec<u8>,
    pub complete: bool,
}

pub trait ProcessSource {
    fn bitness(&self) -> Bitness;

    fn modules(&self) -> Result<Vec<ModuleInfo>, ProcessError>;

    /// Best-effort read of `size` bytes at `address`. Unreadable ranges are
    /// zero-filled and reported through `complete`.
    fn read_memory(&self, address: u64, size: usize) -> Result<MemorySnapshot, ProcessError>;
}

/// A process reconstructed from in-memory module images
#[derive(Debug, Clone)]
pub struct SnapshotProcess {
    bitness: Bitness,
    modules: Vec<(ModuleInfo, Vec<u8>)>,
}

impl SnapshotProcess {
    pub fn new(bitness: Bitness) -> Self {
        Self {
            bitness,
            modules: Vec::new(),
        }
    }

    pub fn with_module(mut self, info: ModuleInfo, image: Vec<u8>) -> Self {
        self.add_module(info, image);
        self
    }

    pub fn add_module(&mut self, info: ModuleInfo, image: Vec<u8>) {
        self.modules.push((info, image));
    }
}

impl ProcessSource for SnapshotProcess {
    fn bitness(&self) -> Bitness {
        self.bitness
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, ProcessError> {
        Ok(self.modules.iter().map(|(info, _)| info.clone()).collect())
    }

    fn read_memory(&self, address: u64, size: usize) -> Result<MemorySnapshot, ProcessError> {
        let (info, image) = self
            .modules
            .iter()
            .find(|(info, _)| info.contains(address))
            .ok_or(ProcessError::Read { address, size })?;
        let start = (address - info.base) as usize;
        let mut bytes = vec![0u8; size];
        let available = image.len().saturating_sub(start).min(size);
        if available > 0 {
            bytes[..available].copy_from_slice(&image[start..start + available]);
        }
        let complete = available == size;
        if !complete {
            warn!(
                module = %info.path,
                address = format_args!("{:#x}", address + available as u64),
                missing = size - available,
                "partial module read"
            );
        }
        Ok(MemorySnapshot { bytes, complete })
    }
}
