//! Core PE data types and structures

use std::fmt;
use std::ops::Range;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// PE constants
pub const DOS_SIGNATURE: u16 = 0x5A4D; // MZ
pub const PE_SIGNATURE: [u8; 4] = *b"PE\0\0";
pub const PE32_MAGIC: u16 = 0x10B;
pub const PE32PLUS_MAGIC: u16 = 0x20B;

pub const MACHINE_I386: u16 = 0x014c;
pub const MACHINE_AMD64: u16 = 0x8664;

pub const PAGE_SIZE: u32 = 0x1000;

// Data directory indices
pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
pub const IMAGE_DIRECTORY_ENTRY_RESOURCE: usize = 2;
pub const IMAGE_DIRECTORY_ENTRY_EXCEPTION: usize = 3;
pub const IMAGE_DIRECTORY_ENTRY_SECURITY: usize = 4;
pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;
pub const IMAGE_DIRECTORY_ENTRY_DEBUG: usize = 6;
pub const IMAGE_DIRECTORY_ENTRY_TLS: usize = 9;
pub const IMAGE_DIRECTORY_ENTRY_IAT: usize = 12;
pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

// Fixed structure sizes
pub const COFF_HEADER_SIZE: usize = 20;
pub const SECTION_HEADER_SIZE: usize = 40;
pub const DATA_DIRECTORY_SIZE: usize = 8;
pub const IMPORT_DESCRIPTOR_SIZE: usize = 20;
pub const EXPORT_DIRECTORY_SIZE: usize = 40;

bitflags! {
    /// Section characteristics
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SectionFlags: u32 {
        const CNT_CODE = 0x0000_0020;
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        const MEM_DISCARDABLE = 0x0200_0000;
        const MEM_SHARED = 0x1000_0000;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
        const MEM_WRITE = 0x8000_0000;
    }
}

/// PE parsing and editing error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeError {
    #[error("Invalid DOS signature")]
    InvalidDosSignature,
    #[error("Invalid PE signature")]
    InvalidPeSignature,
    #[error("Invalid optional header magic: 0x{0:04x}")]
    InvalidMagic(u16),
    #[error("Bit-width mismatch: expected {expected}, image is {found}")]
    BitnessMismatch { expected: Bitness, found: Bitness },
    #[error("Truncated header: expected {expected} bytes, got {actual}")]
    TruncatedHeader { expected: usize, actual: usize },
    #[error("Access of {len} bytes at 0x{offset:x} exceeds buffer of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("Invalid RVA: 0x{rva:08x}")]
    InvalidRva { rva: u32 },
    #[error("Invalid file offset: 0x{offset:x}")]
    InvalidOffset { offset: usize },
    #[error("Section or file alignment is zero")]
    InvalidAlignment,
    #[error("Invalid section name: {0:?}")]
    InvalidSectionName(String),
    #[error("Section not found: {name}")]
    SectionNotFound { name: String },
    #[error("Data directory {index} not found")]
    DataDirectoryNotFound { index: usize },
    #[error("No room left in the section table")]
    SectionTableFull,
    #[error("Growing section {name} would overlap its successor")]
    SectionOverlap { name: String },
    #[error("Malformed import table")]
    MalformedImportTable,
    #[error("Malformed export table")]
    MalformedExportTable,
    #[error("Malformed relocation table")]
    MalformedRelocationTable,
    #[error("Invalid byte pattern: {0}")]
    InvalidPattern(String),
    #[error("Extension section has no free run of {needed} bytes left")]
    ExtensionExhausted { needed: usize },
    #[error("Invalid string encoding")]
    InvalidString,
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for PeError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PeError>;

/// Bit-width of an image, fixed for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bitness {
    X86,
    X64,
}

impl Bitness {
    /// Read the optional header magic of a raw image and report its width.
    pub fn detect(data: &[u8]) -> Result<Self> {
        let e_lfanew = data
            .get(0x3c..0x40)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or(PeError::TruncatedHeader {
                expected: 0x40,
                actual: data.len(),
            })? as usize;
        let magic_at = e_lfanew + 4 + COFF_HEADER_SIZE;
        let magic = data
            .get(magic_at..magic_at + 2)
            .and_then(|b| b.try_into().ok())
            .map(u16::from_le_bytes)
            .ok_or(PeError::TruncatedHeader {
                expected: magic_at + 2,
                actual: data.len(),
            })?;
        Self::from_magic(magic)
    }

    pub fn from_magic(magic: u16) -> Result<Self> {
        match magic {
            PE32_MAGIC => Ok(Self::X86),
            PE32PLUS_MAGIC => Ok(Self::X64),
            other => Err(PeError::InvalidMagic(other)),
        }
    }

    pub fn magic(self) -> u16 {
        match self {
            Self::X86 => PE32_MAGIC,
            Self::X64 => PE32PLUS_MAGIC,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            Self::X86 => 32,
            Self::X64 => 64,
        }
    }

    /// Size of a pointer / thunk in bytes
    pub fn word_size(self) -> usize {
        match self {
            Self::X86 => 4,
            Self::X64 => 8,
        }
    }

    pub fn ordinal_flag(self) -> u64 {
        match self {
            Self::X86 => 0x8000_0000,
            Self::X64 => 0x8000_0000_0000_0000,
        }
    }

    pub fn machine(self) -> u16 {
        match self {
            Self::X86 => MACHINE_I386,
            Self::X64 => MACHINE_AMD64,
        }
    }
}

impl fmt::Display for Bitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Data directory entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0 && self.size != 0
    }
}

/// Section header (40 bytes), read by value out of the image buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Build a fresh header with every pointer field zeroed.
    pub fn new(name: &str, characteristics: SectionFlags) -> Result<Self> {
        let raw = name.as_bytes();
        if raw.is_empty() || raw.len() > 8 {
            return Err(PeError::InvalidSectionName(name.to_string()));
        }
        let mut name_bytes = [0u8; 8];
        name_bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self {
            name: name_bytes,
            virtual_size: 0,
            virtual_address: 0,
            size_of_raw_data: 0,
            pointer_to_raw_data: 0,
            pointer_to_relocations: 0,
            pointer_to_linenumbers: 0,
            number_of_relocations: 0,
            number_of_linenumbers: 0,
            characteristics: characteristics.bits(),
        })
    }

    /// Get section name as string
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn flags(&self) -> SectionFlags {
        SectionFlags::from_bits_retain(self.characteristics)
    }

    /// Size the loader maps: `SizeOfRawData` when `VirtualSize` is zero.
    pub fn mapped_size(&self) -> u32 {
        if self.virtual_size == 0 {
            self.size_of_raw_data
        } else {
            self.virtual_size
        }
    }

    /// Check if RVA is within this section's virtual range
    pub fn contains_rva(&self, rva: u32) -> bool {
        self.virtual_range().contains(&rva)
    }

    /// Check if a file offset is within this section's raw data
    pub fn contains_offset(&self, offset: usize) -> bool {
        let start = self.pointer_to_raw_data as usize;
        offset >= start && offset < start + self.size_of_raw_data as usize
    }

    pub fn virtual_range(&self) -> Range<u32> {
        self.virtual_address..self.virtual_address.saturating_add(self.mapped_size())
    }

    pub fn raw_range(&self) -> Range<usize> {
        let start = self.pointer_to_raw_data as usize;
        start..start + self.size_of_raw_data as usize
    }

    pub fn is_executable(&self) -> bool {
        self.flags().contains(SectionFlags::MEM_EXECUTE)
    }

    pub fn is_readable(&self) -> bool {
        self.flags().contains(SectionFlags::MEM_READ)
    }

    pub fn is_writable(&self) -> bool {
        self.flags().contains(SectionFlags::MEM_WRITE)
    }
}

/// Machine types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    Unknown,
    I386,
    X86_64,
    Arm64,
    Other(u16),
}

impl From<u16> for Machine {
    fn from(value: u16) -> Self {
        match value {
            MACHINE_I386 => Self::I386,
            MACHINE_AMD64 => Self::X86_64,
            0xaa64 => Self::Arm64,
            0 => Self::Unknown,
            other => Self::Other(other),
        }
    }
}
