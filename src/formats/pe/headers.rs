//! PE header layout discovery and field offsets.
//!
//! Nothing here copies header contents out of the buffer; the layout only
//! records where each structure lives so accessors can read and write the
//! fields in place.

use crate::formats::pe::buffer::ByteBuffer;
use crate::formats::pe::types::*;

const E_LFANEW_OFFSET: usize = 0x3c;
const OPTIONAL_HEADER32_MIN: usize = 96;
const OPTIONAL_HEADER64_MIN: usize = 112;

// COFF header field offsets
pub const COFF_MACHINE: usize = 0;
pub const COFF_NUMBER_OF_SECTIONS: usize = 2;
pub const COFF_SIZE_OF_OPTIONAL_HEADER: usize = 16;

/// Fields of the optional header the editor touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionalField {
    Magic,
    AddressOfEntryPoint,
    ImageBase,
    SectionAlignment,
    FileAlignment,
    SizeOfImage,
    SizeOfHeaders,
    NumberOfRvaAndSizes,
}

impl OptionalField {
    /// Offset relative to the start of the optional header
    pub fn offset(self, bitness: Bitness) -> usize {
        match (self, bitness) {
            (Self::Magic, _) => 0,
            (Self::AddressOfEntryPoint, _) => 16,
            (Self::ImageBase, Bitness::X86) => 28,
            (Self::ImageBase, Bitness::X64) => 24,
            (Self::SectionAlignment, _) => 32,
            (Self::FileAlignment, _) => 36,
            (Self::SizeOfImage, _) => 56,
            (Self::SizeOfHeaders, _) => 60,
            (Self::NumberOfRvaAndSizes, Bitness::X86) => 92,
            (Self::NumberOfRvaAndSizes, Bitness::X64) => 108,
        }
    }
}

/// Cached offsets of every header structure inside the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    pub e_lfanew: usize,
    pub coff_offset: usize,
    pub optional_offset: usize,
    pub size_of_optional_header: usize,
    pub section_table_offset: usize,
    pub data_directory_offset: usize,
    pub number_of_rva_and_sizes: usize,
    pub bitness: Bitness,
}

impl HeaderLayout {
    pub fn field_offset(&self, field: OptionalField) -> usize {
        self.optional_offset + field.offset(self.bitness)
    }

    pub fn section_header_offset(&self, index: usize) -> usize {
        self.section_table_offset + index * SECTION_HEADER_SIZE
    }

    pub fn data_directory_entry_offset(&self, index: usize) -> Option<usize> {
        (index < self.number_of_rva_and_sizes)
            .then(|| self.data_directory_offset + index * DATA_DIRECTORY_SIZE)
    }
}

/// Validate signatures and locate the header structures.
pub fn parse_layout(buf: &ByteBuffer) -> Result<HeaderLayout> {
    if buf.len() < 64 {
        return Err(PeError::TruncatedHeader {
            expected: 64,
            actual: buf.len(),
        });
    }
    if buf.read::<u16>(0)? != DOS_SIGNATURE {
        return Err(PeError::InvalidDosSignature);
    }

    let e_lfanew = buf.read::<u32>(E_LFANEW_OFFSET)? as usize;
    let signature = buf
        .slice(e_lfanew, 4)
        .map_err(|_| PeError::TruncatedHeader {
            expected: e_lfanew + 4,
            actual: buf.len(),
        })?;
    if signature != PE_SIGNATURE {
        return Err(PeError::InvalidPeSignature);
    }

    let coff_offset = e_lfanew + 4;
    if coff_offset + COFF_HEADER_SIZE > buf.len() {
        return Err(PeError::TruncatedHeader {
            expected: coff_offset + COFF_HEADER_SIZE,
            actual: buf.len(),
        });
    }
    let size_of_optional_header =
        buf.read::<u16>(coff_offset + COFF_SIZE_OF_OPTIONAL_HEADER)? as usize;
    let optional_offset = coff_offset + COFF_HEADER_SIZE;

    let magic = buf
        .read::<u16>(optional_offset)
        .map_err(|_| PeError::TruncatedHeader {
            expected: optional_offset + 2,
            actual: buf.len(),
        })?;
    let bitness = Bitness::from_magic(magic)?;

    let (minimum, directories_at) = match bitness {
        Bitness::X86 => (OPTIONAL_HEADER32_MIN, OPTIONAL_HEADER32_MIN),
        Bitness::X64 => (OPTIONAL_HEADER64_MIN, OPTIONAL_HEADER64_MIN),
    };
    if size_of_optional_header < minimum || optional_offset + minimum > buf.len() {
        return Err(PeError::TruncatedHeader {
            expected: optional_offset + minimum,
            actual: optional_offset + size_of_optional_header.min(buf.len()),
        });
    }

    let declared = buf.read::<u32>(
        optional_offset + OptionalField::NumberOfRvaAndSizes.offset(bitness),
    )? as usize;
    // Only directories that fit in the declared optional header are usable.
    let room = (size_of_optional_header - directories_at) / DATA_DIRECTORY_SIZE;
    let number_of_rva_and_sizes = declared
        .min(room)
        .min(IMAGE_NUMBEROF_DIRECTORY_ENTRIES);

    let layout = HeaderLayout {
        e_lfanew,
        coff_offset,
        optional_offset,
        size_of_optional_header,
        section_table_offset: optional_offset + size_of_optional_header,
        data_directory_offset: optional_offset + directories_at,
        number_of_rva_and_sizes,
        bitness,
    };

    let sections = buf.read::<u16>(coff_offset + COFF_NUMBER_OF_SECTIONS)? as usize;
    let table_end = layout.section_header_offset(sections);
    if table_end > buf.len() {
        return Err(PeError::TruncatedHeader {
            expected: table_end,
            actual: buf.len(),
        });
    }

    Ok(layout)
}
