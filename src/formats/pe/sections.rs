//! Section table access

use crate::formats::pe::buffer::ByteBuffer;
use crate::formats::pe::types::*;

/// Read the 40-byte section header stored at `offset`
pub fn read_section_header(buf: &ByteBuffer, offset: usize) -> Result<SectionHeader> {
    let mut name = [0u8; 8];
    name.copy_from_slice(buf.slice(offset, 8)?);
    Ok(SectionHeader {
        name,
        virtual_size: buf.read(offset + 8)?,
        virtual_address: buf.read(offset + 12)?,
        size_of_raw_data: buf.read(offset + 16)?,
        pointer_to_raw_data: buf.read(offset + 20)?,
        pointer_to_relocations: buf.read(offset + 24)?,
        pointer_to_linenumbers: buf.read(offset + 28)?,
        number_of_relocations: buf.read(offset + 32)?,
        number_of_linenumbers: buf.read(offset + 34)?,
        characteristics: buf.read(offset + 36)?,
    })
}

/// Store a section header at `offset`
pub fn write_section_header(
    buf: &mut ByteBuffer,
    offset: usize,
    header: &SectionHeader,
) -> Result<()> {
    buf.copy_data(offset, &header.name)?;
    buf.write(offset + 8, header.virtual_size)?;
    buf.write(offset + 12, header.virtual_address)?;
    buf.write(offset + 16, header.size_of_raw_data)?;
    buf.write(offset + 20, header.pointer_to_raw_data)?;
    buf.write(offset + 24, header.pointer_to_relocations)?;
    buf.write(offset + 28, header.pointer_to_linenumbers)?;
    buf.write(offset + 32, header.number_of_relocations)?;
    buf.write(offset + 34, header.number_of_linenumbers)?;
    buf.write(offset + 36, header.characteristics)?;
    Ok(())
}
