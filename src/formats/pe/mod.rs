//! Editable PE image over an owned byte buffer.
//!
//! [`Image`] never keeps a parsed copy of its headers: every accessor reads or
//! writes the fields directly in the buffer through a cached [`HeaderLayout`],
//! which is recomputed after any structural change (section append/extend).

use std::path::Path;

pub mod buffer;
pub mod builder;
pub mod directories;
pub mod headers;
pub mod pattern;
pub mod sections;
pub mod types;
pub mod utils;

pub use buffer::{ByteBuffer, Primitive};
pub use builder::ImageBuilder;
pub use directories::*;
pub use pattern::BytePattern;
pub use types::*;

use headers::{
    parse_layout, HeaderLayout, OptionalField, COFF_MACHINE, COFF_NUMBER_OF_SECTIONS,
};
use sections::{read_section_header, write_section_header};
use utils::{align_up, align_up_usize};

/// A 32- or 64-bit PE image in file or mapped (live memory) layout
#[derive(Debug, Clone)]
pub struct Image {
    buffer: ByteBuffer,
    layout: HeaderLayout,
    mapped: bool,
}

impl Image {
    /// Parse an on-disk image; the bit-width is taken from the header.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let buffer = ByteBuffer::from_vec(data);
        let layout = parse_layout(&buffer)?;
        Ok(Self {
            buffer,
            layout,
            mapped: false,
        })
    }

    /// Parse an on-disk image that must have the given bit-width.
    pub fn from_bytes_as(data: Vec<u8>, expected: Bitness) -> Result<Self> {
        let image = Self::from_bytes(data)?;
        image.expect_bitness(expected)?;
        Ok(image)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Parse a snapshot of a loaded module. Section raw pointers and sizes
    /// are rewritten to their virtual counterparts, so offsets equal RVAs.
    pub fn from_live_memory(data: Vec<u8>, expected: Bitness) -> Result<Self> {
        let mut image = Self::from_bytes_as(data, expected)?;
        image.set_mapped()?;
        Ok(image)
    }

    fn expect_bitness(&self, expected: Bitness) -> Result<()> {
        if self.layout.bitness != expected {
            return Err(PeError::BitnessMismatch {
                expected,
                found: self.layout.bitness,
            });
        }
        Ok(())
    }

    fn set_mapped(&mut self) -> Result<()> {
        for index in 0..self.number_of_sections() as usize {
            let mut header = self.section(index)?;
            header.pointer_to_raw_data = header.virtual_address;
            header.size_of_raw_data = header.mapped_size();
            self.write_section(index, &header)?;
        }
        self.mapped = true;
        Ok(())
    }

    /// Recompute header offsets after a structural mutation.
    fn validate(&mut self) -> Result<()> {
        self.layout = parse_layout(&self.buffer)?;
        Ok(())
    }

    // Buffer access

    pub fn bitness(&self) -> Bitness {
        self.layout.bitness
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn buffer(&self) -> &ByteBuffer {
        &self.buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer.into_inner()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn read<T: Primitive>(&self, offset: usize) -> Result<T> {
        self.buffer.read(offset)
    }

    pub fn write<T: Primitive>(&mut self, offset: usize, value: T) -> Result<()> {
        self.buffer.write(offset, value)
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.buffer.slice(offset, len)
    }

    /// Overwrite bytes in place (call-site patching, table edits)
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.buffer.copy_data(offset, bytes)
    }

    pub(crate) fn fill(&mut self, offset: usize, len: usize, value: u8) -> Result<()> {
        self.buffer.fill(offset, len, value)
    }

    // Header fields. The layout is validated on construction and the buffer
    // only ever grows, so header reads stay in range.

    fn header_u16(&self, offset: usize) -> u16 {
        self.buffer.read(offset).unwrap_or_default()
    }

    fn header_u32(&self, offset: usize) -> u32 {
        self.buffer.read(offset).unwrap_or_default()
    }

    fn optional_u32(&self, field: OptionalField) -> u32 {
        self.header_u32(self.layout.field_offset(field))
    }

    fn set_optional_u32(&mut self, field: OptionalField, value: u32) -> Result<()> {
        let offset = self.layout.field_offset(field);
        self.buffer.write(offset, value)
    }

    pub fn machine(&self) -> Machine {
        Machine::from(self.header_u16(self.layout.coff_offset + COFF_MACHINE))
    }

    pub fn number_of_sections(&self) -> u16 {
        self.header_u16(self.layout.coff_offset + COFF_NUMBER_OF_SECTIONS)
    }

    pub fn entry_point(&self) -> u32 {
        self.optional_u32(OptionalField::AddressOfEntryPoint)
    }

    pub fn image_base(&self) -> u64 {
        let offset = self.layout.field_offset(OptionalField::ImageBase);
        match self.layout.bitness {
            Bitness::X86 => self.header_u32(offset) as u64,
            Bitness::X64 => self.buffer.read::<u64>(offset).unwrap_or_default(),
        }
    }

    pub fn section_alignment(&self) -> u32 {
        self.optional_u32(OptionalField::SectionAlignment)
    }

    pub fn file_alignment(&self) -> u32 {
        self.optional_u32(OptionalField::FileAlignment)
    }

    pub fn size_of_image(&self) -> u32 {
        self.optional_u32(OptionalField::SizeOfImage)
    }

    pub fn size_of_headers(&self) -> u32 {
        self.optional_u32(OptionalField::SizeOfHeaders)
    }

    pub fn word_size(&self) -> usize {
        self.layout.bitness.word_size()
    }

    pub fn rva_to_va(&self, rva: u32) -> u64 {
        self.image_base().wrapping_add(rva as u64)
    }

    // Data directories

    pub fn data_directory(&self, index: usize) -> DataDirectory {
        match self.layout.data_directory_entry_offset(index) {
            Some(offset) => DataDirectory {
                virtual_address: self.header_u32(offset),
                size: self.header_u32(offset + 4),
            },
            None => DataDirectory::default(),
        }
    }

    pub fn has_data_directory(&self, index: usize) -> bool {
        self.data_directory(index).is_present()
    }

    pub fn set_data_directory(&mut self, index: usize, dir: DataDirectory) -> Result<()> {
        let offset = self
            .layout
            .data_directory_entry_offset(index)
            .ok_or(PeError::DataDirectoryNotFound { index })?;
        self.buffer.write(offset, dir.virtual_address)?;
        self.buffer.write(offset + 4, dir.size)
    }

    // Sections

    pub fn section(&self, index: usize) -> Result<SectionHeader> {
        if index >= self.number_of_sections() as usize {
            return Err(PeError::SectionNotFound {
                name: format!("#{index}"),
            });
        }
        read_section_header(&self.buffer, self.layout.section_header_offset(index))
    }

    fn write_section(&mut self, index: usize, header: &SectionHeader) -> Result<()> {
        let offset = self.layout.section_header_offset(index);
        write_section_header(&mut self.buffer, offset, header)
    }

    pub fn sections(&self) -> Result<Vec<SectionHeader>> {
        (0..self.number_of_sections() as usize)
            .map(|i| self.section(i))
            .collect()
    }

    fn find_section<F>(&self, pred: F) -> Option<(usize, SectionHeader)>
    where
        F: Fn(&SectionHeader) -> bool,
    {
        (0..self.number_of_sections() as usize)
            .filter_map(|i| self.section(i).ok().map(|s| (i, s)))
            .find(|(_, s)| pred(s))
    }

    /// Find section by exact name
    pub fn section_by_name(&self, name: &str) -> Option<SectionHeader> {
        self.find_section(|s| s.name() == name).map(|(_, s)| s)
    }

    pub fn section_by_rva(&self, rva: u32) -> Option<SectionHeader> {
        self.find_section(|s| s.contains_rva(rva)).map(|(_, s)| s)
    }

    pub fn section_by_offset(&self, offset: usize) -> Option<SectionHeader> {
        self.find_section(|s| s.contains_offset(offset))
            .map(|(_, s)| s)
    }

    /// Convert RVA to buffer offset; `None` outside every section
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        let section = self.section_by_rva(rva)?;
        Some(section.pointer_to_raw_data as usize + (rva - section.virtual_address) as usize)
    }

    /// Convert buffer offset to RVA; `None` outside every section
    pub fn offset_to_rva(&self, offset: usize) -> Option<u32> {
        let section = self.section_by_offset(offset)?;
        let delta = (offset - section.pointer_to_raw_data as usize) as u32;
        Some(section.virtual_address + delta)
    }

    pub fn read_at_rva<T: Primitive>(&self, rva: u32) -> Result<T> {
        let offset = self.rva_to_offset(rva).ok_or(PeError::InvalidRva { rva })?;
        self.buffer.read(offset)
    }

    pub fn write_at_rva<T: Primitive>(&mut self, rva: u32, value: T) -> Result<()> {
        let offset = self.rva_to_offset(rva).ok_or(PeError::InvalidRva { rva })?;
        self.buffer.write(offset, value)
    }

    /// Read a word-sized value (thunk) at `rva`
    pub fn read_word_at_rva(&self, rva: u32) -> Result<u64> {
        match self.layout.bitness {
            Bitness::X86 => self.read_at_rva::<u32>(rva).map(u64::from),
            Bitness::X64 => self.read_at_rva::<u64>(rva),
        }
    }

    pub fn write_word_at_rva(&mut self, rva: u32, value: u64) -> Result<()> {
        match self.layout.bitness {
            Bitness::X86 => self.write_at_rva::<u32>(rva, value as u32),
            Bitness::X64 => self.write_at_rva::<u64>(rva, value),
        }
    }

    pub fn read_cstr_at_rva(&self, rva: u32, max_len: usize) -> Result<&str> {
        let offset = self.rva_to_offset(rva).ok_or(PeError::InvalidRva { rva })?;
        self.buffer.read_cstr(offset, max_len)
    }

    fn alignments(&self) -> Result<(u32, u32)> {
        let (sa, fa) = (self.section_alignment(), self.file_alignment());
        if sa == 0 || fa == 0 {
            return Err(PeError::InvalidAlignment);
        }
        Ok((sa, fa))
    }

    /// Append a zero-filled section after the last one and return its header.
    pub fn append_section(
        &mut self,
        name: &str,
        size: u32,
        characteristics: SectionFlags,
    ) -> Result<SectionHeader> {
        let (sa, fa) = self.alignments()?;
        let mut header = SectionHeader::new(name, characteristics)?;
        let existing = self.sections()?;
        let count = existing.len();

        // The new table entry must fit before the first section's data.
        let entry_end = self.layout.section_header_offset(count + 1);
        let first_data = existing
            .iter()
            .filter(|s| s.size_of_raw_data != 0)
            .map(|s| s.pointer_to_raw_data as usize)
            .min()
            .unwrap_or(usize::MAX);
        if entry_end > self.size_of_headers() as usize || entry_end > first_data {
            return Err(PeError::SectionTableFull);
        }

        let next_rva = existing
            .iter()
            .map(|s| s.virtual_address.saturating_add(s.virtual_size.max(s.size_of_raw_data)))
            .max()
            .unwrap_or(self.size_of_headers());
        let next_rva = align_up(next_rva, sa);

        let virtual_size = align_up(size, sa);
        header.virtual_address = next_rva;
        header.virtual_size = virtual_size;
        if self.mapped {
            header.pointer_to_raw_data = next_rva;
            header.size_of_raw_data = virtual_size;
        } else {
            let next_offset = existing
                .iter()
                .map(|s| s.pointer_to_raw_data.saturating_add(s.size_of_raw_data))
                .max()
                .unwrap_or(self.size_of_headers());
            header.pointer_to_raw_data = align_up(next_offset, fa);
            header.size_of_raw_data = align_up(size, fa);
        }

        self.write_section(count, &header)?;
        self.buffer.write(
            self.layout.coff_offset + COFF_NUMBER_OF_SECTIONS,
            (count + 1) as u16,
        )?;
        let image_end = align_up(next_rva + virtual_size, sa);
        if image_end > self.size_of_image() {
            self.set_optional_u32(OptionalField::SizeOfImage, image_end)?;
        }

        let zeroes = vec![0u8; header.size_of_raw_data as usize];
        self.buffer
            .insert_data(header.pointer_to_raw_data as usize, &zeroes);

        self.validate()?;
        tracing::debug!(
            section = name,
            rva = format_args!("{:#x}", header.virtual_address),
            size = header.virtual_size,
            "appended section"
        );
        Ok(header)
    }

    /// Grow an existing section by `delta` bytes of zeroes.
    ///
    /// In file layout the bytes are spliced in at the section's raw end and
    /// every later raw pointer shifts; in mapped layout the section grows in
    /// place. Growth that would run into the next section's virtual range is
    /// rejected.
    pub fn extend_section(&mut self, name: &str, delta: u32) -> Result<SectionHeader> {
        let (sa, _) = self.alignments()?;
        let (index, mut header) = self
            .find_section(|s| s.name() == name)
            .ok_or_else(|| PeError::SectionNotFound {
                name: name.to_string(),
            })?;
        if delta == 0 {
            return Ok(header);
        }

        let new_virtual_size = header.virtual_size.saturating_add(delta);
        let new_virtual_end = align_up(header.virtual_address.saturating_add(new_virtual_size), sa);
        let successor = self
            .sections()?
            .into_iter()
            .filter(|s| s.virtual_address > header.virtual_address)
            .map(|s| s.virtual_address)
            .min();
        if successor.is_some_and(|next| new_virtual_end > next) {
            return Err(PeError::SectionOverlap {
                name: name.to_string(),
            });
        }

        let old_raw_end = header.pointer_to_raw_data as usize + header.size_of_raw_data as usize;
        if self.mapped {
            let needed = old_raw_end + delta as usize;
            if needed > self.buffer.len() {
                self.buffer.resize(needed);
            }
            self.buffer.fill(old_raw_end, delta as usize, 0)?;
        } else {
            self.buffer
                .insert_data(old_raw_end, &vec![0u8; delta as usize]);
            for other in 0..self.number_of_sections() as usize {
                if other == index {
                    continue;
                }
                let mut s = self.section(other)?;
                if s.size_of_raw_data != 0 && s.pointer_to_raw_data as usize >= old_raw_end {
                    s.pointer_to_raw_data += delta;
                    self.write_section(other, &s)?;
                }
            }
        }

        header.size_of_raw_data += delta;
        header.virtual_size = new_virtual_size;
        self.write_section(index, &header)?;

        for dir_index in 0..self.layout.number_of_rva_and_sizes {
            let mut dir = self.data_directory(dir_index);
            if dir.virtual_address != 0 && dir.virtual_address == header.virtual_address {
                dir.size = header.virtual_size;
                self.set_data_directory(dir_index, dir)?;
                break;
            }
        }

        if new_virtual_end > self.size_of_image() {
            self.set_optional_u32(OptionalField::SizeOfImage, new_virtual_end)?;
        }

        self.validate()?;
        Ok(header)
    }

    /// Find an aligned run of `n` bytes equal to `fill`.
    ///
    /// With a section, the first run inside its raw data is returned. Without
    /// one, the last section is searched from its end downwards and the
    /// highest run wins. `n` is rounded up to `alignment`.
    pub fn find_padding(
        &self,
        section: Option<&SectionHeader>,
        fill: u8,
        n: usize,
        alignment: usize,
    ) -> Option<usize> {
        let alignment = alignment.max(1);
        let n = align_up_usize(n.max(1), alignment);
        let data = self.buffer.as_slice();

        let (scan_up, range) = match section {
            Some(s) => (true, s.raw_range()),
            None => {
                let last = self
                    .sections()
                    .ok()?
                    .into_iter()
                    .max_by_key(|s| s.pointer_to_raw_data)?;
                (false, last.raw_range())
            }
        };
        let end = range.end.min(data.len());
        let start = range.start;
        if start >= end || end - start < n {
            return None;
        }

        if scan_up {
            let mut pos = align_up_usize(start, alignment);
            while pos + n <= end {
                match data[pos..pos + n].iter().position(|&b| b != fill) {
                    None => return Some(pos),
                    Some(bad) => {
                        let from = pos + bad + 1;
                        let next = memchr::memchr(fill, &data[from..end])?;
                        pos = align_up_usize(from + next, alignment);
                    }
                }
            }
            None
        } else {
            let mut pos = (end - n) / alignment * alignment;
            loop {
                if pos < start {
                    return None;
                }
                if data[pos..pos + n].iter().all(|&b| b == fill) {
                    return Some(pos);
                }
                pos = pos.checked_sub(alignment)?;
            }
        }
    }

    pub fn find_zero_padding(
        &self,
        section: Option<&SectionHeader>,
        n: usize,
        alignment: usize,
    ) -> Option<usize> {
        self.find_padding(section, 0, n, alignment)
    }

    fn section_bytes(&self, section: &SectionHeader) -> (usize, &[u8]) {
        let range = section.raw_range();
        let data = self.buffer.as_slice();
        let end = range.end.min(data.len());
        let start = range.start.min(end);
        (start, &data[start..end])
    }

    /// Buffer offsets of every non-overlapping match of `pattern` within the
    /// section's raw data.
    pub fn find_binary_sequence(
        &self,
        section: &SectionHeader,
        pattern: &str,
    ) -> Result<Vec<usize>> {
        let pattern = BytePattern::parse(pattern)?;
        let (base, bytes) = self.section_bytes(section);
        Ok(pattern
            .find_all(bytes)
            .into_iter()
            .map(|at| base + at)
            .collect())
    }

    /// Scan for several tagged patterns at once. At each position the first
    /// matching pattern wins and scanning resumes after it.
    pub fn find_binary_sequences<T: Copy>(
        &self,
        section: &SectionHeader,
        patterns: &[(T, &str)],
    ) -> Result<Vec<(T, usize)>> {
        let parsed = patterns
            .iter()
            .map(|(tag, p)| BytePattern::parse(p).map(|bp| (*tag, bp)))
            .collect::<Result<Vec<_>>>()?;
        let (base, bytes) = self.section_bytes(section);
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            match parsed.iter().find(|(_, p)| p.matches_at(bytes, pos)) {
                Some((tag, p)) => {
                    out.push((*tag, base + pos));
                    pos += p.len();
                }
                None => pos += 1,
            }
        }
        Ok(out)
    }

    /// Write the buffer verbatim
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.buffer.as_slice())?;
        Ok(())
    }

    // Directory views

    pub fn export_directory(&self) -> ExportDirectory<'_> {
        ExportDirectory::new(self)
    }

    pub fn import_directory(&self) -> ImportDirectory<'_> {
        ImportDirectory::new(self)
    }

    pub fn import_directory_mut(&mut self) -> ImportEditor<'_> {
        ImportEditor::new(self)
    }

    pub fn relocation_directory(&self) -> RelocationDirectory<'_> {
        RelocationDirectory::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bitness: Bitness) -> ImageBuilder {
        ImageBuilder::new(bitness)
            .with_image_base(0x40_0000)
            .with_section(
                ".text",
                SectionFlags::CNT_CODE | SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ,
                vec![0x90; 0x300],
            )
            .with_section(
                ".data",
                SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_READ,
                vec![0x11; 0x80],
            )
    }

    #[test]
    fn parses_built_image() {
        let image = sample(Bitness::X86).build_image().unwrap();
        assert_eq!(image.bitness(), Bitness::X86);
        assert_eq!(image.machine(), Machine::I386);
        assert_eq!(image.image_base(), 0x40_0000);
        assert_eq!(image.number_of_sections(), 2);
        let text = image.section_by_name(".text").unwrap();
        assert_eq!(text.virtual_address, 0x1000);
        assert_eq!(text.pointer_to_raw_data, 0x400);
        assert!(image.section_by_name(".nope").is_none());
    }

    #[test]
    fn bitness_mismatch_is_rejected() {
        let bytes = sample(Bitness::X64).build().unwrap();
        assert_eq!(
            Image::from_bytes_as(bytes, Bitness::X86).unwrap_err(),
            PeError::BitnessMismatch {
                expected: Bitness::X86,
                found: Bitness::X64
            }
        );
    }

    #[test]
    fn rva_offset_conversion() {
        let image = sample(Bitness::X64).build_image().unwrap();
        assert_eq!(image.rva_to_offset(0x1000), Some(0x400));
        assert_eq!(image.rva_to_offset(0x1010), Some(0x410));
        assert_eq!(image.offset_to_rva(0x410), Some(0x1010));
        // header bytes and gaps belong to no section
        assert_eq!(image.rva_to_offset(0x10), None);
        assert_eq!(image.offset_to_rva(0x10), None);
        assert_eq!(image.rva_to_offset(0x9_0000), None);
    }

    #[test]
    fn live_memory_offsets_equal_rvas() {
        let bytes = sample(Bitness::X64).build_mapped().unwrap();
        let image = Image::from_live_memory(bytes, Bitness::X64).unwrap();
        assert!(image.is_mapped());
        let text = image.section_by_name(".text").unwrap();
        assert_eq!(text.pointer_to_raw_data, text.virtual_address);
        assert_eq!(text.size_of_raw_data, text.virtual_size);
        assert_eq!(image.rva_to_offset(0x1234), Some(0x1234));
        assert_eq!(image.read::<u8>(0x1000).unwrap(), 0x90);
    }

    #[test]
    fn append_section_in_file_layout() {
        let mut image = sample(Bitness::X86).build_image().unwrap();
        let before = image.len();
        let data = image.section_by_name(".data").unwrap();
        let sec = image
            .append_section(".vmpfix", 0x1800, SectionFlags::MEM_READ)
            .unwrap();
        assert_eq!(image.number_of_sections(), 3);
        assert_eq!(sec.virtual_address, 0x3000);
        assert_eq!(sec.virtual_size, 0x2000);
        assert_eq!(sec.size_of_raw_data, 0x1800);
        assert_eq!(
            sec.pointer_to_raw_data,
            data.pointer_to_raw_data + data.size_of_raw_data
        );
        assert_eq!(image.len(), before + 0x1800);
        assert_eq!(image.size_of_image(), 0x5000);
        assert_eq!(image.section_by_name(".vmpfix"), Some(sec));
        assert!(image
            .read_bytes(sec.pointer_to_raw_data as usize, 0x1800)
            .unwrap()
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn append_section_in_mapped_layout() {
        let bytes = sample(Bitness::X64).build_mapped().unwrap();
        let mut image = Image::from_live_memory(bytes, Bitness::X64).unwrap();
        let sec = image
            .append_section(".vmpfix", 0x100, SectionFlags::MEM_READ)
            .unwrap();
        assert_eq!(sec.pointer_to_raw_data, sec.virtual_address);
        assert_eq!(image.rva_to_offset(sec.virtual_address + 4), Some(sec.virtual_address as usize + 4));
        assert!(image.len() >= (sec.virtual_address + sec.virtual_size) as usize);
    }

    #[test]
    fn extend_section_shifts_later_sections() {
        let mut image = sample(Bitness::X86).build_image().unwrap();
        let data_before = image.section_by_name(".data").unwrap();
        let first_data_byte = image.read::<u8>(data_before.pointer_to_raw_data as usize).unwrap();
        // .text virtual range ends at 0x1300 and .data starts at 0x2000
        let text = image.extend_section(".text", 0x200).unwrap();
        assert_eq!(text.size_of_raw_data, 0x600);
        assert_eq!(text.virtual_size, 0x500);
        let data_after = image.section_by_name(".data").unwrap();
        assert_eq!(
            data_after.pointer_to_raw_data,
            data_before.pointer_to_raw_data + 0x200
        );
        assert_eq!(
            image.read::<u8>(data_after.pointer_to_raw_data as usize).unwrap(),
            first_data_byte
        );
    }

    #[test]
    fn extend_section_rejects_overlap() {
        let mut image = sample(Bitness::X86).build_image().unwrap();
        assert_eq!(
            image.extend_section(".text", 0x2000).unwrap_err(),
            PeError::SectionOverlap {
                name: ".text".into()
            }
        );
        assert!(matches!(
            image.extend_section(".missing", 1),
            Err(PeError::SectionNotFound { .. })
        ));
    }

    #[test]
    fn padding_search_is_first_fit_and_aligned() {
        let mut image = sample(Bitness::X64).build_image().unwrap();
        let sec = image
            .append_section(".pad", 0x200, SectionFlags::MEM_READ)
            .unwrap();
        let base = sec.pointer_to_raw_data as usize;
        image.fill(base, 0x200, 0xCC).unwrap();
        image.write::<u8>(base + 3, 0).unwrap();

        assert_eq!(image.find_padding(Some(&sec), 0xCC, 3, 1), Some(base));
        assert_eq!(image.find_padding(Some(&sec), 0xCC, 4, 1), Some(base + 4));
        assert_eq!(image.find_padding(Some(&sec), 0xCC, 16, 8), Some(base + 8));
        assert_eq!(image.find_padding(Some(&sec), 0xCC, 0x201, 1), None);
        assert_eq!(image.find_padding(Some(&sec), 0xAB, 1, 1), None);
        // from the end of the last section
        assert_eq!(image.find_padding(None, 0xCC, 16, 8), Some(base + 0x200 - 16));
    }

    #[test]
    fn binary_sequences_in_section() {
        let code = vec![0x90, 0xE8, 1, 0, 0, 0, 0xCC, 0xFF, 0x15, 0, 0, 0, 0];
        let image = ImageBuilder::new(Bitness::X64)
            .with_section(".text", SectionFlags::MEM_EXECUTE, code)
            .build_image()
            .unwrap();
        let text = image.section_by_name(".text").unwrap();
        let base = text.pointer_to_raw_data as usize;
        assert_eq!(
            image.find_binary_sequence(&text, "E8 ? ? ? ?").unwrap(),
            vec![base + 1]
        );
        assert!(image.find_binary_sequence(&text, "E9 ? ? ? ?").unwrap().is_empty());
        let tagged = image
            .find_binary_sequences(&text, &[(1, "E8 ? ? ? ?"), (2, "FF 15 ? ? ? ?")])
            .unwrap();
        assert_eq!(tagged, vec![(1, base + 1), (2, base + 7)]);
    }
}
