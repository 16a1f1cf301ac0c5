//! Builder for synthesizing small PE images.
//!
//! Produces well-formed 32- or 64-bit images with arbitrary sections plus an
//! optional export table and import table. Output can be laid out as on disk
//! ([`ImageBuilder::build`]) or as a loaded module snapshot
//! ([`ImageBuilder::build_mapped`]).

use crate::formats::pe::buffer::ByteBuffer;
use crate::formats::pe::directories::ImportSymbol;
use crate::formats::pe::headers::OptionalField;
use crate::formats::pe::sections::write_section_header;
use crate::formats::pe::types::*;
use crate::formats::pe::utils::align_up;
use crate::formats::pe::Image;

const E_LFANEW: usize = 0x80;
const SPARE_SECTION_ENTRIES: usize = 4;

#[derive(Debug, Clone)]
struct SectionDef {
    name: String,
    flags: SectionFlags,
    data: Vec<u8>,
    virtual_size: u32,
}

#[derive(Debug, Clone)]
struct ExportDef {
    module_name: String,
    ordinal_base: u32,
    functions: Vec<(String, u32)>,
}

/// Builder for constructing [`Image`] instances and raw PE bytes.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    bitness: Bitness,
    image_base: u64,
    entry_point: u32,
    section_alignment: u32,
    file_alignment: u32,
    sections: Vec<SectionDef>,
    exports: Option<ExportDef>,
    imports: Vec<(String, Vec<ImportSymbol>)>,
}

struct Placed {
    header: SectionHeader,
    data: Vec<u8>,
}

/// Next free virtual address and file offset while laying out sections
struct Cursor {
    rva: u32,
    offset: u32,
    section_alignment: u32,
    file_alignment: u32,
}

impl Cursor {
    fn place(&mut self, def: SectionDef) -> Result<Placed> {
        let mut header = SectionHeader::new(&def.name, def.flags)?;
        header.virtual_address = self.rva;
        header.virtual_size = def.virtual_size;
        header.pointer_to_raw_data = self.offset;
        header.size_of_raw_data = align_up(def.data.len() as u32, self.file_alignment);
        self.rva = align_up(
            self.rva + def.virtual_size.max(header.size_of_raw_data),
            self.section_alignment,
        );
        self.offset += header.size_of_raw_data;
        Ok(Placed {
            header,
            data: def.data,
        })
    }
}

impl ImageBuilder {
    /// Creates a new builder with conventional defaults.
    pub fn new(bitness: Bitness) -> Self {
        Self {
            bitness,
            image_base: match bitness {
                Bitness::X86 => 0x40_0000,
                Bitness::X64 => 0x1_4000_0000,
            },
            entry_point: 0,
            section_alignment: PAGE_SIZE,
            file_alignment: 0x200,
            sections: Vec::new(),
            exports: None,
            imports: Vec::new(),
        }
    }

    /// Sets the preferred load address.
    pub fn with_image_base(mut self, image_base: u64) -> Self {
        self.image_base = image_base;
        self
    }

    pub fn with_entry_point(mut self, rva: u32) -> Self {
        self.entry_point = rva;
        self
    }

    pub fn with_alignments(mut self, section_alignment: u32, file_alignment: u32) -> Self {
        self.section_alignment = section_alignment;
        self.file_alignment = file_alignment;
        self
    }

    /// Adds a section whose virtual size equals its data length.
    pub fn with_section<S: Into<String>>(self, name: S, flags: SectionFlags, data: Vec<u8>) -> Self {
        let size = data.len() as u32;
        self.with_section_sized(name, flags, data, size)
    }

    /// Adds a section with an explicit virtual size (at least the data length).
    pub fn with_section_sized<S: Into<String>>(
        mut self,
        name: S,
        flags: SectionFlags,
        data: Vec<u8>,
        virtual_size: u32,
    ) -> Self {
        let virtual_size = virtual_size.max(data.len() as u32);
        self.sections.push(SectionDef {
            name: name.into(),
            flags,
            data,
            virtual_size,
        });
        self
    }

    /// Adds an `.edata` section exporting `functions` (name, RVA) in
    /// ordinal order starting at ordinal 1.
    pub fn with_exports<S: Into<String>>(mut self, module_name: S, functions: Vec<(String, u32)>) -> Self {
        self.exports = Some(ExportDef {
            module_name: module_name.into(),
            ordinal_base: 1,
            functions,
        });
        self
    }

    pub fn with_export_ordinal_base(mut self, base: u32) -> Self {
        if let Some(exports) = self.exports.as_mut() {
            exports.ordinal_base = base;
        }
        self
    }

    /// Adds one descriptor importing `symbols` from `module`, placed in `.idata`.
    pub fn with_import<S: Into<String>>(mut self, module: S, symbols: Vec<ImportSymbol>) -> Self {
        self.imports.push((module.into(), symbols));
        self
    }

    fn optional_header_size(&self) -> usize {
        match self.bitness {
            Bitness::X86 => 96 + IMAGE_NUMBEROF_DIRECTORY_ENTRIES * DATA_DIRECTORY_SIZE,
            Bitness::X64 => 112 + IMAGE_NUMBEROF_DIRECTORY_ENTRIES * DATA_DIRECTORY_SIZE,
        }
    }

    fn total_sections(&self) -> usize {
        self.sections.len()
            + usize::from(self.exports.is_some())
            + usize::from(!self.imports.is_empty())
    }

    fn size_of_headers(&self) -> u32 {
        let table = E_LFANEW + 4 + COFF_HEADER_SIZE + self.optional_header_size();
        let end = table + (self.total_sections() + SPARE_SECTION_ENTRIES) * SECTION_HEADER_SIZE;
        align_up(end as u32, self.file_alignment)
    }

    /// Assign addresses to every section, generating export/import payloads.
    fn place(&self) -> Result<(Vec<Placed>, Vec<(usize, DataDirectory)>)> {
        if self.section_alignment == 0 || self.file_alignment == 0 {
            return Err(PeError::InvalidAlignment);
        }
        let headers = self.size_of_headers();
        let mut cursor = Cursor {
            rva: align_up(headers, self.section_alignment),
            offset: headers,
            section_alignment: self.section_alignment,
            file_alignment: self.file_alignment,
        };
        let mut placed = Vec::new();
        let mut directories = Vec::new();

        for def in &self.sections {
            placed.push(cursor.place(def.clone())?);
        }

        if let Some(exports) = &self.exports {
            let rva = cursor.rva;
            let data = self.export_payload(exports, rva)?;
            let size = data.len() as u32;
            placed.push(cursor.place(SectionDef {
                name: ".edata".into(),
                flags: SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_READ,
                virtual_size: size,
                data,
            })?);
            directories.push((
                IMAGE_DIRECTORY_ENTRY_EXPORT,
                DataDirectory {
                    virtual_address: rva,
                    size,
                },
            ));
        }

        if !self.imports.is_empty() {
            let rva = cursor.rva;
            let data = self.import_payload(rva)?;
            let size = data.len() as u32;
            placed.push(cursor.place(SectionDef {
                name: ".idata".into(),
                flags: SectionFlags::CNT_INITIALIZED_DATA
                    | SectionFlags::MEM_READ
                    | SectionFlags::MEM_WRITE,
                virtual_size: size,
                data,
            })?);
            directories.push((
                IMAGE_DIRECTORY_ENTRY_IMPORT,
                DataDirectory {
                    virtual_address: rva,
                    size: ((self.imports.len() + 1) * IMPORT_DESCRIPTOR_SIZE) as u32,
                },
            ));
        }

        Ok((placed, directories))
    }

    fn export_payload(&self, def: &ExportDef, base_rva: u32) -> Result<Vec<u8>> {
        let count = def.functions.len();
        let functions_at = EXPORT_DIRECTORY_SIZE;
        let names_at = functions_at + count * 4;
        let ordinals_at = names_at + count * 4;
        let strings_at = ordinals_at + count * 2;

        // Name pointer table must be sorted; ordinals index the function table.
        let mut by_name: Vec<(usize, &str)> = def
            .functions
            .iter()
            .enumerate()
            .map(|(i, (n, _))| (i, n.as_str()))
            .collect();
        by_name.sort_by(|a, b| a.1.cmp(b.1));

        let mut strings = Vec::new();
        let module_name_rva = base_rva + strings_at as u32;
        strings.extend_from_slice(def.module_name.as_bytes());
        strings.push(0);

        let mut name_rvas = Vec::with_capacity(count);
        for (_, name) in &by_name {
            name_rvas.push(base_rva + (strings_at + strings.len()) as u32);
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
        }

        let mut out = ByteBuffer::zeroed(strings_at);
        out.write::<u32>(12, module_name_rva)?;
        out.write::<u32>(16, def.ordinal_base)?;
        out.write::<u32>(20, count as u32)?;
        out.write::<u32>(24, count as u32)?;
        out.write::<u32>(28, base_rva + functions_at as u32)?;
        out.write::<u32>(32, base_rva + names_at as u32)?;
        out.write::<u32>(36, base_rva + ordinals_at as u32)?;
        for (i, (_, rva)) in def.functions.iter().enumerate() {
            out.write::<u32>(functions_at + i * 4, *rva)?;
        }
        for (slot, ((index, _), name_rva)) in by_name.iter().zip(&name_rvas).enumerate() {
            out.write::<u32>(names_at + slot * 4, *name_rva)?;
            out.write::<u16>(ordinals_at + slot * 2, *index as u16)?;
        }

        let mut bytes = out.into_inner();
        bytes.extend_from_slice(&strings);
        Ok(bytes)
    }

    fn write_word(&self, out: &mut ByteBuffer, at: usize, value: u64) -> Result<()> {
        match self.bitness {
            Bitness::X86 => out.write::<u32>(at, value as u32),
            Bitness::X64 => out.write::<u64>(at, value),
        }
    }

    fn import_payload(&self, base_rva: u32) -> Result<Vec<u8>> {
        let word = self.bitness.word_size();
        let descriptors_len = (self.imports.len() + 1) * IMPORT_DESCRIPTOR_SIZE;
        let mut out = ByteBuffer::zeroed(descriptors_len);

        for (index, (module, symbols)) in self.imports.iter().enumerate() {
            let thunk_len = (symbols.len() + 1) * word;
            let oft = out.len();
            let iat = oft + thunk_len;
            out.resize(iat + thunk_len);

            for (i, symbol) in symbols.iter().enumerate() {
                let value = match symbol {
                    ImportSymbol::Ordinal(ordinal) => {
                        self.bitness.ordinal_flag() | u64::from(*ordinal)
                    }
                    ImportSymbol::Name(name) => {
                        let at = out.len();
                        let mut entry = vec![0u8, 0u8];
                        entry.extend_from_slice(name.as_bytes());
                        entry.push(0);
                        if entry.len() % 2 == 1 {
                            entry.push(0);
                        }
                        out.insert_data(at, &entry);
                        (base_rva as usize + at) as u64
                    }
                };
                self.write_word(&mut out, oft + i * word, value)?;
                self.write_word(&mut out, iat + i * word, value)?;
            }

            let name_at = out.len();
            let mut name = module.as_bytes().to_vec();
            name.push(0);
            out.insert_data(name_at, &name);

            let desc = index * IMPORT_DESCRIPTOR_SIZE;
            out.write::<u32>(desc, base_rva + oft as u32)?;
            out.write::<u32>(desc + 12, base_rva + name_at as u32)?;
            out.write::<u32>(desc + 16, base_rva + iat as u32)?;
        }
        Ok(out.into_inner())
    }

    fn write_headers(&self, buf: &mut ByteBuffer, placed: &[Placed], dirs: &[(usize, DataDirectory)]) -> Result<()> {
        let coff = E_LFANEW + 4;
        let opt = coff + COFF_HEADER_SIZE;
        let opt_size = self.optional_header_size();

        buf.write::<u16>(0, DOS_SIGNATURE)?;
        buf.write::<u32>(0x3c, E_LFANEW as u32)?;
        buf.copy_data(E_LFANEW, &PE_SIGNATURE)?;

        buf.write::<u16>(coff, self.bitness.machine())?;
        buf.write::<u16>(coff + 2, placed.len() as u16)?;
        buf.write::<u16>(coff + 16, opt_size as u16)?;
        let characteristics: u16 = match self.bitness {
            Bitness::X86 => 0x0102,
            Bitness::X64 => 0x0022,
        };
        buf.write::<u16>(coff + 18, characteristics)?;

        let field = |f: OptionalField| opt + f.offset(self.bitness);
        buf.write::<u16>(field(OptionalField::Magic), self.bitness.magic())?;
        buf.write::<u32>(field(OptionalField::AddressOfEntryPoint), self.entry_point)?;
        match self.bitness {
            Bitness::X86 => buf.write::<u32>(field(OptionalField::ImageBase), self.image_base as u32)?,
            Bitness::X64 => buf.write::<u64>(field(OptionalField::ImageBase), self.image_base)?,
        }
        buf.write::<u32>(field(OptionalField::SectionAlignment), self.section_alignment)?;
        buf.write::<u32>(field(OptionalField::FileAlignment), self.file_alignment)?;
        let size_of_image = placed
            .iter()
            .map(|p| align_up(p.header.virtual_address + p.header.virtual_size, self.section_alignment))
            .max()
            .unwrap_or_else(|| align_up(self.size_of_headers(), self.section_alignment));
        buf.write::<u32>(field(OptionalField::SizeOfImage), size_of_image)?;
        buf.write::<u32>(field(OptionalField::SizeOfHeaders), self.size_of_headers())?;
        buf.write::<u32>(
            field(OptionalField::NumberOfRvaAndSizes),
            IMAGE_NUMBEROF_DIRECTORY_ENTRIES as u32,
        )?;
        // subsystem: console
        buf.write::<u16>(opt + 68, 3)?;

        let dir_base = opt + opt_size - IMAGE_NUMBEROF_DIRECTORY_ENTRIES * DATA_DIRECTORY_SIZE;
        for (index, dir) in dirs {
            let at = dir_base + index * DATA_DIRECTORY_SIZE;
            buf.write::<u32>(at, dir.virtual_address)?;
            buf.write::<u32>(at + 4, dir.size)?;
        }

        let table = opt + opt_size;
        for (i, p) in placed.iter().enumerate() {
            write_section_header(buf, table + i * SECTION_HEADER_SIZE, &p.header)?;
        }
        Ok(())
    }

    /// Raw bytes laid out as a file on disk.
    pub fn build(&self) -> Result<Vec<u8>> {
        let (placed, dirs) = self.place()?;
        let end = placed
            .iter()
            .map(|p| (p.header.pointer_to_raw_data + p.header.size_of_raw_data) as usize)
            .max()
            .unwrap_or(self.size_of_headers() as usize);
        let mut buf = ByteBuffer::zeroed(end);
        self.write_headers(&mut buf, &placed, &dirs)?;
        for p in &placed {
            buf.copy_data(p.header.pointer_to_raw_data as usize, &p.data)?;
        }
        Ok(buf.into_inner())
    }

    /// Raw bytes laid out as a loaded module: every section sits at its RVA
    /// and the buffer spans `SizeOfImage`. Section headers keep their file
    /// layout values, as a loader would leave them.
    pub fn build_mapped(&self) -> Result<Vec<u8>> {
        let (placed, dirs) = self.place()?;
        let mut buf = ByteBuffer::zeroed(self.size_of_headers() as usize);
        self.write_headers(&mut buf, &placed, &dirs)?;
        let size_of_image = buf.read::<u32>(
            E_LFANEW + 4 + COFF_HEADER_SIZE + OptionalField::SizeOfImage.offset(self.bitness),
        )? as usize;
        buf.resize(size_of_image);
        for p in &placed {
            buf.copy_data(p.header.virtual_address as usize, &p.data)?;
        }
        Ok(buf.into_inner())
    }

    /// Build and parse as a file-layout [`Image`].
    pub fn build_image(&self) -> Result<Image> {
        Image::from_bytes_as(self.build()?, self.bitness)
    }

    /// Build and parse as a mapped [`Image`].
    pub fn build_live_image(&self) -> Result<Image> {
        Image::from_live_memory(self.build_mapped()?, self.bitness)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_and_mapped_layouts_agree() {
        let builder = ImageBuilder::new(Bitness::X64)
            .with_section(".text", SectionFlags::MEM_EXECUTE, vec![0xC3; 0x10])
            .with_exports("demo.dll", vec![("Run".into(), 0x1000)]);
        let file = builder.build_image().unwrap();
        let live = builder.build_live_image().unwrap();
        let text_file = file.section_by_name(".text").unwrap();
        let text_live = live.section_by_name(".text").unwrap();
        assert_eq!(text_file.virtual_address, text_live.virtual_address);
        assert_eq!(
            file.read::<u8>(text_file.pointer_to_raw_data as usize).unwrap(),
            live.read::<u8>(text_live.virtual_address as usize).unwrap()
        );
        assert_eq!(
            file.data_directory(IMAGE_DIRECTORY_ENTRY_EXPORT),
            live.data_directory(IMAGE_DIRECTORY_ENTRY_EXPORT)
        );
    }

    #[test]
    fn zero_alignment_is_rejected() {
        let err = ImageBuilder::new(Bitness::X86)
            .with_alignments(0, 0x200)
            .build()
            .unwrap_err();
        assert_eq!(err, PeError::InvalidAlignment);
    }
}
