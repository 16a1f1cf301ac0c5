//! Import directory reading and the import table editor.
//!
//! The editor never grows existing sections. On first use it appends a
//! dedicated extension section, pre-filled with [`EXTENSION_FILL`], and moves
//! the descriptor array to a fixed offset inside it. Everything else it
//! allocates (module names, thunk arrays, hint/name entries) is carved out of
//! the fill-byte region below that offset.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::formats::pe::types::*;
use crate::formats::pe::utils::{align_up_usize, names_match};
use crate::formats::pe::Image;

/// Name of the section appended for new import data
pub const DEFAULT_EXTENSION_SECTION: &str = ".vmpfix";
/// Extension size in pages
pub const EXTENSION_PAGES: u32 = 20;
/// Page at which the relocated descriptor array starts
pub const DESCRIPTOR_AREA_PAGE: u32 = 10;
/// Byte marking unallocated space in the extension section
pub const EXTENSION_FILL: u8 = 0xCC;

const MAX_NAME_LEN: usize = 512;
const MAX_DESCRIPTORS: usize = 4096;
const MAX_THUNKS: usize = 65536;

/// How an import names its target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImportSymbol {
    Name(String),
    Ordinal(u16),
}

impl std::fmt::Display for ImportSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportSymbol::Name(name) => f.write_str(name),
            ImportSymbol::Ordinal(ord) => write!(f, "#{}", ord),
        }
    }
}

/// Raw 20-byte import descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportDescriptor {
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name: u32,
    pub first_thunk: u32,
}

impl ImportDescriptor {
    fn read(image: &Image, rva: u32) -> Result<Self> {
        let field = |at: u32| {
            image
                .read_at_rva::<u32>(rva + at)
                .map_err(|_| PeError::MalformedImportTable)
        };
        Ok(Self {
            original_first_thunk: field(0)?,
            time_date_stamp: field(4)?,
            forwarder_chain: field(8)?,
            name: field(12)?,
            first_thunk: field(16)?,
        })
    }

    fn write(&self, image: &mut Image, rva: u32) -> Result<()> {
        image.write_at_rva::<u32>(rva, self.original_first_thunk)?;
        image.write_at_rva::<u32>(rva + 4, self.time_date_stamp)?;
        image.write_at_rva::<u32>(rva + 8, self.forwarder_chain)?;
        image.write_at_rva::<u32>(rva + 12, self.name)?;
        image.write_at_rva::<u32>(rva + 16, self.first_thunk)
    }

    pub fn is_null(&self) -> bool {
        *self == Self::default()
    }

    /// Table used to read symbol names: the lookup table when present.
    pub fn lookup_table(&self) -> u32 {
        if self.original_first_thunk != 0 {
            self.original_first_thunk
        } else {
            self.first_thunk
        }
    }
}

/// One imported symbol as seen through the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleImport {
    pub module_name_rva: u32,
    pub module_name: String,
    pub symbol: ImportSymbol,
    /// RVA of the hint/name entry; `None` for ordinal imports
    pub symbol_name_rva: Option<u32>,
    /// RVA of the IAT slot the loader fills in
    pub import_rva: u32,
}

/// Read-only view over the import directory
pub struct ImportDirectory<'a> {
    image: &'a Image,
    dir: DataDirectory,
}

impl<'a> ImportDirectory<'a> {
    pub fn new(image: &'a Image) -> Self {
        Self {
            image,
            dir: image.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT),
        }
    }

    pub fn is_present(&self) -> bool {
        self.dir.virtual_address != 0
    }

    pub fn table_rva(&self) -> u32 {
        self.dir.virtual_address
    }

    /// Descriptors up to, not including, the null terminator.
    pub fn descriptors(&self) -> Result<Vec<ImportDescriptor>> {
        let mut out = Vec::new();
        if !self.is_present() {
            return Ok(out);
        }
        for i in 0..MAX_DESCRIPTORS {
            let rva = self.dir.virtual_address + (i * IMPORT_DESCRIPTOR_SIZE) as u32;
            let desc = ImportDescriptor::read(self.image, rva)?;
            if desc.is_null() || (desc.name == 0 && desc.first_thunk == 0) {
                return Ok(out);
            }
            out.push(desc);
        }
        Err(PeError::MalformedImportTable)
    }

    fn module_name_of(&self, desc: &ImportDescriptor) -> Result<&'a str> {
        self.image
            .read_cstr_at_rva(desc.name, MAX_NAME_LEN)
            .map_err(|_| PeError::MalformedImportTable)
    }

    /// RVA of the name string of the first descriptor for `module`,
    /// compared case-insensitively.
    pub fn module_is_imported(&self, module: &str) -> Option<u32> {
        self.descriptors()
            .ok()?
            .into_iter()
            .find(|d| {
                self.module_name_of(d)
                    .map(|name| names_match(name, module))
                    .unwrap_or(false)
            })
            .map(|d| d.name)
    }

    fn traverse_descriptor<F>(&self, desc: &ImportDescriptor, f: &mut F) -> Result<bool>
    where
        F: FnMut(&ModuleImport) -> bool,
    {
        let module_name = self.module_name_of(desc)?.to_string();
        let word = self.image.word_size() as u32;
        let ordinal_flag = self.image.bitness().ordinal_flag();
        let lookup = desc.lookup_table();

        for i in 0..MAX_THUNKS as u32 {
            let value = self
                .image
                .read_word_at_rva(lookup + i * word)
                .map_err(|_| PeError::MalformedImportTable)?;
            if value == 0 {
                break;
            }
            let (symbol, symbol_name_rva) = if value & ordinal_flag != 0 {
                (ImportSymbol::Ordinal((value & 0xFFFF) as u16), None)
            } else {
                let hint_name = (value & 0x7FFF_FFFF) as u32;
                let name = self
                    .image
                    .read_cstr_at_rva(hint_name + 2, MAX_NAME_LEN)
                    .map_err(|_| PeError::MalformedImportTable)?;
                (ImportSymbol::Name(name.to_string()), Some(hint_name))
            };
            let import = ModuleImport {
                module_name_rva: desc.name,
                module_name: module_name.clone(),
                symbol,
                symbol_name_rva,
                import_rva: desc.first_thunk + i * word,
            };
            if !f(&import) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Walk every imported symbol of every descriptor in table order.
    /// Returning `false` from `f` stops the walk. A descriptor whose thunks
    /// cannot be decoded, such as a bound one with no lookup table, is
    /// skipped after whatever it yielded.
    pub fn traverse_imports<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&ModuleImport) -> bool,
    {
        for desc in self.descriptors()? {
            match self.traverse_descriptor(&desc, &mut f) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => warn!(
                    descriptor_name = format_args!("{:#x}", desc.name),
                    first_thunk = format_args!("{:#x}", desc.first_thunk),
                    "skipping undecodable import descriptor: {}",
                    e
                ),
            }
        }
        Ok(())
    }

    pub fn imports(&self) -> Result<Vec<ModuleImport>> {
        let mut out = Vec::new();
        self.traverse_imports(|i| {
            out.push(i.clone());
            true
        })?;
        Ok(out)
    }

    /// IAT slot RVA of `module!symbol` when already imported by name.
    /// Ordinal imports never match.
    pub fn find_import(&self, module: &str, symbol: &str) -> Option<u32> {
        let mut found = None;
        self.traverse_imports(|import| {
            let hit = names_match(&import.module_name, module)
                && matches!(&import.symbol, ImportSymbol::Name(name) if name == symbol);
            if hit {
                found = Some(import.import_rva);
            }
            !hit
        })
        .ok()?;
        found
    }

    /// Span covered by all IAT slots, including terminators.
    pub fn iat_range(&self) -> Option<Range<u32>> {
        let word = self.image.word_size() as u32;
        let mut range: Option<Range<u32>> = None;
        for desc in self.descriptors().ok()? {
            let mut count = 0u32;
            if self
                .traverse_descriptor(&desc, &mut |_| {
                    count += 1;
                    true
                })
                .is_err()
            {
                continue;
            }
            let span = desc.first_thunk..desc.first_thunk + (count + 1) * word;
            range = Some(match range {
                Some(r) => r.start.min(span.start)..r.end.max(span.end),
                None => span,
            });
        }
        range
    }
}

/// Regions written for one added import
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedImport {
    /// IAT slot for the symbol; the value call sites should reference
    pub iat_rva: u32,
    /// Lookup (original first thunk) slot
    pub lookup_rva: u32,
    pub hint_name_rva: u32,
    pub module_name_rva: u32,
    /// True when the symbol was already imported and nothing was written
    pub reused: bool,
}

/// Adds module/symbol imports by growing the image with an extension section.
pub struct ImportEditor<'a> {
    image: &'a mut Image,
    section_name: String,
}

impl<'a> ImportEditor<'a> {
    pub fn new(image: &'a mut Image) -> Self {
        Self {
            image,
            section_name: DEFAULT_EXTENSION_SECTION.to_string(),
        }
    }

    pub fn with_section_name<S: Into<String>>(mut self, name: S) -> Self {
        self.section_name = name.into();
        self
    }

    /// Import `module!symbol` and return the RVA of its IAT slot.
    /// Already-present imports are reused without modifying the image.
    pub fn add_import(&mut self, module: &str, symbol: &str) -> Result<u32> {
        let mut added = self.add_imports(module, &[symbol])?;
        added
            .pop()
            .map(|a| a.iat_rva)
            .ok_or(PeError::MalformedImportTable)
    }

    /// Import several symbols from `module`. New symbols share one new
    /// descriptor; the result follows the order of `symbols`.
    pub fn add_imports(&mut self, module: &str, symbols: &[&str]) -> Result<Vec<AddedImport>> {
        if module.is_empty() || symbols.iter().any(|s| s.is_empty()) {
            return Err(PeError::InvalidString);
        }

        let mut results: Vec<Option<AddedImport>> = Vec::with_capacity(symbols.len());
        let mut pending: Vec<&str> = Vec::new();
        {
            let view = self.image.import_directory();
            for symbol in symbols {
                match view.find_import(module, symbol) {
                    Some(iat_rva) => results.push(Some(AddedImport {
                        iat_rva,
                        lookup_rva: 0,
                        hint_name_rva: 0,
                        module_name_rva: view.module_is_imported(module).unwrap_or(0),
                        reused: true,
                    })),
                    None => {
                        if !pending.contains(symbol) {
                            pending.push(*symbol);
                        }
                        results.push(None);
                    }
                }
            }
        }
        if pending.is_empty() {
            return Ok(results.into_iter().flatten().collect());
        }

        let (existing, old_table, name_rva) = {
            let view = self.image.import_directory();
            (
                view.descriptors()?,
                view.table_rva(),
                view.module_is_imported(module),
            )
        };

        let section = self.extension_section()?;
        let table_rva = section.virtual_address + DESCRIPTOR_AREA_PAGE * PAGE_SIZE;
        let capacity =
            (section.virtual_size.saturating_sub(DESCRIPTOR_AREA_PAGE * PAGE_SIZE)) as usize
                / IMPORT_DESCRIPTOR_SIZE;
        if existing.len() + 2 > capacity {
            return Err(PeError::ExtensionExhausted {
                needed: (existing.len() + 2) * IMPORT_DESCRIPTOR_SIZE,
            });
        }

        if old_table != table_rva && old_table != 0 {
            for i in 0..existing.len() {
                ImportDescriptor::default()
                    .write(self.image, old_table + (i * IMPORT_DESCRIPTOR_SIZE) as u32)?;
            }
        }
        for (i, desc) in existing.iter().enumerate() {
            desc.write(self.image, table_rva + (i * IMPORT_DESCRIPTOR_SIZE) as u32)?;
        }

        let word = self.image.word_size();
        let module_name_rva = match name_rva {
            Some(rva) => rva,
            None => {
                let mut bytes = module.as_bytes().to_vec();
                bytes.push(0);
                self.allocate(&section, &bytes, 1)?
            }
        };
        let thunks = vec![0u8; (pending.len() + 1) * word];
        let iat = self.allocate(&section, &thunks, word)?;
        let lookup = self.allocate(&section, &thunks, word)?;

        let mut fresh = Vec::with_capacity(pending.len());
        for (i, symbol) in pending.iter().enumerate() {
            let mut entry = vec![0u8, 0u8];
            entry.extend_from_slice(symbol.as_bytes());
            entry.push(0);
            let hint_name_rva = self.allocate(&section, &entry, 2)?;
            let slot = (i * word) as u32;
            self.image.write_word_at_rva(lookup + slot, u64::from(hint_name_rva))?;
            self.image.write_word_at_rva(iat + slot, u64::from(hint_name_rva))?;
            fresh.push(AddedImport {
                iat_rva: iat + slot,
                lookup_rva: lookup + slot,
                hint_name_rva,
                module_name_rva,
                reused: false,
            });
        }

        let slot = table_rva + (existing.len() * IMPORT_DESCRIPTOR_SIZE) as u32;
        ImportDescriptor {
            original_first_thunk: lookup,
            time_date_stamp: 0,
            forwarder_chain: 0,
            name: module_name_rva,
            first_thunk: iat,
        }
        .write(self.image, slot)?;
        ImportDescriptor::default().write(self.image, slot + IMPORT_DESCRIPTOR_SIZE as u32)?;

        self.image.set_data_directory(
            IMAGE_DIRECTORY_ENTRY_IMPORT,
            DataDirectory {
                virtual_address: table_rva,
                size: ((existing.len() + 2) * IMPORT_DESCRIPTOR_SIZE) as u32,
            },
        )?;
        debug!(
            module,
            count = pending.len(),
            iat = format_args!("{:#x}", iat),
            "added import descriptor"
        );

        Ok(results
            .into_iter()
            .zip(symbols)
            .map(|(r, symbol)| {
                r.unwrap_or_else(|| {
                    let at = pending.iter().position(|p| p == symbol).unwrap_or(0);
                    fresh[at].clone()
                })
            })
            .collect())
    }

    /// The extension section, appended and filled on first use.
    fn extension_section(&mut self) -> Result<SectionHeader> {
        if let Some(section) = self.image.section_by_name(&self.section_name) {
            return Ok(section);
        }
        let section = self.image.append_section(
            &self.section_name,
            EXTENSION_PAGES * PAGE_SIZE,
            SectionFlags::CNT_INITIALIZED_DATA | SectionFlags::MEM_READ | SectionFlags::MEM_WRITE,
        )?;
        self.image.fill(
            section.pointer_to_raw_data as usize,
            section.size_of_raw_data as usize,
            EXTENSION_FILL,
        )?;
        debug!(
            name = %self.section_name,
            rva = format_args!("{:#x}", section.virtual_address),
            "appended import extension section"
        );
        Ok(section)
    }

    /// Claim an aligned run of fill bytes below the descriptor area and
    /// overwrite the whole run with `payload` plus zero padding.
    fn allocate(&mut self, section: &SectionHeader, payload: &[u8], alignment: usize) -> Result<u32> {
        let mut arena = *section;
        arena.size_of_raw_data = arena.size_of_raw_data.min(DESCRIPTOR_AREA_PAGE * PAGE_SIZE);
        let len = align_up_usize(payload.len(), alignment.max(1));
        let offset = self
            .image
            .find_padding(Some(&arena), EXTENSION_FILL, len, alignment)
            .ok_or(PeError::ExtensionExhausted { needed: len })?;
        let mut bytes = payload.to_vec();
        bytes.resize(len, 0);
        self.image.write_bytes(offset, &bytes)?;
        self.image
            .offset_to_rva(offset)
            .ok_or(PeError::InvalidOffset { offset })
    }
}
