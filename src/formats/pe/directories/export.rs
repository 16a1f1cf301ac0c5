//! Export directory view and address-to-symbol resolution

use serde::{Deserialize, Serialize};

use crate::demangle;
use crate::formats::pe::types::*;
use crate::formats::pe::Image;

const MAX_NAME_LEN: usize = 512;

/// One named export, derived on demand from the directory tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    /// Name exactly as stored in the image
    pub name: String,
    /// Demangled form, when requested and the name is mangled
    pub demangled: Option<String>,
    pub rva: u32,
    /// Biased ordinal (ordinal base + function table index)
    pub ordinal: u32,
    /// Index into the function address table
    pub index: u16,
    /// Target of a forwarded export (`OTHER.Function`)
    pub forwarder: Option<String>,
}

impl ExportEntry {
    /// The demangled name when available, otherwise the raw one
    pub fn display_name(&self) -> &str {
        self.demangled.as_deref().unwrap_or(&self.name)
    }
}

/// Read-only view over an image's export directory
pub struct ExportDirectory<'a> {
    image: &'a Image,
    dir: DataDirectory,
}

impl<'a> ExportDirectory<'a> {
    pub fn new(image: &'a Image) -> Self {
        Self {
            image,
            dir: image.data_directory(IMAGE_DIRECTORY_ENTRY_EXPORT),
        }
    }

    /// The directory counts as present whenever its size is non-zero.
    pub fn is_present(&self) -> bool {
        self.dir.size > 0 && self.dir.virtual_address != 0
    }

    fn field(&self, at: u32) -> Result<u32> {
        self.image
            .read_at_rva::<u32>(self.dir.virtual_address + at)
            .map_err(|_| PeError::MalformedExportTable)
    }

    pub fn module_name(&self) -> Result<Option<&'a str>> {
        if !self.is_present() {
            return Ok(None);
        }
        let rva = self.field(12)?;
        if rva == 0 {
            return Ok(None);
        }
        self.image.read_cstr_at_rva(rva, MAX_NAME_LEN).map(Some)
    }

    pub fn ordinal_base(&self) -> Result<u32> {
        self.field(16)
    }

    pub fn number_of_functions(&self) -> Result<u32> {
        self.field(20)
    }

    pub fn number_of_names(&self) -> u32 {
        if !self.is_present() {
            return 0;
        }
        self.field(24).unwrap_or(0)
    }

    /// The export at position `idx` of the name table. `Ok(None)` past the
    /// end or when the directory is absent.
    pub fn export(&self, idx: u32, demangle_name: bool) -> Result<Option<ExportEntry>> {
        if !self.is_present() || idx >= self.number_of_names() {
            return Ok(None);
        }
        let functions = self.field(28)?;
        let names = self.field(32)?;
        let ordinals = self.field(36)?;

        let index = self
            .image
            .read_at_rva::<u16>(ordinals + idx * 2)
            .map_err(|_| PeError::MalformedExportTable)?;
        if u32::from(index) >= self.number_of_functions()? {
            return Err(PeError::MalformedExportTable);
        }
        let rva = self
            .image
            .read_at_rva::<u32>(functions + u32::from(index) * 4)
            .map_err(|_| PeError::MalformedExportTable)?;
        let name_rva = self
            .image
            .read_at_rva::<u32>(names + idx * 4)
            .map_err(|_| PeError::MalformedExportTable)?;
        let name = self.image.read_cstr_at_rva(name_rva, MAX_NAME_LEN)?.to_string();

        let dir_range = self.dir.virtual_address
            ..self.dir.virtual_address.saturating_add(self.dir.size);
        let forwarder = if dir_range.contains(&rva) {
            Some(self.image.read_cstr_at_rva(rva, MAX_NAME_LEN)?.to_string())
        } else {
            None
        };

        let demangled = if demangle_name {
            demangle::demangle_one(&name).map(|r| r.demangled)
        } else {
            None
        };

        Ok(Some(ExportEntry {
            name,
            demangled,
            rva,
            ordinal: self.ordinal_base()?.wrapping_add(u32::from(index)),
            index,
            forwarder,
        }))
    }

    /// Invoke `f` once per named export in name-table order.
    pub fn traverse_exports<F>(&self, demangle_names: bool, mut f: F) -> Result<()>
    where
        F: FnMut(&ExportEntry),
    {
        for idx in 0..self.number_of_names() {
            if let Some(entry) = self.export(idx, demangle_names)? {
                if entry.rva != 0 {
                    f(&entry);
                }
            }
        }
        Ok(())
    }

    pub fn exports(&self, demangle_names: bool) -> Result<Vec<ExportEntry>> {
        let mut out = Vec::with_capacity(self.number_of_names() as usize);
        self.traverse_exports(demangle_names, |e| out.push(e.clone()))?;
        Ok(out)
    }

    /// Linear lookup of the named export whose function RVA equals `rva`.
    pub fn resolve_rva(&self, rva: u32, demangle_names: bool) -> Result<Option<ExportEntry>> {
        for idx in 0..self.number_of_names() {
            if let Some(entry) = self.export(idx, demangle_names)? {
                if entry.rva == rva && entry.forwarder.is_none() {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::pe::ImageBuilder;

    fn kernel32() -> Image {
        ImageBuilder::new(Bitness::X64)
            .with_section(".text", SectionFlags::MEM_EXECUTE, vec![0xC3; 0x100])
            .with_exports(
                "KERNEL32.dll",
                vec![
                    ("Sleep".to_string(), 0x1010),
                    ("CreateFileW".to_string(), 0x1020),
                    ("?Run@Worker@@QEAAXXZ".to_string(), 0x1030),
                ],
            )
            .build_live_image()
            .unwrap()
    }

    #[test]
    fn exports_follow_name_table_order() {
        let image = kernel32();
        let dir = image.export_directory();
        assert!(dir.is_present());
        assert_eq!(dir.module_name().unwrap(), Some("KERNEL32.dll"));
        let names: Vec<String> = dir.exports(false).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["?Run@Worker@@QEAAXXZ", "CreateFileW", "Sleep"]);
    }

    #[test]
    fn resolve_by_rva() {
        let image = kernel32();
        let dir = image.export_directory();
        let sleep = dir.resolve_rva(0x1010, false).unwrap().unwrap();
        assert_eq!(sleep.name, "Sleep");
        assert_eq!(sleep.index, 0);
        assert_eq!(sleep.ordinal, 1);
        assert!(dir.resolve_rva(0x1011, false).unwrap().is_none());
    }

    #[test]
    fn demangles_on_request() {
        let image = kernel32();
        let dir = image.export_directory();
        let raw = dir.resolve_rva(0x1030, false).unwrap().unwrap();
        assert!(raw.demangled.is_none());
        let pretty = dir.resolve_rva(0x1030, true).unwrap().unwrap();
        assert_eq!(pretty.name, "?Run@Worker@@QEAAXXZ");
        let shown = pretty.display_name();
        assert!(shown.contains("Worker") && shown.contains("Run"));
    }

    #[test]
    fn absent_directory_resolves_nothing() {
        let image = ImageBuilder::new(Bitness::X86)
            .with_section(".text", SectionFlags::MEM_EXECUTE, vec![0xC3; 0x10])
            .build_image()
            .unwrap();
        let dir = image.export_directory();
        assert!(!dir.is_present());
        assert_eq!(dir.number_of_names(), 0);
        assert!(dir.resolve_rva(0x1000, false).unwrap().is_none());
        assert!(dir.exports(false).unwrap().is_empty());
    }
}
