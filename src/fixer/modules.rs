//! Loaded module images and address-to-export resolution.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::error::{FixerError, Result};
use crate::formats::pe::{ExportEntry, Image};
use crate::process::{ModuleInfo, ProcessSource};

pub struct LoadedModule {
    pub info: ModuleInfo,
    pub image: Image,
}

/// An export an emulated stub resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExport {
    /// File name of the owning module, used as the import module name
    pub module: String,
    pub export: ExportEntry,
    pub address: u64,
}

/// Every parsed module of one process, in enumeration order
#[derive(Default)]
pub struct ModuleSet {
    modules: Vec<LoadedModule>,
    by_base: BTreeMap<u64, usize>,
}

impl ModuleSet {
    /// Snapshot and parse every module `process` reports. Modules whose
    /// image fails to parse are skipped.
    pub fn load(process: &dyn ProcessSource) -> Result<Self> {
        let infos = process.modules()?;
        if infos.is_empty() {
            return Err(FixerError::NoModules);
        }
        let mut set = Self::default();
        for info in infos {
            let snapshot = match process.read_memory(info.base, info.size as usize) {
                Ok(s) => s,
                Err(e) => {
                    warn!(module = %info.path, error = %e, "skipping unreadable module");
                    continue;
                }
            };
            if !snapshot.complete {
                warn!(module = %info.path, "module read incomplete, parsing best-effort");
            }
            match Image::from_live_memory(snapshot.bytes, process.bitness()) {
                Ok(image) => {
                    info!(
                        module = %info.path,
                        base = format_args!("{:#x}", info.base),
                        "loaded module"
                    );
                    set.insert(info, image);
                }
                Err(e) => warn!(module = %info.path, error = %e, "failed parsing image"),
            }
        }
        if set.is_empty() {
            return Err(FixerError::NoModules);
        }
        Ok(set)
    }

    pub fn insert(&mut self, info: ModuleInfo, image: Image) {
        self.by_base.insert(info.base, self.modules.len());
        self.modules.push(LoadedModule { info, image });
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedModule> {
        self.modules.iter()
    }

    pub fn get(&self, index: usize) -> Option<&LoadedModule> {
        self.modules.get(index)
    }

    /// Index of the module to fix: matched by file name (case-insensitive)
    /// or path substring when `name` is given, else the first module.
    pub fn select_target(&self, name: Option<&str>) -> Result<usize> {
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Ok(0);
        };
        self.modules
            .iter()
            .position(|m| m.info.file_name().eq_ignore_ascii_case(name))
            .or_else(|| self.modules.iter().position(|m| m.info.path.contains(name)))
            .ok_or_else(|| FixerError::TargetNotFound(name.to_string()))
    }

    /// Module whose `[base, base + size)` range holds `address`.
    pub fn module_for_address(&self, address: u64) -> Option<&LoadedModule> {
        let (_, &idx) = self.by_base.range(..=address).next_back()?;
        let module = &self.modules[idx];
        module.info.contains(address).then_some(module)
    }

    /// Resolve an absolute address to the export it is the entry point of.
    pub fn resolve_address(
        &self,
        address: u64,
        demangle: bool,
    ) -> std::result::Result<ResolvedExport, String> {
        let module = self
            .module_for_address(address)
            .ok_or_else(|| format!("no module owns {address:#x}"))?;
        let rva = u32::try_from(address - module.info.base)
            .map_err(|_| format!("{address:#x} is not a 32-bit offset into its module"))?;
        let export = module
            .image
            .export_directory()
            .resolve_rva(rva, demangle)
            .map_err(|e| format!("export table of {}: {e}", module.info.file_name()))?
            .ok_or_else(|| {
                format!("no export at {}+{rva:#x}", module.info.file_name())
            })?;
        Ok(ResolvedExport {
            module: module.info.file_name().to_string(),
            export,
            address,
        })
    }
}
