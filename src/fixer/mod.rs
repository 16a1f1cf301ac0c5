//! Emulation-driven import call resolution.
//!
//! Calls from the code section into the protected section are emulated one
//! at a time. The first return executed by a stub lands on the real import
//! address; that address is resolved to a module export, an import slot is
//! found or added, and the call is rewritten to `call [slot]`.

use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::config::FixerConfig;
use crate::disasm::{Disassembler, IcedDisassembler};
use crate::emu::{self, CpuView, Emulator, HookAction, InstructionHook, Register};
use crate::error::{FixerError, Result};
use crate::formats::pe::utils::align_page;
use crate::formats::pe::{Bitness, Image, ImportEditor, SectionHeader, PAGE_SIZE};
use crate::process::ProcessSource;

pub mod modules;
pub mod patch;
pub mod report;

pub use modules::{LoadedModule, ModuleSet, ResolvedExport};
pub use patch::{PatchKind, PATCH_LEN};
pub use report::{FixReport, PatchedSite, RunState, SkippedSite};

/// Near and far return opcodes that end a stub
const RET_OPCODES: [u8; 4] = [0xC3, 0xC2, 0xCB, 0xCA];

/// Length of the `E8 rel32` being replaced
const CALL_LEN: usize = 5;

/// Patched image plus what happened to each candidate
#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub image: Image,
    pub report: FixReport,
}

/// A call into the protected section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    offset: usize,
    rva: u32,
    target: u64,
}

/// Stops at the first return and resolves the address on top of the stack.
/// A fresh hook is built for every candidate.
struct ReturnHook<'a> {
    modules: &'a ModuleSet,
    demangle: bool,
    outcome: Option<std::result::Result<ResolvedExport, String>>,
}

impl<'a> ReturnHook<'a> {
    fn new(modules: &'a ModuleSet, demangle: bool) -> Self {
        Self {
            modules,
            demangle,
            outcome: None,
        }
    }
}

impl InstructionHook for ReturnHook<'_> {
    fn on_instruction(&mut self, cpu: &dyn CpuView, _address: u64, bytes: &[u8]) -> HookAction {
        if !bytes.first().is_some_and(|b| RET_OPCODES.contains(b)) {
            return HookAction::Continue;
        }
        self.outcome = Some(match cpu.read_word(cpu.stack_pointer()) {
            Ok(resolved) => self.modules.resolve_address(resolved, self.demangle),
            Err(e) => Err(format!("unable to read return address: {e}")),
        });
        HookAction::Stop
    }
}

pub struct ImportFixer {
    config: FixerConfig,
    state: RunState,
}

impl ImportFixer {
    pub fn new(config: FixerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: RunState::Idle,
        })
    }

    pub fn config(&self) -> &FixerConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn enter(&mut self, state: RunState) {
        debug!(from = %self.state, to = %state, "run state");
        self.state = state;
    }

    /// Resolve and patch every candidate of `target` (or the first module)
    /// in memory. Nothing is written to disk.
    pub fn fix(&mut self, process: &dyn ProcessSource, target: Option<&str>) -> Result<FixOutcome> {
        self.state = RunState::Idle;
        let _span = crate::span_trace!("fix", module = target.unwrap_or("<first>")).entered();
        match self.run(process, target) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.enter(RunState::Failed);
                error!(fatal = true, error = %e, "import fixing aborted");
                Err(e)
            }
        }
    }

    /// Run [`fix`](Self::fix) and write the patched image to
    /// `<output_dir>/<module><suffix>`, plus a JSON report when configured.
    pub fn dump_in_memory(
        &mut self,
        process: &dyn ProcessSource,
        target: Option<&str>,
    ) -> Result<FixReport> {
        let FixOutcome { image, mut report } = self.fix(process, target)?;
        let path = self.config.output_path(&report.target_module);
        if let Err(e) = self.write_outputs(&image, &mut report, path.clone()) {
            self.enter(RunState::Failed);
            return Err(crate::log_error!(e, "writing output"));
        }
        self.enter(RunState::Written);
        info!(output = %path.display(), "{}", report);
        Ok(report)
    }

    fn write_outputs(&self, image: &Image, report: &mut FixReport, path: PathBuf) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        image.write_to_file(&path)?;
        report.output_path = Some(path.clone());
        if self.config.write_report {
            let mut json_path = path.into_os_string();
            json_path.push(".json");
            report.write_json(PathBuf::from(json_path))?;
        }
        Ok(())
    }

    fn run(&mut self, process: &dyn ProcessSource, target: Option<&str>) -> Result<FixOutcome> {
        let modules = ModuleSet::load(process)?;
        self.enter(RunState::ModulesLoaded);

        let index = modules.select_target(target)?;
        let Some(loaded) = modules.get(index) else {
            return Err(FixerError::NoModules);
        };
        let module_name = loaded.info.file_name().to_string();
        let mut image = loaded.image.clone();
        let base = image.image_base();
        if base != loaded.info.base {
            warn!(
                header = format_args!("{:#x}", base),
                loaded = format_args!("{:#x}", loaded.info.base),
                "image base differs from load address, using header value"
            );
        }

        let code = self.require_section(&image, &self.config.code_section, &module_name)?;
        let vmp = self.require_section(&image, &self.config.vmp_section, &module_name)?;

        let bitness = image.bitness();
        let mut emulator = emu::create(self.config.emulator, bitness)?;
        map_sections(emulator.as_mut(), &image, &[&code, &vmp])?;
        let stack = scratch_stack(&image, &vmp);
        info!(
            module = %module_name,
            backend = emulator.name(),
            bits = bitness.bits(),
            "mapped {} and {}",
            code.name(),
            vmp.name()
        );
        self.enter(RunState::SectionsMapped);

        self.enter(RunState::Scanning);
        let disasm = IcedDisassembler::new(bitness);
        let (call_matches, candidates) = self.scan(&image, &code, &vmp, &disasm)?;
        info!(
            matches = call_matches,
            candidates = candidates.len(),
            "scanned {}",
            code.name()
        );

        let mut report = FixReport {
            target_module: module_name,
            target_path: loaded.info.path.clone(),
            image_base: base,
            bitness: bitness.bits(),
            call_matches,
            candidates: candidates.len(),
            ..Default::default()
        };

        self.enter(RunState::Emulating);
        let mut cache: HashMap<(String, String), u32> = HashMap::new();
        let mut patched_ranges: Vec<Range<usize>> = Vec::new();
        for candidate in candidates {
            let site_span = crate::span_trace!("site", rva = candidate.rva);
            let _guard = site_span.enter();
            let skip = |reason: String| {
                warn!(stub = format_args!("{:#x}", candidate.target), "{}", reason);
                SkippedSite {
                    call_rva: candidate.rva,
                    target: candidate.target,
                    reason,
                }
            };

            let (resolved, instructions) =
                match self.emulate(emulator.as_mut(), &modules, stack, base, candidate) {
                    Ok(r) => r,
                    Err(reason) => {
                        report.skipped.push(skip(reason));
                        continue;
                    }
                };

            match self.patch_site(
                &mut image,
                &mut cache,
                &mut patched_ranges,
                candidate,
                &resolved,
            ) {
                Ok((site, added)) => {
                    info!(
                        kind = ?site.kind,
                        slot = format_args!("{:#x}", site.import_rva),
                        "{}!{}",
                        site.module,
                        resolved.export.display_name()
                    );
                    if added {
                        report.imports_added += 1;
                    }
                    report.patched.push(PatchedSite {
                        instructions,
                        ..site
                    });
                }
                Err(reason) => report.skipped.push(skip(format!(
                    "{}!{}: {}",
                    resolved.module, resolved.export.name, reason
                ))),
            }
        }

        if bitness == Bitness::X86
            && !report.patched.is_empty()
            && image.relocation_directory().is_present()
        {
            warn!("absolute import operands have no base relocations; image must load at its preferred base");
        }

        self.enter(RunState::Patched);
        Ok(FixOutcome { image, report })
    }

    fn require_section(&self, image: &Image, name: &str, module: &str) -> Result<SectionHeader> {
        image
            .section_by_name(name)
            .ok_or_else(|| FixerError::SectionMissing {
                name: name.to_string(),
                module: module.to_string(),
            })
    }

    /// Pattern matches in `code` and those whose branch target lies in `vmp`.
    fn scan(
        &self,
        image: &Image,
        code: &SectionHeader,
        vmp: &SectionHeader,
        disasm: &dyn Disassembler,
    ) -> Result<(usize, Vec<Candidate>)> {
        let matches = image.find_binary_sequence(code, &self.config.call_pattern)?;
        if matches.is_empty() {
            return Err(FixerError::NoCallSites {
                pattern: self.config.call_pattern.clone(),
                section: code.name().to_string(),
            });
        }
        let vmp_range = image.rva_to_va(vmp.virtual_address)
            ..image.rva_to_va(vmp.virtual_address) + u64::from(vmp.virtual_size);

        let mut candidates = Vec::new();
        for &offset in &matches {
            let Some(rva) = image.offset_to_rva(offset) else {
                continue;
            };
            let len = disasm.max_instruction_length().min(image.len() - offset);
            let Ok(bytes) = image.read_bytes(offset, len) else {
                continue;
            };
            let insn = match disasm.decode(image.rva_to_va(rva), bytes) {
                Ok(insn) => insn,
                Err(e) => {
                    debug!(rva = format_args!("{:#x}", rva), error = %e, "undecodable match");
                    continue;
                }
            };
            if let Some(target) = disasm.absolute_target(&insn) {
                if vmp_range.contains(&target) {
                    debug!(
                        rva = format_args!("{:#x}", rva),
                        target = format_args!("{:#x}", target),
                        "candidate"
                    );
                    candidates.push(Candidate { offset, rva, target });
                }
            }
        }
        Ok((matches.len(), candidates))
    }

    /// Enter the stub as if called from the site and resolve where it returns.
    fn emulate(
        &self,
        emulator: &mut dyn Emulator,
        modules: &ModuleSet,
        stack: u64,
        base: u64,
        candidate: Candidate,
    ) -> std::result::Result<(ResolvedExport, u64), String> {
        let gprs = match emulator.bitness() {
            Bitness::X64 => &Register::GPRS[..],
            Bitness::X86 => &Register::GPRS[..8],
        };
        let return_address = base + u64::from(candidate.rva) + CALL_LEN as u64;
        prime(emulator, gprs, stack, return_address)
            .map_err(|e| format!("priming emulator: {e}"))?;

        let mut hook = ReturnHook::new(modules, self.config.demangle_exports);
        let executed = emulator
            .emulate(candidate.target, &self.config.budget, &mut hook)
            .map_err(|e| format!("emulation failed: {e}"))?;
        match hook.outcome {
            Some(Ok(resolved)) => Ok((resolved, executed)),
            Some(Err(reason)) => Err(reason),
            None => Err("emulation stopped before a return".to_string()),
        }
    }

    /// Find or add the import slot for `resolved` and rewrite the site.
    fn patch_site(
        &self,
        image: &mut Image,
        cache: &mut HashMap<(String, String), u32>,
        patched: &mut Vec<Range<usize>>,
        candidate: Candidate,
        resolved: &ResolvedExport,
    ) -> std::result::Result<(PatchedSite, bool), String> {
        let kind = patch::classify(image, candidate.offset, |b| self.config.is_filler(b))?;
        let patch_offset = kind.patch_offset(candidate.offset);
        let span = patch_offset..patch_offset + PATCH_LEN;
        if patched.iter().any(|r| r.start < span.end && span.start < r.end) {
            return Err("overlaps an earlier patch".to_string());
        }
        let patch_rva = image
            .offset_to_rva(patch_offset)
            .ok_or_else(|| format!("patch offset {patch_offset:#x} outside any section"))?;

        let key = (resolved.module.clone(), resolved.export.name.clone());
        let (import_rva, added) = match cache.get(&key) {
            Some(&rva) => (rva, false),
            None => {
                let existing = image
                    .import_directory()
                    .find_import(&resolved.module, &resolved.export.name);
                let (rva, added) = match existing {
                    Some(rva) => (rva, false),
                    None => {
                        let rva = ImportEditor::new(image)
                            .with_section_name(self.config.extension_section.as_str())
                            .add_import(&resolved.module, &resolved.export.name)
                            .map_err(|e| format!("adding import: {e}"))?;
                        (rva, true)
                    }
                };
                cache.insert(key, rva);
                (rva, added)
            }
        };

        let bytes = patch::encode(image.bitness(), image.image_base(), patch_rva, import_rva)?;
        image
            .write_bytes(patch_offset, &bytes)
            .map_err(|e| format!("writing patch: {e}"))?;
        patched.push(span);

        Ok((
            PatchedSite {
                call_rva: candidate.rva,
                patch_rva,
                kind,
                module: resolved.module.clone(),
                symbol: resolved.export.name.clone(),
                demangled: resolved.export.demangled.clone(),
                import_rva,
                import_added: added,
                instructions: 0,
            },
            added,
        ))
    }
}

/// Zero the general registers and enter as if `call`ed from the site.
fn prime(
    emulator: &mut dyn Emulator,
    gprs: &[Register],
    stack: u64,
    return_address: u64,
) -> emu::Result<()> {
    for &reg in gprs {
        emulator.write_register(reg, 0)?;
    }
    emulator.write_register(Register::Rflags, 0x202)?;
    emulator.write_register(Register::Rsp, stack)?;
    emulator.write_word(stack, return_address)
}

/// Bytes mapped for a section: its virtual size plus a page of slack
fn mapped_size(section: &SectionHeader) -> u64 {
    u64::from(align_page(section.virtual_size.saturating_add(PAGE_SIZE)))
}

/// 16-byte aligned stack top in the slack page after the protected section
fn scratch_stack(image: &Image, vmp: &SectionHeader) -> u64 {
    let start = image.rva_to_va(vmp.virtual_address);
    (start + mapped_size(vmp) - u64::from(PAGE_SIZE)) & !0xF
}

/// Map each section at its virtual address and copy its bytes in.
/// Overlapping ranges are merged first.
fn map_sections(
    emulator: &mut dyn Emulator,
    image: &Image,
    sections: &[&SectionHeader],
) -> Result<()> {
    let mut ranges: Vec<Range<u64>> = sections
        .iter()
        .map(|s| {
            let start = image.rva_to_va(s.virtual_address);
            start..start + mapped_size(s)
        })
        .collect();

    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match merged.last_mut() {
            Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
            _ => merged.push(r),
        }
    }
    for r in &merged {
        emulator.map(r.start, r.end - r.start)?;
    }

    for s in sections {
        let range = s.raw_range();
        let end = range.end.min(image.len());
        let start = range.start.min(end);
        let bytes = image.read_bytes(start, end - start)?;
        emulator.write_memory(image.rva_to_va(s.virtual_address), bytes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::pe::{ImageBuilder, SectionFlags};
    use crate::process::{ModuleInfo, SnapshotProcess};

    fn single_module(sections: &[&str]) -> SnapshotProcess {
        let mut builder = ImageBuilder::new(Bitness::X64);
        for name in sections {
            builder = builder.with_section(*name, SectionFlags::MEM_EXECUTE, vec![0xCC; 0x40]);
        }
        let bytes = builder.build_mapped().unwrap();
        let size = bytes.len() as u64;
        SnapshotProcess::new(Bitness::X64).with_module(
            ModuleInfo::new("game.exe", 0x1_4000_0000, size),
            bytes,
        )
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = FixerConfig {
            output_suffix: String::new(),
            ..Default::default()
        };
        assert!(matches!(ImportFixer::new(config), Err(FixerError::Config(_))));
    }

    #[test]
    fn missing_vmp_section_is_fatal() {
        let mut fixer = ImportFixer::new(FixerConfig::default()).unwrap();
        let err = fixer.fix(&single_module(&[".text"]), None).unwrap_err();
        assert!(matches!(err, FixerError::SectionMissing { ref name, .. } if name == ".vmp0"));
        assert_eq!(fixer.state(), RunState::Failed);
    }

    #[test]
    fn code_without_calls_is_fatal() {
        let mut fixer = ImportFixer::new(FixerConfig::default()).unwrap();
        let err = fixer.fix(&single_module(&[".text", ".vmp0"]), None).unwrap_err();
        assert!(matches!(err, FixerError::NoCallSites { .. }));
    }

    #[test]
    fn overlapping_mappings_are_merged() {
        let image = ImageBuilder::new(Bitness::X64)
            .with_section(".text", SectionFlags::MEM_EXECUTE, vec![0x90; 0x10])
            .with_section(".vmp0", SectionFlags::MEM_EXECUTE, vec![0xC3; 0x10])
            .build_live_image()
            .unwrap();
        let text = image.section_by_name(".text").unwrap();
        let vmp = image.section_by_name(".vmp0").unwrap();
        let mut emulator = emu::LiteEmulator::new(Bitness::X64);
        map_sections(&mut emulator, &image, &[&text, &vmp]).unwrap();
        let stack = scratch_stack(&image, &vmp);
        assert_eq!(stack % 16, 0);
        assert!(stack >= image.rva_to_va(vmp.virtual_address + vmp.virtual_size));
        let mut byte = [0u8; 1];
        Emulator::read_memory(&emulator, image.rva_to_va(vmp.virtual_address), &mut byte)
            .unwrap();
        assert_eq!(byte[0], 0xC3);
        emulator.write_word(stack, 0x1234).unwrap();
    }
}
