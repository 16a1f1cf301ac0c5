use vmpfix::fixer::{FixOutcome, PatchKind};
use vmpfix::formats::pe::{Bitness, Image};
use vmpfix::{FixerConfig, ImportFixer, RunState};

use crate::common::*;

fn run(process: &vmpfix::SnapshotProcess) -> FixOutcome {
    let mut fixer = ImportFixer::new(FixerConfig::default()).unwrap();
    let outcome = fixer.fix(process, None).unwrap();
    assert_eq!(fixer.state(), RunState::Patched);
    outcome
}

fn slot_of(image: &Image, module: &str, symbol: &str) -> u32 {
    image
        .import_directory()
        .find_import(module, symbol)
        .unwrap_or_else(|| panic!("{module}!{symbol} not imported"))
}

#[test]
fn plain_call_is_rewritten_through_new_import() {
    let original = sleep_target(Bitness::X64).build();
    let FixOutcome { image, report } = run(&process_with(Bitness::X64, original.clone()));

    assert_eq!(report.target_module, "game.exe");
    assert_eq!(report.candidates, 1);
    assert_eq!(report.patched.len(), 1);
    assert!(report.skipped.is_empty());
    assert_eq!(report.imports_added, 1);

    let site = &report.patched[0];
    assert_eq!(site.kind, PatchKind::Plain);
    assert_eq!(site.call_rva, TEXT_RVA);
    assert_eq!(site.patch_rva, TEXT_RVA);
    assert_eq!(site.module, "KERNEL32.DLL");
    assert_eq!(site.symbol, "Sleep");
    assert!(site.import_added);

    // one new descriptor, for kernel32
    let imports = image.import_directory();
    assert_eq!(imports.descriptors().unwrap().len(), 1);
    assert!(imports.module_is_imported("Kernel32.dll").is_some());
    let slot = slot_of(&image, "KERNEL32.DLL", "Sleep");
    assert_eq!(slot, site.import_rva);

    let patched = image.read_bytes(TEXT_RVA as usize, 6).unwrap();
    let disp = call_operand(patched) as i32 as i64;
    let next = (GAME_BASE_64 + u64::from(TEXT_RVA) + 6) as i64;
    assert_eq!((next + disp) as u64, GAME_BASE_64 + u64::from(slot));
}

#[test]
fn bytes_outside_site_and_new_section_are_untouched() {
    let original = sleep_target(Bitness::X64).build();
    let FixOutcome { image, report } = run(&process_with(Bitness::X64, original.clone()));
    assert_eq!(report.patched.len(), 1);

    let ext = image.section_by_name(".vmpfix").unwrap();
    let headers = image.size_of_headers() as usize;
    let site = TEXT_RVA as usize..TEXT_RVA as usize + 6;
    let fixed = image.as_bytes();
    assert!(fixed.len() > original.len());
    assert_eq!(ext.virtual_address as usize, original.len());
    for (i, (before, after)) in original.iter().zip(fixed).enumerate() {
        if i < headers || site.contains(&i) {
            continue;
        }
        assert_eq!(before, after, "byte {i:#x} changed");
    }
}

#[test]
fn push_call_patch_starts_at_the_push() {
    let target = TargetBuilder::new(Bitness::X64)
        .stub(0, K32_BASE_64 + u64::from(SLEEP_RVA))
        .push_call(0x11, 0);
    let original = target.build();
    let FixOutcome { image, report } = run(&process_with(Bitness::X64, original.clone()));

    assert_eq!(report.patched.len(), 1);
    let site = &report.patched[0];
    assert_eq!(site.kind, PatchKind::PushCall);
    assert_eq!(site.call_rva, TEXT_RVA + 0x11);
    assert_eq!(site.patch_rva, TEXT_RVA + 0x10);

    let at = (TEXT_RVA + 0x10) as usize;
    let patched = image.read_bytes(at, 7).unwrap();
    assert_eq!(original[at], 0x53);
    assert_eq!(patched[0], 0xFF, "push must be overwritten");
    assert_eq!(patched[6], 0x48, "byte after the call must survive");

    let slot = slot_of(&image, "kernel32.dll", "Sleep");
    let disp = call_operand(patched) as i32 as i64;
    let next = (GAME_BASE_64 + u64::from(TEXT_RVA) + 0x10 + 6) as i64;
    assert_eq!((next + disp) as u64, GAME_BASE_64 + u64::from(slot));
}

#[test]
fn operand_encoding_differs_by_architecture() {
    let FixOutcome { image: x64, .. } = run(&sleep_target(Bitness::X64).process());
    let FixOutcome { image: x86, .. } = run(&sleep_target(Bitness::X86).process());

    let slot64 = slot_of(&x64, "KERNEL32.DLL", "Sleep");
    let slot86 = slot_of(&x86, "KERNEL32.DLL", "Sleep");

    // x64: displacement from the end of the patch
    let op64 = call_operand(x64.read_bytes(TEXT_RVA as usize, 6).unwrap());
    assert_eq!(op64 as i32, slot64 as i32 - (TEXT_RVA as i32 + 6));

    // x86: absolute address of the slot
    let op86 = call_operand(x86.read_bytes(TEXT_RVA as usize, 6).unwrap());
    assert_eq!(u64::from(op86), GAME_BASE_32 + u64::from(slot86));
}

#[test]
fn repeated_symbols_share_one_slot() {
    let sleep = K32_BASE_64 + u64::from(SLEEP_RVA);
    let tick = K32_BASE_64 + u64::from(GET_TICK_COUNT_RVA);
    let target = TargetBuilder::new(Bitness::X64)
        .stub(0x00, sleep)
        .stub(0x20, sleep)
        .stub(0x40, tick)
        .plain_call(0x00, 0x00)
        .plain_call(0x10, 0x20)
        .plain_call(0x20, 0x40)
        .plain_call(0x30, 0x00);
    let FixOutcome { image, report } = run(&target.process());

    assert_eq!(report.candidates, 4);
    assert_eq!(report.patched.len(), 4);
    assert_eq!(report.imports_added, 2);

    let sleep_slot = slot_of(&image, "KERNEL32.DLL", "Sleep");
    let tick_slot = slot_of(&image, "KERNEL32.DLL", "GetTickCount");
    assert_ne!(sleep_slot, tick_slot);
    let slots: Vec<u32> = report.patched.iter().map(|p| p.import_rva).collect();
    assert_eq!(slots, vec![sleep_slot, sleep_slot, tick_slot, sleep_slot]);
    assert_eq!(
        report.patched.iter().filter(|p| p.import_added).count(),
        2
    );
}

#[test]
fn existing_imports_are_reused() {
    let target = sleep_target(Bitness::X64).import("KERNEL32.dll", &["Sleep"]);
    let FixOutcome { image, report } = run(&target.process());

    assert_eq!(report.patched.len(), 1);
    assert_eq!(report.imports_added, 0);
    assert!(!report.patched[0].import_added);
    assert!(image.section_by_name(".vmpfix").is_none());

    let slot = slot_of(&image, "KERNEL32.DLL", "Sleep");
    assert_eq!(report.patched[0].import_rva, slot);
    let idata = image.section_by_name(".idata").unwrap();
    assert!(idata.contains_rva(slot));
}

#[test]
fn explicit_target_by_file_name() {
    let process = sleep_target(Bitness::X64).process();
    let mut fixer = ImportFixer::new(FixerConfig::default()).unwrap();
    let outcome = fixer.fix(&process, Some("GAME.EXE")).unwrap();
    assert_eq!(outcome.report.target_path, GAME_PATH);
    assert_eq!(outcome.report.patched.len(), 1);
}
