use tempfile::TempDir;

use vmpfix::fixer::FixReport;
use vmpfix::formats::pe::{Bitness, Image, IMAGE_DIRECTORY_ENTRY_IMPORT};
use vmpfix::{FixerConfig, ImportFixer, RunState};

use crate::common::*;

fn config_in(dir: &TempDir) -> FixerConfig {
    FixerConfig {
        output_dir: dir.path().join("dumps"),
        ..Default::default()
    }
}

#[test]
fn dump_writes_a_loadable_fixed_image() {
    let dir = TempDir::new().unwrap();
    let mut fixer = ImportFixer::new(config_in(&dir)).unwrap();
    let report = fixer
        .dump_in_memory(&sleep_target(Bitness::X64).process(), None)
        .unwrap();
    assert_eq!(fixer.state(), RunState::Written);

    let path = dir.path().join("dumps").join("game.exe.fixed");
    assert_eq!(report.output_path.as_deref(), Some(path.as_path()));
    assert!(path.exists());
    assert!(!path.with_extension("fixed.json").exists());

    let image = Image::from_path(&path).unwrap();
    assert_eq!(image.bitness(), Bitness::X64);
    let slot = image
        .import_directory()
        .find_import("KERNEL32.DLL", "Sleep")
        .unwrap();
    assert_eq!(slot, report.patched[0].import_rva);

    let at = image.rva_to_offset(TEXT_RVA).unwrap();
    let disp = call_operand(image.read_bytes(at, 6).unwrap()) as i32;
    assert_eq!(disp, slot as i32 - (TEXT_RVA as i32 + 6));
}

#[test]
fn report_is_written_next_to_the_image() {
    let dir = TempDir::new().unwrap();
    let config = FixerConfig {
        write_report: true,
        ..config_in(&dir)
    };
    let mut fixer = ImportFixer::new(config).unwrap();
    let report = fixer
        .dump_in_memory(&sleep_target(Bitness::X86).process(), None)
        .unwrap();

    let json_path = dir.path().join("dumps").join("game.exe.fixed.json");
    let json = std::fs::read_to_string(&json_path).unwrap();
    let parsed = FixReport::from_json(&json).unwrap();
    assert_eq!(parsed, report);
    assert_eq!(parsed.bitness, 32);
    assert_eq!(parsed.patched[0].symbol, "Sleep");
}

#[test]
fn fatal_runs_write_nothing() {
    let dir = TempDir::new().unwrap();
    let config = FixerConfig {
        vmp_section: ".vmp1".to_string(),
        ..config_in(&dir)
    };
    let mut fixer = ImportFixer::new(config).unwrap();
    assert!(fixer
        .dump_in_memory(&sleep_target(Bitness::X64).process(), None)
        .is_err());
    assert_eq!(fixer.state(), RunState::Failed);
    assert!(!dir.path().join("dumps").exists());
}

#[test]
fn written_image_round_trips() {
    let dir = TempDir::new().unwrap();
    let mut fixer = ImportFixer::new(config_in(&dir)).unwrap();
    let outcome = fixer
        .fix(&sleep_target(Bitness::X64).process(), None)
        .unwrap();
    let path = dir.path().join("roundtrip.bin");
    outcome.image.write_to_file(&path).unwrap();

    let reloaded = Image::from_path(&path).unwrap();
    assert_eq!(reloaded.as_bytes(), outcome.image.as_bytes());
    assert_eq!(reloaded.sections().unwrap(), outcome.image.sections().unwrap());
    assert_eq!(
        reloaded.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT),
        outcome.image.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT)
    );
}
