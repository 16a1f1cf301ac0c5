use vmpfix::error::EmulationBudget;
use vmpfix::formats::pe::Bitness;
use vmpfix::{FixerConfig, FixerError, ImportFixer, RunState, SnapshotProcess};

use crate::common::*;

#[test]
fn failing_sites_are_skipped_and_the_run_continues() {
    let sleep = K32_BASE_64 + u64::from(SLEEP_RVA);
    let target = TargetBuilder::new(Bitness::X64)
        // no module owns the return address
        .stub(0x00, 0xDEAD_0000)
        // inside kernel32 but not an export entry
        .stub(0x20, sleep + 1)
        // cpuid; ret
        .vmp_bytes(0x40, &[0x0F, 0xA2, 0xC3])
        .stub(0x60, sleep)
        .plain_call(0x00, 0x00)
        .plain_call(0x10, 0x20)
        .plain_call(0x20, 0x40)
        .plain_call(0x30, 0x60);
    let original = target.build();

    let mut fixer = ImportFixer::new(FixerConfig::default()).unwrap();
    let outcome = fixer
        .fix(&process_with(Bitness::X64, original.clone()), None)
        .unwrap();
    let report = outcome.report;
    assert_eq!(fixer.state(), RunState::Patched);
    assert_eq!(report.candidates, 4);
    assert_eq!(report.patched.len(), 1);
    assert_eq!(report.patched[0].call_rva, TEXT_RVA + 0x30);
    assert_eq!(report.skipped.len(), 3);

    let reasons: Vec<&str> = report.skipped.iter().map(|s| s.reason.as_str()).collect();
    assert!(reasons[0].contains("no module"), "{}", reasons[0]);
    assert!(reasons[1].contains("no export"), "{}", reasons[1]);
    assert!(reasons[2].contains("emulation failed"), "{}", reasons[2]);

    // skipped sites keep their original bytes
    for skipped in &report.skipped {
        let at = skipped.call_rva as usize;
        assert_eq!(
            outcome.image.read_bytes(at, 6).unwrap(),
            &original[at..at + 6]
        );
    }
}

#[test]
fn runaway_stub_exhausts_the_budget() {
    // jmp $
    let target = TargetBuilder::new(Bitness::X64)
        .vmp_bytes(0, &[0xEB, 0xFE])
        .plain_call(0, 0);

    let config = FixerConfig {
        budget: EmulationBudget {
            max_instructions: 64,
        },
        ..Default::default()
    };
    let mut fixer = ImportFixer::new(config).unwrap();
    let report = fixer
        .fix(&target.process(), None)
        .unwrap()
        .report;
    assert!(report.patched.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].reason.contains("budget"), "{}", report.skipped[0].reason);
}

#[test]
fn ambiguous_site_is_left_alone() {
    let sleep = K32_BASE_64 + u64::from(SLEEP_RVA);
    let call = call_rel32(TEXT_RVA + 0x21, VMP_RVA);
    let mut bytes = vec![0x90];
    bytes.extend_from_slice(&call);
    bytes.extend_from_slice(&[0x48, 0x89, 0xC3]);
    let target = TargetBuilder::new(Bitness::X64)
        .stub(0, sleep)
        .text_bytes(0x20, &bytes);
    let original = target.build();

    let mut fixer = ImportFixer::new(FixerConfig::default()).unwrap();
    let outcome = fixer
        .fix(&process_with(Bitness::X64, original.clone()), None)
        .unwrap();
    assert_eq!(outcome.report.candidates, 1);
    assert!(outcome.report.patched.is_empty());
    assert!(outcome.report.skipped[0].reason.contains("ambiguous"));
    let at = (TEXT_RVA + 0x20) as usize;
    assert_eq!(outcome.image.read_bytes(at, 7).unwrap(), &original[at..at + 7]);
    assert!(outcome.image.section_by_name(".vmpfix").is_none());
}

#[test]
fn calls_outside_the_protected_section_are_not_candidates() {
    let local = call_rel32(TEXT_RVA + 0x40, TEXT_RVA + 0x80);
    let target = sleep_target(Bitness::X64).text_bytes(0x40, &local);
    let mut fixer = ImportFixer::new(FixerConfig::default()).unwrap();
    let report = fixer.fix(&target.process(), None).unwrap().report;
    assert_eq!(report.call_matches, 2);
    assert_eq!(report.candidates, 1);
    assert_eq!(report.patched.len(), 1);
}

#[test]
fn unknown_target_module_is_fatal() {
    let mut fixer = ImportFixer::new(FixerConfig::default()).unwrap();
    let err = fixer
        .fix(&sleep_target(Bitness::X64).process(), Some("missing.dll"))
        .unwrap_err();
    assert!(matches!(err, FixerError::TargetNotFound(ref name) if name == "missing.dll"));
    assert_eq!(fixer.state(), RunState::Failed);
}

#[test]
fn missing_code_section_is_fatal() {
    let config = FixerConfig {
        code_section: ".code".to_string(),
        ..Default::default()
    };
    let mut fixer = ImportFixer::new(config).unwrap();
    let err = fixer
        .fix(&sleep_target(Bitness::X64).process(), None)
        .unwrap_err();
    assert!(matches!(
        err,
        FixerError::SectionMissing { ref name, ref module } if name == ".code" && module == "game.exe"
    ));
}

#[test]
fn empty_process_is_fatal() {
    let mut fixer = ImportFixer::new(FixerConfig::default()).unwrap();
    let err = fixer
        .fix(&SnapshotProcess::new(Bitness::X64), None)
        .unwrap_err();
    assert!(matches!(err, FixerError::NoModules));
}
