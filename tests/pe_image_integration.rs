//! Image model, pattern scanner and import editor properties.

use std::ops::Range;

use tempfile::NamedTempFile;
use vmpfix::formats::pe::{
    Bitness, Image, ImageBuilder, SectionFlags, EXTENSION_FILL, IMAGE_DIRECTORY_ENTRY_IMPORT,
};

fn file_image(bitness: Bitness) -> Image {
    let mut text = vec![0x90u8; 0x300];
    text[0x10..0x16].copy_from_slice(&[0xE8, 0x11, 0x22, 0x33, 0x44, 0xCC]);
    text[0x80..0x86].copy_from_slice(&[0xE8, 0x55, 0x66, 0x77, 0x88, 0xC3]);
    text[0x200..0x205].copy_from_slice(&[0xFF, 0x15, 0x00, 0x10, 0x00]);
    ImageBuilder::new(bitness)
        .with_section(".text", SectionFlags::MEM_EXECUTE | SectionFlags::MEM_READ, text)
        .with_section(".data", SectionFlags::MEM_READ | SectionFlags::MEM_WRITE, vec![0u8; 0x80])
        .build_image()
        .unwrap()
}

#[test]
fn rva_offset_inverse_law() {
    let image = file_image(Bitness::X64);
    for section in image.sections().unwrap() {
        assert_ne!(
            section.pointer_to_raw_data, section.virtual_address,
            "file layout keeps raw and virtual addresses apart"
        );
        // only the part backed by both raw data and virtual size maps both ways
        let backed = section.virtual_size.min(section.size_of_raw_data);
        let start = section.pointer_to_raw_data as usize;
        for offset in start..start + backed as usize {
            let rva = image.offset_to_rva(offset).unwrap();
            assert_eq!(image.rva_to_offset(rva), Some(offset));
        }
        for rva in section.virtual_address..section.virtual_address + backed {
            let offset = image.rva_to_offset(rva).unwrap();
            assert_eq!(image.offset_to_rva(offset), Some(rva));
        }
    }
    assert_eq!(image.rva_to_offset(0x10_0000), None);
}

#[test]
fn pattern_scan_honours_wildcards() {
    let image = file_image(Bitness::X64);
    let text = image.section_by_name(".text").unwrap();
    let base = text.pointer_to_raw_data as usize;

    let calls = image.find_binary_sequence(&text, "E8 ? ? ? ?").unwrap();
    assert_eq!(calls, vec![base + 0x10, base + 0x80]);

    let trapped = image.find_binary_sequence(&text, "E8 ? ? ? ? CC").unwrap();
    assert_eq!(trapped, vec![base + 0x10]);

    let none = image.find_binary_sequence(&text, "E8 ? ? ? ? 90 90 EB").unwrap();
    assert!(none.is_empty());

    let tagged = image
        .find_binary_sequences(&text, &[("indirect", "FF 15 ? ? ? ?"), ("direct", "E8 ? ? ? ?")])
        .unwrap();
    assert_eq!(
        tagged,
        vec![("direct", base + 0x10), ("direct", base + 0x80), ("indirect", base + 0x200)]
    );
    assert!(image.find_binary_sequence(&text, "E8 ZZ").is_err());
}

fn overlaps(a: &Range<u32>, b: &Range<u32>) -> bool {
    a.start < b.end && b.start < a.end
}

#[test]
fn allocations_are_disjoint_and_overwrite_fill() {
    let mut image = file_image(Bitness::X64);
    let word = image.word_size() as u32;
    let symbols = ["Sleep", "GetTickCount", "CreateFileW", "ReadFile", "CloseHandle"];

    let mut regions: Vec<Range<u32>> = Vec::new();
    let mut name_rva = None;
    for symbol in symbols {
        let added = image
            .import_directory_mut()
            .add_imports("KERNEL32.dll", &[symbol])
            .unwrap();
        assert_eq!(added.len(), 1);
        let added = &added[0];
        assert!(!added.reused);
        assert_eq!(*name_rva.get_or_insert(added.module_name_rva), added.module_name_rva);

        regions.push(added.iat_rva..added.iat_rva + 2 * word);
        regions.push(added.lookup_rva..added.lookup_rva + 2 * word);
        let hint_len = 2 + symbol.len() as u32 + 1;
        regions.push(added.hint_name_rva..added.hint_name_rva + hint_len);

        let name = image.rva_to_offset(added.hint_name_rva + 2).unwrap();
        assert_eq!(image.read_bytes(name, symbol.len()).unwrap(), symbol.as_bytes());
        assert_eq!(image.read_word_at_rva(added.iat_rva).unwrap(), u64::from(added.hint_name_rva));
        assert_eq!(image.read_word_at_rva(added.iat_rva + word).unwrap(), 0);
    }
    let name_rva = name_rva.unwrap();
    regions.push(name_rva..name_rva + "KERNEL32.dll".len() as u32 + 1);

    for (i, a) in regions.iter().enumerate() {
        for b in &regions[i + 1..] {
            assert!(!overlaps(a, b), "{a:x?} overlaps {b:x?}");
        }
    }
    // string regions hold no leftover fill bytes
    for region in regions.iter().skip(2).step_by(3).chain(regions.last()) {
        let at = image.rva_to_offset(region.start).unwrap();
        let bytes = image.read_bytes(at, region.len()).unwrap();
        assert!(!bytes.contains(&EXTENSION_FILL), "{region:x?}");
    }
    assert_eq!(image.import_directory().descriptors().unwrap().len(), symbols.len());
}

#[test]
fn adding_the_same_import_twice_is_idempotent() {
    let mut image = file_image(Bitness::X86);
    let first = image
        .import_directory_mut()
        .add_import("USER32.dll", "MessageBoxA")
        .unwrap();
    let len = image.len();
    let sections = image.sections().unwrap();
    let dir = image.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT);

    let second = image
        .import_directory_mut()
        .add_import("user32.dll", "MessageBoxA")
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(image.len(), len);
    assert_eq!(image.sections().unwrap(), sections);
    assert_eq!(image.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT), dir);
}

#[test]
fn file_round_trip_preserves_layout() {
    let mut image = file_image(Bitness::X64);
    image
        .import_directory_mut()
        .add_import("KERNEL32.dll", "Sleep")
        .unwrap();

    let file = NamedTempFile::new().unwrap();
    image.write_to_file(file.path()).unwrap();
    let reloaded = Image::from_path(file.path()).unwrap();

    assert_eq!(reloaded.sections().unwrap(), image.sections().unwrap());
    assert_eq!(
        reloaded.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT),
        image.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT)
    );
    assert_eq!(reloaded.as_bytes(), image.as_bytes());
    assert!(reloaded
        .import_directory()
        .find_import("KERNEL32.dll", "Sleep")
        .is_some());
}

#[test]
fn bitness_mismatch_is_rejected() {
    let bytes = ImageBuilder::new(Bitness::X86)
        .with_section(".text", SectionFlags::MEM_EXECUTE, vec![0xC3; 0x10])
        .build()
        .unwrap();
    assert_eq!(Bitness::detect(&bytes).unwrap(), Bitness::X86);
    assert!(Image::from_bytes_as(bytes.clone(), Bitness::X64).is_err());
    assert!(Image::from_live_memory(bytes, Bitness::X64).is_err());
}
