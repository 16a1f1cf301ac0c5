#![no_main]
use libfuzzer_sys::fuzz_target;
use vmpfix::formats::pe::Image;

fuzz_target!(|data: &[u8]| {
    if let Ok(image) = Image::from_bytes(data.to_vec()) {
        let _ = image.sections();
        let _ = image.export_directory().exports(true);
        let _ = image.import_directory().imports();
        let _ = image.relocation_directory().blocks();
    }
});
