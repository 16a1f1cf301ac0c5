#![no_main]
use libfuzzer_sys::fuzz_target;
use vmpfix::formats::pe::Image;

fuzz_target!(|data: &[u8]| {
    if let Ok(mut image) = Image::from_bytes(data.to_vec()) {
        let _ = image.import_directory_mut().add_import("KERNEL32.dll", "Sleep");
    }
});
