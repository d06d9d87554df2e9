#![no_main]
use libfuzzer_sys::fuzz_target;
use prahari::message::SessionKeyPurpose;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = SessionKeyPurpose::from_json(text);
    }
});
