#![no_main]
use libfuzzer_sys::fuzz_target;
use prahari::message::SessionKeyReq;

fuzz_target!(|data: &[u8]| {
    let _ = SessionKeyReq::parse_plaintext(data);
});
