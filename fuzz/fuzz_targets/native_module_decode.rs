#![no_main]
use libfuzzer_sys::fuzz_target;
use native_loader::module::format::{decode, encode, inspect, DecodeOptions, HEADER_SIZE};

fuzz_target!(|data: &[u8]| {
    // Malformed images must be rejected with an error, never a panic
    let options = DecodeOptions::default();
    let summary = inspect(data, &options);

    if let Ok(module) = decode(data, &options) {
        // Anything that decodes was also accepted by the header-only path
        assert!(summary.is_ok());

        let encoded = encode(&module).expect("decoded module re-encodes");
        let again = decode(&encoded, &options).expect("re-encoded module decodes");
        assert_eq!(again, module);
    }

    // Truncations at and around the header boundary
    for cut in [HEADER_SIZE.saturating_sub(1), HEADER_SIZE, HEADER_SIZE + 1] {
        if data.len() > cut {
            let _ = decode(&data[..cut], &options);
        }
    }

    // Single bit flip in the body
    if data.len() > HEADER_SIZE {
        let mut corrupted = data.to_vec();
        let at = HEADER_SIZE + (data[0] as usize % (data.len() - HEADER_SIZE));
        corrupted[at] ^= 0x01;
        let _ = decode(&corrupted, &options);
    }
});
