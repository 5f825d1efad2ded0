//! Fuzz target for mutation record decoding.
//!
//! Arbitrary bytes must decode or fail with a `DecodeError`, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tc_core::stream::{decode_record, MutationKind, RECORD_LEN};

fuzz_target!(|data: &[u8]| {
    if let Ok(event) = decode_record(data) {
        assert!(data.len() >= RECORD_LEN);
        assert_eq!(MutationKind::from_wire(event.kind.to_wire()), Some(event.kind));
    }
});
