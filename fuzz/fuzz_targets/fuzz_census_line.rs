//! Fuzz target for `iter/bpf_map` output parsing.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tc_core::census::{parse_census_line, parse_census_output};

fuzz_target!(|data: &str| {
    let _ = parse_census_output(data);
    for line in data.lines() {
        if let Ok(parsed) = parse_census_line(line) {
            assert!(parsed.pressure() >= -1.0);
        }
    }
});
