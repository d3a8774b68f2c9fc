#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use self_guard::{
    checksum_bytes, parse_maps_line, parse_tracer_pid, select_code_region,
    tracer_verdict_from_status,
};

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);

    for line in text.lines() {
        if let Some(region) = parse_maps_line(line) {
            assert!(region.start <= region.end);
        }
    }

    let section = select_code_region(&text, Some(Path::new("/proc/self/exe")));
    assert_eq!(section.is_available(), section.start() != 0 && section.size() != 0);

    let _ = parse_tracer_pid(&text);
    let _ = tracer_verdict_from_status(&text);
    let _ = checksum_bytes(data);
});
