//! Fuzzes the HID report descriptor parser and field extraction.
//!
//! Run with:
//!   cargo +nightly fuzz run fuzz_report_descriptor
#![no_main]
use libfuzzer_sys::fuzz_target;
use openracing_hid_common::parse_report_descriptor;

fuzz_target!(|data: &[u8]| {
    // The first byte splits the input into descriptor and report.
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let split = usize::from(split).min(rest.len());
    let (descriptor, report) = rest.split_at(split);

    if let Ok(parsed) = parse_report_descriptor(descriptor) {
        let _ = parsed.is_game_controller();
        for field in &parsed.fields {
            let _ = field.extract(report);
            let _ = field.normalized(report);
        }
    }
});
