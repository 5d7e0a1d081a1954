//! Logging Tests
//!
//! Captures the structured trace emitted by refcount operations. Everything
//! runs in a single test because the logger is process-global.

use rcbox_runtime::fatal::{self, FatalPolicy};
use rcbox_runtime::log::{self, LogFormat, LogLevel, LogSink};
use rcbox_runtime::{allocate, release, retain, retain_count};
use std::panic::{self, AssertUnwindSafe};

#[test]
fn test_refcount_trace_and_fatal_logging() {
    fatal::set_policy(FatalPolicy::Panic);
    log::set_sink(LogSink::Capture);
    log::set_level(LogLevel::Trace);
    log::set_format(LogFormat::Plain);

    let p = allocate(8, None);
    let address = format!("{:#x}", p.as_ptr() as usize);
    unsafe {
        retain(p);
        retain(p);
        assert_eq!(retain_count(p), 2);
        release(p);
        release(p);
    }

    let lines = log::take_captured();
    let events = [
        "creating box",
        "retaining object",
        "retaining object",
        "getting retain count",
        "releasing object",
        "releasing object",
        "deallocating",
    ];
    let mut cursor = lines.iter();
    for event in events {
        let found = cursor.any(|line| line.contains("[rcbox::refcount]") && line.contains(event));
        assert!(found, "missing {event:?} in {lines:#?}");
    }
    assert!(lines
        .iter()
        .filter(|line| line.contains("[rcbox::refcount]"))
        .all(|line| line.contains(&format!("address={address}"))));
    assert!(lines.iter().any(|line| line.contains("retaining object") && line.contains("retain_count=2")));

    // Fatal errors are logged at error level before unwinding.
    let result = panic::catch_unwind(AssertUnwindSafe(|| unsafe { retain(p) }));
    assert!(result.is_err());
    let lines = log::take_captured();
    let fatal_line = lines
        .iter()
        .find(|line| line.contains("[rcbox::fatal]"))
        .expect("fatal error logged");
    assert!(fatal_line.contains("ERROR"));
    assert!(fatal_line.contains("used after deallocation"));
    assert!(fatal_line.contains("kind=use_after_free"));

    // JSON output and level filtering.
    log::set_format(LogFormat::Json);
    let q = allocate(4, None);
    unsafe { retain(q) };
    let lines = log::take_captured();
    assert!(lines.iter().any(|line| line.contains("\"target\":\"rcbox::refcount\"")
        && line.contains("\"message\":\"retaining object\"")
        && line.contains("\"retain_count\":1")));

    log::set_level(LogLevel::Warn);
    unsafe { release(q) };
    assert!(log::take_captured().is_empty());

    log::set_format(LogFormat::Plain);
    log::set_sink(LogSink::Stderr);
}
