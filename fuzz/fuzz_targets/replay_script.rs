#![no_main]

use flowaudit::config::AuditOptions;
use flowaudit::dispatcher::AuditDispatcher;
use flowaudit::modules::NoModules;
use flowaudit::records::MemoryWriter;
use flowaudit::replay::{parse_script, Replayer};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    // parsing must never panic; whatever parses must replay without panicking
    let Ok(events) = parse_script(input) else {
        return;
    };
    let options = AuditOptions {
        monitor: true,
        network_monitor: true,
        record_queue_capacity: 64,
        ..Default::default()
    };
    let audit = AuditDispatcher::new(options, Arc::new(NoModules), Box::new(MemoryWriter::new()));
    let mut replay = Replayer::new(audit);
    for event in events {
        let _ = replay.apply(event);
    }
    let _ = replay.finish();
});
