#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_wire::{LatencyMeasurement, SuspicionMeasurement};
use warden_monitor::ProcessId;

fuzz_target!(|data: &[u8]| {
    // Suspicions: whatever decodes must survive a re-encode unchanged.
    // Unknown phase codes collapse to Unknown, so compare values, not bytes.
    let reporter = ProcessId::new(3);
    if let Ok(suspicion) = SuspicionMeasurement::decode(data, reporter) {
        let again = SuspicionMeasurement::decode(&suspicion.encode(), reporter)
            .expect("re-encoded suspicion must decode");
        assert_eq!(suspicion, again);
    }

    // Latency vectors are canonical: the encoding is the input.
    if let Ok(latency) = LatencyMeasurement::decode(data) {
        assert_eq!(latency.encode().as_ref(), data);
        assert_eq!(LatencyMeasurement::wire_len(latency.n()), data.len());
    }
});
