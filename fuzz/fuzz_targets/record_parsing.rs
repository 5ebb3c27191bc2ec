//! Fuzz session record deserialization, including the legacy-document
//! migration path. Parsed records must survive a serialize round trip.

#![no_main]

use libfuzzer_sys::fuzz_target;
use whisper_session::SessionRecord;

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = SessionRecord::deserialize(data) {
        let bytes = record.serialize().expect("reparsed record must serialize");
        SessionRecord::deserialize(&bytes).expect("round trip must parse");
    }
});
