//! Fuzz wire frame parsing: version gate plus record decoding must never
//! panic on arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use prost::Message as _;
use whisper_session::proto::{
    check_version_byte, KeyExchangeMessage, PreKeyWhisperMessage, WhisperMessage,
};

fuzz_target!(|data: &[u8]| {
    if let Some((&version, rest)) = data.split_first() {
        let _ = check_version_byte(version);
        let _ = WhisperMessage::decode(rest);
        let _ = PreKeyWhisperMessage::decode(rest);
        let _ = KeyExchangeMessage::decode(rest);
    }
});
