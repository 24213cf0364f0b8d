//! Tests overlay state decoding from remote payloads.

use viper_core::{OverlayName, OverlayState};

#[test]
fn overlay_state_codec_tests_missing_fields_default_to_off() {
    let state = OverlayState::from_json_bytes(br#"{"gas":true}"#).expect("partial payload should decode");
    assert_eq!(
        state,
        OverlayState {
            ai: false,
            gas: true,
            thermal: false,
        }
    );
}

#[test]
fn overlay_state_codec_tests_ignores_unknown_keys() {
    let state = OverlayState::from_json_bytes(br#"{"ai":true,"gas":false,"thermal":true,"extra":1}"#)
        .expect("payload with extra keys should decode");
    assert_eq!(state.enabled(), vec![OverlayName::Ai, OverlayName::Thermal]);
}

#[test]
fn overlay_state_codec_tests_rejects_non_object_payload() {
    assert!(OverlayState::from_json_bytes(b"[true,false]").is_err());
}
