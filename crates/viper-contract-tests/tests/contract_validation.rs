//! Validates wire fixtures and client encodings against frozen JSON schemas.

use jsonschema::JSONSchema;
use serde_json::Value;
use viper_core::{OverlayName, OverlayState};
use viper_history::parse_history;

const OVERLAY_SCHEMA: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../contracts/overlay-state.schema.json"
);
const HISTORY_SCHEMA: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../contracts/detection-history.schema.json"
);
const OVERLAY_FIXTURE: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../contracts/fixtures/overlay-state.valid.json"
);
const HISTORY_FIXTURE: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../contracts/fixtures/detection-history.valid.json"
);

fn load_json(path: &str) -> Value {
    let raw = std::fs::read_to_string(path).expect("json file should be readable");
    serde_json::from_str(&raw).expect("json file should be valid")
}

fn compile_validator(schema_path: &str) -> JSONSchema {
    let schema = load_json(schema_path);
    JSONSchema::compile(&schema).expect("schema should compile")
}

#[test]
fn overlay_fixture_matches_schema() {
    let validator = compile_validator(OVERLAY_SCHEMA);
    assert!(
        validator.is_valid(&load_json(OVERLAY_FIXTURE)),
        "overlay fixture should validate against schema"
    );
}

#[test]
fn encoded_overlay_state_matches_schema() {
    let validator = compile_validator(OVERLAY_SCHEMA);
    let state = OverlayState::default().with(OverlayName::Thermal, true);
    let encoded: Value =
        serde_json::from_slice(&state.to_json_bytes().expect("state should encode"))
            .expect("encoded state should be json");

    assert!(validator.is_valid(&encoded));
    assert!(!validator.is_valid(&serde_json::json!({"ai": true, "gas": "on", "thermal": false})));
}

#[test]
fn fixture_overlay_decodes_to_expected_state() {
    let raw = std::fs::read(OVERLAY_FIXTURE).expect("fixture should be readable");
    let state = OverlayState::from_json_bytes(&raw).expect("fixture should decode");
    assert_eq!(state, OverlayState::default().with(OverlayName::Gas, true));
}

#[test]
fn history_fixture_matches_schema_and_parses() {
    let validator = compile_validator(HISTORY_SCHEMA);
    let fixture = load_json(HISTORY_FIXTURE);
    assert!(
        validator.is_valid(&fixture),
        "history fixture should validate against schema"
    );

    let raw = std::fs::read(HISTORY_FIXTURE).expect("fixture should be readable");
    let records = parse_history(&raw).expect("fixture should parse");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].label, "Crack");
}
