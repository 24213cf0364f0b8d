//! Tests detection record defaults and severity buckets.

use viper_core::{DetectionRecord, Severity, UNKNOWN_LABEL};

#[test]
fn detection_record_tests_fill_missing_fields() {
    let record: DetectionRecord =
        serde_json::from_str(r#"{"confidence":91.2}"#).expect("sparse record should decode");
    assert_eq!(record.label, UNKNOWN_LABEL);
    assert_eq!(record.time, "");
    assert_eq!(record.date, "");
    assert_eq!(record.image, None);
    assert_eq!(record.severity(), Severity::High);
}

#[test]
fn detection_record_tests_severity_thresholds_are_exclusive() {
    assert_eq!(Severity::from_confidence(85.0), Severity::Medium);
    assert_eq!(Severity::from_confidence(85.1), Severity::High);
    assert_eq!(Severity::from_confidence(70.0), Severity::Low);
    assert_eq!(Severity::from_confidence(70.5), Severity::Medium);
}
