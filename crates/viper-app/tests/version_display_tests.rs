//! Integration tests for VERSION propagation into runtime display.

use std::fs;

use viper_app::{app_version, project_runtime_status};
use viper_ui::DashboardState;

#[test]
fn version_display_tests_matches_root_version_file() {
    let root_version_path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../VERSION");
    let root_version = fs::read_to_string(root_version_path).expect("VERSION should be readable");
    assert_eq!(app_version(), root_version.trim());
}

#[test]
fn version_display_tests_flows_into_status_line() {
    let status = project_runtime_status(&DashboardState::new(app_version()), true);
    assert_eq!(status.version, app_version());
}
