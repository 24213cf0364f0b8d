//! Integration tests for the feed kill switch.

mod common;

use viper_app::{ENV_FEED_ENABLED, MonitorSession, feed_enabled_from_env};
use viper_core::OverlayState;

#[test]
fn kill_switch_behavior_tests_disables_feed_when_env_is_false() {
    // Safety:
    // - Only this test touches VIPER_FEED_ENABLED in this binary.
    // - We reset the variable before returning.
    unsafe { std::env::set_var(ENV_FEED_ENABLED, "false") };
    assert!(!feed_enabled_from_env());

    // Safety: see rationale above.
    unsafe { std::env::set_var(ENV_FEED_ENABLED, "Off") };
    assert!(!feed_enabled_from_env());

    // Safety: see rationale above.
    unsafe { std::env::set_var(ENV_FEED_ENABLED, "true") };
    assert!(feed_enabled_from_env());

    // Safety: see rationale above.
    unsafe { std::env::remove_var(ENV_FEED_ENABLED) };
    assert!(feed_enabled_from_env());
}

#[tokio::test(start_paused = true)]
async fn kill_switch_behavior_tests_session_skips_frame_polling() {
    let fixture = common::fixture(OverlayState::default(), "[]");
    let config = common::config_from(&[(ENV_FEED_ENABLED, "0")]);

    let session = MonitorSession::start(config, fixture.backends)
        .await
        .expect("session should start");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    assert_eq!(session.feed_snapshot(), None);
    assert_eq!(fixture.frames.load_count(), 0);
    assert_eq!(session.runtime_status().feed, "DISABLED");
    session.shutdown().await;
}
