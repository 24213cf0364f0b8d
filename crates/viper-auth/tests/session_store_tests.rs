//! Session persistence across provider instances.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use viper_auth::{
    AuthClient, FirebaseIdentityProvider, IdentityProvider, Session, SessionSignal, SessionStore,
    epoch_ms,
};

fn temp_store(name: &str) -> SessionStore {
    let dir: PathBuf = std::env::temp_dir().join(format!(
        "viper-auth-{name}-{}-{}",
        std::process::id(),
        epoch_ms()
    ));
    SessionStore::new(dir.join("session.json"))
}

fn provider(store: SessionStore) -> FirebaseIdentityProvider {
    FirebaseIdentityProvider::new("test-api-key", Duration::from_secs(1))
        .expect("provider should build")
        .with_store(store)
}

fn live_session() -> Session {
    Session::new("uid-9", "owner@viper.ai", "id-token-9", epoch_ms() + 3_600_000)
        .with_refresh_token("refresh-9")
}

#[test]
fn session_store_tests_saved_session_loads_back_with_refresh_token() {
    let store = temp_store("round-trip");
    assert_eq!(store.load().expect("missing file is not an error"), None);

    let session = live_session();
    store.save(&session).expect("session should save");
    assert_eq!(store.load().expect("session should load"), Some(session));

    store.clear().expect("session should clear");
    assert_eq!(store.load().expect("cleared file is not an error"), None);
    store.clear().expect("clearing twice is fine");
}

#[test]
fn session_store_tests_corrupt_file_is_a_storage_error() {
    let store = temp_store("corrupt");
    std::fs::create_dir_all(store.path().parent().expect("store has a parent"))
        .expect("create temp dir");
    std::fs::write(store.path(), b"{not json").expect("write corrupt file");

    assert!(store.load().is_err());
}

#[tokio::test]
async fn session_store_tests_new_process_restores_persisted_session() {
    let store = temp_store("restore");
    store.save(&live_session()).expect("session should save");

    let client = AuthClient::new(Arc::new(provider(store.clone())));
    let signal = client.restore().await;

    let restored = signal.session().expect("persisted session should restore");
    assert_eq!(restored.uid, "uid-9");
    assert_eq!(restored.id_token(), "id-token-9");
    assert_eq!(client.current(), signal);
}

#[tokio::test]
async fn session_store_tests_expired_session_without_refresh_token_is_dropped() {
    let store = temp_store("expired");
    store
        .save(&Session::new("uid-9", "owner@viper.ai", "stale", 1))
        .expect("session should save");

    let signal = AuthClient::new(Arc::new(provider(store.clone()))).restore().await;

    assert_eq!(signal, SessionSignal::SignedOut);
    assert_eq!(store.load().expect("store should read"), None);
}

#[tokio::test]
async fn session_store_tests_sign_out_removes_persisted_session() {
    let store = temp_store("sign-out");
    store.save(&live_session()).expect("session should save");
    let provider = provider(store.clone());

    assert!(provider.current_session().await.expect("restore").is_some());
    provider.sign_out().await.expect("sign-out should succeed");

    assert_eq!(store.load().expect("store should read"), None);
    assert_eq!(provider.current_session().await.expect("restore"), None);
}
