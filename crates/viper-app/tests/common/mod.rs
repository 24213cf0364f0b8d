//! Shared in-memory backends for app integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use viper_app::{MonitorBackends, MonitorConfig};
use viper_auth::{Credentials, IdentityProvider, ProviderError, Session};
use viper_core::{OverlayAction, OverlayName, OverlayState};
use viper_feed::SyntheticFrameSource;
use serde_json::Value;
use viper_history::{HistoryError, HistorySource, MissionSource};
use viper_overlay::{OverlayError, OverlayTransport};

/// Email accepted by [`FixedIdentity`].
pub const EMAIL: &str = "manager@viper.ai";
/// Password accepted by [`FixedIdentity`].
pub const PASSWORD: &str = "correct-horse";

/// Overlay server that stores one record and can be switched off.
pub struct MemoryOverlayServer {
    state: Mutex<OverlayState>,
    pub reachable: AtomicBool,
    pub writes: AtomicU32,
}

impl MemoryOverlayServer {
    pub fn new(state: OverlayState) -> Self {
        Self {
            state: Mutex::new(state),
            reachable: AtomicBool::new(true),
            writes: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl OverlayTransport for MemoryOverlayServer {
    async fn fetch(&self) -> Result<OverlayState, OverlayError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(OverlayError::Transport("connection refused".to_string()));
        }
        Ok(*self.state.lock().expect("lock"))
    }

    async fn set(
        &self,
        name: OverlayName,
        action: OverlayAction,
    ) -> Result<OverlayState, OverlayError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(OverlayError::Transport("connection refused".to_string()));
        }
        let mut state = self.state.lock().expect("lock");
        *state = state.with(name, action.enabled());
        Ok(*state)
    }
}

/// History source serving one fixed body.
pub struct FixedHistory(pub &'static str);

#[async_trait]
impl HistorySource for FixedHistory {
    async fn fetch_history(&self) -> Result<Vec<u8>, HistoryError> {
        Ok(self.0.as_bytes().to_vec())
    }
}

/// Mission source serving a replaceable snapshot to callers with a token.
pub struct MemoryMissions {
    pub snapshot: Mutex<Value>,
    pub tokens: Mutex<Vec<String>>,
}

impl MemoryMissions {
    pub fn new(snapshot: Value) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            tokens: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MissionSource for MemoryMissions {
    async fn fetch_missions(&self, id_token: Option<&str>) -> Result<Value, HistoryError> {
        let Some(token) = id_token else {
            return Err(HistoryError::Status(401));
        };
        self.tokens.lock().expect("lock").push(token.to_string());
        Ok(self.snapshot.lock().expect("lock").clone())
    }
}

/// Identity provider with one account.
#[derive(Default)]
pub struct FixedIdentity {
    session: Mutex<Option<Session>>,
}

#[async_trait]
impl IdentityProvider for FixedIdentity {
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, ProviderError> {
        if credentials.email != EMAIL || credentials.password != PASSWORD {
            return Err(ProviderError::Rejected("INVALID_LOGIN_CREDENTIALS".to_string()));
        }
        let session = Session::new("uid-1", EMAIL, "token-1", u64::MAX);
        *self.session.lock().expect("lock") = Some(session.clone());
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        *self.session.lock().expect("lock") = None;
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        Ok(self.session.lock().expect("lock").clone())
    }
}

/// Config built from an explicit variable table.
pub fn config_from(pairs: &[(&str, &str)]) -> MonitorConfig {
    let table: BTreeMap<String, String> = pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    MonitorConfig::from_lookup(|name| table.get(name).cloned()).expect("config should load")
}

/// In-memory backends plus handles the tests poke at.
pub struct Fixture {
    pub backends: MonitorBackends,
    pub frames: Arc<SyntheticFrameSource>,
    pub overlays: Arc<MemoryOverlayServer>,
    pub missions: Arc<MemoryMissions>,
}

pub fn fixture(overlay: OverlayState, history: &'static str) -> Fixture {
    let frames = Arc::new(SyntheticFrameSource::new());
    let overlays = Arc::new(MemoryOverlayServer::new(overlay));
    let missions = Arc::new(MemoryMissions::new(Value::Null));
    Fixture {
        backends: MonitorBackends {
            frames: frames.clone(),
            overlays: overlays.clone(),
            history: Arc::new(FixedHistory(history)),
            missions: Some(missions.clone()),
            identity: Arc::new(FixedIdentity::default()),
        },
        frames,
        overlays,
        missions,
    }
}
