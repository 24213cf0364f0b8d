#![warn(missing_docs)]
//! # viper-overlay
//!
//! ## Purpose
//! Keeps the local overlay flags (`ai`, `gas`, `thermal`) consistent with the
//! rig's overlay endpoint, which is the single authority for their values.
//!
//! ## Responsibilities
//! - Read the authoritative record (`GET {server}/overlay`).
//! - Toggle one flag (`POST {server}/overlay/{name}/{on|off}`) and adopt the
//!   record the server returns, not the locally predicted flip.
//! - Gate repeat activation per overlay while a toggle is in flight.
//! - Hold a transient error banner that expires on its own.
//!
//! ## Data flow
//! UI action -> [`OverlaySynchronizer::toggle`] marks the overlay pending ->
//! [`OverlayTransport::set`] -> confirmed state replaced wholesale (success)
//! or pending entry discarded and banner raised (failure) -> subscribers see
//! the confirmed record through [`OverlaySynchronizer::subscribe`].
//!
//! ## Ownership and lifetimes
//! The synchronizer exclusively owns the confirmed [`OverlayState`]. It is
//! only ever replaced as a whole, and internal locks are released before any
//! network await.
//!
//! ## Error model
//! `fetch_state` never fails to the caller; failures are logged and the
//! current state is returned. `toggle` failures surface as [`ToggleError`]
//! for transient display and leave the confirmed state untouched.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;
use viper_core::{CoreError, OverlayAction, OverlayName, OverlayState, join_endpoint};

/// Default lifetime of the toggle failure banner.
pub const DEFAULT_BANNER_TTL_MS: u64 = 3_000;
/// Banner text shown after a failed toggle.
pub const TOGGLE_FAILED_MESSAGE: &str = "Failed to toggle overlay";

/// Abstract transport to the overlay authority.
#[async_trait]
pub trait OverlayTransport: Send + Sync {
    /// Reads the current authoritative record.
    async fn fetch(&self) -> Result<OverlayState, OverlayError>;

    /// Requests `action` for `name` and returns the post-toggle record.
    async fn set(
        &self,
        name: OverlayName,
        action: OverlayAction,
    ) -> Result<OverlayState, OverlayError>;
}

/// HTTP transport against the rig's overlay endpoints.
#[derive(Debug, Clone)]
pub struct HttpOverlayTransport {
    client: reqwest::Client,
    overlay_url: Url,
}

impl HttpOverlayTransport {
    /// Creates a transport for `{server}/overlay`.
    ///
    /// # Errors
    /// Returns [`OverlayError::InvalidEndpoint`] when the overlay URL cannot be
    /// derived and [`OverlayError::Transport`] when the client cannot be built.
    pub fn new(server: &Url, timeout: Duration) -> Result<Self, OverlayError> {
        let overlay_url = join_endpoint(server, "overlay")
            .map_err(|error| OverlayError::InvalidEndpoint(error.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| OverlayError::Transport(format!("http client build failed: {error}")))?;

        Ok(Self {
            client,
            overlay_url,
        })
    }

    /// Read endpoint URL.
    pub fn overlay_url(&self) -> &Url {
        &self.overlay_url
    }

    /// Toggle endpoint URL for `name`/`action`.
    ///
    /// # Errors
    /// Returns [`OverlayError::InvalidEndpoint`] when the join fails.
    pub fn toggle_url(&self, name: OverlayName, action: OverlayAction) -> Result<Url, OverlayError> {
        join_endpoint(&self.overlay_url, &format!("{name}/{action}"))
            .map_err(|error| OverlayError::InvalidEndpoint(error.to_string()))
    }
}

#[async_trait]
impl OverlayTransport for HttpOverlayTransport {
    async fn fetch(&self) -> Result<OverlayState, OverlayError> {
        let response = self
            .client
            .get(self.overlay_url.clone())
            .send()
            .await
            .map_err(|error| OverlayError::Transport(error.to_string()))?;
        decode_state(response).await
    }

    async fn set(
        &self,
        name: OverlayName,
        action: OverlayAction,
    ) -> Result<OverlayState, OverlayError> {
        let response = self
            .client
            .post(self.toggle_url(name, action)?)
            .send()
            .await
            .map_err(|error| OverlayError::Transport(error.to_string()))?;
        decode_state(response).await
    }
}

async fn decode_state(response: reqwest::Response) -> Result<OverlayState, OverlayError> {
    let status = response.status();
    if !status.is_success() {
        return Err(OverlayError::Status(status.as_u16()));
    }

    let body = response
        .bytes()
        .await
        .map_err(|error| OverlayError::Transport(error.to_string()))?;
    OverlayState::from_json_bytes(&body).map_err(OverlayError::Decode)
}

/// Predicted value for an overlay whose toggle is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingToggle {
    /// Overlay being toggled.
    pub name: OverlayName,
    /// Action sent to the server.
    pub action: OverlayAction,
    /// Value the client predicts the server will confirm.
    pub predicted: bool,
}

/// Transient, self-expiring error notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    message: String,
    raised_at: Instant,
    ttl: Duration,
}

impl Banner {
    fn raise(message: impl Into<String>, ttl: Duration) -> Self {
        Self {
            message: message.into(),
            raised_at: Instant::now(),
            ttl,
        }
    }

    /// Banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` once the banner outlived its ttl.
    pub fn is_expired(&self) -> bool {
        self.raised_at.elapsed() >= self.ttl
    }
}

/// Two-phase overlay snapshot for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayView {
    /// Last server-acknowledged record.
    pub confirmed: OverlayState,
    /// Toggles still awaiting a response.
    pub pending: Vec<PendingToggle>,
    /// Active banner text, if any.
    pub banner: Option<String>,
}

impl OverlayView {
    /// Returns `true` while `name` has a toggle in flight.
    pub fn is_loading(&self, name: OverlayName) -> bool {
        self.pending.iter().any(|pending| pending.name == name)
    }

    /// Confirmed record with in-flight predictions applied.
    ///
    /// For display only; it is never committed.
    pub fn predicted(&self) -> OverlayState {
        self.pending
            .iter()
            .fold(self.confirmed, |state, pending| {
                state.with(pending.name, pending.predicted)
            })
    }
}

/// Result of a toggle request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// Server acknowledged; carries the adopted record.
    Applied(OverlayState),
    /// A toggle for the same overlay is already in flight; nothing was sent.
    AlreadyInFlight,
    /// Response arrived after disposal and was ignored.
    Discarded,
}

#[derive(Debug)]
struct SyncInner {
    confirmed: OverlayState,
    pending: BTreeMap<OverlayName, PendingToggle>,
    banner: Option<Banner>,
}

/// Owner of the local overlay record.
pub struct OverlaySynchronizer {
    transport: Arc<dyn OverlayTransport>,
    inner: Mutex<SyncInner>,
    banner_ttl: Duration,
    disposed: AtomicBool,
    changes: watch::Sender<OverlayState>,
}

impl OverlaySynchronizer {
    /// Creates a synchronizer seeded with `initial` until the first fetch.
    pub fn new(
        transport: Arc<dyn OverlayTransport>,
        initial: OverlayState,
        banner_ttl: Duration,
    ) -> Self {
        let (changes, _) = watch::channel(initial);
        Self {
            transport,
            inner: Mutex::new(SyncInner {
                confirmed: initial,
                pending: BTreeMap::new(),
                banner: None,
            }),
            banner_ttl,
            disposed: AtomicBool::new(false),
            changes,
        }
    }

    fn inner(&self) -> MutexGuard<'_, SyncInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last confirmed record.
    pub fn state(&self) -> OverlayState {
        self.inner().confirmed
    }

    /// Two-phase snapshot; expired banners are dropped here.
    pub fn view(&self) -> OverlayView {
        let mut inner = self.inner();
        if inner.banner.as_ref().is_some_and(Banner::is_expired) {
            inner.banner = None;
        }

        OverlayView {
            confirmed: inner.confirmed,
            pending: inner.pending.values().copied().collect(),
            banner: inner.banner.as_ref().map(|banner| banner.message().to_string()),
        }
    }

    /// Active banner text, if not yet expired.
    pub fn banner(&self) -> Option<String> {
        self.view().banner
    }

    /// Clears the banner before it expires.
    pub fn dismiss_banner(&self) {
        self.inner().banner = None;
    }

    /// Subscribes to confirmed replacements.
    pub fn subscribe(&self) -> watch::Receiver<OverlayState> {
        self.changes.subscribe()
    }

    /// Marks the owning view as torn down; later responses are ignored.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// Returns `true` after [`OverlaySynchronizer::dispose`].
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Reads the authoritative record and adopts it wholesale.
    ///
    /// On failure the local record is kept and returned unchanged.
    pub async fn fetch_state(&self) -> OverlayState {
        match self.transport.fetch().await {
            Ok(state) => {
                if self.is_disposed() {
                    debug!("ignoring overlay fetch after dispose");
                    return self.state();
                }
                self.commit(state);
                debug!(?state, "overlay state fetched");
                state
            }
            Err(error) => {
                warn!(%error, class = ?classify_overlay_error(&error), "failed to fetch overlay state");
                self.state()
            }
        }
    }

    /// Flips `name` on the server and adopts the returned record.
    ///
    /// # Errors
    /// Returns [`ToggleError`] when the write fails; the confirmed record is
    /// left at its pre-toggle value and a banner is raised.
    pub async fn toggle(&self, name: OverlayName) -> Result<ToggleOutcome, ToggleError> {
        let action = {
            let mut inner = self.inner();
            if inner.pending.contains_key(&name) {
                debug!(overlay = %name, "toggle already in flight");
                return Ok(ToggleOutcome::AlreadyInFlight);
            }

            let action = OverlayAction::toggled_from(inner.confirmed.get(name));
            inner.pending.insert(
                name,
                PendingToggle {
                    name,
                    action,
                    predicted: action.enabled(),
                },
            );
            inner.banner = None;
            action
        };

        let in_flight = PendingGuard { sync: self, name };
        let result = self.transport.set(name, action).await;
        drop(in_flight);

        if self.is_disposed() {
            debug!(overlay = %name, "ignoring toggle response after dispose");
            return Ok(ToggleOutcome::Discarded);
        }

        match result {
            Ok(state) => {
                if state.get(name) != action.enabled() {
                    warn!(overlay = %name, %action, ?state, "server state differs from requested toggle");
                }
                self.commit(state);
                info!(overlay = %name, %action, "overlay toggled");
                Ok(ToggleOutcome::Applied(state))
            }
            Err(source) => {
                warn!(
                    overlay = %name,
                    %action,
                    error = %source,
                    class = ?classify_overlay_error(&source),
                    "overlay toggle failed"
                );
                self.inner().banner = Some(Banner::raise(TOGGLE_FAILED_MESSAGE, self.banner_ttl));
                Err(ToggleError { name, source })
            }
        }
    }

    fn commit(&self, state: OverlayState) {
        self.inner().confirmed = state;
        self.changes.send_replace(state);
    }
}

/// Clears a pending entry when the toggle finishes or its future is dropped.
struct PendingGuard<'a> {
    sync: &'a OverlaySynchronizer,
    name: OverlayName,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.sync.inner().pending.remove(&self.name);
    }
}

/// Failure category used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Likely to succeed on a later attempt.
    Transient,
    /// Server refused the request.
    Rejected,
    /// Server answered with an unreadable record.
    Malformed,
}

/// Classifies overlay errors.
pub fn classify_overlay_error(error: &OverlayError) -> FailureClass {
    match error {
        OverlayError::Transport(_) => FailureClass::Transient,
        OverlayError::Status(code) if *code >= 500 => FailureClass::Transient,
        OverlayError::Status(_) | OverlayError::InvalidEndpoint(_) => FailureClass::Rejected,
        OverlayError::Decode(_) => FailureClass::Malformed,
    }
}

/// Overlay transport errors.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Overlay endpoint cannot be derived from the server URL.
    #[error("invalid overlay endpoint: {0}")]
    InvalidEndpoint(String),
    /// Network failure.
    #[error("overlay transport failure: {0}")]
    Transport(String),
    /// Non-success HTTP status.
    #[error("overlay endpoint returned status {0}")]
    Status(u16),
    /// Response body is not an overlay record.
    #[error("overlay response decode failure: {0}")]
    Decode(CoreError),
}

/// Failed toggle surfaced to the caller for transient display.
#[derive(Debug, Error)]
#[error("Failed to toggle overlay {name}")]
pub struct ToggleError {
    /// Overlay whose toggle failed.
    pub name: OverlayName,
    /// Underlying transport failure.
    #[source]
    pub source: OverlayError,
}

#[cfg(test)]
mod tests {
    //! Unit tests for error classification and two-phase views.

    use super::*;

    #[test]
    fn classifies_server_and_client_failures() {
        assert_eq!(
            classify_overlay_error(&OverlayError::Status(503)),
            FailureClass::Transient
        );
        assert_eq!(
            classify_overlay_error(&OverlayError::Status(400)),
            FailureClass::Rejected
        );
        assert_eq!(
            classify_overlay_error(&OverlayError::Transport("reset".to_string())),
            FailureClass::Transient
        );
    }

    #[test]
    fn predicted_view_applies_pending_flips_only() {
        let view = OverlayView {
            confirmed: OverlayState {
                ai: true,
                gas: false,
                thermal: false,
            },
            pending: vec![PendingToggle {
                name: OverlayName::Gas,
                action: OverlayAction::On,
                predicted: true,
            }],
            banner: None,
        };

        assert!(view.is_loading(OverlayName::Gas));
        assert!(!view.is_loading(OverlayName::Ai));
        assert_eq!(
            view.predicted(),
            OverlayState {
                ai: true,
                gas: true,
                thermal: false,
            }
        );
    }

    #[test]
    fn toggle_urls_encode_name_and_action() {
        let server = Url::parse("http://10.203.55.198:5001").expect("url should parse");
        let transport =
            HttpOverlayTransport::new(&server, Duration::from_secs(2)).expect("transport should build");
        assert_eq!(
            transport.overlay_url().as_str(),
            "http://10.203.55.198:5001/overlay"
        );
        assert_eq!(
            transport
                .toggle_url(OverlayName::Thermal, OverlayAction::Off)
                .expect("toggle url should build")
                .as_str(),
            "http://10.203.55.198:5001/overlay/thermal/off"
        );
    }
}
