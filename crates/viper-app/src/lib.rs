#![warn(missing_docs)]
//! # viper-app
//!
//! ## Purpose
//! Wires the feed monitor, overlay synchronizer, auth client and history
//! poller into one monitor session for the `viper-monitor` binary.
//!
//! ## Responsibilities
//! - Load [`MonitorConfig`] from `VIPER_*` environment variables.
//! - Start and tear down the timers owned by a [`MonitorSession`].
//! - Project session state into [`DashboardState`] and a flat
//!   [`RuntimeStatus`] line.
//! - Keep detection history and mission logs behind the auth gate: they are
//!   fetched only while signed in and dropped on sign-out.
//! - Honor the `VIPER_FEED_ENABLED` kill switch.
//! - Scrub secrets from free-form log detail.
//!
//! ## Data flow
//! Env -> [`MonitorConfig`] -> [`MonitorBackends`] -> [`MonitorSession::start`]
//! -> [`MonitorSession::dashboard`] -> [`project_runtime_status`] ->
//! [`render_status_line`].
//!
//! ## Error model
//! Subsystem errors are wrapped in [`AppError`]. Only startup problems are
//! fatal; runtime failures degrade to display state.
//!
//! ## Security and privacy notes
//! - The Firebase API key is redacted from `Debug` output.
//! - Mission snapshots carry the session's id token as the database `auth`
//!   parameter; it never appears in logged errors.
//! - [`redact_sensitive`] strips password, token and key values before
//!   detail strings are logged.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use viper_auth::{
    AuthClient, AuthError, AuthGate, Credentials, FirebaseIdentityProvider, GateView,
    IdentityProvider, ProviderError, Session, SessionSignal, SessionStore, SessionSubscription,
    epoch_ms,
};
use viper_core::{DEFAULT_SERVER_URL, OverlayName, OverlayState};
use viper_feed::{
    DEFAULT_FRAME_INTERVAL_MS, DEFAULT_LIVE_THRESHOLD_MS, DEFAULT_LIVENESS_INTERVAL_MS,
    FeedConfig, FeedError, FeedMonitor, FeedSnapshot, FrameSource, HttpFrameSource,
    PeriodicTask,
};
use viper_history::{
    DEFAULT_HISTORY_INTERVAL_MS, HistoryError, HistoryPoller, HistorySource, HistorySummary,
    HttpHistorySource, HttpMissionSource, MissionLogEntry, MissionPoller, MissionSource,
    PollOutcome,
};
use viper_overlay::{
    DEFAULT_BANNER_TTL_MS, HttpOverlayTransport, OverlayError, OverlaySynchronizer,
    OverlayTransport, ToggleError, ToggleOutcome,
};
use viper_ui::DashboardState;

/// Build-time application version loaded from root `VERSION` file.
pub const APP_VERSION: &str = env!("VIPER_VERSION");

/// Server base URL variable.
pub const ENV_SERVER_URL: &str = "VIPER_SERVER_URL";
/// Frame poll period variable.
pub const ENV_FRAME_INTERVAL_MS: &str = "VIPER_FRAME_INTERVAL_MS";
/// Liveness evaluation period variable.
pub const ENV_LIVENESS_INTERVAL_MS: &str = "VIPER_LIVENESS_INTERVAL_MS";
/// Staleness threshold variable.
pub const ENV_LIVE_THRESHOLD_MS: &str = "VIPER_LIVE_THRESHOLD_MS";
/// History poll period variable.
pub const ENV_HISTORY_INTERVAL_MS: &str = "VIPER_HISTORY_INTERVAL_MS";
/// Banner lifetime variable.
pub const ENV_BANNER_TTL_MS: &str = "VIPER_BANNER_TTL_MS";
/// Per-request HTTP timeout variable.
pub const ENV_REQUEST_TIMEOUT_MS: &str = "VIPER_REQUEST_TIMEOUT_MS";
/// Firebase Web API key variable.
pub const ENV_FIREBASE_API_KEY: &str = "VIPER_FIREBASE_API_KEY";
/// Realtime database root variable.
pub const ENV_DATABASE_URL: &str = "VIPER_DATABASE_URL";
/// Session file variable.
pub const ENV_SESSION_FILE: &str = "VIPER_SESSION_FILE";
/// Feed kill switch variable.
pub const ENV_FEED_ENABLED: &str = "VIPER_FEED_ENABLED";

/// Session file location under `$HOME` when [`ENV_SESSION_FILE`] is unset.
pub const DEFAULT_SESSION_FILE: &str = ".viper-monitor/session.json";

/// Default per-request HTTP timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

const REDACTED: &str = "<redacted>";
const SENSITIVE_KEYS: [&str; 5] = ["password", "token", "key", "authorization", "secret"];

/// Returns the app version sourced from root `VERSION`.
pub fn app_version() -> &'static str {
    APP_VERSION
}

/// Runtime configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// AI server base URL.
    pub server_url: Url,
    /// Frame poll period.
    pub frame_interval_ms: u64,
    /// Liveness evaluation period.
    pub liveness_interval_ms: u64,
    /// Staleness threshold.
    pub live_threshold_ms: u64,
    /// History poll period.
    pub history_interval_ms: u64,
    /// Overlay error banner lifetime.
    pub banner_ttl_ms: u64,
    /// Per-request HTTP timeout.
    pub request_timeout_ms: u64,
    /// Firebase Web API key; sign-in is unavailable without it.
    pub firebase_api_key: Option<String>,
    /// Realtime database root holding `missions/`.
    pub database_url: Option<Url>,
    /// File keeping the signed-in session across runs.
    pub session_file: Option<PathBuf>,
    /// Kill switch state for frame polling.
    pub feed_enabled: bool,
}

impl MonitorConfig {
    /// Reads configuration from process environment.
    ///
    /// # Errors
    /// Returns [`AppError::Config`] for unparsable values.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`, which maps a variable name to its
    /// value.
    ///
    /// # Errors
    /// Returns [`AppError::Config`] for unparsable values or timing that the
    /// feed monitor rejects.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = lookup(ENV_SERVER_URL)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let server_url = Url::parse(server.trim())
            .map_err(|error| AppError::Config(format!("{ENV_SERVER_URL}: {error}")))?;
        if !matches!(server_url.scheme(), "http" | "https") {
            return Err(AppError::Config(format!(
                "{ENV_SERVER_URL}: unsupported scheme {}",
                server_url.scheme()
            )));
        }

        let database_url = match lookup(ENV_DATABASE_URL).filter(|value| !value.trim().is_empty()) {
            Some(raw) => Some(
                Url::parse(raw.trim())
                    .map_err(|error| AppError::Config(format!("{ENV_DATABASE_URL}: {error}")))?,
            ),
            None => None,
        };

        let session_file = lookup(ENV_SESSION_FILE)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| {
                lookup("HOME")
                    .filter(|home| !home.trim().is_empty())
                    .map(|home| PathBuf::from(home).join(DEFAULT_SESSION_FILE))
            });

        let config = Self {
            server_url,
            database_url,
            session_file,
            frame_interval_ms: millis(&lookup, ENV_FRAME_INTERVAL_MS, DEFAULT_FRAME_INTERVAL_MS)?,
            liveness_interval_ms: millis(
                &lookup,
                ENV_LIVENESS_INTERVAL_MS,
                DEFAULT_LIVENESS_INTERVAL_MS,
            )?,
            live_threshold_ms: millis(&lookup, ENV_LIVE_THRESHOLD_MS, DEFAULT_LIVE_THRESHOLD_MS)?,
            history_interval_ms: millis(
                &lookup,
                ENV_HISTORY_INTERVAL_MS,
                DEFAULT_HISTORY_INTERVAL_MS,
            )?,
            banner_ttl_ms: millis(&lookup, ENV_BANNER_TTL_MS, DEFAULT_BANNER_TTL_MS)?,
            request_timeout_ms: millis(&lookup, ENV_REQUEST_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS)?,
            firebase_api_key: lookup(ENV_FIREBASE_API_KEY)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            feed_enabled: lookup(ENV_FEED_ENABLED).is_none_or(|value| switch_enabled(&value)),
        };
        config.feed_config()?;
        Ok(config)
    }

    /// Validated feed timing.
    ///
    /// # Errors
    /// Returns [`AppError::Config`] when the feed monitor rejects the timing.
    pub fn feed_config(&self) -> Result<FeedConfig, AppError> {
        FeedConfig::new(
            self.frame_interval_ms,
            self.liveness_interval_ms,
            self.live_threshold_ms,
        )
        .map_err(|error| AppError::Config(error.to_string()))
    }

    /// Per-request HTTP timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl fmt::Debug for MonitorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorConfig")
            .field("server_url", &self.server_url.as_str())
            .field("frame_interval_ms", &self.frame_interval_ms)
            .field("liveness_interval_ms", &self.liveness_interval_ms)
            .field("live_threshold_ms", &self.live_threshold_ms)
            .field("history_interval_ms", &self.history_interval_ms)
            .field("banner_ttl_ms", &self.banner_ttl_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field(
                "firebase_api_key",
                &self.firebase_api_key.as_ref().map(|_| REDACTED),
            )
            .field("database_url", &self.database_url.as_ref().map(Url::as_str))
            .field("session_file", &self.session_file)
            .field("feed_enabled", &self.feed_enabled)
            .finish()
    }
}

fn millis<F>(lookup: &F, name: &str, default: u64) -> Result<u64, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    let value: u64 = raw
        .trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{name}: expected milliseconds, got {raw:?}")))?;
    if value == 0 {
        return Err(AppError::Config(format!("{name}: must be greater than zero")));
    }
    Ok(value)
}

fn switch_enabled(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    !matches!(normalized.as_str(), "0" | "false" | "off")
}

/// Checks the feed kill switch.
///
/// Unset or any value other than `0`, `false`, `off` (case-insensitive)
/// leaves polling enabled.
pub fn feed_enabled_from_env() -> bool {
    std::env::var(ENV_FEED_ENABLED).map_or(true, |value| switch_enabled(&value))
}

/// Redacts secret values in log-bound text.
///
/// Handles `name=value`, `name: value`, JSON `"name":"value"` and
/// `Bearer value` forms, where `name` ends with a sensitive key.
pub fn redact_sensitive(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut redact_next = false;

    for piece in input.split_inclusive(is_redaction_delimiter) {
        let (token, delimiter) = split_trailing_delimiter(piece);
        if token.is_empty() {
            output.push_str(piece);
            continue;
        }

        if token.eq_ignore_ascii_case("bearer") {
            output.push_str(piece);
            redact_next = true;
            continue;
        }

        if redact_next {
            output.push_str(REDACTED);
            output.push_str(delimiter);
            redact_next = false;
            continue;
        }

        let (rewritten, pending) = redact_pair(token);
        output.push_str(&rewritten);
        output.push_str(delimiter);
        redact_next = pending;
    }

    output
}

fn is_redaction_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '&' | ',' | '?' | '{' | '}')
}

fn split_trailing_delimiter(piece: &str) -> (&str, &str) {
    match piece.char_indices().last() {
        Some((index, c)) if is_redaction_delimiter(c) => (&piece[..index], &piece[index..]),
        _ => (piece, ""),
    }
}

fn redact_pair(token: &str) -> (String, bool) {
    let Some(split) = token.find(['=', ':']) else {
        return (token.to_string(), false);
    };

    let name: String = token[..split]
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();
    if name.is_empty() || !SENSITIVE_KEYS.iter().any(|key| name.ends_with(key)) {
        return (token.to_string(), false);
    }

    let value = &token[split + 1..];
    if value.is_empty() || value.eq_ignore_ascii_case("bearer") {
        return (token.to_string(), true);
    }
    (format!("{}{REDACTED}", &token[..=split]), false)
}

/// Flat status snapshot for one console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStatus {
    /// App version.
    pub version: String,
    /// Gate view name.
    pub auth: String,
    /// Feed badge text, or `DISABLED` when the kill switch is off.
    pub feed: String,
    /// Poller ticks so far.
    pub frame_count: u64,
    /// `name=status` pairs in display order.
    pub overlays: String,
    /// Active banner or feed error.
    pub alert: Option<String>,
    /// History status text.
    pub history: String,
}

/// Projects dashboard state into a flat status snapshot.
pub fn project_runtime_status(state: &DashboardState, feed_enabled: bool) -> RuntimeStatus {
    let overlays = state
        .overlay_controls()
        .iter()
        .map(|control| format!("{}={}", control.name, control.status.label()))
        .collect::<Vec<_>>()
        .join(" ");

    RuntimeStatus {
        version: state.version.clone(),
        auth: format!("{:?}", state.auth),
        feed: if feed_enabled {
            state.feed.label().to_string()
        } else {
            "DISABLED".to_string()
        },
        frame_count: state.frame_count,
        overlays,
        alert: state.banner.clone().or_else(|| state.feed_error.clone()),
        history: format!("{} (last updated {})", state.history_status, state.last_updated),
    }
}

/// Renders one status line.
pub fn render_status_line(status: &RuntimeStatus) -> String {
    let mut line = format!(
        "viper {} [{}] frames={} {} auth={} history: {}",
        status.version, status.feed, status.frame_count, status.overlays, status.auth, status.history
    );
    if let Some(alert) = &status.alert {
        line.push_str(" ! ");
        line.push_str(alert);
    }
    line
}

/// Identity provider used when no API key is configured.
///
/// Reports no session and fails every sign-in as unavailable.
#[derive(Debug, Default)]
pub struct UnconfiguredIdentityProvider;

#[async_trait]
impl IdentityProvider for UnconfiguredIdentityProvider {
    async fn sign_in(&self, _credentials: &Credentials) -> Result<Session, ProviderError> {
        Err(ProviderError::Transport(format!(
            "{ENV_FIREBASE_API_KEY} is not set"
        )))
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        Ok(None)
    }
}

/// Remote collaborators of a session.
#[derive(Clone)]
pub struct MonitorBackends {
    /// Frame loader.
    pub frames: Arc<dyn FrameSource>,
    /// Overlay read/write transport.
    pub overlays: Arc<dyn OverlayTransport>,
    /// Detection history source.
    pub history: Arc<dyn HistorySource>,
    /// Mission snapshot source, when a realtime database is configured.
    pub missions: Option<Arc<dyn MissionSource>>,
    /// Identity provider.
    pub identity: Arc<dyn IdentityProvider>,
}

impl MonitorBackends {
    /// Builds HTTP backends for `config`.
    ///
    /// # Errors
    /// Returns the first subsystem error raised while building clients.
    pub fn http(config: &MonitorConfig) -> Result<Self, AppError> {
        let timeout = config.request_timeout();
        let identity: Arc<dyn IdentityProvider> = match &config.firebase_api_key {
            Some(api_key) => {
                let provider = FirebaseIdentityProvider::new(api_key, timeout)?;
                Arc::new(match &config.session_file {
                    Some(path) => provider.with_store(SessionStore::new(path)),
                    None => provider,
                })
            }
            None => {
                warn!("{ENV_FIREBASE_API_KEY} not set; sign-in unavailable");
                Arc::new(UnconfiguredIdentityProvider)
            }
        };

        let missions: Option<Arc<dyn MissionSource>> = match &config.database_url {
            Some(database) => Some(Arc::new(HttpMissionSource::new(database, timeout)?)),
            None => None,
        };

        Ok(Self {
            frames: Arc::new(HttpFrameSource::new(timeout)?),
            overlays: Arc::new(HttpOverlayTransport::new(&config.server_url, timeout)?),
            history: Arc::new(HttpHistorySource::new(&config.server_url, timeout)?),
            missions,
            identity,
        })
    }
}

/// One running monitor: feed timers, overlay record, auth and history.
pub struct MonitorSession {
    config: MonitorConfig,
    feed: Option<FeedMonitor>,
    overlays: Arc<OverlaySynchronizer>,
    auth: AuthClient,
    gate: Mutex<AuthGate>,
    history: HistoryFeed,
    history_task: PeriodicTask,
    missions: Option<Arc<dyn MissionSource>>,
    scope: CancellationToken,
}

impl MonitorSession {
    /// Starts the feed timers, reads the initial overlay record, restores any
    /// persisted session and then starts history polling.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns [`AppError::Config`] for invalid timing and [`AppError::Feed`]
    /// when the frame endpoint cannot be derived.
    pub async fn start(config: MonitorConfig, backends: MonitorBackends) -> Result<Self, AppError> {
        let feed = if config.feed_enabled {
            Some(FeedMonitor::start(
                config.feed_config()?,
                &config.server_url,
                backends.frames,
            )?)
        } else {
            info!("{ENV_FEED_ENABLED} is off; frame polling disabled");
            None
        };

        let overlays = Arc::new(OverlaySynchronizer::new(
            backends.overlays,
            OverlayState::default(),
            Duration::from_millis(config.banner_ttl_ms),
        ));
        overlays.fetch_state().await;

        let auth = AuthClient::new(backends.identity);
        auth.restore().await;

        let scope = CancellationToken::new();
        let history = HistoryFeed::new(
            HistoryPoller::new(backends.history),
            auth.on_session_change(),
            scope.child_token(),
        );
        let history_task = history.spawn(Duration::from_millis(config.history_interval_ms));

        info!(server = %config.server_url, "monitor session started");
        Ok(Self {
            config,
            feed,
            overlays,
            auth,
            gate: Mutex::new(AuthGate::new()),
            history,
            history_task,
            missions: backends.missions,
            scope,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Overlay synchronizer.
    pub fn overlays(&self) -> &OverlaySynchronizer {
        &self.overlays
    }

    /// Auth client.
    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    /// Feed snapshot, or `None` when the kill switch is off.
    pub fn feed_snapshot(&self) -> Option<FeedSnapshot> {
        self.feed.as_ref().map(FeedMonitor::snapshot)
    }

    /// Gate decision for the current session; expired sessions are signed
    /// out first.
    pub fn gate_view(&self) -> GateView {
        self.auth.expire_if_due(epoch_ms());
        let signal: SessionSignal = self.auth.current();
        self.gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(&signal)
    }

    /// Latest history summary; `None` unless the gate is protected.
    pub fn history(&self) -> Option<HistorySummary> {
        if self.gate_view() != GateView::Protected {
            return None;
        }
        self.history.latest()
    }

    /// Polls history now instead of waiting for the next tick.
    ///
    /// # Errors
    /// Returns [`AppError::SignInRequired`] without a session and
    /// [`AppError::History`] when the fetch fails.
    pub async fn refresh_history(&self) -> Result<Option<HistorySummary>, AppError> {
        self.protected_session()?;
        self.history.refresh().await?;
        Ok(self.history())
    }

    /// Reads the `missions/` snapshot once, newest entry first.
    ///
    /// # Errors
    /// Returns [`AppError::Config`] without a database URL,
    /// [`AppError::SignInRequired`] without a session and
    /// [`AppError::History`] for fetch or decode failures.
    pub async fn mission_logs(&self) -> Result<Vec<MissionLogEntry>, AppError> {
        let source = self.mission_source()?;
        let session = self.protected_session()?;
        let entries = match MissionPoller::new(source).poll(Some(session.id_token())).await? {
            PollOutcome::Updated(entries) => entries,
            PollOutcome::Unchanged => Vec::new(),
        };
        debug!(entries = entries.len(), "mission logs loaded");
        Ok(entries)
    }

    /// Subscribes to `missions/` snapshot changes on the history period.
    ///
    /// # Errors
    /// Returns [`AppError::Config`] without a database URL and
    /// [`AppError::SignInRequired`] without a session.
    pub fn subscribe_missions(&self) -> Result<MissionSubscription, AppError> {
        let source = self.mission_source()?;
        self.protected_session()?;
        Ok(MissionSubscription::start(
            source,
            Duration::from_millis(self.config.history_interval_ms),
            self.auth.on_session_change(),
            self.scope.child_token(),
        ))
    }

    fn mission_source(&self) -> Result<Arc<dyn MissionSource>, AppError> {
        self.missions
            .clone()
            .ok_or_else(|| AppError::Config(format!("{ENV_DATABASE_URL} is not set")))
    }

    fn protected_session(&self) -> Result<Session, AppError> {
        if self.gate_view() != GateView::Protected {
            return Err(AppError::SignInRequired);
        }
        self.auth
            .current()
            .session()
            .cloned()
            .ok_or(AppError::SignInRequired)
    }

    /// Flips one overlay.
    ///
    /// # Errors
    /// Returns [`AppError::Toggle`] when the write fails; the banner is raised
    /// on the synchronizer as well.
    pub async fn toggle_overlay(&self, name: OverlayName) -> Result<ToggleOutcome, AppError> {
        Ok(self.overlays.toggle(name).await?)
    }

    /// Signs in and loads history right away.
    ///
    /// # Errors
    /// Returns [`AppError::Auth`] with a user-facing message.
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Session, AppError> {
        let session = self.auth.sign_in(credentials).await?;
        if let Err(error) = self.history.refresh().await {
            debug!(
                error = %redact_sensitive(&error.to_string()),
                "history refresh after sign-in failed"
            );
        }
        Ok(session)
    }

    /// Signs out and drops protected data; the gate redirects on the next
    /// dashboard projection.
    pub async fn sign_out(&self) {
        self.auth.sign_out().await;
        self.history.clear().await;
    }

    /// Builds the dashboard from current subsystem state.
    pub fn dashboard(&self) -> DashboardState {
        let gate_view = self.gate_view();

        let mut state = DashboardState::new(app_version());
        state.apply_gate(gate_view);
        if let Some(snapshot) = self.feed_snapshot() {
            state.apply_feed(&snapshot);
        }
        state.apply_overlay(&self.overlays.view());
        if gate_view == GateView::Protected
            && let Some(summary) = self.history.latest()
        {
            state.apply_history(&summary);
        }
        state
    }

    /// Flat status for the console.
    pub fn runtime_status(&self) -> RuntimeStatus {
        project_runtime_status(&self.dashboard(), self.config.feed_enabled)
    }

    /// Stops every timer. In-flight responses are ignored after this point.
    pub async fn shutdown(self) {
        self.overlays.dispose();
        self.scope.cancel();
        self.history_task.join().await;
        if let Some(feed) = self.feed {
            feed.shutdown().await;
        }
        info!("monitor session stopped");
    }
}

/// History polling shared by the timer and on-demand refreshes.
///
/// Polls only while a session exists; without one the summary and digest
/// are dropped.
#[derive(Clone)]
struct HistoryFeed {
    poller: Arc<AsyncMutex<HistoryPoller>>,
    summaries: Arc<watch::Sender<Option<HistorySummary>>>,
    sessions: Arc<SessionSubscription>,
    scope: CancellationToken,
}

impl HistoryFeed {
    fn new(poller: HistoryPoller, sessions: SessionSubscription, scope: CancellationToken) -> Self {
        let (summaries, _) = watch::channel(None);
        Self {
            poller: Arc::new(AsyncMutex::new(poller)),
            summaries: Arc::new(summaries),
            sessions: Arc::new(sessions),
            scope,
        }
    }

    fn latest(&self) -> Option<HistorySummary> {
        self.summaries.borrow().clone()
    }

    fn signed_in(&self) -> bool {
        self.sessions.current().session().is_some()
    }

    /// Polls every `period`; a tick is skipped while the previous poll is
    /// still running.
    fn spawn(&self, period: Duration) -> PeriodicTask {
        let feed = self.clone();
        PeriodicTask::spawn("history-poller", period, self.scope.clone(), move || {
            let Ok(poller) = Arc::clone(&feed.poller).try_lock_owned() else {
                debug!("history poll still running; skipping tick");
                return;
            };
            let feed = feed.clone();
            tokio::spawn(async move {
                if let Err(error) = feed.poll_with(poller).await {
                    debug!(error = %redact_sensitive(&error.to_string()), "history poll failed");
                }
            });
        })
    }

    async fn refresh(&self) -> Result<(), HistoryError> {
        let poller = Arc::clone(&self.poller).lock_owned().await;
        self.poll_with(poller).await
    }

    async fn poll_with(
        &self,
        mut poller: OwnedMutexGuard<HistoryPoller>,
    ) -> Result<(), HistoryError> {
        if !self.signed_in() {
            self.forget(&mut poller);
            return Ok(());
        }

        let outcome = poller.poll().await;
        if self.scope.is_cancelled() {
            return Ok(());
        }
        if !self.signed_in() {
            self.forget(&mut poller);
            return Ok(());
        }

        if let PollOutcome::Updated(summary) = outcome? {
            self.summaries.send_replace(Some(summary));
        }
        Ok(())
    }

    async fn clear(&self) {
        let mut poller = self.poller.lock().await;
        self.forget(&mut poller);
    }

    fn forget(&self, poller: &mut HistoryPoller) {
        poller.reset();
        self.summaries.send_if_modified(|summary| summary.take().is_some());
    }
}

/// Live delivery of `missions/` snapshots.
///
/// Each tick fetches with the current session's id token and delivers the
/// flattened entries only when the snapshot digest changes. Without a session
/// nothing is fetched and delivered entries are cleared. Dropping the
/// subscription (or calling [`MissionSubscription::unsubscribe`]) stops
/// polling.
pub struct MissionSubscription {
    entries: watch::Receiver<Vec<MissionLogEntry>>,
    task: PeriodicTask,
}

impl MissionSubscription {
    /// Polls `source` every `period` until `token` is cancelled.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        source: Arc<dyn MissionSource>,
        period: Duration,
        sessions: SessionSubscription,
        token: CancellationToken,
    ) -> Self {
        let (sender, entries) = watch::channel(Vec::new());
        let sender = Arc::new(sender);
        let poller = Arc::new(AsyncMutex::new(MissionPoller::new(source)));
        let load_token = token.clone();

        let task = PeriodicTask::spawn("mission-subscription", period, token, move || {
            let Ok(mut poller) = Arc::clone(&poller).try_lock_owned() else {
                debug!("mission poll still running; skipping tick");
                return;
            };
            let Some(id_token) = sessions
                .current()
                .session()
                .map(|session| session.id_token().to_string())
            else {
                poller.reset();
                sender.send_if_modified(|current| !std::mem::take(current).is_empty());
                return;
            };

            let sender = Arc::clone(&sender);
            let token = load_token.clone();
            tokio::spawn(async move {
                let outcome = poller.poll(Some(&id_token)).await;
                if token.is_cancelled() {
                    return;
                }
                match outcome {
                    Ok(PollOutcome::Updated(latest)) => {
                        sender.send_replace(latest);
                    }
                    Ok(PollOutcome::Unchanged) => {}
                    Err(error) => {
                        debug!(
                            error = %redact_sensitive(&error.to_string()),
                            "mission poll failed"
                        );
                    }
                }
            });
        });

        Self { entries, task }
    }

    /// Latest delivered entries, newest first.
    pub fn current(&self) -> Vec<MissionLogEntry> {
        self.entries.borrow().clone()
    }

    /// Waits for the next delivery. Returns `None` once polling stopped.
    pub async fn next(&mut self) -> Option<Vec<MissionLogEntry>> {
        self.entries.changed().await.ok()?;
        Some(self.entries.borrow_and_update().clone())
    }

    /// Stops polling.
    pub fn unsubscribe(self) {
        self.task.cancel();
        debug!("mission subscription closed");
    }
}

/// App integration error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
    /// Feed subsystem error.
    #[error("feed error: {0}")]
    Feed(#[from] FeedError),
    /// Overlay transport error.
    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),
    /// Overlay toggle failure.
    #[error(transparent)]
    Toggle(#[from] ToggleError),
    /// User-facing auth failure.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Identity provider setup failure.
    #[error("identity provider error: {0}")]
    Provider(#[from] ProviderError),
    /// History subsystem error.
    #[error("history error: {0}")]
    History(#[from] HistoryError),
    /// Protected data was requested without a signed-in session.
    #[error("sign in required")]
    SignInRequired,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_handles_pairs_json_and_bearer() {
        assert_eq!(
            redact_sensitive("login failed password=hunter2 user=ops"),
            "login failed password=<redacted> user=ops"
        );
        assert_eq!(
            redact_sensitive("POST /v1/accounts:signInWithPassword?key=AIzaSy123"),
            "POST /v1/accounts:signInWithPassword?key=<redacted>"
        );
        assert_eq!(
            redact_sensitive("Authorization: Bearer abc.def"),
            "Authorization: Bearer <redacted>"
        );
        assert_eq!(
            redact_sensitive(r#"{"idToken":"eyJ","email":"a@b.c"}"#),
            r#"{"idToken":<redacted>,"email":"a@b.c"}"#
        );
    }

    #[test]
    fn switch_values_follow_kill_switch_semantics() {
        assert!(!switch_enabled("OFF"));
        assert!(!switch_enabled(" 0 "));
        assert!(switch_enabled("yes"));
    }
}
