#![warn(missing_docs)]
//! # viper-auth
//!
//! ## Purpose
//! Gates the manager/owner views behind an external email/password identity
//! provider and tracks the session lifecycle that drives the gate.
//!
//! ## Responsibilities
//! - Model the gate as an explicit state machine ([`AuthGate`]) whose only
//!   input is session presence.
//! - Execute sign-in/sign-out through an injectable [`IdentityProvider`].
//! - Broadcast session changes through an explicit subscription object
//!   ([`SessionSubscription`]).
//! - Provide a Firebase Identity Toolkit REST provider whose session
//!   survives restarts through a [`SessionStore`] file and is renewed with
//!   its refresh token once the id token expires.
//!
//! ## Data flow
//! Login view collects [`Credentials`] -> [`AuthClient::sign_in`] calls the
//! provider -> the resulting [`SessionSignal`] is published -> subscribers
//! feed it into [`AuthGate::apply`] -> [`GateView`] decides what renders.
//!
//! ## Ownership and lifetimes
//! Sessions are owned values cloned into each notification so subscribers
//! never borrow provider state.
//!
//! ## Error model
//! Provider failures are logged with detail and mapped to one of two
//! user-facing [`AuthError`] messages; the detail never reaches the UI.
//!
//! ## Security and privacy notes
//! `Debug` output of [`Credentials`] and [`Session`] redacts the password and
//! both tokens. The Firebase API key travels only in the request URL, which is
//! never logged. The session file is created owner-only on unix.
//!
//! ## Example
//! ```rust
//! use viper_auth::{AuthGate, GateView};
//!
//! let gate = AuthGate::new();
//! assert_eq!(gate.view(), GateView::Loading);
//! ```

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

/// Route unauthenticated sessions are sent to.
pub const LOGIN_ROUTE: &str = "/login";
/// Neutral text shown while the session is unresolved.
pub const LOADING_MESSAGE: &str = "IDENTIFYING CREDENTIALS...";
/// User-facing message for rejected credentials.
pub const INVALID_CREDENTIALS_MESSAGE: &str = "Invalid email or password";
/// User-facing message for provider outages.
pub const AUTH_UNAVAILABLE_MESSAGE: &str = "Authentication failed. Please try again.";
/// Firebase Identity Toolkit password sign-in endpoint.
pub const FIREBASE_SIGN_IN_ENDPOINT: &str =
    "https://identitytoolkit.googleapis.com/v1/accounts:signInWithPassword";
/// Path suffix every sign-in endpoint must carry.
pub const REQUIRED_SIGN_IN_PATH: &str = "accounts:signInWithPassword";
/// Secure Token endpoint exchanging a refresh token for a new id token.
pub const FIREBASE_REFRESH_ENDPOINT: &str = "https://securetoken.googleapis.com/v1/token";

/// User-provided login credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Account email.
    pub email: String,
    /// Account password.
    pub password: String,
}

impl Credentials {
    /// Creates credentials from raw form input.
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    fn is_blank(&self) -> bool {
        self.email.trim().is_empty() || self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opaque provider session. Only its presence matters to the gate.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Provider user id.
    pub uid: String,
    /// Signed-in email.
    pub email: String,
    id_token: String,
    refresh_token: Option<String>,
    /// Absolute epoch milliseconds when the session expires.
    pub expires_at_ms: u64,
}

impl Session {
    /// Creates a session.
    pub fn new(
        uid: impl Into<String>,
        email: impl Into<String>,
        id_token: impl Into<String>,
        expires_at_ms: u64,
    ) -> Self {
        Self {
            uid: uid.into(),
            email: email.into(),
            id_token: id_token.into(),
            refresh_token: None,
            expires_at_ms,
        }
    }

    /// Attaches the long-lived token used to renew the session.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into()).filter(|token| !token.is_empty());
        self
    }

    /// Bearer token for downstream provider APIs.
    pub fn id_token(&self) -> &str {
        &self.id_token
    }

    /// Refresh token, when the provider issued one.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Returns `true` when the session has expired at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("uid", &self.uid)
            .field("email", &self.email)
            .field("id_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

/// Session notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// Provider has not reported yet.
    Unresolved,
    /// A session exists.
    SignedIn(Session),
    /// No session exists.
    SignedOut,
}

impl SessionSignal {
    /// Session carried by the signal, if any.
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionSignal::SignedIn(session) => Some(session),
            SessionSignal::Unresolved | SessionSignal::SignedOut => None,
        }
    }

    /// Maps a provider answer to a resolved signal.
    pub fn from_session(session: Option<Session>) -> Self {
        match session {
            Some(session) => SessionSignal::SignedIn(session),
            None => SessionSignal::SignedOut,
        }
    }
}

/// Gate state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Session status not yet resolved.
    Unknown,
    /// A session exists.
    Authenticated(Session),
    /// No session exists.
    Unauthenticated,
}

/// Render decision for a protected view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateView {
    /// Show the neutral loading indicator; neither content nor redirect.
    Loading,
    /// Navigate to the login route.
    RedirectToLogin {
        /// Target route.
        route: &'static str,
        /// Replace the history entry so back-navigation cannot re-enter.
        replace_history: bool,
    },
    /// Render the wrapped protected content.
    Protected,
}

/// Protected-route gate driven only by provider notifications.
///
/// The machine has no terminal state: it cycles between authenticated and
/// unauthenticated for the life of the application.
#[derive(Debug, Clone)]
pub struct AuthGate {
    state: AuthState,
}

impl AuthGate {
    /// Creates a gate in `Unknown` state.
    pub fn new() -> Self {
        Self {
            state: AuthState::Unknown,
        }
    }

    /// Current gate state.
    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Returns `true` when protected content may render.
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated(_))
    }

    /// Applies one provider notification and returns the new render decision.
    pub fn apply(&mut self, signal: &SessionSignal) -> GateView {
        let next = match signal {
            SessionSignal::Unresolved => AuthState::Unknown,
            SessionSignal::SignedIn(session) => AuthState::Authenticated(session.clone()),
            SessionSignal::SignedOut => AuthState::Unauthenticated,
        };

        if matches!(self.state, AuthState::Authenticated(_))
            && next == AuthState::Unauthenticated
        {
            info!("session ended; redirecting to login");
        }
        self.state = next;
        self.view()
    }

    /// Applies a raw `Session | null` notification.
    pub fn on_session_change(&mut self, session: Option<Session>) -> GateView {
        self.apply(&SessionSignal::from_session(session))
    }

    /// Render decision for the current state.
    pub fn view(&self) -> GateView {
        match self.state {
            AuthState::Unknown => GateView::Loading,
            AuthState::Unauthenticated => GateView::RedirectToLogin {
                route: LOGIN_ROUTE,
                replace_history: true,
            },
            AuthState::Authenticated(_) => GateView::Protected,
        }
    }
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Explicit session-change subscription.
///
/// Dropping the subscription (or calling
/// [`SessionSubscription::unsubscribe`]) stops delivery.
#[derive(Debug)]
pub struct SessionSubscription {
    receiver: watch::Receiver<SessionSignal>,
}

impl SessionSubscription {
    /// Latest signal without waiting.
    pub fn current(&self) -> SessionSignal {
        self.receiver.borrow().clone()
    }

    /// Waits for the next change. Returns `None` once the client is gone.
    ///
    /// Rapid successive changes coalesce into the latest signal.
    pub async fn next(&mut self) -> Option<SessionSignal> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Stops delivery.
    pub fn unsubscribe(self) {
        debug!("session subscription closed");
    }
}

/// Abstract identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchanges credentials for a session.
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, ProviderError>;

    /// Ends the current session.
    async fn sign_out(&self) -> Result<(), ProviderError>;

    /// Returns the persisted session, if one is still valid.
    async fn current_session(&self) -> Result<Option<Session>, ProviderError>;
}

/// Auth client that owns the session broadcast.
pub struct AuthClient {
    provider: Arc<dyn IdentityProvider>,
    sessions: watch::Sender<SessionSignal>,
}

impl AuthClient {
    /// Creates a client with an unresolved session.
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        let (sessions, _) = watch::channel(SessionSignal::Unresolved);
        Self { provider, sessions }
    }

    /// Latest published signal.
    pub fn current(&self) -> SessionSignal {
        self.sessions.borrow().clone()
    }

    /// Subscribes to session changes.
    pub fn on_session_change(&self) -> SessionSubscription {
        SessionSubscription {
            receiver: self.sessions.subscribe(),
        }
    }

    /// Resolves the initial session from the provider.
    ///
    /// Provider failures resolve to signed-out.
    pub async fn restore(&self) -> SessionSignal {
        let signal = match self.provider.current_session().await {
            Ok(session) => SessionSignal::from_session(session),
            Err(error) => {
                warn!(%error, "session restore failed; treating as signed out");
                SessionSignal::SignedOut
            }
        };
        self.publish(signal.clone());
        signal
    }

    /// Exchanges credentials for a session and publishes it.
    ///
    /// # Errors
    /// - [`AuthError::InvalidCredentials`] for blank input (no provider call)
    ///   and for provider rejections.
    /// - [`AuthError::Unavailable`] for transport or response failures.
    pub async fn sign_in(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        if credentials.is_blank() {
            return Err(AuthError::InvalidCredentials);
        }

        match self.provider.sign_in(credentials).await {
            Ok(session) => {
                info!(uid = %session.uid, "signed in");
                self.publish(SessionSignal::SignedIn(session.clone()));
                Ok(session)
            }
            Err(ProviderError::Rejected(detail)) => {
                warn!(%detail, "sign-in rejected by provider");
                Err(AuthError::InvalidCredentials)
            }
            Err(error) => {
                warn!(%error, "sign-in failed");
                Err(AuthError::Unavailable)
            }
        }
    }

    /// Ends the session and publishes signed-out.
    ///
    /// The local session is dropped even when the provider call fails.
    pub async fn sign_out(&self) {
        if let Err(error) = self.provider.sign_out().await {
            warn!(%error, "provider sign-out failed");
        }
        info!("signed out");
        self.publish(SessionSignal::SignedOut);
    }

    /// Publishes signed-out when the current session expired at `now_ms`.
    ///
    /// Returns `true` when an expiry was published.
    pub fn expire_if_due(&self, now_ms: u64) -> bool {
        let expired = self
            .sessions
            .borrow()
            .session()
            .is_some_and(|session| session.is_expired(now_ms));
        if expired {
            info!("session expired");
            self.publish(SessionSignal::SignedOut);
        }
        expired
    }

    fn publish(&self, signal: SessionSignal) {
        self.sessions.send_if_modified(|current| {
            if *current == signal {
                return false;
            }
            *current = signal;
            true
        });
    }
}

/// Validates sign-in endpoint constraints.
///
/// # Errors
/// Returns [`ProviderError::InvalidEndpoint`] for non-HTTPS URLs or a path
/// that does not end with [`REQUIRED_SIGN_IN_PATH`].
pub fn validate_sign_in_endpoint(endpoint: &str) -> Result<Url, ProviderError> {
    let parsed = Url::parse(endpoint)
        .map_err(|error| ProviderError::InvalidEndpoint(format!("invalid sign-in url: {error}")))?;

    if parsed.scheme() != "https" {
        return Err(ProviderError::InvalidEndpoint(
            "sign-in endpoint must use https".to_string(),
        ));
    }

    if !parsed.path().ends_with(REQUIRED_SIGN_IN_PATH) {
        return Err(ProviderError::InvalidEndpoint(format!(
            "sign-in endpoint path must end with {REQUIRED_SIGN_IN_PATH}"
        )));
    }

    Ok(parsed)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
    return_secure_token: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    #[serde(default)]
    email: String,
    id_token: String,
    #[serde(default)]
    refresh_token: String,
    expires_in: String,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    #[serde(default)]
    refresh_token: String,
    expires_in: String,
    #[serde(default)]
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

fn error_code(message: &str) -> &str {
    message.split_whitespace().next().unwrap_or_default()
}

/// Returns `true` when a Firebase error code means the credentials are wrong.
///
/// Codes may carry a trailing explanation (`"CODE : detail"`).
pub fn is_credential_rejection(message: &str) -> bool {
    matches!(
        error_code(message),
        "INVALID_LOGIN_CREDENTIALS"
            | "INVALID_PASSWORD"
            | "EMAIL_NOT_FOUND"
            | "INVALID_EMAIL"
            | "MISSING_PASSWORD"
            | "USER_DISABLED"
    )
}

/// Returns `true` when a Secure Token error code means the refresh token can
/// never be exchanged again.
pub fn is_refresh_rejection(message: &str) -> bool {
    matches!(
        error_code(message),
        "TOKEN_EXPIRED"
            | "INVALID_REFRESH_TOKEN"
            | "MISSING_REFRESH_TOKEN"
            | "INVALID_GRANT_TYPE"
            | "USER_DISABLED"
            | "USER_NOT_FOUND"
    )
}

fn lifetime_ms(expires_in: &str) -> Result<u64, ProviderError> {
    let seconds: u64 = expires_in
        .trim()
        .parse()
        .map_err(|_| ProviderError::InvalidResponse(format!("invalid expiresIn: {expires_in}")))?;
    Ok(seconds.saturating_mul(1_000))
}

fn renewed_session(
    previous: &Session,
    response: RefreshResponse,
    now_ms: u64,
) -> Result<Session, ProviderError> {
    if response.id_token.trim().is_empty() {
        return Err(ProviderError::InvalidResponse(
            "refresh response missing id token".to_string(),
        ));
    }
    if !response.user_id.is_empty() && response.user_id != previous.uid {
        return Err(ProviderError::InvalidResponse(
            "refresh response belongs to another user".to_string(),
        ));
    }

    let refresh_token = if response.refresh_token.is_empty() {
        previous.refresh_token.clone().unwrap_or_default()
    } else {
        response.refresh_token
    };
    Ok(Session::new(
        previous.uid.clone(),
        previous.email.clone(),
        response.id_token,
        now_ms.saturating_add(lifetime_ms(&response.expires_in)?),
    )
    .with_refresh_token(refresh_token))
}

#[derive(Serialize, Deserialize)]
struct StoredSession {
    uid: String,
    email: String,
    id_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_at_ms: u64,
}

/// JSON file holding the last signed-in session across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Creates a store at `path`; nothing is touched until the first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored session.
    ///
    /// A missing file is no session.
    ///
    /// # Errors
    /// Returns [`ProviderError::Storage`] when the file exists but cannot be
    /// read or decoded.
    pub fn load(&self) -> Result<Option<Session>, ProviderError> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(self.storage_error("read", &error)),
        };
        let stored: StoredSession = serde_json::from_slice(&contents)
            .map_err(|error| ProviderError::Storage(format!("{}: {error}", self.path.display())))?;

        let session = Session::new(stored.uid, stored.email, stored.id_token, stored.expires_at_ms);
        Ok(Some(match stored.refresh_token {
            Some(token) => session.with_refresh_token(token),
            None => session,
        }))
    }

    /// Replaces the stored session.
    ///
    /// # Errors
    /// Returns [`ProviderError::Storage`] when the file cannot be written.
    pub fn save(&self, session: &Session) -> Result<(), ProviderError> {
        let serialized = serde_json::to_vec_pretty(&StoredSession {
            uid: session.uid.clone(),
            email: session.email.clone(),
            id_token: session.id_token.clone(),
            refresh_token: session.refresh_token.clone(),
            expires_at_ms: session.expires_at_ms,
        })
        .map_err(|error| ProviderError::Storage(error.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|error| self.storage_error("create", &error))?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options
            .open(&self.path)
            .and_then(|mut file| file.write_all(&serialized))
            .map_err(|error| self.storage_error("write", &error))
    }

    /// Deletes the stored session; a missing file is not an error.
    ///
    /// # Errors
    /// Returns [`ProviderError::Storage`] when the file cannot be removed.
    pub fn clear(&self) -> Result<(), ProviderError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(self.storage_error("remove", &error)),
        }
    }

    fn storage_error(&self, action: &str, error: &io::Error) -> ProviderError {
        ProviderError::Storage(format!("cannot {action} {}: {error}", self.path.display()))
    }
}

/// Firebase Identity Toolkit provider.
///
/// Without a [`SessionStore`] the session lives only as long as the
/// provider. Expired sessions are renewed through
/// [`FIREBASE_REFRESH_ENDPOINT`] when a refresh token is available.
pub struct FirebaseIdentityProvider {
    client: reqwest::Client,
    endpoint: Url,
    refresh_endpoint: Url,
    store: Option<SessionStore>,
    session: Mutex<Option<Session>>,
}

impl FirebaseIdentityProvider {
    /// Creates a provider against the public Firebase endpoint.
    ///
    /// # Errors
    /// See [`FirebaseIdentityProvider::with_endpoint`].
    pub fn new(api_key: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Self::with_endpoint(FIREBASE_SIGN_IN_ENDPOINT, api_key, timeout)
    }

    /// Creates a provider against a custom (for example emulator) endpoint.
    ///
    /// # Errors
    /// Returns [`ProviderError::InvalidEndpoint`] for an invalid endpoint or a
    /// blank API key, and [`ProviderError::Transport`] when the HTTP client
    /// cannot be built.
    pub fn with_endpoint(
        endpoint: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ProviderError::InvalidEndpoint("api key is empty".to_string()));
        }

        let mut endpoint = validate_sign_in_endpoint(endpoint)?;
        endpoint.query_pairs_mut().append_pair("key", api_key);
        let mut refresh_endpoint = Url::parse(FIREBASE_REFRESH_ENDPOINT).map_err(|error| {
            ProviderError::InvalidEndpoint(format!("invalid refresh url: {error}"))
        })?;
        refresh_endpoint.query_pairs_mut().append_pair("key", api_key);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ProviderError::Transport(format!("http client build failed: {error}")))?;

        Ok(Self {
            client,
            endpoint,
            refresh_endpoint,
            store: None,
            session: Mutex::new(None),
        })
    }

    /// Persists sessions to `store` so later processes can restore them.
    pub fn with_store(mut self, store: SessionStore) -> Self {
        self.store = Some(store);
        self
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, session: &Session) {
        *self.session() = Some(session.clone());
        if let Some(store) = &self.store
            && let Err(error) = store.save(session)
        {
            warn!(%error, "session not persisted");
        }
    }

    fn forget(&self) {
        *self.session() = None;
        if let Some(store) = &self.store
            && let Err(error) = store.clear()
        {
            warn!(%error, "stored session not removed");
        }
    }

    fn persisted(&self) -> Option<Session> {
        let store = self.store.as_ref()?;
        match store.load() {
            Ok(session) => session,
            Err(error) => {
                warn!(%error, "ignoring unreadable session file");
                None
            }
        }
    }

    async fn post_json<B, R>(
        &self,
        url: &Url,
        body: &B,
        rejected: fn(&str) -> bool,
    ) -> Result<R, ProviderError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|error| ProviderError::Transport(error.without_url().to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| ProviderError::Transport(error.without_url().to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorEnvelope>(&bytes)
                .map(|envelope| envelope.error.message)
                .unwrap_or_default();
            if rejected(&message) {
                return Err(ProviderError::Rejected(message));
            }
            return Err(ProviderError::Transport(format!(
                "identity endpoint returned status {}: {message}",
                status.as_u16()
            )));
        }

        serde_json::from_slice(&bytes)
            .map_err(|error| ProviderError::InvalidResponse(error.to_string()))
    }

    async fn refresh(
        &self,
        previous: &Session,
        refresh_token: &str,
    ) -> Result<Session, ProviderError> {
        let response: RefreshResponse = self
            .post_json(
                &self.refresh_endpoint,
                &RefreshRequest {
                    grant_type: "refresh_token",
                    refresh_token,
                },
                is_refresh_rejection,
            )
            .await?;
        renewed_session(previous, response, epoch_ms())
    }
}

#[async_trait]
impl IdentityProvider for FirebaseIdentityProvider {
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, ProviderError> {
        let parsed: SignInResponse = self
            .post_json(
                &self.endpoint,
                &SignInRequest {
                    email: credentials.email.trim(),
                    password: &credentials.password,
                    return_secure_token: true,
                },
                is_credential_rejection,
            )
            .await?;

        if parsed.local_id.trim().is_empty() || parsed.id_token.trim().is_empty() {
            return Err(ProviderError::InvalidResponse(
                "response missing user id or token".to_string(),
            ));
        }

        let email = if parsed.email.is_empty() {
            credentials.email.trim().to_string()
        } else {
            parsed.email
        };
        let session = Session::new(
            parsed.local_id,
            email,
            parsed.id_token,
            epoch_ms().saturating_add(lifetime_ms(&parsed.expires_in)?),
        )
        .with_refresh_token(parsed.refresh_token);
        self.remember(&session);
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        self.forget();
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        let cached = self.session().clone();
        let Some(session) = cached.or_else(|| self.persisted()) else {
            return Ok(None);
        };

        if !session.is_expired(epoch_ms()) {
            *self.session() = Some(session.clone());
            return Ok(Some(session));
        }

        let Some(refresh_token) = session.refresh_token().map(str::to_string) else {
            debug!("stored session expired without a refresh token");
            self.forget();
            return Ok(None);
        };

        match self.refresh(&session, &refresh_token).await {
            Ok(renewed) => {
                info!(uid = %renewed.uid, "session renewed");
                self.remember(&renewed);
                Ok(Some(renewed))
            }
            Err(ProviderError::Rejected(detail)) => {
                warn!(%detail, "refresh token rejected; signing out");
                self.forget();
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}

/// Wall-clock epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Provider-side failures; detail is for logs only.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Endpoint or key violates configuration requirements.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// Provider rejected the credentials.
    #[error("credentials rejected: {0}")]
    Rejected(String),
    /// Network or server failure.
    #[error("identity provider transport failure: {0}")]
    Transport(String),
    /// Response violated the provider contract.
    #[error("invalid identity provider response: {0}")]
    InvalidResponse(String),
    /// Session file could not be read or written.
    #[error("session store failure: {0}")]
    Storage(String),
}

/// User-facing auth errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Credentials were blank or rejected.
    #[error("Invalid email or password")]
    InvalidCredentials,
    /// Provider could not be reached or answered unexpectedly.
    #[error("Authentication failed. Please try again.")]
    Unavailable,
}

#[cfg(test)]
mod tests {
    //! Unit tests for gate transitions and provider policy.

    use super::*;

    fn session(expires_at_ms: u64) -> Session {
        Session::new("uid-1", "manager@viper.ai", "token-abc", expires_at_ms)
    }

    #[test]
    fn gate_cycles_between_states() {
        let mut gate = AuthGate::new();
        assert_eq!(gate.view(), GateView::Loading);

        assert_eq!(gate.on_session_change(Some(session(10))), GateView::Protected);
        let redirect = gate.on_session_change(None);
        assert_eq!(
            redirect,
            GateView::RedirectToLogin {
                route: LOGIN_ROUTE,
                replace_history: true,
            }
        );
        assert_eq!(gate.on_session_change(Some(session(10))), GateView::Protected);
    }

    #[test]
    fn validates_expected_endpoint_policy() {
        validate_sign_in_endpoint(FIREBASE_SIGN_IN_ENDPOINT).expect("endpoint should pass");
        assert!(validate_sign_in_endpoint(
            "http://identitytoolkit.googleapis.com/v1/accounts:signInWithPassword"
        )
        .is_err());
        assert!(validate_sign_in_endpoint("https://example.test/v1/accounts:signUp").is_err());
    }

    #[test]
    fn classifies_firebase_error_codes() {
        assert!(is_credential_rejection("INVALID_LOGIN_CREDENTIALS"));
        assert!(is_credential_rejection("INVALID_PASSWORD : bad"));
        assert!(!is_credential_rejection("TOO_MANY_ATTEMPTS_TRY_LATER : slow down"));
        assert!(!is_credential_rejection(""));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let rendered = format!(
            "{:?} {:?}",
            Credentials::new("a@b.c", "hunter2"),
            session(1)
        );
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("token-abc"));

        let renewable = format!("{:?}", session(1).with_refresh_token("refresh-xyz"));
        assert!(!renewable.contains("refresh-xyz"));
    }

    #[test]
    fn classifies_refresh_error_codes() {
        assert!(is_refresh_rejection("TOKEN_EXPIRED"));
        assert!(is_refresh_rejection("INVALID_REFRESH_TOKEN : revoked"));
        assert!(!is_refresh_rejection("QUOTA_EXCEEDED"));
    }

    #[test]
    fn renewed_session_keeps_identity_and_new_tokens() {
        let previous = session(5).with_refresh_token("old-refresh");
        let renewed = renewed_session(
            &previous,
            RefreshResponse {
                id_token: "new-id".to_string(),
                refresh_token: "new-refresh".to_string(),
                expires_in: "3600".to_string(),
                user_id: String::new(),
            },
            1_000,
        )
        .expect("refresh response should map");

        assert_eq!(renewed.uid, "uid-1");
        assert_eq!(renewed.email, "manager@viper.ai");
        assert_eq!(renewed.id_token(), "new-id");
        assert_eq!(renewed.refresh_token(), Some("new-refresh"));
        assert_eq!(renewed.expires_at_ms, 3_601_000);
    }
}
