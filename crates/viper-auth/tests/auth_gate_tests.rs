use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use viper_auth::{
    AuthClient, AuthError, AuthGate, Credentials, GateView, IdentityProvider, LOGIN_ROUTE,
    ProviderError, Session, SessionSignal,
};

const EMAIL: &str = "manager@viper.ai";
const PASSWORD: &str = "correct-horse";

#[derive(Default)]
struct InMemoryProvider {
    session: Mutex<Option<Session>>,
    sign_in_calls: AtomicU32,
    offline: bool,
    fail_sign_out: bool,
}

impl InMemoryProvider {
    fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
            ..Self::default()
        }
    }
}

#[async_trait]
impl IdentityProvider for InMemoryProvider {
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, ProviderError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        if self.offline {
            return Err(ProviderError::Transport("connection refused".to_string()));
        }
        if credentials.email != EMAIL || credentials.password != PASSWORD {
            return Err(ProviderError::Rejected("INVALID_LOGIN_CREDENTIALS".to_string()));
        }
        let session = Session::new("uid-7", EMAIL, "token-7", 60_000);
        *self.session.lock().expect("lock") = Some(session.clone());
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        *self.session.lock().expect("lock") = None;
        if self.fail_sign_out {
            return Err(ProviderError::Transport("network down".to_string()));
        }
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<Session>, ProviderError> {
        if self.offline {
            return Err(ProviderError::Transport("connection refused".to_string()));
        }
        Ok(self.session.lock().expect("lock").clone())
    }
}

#[tokio::test]
async fn restore_resolves_gate_from_provider() {
    let provider = Arc::new(InMemoryProvider::with_session(Session::new(
        "uid-1", EMAIL, "token-1", 60_000,
    )));
    let client = AuthClient::new(provider);
    let mut gate = AuthGate::new();
    assert_eq!(gate.apply(&client.current()), GateView::Loading);

    let signal = client.restore().await;
    assert_eq!(gate.apply(&signal), GateView::Protected);
}

#[tokio::test]
async fn unreachable_provider_restores_as_signed_out() {
    let provider = Arc::new(InMemoryProvider {
        offline: true,
        ..InMemoryProvider::default()
    });
    let client = AuthClient::new(provider);

    assert_eq!(client.restore().await, SessionSignal::SignedOut);
}

#[tokio::test]
async fn subscription_delivers_sign_in_and_sign_out() {
    let client = AuthClient::new(Arc::new(InMemoryProvider::default()));
    let mut subscription = client.on_session_change();
    let mut gate = AuthGate::new();

    client
        .sign_in(&Credentials::new(EMAIL, PASSWORD))
        .await
        .expect("sign-in should succeed");
    let signal = subscription.next().await.expect("client alive");
    assert_eq!(gate.apply(&signal), GateView::Protected);

    client.sign_out().await;
    let signal = subscription.next().await.expect("client alive");
    assert_eq!(
        gate.apply(&signal),
        GateView::RedirectToLogin {
            route: LOGIN_ROUTE,
            replace_history: true,
        }
    );
    subscription.unsubscribe();
}

#[tokio::test]
async fn blank_credentials_skip_the_provider() {
    let provider = Arc::new(InMemoryProvider::default());
    let client = AuthClient::new(provider.clone());

    let error = client
        .sign_in(&Credentials::new("   ", PASSWORD))
        .await
        .expect_err("blank email must fail");

    assert_eq!(error, AuthError::InvalidCredentials);
    assert_eq!(provider.sign_in_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_and_unreachable_map_to_generic_messages() {
    let client = AuthClient::new(Arc::new(InMemoryProvider::default()));
    let rejected = client
        .sign_in(&Credentials::new(EMAIL, "wrong"))
        .await
        .expect_err("wrong password must fail");
    assert_eq!(rejected.to_string(), "Invalid email or password");
    assert_eq!(client.current(), SessionSignal::Unresolved);

    let offline = AuthClient::new(Arc::new(InMemoryProvider {
        offline: true,
        ..InMemoryProvider::default()
    }));
    let unavailable = offline
        .sign_in(&Credentials::new(EMAIL, PASSWORD))
        .await
        .expect_err("offline provider must fail");
    assert_eq!(unavailable.to_string(), "Authentication failed. Please try again.");
}

#[tokio::test]
async fn failed_provider_sign_out_still_ends_local_session() {
    let provider = Arc::new(InMemoryProvider {
        fail_sign_out: true,
        ..InMemoryProvider::default()
    });
    let client = AuthClient::new(provider);
    client
        .sign_in(&Credentials::new(EMAIL, PASSWORD))
        .await
        .expect("sign-in should succeed");

    client.sign_out().await;

    assert_eq!(client.current(), SessionSignal::SignedOut);
}

#[tokio::test]
async fn expiry_publishes_signed_out_once() {
    let client = AuthClient::new(Arc::new(InMemoryProvider::default()));
    client
        .sign_in(&Credentials::new(EMAIL, PASSWORD))
        .await
        .expect("sign-in should succeed");

    assert!(!client.expire_if_due(59_999));
    assert!(client.expire_if_due(60_000));
    assert!(!client.expire_if_due(70_000));
    assert_eq!(client.current(), SessionSignal::SignedOut);
}
