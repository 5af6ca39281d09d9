//! Handshake and login gate.
//!
//! On the server, [`SecurityGate`] is the first pipeline stage and drives each
//! session through `Handshaking -> Authenticating -> Authenticated`. Nothing
//! but the expected handshake or login message is accepted before the session
//! is authenticated; anything else closes it. [`login`] runs the same
//! exchange from the client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::attributes::AttributeKey;
use crate::config::SessionConfig;
use crate::crypto::{KeyExchange, LoginKey};
use crate::error::{Result, TransportError};
use crate::handler::{Action, Stage};
use crate::message::{Body, Message};
use crate::metrics::TransportMetrics;
use crate::rpc::Requestor;
use crate::scheduler::TimeoutScheduler;
use crate::session::{CloseReason, SecurityState, Session, SessionId};

const LOGIN_KEY: AttributeKey = AttributeKey::new("remsh_transport::security::SecurityGate", "login-key");
const TOKEN_KEY: AttributeKey =
    AttributeKey::new("remsh_transport::security::SecurityGate", "security-token");

/// Checks user credentials for the security gate.
#[async_trait]
pub trait UserAuthenticator: Send + Sync {
    /// Returns `Ok(true)` if `username` may log in with `password` on `session`.
    async fn authenticate(&self, session: &Session, username: &str, password: &[u8]) -> Result<bool>;
}

/// Authenticator backed by a fixed user table.
#[derive(Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for StaticAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut users: Vec<&str> = self.users.keys().map(String::as_str).collect();
        users.sort_unstable();
        f.debug_struct("StaticAuthenticator").field("users", &users).finish()
    }
}

impl StaticAuthenticator {
    /// Empty user table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user, builder style.
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        self.add_user(username, password);
        self
    }

    /// Adds or replaces a user.
    pub fn add_user(&mut self, username: impl Into<String>, password: impl Into<Vec<u8>>) {
        self.users
            .insert(username.into(), Zeroizing::new(password.into()));
    }

    /// Number of users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserAuthenticator for StaticAuthenticator {
    async fn authenticate(&self, _session: &Session, username: &str, password: &[u8]) -> Result<bool> {
        Ok(match self.users.get(username) {
            Some(expected) => bool::from(expected.as_slice().ct_eq(password)),
            None => false,
        })
    }
}

/// Per-process secret proving a session passed the gate.
#[derive(Clone)]
pub struct SecurityToken(Arc<[u8; 32]>);

impl std::fmt::Debug for SecurityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecurityToken(..)")
    }
}

impl SecurityToken {
    /// Random token.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self(Arc::new(secret))
    }

    /// Token handed to the client of `session`; never reveals the secret.
    pub fn session_token(&self, session: SessionId) -> Bytes {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_slice());
        hasher.update(session.as_u64().to_be_bytes());
        Bytes::copy_from_slice(&hasher.finalize())
    }

    fn matches(&self, other: &SecurityToken) -> bool {
        bool::from(self.0.as_slice().ct_eq(other.0.as_slice()))
    }
}

/// Server-side handshake and login state machine.
pub struct SecurityGate {
    authenticator: Arc<dyn UserAuthenticator>,
    scheduler: Arc<TimeoutScheduler>,
    token: SecurityToken,
    handshake_timeout: Duration,
    login_timeout: Duration,
    metrics: Arc<TransportMetrics>,
}

impl std::fmt::Debug for SecurityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityGate")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("login_timeout", &self.login_timeout)
            .finish_non_exhaustive()
    }
}

impl SecurityGate {
    /// Gate checking logins with `authenticator`.
    pub fn new(
        authenticator: Arc<dyn UserAuthenticator>,
        scheduler: Arc<TimeoutScheduler>,
        config: &SessionConfig,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        Self {
            authenticator,
            scheduler,
            token: SecurityToken::generate(),
            handshake_timeout: config.handshake_timeout(),
            login_timeout: config.login_timeout(),
            metrics,
        }
    }

    /// Token bound to authenticated sessions.
    pub fn token(&self) -> &SecurityToken {
        &self.token
    }

    fn violation(session: &Session, state: SecurityState, reason: impl Into<String>) -> Action {
        let reason = reason.into();
        warn!(session = %session.id(), state = %state, reason = %reason, "protocol violation");
        Action::Close(CloseReason::ProtocolViolation { state, reason })
    }

    async fn on_handshake(&self, session: &Session, message: &Message, public_key: &[u8]) -> Action {
        if !self.scheduler.cancel_for(session) {
            debug!(session = %session.id(), "handshake arrived after its timeout fired");
            return Action::Consumed;
        }

        let exchange = KeyExchange::generate();
        let key = match exchange.derive_login_key(public_key) {
            Ok(key) => key,
            Err(e) => return Self::violation(session, SecurityState::Handshaking, e.to_string()),
        };
        session.attributes().rebind(LOGIN_KEY, key);

        if !session.advance(SecurityState::Handshaking, SecurityState::Authenticating) {
            return Action::Consumed;
        }
        self.scheduler
            .schedule_for(session, self.login_timeout, |session| async move {
                session.close(CloseReason::LoginTimeout).await;
            });

        let reply = Body::HandshakeResult {
            server_public_key: exchange.public_key_bytes(),
        };
        if let Err(e) = session.reply(message, reply).await {
            debug!(session = %session.id(), error = %e, "failed to send handshake result");
        }
        Action::Consumed
    }

    async fn on_login(
        &self,
        session: &Session,
        message: &Message,
        username: &str,
        password: &Bytes,
        encrypted: bool,
    ) -> Action {
        if !self.scheduler.cancel_for(session) {
            debug!(session = %session.id(), "login arrived after its timeout fired");
            return Action::Consumed;
        }

        let key = session.attributes().unbind_as::<LoginKey>(LOGIN_KEY);
        let password = if encrypted {
            let opened = key
                .and_then(|key| {
                    key.ok_or_else(|| TransportError::Security {
                        reason: "no login key negotiated".to_string(),
                    })
                })
                .and_then(|key| key.open(password));
            match opened {
                Ok(password) => password,
                Err(e) => return self.reject(session, message, username, &e.to_string()).await,
            }
        } else {
            Zeroizing::new(password.to_vec())
        };

        let accepted = match self.authenticator.authenticate(session, username, &password).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(session = %session.id(), user = username, error = %e, "authenticator failed");
                false
            }
        };
        if !accepted {
            return self
                .reject(session, message, username, "invalid username or password")
                .await;
        }

        session.attributes().rebind(TOKEN_KEY, self.token.clone());
        if !session.advance(SecurityState::Authenticating, SecurityState::Authenticated) {
            return Action::Consumed;
        }
        self.metrics.inc_handshakes_completed();
        info!(session = %session.id(), user = username, remote = %session.remote_addr(), "session authenticated");

        let reply = Body::LoginSuccess {
            token: self.token.session_token(session.id()),
        };
        if let Err(e) = session.reply(message, reply).await {
            debug!(session = %session.id(), error = %e, "failed to send login success");
        }
        Action::Consumed
    }

    async fn reject(&self, session: &Session, message: &Message, username: &str, reason: &str) -> Action {
        self.metrics.inc_authentication_failures();
        warn!(session = %session.id(), user = username, reason, "login rejected");
        let reply = Body::LoginFailure {
            reason: reason.to_string(),
        };
        if let Err(e) = session.reply(message, reply).await {
            debug!(session = %session.id(), error = %e, "failed to send login failure");
        }
        Action::Close(CloseReason::AuthenticationFailed(reason.to_string()))
    }

    fn check_token(&self, session: &Session, message: Message) -> Action {
        match session.attributes().lookup::<SecurityToken>(TOKEN_KEY) {
            Ok(bound) if bound.matches(&self.token) => Action::Continue(message),
            _ => Self::violation(session, SecurityState::Authenticated, "security token mismatch"),
        }
    }
}

#[async_trait]
impl Stage for SecurityGate {
    fn name(&self) -> &'static str {
        "security-gate"
    }

    async fn on_open(&self, session: &Session) -> Result<()> {
        if session.advance(SecurityState::New, SecurityState::Handshaking) {
            self.scheduler
                .schedule_for(session, self.handshake_timeout, |session| async move {
                    session.close(CloseReason::HandshakeTimeout).await;
                });
        }
        Ok(())
    }

    async fn handle(&self, session: &Session, message: Message) -> Action {
        let state = session.security_state();
        match (state, message.body()) {
            (SecurityState::Handshaking, Body::Handshake { public_key }) => {
                self.on_handshake(session, &message, public_key).await
            }
            (
                SecurityState::Authenticating,
                Body::Login {
                    username,
                    password,
                    encrypted,
                },
            ) => {
                self.on_login(session, &message, username, password, *encrypted)
                    .await
            }
            (SecurityState::Authenticated, Body::Handshake { .. } | Body::Login { .. }) => {
                Self::violation(session, state, "repeated handshake or login")
            }
            (SecurityState::Authenticated, _) => self.check_token(session, message),
            (SecurityState::Closed, _) => Action::Consumed,
            (_, body) => Self::violation(
                session,
                state,
                format!("unexpected {:?} message", body.message_type()),
            ),
        }
    }
}

/// Client credentials for [`login`].
#[derive(Clone)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    password: Zeroizing<Vec<u8>>,
    /// Seal the password under the negotiated key (default).
    pub encrypt_password: bool,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("encrypt_password", &self.encrypt_password)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Credentials that seal the password by default.
    pub fn new(username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
            encrypt_password: true,
        }
    }

    /// Chooses whether the password is sealed.
    pub fn with_encryption(mut self, encrypt_password: bool) -> Self {
        self.encrypt_password = encrypt_password;
        self
    }
}

/// Token returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginToken(Bytes);

impl LoginToken {
    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn during(phase: &'static str, err: TransportError) -> TransportError {
    match err {
        TransportError::RequestTimeout { timeout_ms, .. } => TransportError::Security {
            reason: format!("{} timed out after {}ms", phase, timeout_ms),
        },
        other => other,
    }
}

fn unexpected(phase: &'static str, message: &Message) -> TransportError {
    match message.body() {
        Body::LoginFailure { reason } | Body::Fault { reason } => TransportError::Security {
            reason: reason.clone(),
        },
        body => TransportError::Security {
            reason: format!("unexpected {:?} reply during {}", body.message_type(), phase),
        },
    }
}

/// Runs the handshake and login exchange on a fresh client session.
pub async fn login(
    session: &Session,
    requestor: &Requestor,
    credentials: &Credentials,
    config: &SessionConfig,
) -> Result<LoginToken> {
    if !session.advance(SecurityState::New, SecurityState::Handshaking) {
        return Err(TransportError::IllegalState(format!(
            "cannot log in from state {}",
            session.security_state()
        )));
    }

    let exchange = KeyExchange::generate();
    let handshake = Message::new(Body::Handshake {
        public_key: exchange.public_key_bytes(),
    });
    let reply = requestor
        .request(session, handshake, Some(config.handshake_timeout()))
        .await
        .map_err(|e| during("handshake", e))?;
    let key = match reply.message().body() {
        Body::HandshakeResult { server_public_key } => exchange.derive_login_key(server_public_key)?,
        _ => return Err(unexpected("handshake", reply.message())),
    };
    session.advance(SecurityState::Handshaking, SecurityState::Authenticating);

    let password = if credentials.encrypt_password {
        key.seal(&credentials.password)?
    } else {
        Bytes::copy_from_slice(&credentials.password)
    };
    let login = Message::new(Body::Login {
        username: credentials.username.clone(),
        password,
        encrypted: credentials.encrypt_password,
    });
    let reply = requestor
        .request(session, login, Some(config.login_timeout()))
        .await
        .map_err(|e| during("login", e))?;

    match reply.message().body() {
        Body::LoginSuccess { token } => {
            session.advance(SecurityState::Authenticating, SecurityState::Authenticated);
            debug!(session = %session.id(), user = %credentials.username, "logged in");
            Ok(LoginToken(token.clone()))
        }
        _ => Err(unexpected("login", reply.message())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ResponseKind;
    use crate::scheduler::{SchedulerConfig, TIMEOUT_KEY};
    use crate::session::testing::{decode, session};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn gate(config: &SessionConfig) -> SecurityGate {
        SecurityGate::new(
            Arc::new(StaticAuthenticator::new().with_user("alice", "secret")),
            TimeoutScheduler::start(SchedulerConfig::default()),
            config,
            Arc::new(TransportMetrics::new()),
        )
    }

    fn frozen(mut message: Message) -> Message {
        message.freeze();
        message
    }

    async fn handshake(gate: &SecurityGate, session: &Session, rx: &mut UnboundedReceiver<Bytes>) -> LoginKey {
        let client = KeyExchange::generate();
        let hello = frozen(Message::new(Body::Handshake {
            public_key: client.public_key_bytes(),
        }));
        assert!(matches!(gate.handle(session, hello).await, Action::Consumed));
        let reply = decode(rx.recv().await.unwrap());
        match reply.body() {
            Body::HandshakeResult { server_public_key } => {
                client.derive_login_key(server_public_key).unwrap()
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    fn login_message(key: &LoginKey, username: &str, password: &[u8]) -> Message {
        frozen(Message::new(Body::Login {
            username: username.into(),
            password: key.seal(password).unwrap(),
            encrypted: true,
        }))
    }

    #[tokio::test]
    async fn test_full_exchange_authenticates() {
        let gate = gate(&SessionConfig::default());
        let (session, mut rx) = session();
        gate.on_open(&session).await.unwrap();
        assert_eq!(session.security_state(), SecurityState::Handshaking);
        assert!(session.attributes().contains(TIMEOUT_KEY));

        let key = handshake(&gate, &session, &mut rx).await;
        assert_eq!(session.security_state(), SecurityState::Authenticating);

        let action = gate
            .handle(&session, login_message(&key, "alice", b"secret"))
            .await;
        assert!(matches!(action, Action::Consumed));
        assert_eq!(session.security_state(), SecurityState::Authenticated);
        assert!(!session.attributes().contains(TIMEOUT_KEY));

        let reply = decode(rx.recv().await.unwrap());
        match reply.body() {
            Body::LoginSuccess { token } => {
                assert_eq!(token, &gate.token().session_token(session.id()));
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let request = frozen(Message::request("ping", None));
        assert!(matches!(gate.handle(&session, request).await, Action::Continue(_)));
    }

    #[tokio::test]
    async fn test_plaintext_password_accepted() {
        let gate = gate(&SessionConfig::default());
        let (session, mut rx) = session();
        gate.on_open(&session).await.unwrap();
        handshake(&gate, &session, &mut rx).await;

        let login = frozen(Message::new(Body::Login {
            username: "alice".into(),
            password: Bytes::from_static(b"secret"),
            encrypted: false,
        }));
        gate.handle(&session, login).await;
        assert_eq!(session.security_state(), SecurityState::Authenticated);
    }

    #[tokio::test]
    async fn test_bad_password_rejected_and_closed() {
        let gate = gate(&SessionConfig::default());
        let (session, mut rx) = session();
        gate.on_open(&session).await.unwrap();
        let key = handshake(&gate, &session, &mut rx).await;

        let action = gate
            .handle(&session, login_message(&key, "bogus", b"bogus"))
            .await;
        assert!(matches!(action, Action::Close(CloseReason::AuthenticationFailed(_))));
        let reply = decode(rx.recv().await.unwrap());
        assert_eq!(reply.response_kind(), Some(ResponseKind::Fault));
        assert!(matches!(reply.body(), Body::LoginFailure { .. }));
    }

    #[tokio::test]
    async fn test_request_before_handshake_is_violation() {
        let gate = gate(&SessionConfig::default());
        let (session, _rx) = session();
        gate.on_open(&session).await.unwrap();

        let action = gate
            .handle(&session, frozen(Message::request("ping", None)))
            .await;
        assert!(matches!(
            action,
            Action::Close(CloseReason::ProtocolViolation {
                state: SecurityState::Handshaking,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_repeated_handshake_is_violation() {
        let gate = gate(&SessionConfig::default());
        let (session, mut rx) = session();
        gate.on_open(&session).await.unwrap();
        let key = handshake(&gate, &session, &mut rx).await;
        gate.handle(&session, login_message(&key, "alice", b"secret"))
            .await;

        let again = frozen(Message::new(Body::Handshake {
            public_key: KeyExchange::generate().public_key_bytes(),
        }));
        assert!(matches!(
            gate.handle(&session, again).await,
            Action::Close(CloseReason::ProtocolViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_token_from_other_gate_rejected() {
        let gate_a = gate(&SessionConfig::default());
        let gate_b = gate(&SessionConfig::default());
        let (session, mut rx) = session();
        gate_a.on_open(&session).await.unwrap();
        let key = handshake(&gate_a, &session, &mut rx).await;
        gate_a
            .handle(&session, login_message(&key, "alice", b"secret"))
            .await;

        let request = frozen(Message::request("ping", None));
        assert!(matches!(
            gate_b.handle(&session, request).await,
            Action::Close(CloseReason::ProtocolViolation { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_closes_session() {
        let config = SessionConfig {
            handshake_timeout_ms: 100,
            ..SessionConfig::default()
        };
        let gate = gate(&config);
        let (session, _rx) = session();
        gate.on_open(&session).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(session.close_reason(), Some(CloseReason::HandshakeTimeout));
        assert!(!session.attributes().contains(TIMEOUT_KEY));
    }

    #[tokio::test]
    async fn test_static_authenticator() {
        let (session, _rx) = session();
        let auth = StaticAuthenticator::new().with_user("alice", "secret");
        assert!(auth.authenticate(&session, "alice", b"secret").await.unwrap());
        assert!(!auth.authenticate(&session, "alice", b"Secret").await.unwrap());
        assert!(!auth.authenticate(&session, "bob", b"secret").await.unwrap());
        assert_eq!(auth.len(), 1);
    }

    #[test]
    fn test_session_tokens_differ_per_session() {
        let token = SecurityToken::generate();
        let a = token.session_token(SessionId::from_raw(1));
        let b = token.session_token(SessionId::from_raw(2));
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("alice", "hunter2");
        assert!(creds.encrypt_password);
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
