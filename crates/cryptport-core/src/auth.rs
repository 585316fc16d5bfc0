// SPDX-License-Identifier: AGPL-3.0
// CryptPort Core - Auth service
//
// Trades credentials for a bearer token and holds it for the life of the
// process. The token is only ever replaced by a later successful login or
// cleared by logout.

use crate::types::{Credentials, SessionError, SessionResult};
use futures::future::BoxFuture;
use std::sync::RwLock;
use uuid::Uuid;

/// Longest token prefix shown by `display_token`
const TOKEN_DISPLAY_LEN: usize = 50;

/// Performs the credential exchange. Implementations may be local or talk
/// to an identity service.
pub trait Authenticator: Send + Sync {
    /// Return a bearer token for valid credentials
    fn authenticate<'a>(&'a self, credentials: &'a Credentials)
        -> BoxFuture<'a, SessionResult<String>>;
}

/// Issues opaque random tokens without contacting anything
#[derive(Debug, Default, Clone)]
pub struct LocalAuthenticator;

impl Authenticator for LocalAuthenticator {
    fn authenticate<'a>(
        &'a self,
        _credentials: &'a Credentials,
    ) -> BoxFuture<'a, SessionResult<String>> {
        Box::pin(async move { Ok(format!("cpt_{}", Uuid::new_v4().simple())) })
    }
}

#[derive(Debug, Default)]
struct AuthState {
    token: Option<String>,
    email: Option<String>,
}

/// Owner of the session token
pub struct AuthService {
    authenticator: Box<dyn Authenticator>,
    state: RwLock<AuthState>,
}

impl AuthService {
    pub fn new() -> Self {
        Self::with_authenticator(LocalAuthenticator)
    }

    pub fn with_authenticator(authenticator: impl Authenticator + 'static) -> Self {
        Self {
            authenticator: Box::new(authenticator),
            state: RwLock::new(AuthState::default()),
        }
    }

    /// Validate the credentials, exchange them and store the token.
    ///
    /// A later successful login replaces the previous token. A failed login
    /// leaves the existing state untouched.
    pub async fn login(&self, email: &str, password: &str) -> SessionResult<String> {
        let credentials = Credentials::new(email.trim(), password);
        credentials.validate()?;

        let token = self.authenticator.authenticate(&credentials).await?;
        if token.is_empty() {
            return Err(SessionError::ServerRejected(
                "Authenticator returned an empty token".to_string(),
            ));
        }

        {
            let mut state = self.write_state();
            if state.token.is_some() {
                tracing::info!("Replacing existing session token");
            }
            state.token = Some(token.clone());
            state.email = Some(credentials.email.clone());
        }

        tracing::info!(
            "Logged in as {} (token {})",
            credentials.email,
            redact(&token)
        );
        Ok(token)
    }

    /// Clear the token. Safe to call at any time.
    pub fn logout(&self) {
        let mut state = self.write_state();
        if state.token.take().is_some() {
            tracing::info!("Logged out");
        }
        state.email = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_state().token.is_some()
    }

    /// Current token, or an empty string when logged out
    pub fn get_token(&self) -> String {
        self.read_state().token.clone().unwrap_or_default()
    }

    /// Email of the logged-in account
    pub fn email(&self) -> Option<String> {
        self.read_state().email.clone()
    }

    /// Token shortened for display fields
    pub fn display_token(&self) -> String {
        let token = self.get_token();
        if token.chars().count() > TOKEN_DISPLAY_LEN {
            let prefix: String = token.chars().take(TOKEN_DISPLAY_LEN).collect();
            format!("{}...", prefix)
        } else {
            token
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, AuthState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, AuthState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for AuthService {
    fn default() -> Self {
        Self::new()
    }
}

/// Shorten a token for log output
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}…", prefix)
}
