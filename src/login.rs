//! Login state machine and authenticators

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

/// An authorized user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub anonymous: bool,
    /// For anonymous logins, the password the client sent (usually an e-mail address).
    pub identity: Option<String>,
}

impl Principal {
    pub fn user(name: impl Into<String>) -> Self {
        Self { name: name.into(), anonymous: false, identity: None }
    }

    pub fn anonymous(identity: impl Into<String>) -> Self {
        Self { name: "anonymous".to_string(), anonymous: true, identity: Some(identity.into()) }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginState {
    Unauthenticated,
    /// A security mechanism was negotiated with `AUTH`.
    Authenticated,
    NeedPassword,
    Authorized,
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Rejected login transition. Carries the reply code to send.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct LoginError {
    pub code: u16,
    pub message: &'static str,
}

const BAD_SEQUENCE: LoginError = LoginError { code: 503, message: "Bad sequence of commands." };

/// One instance per control connection.
#[derive(Debug)]
pub struct LoginStateMachine {
    state: LoginState,
    // State to return to when PASS fails
    before_user: LoginState,
    pending_user: Option<String>,
    mechanism: Option<String>,
}

impl Default for LoginStateMachine {
    fn default() -> Self {
        Self {
            state: LoginState::Unauthenticated,
            before_user: LoginState::Unauthenticated,
            pending_user: None,
            mechanism: None,
        }
    }
}

impl LoginStateMachine {
    pub fn state(&self) -> LoginState {
        self.state
    }

    pub fn is_authorized(&self) -> bool {
        self.state == LoginState::Authorized
    }

    pub fn mechanism(&self) -> Option<&str> {
        self.mechanism.as_deref()
    }

    /// `AUTH <mechanism>` is only valid before anything else happened.
    pub fn select_mechanism(&mut self, mechanism: &str) -> Result<(), LoginError> {
        if self.state != LoginState::Unauthenticated {
            return Err(BAD_SEQUENCE);
        }
        self.mechanism = Some(mechanism.to_ascii_uppercase());
        self.state = LoginState::Authenticated;
        Ok(())
    }

    /// `USER`. A new `USER` while logged in starts a fresh login.
    pub fn user(&mut self, name: &str) {
        self.before_user = if self.mechanism.is_some() {
            LoginState::Authenticated
        } else {
            LoginState::Unauthenticated
        };
        self.pending_user = Some(name.to_string());
        self.state = LoginState::NeedPassword;
    }

    /// User name waiting for its `PASS`.
    pub fn pending_user(&self) -> Result<&str, LoginError> {
        match (self.state, self.pending_user.as_deref()) {
            (LoginState::NeedPassword, Some(user)) => Ok(user),
            _ => Err(BAD_SEQUENCE),
        }
    }

    pub fn authorize(&mut self) {
        self.pending_user = None;
        self.state = LoginState::Authorized;
    }

    pub fn reject(&mut self) {
        self.pending_user = None;
        self.state = self.before_user;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub enum AuthOutcome {
    Accepted(Principal),
    Rejected,
    /// The authenticator doesn't know this user; ask the next one.
    Unknown,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, user: &str, password: &str) -> AuthOutcome;
}

/// Tries authenticators in order; the first one that knows the user decides.
pub async fn authenticate(chain: &[Box<dyn Authenticator>], user: &str, password: &str) -> Option<Principal> {
    for auth in chain {
        match auth.authenticate(user, password).await {
            AuthOutcome::Accepted(p) => return Some(p),
            AuthOutcome::Rejected => return None,
            AuthOutcome::Unknown => continue,
        }
    }
    None
}

/// `anonymous` and `ftp` with any password.
pub struct AnonymousAuthenticator;

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(&self, user: &str, password: &str) -> AuthOutcome {
        if user.eq_ignore_ascii_case("anonymous") || user.eq_ignore_ascii_case("ftp") {
            AuthOutcome::Accepted(Principal::anonymous(password))
        } else {
            AuthOutcome::Unknown
        }
    }
}

/// Accounts from the configuration file.
pub struct StaticPasswordAuthenticator {
    accounts: HashMap<String, String>,
}

impl StaticPasswordAuthenticator {
    pub fn new(accounts: HashMap<String, String>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl Authenticator for StaticPasswordAuthenticator {
    async fn authenticate(&self, user: &str, password: &str) -> AuthOutcome {
        match self.accounts.get(user) {
            Some(expected) if expected == password => AuthOutcome::Accepted(Principal::user(user)),
            Some(_) => AuthOutcome::Rejected,
            None => AuthOutcome::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_then_password_authorizes() {
        let mut m = LoginStateMachine::default();
        m.user("bob");
        assert_eq!(m.state(), LoginState::NeedPassword);
        assert_eq!(m.pending_user().unwrap(), "bob");
        m.authorize();
        assert!(m.is_authorized());
    }

    #[test]
    fn password_without_user_is_bad_sequence() {
        let m = LoginStateMachine::default();
        assert_eq!(m.pending_user().unwrap_err().code, 503);
    }

    #[test]
    fn rejected_password_returns_to_previous_state() {
        let mut m = LoginStateMachine::default();
        m.select_mechanism("tls").unwrap();
        m.user("bob");
        m.reject();
        assert_eq!(m.state(), LoginState::Authenticated);
        assert_eq!(m.mechanism(), Some("TLS"));
    }

    #[test]
    fn auth_only_before_login() {
        let mut m = LoginStateMachine::default();
        m.user("bob");
        m.authorize();
        assert_eq!(m.select_mechanism("TLS").unwrap_err().code, 503);
        m.reset();
        assert_eq!(m.state(), LoginState::Unauthenticated);
        assert!(m.select_mechanism("TLS").is_ok());
    }

    #[tokio::test]
    async fn first_authenticator_that_knows_the_user_decides() {
        let mut accounts = HashMap::new();
        accounts.insert("bob".to_string(), "secret".to_string());
        let chain: Vec<Box<dyn Authenticator>> =
            vec![Box::new(AnonymousAuthenticator), Box::new(StaticPasswordAuthenticator::new(accounts))];

        let anon = authenticate(&chain, "ftp", "me@example.com").await.unwrap();
        assert!(anon.anonymous);
        assert_eq!(anon.identity.as_deref(), Some("me@example.com"));
        assert_eq!(authenticate(&chain, "bob", "secret").await.unwrap().name, "bob");
        assert!(authenticate(&chain, "bob", "wrong").await.is_none());
        assert!(authenticate(&chain, "eve", "x").await.is_none());
    }
}
