use crate::engine::EngineError;

/// The principal a reservation is booked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
}

/// Resolves who is making the current request. Passed explicitly into the
/// commit workflow; there is no ambient session state.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Result<User, EngineError>;
}

/// Identity taken from an authenticated wire session (the login name).
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    login: Option<String>,
}

impl SessionIdentity {
    pub fn new(login: Option<String>) -> Self {
        Self { login }
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_user(&self) -> Result<User, EngineError> {
        match self.login.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Ok(User { name: name.to_string() }),
            _ => Err(EngineError::Unauthenticated),
        }
    }
}

/// Always the same user. For tests and tooling.
#[derive(Debug, Clone)]
pub struct FixedIdentity(pub User);

impl FixedIdentity {
    pub fn named(name: &str) -> Self {
        Self(User { name: name.to_string() })
    }
}

impl IdentityProvider for FixedIdentity {
    fn current_user(&self) -> Result<User, EngineError> {
        Ok(self.0.clone())
    }
}
