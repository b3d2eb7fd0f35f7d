//! Caller identity and role checks
//!
//! Tokens are issued elsewhere; this crate only consumes verified claims.
use super::error::OrderError;
use super::lifecycle::Actor;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Customer,
}

impl Role {
    /// Unknown roles are treated as plain customers.
    pub fn parse(role: &str) -> Self {
        if role.trim().eq_ignore_ascii_case("admin") {
            Role::Admin
        } else {
            Role::Customer
        }
    }
}

/// Verified bearer token contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub user_id: String,
    pub email: String,
    pub role: Role,
}

impl Claims {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            role,
        }
    }
}

/// Verifies a raw bearer token, e.g. a JWT checked against the issuer's key.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> anyhow::Result<Claims>;
}

/// Decides who may use privileged (admin console) operations.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    staff_emails: BTreeSet<String>,
}

impl AccessPolicy {
    pub fn new<I, S>(staff_emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            staff_emails: staff_emails
                .into_iter()
                .map(|email| email.as_ref().trim().to_ascii_lowercase())
                .filter(|email| !email.is_empty())
                .collect(),
        }
    }

    /// Admins and designated staff emails.
    pub fn is_privileged(&self, claims: &Claims) -> bool {
        claims.role == Role::Admin
            || self
                .staff_emails
                .contains(&claims.email.trim().to_ascii_lowercase())
    }

    pub fn require_privileged(&self, claims: &Claims) -> Result<Actor, OrderError> {
        if self.is_privileged(claims) {
            Ok(Actor::Staff)
        } else {
            Err(OrderError::Forbidden(format!(
                "{} is not an admin or staff member",
                claims.email
            )))
        }
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, OrderError> {
    let header = header.ok_or_else(|| OrderError::Unauthorized("missing bearer token".into()))?;
    let (scheme, token) = header
        .trim()
        .split_once(' ')
        .ok_or_else(|| OrderError::Unauthorized("malformed authorization header".into()))?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(OrderError::Unauthorized(
            "malformed authorization header".into(),
        ));
    }
    Ok(token.trim())
}
