//! Request-scoped identity.
//!
//! The surrounding layer (CLI, HTTP) authenticates the caller and builds a
//! [`RequestContext`]; every store and ledger operation takes one explicitly.

use crate::core::error::LedgerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "guest" => Ok(Role::Guest),
            "admin" => Ok(Role::Admin),
            other => Err(LedgerError::BadRequest(format!("unknown role '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub user_id: i64,
    pub role: Role,
    pub party_id: Option<i64>,
}

impl RequestContext {
    pub fn new(user_id: i64, role: Role) -> Self {
        Self {
            user_id,
            role,
            party_id: None,
        }
    }

    pub fn in_party(mut self, party_id: i64) -> Self {
        self.party_id = Some(party_id);
        self
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), LedgerError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(LedgerError::Forbidden("admin role required".into()))
        }
    }

    /// The party this request acts in.
    pub fn require_party(&self) -> Result<i64, LedgerError> {
        self.party_id
            .ok_or_else(|| LedgerError::BadRequest("not in any party".into()))
    }

    /// Audit actor label.
    pub fn actor(&self) -> String {
        format!("user:{}", self.user_id)
    }
}

/// Unwrap the caller identity of a request that requires a login.
pub fn authenticated(ctx: Option<&RequestContext>) -> Result<&RequestContext, LedgerError> {
    ctx.ok_or_else(|| LedgerError::Unauthorized("login required".into()))
}
