//! Login credentials and the listener-side authentication hook.

use super::Connection;
use crate::core::packet::ReplyCode;
use crate::protocol::messages::{ConnectionKind, LoginRequest, LoginResult};
use std::fmt;

/// What the initiating side presents once the line is secured.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub account_name: String,
    pub password: String,
    pub new_account: bool,
    pub kind: ConnectionKind,
}

impl Credentials {
    pub fn new(account_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: ConnectionKind) -> Self {
        self.kind = kind;
        self
    }

    /// Ask the listener to create the account.
    pub fn create_account(mut self) -> Self {
        self.new_account = true;
        self
    }

    pub(crate) fn to_request(&self) -> LoginRequest {
        LoginRequest {
            account_name: self.account_name.clone(),
            password: self.password.clone(),
            new_account: self.new_account,
            kind: self.kind,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_name", &self.account_name)
            .field("password", &"<redacted>")
            .field("new_account", &self.new_account)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Decides login requests on the listening side.
///
/// Any `Fn(&Connection, &LoginRequest) -> LoginResult` closure is an
/// authenticator.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, conn: &Connection, request: &LoginRequest) -> LoginResult;
}

/// Accepts every login.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _conn: &Connection, _request: &LoginRequest) -> LoginResult {
        LoginResult {
            result: ReplyCode::Ok,
            message: String::new(),
            roles: Vec::new(),
        }
    }
}

impl<F> Authenticator for F
where
    F: Fn(&Connection, &LoginRequest) -> LoginResult + Send + Sync,
{
    fn authenticate(&self, conn: &Connection, request: &LoginRequest) -> LoginResult {
        self(conn, request)
    }
}
