//! Handshake authentication and per-document authorization.
//!
//! The gateway captures the WebSocket upgrade request as a
//! [`ConnectionRequest`] and asks an [`Authenticator`] who is connecting
//! when the `join` frame arrives, then whether that user may open the
//! requested document.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use url::form_urlencoded;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("user {user_id} may not open document {document_id}")]
    Forbidden {
        user_id: String,
        document_id: String,
    },
}

/// Authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub display_name: String,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// The parts of the upgrade request that authentication may look at.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
}

impl ConnectionRequest {
    /// Parse `/path?key=value&...`.
    pub fn from_uri(path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, query),
            None => (path_and_query, ""),
        };
        let query = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Self {
            path: path.to_string(),
            query,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Bearer token from `Authorization`, else the `token` query parameter.
    pub fn bearer_token(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .or_else(|| self.query_param("token"))
            .filter(|token| !token.is_empty())
    }
}

/// Decides who is connecting and what they may open.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, request: &ConnectionRequest) -> Result<UserIdentity, AuthError>;

    fn authorize(&self, user: &UserIdentity, document_id: &str) -> Result<(), AuthError>;
}

struct TokenGrant {
    identity: UserIdentity,
    documents: Option<HashSet<String>>,
}

/// Static bearer tokens, each mapped to a user and optionally to the only
/// documents that user may open.
#[derive(Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, TokenGrant>,
}

impl TokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token with access to every document.
    pub fn with_token(mut self, token: impl Into<String>, identity: UserIdentity) -> Self {
        self.tokens.insert(
            token.into(),
            TokenGrant {
                identity,
                documents: None,
            },
        );
        self
    }

    /// Register a token restricted to the listed documents.
    pub fn with_restricted_token<I, S>(
        mut self,
        token: impl Into<String>,
        identity: UserIdentity,
        documents: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens.insert(
            token.into(),
            TokenGrant {
                identity,
                documents: Some(documents.into_iter().map(Into::into).collect()),
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, request: &ConnectionRequest) -> Result<UserIdentity, AuthError> {
        let token = request.bearer_token().ok_or(AuthError::MissingCredentials)?;
        self.tokens
            .get(token)
            .map(|grant| grant.identity.clone())
            .ok_or(AuthError::InvalidCredentials)
    }

    fn authorize(&self, user: &UserIdentity, document_id: &str) -> Result<(), AuthError> {
        let allowed = self
            .tokens
            .values()
            .filter(|grant| grant.identity.user_id == user.user_id)
            .any(|grant| {
                grant
                    .documents
                    .as_ref()
                    .is_none_or(|docs| docs.contains(document_id))
            });
        if allowed {
            Ok(())
        } else {
            Err(AuthError::Forbidden {
                user_id: user.user_id.clone(),
                document_id: document_id.to_string(),
            })
        }
    }
}

/// Trusts `?user=<id>&name=<display name>`. Development only.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryAuthenticator;

impl Authenticator for QueryAuthenticator {
    fn authenticate(&self, request: &ConnectionRequest) -> Result<UserIdentity, AuthError> {
        let user_id = request
            .query_param("user")
            .filter(|u| !u.is_empty())
            .ok_or(AuthError::MissingCredentials)?;
        let display_name = request.query_param("name").unwrap_or(user_id);
        Ok(UserIdentity::new(user_id, display_name))
    }

    fn authorize(&self, _user: &UserIdentity, _document_id: &str) -> Result<(), AuthError> {
        Ok(())
    }
}
