//! Admission checks run before a WebSocket upgrade is accepted.
//!
//! The relay itself does not authenticate anyone. An upstream proxy is
//! expected to have done that and to forward the caller identity in headers.
//! Deployments with their own document registry or auth service plug in a
//! different [`ConnectGate`].

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::error::{CollabError, Result};
use crate::channel::Channel;
use crate::hub::ClientIdentity;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";
pub const READ_ONLY_HEADER: &str = "x-read-only";

/// Everything a gate may inspect about an upgrade request.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub doc_id: String,
    pub headers: HeaderMap,
    pub channel: Channel,
    /// Set by routes that never accept edits.
    pub public: bool,
}

impl ConnectRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[async_trait]
pub trait ConnectGate: Send + Sync {
    /// Admit the request and return who is connecting, or refuse it.
    async fn admit(&self, request: &ConnectRequest) -> Result<ClientIdentity>;
}

/// Trusts identity headers set by the reverse proxy.
#[derive(Debug, Clone, Default)]
pub struct ProxyHeaderGate {
    require_user: bool,
}

impl ProxyHeaderGate {
    pub fn new(require_user: bool) -> Self {
        Self { require_user }
    }
}

#[async_trait]
impl ConnectGate for ProxyHeaderGate {
    async fn admit(&self, request: &ConnectRequest) -> Result<ClientIdentity> {
        if request.doc_id.trim().is_empty() {
            return Err(CollabError::InvalidDocumentId);
        }

        let user_id = match request.header(USER_ID_HEADER) {
            Some(id) => id.to_string(),
            None if self.require_user => return Err(CollabError::Unauthorized),
            None => "anonymous".to_string(),
        };
        let user_name = request
            .header(USER_NAME_HEADER)
            .unwrap_or("Anonymous")
            .to_string();
        let read_only = request.public
            || request
                .header(READ_ONLY_HEADER)
                .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1");

        Ok(ClientIdentity::new(user_id, user_name).read_only(read_only))
    }
}
