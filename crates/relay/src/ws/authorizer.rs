use std::sync::Arc;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use murmur_common::protocol::ws::ConnectionErrorCode;
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    auth::{
        extract_bearer_token,
        jwt::{AccessCheck, TokenService},
    },
    store::ChatStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoToken,
    InvalidToken,
    Unauthorized,
    Unavailable,
}

impl RejectReason {
    pub const fn code(self) -> ConnectionErrorCode {
        match self {
            Self::NoToken => ConnectionErrorCode::NoToken,
            Self::InvalidToken => ConnectionErrorCode::InvalidToken,
            Self::Unauthorized => ConnectionErrorCode::Unauthorized,
            Self::Unavailable => ConnectionErrorCode::Unavailable,
        }
    }
}

/// The (user, room) pair a connection acts as. Fixed for the connection's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionBinding {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub room_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Authorized(ConnectionBinding),
    Rejected(RejectReason),
}

pub struct ConnectionAuthorizer {
    tokens: Arc<TokenService>,
    store: ChatStore,
}

impl ConnectionAuthorizer {
    pub fn new(tokens: Arc<TokenService>, store: ChatStore) -> Self {
        Self { tokens, store }
    }

    pub async fn authorize(&self, token: Option<&str>) -> Authorization {
        let Some(token) = token.filter(|token| !token.is_empty()) else {
            return Authorization::Rejected(RejectReason::NoToken);
        };

        let access = match self.tokens.parse_and_verify_access(token) {
            AccessCheck::Valid(access) => access,
            AccessCheck::Invalid(reason) => {
                debug!(?reason, "rejecting connection with invalid access token");
                return Authorization::Rejected(RejectReason::InvalidToken);
            }
        };

        match self.store.is_member(access.room_id, access.user_id).await {
            Ok(true) => Authorization::Authorized(ConnectionBinding {
                connection_id: Uuid::new_v4(),
                user_id: access.user_id,
                room_id: access.room_id,
            }),
            Ok(false) => {
                debug!(
                    user_id = %access.user_id,
                    room_id = %access.room_id,
                    "rejecting connection for non-member"
                );
                Authorization::Rejected(RejectReason::Unauthorized)
            }
            Err(error) => {
                error!(
                    error = ?error,
                    user_id = %access.user_id,
                    room_id = %access.room_id,
                    "failed to check room membership during connection authorization"
                );
                Authorization::Rejected(RejectReason::Unavailable)
            }
        }
    }
}

/// Reads the access token from the `token` query parameter, falling back to
/// an `Authorization: Bearer` header.
pub fn handshake_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token.map(str::trim).filter(|token| !token.is_empty()) {
        return Some(token.to_owned());
    }

    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(ToOwned::to_owned)
}
