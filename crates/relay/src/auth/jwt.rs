// Access and refresh token issuance.
//
// Access tokens are HS256 JWTs signed with the process access secret.
// Refresh tokens are HS256 JWTs signed with the refresh secret followed by
// the salt of the credential they name, so deleting the credential revokes
// the token.

use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use murmur_common::types::TokenPair;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::random_salt,
    store::{ChatStore, CREDENTIAL_TTL_SECONDS},
};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 10 * 60;
pub const REFRESH_TOKEN_TTL_SECONDS: i64 = CREDENTIAL_TTL_SECONDS;
pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    user: Uuid,
    room: Uuid,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefreshTokenClaims {
    user: Uuid,
    room: Uuid,
    id: Uuid,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomAccess {
    pub user_id: Uuid,
    pub room_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidAccess {
    Malformed,
    BadSignature,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheck {
    Valid(RoomAccess),
    Invalid(InvalidAccess),
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh token could not be decoded")]
    MalformedToken,
    #[error("refresh credential is unknown or expired")]
    UnknownCredential,
    #[error("refresh token signature or expiry is invalid")]
    InvalidSignature,
    #[error("refresh token claims do not match the stored credential")]
    ClaimMismatch,
    #[error("refresh token references a user or room that no longer exists")]
    StaleReference,
    #[error(transparent)]
    Store(anyhow::Error),
}

pub struct TokenService {
    access_encoding_key: EncodingKey,
    access_decoding_key: DecodingKey,
    access_validation: Validation,
    refresh_secret: Vec<u8>,
    refresh_validation: Validation,
    store: ChatStore,
}

impl TokenService {
    pub fn new(access_secret: &str, refresh_secret: &str, store: ChatStore) -> anyhow::Result<Self> {
        if access_secret.len() < MIN_SECRET_LEN {
            bail!("access token secret must be at least {MIN_SECRET_LEN} characters long");
        }
        if refresh_secret.len() < MIN_SECRET_LEN {
            bail!("refresh token secret must be at least {MIN_SECRET_LEN} characters long");
        }

        Ok(Self {
            access_encoding_key: EncodingKey::from_secret(access_secret.as_bytes()),
            access_decoding_key: DecodingKey::from_secret(access_secret.as_bytes()),
            access_validation: strict_validation(),
            refresh_secret: refresh_secret.as_bytes().to_vec(),
            refresh_validation: strict_validation(),
            store,
        })
    }

    /// Mints a fresh access token and a refresh token backed by a new
    /// credential record.
    pub async fn issue_token_pair(&self, user_id: Uuid, room_id: Uuid) -> anyhow::Result<TokenPair> {
        self.issue_token_pair_at(user_id, room_id, current_unix_timestamp()?).await
    }

    async fn issue_token_pair_at(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        issued_at: i64,
    ) -> anyhow::Result<TokenPair> {
        let salt = random_salt();
        let credential = self
            .store
            .insert_credential(user_id, room_id, salt)
            .await
            .context("failed to store refresh credential")?;

        let access_claims = AccessTokenClaims {
            user: user_id,
            room: room_id,
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };
        let access_token =
            encode(&Header::new(Algorithm::HS256), &access_claims, &self.access_encoding_key)
                .context("failed to encode access token")?;

        let refresh_claims = RefreshTokenClaims {
            user: user_id,
            room: room_id,
            id: credential.id,
            iat: issued_at,
            exp: issued_at + REFRESH_TOKEN_TTL_SECONDS,
        };
        let refresh_token = encode(
            &Header::new(Algorithm::HS256),
            &refresh_claims,
            &EncodingKey::from_secret(&self.refresh_signing_secret(&credential.salt)),
        )
        .context("failed to encode refresh token")?;

        Ok(TokenPair { access_token, refresh_token })
    }

    pub fn verify_access(&self, token: &str) -> bool {
        matches!(self.parse_and_verify_access(token), AccessCheck::Valid(_))
    }

    /// Reads access claims without checking the signature or expiry.
    pub fn decode_access_claims(&self, token: &str) -> Option<RoomAccess> {
        decode_unverified::<AccessTokenClaims>(token)
            .map(|claims| RoomAccess { user_id: claims.user, room_id: claims.room })
    }

    pub fn parse_and_verify_access(&self, token: &str) -> AccessCheck {
        match decode::<AccessTokenClaims>(token, &self.access_decoding_key, &self.access_validation)
        {
            Ok(data) => AccessCheck::Valid(RoomAccess {
                user_id: data.claims.user,
                room_id: data.claims.room,
            }),
            Err(error) => AccessCheck::Invalid(match error.kind() {
                ErrorKind::ExpiredSignature => InvalidAccess::Expired,
                ErrorKind::InvalidSignature => InvalidAccess::BadSignature,
                _ => InvalidAccess::Malformed,
            }),
        }
    }

    /// Exchanges a refresh token for a new pair. The presented credential is
    /// consumed before the replacement is minted, so a token works at most
    /// once even when a later step fails.
    pub async fn redeem_refresh_token(&self, token: &str) -> Result<TokenPair, RefreshError> {
        let claims = decode_unverified::<RefreshTokenClaims>(token)
            .ok_or(RefreshError::MalformedToken)?;

        let credential = self
            .store
            .find_credential(claims.id)
            .await
            .map_err(RefreshError::Store)?
            .ok_or(RefreshError::UnknownCredential)?;

        let decoding_key = DecodingKey::from_secret(&self.refresh_signing_secret(&credential.salt));
        decode::<RefreshTokenClaims>(token, &decoding_key, &self.refresh_validation)
            .map_err(|_| RefreshError::InvalidSignature)?;

        if claims.user != credential.user_id || claims.room != credential.room_id {
            return Err(RefreshError::ClaimMismatch);
        }

        if !self.store.delete_credential(credential.id).await.map_err(RefreshError::Store)? {
            debug!(credential_id = %credential.id, "refresh credential consumed concurrently");
            return Err(RefreshError::UnknownCredential);
        }

        let user_exists =
            self.store.user_exists(credential.user_id).await.map_err(RefreshError::Store)?;
        let room_exists =
            self.store.room_exists(credential.room_id).await.map_err(RefreshError::Store)?;
        if !user_exists || !room_exists {
            return Err(RefreshError::StaleReference);
        }

        self.issue_token_pair(credential.user_id, credential.room_id)
            .await
            .map_err(RefreshError::Store)
    }

    fn refresh_signing_secret(&self, salt: &[u8]) -> Vec<u8> {
        let mut secret = Vec::with_capacity(self.refresh_secret.len() + salt.len());
        secret.extend_from_slice(&self.refresh_secret);
        secret.extend_from_slice(salt);
        secret
    }
}

fn strict_validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    validation.set_required_spec_claims(&["exp"]);
    validation
}

fn decode_unverified<T: DeserializeOwned>(token: &str) -> Option<T> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    decode::<T>(token, &DecodingKey::from_secret(&[]), &validation).ok().map(|data| data.claims)
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
