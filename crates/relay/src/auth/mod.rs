pub mod jwt;

use rand::RngCore;

use crate::store::SALT_BYTES;

/// Fresh random salt for refresh credentials and invite digests.
pub fn random_salt() -> [u8; SALT_BYTES] {
    let mut salt = [0_u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Extracts the credential from an `Authorization: Bearer <token>` value.
pub fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}
