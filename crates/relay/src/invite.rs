// Stable per-room invite hashes.
//
// hash = SHA-256(room id as hyphenated text ‖ 32-byte salt ‖ invite secret),
// transported as unpadded base64url.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::{jwt::MIN_SECRET_LEN, random_salt},
    store::{ChatStore, InviteInsert, InviteRecord, INVITE_HASH_BYTES, SALT_BYTES},
};

/// Bound on digest collisions before giving up; a real collision is not
/// expected to ever happen.
const MAX_INSERT_ATTEMPTS: usize = 3;

pub struct InviteRegistry {
    secret: Vec<u8>,
    store: ChatStore,
}

impl InviteRecord {
    pub fn encoded_hash(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.hash)
    }
}

impl InviteRegistry {
    pub fn new(secret: &str, store: ChatStore) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            bail!("invite secret must be at least {MIN_SECRET_LEN} characters long");
        }

        Ok(Self { secret: secret.as_bytes().to_vec(), store })
    }

    /// Returns the room's invite record, creating it on first use.
    pub async fn get_or_create(&self, room_id: Uuid) -> Result<InviteRecord> {
        for _ in 0..MAX_INSERT_ATTEMPTS {
            if let Some(existing) = self.store.find_invite_by_room(room_id).await? {
                return Ok(existing);
            }

            let candidate = InviteRecord { room_id, hash: self.digest(room_id, &random_salt()) };
            if let Some(record) = self.insert_or_adopt(candidate).await? {
                return Ok(record);
            }
        }

        bail!("could not create invite for room {room_id}")
    }

    /// Stores `candidate`, or returns the record that beat it to the room.
    /// `None` means the digest collided with another room's record.
    async fn insert_or_adopt(&self, candidate: InviteRecord) -> Result<Option<InviteRecord>> {
        let room_id = candidate.room_id;
        match self.store.insert_invite(candidate).await.context("failed to store invite")? {
            InviteInsert::Inserted(record) => Ok(Some(record)),
            InviteInsert::Conflict => {
                debug!(room_id = %room_id, "invite insert lost a race; re-reading");
                self.store.find_invite_by_room(room_id).await
            }
        }
    }

    /// Resolves an encoded invite hash. Malformed encodings resolve to nothing.
    pub async fn find_by_hash(&self, encoded: &str) -> Result<Option<InviteRecord>> {
        let Some(hash) = decode_hash(encoded) else {
            return Ok(None);
        };

        self.store.find_invite_by_hash(&hash).await
    }

    fn digest(&self, room_id: Uuid, salt: &[u8; SALT_BYTES]) -> [u8; INVITE_HASH_BYTES] {
        let mut hasher = Sha256::new();
        hasher.update(room_id.hyphenated().to_string().as_bytes());
        hasher.update(salt);
        hasher.update(&self.secret);

        let mut hash = [0_u8; INVITE_HASH_BYTES];
        hash.copy_from_slice(&hasher.finalize());
        hash
    }
}

fn decode_hash(encoded: &str) -> Option<[u8; INVITE_HASH_BYTES]> {
    URL_SAFE_NO_PAD.decode(encoded).ok()?.try_into().ok()
}
