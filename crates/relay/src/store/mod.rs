// Persistent record store for users, rooms, messages, refresh credentials
// and invite links.
//
// Two backends with the same contract: PostgreSQL for deployments and an
// in-memory map for tests and database-less development.

mod memory;
mod postgres;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::{DateTime, Utc};
use murmur_common::types::{ChatMessage, RoomUser};
use sqlx::PgPool;
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, warn};
use uuid::Uuid;

pub use memory::MemoryChatStore;

/// Refresh credentials older than this are treated as absent and purged.
pub const CREDENTIAL_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;

pub const SALT_BYTES: usize = 32;
pub const INVITE_HASH_BYTES: usize = 32;

#[derive(Clone)]
pub enum ChatStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryChatStore>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub users: Vec<RoomUser>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    RoomNotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshCredential {
    pub id: Uuid,
    pub user_id: Uuid,
    pub room_id: Uuid,
    pub salt: [u8; SALT_BYTES],
    pub created_at: DateTime<Utc>,
}

impl RefreshCredential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at >= chrono::Duration::seconds(CREDENTIAL_TTL_SECONDS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteRecord {
    pub room_id: Uuid,
    pub hash: [u8; INVITE_HASH_BYTES],
}

/// Result of inserting an invite record.
///
/// `Conflict` means another record already owns the room or the digest; the
/// caller decides whether to re-read or retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteInsert {
    Inserted(InviteRecord),
    Conflict,
}

impl ChatStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryChatStore::default())))
    }

    pub async fn create_user(&self, name: &str) -> Result<RoomUser> {
        match self {
            Self::Postgres(pool) => postgres::create_user(pool, name).await,
            Self::Memory(store) => Ok(store.write().await.create_user(name)),
        }
    }

    /// Creates a room whose only member is `founder_id`.
    pub async fn create_room(&self, founder_id: Uuid) -> Result<Uuid> {
        match self {
            Self::Postgres(pool) => postgres::create_room(pool, founder_id).await,
            Self::Memory(store) => store.write().await.create_room(founder_id),
        }
    }

    /// Creates the founding user and their room together, so a failed room
    /// insert leaves no orphaned user behind.
    pub async fn create_room_with_founder(&self, founder_name: &str) -> Result<(RoomUser, Uuid)> {
        match self {
            Self::Postgres(pool) => postgres::create_room_with_founder(pool, founder_name).await,
            Self::Memory(store) => Ok(store.write().await.create_room_with_founder(founder_name)),
        }
    }

    /// Appends `user_id` to the room's member list. Returns `false` when the
    /// room does not exist.
    pub async fn add_member(&self, room_id: Uuid, user_id: Uuid) -> Result<bool> {
        match self {
            Self::Postgres(pool) => postgres::add_member(pool, room_id, user_id).await,
            Self::Memory(store) => store.write().await.add_member(room_id, user_id),
        }
    }

    pub async fn user_exists(&self, user_id: Uuid) -> Result<bool> {
        match self {
            Self::Postgres(pool) => postgres::user_exists(pool, user_id).await,
            Self::Memory(store) => Ok(store.read().await.user_exists(user_id)),
        }
    }

    pub async fn room_exists(&self, room_id: Uuid) -> Result<bool> {
        match self {
            Self::Postgres(pool) => postgres::room_exists(pool, room_id).await,
            Self::Memory(store) => Ok(store.read().await.room_exists(room_id)),
        }
    }

    /// False when the room is gone or the user is not one of its members.
    pub async fn is_member(&self, room_id: Uuid, user_id: Uuid) -> Result<bool> {
        match self {
            Self::Postgres(pool) => postgres::is_member(pool, room_id, user_id).await,
            Self::Memory(store) => Ok(store.read().await.is_member(room_id, user_id)),
        }
    }

    /// Members in join order and messages in insertion order.
    pub async fn room_snapshot(&self, room_id: Uuid) -> Result<Option<RoomSnapshot>> {
        match self {
            Self::Postgres(pool) => postgres::room_snapshot(pool, room_id).await,
            Self::Memory(store) => Ok(store.read().await.room_snapshot(room_id)),
        }
    }

    pub async fn room_members(&self, room_id: Uuid) -> Result<Option<Vec<RoomUser>>> {
        match self {
            Self::Postgres(pool) => postgres::room_members(pool, room_id).await,
            Self::Memory(store) => Ok(store.read().await.room_members(room_id)),
        }
    }

    /// Persists a message and appends it to the room in one step.
    pub async fn append_message(
        &self,
        room_id: Uuid,
        sender_id: Uuid,
        text: &str,
    ) -> Result<AppendOutcome> {
        match self {
            Self::Postgres(pool) => postgres::append_message(pool, room_id, sender_id, text).await,
            Self::Memory(store) => Ok(store.write().await.append_message(room_id, sender_id, text)),
        }
    }

    pub async fn insert_credential(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        salt: [u8; SALT_BYTES],
    ) -> Result<RefreshCredential> {
        match self {
            Self::Postgres(pool) => postgres::insert_credential(pool, user_id, room_id, salt).await,
            Self::Memory(store) => {
                Ok(store.write().await.insert_credential(user_id, room_id, salt, Utc::now()))
            }
        }
    }

    /// Expired credentials are reported as absent even before the purge
    /// task removes them.
    pub async fn find_credential(&self, id: Uuid) -> Result<Option<RefreshCredential>> {
        match self {
            Self::Postgres(pool) => postgres::find_credential(pool, id).await,
            Self::Memory(store) => Ok(store.read().await.find_credential(id, Utc::now())),
        }
    }

    /// Returns `true` only for the caller that actually removed the record.
    pub async fn delete_credential(&self, id: Uuid) -> Result<bool> {
        match self {
            Self::Postgres(pool) => postgres::delete_credential(pool, id).await,
            Self::Memory(store) => Ok(store.write().await.delete_credential(id)),
        }
    }

    pub async fn purge_expired_credentials(&self) -> Result<u64> {
        match self {
            Self::Postgres(pool) => postgres::purge_expired_credentials(pool).await,
            Self::Memory(store) => Ok(store.write().await.purge_expired_credentials(Utc::now())),
        }
    }

    pub async fn find_invite_by_room(&self, room_id: Uuid) -> Result<Option<InviteRecord>> {
        match self {
            Self::Postgres(pool) => postgres::find_invite_by_room(pool, room_id).await,
            Self::Memory(store) => Ok(store.read().await.find_invite_by_room(room_id)),
        }
    }

    pub async fn find_invite_by_hash(
        &self,
        hash: &[u8; INVITE_HASH_BYTES],
    ) -> Result<Option<InviteRecord>> {
        match self {
            Self::Postgres(pool) => postgres::find_invite_by_hash(pool, hash).await,
            Self::Memory(store) => Ok(store.read().await.find_invite_by_hash(hash)),
        }
    }

    pub async fn insert_invite(&self, record: InviteRecord) -> Result<InviteInsert> {
        match self {
            Self::Postgres(pool) => postgres::insert_invite(pool, record).await,
            Self::Memory(store) => store.write().await.insert_invite(record),
        }
    }
}

/// Periodically removes refresh credentials past their TTL.
pub fn spawn_credential_purge(store: ChatStore, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match store.purge_expired_credentials().await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "purged expired refresh credentials"),
                Err(error) => warn!(error = ?error, "refresh credential purge failed"),
            }
        }
    })
}
