use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use murmur_common::types::{ChatMessage, RoomUser};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    AppendOutcome, InviteInsert, InviteRecord, RefreshCredential, RoomSnapshot,
    CREDENTIAL_TTL_SECONDS, INVITE_HASH_BYTES, SALT_BYTES,
};

const UNIQUE_VIOLATION: &str = "23505";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    name: String,
}

impl From<UserRow> for RoomUser {
    fn from(value: UserRow) -> Self {
        Self { id: value.id, name: value.name }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    text: String,
    sender_id: Uuid,
}

impl From<MessageRow> for ChatMessage {
    fn from(value: MessageRow) -> Self {
        Self { text: value.text, sender: value.sender_id }
    }
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: Uuid,
    user_id: Uuid,
    room_id: Uuid,
    salt: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl TryFrom<CredentialRow> for RefreshCredential {
    type Error = anyhow::Error;

    fn try_from(value: CredentialRow) -> Result<Self> {
        let salt: [u8; SALT_BYTES] = value
            .salt
            .try_into()
            .map_err(|salt: Vec<u8>| anyhow!("refresh credential salt has {} bytes", salt.len()))?;

        Ok(Self {
            id: value.id,
            user_id: value.user_id,
            room_id: value.room_id,
            salt,
            created_at: value.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InviteRow {
    room_id: Uuid,
    hash: Vec<u8>,
}

impl TryFrom<InviteRow> for InviteRecord {
    type Error = anyhow::Error;

    fn try_from(value: InviteRow) -> Result<Self> {
        let hash: [u8; INVITE_HASH_BYTES] = value
            .hash
            .try_into()
            .map_err(|hash: Vec<u8>| anyhow!("invite hash has {} bytes", hash.len()))?;

        Ok(Self { room_id: value.room_id, hash })
    }
}

pub(super) async fn create_user(pool: &PgPool, name: &str) -> Result<RoomUser> {
    sqlx::query_as::<_, UserRow>("INSERT INTO users (id, name) VALUES ($1, $2) RETURNING id, name")
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(pool)
        .await
        .map(RoomUser::from)
        .context("failed to insert user")
}

pub(super) async fn create_room(pool: &PgPool, founder_id: Uuid) -> Result<Uuid> {
    let room_id = Uuid::new_v4();
    let mut tx = pool.begin().await.context("failed to begin room transaction")?;

    sqlx::query("INSERT INTO rooms (id, member_count) VALUES ($1, 1)")
        .bind(room_id)
        .execute(&mut *tx)
        .await
        .context("failed to insert room")?;

    sqlx::query("INSERT INTO room_members (room_id, user_id, position) VALUES ($1, $2, 0)")
        .bind(room_id)
        .bind(founder_id)
        .execute(&mut *tx)
        .await
        .context("failed to insert founding room member")?;

    tx.commit().await.context("failed to commit room transaction")?;

    Ok(room_id)
}

pub(super) async fn create_room_with_founder(
    pool: &PgPool,
    founder_name: &str,
) -> Result<(RoomUser, Uuid)> {
    let room_id = Uuid::new_v4();
    let mut tx = pool.begin().await.context("failed to begin room transaction")?;

    let founder = sqlx::query_as::<_, UserRow>(
        "INSERT INTO users (id, name) VALUES ($1, $2) RETURNING id, name",
    )
    .bind(Uuid::new_v4())
    .bind(founder_name)
    .fetch_one(&mut *tx)
    .await
    .map(RoomUser::from)
    .context("failed to insert room founder")?;

    sqlx::query("INSERT INTO rooms (id, member_count) VALUES ($1, 1)")
        .bind(room_id)
        .execute(&mut *tx)
        .await
        .context("failed to insert room")?;

    sqlx::query("INSERT INTO room_members (room_id, user_id, position) VALUES ($1, $2, 0)")
        .bind(room_id)
        .bind(founder.id)
        .execute(&mut *tx)
        .await
        .context("failed to insert founding room member")?;

    tx.commit().await.context("failed to commit room transaction")?;

    Ok((founder, room_id))
}

pub(super) async fn add_member(pool: &PgPool, room_id: Uuid, user_id: Uuid) -> Result<bool> {
    let mut tx = pool.begin().await.context("failed to begin membership transaction")?;

    // Locks the room row so member positions stay dense under concurrent joins.
    let position = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE rooms
        SET member_count = member_count + 1
        WHERE id = $1
        RETURNING member_count - 1
        "#,
    )
    .bind(room_id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to reserve member position")?;

    let Some(position) = position else {
        return Ok(false);
    };

    sqlx::query(
        r#"
        INSERT INTO room_members (room_id, user_id, position)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(room_id)
    .bind(user_id)
    .bind(position)
    .execute(&mut *tx)
    .await
    .context("failed to insert room member")?;

    tx.commit().await.context("failed to commit membership transaction")?;

    Ok(true)
}

pub(super) async fn user_exists(pool: &PgPool, user_id: Uuid) -> Result<bool> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .context("failed to check user existence")
}

pub(super) async fn room_exists(pool: &PgPool, room_id: Uuid) -> Result<bool> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM rooms WHERE id = $1)")
        .bind(room_id)
        .fetch_one(pool)
        .await
        .context("failed to check room existence")
}

pub(super) async fn is_member(pool: &PgPool, room_id: Uuid, user_id: Uuid) -> Result<bool> {
    sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM room_members m
            JOIN rooms r ON r.id = m.room_id
            WHERE m.room_id = $1 AND m.user_id = $2
        )
        "#,
    )
    .bind(room_id)
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("failed to check room membership")
}

pub(super) async fn room_members(pool: &PgPool, room_id: Uuid) -> Result<Option<Vec<RoomUser>>> {
    if !room_exists(pool, room_id).await? {
        return Ok(None);
    }

    let rows = sqlx::query_as::<_, UserRow>(
        r#"
        SELECT u.id, u.name
        FROM room_members m
        JOIN users u ON u.id = m.user_id
        WHERE m.room_id = $1
        ORDER BY m.position ASC
        "#,
    )
    .bind(room_id)
    .fetch_all(pool)
    .await
    .context("failed to load room members")?;

    Ok(Some(rows.into_iter().map(RoomUser::from).collect()))
}

pub(super) async fn room_snapshot(pool: &PgPool, room_id: Uuid) -> Result<Option<RoomSnapshot>> {
    let Some(users) = room_members(pool, room_id).await? else {
        return Ok(None);
    };

    let messages = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT text, sender_id
        FROM messages
        WHERE room_id = $1
        ORDER BY seq ASC
        "#,
    )
    .bind(room_id)
    .fetch_all(pool)
    .await
    .context("failed to load room messages")?;

    Ok(Some(RoomSnapshot { users, messages: messages.into_iter().map(ChatMessage::from).collect() }))
}

pub(super) async fn append_message(
    pool: &PgPool,
    room_id: Uuid,
    sender_id: Uuid,
    text: &str,
) -> Result<AppendOutcome> {
    let mut tx = pool.begin().await.context("failed to begin message transaction")?;

    let seq = sqlx::query_scalar::<_, i64>(
        r#"
        UPDATE rooms
        SET message_count = message_count + 1
        WHERE id = $1
        RETURNING message_count
        "#,
    )
    .bind(room_id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to reserve message sequence")?;

    let Some(seq) = seq else {
        return Ok(AppendOutcome::RoomNotFound);
    };

    sqlx::query(
        r#"
        INSERT INTO messages (id, room_id, sender_id, seq, text)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(room_id)
    .bind(sender_id)
    .bind(seq)
    .bind(text)
    .execute(&mut *tx)
    .await
    .context("failed to insert message")?;

    tx.commit().await.context("failed to commit message transaction")?;

    Ok(AppendOutcome::Appended)
}

pub(super) async fn insert_credential(
    pool: &PgPool,
    user_id: Uuid,
    room_id: Uuid,
    salt: [u8; SALT_BYTES],
) -> Result<RefreshCredential> {
    let row = sqlx::query_as::<_, CredentialRow>(
        r#"
        INSERT INTO refresh_credentials (id, user_id, room_id, salt)
        VALUES ($1, $2, $3, $4)
        RETURNING id, user_id, room_id, salt, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(room_id)
    .bind(salt.as_slice())
    .fetch_one(pool)
    .await
    .context("failed to insert refresh credential")?;

    row.try_into()
}

pub(super) async fn find_credential(pool: &PgPool, id: Uuid) -> Result<Option<RefreshCredential>> {
    let row = sqlx::query_as::<_, CredentialRow>(
        r#"
        SELECT id, user_id, room_id, salt, created_at
        FROM refresh_credentials
        WHERE id = $1
          AND created_at > now() - make_interval(secs => $2)
        "#,
    )
    .bind(id)
    .bind(CREDENTIAL_TTL_SECONDS as f64)
    .fetch_optional(pool)
    .await
    .context("failed to load refresh credential")?;

    row.map(RefreshCredential::try_from).transpose()
}

pub(super) async fn delete_credential(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query("DELETE FROM refresh_credentials WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete refresh credential")?;

    Ok(result.rows_affected() == 1)
}

pub(super) async fn purge_expired_credentials(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM refresh_credentials WHERE created_at <= now() - make_interval(secs => $1)",
    )
    .bind(CREDENTIAL_TTL_SECONDS as f64)
    .execute(pool)
    .await
    .context("failed to purge expired refresh credentials")?;

    Ok(result.rows_affected())
}

pub(super) async fn find_invite_by_room(pool: &PgPool, room_id: Uuid) -> Result<Option<InviteRecord>> {
    sqlx::query_as::<_, InviteRow>("SELECT room_id, hash FROM invite_links WHERE room_id = $1")
        .bind(room_id)
        .fetch_optional(pool)
        .await
        .context("failed to load invite by room")?
        .map(InviteRecord::try_from)
        .transpose()
}

pub(super) async fn find_invite_by_hash(
    pool: &PgPool,
    hash: &[u8; INVITE_HASH_BYTES],
) -> Result<Option<InviteRecord>> {
    sqlx::query_as::<_, InviteRow>("SELECT room_id, hash FROM invite_links WHERE hash = $1")
        .bind(hash.as_slice())
        .fetch_optional(pool)
        .await
        .context("failed to load invite by hash")?
        .map(InviteRecord::try_from)
        .transpose()
}

pub(super) async fn insert_invite(pool: &PgPool, record: InviteRecord) -> Result<InviteInsert> {
    let result = sqlx::query("INSERT INTO invite_links (room_id, hash) VALUES ($1, $2)")
        .bind(record.room_id)
        .bind(record.hash.as_slice())
        .execute(pool)
        .await;

    match result {
        Ok(_) => Ok(InviteInsert::Inserted(record)),
        Err(sqlx::Error::Database(error)) if error.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            Ok(InviteInsert::Conflict)
        }
        Err(error) => Err(error).context("failed to insert invite link"),
    }
}
