use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};
use murmur_common::types::{RoomUser, TokenPair};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::{ApiError, AuthApiState};
use crate::{
    auth::jwt::RefreshError,
    validation::{validate_username, ValidatedJson},
};

#[derive(Debug, Deserialize)]
pub(super) struct CreateRoomRequest {
    username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct JoinRoomRequest {
    username: String,
    invite_hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct InviteChatInfoQuery {
    invite_hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpdateTokenRequest {
    refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub(super) struct InviteChatInfo {
    pub(super) room_id: Uuid,
    pub(super) users: Vec<RoomUser>,
}

pub(super) async fn create_room(
    State(state): State<AuthApiState>,
    ValidatedJson(payload): ValidatedJson<CreateRoomRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    validate_username(&payload.username)?;

    let (founder, room_id) = state.store.create_room_with_founder(&payload.username).await?;
    let tokens = state.tokens.issue_token_pair(founder.id, room_id).await?;

    info!(user_id = %founder.id, room_id = %room_id, "room created");
    Ok(Json(tokens))
}

pub(super) async fn invite_chat_info(
    State(state): State<AuthApiState>,
    query: Result<Query<InviteChatInfoQuery>, QueryRejection>,
) -> Result<Json<InviteChatInfo>, ApiError> {
    let Query(query) =
        query.map_err(|rejection| ApiError::bad_request(format!("invalid query: {rejection}")))?;

    let room_id = resolve_invite(&state, &query.invite_hash).await?;
    let users = state
        .store
        .room_members(room_id)
        .await?
        .ok_or(ApiError::NotFound { message: "room not found" })?;

    Ok(Json(InviteChatInfo { room_id, users }))
}

pub(super) async fn join_room(
    State(state): State<AuthApiState>,
    ValidatedJson(payload): ValidatedJson<JoinRoomRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    validate_username(&payload.username)?;
    let room_id = resolve_invite(&state, &payload.invite_hash).await?;

    let user = state.store.create_user(&payload.username).await?;
    if !state.store.add_member(room_id, user.id).await? {
        return Err(ApiError::NotFound { message: "room not found" });
    }
    let tokens = state.tokens.issue_token_pair(user.id, room_id).await?;

    let notified = state.rooms.notify_user_joined(room_id, user.id, user.name).await;
    info!(user_id = %user.id, room_id = %room_id, notified, "user joined room");

    Ok(Json(tokens))
}

pub(super) async fn update_token(
    State(state): State<AuthApiState>,
    ValidatedJson(payload): ValidatedJson<UpdateTokenRequest>,
) -> Result<Json<TokenPair>, ApiError> {
    match state.tokens.redeem_refresh_token(&payload.refresh_token).await {
        Ok(tokens) => Ok(Json(tokens)),
        Err(RefreshError::Store(error)) => Err(ApiError::Internal(error)),
        Err(rejected) => {
            debug!(reason = %rejected, "refresh token rejected");
            Err(ApiError::Unauthorized { message: "refresh token is invalid or already used" })
        }
    }
}

async fn resolve_invite(state: &AuthApiState, invite_hash: &str) -> Result<Uuid, ApiError> {
    state
        .invites
        .find_by_hash(invite_hash)
        .await?
        .map(|invite| invite.room_id)
        .ok_or(ApiError::NotFound { message: "invite not found" })
}
