// HTTP routes around the chat core: room creation, invite lookup, joining
// and refresh-token rotation.

mod auth;

use std::sync::Arc;

use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};

use crate::{
    auth::jwt::TokenService,
    error::{ErrorCode, RelayError},
    invite::InviteRegistry,
    store::ChatStore,
    validation::UsernameError,
    ws::controller::RoomSessionController,
};

#[derive(Clone)]
pub struct AuthApiState {
    pub store: ChatStore,
    pub tokens: Arc<TokenService>,
    pub invites: Arc<InviteRegistry>,
    pub rooms: RoomSessionController,
}

pub fn router(state: AuthApiState) -> Router {
    Router::new()
        .route("/auth/createRoom", post(auth::create_room))
        .route("/auth/inviteChatInfo", get(auth::invite_chat_info))
        .route("/auth/joinRoom", post(auth::join_room))
        .route("/auth/updateToken", post(auth::update_token))
        .with_state(state)
}

#[derive(Debug)]
enum ApiError {
    BadRequest { message: String },
    InvalidUsername(UsernameError),
    Unauthorized { message: &'static str },
    NotFound { message: &'static str },
    Internal(anyhow::Error),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest { message: message.into() }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal(error)
    }
}

impl From<UsernameError> for ApiError {
    fn from(error: UsernameError) -> Self {
        Self::InvalidUsername(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest { message } => {
                RelayError::new(ErrorCode::ValidationFailed, message).into_response()
            }
            Self::InvalidUsername(error) => RelayError::from(error).into_response(),
            Self::Unauthorized { message } => {
                RelayError::new(ErrorCode::AuthInvalidToken, message).into_response()
            }
            Self::NotFound { message } => {
                RelayError::new(ErrorCode::NotFound, message).into_response()
            }
            Self::Internal(error) => {
                tracing::error!(error = ?error, "auth api internal error");
                RelayError::from_code(ErrorCode::InternalError).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        Router,
    };
    use murmur_common::{
        protocol::ws::ServerEvent,
        types::{RoomUser, TokenPair},
    };
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::{auth::InviteChatInfo, router, AuthApiState};
    use crate::{
        auth::jwt::TokenService,
        invite::InviteRegistry,
        store::ChatStore,
        ws::{controller::RoomSessionController, hub::RoomHub},
    };

    const ACCESS_SECRET: &str = "murmur_test_access_secret_that_is_long_enough";
    const REFRESH_SECRET: &str = "murmur_test_refresh_secret_that_is_long_enough";
    const INVITE_SECRET: &str = "murmur_test_invite_secret_that_is_long_enough";

    fn test_state() -> AuthApiState {
        let store = ChatStore::memory();
        let tokens = Arc::new(
            TokenService::new(ACCESS_SECRET, REFRESH_SECRET, store.clone())
                .expect("token service should initialize"),
        );
        let invites = Arc::new(
            InviteRegistry::new(INVITE_SECRET, store.clone()).expect("registry should initialize"),
        );
        let rooms = RoomSessionController::new(
            store.clone(),
            Arc::new(RoomHub::default()),
            Arc::clone(&invites),
        );
        AuthApiState { store, tokens, invites, rooms }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request should build")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request should build")
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.expect("request should succeed");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let parsed = serde_json::from_slice(&body).expect("body should be json");
        (status, parsed)
    }

    async fn create_room(app: &Router, username: &str) -> TokenPair {
        let (status, body) =
            send(app, post_json("/auth/createRoom", json!({ "username": username }))).await;
        assert_eq!(status, StatusCode::OK, "createRoom failed: {body}");
        serde_json::from_value(body).expect("token pair should decode")
    }

    #[tokio::test]
    async fn create_room_issues_tokens_for_founding_member() {
        let state = test_state();
        let app = router(state.clone());

        let pair = create_room(&app, "Alice").await;

        let access = state
            .tokens
            .decode_access_claims(&pair.access_token)
            .expect("access claims should decode");
        assert!(state.tokens.verify_access(&pair.access_token));
        assert!(state
            .store
            .is_member(access.room_id, access.user_id)
            .await
            .expect("membership lookup works"));
        assert_eq!(
            state.store.room_members(access.room_id).await.expect("lookup works"),
            Some(vec![RoomUser { id: access.user_id, name: "Alice".into() }])
        );
    }

    #[tokio::test]
    async fn create_room_rejects_invalid_usernames() {
        let app = router(test_state());

        let (status, body) =
            send(&app, post_json("/auth/createRoom", json!({ "username": "Test  user" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
        assert_eq!(body["error"]["message"], "Username must not contain double spaces");

        let (status, body) = send(&app, post_json("/auth/createRoom", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["details"]["kind"], "data_error");
    }

    #[tokio::test]
    async fn invite_info_and_join_add_member_and_notify_room() {
        let state = test_state();
        let app = router(state.clone());
        let founder_pair = create_room(&app, "Alice").await;
        let founder =
            state.tokens.decode_access_claims(&founder_pair.access_token).expect("claims decode");
        let invite_hash = state
            .invites
            .get_or_create(founder.room_id)
            .await
            .expect("invite should exist")
            .encoded_hash();

        let (subscriber, mut events) = mpsc::unbounded_channel();
        state.rooms.hub().subscribe(founder.room_id, Uuid::new_v4(), subscriber).await;

        let (status, body) =
            send(&app, get(&format!("/auth/inviteChatInfo?inviteHash={invite_hash}"))).await;
        assert_eq!(status, StatusCode::OK);
        let info: InviteChatInfo = serde_json::from_value(body).expect("info should decode");
        assert_eq!(info.room_id, founder.room_id);
        assert_eq!(info.users.len(), 1);

        let (status, body) = send(
            &app,
            post_json("/auth/joinRoom", json!({ "username": "Bob", "inviteHash": invite_hash })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let joined_pair: TokenPair = serde_json::from_value(body).expect("pair should decode");
        let joined =
            state.tokens.decode_access_claims(&joined_pair.access_token).expect("claims decode");
        assert_eq!(joined.room_id, founder.room_id);

        let members = state
            .store
            .room_members(founder.room_id)
            .await
            .expect("lookup works")
            .expect("room exists");
        assert_eq!(members.iter().map(|user| user.name.as_str()).collect::<Vec<_>>(), ["Alice", "Bob"]);
        assert_eq!(
            events.try_recv().ok(),
            Some(ServerEvent::UserJoined(RoomUser { id: joined.user_id, name: "Bob".into() }))
        );
    }

    #[tokio::test]
    async fn unknown_or_malformed_invites_are_not_found() {
        let state = test_state();
        let app = router(state.clone());
        let pair = create_room(&app, "Alice").await;
        let room_id =
            state.tokens.decode_access_claims(&pair.access_token).expect("claims decode").room_id;
        let real = state.invites.get_or_create(room_id).await.expect("invite").encoded_hash();
        let mut altered = real.into_bytes();
        altered[0] = if altered[0] == b'A' { b'B' } else { b'A' };
        let altered = String::from_utf8(altered).expect("ascii stays utf-8");

        for hash in [altered.as_str(), "not-base64!!", "c2hvcnQ"] {
            let (status, body) =
                send(&app, get(&format!("/auth/inviteChatInfo?inviteHash={hash}"))).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "hash {hash:?}");
            assert_eq!(body["error"]["code"], "NOT_FOUND");
        }

        let (status, _) = send(
            &app,
            post_json("/auth/joinRoom", json!({ "username": "Mallory", "inviteHash": altered })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            state.store.room_members(room_id).await.expect("lookup works").map(|users| users.len()),
            Some(1)
        );
    }

    #[tokio::test]
    async fn invite_info_requires_hash_parameter() {
        let app = router(test_state());

        let (status, body) = send(&app, get("/auth/inviteChatInfo")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn update_token_rotates_refresh_token_exactly_once() {
        let state = test_state();
        let app = router(state.clone());
        let original = create_room(&app, "Alice").await;

        let (status, body) = send(
            &app,
            post_json("/auth/updateToken", json!({ "refreshToken": original.refresh_token })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let rotated: TokenPair = serde_json::from_value(body).expect("pair should decode");
        assert_ne!(rotated.refresh_token, original.refresh_token);
        assert!(state.tokens.verify_access(&rotated.access_token));

        let (status, body) = send(
            &app,
            post_json("/auth/updateToken", json!({ "refreshToken": original.refresh_token })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "AUTH_INVALID_TOKEN");

        let (status, _) =
            send(&app, post_json("/auth/updateToken", json!({ "refreshToken": "garbage" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
