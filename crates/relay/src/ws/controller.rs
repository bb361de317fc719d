use std::sync::Arc;

use murmur_common::{
    protocol::ws::{PayloadError, SendMessageErrorCode, SendMessagePayload, ServerEvent},
    types::{ChatMessage, RoomUser},
};
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::{
    authorizer::{ConnectionBinding, RejectReason},
    hub::{OutboundSender, RoomHub},
};
use crate::{
    invite::InviteRegistry,
    store::{AppendOutcome, ChatStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Bound,
    Closed,
}

/// One connection's view of its room. Only moves forward through
/// `Connecting -> Bound -> Closed`.
#[derive(Debug)]
pub struct RoomSession {
    binding: ConnectionBinding,
    state: SessionState,
}

impl RoomSession {
    pub fn new(binding: ConnectionBinding) -> Self {
        Self { binding, state: SessionState::Connecting }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn binding(&self) -> &ConnectionBinding {
        &self.binding
    }
}

/// Shared room logic behind every connection: history replay, message
/// persistence and fan-out.
#[derive(Clone)]
pub struct RoomSessionController {
    store: ChatStore,
    hub: Arc<RoomHub>,
    invites: Arc<InviteRegistry>,
}

impl RoomSessionController {
    pub fn new(store: ChatStore, hub: Arc<RoomHub>, invites: Arc<InviteRegistry>) -> Self {
        Self { store, hub, invites }
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    /// Subscribes the connection and builds its `connection_success` event.
    ///
    /// The subscription happens before history is read, so a message
    /// persisted in between may show up twice but is never missed: once in
    /// `connection_success.messages` and again as a `receive_message`.
    /// Clients should tolerate that duplicate.
    pub async fn open(
        &self,
        session: &mut RoomSession,
        outbound: OutboundSender,
    ) -> Result<ServerEvent, RejectReason> {
        if session.state != SessionState::Connecting {
            return Err(RejectReason::Unauthorized);
        }

        let ConnectionBinding { connection_id, user_id, room_id } = session.binding;
        self.hub.subscribe(room_id, connection_id, outbound).await;

        let event = match self.initial_state(room_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                self.hub.unsubscribe(room_id, connection_id).await;
                session.state = SessionState::Closed;
                return Err(RejectReason::Unauthorized);
            }
            Err(error) => {
                error!(
                    error = ?error,
                    user_id = %user_id,
                    room_id = %room_id,
                    connection_id = %connection_id,
                    "failed to load initial room state"
                );
                self.hub.unsubscribe(room_id, connection_id).await;
                session.state = SessionState::Closed;
                return Err(RejectReason::Unavailable);
            }
        };

        session.state = SessionState::Bound;
        debug!(user_id = %user_id, room_id = %room_id, connection_id = %connection_id, "connection bound");
        Ok(event)
    }

    async fn initial_state(&self, room_id: Uuid) -> anyhow::Result<Option<ServerEvent>> {
        let Some(snapshot) = self.store.room_snapshot(room_id).await? else {
            return Ok(None);
        };
        let invite = self.invites.get_or_create(room_id).await?;

        Ok(Some(ServerEvent::ConnectionSuccess {
            messages: snapshot.messages,
            users: snapshot.users,
            invite_hash: invite.encoded_hash(),
        }))
    }

    /// Validates, persists and fans out one inbound message. The error code
    /// goes back to the sender only.
    ///
    /// Persistence and fan-out run on their own task so a disconnect while
    /// awaiting cannot leave a stored message unbroadcast.
    pub async fn send_message(
        &self,
        session: &RoomSession,
        payload: &Value,
    ) -> Result<(), SendMessageErrorCode> {
        let ConnectionBinding { connection_id, user_id, room_id } = session.binding;

        if session.state != SessionState::Bound {
            warn!(connection_id = %connection_id, state = ?session.state, "send_message on unbound connection");
            return Err(SendMessageErrorCode::InternalError);
        }

        let SendMessagePayload { text } = SendMessagePayload::from_value(payload).map_err(
            |error: PayloadError| {
                debug!(connection_id = %connection_id, %error, "rejecting send_message payload");
                SendMessageErrorCode::InvalidMessage
            },
        )?;

        let store = self.store.clone();
        let hub = Arc::clone(&self.hub);
        let task = tokio::spawn(async move {
            match store.append_message(room_id, user_id, &text).await {
                Ok(AppendOutcome::Appended) => {
                    let event = ServerEvent::ReceiveMessage(ChatMessage { text, sender: user_id });
                    hub.broadcast(room_id, event, Some(connection_id)).await;
                    Ok(())
                }
                Ok(AppendOutcome::RoomNotFound) => Err(SendMessageErrorCode::ChatNotFound),
                Err(error) => {
                    error!(
                        error = ?error,
                        user_id = %user_id,
                        room_id = %room_id,
                        connection_id = %connection_id,
                        "failed to persist chat message"
                    );
                    Err(SendMessageErrorCode::InternalError)
                }
            }
        });

        task.await.unwrap_or_else(|join_error| {
            error!(?join_error, connection_id = %connection_id, "send_message task failed");
            Err(SendMessageErrorCode::InternalError)
        })
    }

    /// Tells everyone connected to `room_id` about a new member.
    pub async fn notify_user_joined(&self, room_id: Uuid, user_id: Uuid, name: String) -> usize {
        self.hub.broadcast(room_id, ServerEvent::UserJoined(RoomUser { id: user_id, name }), None).await
    }

    pub async fn close(&self, session: &mut RoomSession) {
        if session.state == SessionState::Bound {
            self.hub.unsubscribe(session.binding.room_id, session.binding.connection_id).await;
        }
        session.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use murmur_common::{
        protocol::ws::{SendMessageErrorCode, ServerEvent},
        types::{ChatMessage, RoomUser},
    };
    use serde_json::json;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{RoomSession, RoomSessionController, SessionState};
    use crate::{
        invite::InviteRegistry,
        store::ChatStore,
        ws::{
            authorizer::{ConnectionBinding, RejectReason},
            hub::RoomHub,
        },
    };

    const INVITE_SECRET: &str = "murmur_test_invite_secret_that_is_long_enough";

    struct Fixture {
        store: ChatStore,
        controller: RoomSessionController,
        room_id: Uuid,
        alice: RoomUser,
        bob: RoomUser,
    }

    async fn fixture() -> Fixture {
        let store = ChatStore::memory();
        let invites = Arc::new(
            InviteRegistry::new(INVITE_SECRET, store.clone()).expect("registry should initialize"),
        );
        let controller =
            RoomSessionController::new(store.clone(), Arc::new(RoomHub::default()), invites);

        let alice = store.create_user("Alice").await.expect("user should be created");
        let bob = store.create_user("Bob").await.expect("user should be created");
        let room_id = store.create_room(alice.id).await.expect("room should be created");
        store.add_member(room_id, bob.id).await.expect("member should be added");

        Fixture { store, controller, room_id, alice, bob }
    }

    fn session_for(user_id: Uuid, room_id: Uuid) -> RoomSession {
        RoomSession::new(ConnectionBinding { connection_id: Uuid::new_v4(), user_id, room_id })
    }

    #[tokio::test]
    async fn open_replays_history_members_and_invite() {
        let fx = fixture().await;
        fx.store.append_message(fx.room_id, fx.alice.id, "earlier").await.expect("append works");

        let mut session = session_for(fx.bob.id, fx.room_id);
        let (outbound, _receiver) = mpsc::unbounded_channel();
        let event = fx.controller.open(&mut session, outbound).await.expect("open should work");

        let ServerEvent::ConnectionSuccess { messages, users, invite_hash } = event else {
            panic!("expected connection_success");
        };
        assert_eq!(messages, vec![ChatMessage { text: "earlier".into(), sender: fx.alice.id }]);
        assert_eq!(users, vec![fx.alice.clone(), fx.bob.clone()]);
        assert!(!invite_hash.is_empty());
        assert_eq!(session.state(), SessionState::Bound);
        assert_eq!(fx.controller.hub().connection_count(fx.room_id).await, 1);
    }

    #[tokio::test]
    async fn open_for_vanished_room_is_rejected_without_subscription() {
        let fx = fixture().await;
        let ChatStore::Memory(memory) = &fx.store else {
            unreachable!("memory store expected");
        };
        memory.write().await.remove_room(fx.room_id);

        let mut session = session_for(fx.alice.id, fx.room_id);
        let (outbound, _receiver) = mpsc::unbounded_channel();

        assert_eq!(
            fx.controller.open(&mut session, outbound).await,
            Err(RejectReason::Unauthorized)
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(fx.controller.hub().connection_count(fx.room_id).await, 0);
    }

    #[tokio::test]
    async fn messages_fan_out_to_others_without_echo() {
        let fx = fixture().await;
        let mut alice = session_for(fx.alice.id, fx.room_id);
        let mut bob = session_for(fx.bob.id, fx.room_id);
        let (alice_out, mut alice_in) = mpsc::unbounded_channel();
        let (bob_out, mut bob_in) = mpsc::unbounded_channel();
        fx.controller.open(&mut alice, alice_out).await.expect("open should work");
        fx.controller.open(&mut bob, bob_out).await.expect("open should work");

        fx.controller.send_message(&alice, &json!({ "text": "hi" })).await.expect("send works");

        assert_eq!(
            bob_in.try_recv().ok(),
            Some(ServerEvent::ReceiveMessage(ChatMessage { text: "hi".into(), sender: fx.alice.id }))
        );
        assert!(alice_in.try_recv().is_err());

        let ChatStore::Memory(memory) = &fx.store else {
            unreachable!("memory store expected");
        };
        assert_eq!(memory.read().await.room_message_count(fx.room_id), Some(1));
    }

    #[tokio::test]
    async fn invalid_payloads_are_rejected_without_broadcast() {
        let fx = fixture().await;
        let mut alice = session_for(fx.alice.id, fx.room_id);
        let mut bob = session_for(fx.bob.id, fx.room_id);
        let (alice_out, _alice_in) = mpsc::unbounded_channel();
        let (bob_out, mut bob_in) = mpsc::unbounded_channel();
        fx.controller.open(&mut alice, alice_out).await.expect("open should work");
        fx.controller.open(&mut bob, bob_out).await.expect("open should work");

        for payload in [
            json!({ "text": "" }),
            json!({}),
            json!("hi"),
            json!({ "text": "spoof", "sender": fx.bob.id }),
        ] {
            assert_eq!(
                fx.controller.send_message(&alice, &payload).await,
                Err(SendMessageErrorCode::InvalidMessage)
            );
        }

        assert!(bob_in.try_recv().is_err());
        let ChatStore::Memory(memory) = &fx.store else {
            unreachable!("memory store expected");
        };
        assert_eq!(memory.read().await.message_count(), 0);
    }

    #[tokio::test]
    async fn sending_to_a_deleted_room_reports_chat_not_found() {
        let fx = fixture().await;
        let mut alice = session_for(fx.alice.id, fx.room_id);
        let (alice_out, _alice_in) = mpsc::unbounded_channel();
        fx.controller.open(&mut alice, alice_out).await.expect("open should work");

        let ChatStore::Memory(memory) = &fx.store else {
            unreachable!("memory store expected");
        };
        memory.write().await.remove_room(fx.room_id);

        assert_eq!(
            fx.controller.send_message(&alice, &json!({ "text": "anyone?" })).await,
            Err(SendMessageErrorCode::ChatNotFound)
        );
        assert_eq!(memory.read().await.message_count(), 0);
        assert_eq!(alice.state(), SessionState::Bound);
    }

    #[tokio::test]
    async fn unbound_sessions_cannot_send() {
        let fx = fixture().await;
        let session = session_for(fx.alice.id, fx.room_id);

        assert_eq!(
            fx.controller.send_message(&session, &json!({ "text": "early" })).await,
            Err(SendMessageErrorCode::InternalError)
        );
    }

    #[tokio::test]
    async fn user_joined_reaches_every_connection_and_close_unsubscribes() {
        let fx = fixture().await;
        let mut alice = session_for(fx.alice.id, fx.room_id);
        let (alice_out, mut alice_in) = mpsc::unbounded_channel();
        fx.controller.open(&mut alice, alice_out).await.expect("open should work");

        let newcomer = Uuid::new_v4();
        assert_eq!(fx.controller.notify_user_joined(fx.room_id, newcomer, "Cy".into()).await, 1);
        assert_eq!(
            alice_in.try_recv().ok(),
            Some(ServerEvent::UserJoined(RoomUser { id: newcomer, name: "Cy".into() }))
        );

        fx.controller.close(&mut alice).await;
        assert_eq!(alice.state(), SessionState::Closed);
        assert_eq!(fx.controller.notify_user_joined(fx.room_id, newcomer, "Cy".into()).await, 0);

        let (again_out, _again_in) = mpsc::unbounded_channel();
        assert!(fx.controller.open(&mut alice, again_out).await.is_err());
    }
}
