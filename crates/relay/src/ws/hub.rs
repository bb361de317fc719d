use std::collections::HashMap;

use murmur_common::protocol::ws::ServerEvent;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub type OutboundSender = mpsc::UnboundedSender<ServerEvent>;

/// Broadcast groups: room -> connection -> outbound queue.
///
/// Sends happen after the lock is released, and queues are unbounded, so a
/// broadcast never waits on a slow connection.
#[derive(Debug, Default)]
pub struct RoomHub {
    rooms: RwLock<HashMap<Uuid, HashMap<Uuid, OutboundSender>>>,
}

impl RoomHub {
    pub async fn subscribe(&self, room_id: Uuid, connection_id: Uuid, sender: OutboundSender) {
        self.rooms.write().await.entry(room_id).or_default().insert(connection_id, sender);
    }

    pub async fn unsubscribe(&self, room_id: Uuid, connection_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(connections) = rooms.get_mut(&room_id) {
            connections.remove(&connection_id);
            if connections.is_empty() {
                rooms.remove(&room_id);
            }
        }
    }

    /// Queues `event` for every connection in the room except `exclude`.
    /// Returns how many queues accepted it.
    pub async fn broadcast(
        &self,
        room_id: Uuid,
        event: ServerEvent,
        exclude: Option<Uuid>,
    ) -> usize {
        let recipients = {
            let rooms = self.rooms.read().await;
            let Some(connections) = rooms.get(&room_id) else {
                return 0;
            };
            connections
                .iter()
                .filter(|(connection_id, _)| Some(**connection_id) != exclude)
                .map(|(_, sender)| sender.clone())
                .collect::<Vec<_>>()
        };

        recipients.into_iter().filter(|sender| sender.send(event.clone()).is_ok()).count()
    }

    pub async fn connection_count(&self, room_id: Uuid) -> usize {
        self.rooms.read().await.get(&room_id).map_or(0, HashMap::len)
    }
}
