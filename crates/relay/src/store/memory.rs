use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use murmur_common::types::{ChatMessage, RoomUser};
use uuid::Uuid;

use super::{
    AppendOutcome, InviteInsert, InviteRecord, RefreshCredential, RoomSnapshot, INVITE_HASH_BYTES,
    SALT_BYTES,
};

#[derive(Default)]
pub struct MemoryChatStore {
    users: HashMap<Uuid, String>,
    rooms: HashMap<Uuid, MemoryRoom>,
    messages: HashMap<Uuid, ChatMessage>,
    credentials: HashMap<Uuid, RefreshCredential>,
    invites: HashMap<Uuid, [u8; INVITE_HASH_BYTES]>,
}

struct MemoryRoom {
    members: Vec<Uuid>,
    message_ids: Vec<Uuid>,
    created_at: DateTime<Utc>,
}

impl MemoryChatStore {
    pub(super) fn create_user(&mut self, name: &str) -> RoomUser {
        let id = Uuid::new_v4();
        self.users.insert(id, name.to_owned());
        RoomUser { id, name: name.to_owned() }
    }

    pub(super) fn create_room(&mut self, founder_id: Uuid) -> Result<Uuid> {
        if !self.users.contains_key(&founder_id) {
            bail!("room founder {founder_id} does not exist");
        }

        let room_id = Uuid::new_v4();
        self.rooms.insert(
            room_id,
            MemoryRoom { members: vec![founder_id], message_ids: Vec::new(), created_at: Utc::now() },
        );
        Ok(room_id)
    }

    pub(super) fn create_room_with_founder(&mut self, founder_name: &str) -> (RoomUser, Uuid) {
        let founder = self.create_user(founder_name);
        let room_id = Uuid::new_v4();
        self.rooms.insert(
            room_id,
            MemoryRoom { members: vec![founder.id], message_ids: Vec::new(), created_at: Utc::now() },
        );
        (founder, room_id)
    }

    pub(super) fn add_member(&mut self, room_id: Uuid, user_id: Uuid) -> Result<bool> {
        if !self.users.contains_key(&user_id) {
            bail!("room member {user_id} does not exist");
        }

        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Ok(false);
        };
        if !room.members.contains(&user_id) {
            room.members.push(user_id);
        }
        Ok(true)
    }

    pub(super) fn user_exists(&self, user_id: Uuid) -> bool {
        self.users.contains_key(&user_id)
    }

    pub(super) fn room_exists(&self, room_id: Uuid) -> bool {
        self.rooms.contains_key(&room_id)
    }

    pub(super) fn is_member(&self, room_id: Uuid, user_id: Uuid) -> bool {
        self.rooms.get(&room_id).is_some_and(|room| room.members.contains(&user_id))
    }

    pub(super) fn room_members(&self, room_id: Uuid) -> Option<Vec<RoomUser>> {
        let room = self.rooms.get(&room_id)?;
        Some(
            room.members
                .iter()
                .filter_map(|id| {
                    self.users.get(id).map(|name| RoomUser { id: *id, name: name.clone() })
                })
                .collect(),
        )
    }

    pub(super) fn room_snapshot(&self, room_id: Uuid) -> Option<RoomSnapshot> {
        let users = self.room_members(room_id)?;
        let messages = self.rooms.get(&room_id).map(|room| {
            room.message_ids.iter().filter_map(|id| self.messages.get(id).cloned()).collect()
        })?;
        Some(RoomSnapshot { users, messages })
    }

    pub(super) fn append_message(
        &mut self,
        room_id: Uuid,
        sender_id: Uuid,
        text: &str,
    ) -> AppendOutcome {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return AppendOutcome::RoomNotFound;
        };

        let message_id = Uuid::new_v4();
        room.message_ids.push(message_id);
        self.messages.insert(message_id, ChatMessage { text: text.to_owned(), sender: sender_id });
        AppendOutcome::Appended
    }

    pub(super) fn insert_credential(
        &mut self,
        user_id: Uuid,
        room_id: Uuid,
        salt: [u8; SALT_BYTES],
        created_at: DateTime<Utc>,
    ) -> RefreshCredential {
        let credential =
            RefreshCredential { id: Uuid::new_v4(), user_id, room_id, salt, created_at };
        self.credentials.insert(credential.id, credential.clone());
        credential
    }

    pub(super) fn find_credential(&self, id: Uuid, now: DateTime<Utc>) -> Option<RefreshCredential> {
        self.credentials.get(&id).filter(|credential| !credential.is_expired_at(now)).cloned()
    }

    pub(super) fn delete_credential(&mut self, id: Uuid) -> bool {
        self.credentials.remove(&id).is_some()
    }

    pub(super) fn purge_expired_credentials(&mut self, now: DateTime<Utc>) -> u64 {
        let before = self.credentials.len();
        self.credentials.retain(|_, credential| !credential.is_expired_at(now));
        (before - self.credentials.len()) as u64
    }

    pub(super) fn find_invite_by_room(&self, room_id: Uuid) -> Option<InviteRecord> {
        self.invites.get(&room_id).map(|hash| InviteRecord { room_id, hash: *hash })
    }

    pub(super) fn find_invite_by_hash(
        &self,
        hash: &[u8; INVITE_HASH_BYTES],
    ) -> Option<InviteRecord> {
        self.invites
            .iter()
            .find(|(_, stored)| *stored == hash)
            .map(|(room_id, stored)| InviteRecord { room_id: *room_id, hash: *stored })
    }

    pub(super) fn insert_invite(&mut self, record: InviteRecord) -> Result<InviteInsert> {
        if !self.rooms.contains_key(&record.room_id) {
            bail!("invite room {} does not exist", record.room_id);
        }
        if self.invites.contains_key(&record.room_id)
            || self.invites.values().any(|hash| *hash == record.hash)
        {
            return Ok(InviteInsert::Conflict);
        }

        self.invites.insert(record.room_id, record.hash);
        Ok(InviteInsert::Inserted(record))
    }

    /// Drops a room the way an external cleanup job would; members and
    /// message records stay behind.
    #[cfg(test)]
    pub(crate) fn remove_room(&mut self, room_id: Uuid) -> bool {
        self.invites.remove(&room_id);
        self.rooms.remove(&room_id).is_some()
    }

    /// Drops a user record; memberships and credentials that point at it
    /// stay behind.
    #[cfg(test)]
    pub(crate) fn remove_user(&mut self, user_id: Uuid) -> bool {
        self.users.remove(&user_id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn message_count(&self) -> usize {
        self.messages.len()
    }

    #[cfg(test)]
    pub(crate) fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    #[cfg(test)]
    pub(crate) fn room_message_count(&self, room_id: Uuid) -> Option<usize> {
        self.rooms.get(&room_id).map(|room| room.message_ids.len())
    }
}
