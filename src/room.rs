//! Room Management
//!
//! Rooms, their live connections, and the registry that owns them. A room
//! exists from the first join to a roomId until it has been empty for the
//! whole grace window; deletion re-verifies emptiness when the timer fires,
//! so a reconnect during the window keeps the room (and its offline queues)
//! alive without any timer cancellation.

use crate::presence::{self, PresenceView};
use crate::protocol::{ChatMessage, DeliveryStatus, Identity, Profile, ServerFrame};
use crate::queue::{OfflineQueue, PendingMessage};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A live client connection after a successful join handshake.
///
/// Identity and room are fixed for the connection's lifetime; only the
/// profile may change (profile-update overwrites it).
pub struct ClientConnection {
    pub id: Uuid,
    pub identity: Identity,
    pub device_id: String,
    profile: RwLock<Profile>,
    sender: mpsc::UnboundedSender<ServerFrame>,
}

impl ClientConnection {
    pub fn new(
        identity: Identity,
        device_id: String,
        profile: Profile,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            device_id,
            profile: RwLock::new(profile),
            sender,
        }
    }

    /// Fire-and-forget send. A closed channel only means the writer task is
    /// gone; the connection is about to be removed anyway.
    pub fn send(&self, frame: ServerFrame) {
        if self.sender.send(frame).is_err() {
            debug!("connection {} dropped a frame; writer closed", self.id);
        }
    }

    pub fn profile(&self) -> Profile {
        self.profile.read().clone()
    }

    pub fn set_profile(&self, profile: Profile) {
        *self.profile.write() = profile;
    }
}

struct RoomInner {
    connections: Vec<Arc<ClientConnection>>,
    queue: OfflineQueue,
}

/// The relay context shared by the two identities of a roomId.
pub struct Room {
    pub id: String,
    pub created_at: DateTime<Utc>,
    inner: RwLock<RoomInner>,
}

impl Room {
    fn new(id: String, queue_cap: usize) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            inner: RwLock::new(RoomInner {
                connections: Vec::new(),
                queue: OfflineQueue::new(queue_cap),
            }),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Presence as observed by `viewer` right now.
    pub fn presence_for(&self, viewer: Identity) -> PresenceView {
        presence::observe(&self.inner.read().connections, viewer)
    }

    /// Send to every connection of `identity`.
    pub fn send_to_identity(&self, identity: Identity, frame: &ServerFrame) {
        for connection in self.inner.read().connections.iter() {
            if connection.identity == identity {
                connection.send(frame.clone());
            }
        }
    }

    /// Send to every connection except `sender_id`, regardless of identity.
    pub fn send_to_others(&self, sender_id: Uuid, frame: &ServerFrame) {
        for connection in self.inner.read().connections.iter() {
            if connection.id != sender_id {
                connection.send(frame.clone());
            }
        }
    }

    /// Send to every connection in the room.
    pub fn send_to_all(&self, frame: &ServerFrame) {
        for connection in self.inner.read().connections.iter() {
            connection.send(frame.clone());
        }
    }

    /// Send to the sender's other devices (same identity, different
    /// connection).
    pub fn send_to_siblings(&self, sender: &ClientConnection, frame: &ServerFrame) {
        for connection in self.inner.read().connections.iter() {
            if connection.identity == sender.identity && connection.id != sender.id {
                connection.send(frame.clone());
            }
        }
    }

    /// Send to the `identity` connection(s) registered under `device_id`.
    pub fn send_to_device(&self, identity: Identity, device_id: &str, frame: &ServerFrame) {
        for connection in self.inner.read().connections.iter() {
            if connection.identity == identity && connection.device_id == device_id {
                connection.send(frame.clone());
            }
        }
    }

    /// Buffer a message for an identity with no live connections.
    pub fn enqueue_offline(&self, target: Identity, message: ChatMessage) {
        self.inner.write().queue.enqueue(target, message);
    }

    fn drain_offline(&self, identity: Identity) -> Vec<PendingMessage> {
        self.inner.write().queue.drain(identity)
    }

    /// Drop both identities' buffered messages (emergency-wipe path).
    pub fn wipe_offline(&self) {
        self.inner.write().queue.wipe();
    }

    #[cfg(test)]
    pub fn queued_count(&self, identity: Identity) -> usize {
        self.inner.read().queue.len(identity)
    }
}

/// Outcome of registering a connection, echoed back as the `joined` frame.
pub struct JoinResult {
    pub room: Arc<Room>,
    pub connection: Arc<ClientConnection>,
    pub is_initiator: bool,
    pub peer_online: bool,
    pub peer_count: usize,
    pub peer_profile: Option<Profile>,
}

/// Creates, finds, and expires rooms. The only global state in the relay.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    grace: Duration,
    queue_cap: usize,
}

impl RoomRegistry {
    pub fn new(grace: Duration, queue_cap: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            grace,
            queue_cap,
        }
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(room_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    /// Register a connection with the room for `room_id`, creating the room
    /// on first use.
    ///
    /// The first connection of an identity announces `peer-joined` to the
    /// opposite side; later devices of the same identity instead receive a
    /// history sync from their siblings. Either way the identity's offline
    /// queue is delivered and cleared.
    pub fn join(
        &self,
        room_id: &str,
        identity: Identity,
        device_id: &str,
        profile: Profile,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> JoinResult {
        let room = {
            let mut rooms = self.rooms.write();
            rooms
                .entry(room_id.to_string())
                .or_insert_with(|| {
                    info!("created room {}", room_id);
                    Arc::new(Room::new(room_id.to_string(), self.queue_cap))
                })
                .clone()
        };

        let connection = Arc::new(ClientConnection::new(
            identity,
            device_id.to_string(),
            profile,
            sender,
        ));

        let (view, first_of_identity) = {
            let mut inner = room.inner.write();
            let first = !inner
                .connections
                .iter()
                .any(|c| c.identity == identity);
            inner.connections.push(connection.clone());
            (presence::observe(&inner.connections, identity), first)
        };

        info!(
            "{} device {} joined room {} ({} connections)",
            identity, device_id, room_id, view.peer_count
        );

        if first_of_identity {
            room.send_to_identity(
                identity.opposite(),
                &ServerFrame::PeerJoined {
                    profile: connection.profile(),
                },
            );
        } else {
            // Existing devices hold the authoritative local history; ask
            // them to push it to the newcomer.
            room.send_to_siblings(
                &connection,
                &ServerFrame::SyncRequest {
                    target_device_id: device_id.to_string(),
                },
            );
        }

        self.flush_offline(&room, identity);

        JoinResult {
            is_initiator: view.is_initiator,
            peer_online: view.peer_online,
            peer_count: view.peer_count,
            peer_profile: view.peer_profile,
            room,
            connection,
        }
    }

    /// Deliver the identity's whole offline queue as a single batch to all
    /// of its devices, then tell the opposite side those ids are delivered.
    fn flush_offline(&self, room: &Room, identity: Identity) {
        let drained = room.drain_offline(identity);
        if drained.is_empty() {
            return;
        }

        let ids: Vec<String> = drained.iter().map(|p| p.message.id.clone()).collect();
        info!(
            "delivering {} queued messages to {} in room {}",
            drained.len(),
            identity,
            room.id
        );

        match serde_json::to_value(&drained) {
            Ok(messages) => {
                room.send_to_identity(identity, &ServerFrame::SyncMessages { messages });
                room.send_to_identity(
                    identity.opposite(),
                    &ServerFrame::MessageStatus {
                        ids,
                        status: DeliveryStatus::Delivered,
                    },
                );
            }
            Err(e) => warn!("failed to encode queued messages for {}: {}", room.id, e),
        }
    }

    /// Remove a connection. The last device of an identity announces
    /// `peer-left`; a room left with no connections at all is scheduled for
    /// deletion after the grace window.
    pub fn disconnect(self: &Arc<Self>, room_id: &str, connection_id: Uuid) {
        let Some(room) = self.get(room_id) else {
            return;
        };

        let (removed, identity_offline, room_empty) = {
            let mut inner = room.inner.write();
            let mut removed = None;
            inner.connections.retain(|c| {
                if c.id == connection_id {
                    removed = Some(c.clone());
                    false
                } else {
                    true
                }
            });
            let identity_offline = removed.as_ref().map(|c| {
                !inner
                    .connections
                    .iter()
                    .any(|other| other.identity == c.identity)
            });
            (removed, identity_offline, inner.connections.is_empty())
        };

        let Some(connection) = removed else {
            return;
        };

        info!(
            "{} device {} left room {}",
            connection.identity, connection.device_id, room_id
        );

        if identity_offline == Some(true) {
            room.send_to_identity(connection.identity.opposite(), &ServerFrame::PeerLeft);
        }

        if room_empty {
            self.schedule_reap(room_id);
        }
    }

    /// Delete the room after the grace window unless someone reconnects
    /// first. The emptiness re-check at fire time is the cancellation.
    fn schedule_reap(self: &Arc<Self>, room_id: &str) {
        let registry = Arc::clone(self);
        let room_id = room_id.to_string();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.reap_if_empty(&room_id);
        });
    }

    /// Remove the room iff it is still empty. Returns whether it was
    /// removed.
    pub fn reap_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write();
        match rooms.get(room_id) {
            Some(room) if room.connection_count() == 0 => {
                rooms.remove(room_id);
                info!("room {} expired after grace window", room_id);
                true
            }
            _ => false,
        }
    }
}
