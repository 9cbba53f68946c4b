//! Presence Derivation
//!
//! Pure functions from a room's connection set to the facts the join echo
//! and the routing decisions need. Nothing here mutates state, so the same
//! derivation serves both.

use crate::protocol::{Identity, Profile};
use crate::room::ClientConnection;
use std::sync::Arc;

/// What a given identity observes of a room at one point in time.
#[derive(Debug, Clone)]
pub struct PresenceView {
    /// Exactly one distinct identity populates the room.
    pub is_initiator: bool,
    /// The opposite identity has at least one live connection.
    pub peer_online: bool,
    /// Total live connections in the room, all identities.
    pub peer_count: usize,
    /// Profile of the most recently joined peer device, if any.
    pub peer_profile: Option<Profile>,
    /// The viewer is the only device of its identity.
    pub first_device: bool,
}

/// Derive the view for `viewer` from a room's connection set.
pub fn observe(connections: &[Arc<ClientConnection>], viewer: Identity) -> PresenceView {
    let peer = viewer.opposite();
    let own_devices = connections.iter().filter(|c| c.identity == viewer).count();
    let peer_online = connections.iter().any(|c| c.identity == peer);

    let distinct = (own_devices > 0) as usize + peer_online as usize;

    PresenceView {
        is_initiator: distinct == 1,
        peer_online,
        peer_count: connections.len(),
        peer_profile: connections
            .iter()
            .rev()
            .find(|c| c.identity == peer)
            .map(|c| c.profile()),
        first_device: own_devices == 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerFrame;
    use tokio::sync::mpsc;

    fn connection(identity: Identity, device_id: &str, name: &str) -> Arc<ClientConnection> {
        let (tx, _rx) = mpsc::unbounded_channel::<ServerFrame>();
        Arc::new(ClientConnection::new(
            identity,
            device_id.to_string(),
            Profile {
                name: name.to_string(),
                avatar: String::new(),
            },
            tx,
        ))
    }

    #[test]
    fn test_lone_identity_is_initiator() {
        let connections = vec![connection(Identity::Admin, "d1", "Admin")];
        let view = observe(&connections, Identity::Admin);

        assert!(view.is_initiator);
        assert!(!view.peer_online);
        assert_eq!(view.peer_count, 1);
        assert!(view.peer_profile.is_none());
        assert!(view.first_device);
    }

    #[test]
    fn test_two_identities_neither_initiator() {
        let connections = vec![
            connection(Identity::Admin, "d1", "Admin"),
            connection(Identity::Friend, "d2", "Friend"),
        ];
        let view = observe(&connections, Identity::Friend);

        assert!(!view.is_initiator);
        assert!(view.peer_online);
        assert_eq!(view.peer_count, 2);
        assert_eq!(view.peer_profile.unwrap().name, "Admin");
    }

    #[test]
    fn test_second_device_is_not_first() {
        let connections = vec![
            connection(Identity::Admin, "d1", "Admin"),
            connection(Identity::Admin, "d2", "Admin"),
        ];
        let view = observe(&connections, Identity::Admin);

        // Multiple devices of one identity still leave the room single-sided.
        assert!(view.is_initiator);
        assert!(!view.first_device);
    }

    #[test]
    fn test_peer_profile_is_most_recent() {
        let connections = vec![
            connection(Identity::Friend, "d1", "Old Name"),
            connection(Identity::Admin, "d2", "Admin"),
            connection(Identity::Friend, "d3", "New Name"),
        ];
        let view = observe(&connections, Identity::Admin);

        assert_eq!(view.peer_profile.unwrap().name, "New Name");
    }
}
