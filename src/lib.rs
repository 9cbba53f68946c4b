//! duorelay - Two-Party Room Relay Library
//!
//! Core room, presence, offline-queue, routing, and push machinery for a
//! relay that pairs exactly two identities per room and forwards chat and
//! call signaling between their devices.

pub mod config;
pub mod presence;
pub mod protocol;
pub mod push;
pub mod queue;
pub mod room;
pub mod router;

pub use config::ServerConfig;
pub use protocol::{ClientFrame, Identity, Profile, ServerFrame};
pub use room::{ClientConnection, Room, RoomRegistry};
pub use router::SignalRouter;
