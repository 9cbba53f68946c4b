//! Frame Routing
//!
//! Dispatches decoded inbound frames to the correct fan-out policy. The
//! relay never answers a protocol violation: frames for vanished rooms or
//! from connections without an identity are dropped with a log line and the
//! connection stays open.

use crate::protocol::{ClientFrame, DeliveryStatus, SenderTag, ServerFrame};
use crate::push::{message_preview, PushDispatcher, PushGateway};
use crate::room::{ClientConnection, RoomRegistry};
use log::{debug, info, warn};
use std::sync::Arc;

/// Routes frames from established connections.
pub struct SignalRouter<G> {
    registry: Arc<RoomRegistry>,
    push: Arc<PushDispatcher<G>>,
}

impl<G: PushGateway + 'static> SignalRouter<G> {
    pub fn new(registry: Arc<RoomRegistry>, push: Arc<PushDispatcher<G>>) -> Self {
        Self { registry, push }
    }

    /// Dispatch one frame from `sender`, already joined to `room_id`.
    pub fn route(&self, room_id: &str, sender: &Arc<ClientConnection>, frame: ClientFrame) {
        let Some(room) = self.registry.get(room_id) else {
            debug!("dropping frame for unknown room {}", room_id);
            return;
        };

        match frame {
            ClientFrame::Join { .. } => {
                warn!("duplicate join from connection {}; ignored", sender.id);
            }

            ClientFrame::ChatMessage(message) => {
                let target = sender.identity.opposite();
                let peer_online = room.presence_for(sender.identity).peer_online;

                // Chosen once, at send time: live delivery or the queue,
                // never both.
                let status = if peer_online {
                    room.send_to_identity(
                        target,
                        &ServerFrame::ChatMessage {
                            message: message.clone(),
                            status: DeliveryStatus::Delivered,
                            sender: None,
                        },
                    );
                    DeliveryStatus::Delivered
                } else {
                    sender.send(ServerFrame::MessageQueued {
                        id: message.id.clone(),
                        status: DeliveryStatus::Sent,
                    });
                    room.enqueue_offline(target, message.clone());
                    if target == self.push.notify_identity() {
                        let (title, body) = message_preview(&message);
                        let push = Arc::clone(&self.push);
                        tokio::spawn(async move {
                            push.notify(target, &title, &body).await;
                        });
                    }
                    DeliveryStatus::Sent
                };

                // The sender's other devices mirror the outbound message.
                room.send_to_siblings(
                    sender,
                    &ServerFrame::ChatMessage {
                        message,
                        status,
                        sender: Some(SenderTag::Me),
                    },
                );
            }

            // Transient, non-authoritative signals go to the other side
            // only; sibling devices have no use for them.
            ClientFrame::Typing { is_typing } => {
                room.send_to_identity(
                    sender.identity.opposite(),
                    &ServerFrame::Typing { is_typing },
                );
            }

            ClientFrame::ProfileUpdate { profile } => {
                sender.set_profile(profile.clone());
                room.send_to_identity(
                    sender.identity.opposite(),
                    &ServerFrame::ProfileUpdate { profile },
                );
            }

            ClientFrame::MessageRead { ids } => {
                room.send_to_identity(
                    sender.identity.opposite(),
                    &ServerFrame::MessageStatus {
                        ids,
                        status: DeliveryStatus::Read,
                    },
                );
            }

            // Point-to-point leg of the device sync handshake.
            ClientFrame::SyncResponse {
                target_device_id,
                messages,
            } => {
                room.send_to_device(
                    sender.identity,
                    &target_device_id,
                    &ServerFrame::SyncMessages { messages },
                );
            }

            // Call signaling reaches every listening device, whichever side
            // it belongs to.
            ClientFrame::Offer { sdp } => {
                room.send_to_others(sender.id, &ServerFrame::Offer { sdp });
            }
            ClientFrame::Answer { sdp } => {
                room.send_to_others(sender.id, &ServerFrame::Answer { sdp });
            }
            ClientFrame::IceCandidate { candidate } => {
                room.send_to_others(sender.id, &ServerFrame::IceCandidate { candidate });
            }
            ClientFrame::CallRequest { call_type, from } => {
                room.send_to_others(sender.id, &ServerFrame::CallRequest { call_type, from });
            }
            ClientFrame::CallAccepted { call_type } => {
                room.send_to_others(sender.id, &ServerFrame::CallAccepted { call_type });
            }
            ClientFrame::CallRejected => {
                room.send_to_others(sender.id, &ServerFrame::CallRejected);
            }
            ClientFrame::CallEnd => {
                room.send_to_others(sender.id, &ServerFrame::CallEnd);
            }

            ClientFrame::EmergencyWipe => {
                info!("emergency wipe for room {}", room.id);
                room.wipe_offline();
                room.send_to_all(&ServerFrame::EmergencyWipe);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessage, Identity, MessageKind, Profile};
    use crate::push::{PushOutcome, PushSubscription, SubscriptionKeys};
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::future::Future;
    use std::time::Duration;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    #[derive(Clone, Default)]
    struct RecordingGateway {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl PushGateway for RecordingGateway {
        fn deliver(
            &self,
            subscription: &PushSubscription,
            _payload: &str,
        ) -> impl Future<Output = PushOutcome> + Send {
            let calls = self.calls.clone();
            let endpoint = subscription.endpoint.clone();
            async move {
                calls.lock().push(endpoint);
                PushOutcome::Delivered
            }
        }
    }

    struct Fixture {
        registry: Arc<RoomRegistry>,
        router: SignalRouter<RecordingGateway>,
        gateway: RecordingGateway,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(RoomRegistry::new(Duration::from_secs(60), 8));
        let gateway = RecordingGateway::default();
        let push = Arc::new(PushDispatcher::new(gateway.clone(), Identity::Admin));
        Fixture {
            router: SignalRouter::new(Arc::clone(&registry), push),
            registry,
            gateway,
        }
    }

    fn profile(name: &str) -> Profile {
        Profile {
            name: name.to_string(),
            avatar: String::new(),
        }
    }

    fn join(
        fixture: &Fixture,
        identity: Identity,
        device_id: &str,
    ) -> (Arc<ClientConnection>, UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let result = fixture
            .registry
            .join("r1", identity, device_id, profile(identity.as_str()), tx);
        (result.connection, rx)
    }

    fn chat(id: &str, text: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            text: text.to_string(),
            message_type: MessageKind::Text,
            media_url: None,
            timestamp: Utc::now(),
            sender_name: "sender".to_string(),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ServerFrame>) {
        while rx.try_recv().is_ok() {}
    }

    #[test]
    fn test_chat_delivered_live_when_peer_online() {
        let fx = fixture();
        let (admin, mut rx_a) = join(&fx, Identity::Admin, "a1");
        let (_friend, mut rx_f) = join(&fx, Identity::Friend, "f1");
        drain(&mut rx_a);

        fx.router
            .route("r1", &admin, ClientFrame::ChatMessage(chat("m1", "hi")));

        match rx_f.try_recv().unwrap() {
            ServerFrame::ChatMessage {
                message,
                status,
                sender,
            } => {
                assert_eq!(message.id, "m1");
                assert_eq!(status, DeliveryStatus::Delivered);
                assert!(sender.is_none());
            }
            other => panic!("expected chat-message, got {:?}", other),
        }
        // Nothing was queued.
        assert_eq!(
            fx.registry.get("r1").unwrap().queued_count(Identity::Friend),
            0
        );
    }

    #[tokio::test]
    async fn test_chat_queued_when_peer_offline() {
        let fx = fixture();
        // Both friend devices are up; the admin side stays offline.
        let (friend, mut rx_f) = join(&fx, Identity::Friend, "f1");
        let (_f2, mut rx_sibling) = join(&fx, Identity::Friend, "f2");
        drain(&mut rx_f);

        fx.router
            .route("r1", &friend, ClientFrame::ChatMessage(chat("m1", "hi")));

        match rx_f.try_recv().unwrap() {
            ServerFrame::MessageQueued { id, status } => {
                assert_eq!(id, "m1");
                assert_eq!(status, DeliveryStatus::Sent);
            }
            other => panic!("expected message-queued, got {:?}", other),
        }

        // The sibling device mirrors the outbound message as unsent.
        match rx_sibling.try_recv().unwrap() {
            ServerFrame::ChatMessage { message, status, sender } => {
                assert_eq!(message.id, "m1");
                assert_eq!(status, DeliveryStatus::Sent);
                assert_eq!(sender, Some(SenderTag::Me));
            }
            other => panic!("expected sibling chat copy, got {:?}", other),
        }

        assert_eq!(
            fx.registry.get("r1").unwrap().queued_count(Identity::Admin),
            1
        );
    }

    #[tokio::test]
    async fn test_offline_chat_to_push_identity_notifies_subscriptions() {
        let fx = fixture();
        fx.router.push.subscribe(
            Identity::Admin,
            PushSubscription {
                endpoint: "https://push/a".to_string(),
                keys: SubscriptionKeys {
                    p256dh: "k".to_string(),
                    auth: "a".to_string(),
                },
            },
        );
        let (friend, _rx_f) = join(&fx, Identity::Friend, "f1");

        fx.router
            .route("r1", &friend, ClientFrame::ChatMessage(chat("m1", "hi")));

        // Push runs on a spawned task; give it a moment.
        for _ in 0..100 {
            if !fx.gateway.calls.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(*fx.gateway.calls.lock(), vec!["https://push/a".to_string()]);
    }

    #[tokio::test]
    async fn test_offline_chat_to_other_identity_does_not_notify() {
        let fx = fixture();
        fx.router.push.subscribe(
            Identity::Admin,
            PushSubscription {
                endpoint: "https://push/a".to_string(),
                keys: SubscriptionKeys {
                    p256dh: "k".to_string(),
                    auth: "a".to_string(),
                },
            },
        );
        // Admin sends while friend is offline: friend gets no push.
        let (admin, _rx_a) = join(&fx, Identity::Admin, "a1");

        fx.router
            .route("r1", &admin, ClientFrame::ChatMessage(chat("m1", "hi")));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fx.gateway.calls.lock().is_empty());
    }

    #[test]
    fn test_typing_skips_sibling_devices() {
        let fx = fixture();
        let (admin, mut rx_a1) = join(&fx, Identity::Admin, "a1");
        let (_a2, mut rx_a2) = join(&fx, Identity::Admin, "a2");
        let (_friend, mut rx_f) = join(&fx, Identity::Friend, "f1");
        drain(&mut rx_a1);
        drain(&mut rx_a2);

        fx.router
            .route("r1", &admin, ClientFrame::Typing { is_typing: true });

        assert!(matches!(
            rx_f.try_recv().unwrap(),
            ServerFrame::Typing { is_typing: true }
        ));
        assert!(rx_a2.try_recv().is_err());
    }

    #[test]
    fn test_profile_update_overwrites_connection_profile() {
        let fx = fixture();
        let (admin, _rx_a) = join(&fx, Identity::Admin, "a1");
        let (_friend, mut rx_f) = join(&fx, Identity::Friend, "f1");

        fx.router.route(
            "r1",
            &admin,
            ClientFrame::ProfileUpdate {
                profile: profile("Renamed"),
            },
        );

        assert_eq!(admin.profile().name, "Renamed");
        assert!(matches!(
            rx_f.try_recv().unwrap(),
            ServerFrame::ProfileUpdate { profile } if profile.name == "Renamed"
        ));
    }

    #[test]
    fn test_message_read_becomes_status_for_peer() {
        let fx = fixture();
        let (admin, mut rx_a) = join(&fx, Identity::Admin, "a1");
        let (friend, _rx_f) = join(&fx, Identity::Friend, "f1");
        drain(&mut rx_a);

        fx.router.route(
            "r1",
            &friend,
            ClientFrame::MessageRead {
                ids: vec!["m1".to_string(), "m2".to_string()],
            },
        );

        match rx_a.try_recv().unwrap() {
            ServerFrame::MessageStatus { ids, status } => {
                assert_eq!(ids, vec!["m1", "m2"]);
                assert_eq!(status, DeliveryStatus::Read);
            }
            other => panic!("expected message-status, got {:?}", other),
        }
    }

    #[test]
    fn test_sync_response_targets_one_device() {
        let fx = fixture();
        let (a1, mut rx_a1) = join(&fx, Identity::Admin, "a1");
        let (_a2, mut rx_a2) = join(&fx, Identity::Admin, "a2");
        let (_a3, mut rx_a3) = join(&fx, Identity::Admin, "a3");
        drain(&mut rx_a1);
        drain(&mut rx_a2);

        fx.router.route(
            "r1",
            &a1,
            ClientFrame::SyncResponse {
                target_device_id: "a3".to_string(),
                messages: json!([{ "id": "m1" }]),
            },
        );

        match rx_a3.try_recv().unwrap() {
            ServerFrame::SyncMessages { messages } => {
                assert_eq!(messages, json!([{ "id": "m1" }]))
            }
            other => panic!("expected sync-messages, got {:?}", other),
        }
        assert!(rx_a2.try_recv().is_err());
    }

    #[test]
    fn test_call_signaling_reaches_everyone_but_sender() {
        let fx = fixture();
        let (admin, mut rx_a1) = join(&fx, Identity::Admin, "a1");
        let (_a2, mut rx_a2) = join(&fx, Identity::Admin, "a2");
        let (_friend, mut rx_f) = join(&fx, Identity::Friend, "f1");
        drain(&mut rx_a1);
        drain(&mut rx_a2);

        fx.router.route(
            "r1",
            &admin,
            ClientFrame::CallRequest {
                call_type: "video".to_string(),
                from: "Admin".to_string(),
            },
        );

        assert!(matches!(
            rx_f.try_recv().unwrap(),
            ServerFrame::CallRequest { call_type, .. } if call_type == "video"
        ));
        // Sibling devices hear the call too; the sender does not.
        assert!(matches!(
            rx_a2.try_recv().unwrap(),
            ServerFrame::CallRequest { .. }
        ));
        assert!(rx_a1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_emergency_wipe_reaches_everyone_and_clears_queues() {
        let fx = fixture();
        let (friend, mut rx_f) = join(&fx, Identity::Friend, "f1");

        // Queue a message for the offline admin, then wipe.
        fx.router
            .route("r1", &friend, ClientFrame::ChatMessage(chat("m1", "hi")));
        drain(&mut rx_f);
        fx.router.route("r1", &friend, ClientFrame::EmergencyWipe);

        assert!(matches!(
            rx_f.try_recv().unwrap(),
            ServerFrame::EmergencyWipe
        ));
        let room = fx.registry.get("r1").unwrap();
        assert_eq!(room.queued_count(Identity::Admin), 0);
        assert_eq!(room.queued_count(Identity::Friend), 0);
    }

    #[test]
    fn test_frame_for_unknown_room_is_dropped() {
        let fx = fixture();
        let (admin, mut rx_a) = join(&fx, Identity::Admin, "a1");
        drain(&mut rx_a);

        fx.router
            .route("vanished", &admin, ClientFrame::Typing { is_typing: true });

        assert!(rx_a.try_recv().is_err());
    }
}
