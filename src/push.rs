//! Push Notifications
//!
//! Identity-keyed push subscriptions and best-effort delivery through a
//! narrow gateway trait. Delivery failures never reach the chat path: a
//! "gone" subscription is removed for good, anything else stays registered
//! and the next notify is its retry.

use crate::protocol::{ChatMessage, Identity, MessageKind};
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyper_rustls::HttpsConnector;
use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;

const PREVIEW_LIMIT: usize = 80;

/// Browser push subscription as registered by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The push service no longer knows the subscription; drop it.
    Gone,
    /// Transient failure; the subscription stays registered.
    Failed,
}

/// Transport used to reach the push service.
pub trait PushGateway: Send + Sync {
    fn deliver(
        &self,
        subscription: &PushSubscription,
        payload: &str,
    ) -> impl Future<Output = PushOutcome> + Send;
}

/// Best-effort notifier for an identity with zero live connections.
pub struct PushDispatcher<G> {
    gateway: G,
    notify_identity: Identity,
    subscriptions: RwLock<HashMap<Identity, Vec<PushSubscription>>>,
}

impl<G: PushGateway> PushDispatcher<G> {
    pub fn new(gateway: G, notify_identity: Identity) -> Self {
        Self {
            gateway,
            notify_identity,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// The identity configured to receive push when offline.
    pub fn notify_identity(&self) -> Identity {
        self.notify_identity
    }

    /// Register a subscription; a record with the same endpoint is replaced.
    pub fn subscribe(&self, identity: Identity, subscription: PushSubscription) {
        let mut map = self.subscriptions.write();
        let list = map.entry(identity).or_default();
        list.retain(|s| s.endpoint != subscription.endpoint);
        list.push(subscription);
        debug!(
            "registered push subscription for {} ({} total)",
            identity,
            list.len()
        );
    }

    pub fn unsubscribe(&self, identity: Identity, endpoint: &str) {
        if let Some(list) = self.subscriptions.write().get_mut(&identity) {
            list.retain(|s| s.endpoint != endpoint);
        }
    }

    pub fn subscription_count(&self, identity: Identity) -> usize {
        self.subscriptions
            .read()
            .get(&identity)
            .map_or(0, Vec::len)
    }

    /// Attempt delivery to every subscription registered for `identity`.
    pub async fn notify(&self, identity: Identity, title: &str, body: &str) {
        let subscriptions = self
            .subscriptions
            .read()
            .get(&identity)
            .cloned()
            .unwrap_or_default();
        if subscriptions.is_empty() {
            debug!("no push subscriptions for {}", identity);
            return;
        }

        let payload = serde_json::json!({ "title": title, "body": body }).to_string();
        let mut gone = Vec::new();

        for subscription in &subscriptions {
            match self.gateway.deliver(subscription, &payload).await {
                PushOutcome::Delivered => {
                    debug!("push delivered to {}", subscription.endpoint)
                }
                PushOutcome::Gone => gone.push(subscription.endpoint.clone()),
                PushOutcome::Failed => warn!(
                    "push to {} failed; keeping subscription",
                    subscription.endpoint
                ),
            }
        }

        if !gone.is_empty() {
            let mut map = self.subscriptions.write();
            if let Some(list) = map.get_mut(&identity) {
                list.retain(|s| !gone.contains(&s.endpoint));
            }
            warn!("removed {} gone push subscriptions for {}", gone.len(), identity);
        }
    }
}

/// Notification preview for a chat message.
///
/// Media content never leaves the relay through push; only a fixed label
/// per kind. Text is truncated to a short preview.
pub fn message_preview(message: &ChatMessage) -> (String, String) {
    let title = if message.sender_name.is_empty() {
        "New message".to_string()
    } else {
        message.sender_name.clone()
    };

    let body = match message.message_type {
        MessageKind::Text => {
            let text = message.text.trim();
            if text.chars().count() > PREVIEW_LIMIT {
                let truncated: String = text.chars().take(PREVIEW_LIMIT).collect();
                format!("{}…", truncated)
            } else {
                text.to_string()
            }
        }
        MessageKind::Image => "📷 Photo".to_string(),
        MessageKind::Video => "🎬 Video".to_string(),
        MessageKind::Audio => "🎤 Voice message".to_string(),
    };

    (title, body)
}

/// Gateway that posts payloads to the subscription endpoint over HTTPS.
///
/// Payload encryption and VAPID signing are owned by the deployment's push
/// proxy; this gateway only classifies outcomes. 404/410 from the push
/// service means the subscription is gone.
pub struct HttpPushGateway {
    client: Client<HttpsConnector<HttpConnector>>,
    ttl_secs: u32,
}

impl HttpPushGateway {
    pub fn new(ttl_secs: u32) -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Self {
            client: Client::builder().build(https),
            ttl_secs,
        }
    }
}

impl PushGateway for HttpPushGateway {
    fn deliver(
        &self,
        subscription: &PushSubscription,
        payload: &str,
    ) -> impl Future<Output = PushOutcome> + Send {
        let request = Request::builder()
            .method(Method::POST)
            .uri(&subscription.endpoint)
            .header("TTL", self.ttl_secs)
            .header("Content-Type", "application/json")
            .body(Body::from(payload.to_string()));
        let client = self.client.clone();

        async move {
            let request = match request {
                Ok(request) => request,
                Err(e) => {
                    warn!("invalid push endpoint: {}", e);
                    return PushOutcome::Failed;
                }
            };
            match client.request(request).await {
                Ok(response) => match response.status() {
                    status if status.is_success() => PushOutcome::Delivered,
                    StatusCode::NOT_FOUND | StatusCode::GONE => PushOutcome::Gone,
                    status => {
                        warn!("push service answered {}", status);
                        PushOutcome::Failed
                    }
                },
                Err(e) => {
                    warn!("push request failed: {}", e);
                    PushOutcome::Failed
                }
            }
        }
    }
}
