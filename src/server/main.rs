//! Relay Server - Main Entry Point
//!
//! Single hyper service carrying the whole boundary: WebSocket relay on
//! `/ws`, push REST API under `/api/push/`, and a `/health` liveness probe.

use anyhow::Result;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use hyper::service::{make_service_fn, service_fn};
use hyper::upgrade::Upgraded;
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use hyper_tungstenite::tungstenite::Message;
use hyper_tungstenite::WebSocketStream;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use duorelay::config::ServerConfig;
use duorelay::protocol::{ClientFrame, Identity, ServerFrame};
use duorelay::push::{HttpPushGateway, PushDispatcher, PushSubscription};
use duorelay::room::{ClientConnection, RoomRegistry};
use duorelay::router::SignalRouter;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "duorelay-server")]
#[command(about = "Two-party room relay server")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Override host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Override listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Shared server state
struct ServerState {
    registry: Arc<RoomRegistry>,
    router: SignalRouter<HttpPushGateway>,
    push: Arc<PushDispatcher<HttpPushGateway>>,
    vapid_public_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    // Load configuration
    let config = if args.config.exists() {
        ServerConfig::from_file(args.config.to_str().unwrap())?
    } else {
        info!("Config file not found, using defaults");
        ServerConfig::default()
    };

    let host = args.host.unwrap_or_else(|| config.host.clone());
    // The hosting platform hands the port down as an environment variable.
    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(config.port);

    let registry = Arc::new(RoomRegistry::new(
        config.room_grace(),
        config.offline_queue_cap,
    ));
    let push = Arc::new(PushDispatcher::new(
        HttpPushGateway::new(config.push.ttl_secs),
        config.push.notify_identity,
    ));
    let state = Arc::new(ServerState {
        router: SignalRouter::new(Arc::clone(&registry), Arc::clone(&push)),
        registry,
        push,
        vapid_public_key: config.push.vapid_public_key.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!("duorelay listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);
    info!("Health check: http://{}/health", addr);

    server.await?;
    Ok(())
}

/// Top-level request dispatch: preflight, health, WebSocket upgrade, API.
async fn handle_request(
    mut req: Request<Body>,
    state: Arc<ServerState>,
) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    // CORS preflight for the browser client.
    if method == Method::OPTIONS {
        return Ok(cors(Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap()));
    }

    if path == "/health" {
        return Ok(cors(Response::builder()
            .status(StatusCode::OK)
            .body(Body::from("ok"))
            .unwrap()));
    }

    if path == "/ws" && hyper_tungstenite::is_upgrade_request(&req) {
        match hyper_tungstenite::upgrade(&mut req, None) {
            Ok((response, websocket)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    match websocket.await {
                        Ok(ws) => handle_socket(ws, state).await,
                        Err(e) => error!("WebSocket handshake failed: {}", e),
                    }
                });
                return Ok(response);
            }
            Err(e) => {
                error!("WebSocket upgrade error: {}", e);
                return Ok(Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(Body::from("Invalid WebSocket upgrade request"))
                    .unwrap());
            }
        }
    }

    if path.starts_with("/api/") {
        let started = Instant::now();
        let response = handle_api_request(req, state).await?;
        info!(
            "{} {} {} in {}ms",
            method,
            path,
            response.status().as_u16(),
            started.elapsed().as_millis()
        );
        return Ok(cors(response));
    }

    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("Not found"))
        .unwrap())
}

fn cors(mut response: Response<Body>) -> Response<Body> {
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", "*".parse().unwrap());
    headers.insert(
        "Access-Control-Allow-Methods",
        "GET, POST, OPTIONS".parse().unwrap(),
    );
    headers.insert("Access-Control-Allow-Headers", "Content-Type".parse().unwrap());
    response
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

#[derive(serde::Deserialize)]
struct SubscribeRequest {
    subscription: PushSubscription,
    #[serde(rename = "userType")]
    user_type: Identity,
}

#[derive(serde::Deserialize)]
struct UnsubscribeRequest {
    endpoint: String,
    #[serde(rename = "userType")]
    user_type: Identity,
}

/// REST surface mutating the push subscription set the dispatcher reads.
async fn handle_api_request(
    req: Request<Body>,
    state: Arc<ServerState>,
) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    match (method, path.as_str()) {
        (Method::GET, "/api/push/vapid-key") => {
            let body = serde_json::json!({ "publicKey": state.vapid_public_key }).to_string();
            Ok(json_response(StatusCode::OK, body))
        }

        (Method::POST, "/api/push/subscribe") => {
            let body_bytes = hyper::body::to_bytes(req.into_body()).await?;
            match serde_json::from_slice::<SubscribeRequest>(&body_bytes) {
                Ok(request) => {
                    state.push.subscribe(request.user_type, request.subscription);
                    Ok(json_response(
                        StatusCode::OK,
                        r#"{"status":"ok"}"#.to_string(),
                    ))
                }
                Err(e) => {
                    warn!("Failed to parse subscribe request: {}", e);
                    Ok(Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .body(Body::from(format!("Invalid request body: {}", e)))
                        .unwrap())
                }
            }
        }

        (Method::POST, "/api/push/unsubscribe") => {
            let body_bytes = hyper::body::to_bytes(req.into_body()).await?;
            match serde_json::from_slice::<UnsubscribeRequest>(&body_bytes) {
                Ok(request) => {
                    state.push.unsubscribe(request.user_type, &request.endpoint);
                    Ok(json_response(
                        StatusCode::OK,
                        r#"{"status":"ok"}"#.to_string(),
                    ))
                }
                Err(e) => {
                    warn!("Failed to parse unsubscribe request: {}", e);
                    Ok(Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .body(Body::from(format!("Invalid request body: {}", e)))
                        .unwrap())
                }
            }
        }

        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("API endpoint not found"))
            .unwrap()),
    }
}

/// Per-connection loop: a writer task drains the outbound channel while this
/// task reads frames, runs the join handshake, and hands the rest to the
/// router. Malformed frames are dropped; the connection stays open.
async fn handle_socket(ws: WebSocketStream<Upgraded>, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame.to_text() {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("failed to encode outbound frame: {}", e),
            }
        }
    });

    // Populated by the join handshake; identity is fixed from then on.
    let mut session: Option<(String, Arc<ClientConnection>)> = None;

    while let Some(incoming) = ws_receiver.next().await {
        match incoming {
            Ok(Message::Text(text)) => {
                let frame = match ClientFrame::from_text(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("dropping malformed frame: {}", e);
                        continue;
                    }
                };

                match frame {
                    ClientFrame::Join {
                        room_id,
                        user_type,
                        device_id,
                        profile,
                    } => {
                        if session.is_some() {
                            warn!("duplicate join on an established connection; ignored");
                            continue;
                        }
                        let result = state.registry.join(
                            &room_id,
                            user_type,
                            &device_id,
                            profile,
                            tx.clone(),
                        );
                        result.connection.send(ServerFrame::Joined {
                            room_id: room_id.clone(),
                            is_initiator: result.is_initiator,
                            peer_count: result.peer_count,
                            peer_profile: result.peer_profile,
                            peer_online: result.peer_online,
                        });
                        session = Some((room_id, result.connection));
                    }
                    frame => match &session {
                        Some((room_id, connection)) => {
                            state.router.route(room_id, connection, frame)
                        }
                        None => debug!("dropping frame from connection with no identity"),
                    },
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        }
    }

    if let Some((room_id, connection)) = session {
        state.registry.disconnect(&room_id, connection.id);
    }
    send_task.abort();
}
