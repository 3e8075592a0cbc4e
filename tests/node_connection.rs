use async_trait::async_trait;
use axum::{
    extract::{Query, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response as HttpResponse},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request as Handshake, Response},
        http::StatusCode,
        Message,
    },
};

use solarlink::{
    config::{NodeConfig, ReconnectPolicy},
    model::{ChannelId, GuildId, LoadType, UserId},
    DefaultEventHandler, Error, EventHandler, Node, SolarClient, VoiceGateway,
};

struct NoopGateway;

#[async_trait]
impl VoiceGateway for NoopGateway {
    fn user_id(&self) -> UserId {
        UserId::new(42)
    }

    fn shard_count(&self) -> u32 {
        2
    }

    async fn change_voice_state(&self, _guild_id: GuildId, _channel_id: Option<ChannelId>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps every reported error as `location: error`.
#[derive(Default)]
struct RecordingHandler {
    errors: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn error(&self, location: &str, err: &Error) {
        self.errors.lock().push(format!("{location}: {err}"));
    }
}

fn policy(read_timeout: Duration) -> ReconnectPolicy {
    ReconnectPolicy {
        connect_timeout: Duration::from_secs(5),
        read_timeout,
        unreachable_delay: Duration::from_millis(20),
        retry_delay: Duration::from_millis(20),
    }
}

fn client() -> SolarClient {
    SolarClient::with_policy(
        Arc::new(NoopGateway),
        Arc::new(DefaultEventHandler),
        policy(Duration::from_secs(5)),
    )
}

fn stats_frame() -> Message {
    Message::Text(
        json!({
            "op": "stats",
            "players": 2,
            "playingPlayers": 1,
            "uptime": 60000,
            "memory": { "free": 1, "used": 2, "allocated": 3, "reservable": 4 },
            "cpu": { "cores": 4, "systemLoad": 0.1, "lavalinkLoad": 0.05 }
        })
        .to_string(),
    )
}

/// What the fake node does with one incoming connection.
#[derive(Clone)]
enum Step {
    /// Accept, send the frames, then read until the client leaves.
    Serve(Vec<Message>),
    /// Accept and close the socket normally.
    CleanClose,
    /// Refuse the handshake.
    Reject(StatusCode),
}

/// A fake node following `script`, one step per connection. Once the
/// script runs out every connection is served a stats frame.
///
/// Handshake headers and every text frame the node receives are forwarded
/// on the returned channel; handshakes carry an `authorization` key.
async fn lavalink(script: Vec<Step>) -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut script = script.into_iter();
        while let Ok((stream, _)) = listener.accept().await {
            let step = script.next().unwrap_or_else(|| Step::Serve(vec![stats_frame()]));
            tokio::spawn(serve_connection(stream, step, tx.clone()));
        }
    });

    (addr, rx)
}

async fn serve_connection(stream: tokio::net::TcpStream, step: Step, tx: mpsc::UnboundedSender<Value>) {
    let headers = tx.clone();
    let reject = match &step {
        Step::Reject(status) => Some(*status),
        _ => None,
    };
    let callback = move |request: &Handshake, response: Response| -> Result<Response, ErrorResponse> {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let _ = headers.send(json!({
            "authorization": header("Authorization"),
            "userId": header("User-Id"),
            "numShards": header("Num-Shards"),
            "resumeKey": header("Resume-Key"),
        }));

        match reject {
            Some(status) => Err(tokio_tungstenite::tungstenite::http::Response::builder()
                .status(status)
                .body(None)
                .unwrap()),
            None => Ok(response),
        }
    };

    let Ok(mut socket) = accept_hdr_async(stream, callback).await else {
        return;
    };

    match step {
        Step::Serve(frames) => {
            for frame in frames {
                if socket.send(frame).await.is_err() {
                    return;
                }
            }
        }
        Step::CleanClose => {
            let _ = socket.close(None).await;
        }
        Step::Reject(_) => return,
    }

    while let Some(Ok(message)) = socket.next().await {
        if let Message::Text(text) = message {
            let _ = tx.send(serde_json::from_str(&text).unwrap());
        }
    }
}

/// Handshakes seen so far, dropping any other frame.
fn handshakes(frames: &mut mpsc::UnboundedReceiver<Value>) -> usize {
    let mut count = 0;
    while let Ok(frame) = frames.try_recv() {
        if frame.get("authorization").is_some() {
            count += 1;
        }
    }
    count
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn test_connect_sends_identity_and_reads_stats() {
    let (addr, mut frames) = lavalink(Vec::new()).await;
    let client = client();

    let config = NodeConfig::new("127.0.0.1", addr.port(), "pw").with_resume_key("abc");
    let node = client.connect_node(config).await.unwrap();
    assert!(node.available());

    let headers = frames.recv().await.unwrap();
    assert_eq!(
        headers,
        json!({ "authorization": "pw", "userId": "42", "numShards": "2", "resumeKey": "abc" })
    );

    let resuming = frames.recv().await.unwrap();
    assert_eq!(resuming, json!({ "op": "configureResuming", "key": "abc", "timeout": 60 }));

    wait_for(|| node.stats().is_some()).await;
    let stats = node.stats().unwrap();
    assert_eq!(stats.playing_players, 1);
    assert!(node.penalty() < 10.0);
    assert_eq!(client.find_ideal_node(None).map(|n| n.address()), Some(node.address()));

    client.stop();
    wait_for(|| !node.available()).await;
}

#[tokio::test]
async fn test_rejected_credentials_are_fatal() {
    let (addr, _frames) = lavalink(vec![Step::Reject(StatusCode::UNAUTHORIZED)]).await;
    let client = client();

    let config = NodeConfig::new("127.0.0.1", addr.port(), "wrong").with_reconnect_attempts(5);
    let err = client.connect_node(config).await.unwrap_err();

    assert!(matches!(err, Error::Authentication { status: 401, .. }));
    assert!(client.nodes().is_empty());
}

#[tokio::test]
async fn test_clean_close_reconnects_without_spending_attempts() {
    // With two attempts, the failed handshake after the close only leaves
    // one to spend if the close itself cost nothing.
    let (addr, mut frames) = lavalink(vec![
        Step::CleanClose,
        Step::Reject(StatusCode::INTERNAL_SERVER_ERROR),
    ])
    .await;
    let client = client();

    let node = client.add_node(NodeConfig::new("127.0.0.1", addr.port(), "pw").with_reconnect_attempts(2));

    wait_for(|| node.stats().is_some()).await;
    assert!(node.available());
    assert_eq!(node.reconnect_attempts(), 2);
    assert_eq!(handshakes(&mut frames), 3);

    client.stop();
}

#[tokio::test]
async fn test_unknown_operation_is_reported_and_reading_continues() {
    let (addr, _frames) = lavalink(vec![Step::Serve(vec![
        Message::Text(json!({ "op": "mystery" }).to_string()),
        stats_frame(),
    ])])
    .await;
    let handler = Arc::new(RecordingHandler::default());
    let client = SolarClient::with_policy(Arc::new(NoopGateway), handler.clone(), policy(Duration::from_secs(5)));

    let node = client
        .connect_node(NodeConfig::new("127.0.0.1", addr.port(), "pw"))
        .await
        .unwrap();

    wait_for(|| node.stats().is_some()).await;
    wait_for(|| !handler.errors.lock().is_empty()).await;
    assert_eq!(
        handler.errors.lock().clone(),
        vec![format!("node 127.0.0.1:{}: unknown operation `mystery`", addr.port())]
    );
    assert!(node.available());

    client.stop();
}

#[tokio::test]
async fn test_silent_node_is_reconnected_after_read_timeout() {
    let (addr, mut frames) = lavalink(vec![Step::Serve(Vec::new())]).await;
    let client = SolarClient::with_policy(
        Arc::new(NoopGateway),
        Arc::new(DefaultEventHandler),
        policy(Duration::from_millis(300)),
    );

    let node = client
        .connect_node(NodeConfig::new("127.0.0.1", addr.port(), "pw"))
        .await
        .unwrap();
    assert!(node.stats().is_none());

    // Stats only come from the second socket.
    wait_for(|| node.stats().is_some()).await;
    assert!(handshakes(&mut frames) >= 2);
    assert_eq!(node.reconnect_attempts(), 3);

    client.stop();
}

#[tokio::test]
async fn test_rest_needs_a_connected_node() {
    let client = client();
    let err = client.get_tracks("ytsearch:anything").await.unwrap_err();
    assert!(matches!(err, Error::NoAvailableNodes));
}

fn track_json(id: &str) -> Value {
    json!({
        "track": format!("QAAA{id}"),
        "info": {
            "identifier": id,
            "isSeekable": true,
            "author": "solarlink",
            "length": 60000,
            "isStream": false,
            "position": 0,
            "title": id,
            "uri": format!("https://example.com/{id}"),
            "sourceName": "http"
        }
    })
}

/// Requests the REST node accepted: the endpoint plus its query or body.
#[derive(Clone)]
struct Seen(mpsc::UnboundedSender<Value>);

async fn require_password(request: Request, next: Next) -> HttpResponse {
    let password = request
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    match password.as_str() {
        "pw" => next.run(request).await,
        "banned" => axum::http::StatusCode::FORBIDDEN.into_response(),
        _ => axum::http::StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn load_tracks(State(seen): State<Seen>, Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    let _ = seen.0.send(json!({ "loadtracks": query }));
    Json(json!({ "loadType": "SEARCH_RESULT", "tracks": [track_json("a"), track_json("b")] }))
}

async fn decode_track(State(seen): State<Seen>, Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    let _ = seen.0.send(json!({ "decodetrack": query }));
    Json(track_json("a")["info"].clone())
}

async fn decode_tracks(State(seen): State<Seen>, Json(body): Json<Vec<String>>) -> Json<Value> {
    let _ = seen.0.send(json!({ "decodetracks": body }));
    Json(json!([track_json("a"), track_json("b")]))
}

async fn no_route_planner(State(seen): State<Seen>, body: String) -> axum::http::StatusCode {
    let _ = seen.0.send(json!({ "routeplanner": body }));
    axum::http::StatusCode::INTERNAL_SERVER_ERROR
}

/// An HTTP-only node without a route planner. Its WebSocket endpoint does
/// not exist, so the node built on it gives up right away and only its
/// REST side is usable.
async fn rest_node(password: &str) -> (SolarClient, Arc<Node>, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/loadtracks", get(load_tracks))
        .route("/decodetrack", get(decode_track))
        .route("/decodetracks", post(decode_tracks))
        .route("/routeplanner/status", get(no_route_planner))
        .route("/routeplanner/free/address", post(no_route_planner))
        .route("/routeplanner/free/all", post(no_route_planner))
        .layer(middleware::from_fn(require_password))
        .with_state(Seen(tx));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = client();
    let node = client.add_node(NodeConfig::new("127.0.0.1", port, password).with_reconnect_attempts(0));
    (client, node, rx)
}

#[tokio::test]
async fn test_rest_requests() {
    let (client, node, mut seen) = rest_node("pw").await;

    let loaded = node.load_tracks("ytsearch:never gonna & co").await.unwrap();
    assert_eq!(loaded.load_type, LoadType::SearchResult);
    assert_eq!(loaded.tracks.len(), 2);
    assert_eq!(
        seen.recv().await.unwrap(),
        json!({ "loadtracks": { "identifier": "ytsearch:never gonna & co" } })
    );

    let info = node.decode_track("QAAA+a/b=").await.unwrap();
    assert_eq!(info.identifier, "a");
    assert_eq!(seen.recv().await.unwrap(), json!({ "decodetrack": { "track": "QAAA+a/b=" } }));

    let tracks = node
        .decode_tracks(&["QAAAa".to_string(), "QAAAb".to_string()])
        .await
        .unwrap();
    assert_eq!(tracks.iter().map(|t| t.encoded.as_str()).collect::<Vec<_>>(), vec!["QAAAa", "QAAAb"]);
    assert_eq!(seen.recv().await.unwrap(), json!({ "decodetracks": ["QAAAa", "QAAAb"] }));

    client.stop();
}

#[tokio::test]
async fn test_route_planner_missing_on_server_error() {
    let (client, node, mut seen) = rest_node("pw").await;

    assert_eq!(node.route_planner_status().await.unwrap(), None);
    seen.recv().await.unwrap();

    assert!(!node.route_planner_free_address("10.0.0.1").await.unwrap());
    let request = seen.recv().await.unwrap();
    let body: Value = serde_json::from_str(request["routeplanner"].as_str().unwrap()).unwrap();
    assert_eq!(body, json!({ "address": "10.0.0.1" }));

    assert!(!node.route_planner_free_all().await.unwrap());

    client.stop();
}

#[tokio::test]
async fn test_rest_rejected_credentials() {
    let (client, node, mut seen) = rest_node("wrong").await;
    let err = node.load_tracks("ytsearch:anything").await.unwrap_err();
    assert!(matches!(err, Error::Authentication { status: 401, .. }));
    client.stop();

    let (client, node, _) = rest_node("banned").await;
    let err = node.route_planner_free_all().await.unwrap_err();
    assert!(matches!(err, Error::Authentication { status: 403, .. }));
    client.stop();

    assert!(seen.try_recv().is_err());
}
