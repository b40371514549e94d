use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use canvas::{Canvas, CanvasListener, Color, Point, Rect};
use session::{SessionClient, SessionConfig};
use tokio::time::timeout;

#[derive(Default)]
struct RecordingCanvas {
    pixels: Mutex<Vec<(Point, Color)>>,
    invalidations: AtomicU32,
}

impl Canvas for RecordingCanvas {
    fn chunk_size(&self) -> (u32, u32) {
        session::CHUNK_SIZE
    }

    fn origin(&self) -> Point {
        Point::default()
    }

    fn subscribe_listener(&self, _listener: Arc<dyn CanvasListener>, _manage_virtual_chunks: bool) {
    }

    fn unsubscribe_listener(&self, _listener: &Arc<dyn CanvasListener>) {}

    fn register_rects(&self, _listener: &Arc<dyn CanvasListener>, _rects: &[Rect]) {}

    fn set_pixel(&self, pos: Point, color: Color) {
        self.pixels.lock().unwrap().push((pos, color));
    }

    fn invalidate_all(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}

async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        // junk first: the client must survive it and decode what follows
        let _ = socket.send(Message::Binary(vec![0x99, 0x01])).await;
        let _ = socket.send(Message::Binary(vec![0xC1, 0x00, 0x00])).await;
        let _ = socket
            .send(Message::Binary(vec![0xC1, 0x00, 0x01, 0xFF, 0xFF, 0x04, 0x15]))
            .await;
        // hold the connection open until the peer closes
        while let Some(Ok(_)) = socket.recv().await {}
    })
}

async fn serve_mock() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ws_url = format!("ws://{addr}/ws");

    let app = Router::new()
        .route(
            "/api/online",
            get(|| async { Json(serde_json::json!({ "online": 7 })) }),
        )
        .route(
            "/api/ws",
            get(move || async move { Json(serde_json::json!({ "url": ws_url })) }),
        )
        .route(
            "/api/me",
            post(|| async {
                Json(serde_json::json!({
                    "id": "u-1",
                    "name": "tester",
                    "center": [3, -4],
                    "waitSeconds": 0.25,
                }))
            }),
        )
        .route("/ws", get(ws_handler));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn delivers_pixels_and_shuts_down_cleanly() {
    let addr = serve_mock().await;
    let canvas = Arc::new(RecordingCanvas::default());
    let client = SessionClient::connect(
        SessionConfig {
            base_url: format!("http://{addr}"),
            fingerprint: "f".repeat(32),
        },
        canvas.clone(),
    );

    wait_until("a pixel from the mock socket", || {
        !canvas.pixels.lock().unwrap().is_empty()
    })
    .await;
    {
        let pixels = canvas.pixels.lock().unwrap();
        assert_eq!(pixels.len(), 1, "malformed frames must be dropped");
        assert_eq!(pixels[0].0, Point::new(65, -63));
        assert_eq!(pixels[0].1, Color::from_rgb8(229, 0, 0));
    }

    wait_until("the online-player count", || client.online_players() == 7).await;

    let identity = client.authenticate_me().await.unwrap();
    assert_eq!(identity.id, "u-1");
    assert_eq!(identity.name, "tester");
    assert_eq!(client.auth_identity(), Some(identity));
    assert_eq!(client.center(), Point::new(3, -4));
    assert!(client.next_action_at().is_some());
    assert!(client.is_open());

    timeout(Duration::from_secs(5), client.shutdown())
        .await
        .expect("shutdown hung");
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_loss_invalidates_the_canvas() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ws_url = format!("ws://{addr}/ws");

    let app = Router::new()
        .route(
            "/api/online",
            get(|| async { Json(serde_json::json!({ "online": 1 })) }),
        )
        .route(
            "/api/ws",
            get(move || async move { Json(serde_json::json!({ "url": ws_url })) }),
        )
        .route(
            "/ws",
            get(|ws: WebSocketUpgrade| async {
                ws.on_upgrade(|mut socket: WebSocket| async move {
                    let _ = socket
                        .send(Message::Binary(vec![0xC1, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]))
                        .await;
                    // dropping the socket ends the connection from our side
                })
            }),
        );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let canvas = Arc::new(RecordingCanvas::default());
    let client = SessionClient::connect(
        SessionConfig {
            base_url: format!("http://{addr}"),
            fingerprint: "f".repeat(32),
        },
        canvas.clone(),
    );

    wait_until("the connection-loss invalidation", || {
        canvas.invalidations.load(Ordering::Relaxed) >= 1
    })
    .await;
    assert!(!canvas.pixels.lock().unwrap().is_empty());

    timeout(Duration::from_secs(5), client.shutdown())
        .await
        .expect("shutdown hung");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_terminates_without_reachable_service() {
    let canvas = Arc::new(RecordingCanvas::default());
    let client = SessionClient::connect(
        SessionConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            fingerprint: "f".repeat(32),
        },
        canvas,
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    timeout(Duration::from_secs(5), client.shutdown())
        .await
        .expect("shutdown hung");
}

#[tokio::test(flavor = "multi_thread")]
async fn authentication_failure_is_surfaced_not_fatal() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route(
        "/api/me",
        post(|| async { (axum::http::StatusCode::FORBIDDEN, "nope") }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let canvas = Arc::new(RecordingCanvas::default());
    let client = SessionClient::connect(
        SessionConfig {
            base_url: format!("http://{addr}"),
            fingerprint: "f".repeat(32),
        },
        canvas,
    );

    match client.authenticate_me().await {
        Err(session::SessionError::Auth { status: 403, body }) => assert_eq!(body, "nope"),
        other => panic!("expected an auth failure, got {other:?}"),
    }

    timeout(Duration::from_secs(5), client.shutdown())
        .await
        .expect("shutdown hung");
}
