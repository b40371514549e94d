use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canvas::{Canvas, Point};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::SessionError;
use crate::palette;
use crate::wire::{self, WireMessage};

/// Chunk dimensions the service addresses pixels in.
pub const CHUNK_SIZE: (u32, u32) = (64, 64);

const STATUS_INTERVAL: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Service root without a trailing slash, e.g. `https://pixelcanvas.io`.
    pub base_url: String,
    pub fingerprint: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://pixelcanvas.io".to_string(),
            fingerprint: "1".repeat(32),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthIdentity {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Default)]
struct AuthState {
    identity: Option<AuthIdentity>,
    center: Point,
    next_action_at: Option<DateTime<Utc>>,
}

struct Shared {
    http: reqwest::Client,
    base_url: String,
    fingerprint: String,
    online_players: AtomicU32,
    auth: Mutex<AuthState>,
    canvas: Arc<dyn Canvas>,
}

/// One logical connection to the live-update endpoint.
///
/// Two tasks run from `connect` until `shutdown`: a status loop polling the
/// online-player count, and a connection loop that keeps a websocket open,
/// reconnecting with a fixed backoff, and forwards decoded pixel events to
/// the canvas. Connection-level failures never escape the loops; they are
/// logged and retried.
pub struct SessionClient {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    status_task: JoinHandle<()>,
    connection_task: JoinHandle<()>,
}

impl SessionClient {
    /// Spawns the client's loops. Must be called from within a tokio
    /// runtime.
    pub fn connect(config: SessionConfig, canvas: Arc<dyn Canvas>) -> Self {
        let shared = Arc::new(Shared {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            fingerprint: config.fingerprint,
            online_players: AtomicU32::new(0),
            auth: Mutex::new(AuthState::default()),
            canvas,
        });
        let cancel = CancellationToken::new();

        let status_task = tokio::spawn(status_loop(shared.clone(), cancel.clone()));
        let connection_task = tokio::spawn(connection_loop(shared.clone(), cancel.clone()));

        Self {
            shared,
            cancel,
            status_task,
            connection_task,
        }
    }

    /// Last stored online-player count.
    pub fn online_players(&self) -> u32 {
        self.shared.online_players.load(Ordering::Relaxed)
    }

    /// False once shutdown has been requested.
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn auth_identity(&self) -> Option<AuthIdentity> {
        self.shared.auth.lock().unwrap().identity.clone()
    }

    pub fn center(&self) -> Point {
        self.shared.auth.lock().unwrap().center
    }

    /// Earliest time the next pixel placement is allowed, if known.
    pub fn next_action_at(&self) -> Option<DateTime<Utc>> {
        self.shared.auth.lock().unwrap().next_action_at
    }

    /// One-shot handshake: posts the fingerprint and stores the returned
    /// identity, center and action cooldown.
    pub async fn authenticate_me(&self) -> Result<AuthIdentity, SessionError> {
        let url = format!("{}/api/me", self.shared.base_url);
        let response = self
            .shared
            .http
            .post(&url)
            .json(&MeRequest {
                fingerprint: self.shared.fingerprint.clone(),
            })
            .send()
            .await
            .map_err(|source| SessionError::Http {
                url: url.clone(),
                source,
            })?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|source| SessionError::Http {
                url: url.clone(),
                source,
            })?;
        let me = parse_me_response(status, &body)?;

        let identity = AuthIdentity {
            id: me.id,
            name: me.name,
        };
        {
            let mut auth = self.shared.auth.lock().unwrap();
            auth.identity = Some(identity.clone());
            auth.center = Point::new(me.center[0], me.center[1]);
            auth.next_action_at = Some(
                Utc::now() + chrono::Duration::milliseconds((me.wait_seconds * 1000.0) as i64),
            );
        }
        info!(id = %identity.id, name = %identity.name, "authenticated");
        Ok(identity)
    }

    /// Requests shutdown and blocks until both loops have fully exited. No
    /// task outlives this call and no further network I/O is attempted.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.status_task.await;
        let _ = self.connection_task.await;
        info!("session shut down");
    }
}

async fn status_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = refresh_online_players(&shared) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(STATUS_INTERVAL) => {}
        }
    }
}

async fn refresh_online_players(shared: &Shared) {
    let url = format!("{}/api/online", shared.base_url);
    let result = async {
        shared
            .http
            .get(&url)
            .send()
            .await?
            .json::<OnlineResponse>()
            .await
    }
    .await;
    match result {
        Ok(response) => {
            shared
                .online_players
                .store(response.online, Ordering::Relaxed);
            info!(online = response.online, "player count");
        }
        Err(err) => debug!(url = %url, error = %err, "online-player query failed"),
    }
}

async fn connection_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    // the very first attempt connects immediately, every retry waits a
    // fixed delay
    let mut backoff = Duration::ZERO;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(backoff) => {}
        }
        backoff = RECONNECT_DELAY;

        let endpoint = tokio::select! {
            _ = cancel.cancelled() => return,
            resolved = websocket_endpoint(&shared) => match resolved {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    warn!(error = %err, "can't resolve websocket endpoint");
                    continue;
                }
            }
        };

        let ws = tokio::select! {
            _ = cancel.cancelled() => return,
            connected = connect_async(endpoint.as_str()) => match connected {
                Ok((ws, _)) => ws,
                Err(err) => {
                    warn!(endpoint = %endpoint, error = %err, "can't connect to websocket server");
                    continue;
                }
            }
        };
        info!(endpoint = %endpoint, "websocket connected");

        match read_frames(&shared, &cancel, ws).await {
            ReadOutcome::Cancelled => return,
            ReadOutcome::ConnectionLost => {
                // whatever changed while offline is unknown
                shared.canvas.invalidate_all();
            }
        }
    }
}

enum ReadOutcome {
    Cancelled,
    ConnectionLost,
}

async fn read_frames(shared: &Shared, cancel: &CancellationToken, mut ws: WsStream) -> ReadOutcome {
    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break ReadOutcome::Cancelled,
            message = ws.next() => match message {
                Some(Ok(Message::Binary(frame))) => apply_frame(shared, &frame),
                Some(Ok(Message::Close(_))) => {
                    debug!("server closed the connection");
                    break ReadOutcome::ConnectionLost;
                }
                Some(Ok(_)) => {} // pings and text are not part of the protocol
                Some(Err(err)) => {
                    warn!(error = %err, "websocket connection error");
                    break ReadOutcome::ConnectionLost;
                }
                None => break ReadOutcome::ConnectionLost,
            }
        }
    };
    if let ReadOutcome::Cancelled = outcome {
        graceful_close(ws).await;
    }
    outcome
}

/// Sends a normal-closure frame, gives the peer a moment to finish the
/// handshake, then drops the socket regardless.
async fn graceful_close(mut ws: WsStream) {
    if ws.close(None).await.is_err() {
        return;
    }
    let drain = async {
        while let Some(message) = ws.next().await {
            if message.is_err() {
                break;
            }
        }
    };
    if timeout(CLOSE_GRACE, drain).await.is_err() {
        debug!("close handshake timed out, dropping the socket");
    }
}

fn apply_frame(shared: &Shared, frame: &[u8]) {
    match wire::decode(frame) {
        Ok(WireMessage::PixelUpdate(update)) => {
            let (chunk_width, chunk_height) = shared.canvas.chunk_size();
            let pos = Point::new(
                update.chunk_x as i32 * chunk_width as i32 + update.offset_x as i32,
                update.chunk_y as i32 * chunk_height as i32 + update.offset_y as i32,
            );
            match palette::color(update.color_index) {
                Some(color) => {
                    debug!(
                        x = pos.x,
                        y = pos.y,
                        color = update.color_index,
                        "pixel change"
                    );
                    shared.canvas.set_pixel(pos, color);
                }
                None => warn!(color = update.color_index, "pixel update outside palette"),
            }
        }
        // a single bad frame never terminates the session
        Err(err) => warn!(error = %err, "discarding unrecognized frame"),
    }
}

async fn websocket_endpoint(shared: &Shared) -> Result<Url, SessionError> {
    let url = format!("{}/api/ws", shared.base_url);
    let response = shared
        .http
        .get(&url)
        .send()
        .await
        .map_err(|source| SessionError::Http {
            url: url.clone(),
            source,
        })?
        .json::<WsEndpointResponse>()
        .await
        .map_err(|source| SessionError::Http {
            url: url.clone(),
            source,
        })?;
    with_fingerprint(&response.url, &shared.fingerprint)
}

/// Every connection identifies itself by fingerprint in the query string.
fn with_fingerprint(endpoint: &str, fingerprint: &str) -> Result<Url, SessionError> {
    let mut url = Url::parse(endpoint)?;
    url.set_query(Some(&format!("fingerprint={fingerprint}")));
    Ok(url)
}

#[derive(Debug, Deserialize)]
struct OnlineResponse {
    online: u32,
}

#[derive(Debug, Deserialize)]
struct WsEndpointResponse {
    url: String,
}

#[derive(Debug, Serialize)]
struct MeRequest {
    fingerprint: String,
}

#[derive(Debug, Deserialize)]
struct MeResponse {
    id: String,
    name: String,
    center: Vec<i32>,
    #[serde(rename = "waitSeconds")]
    wait_seconds: f32,
}

fn parse_me_response(status: u16, body: &[u8]) -> Result<MeResponse, SessionError> {
    if status != 200 {
        return Err(SessionError::Auth {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        });
    }
    let me: MeResponse = serde_json::from_slice(body).map_err(|err| SessionError::Auth {
        status,
        body: err.to_string(),
    })?;
    if me.center.len() < 2 {
        return Err(SessionError::InvalidCenter);
    }
    Ok(me)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use canvas::{Canvas, CanvasListener, Color, Rect};

    use super::*;

    #[derive(Default)]
    struct CountingCanvas {
        pixels: Mutex<Vec<(Point, Color)>>,
    }

    impl Canvas for CountingCanvas {
        fn chunk_size(&self) -> (u32, u32) {
            CHUNK_SIZE
        }

        fn origin(&self) -> Point {
            Point::default()
        }

        fn subscribe_listener(
            &self,
            _listener: Arc<dyn CanvasListener>,
            _manage_virtual_chunks: bool,
        ) {
        }

        fn unsubscribe_listener(&self, _listener: &Arc<dyn CanvasListener>) {}

        fn register_rects(&self, _listener: &Arc<dyn CanvasListener>, _rects: &[Rect]) {}

        fn set_pixel(&self, pos: Point, color: Color) {
            self.pixels.lock().unwrap().push((pos, color));
        }

        fn invalidate_all(&self) {}
    }

    fn shared_with(canvas: Arc<CountingCanvas>) -> Shared {
        Shared {
            http: reqwest::Client::new(),
            base_url: "http://unused.invalid".to_string(),
            fingerprint: "f".repeat(32),
            online_players: AtomicU32::new(0),
            auth: Mutex::new(AuthState::default()),
            canvas,
        }
    }

    #[test]
    fn malformed_frames_do_not_stop_later_ones() {
        let canvas = Arc::new(CountingCanvas::default());
        let shared = shared_with(canvas.clone());

        apply_frame(&shared, &[0x99, 0x01]); // unknown opcode
        apply_frame(&shared, &[0xC1, 0x00, 0x00]); // short pixel update
        apply_frame(&shared, &[]); // empty
        apply_frame(&shared, &[0xC1, 0x00, 0x01, 0xFF, 0xFF, 0x04, 0x15]);

        let pixels = canvas.pixels.lock().unwrap();
        assert_eq!(pixels.len(), 1);
        assert_eq!(pixels[0].0, Point::new(64 + 1, -64 + 1));
        assert_eq!(pixels[0].1, Color::from_rgb8(229, 0, 0));
    }

    #[test]
    fn parses_authentication_response() {
        let body = br#"{"id":"u-1","name":"tester","center":[3,-4],"waitSeconds":2.5}"#;
        let me = parse_me_response(200, body).unwrap();
        assert_eq!(me.id, "u-1");
        assert_eq!(me.name, "tester");
        assert_eq!(me.center, vec![3, -4]);
        assert_eq!(me.wait_seconds, 2.5);
    }

    #[test]
    fn rejects_bad_authentication_responses() {
        let body = br#"{"id":"u-1","name":"tester","center":[3,-4],"waitSeconds":2.5}"#;
        assert!(matches!(
            parse_me_response(403, body),
            Err(SessionError::Auth { status: 403, .. })
        ));
        assert!(matches!(
            parse_me_response(200, b"not json"),
            Err(SessionError::Auth { status: 200, .. })
        ));

        let short_center = br#"{"id":"u-1","name":"tester","center":[3],"waitSeconds":2.5}"#;
        assert!(matches!(
            parse_me_response(200, short_center),
            Err(SessionError::InvalidCenter)
        ));
    }

    #[test]
    fn fingerprint_replaces_existing_query() {
        let url = with_fingerprint("wss://ws.example.invalid/live?token=abc", "deadbeef").unwrap();
        assert_eq!(url.query(), Some("fingerprint=deadbeef"));
        assert_eq!(url.path(), "/live");
    }
}
