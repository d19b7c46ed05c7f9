//! WebSocket transport built on `tokio-tungstenite`.
//!
//! Frames are JSON text messages of the form `{"event": "...", "data": ...}`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use ridelink_core::error::{AppError, ErrorKind};
use ridelink_core::result::AppResult;

use super::{CloseReason, Transport, TransportConnection, TransportEvent, TransportSink};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default inbound event buffer per connection.
const DEFAULT_EVENT_BUFFER: usize = 256;

/// JSON frame exchanged with the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Opens WebSocket connections authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct WsTransport {
    event_buffer: usize,
}

impl WsTransport {
    /// Create a transport with the default inbound buffer.
    pub fn new() -> Self {
        Self {
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Override the per-connection inbound buffer size.
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str, auth_token: &str) -> AppResult<TransportConnection> {
        let mut request = url.into_client_request().map_err(|e| {
            AppError::with_source(ErrorKind::Validation, format!("Invalid socket URL: {url}"), e)
        })?;
        let bearer = HeaderValue::from_str(&format!("Bearer {auth_token}")).map_err(|e| {
            AppError::with_source(ErrorKind::Validation, "Auth token is not a valid header", e)
        })?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(map_connect_error)?;

        let (writer, reader) = socket.split();
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let closed_by_client = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_loop(reader, tx, Arc::clone(&closed_by_client)));

        debug!(url = %url, "WebSocket transport opened");

        Ok(TransportConnection {
            sink: Arc::new(WsSink {
                writer: Mutex::new(writer),
                closed_by_client,
            }),
            events: rx,
        })
    }
}

fn map_connect_error(err: WsError) -> AppError {
    match &err {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            AppError::with_source(
                ErrorKind::Authentication,
                format!("Server rejected credentials ({})", response.status()),
                err,
            )
        }
        _ => AppError::with_source(
            ErrorKind::Transport,
            format!("WebSocket connect failed: {err}"),
            err,
        ),
    }
}

/// Pumps socket frames into the connection's event channel.
async fn read_loop(
    mut reader: SplitStream<Socket>,
    events: mpsc::Sender<TransportEvent>,
    closed_by_client: Arc<AtomicBool>,
) {
    let reason = loop {
        match reader.next().await {
            Some(Ok(Message::Text(text))) => {
                let event = match serde_json::from_str::<WireFrame>(text.as_str()) {
                    Ok(frame) => TransportEvent::Message {
                        event: frame.event,
                        payload: frame.data,
                    },
                    Err(e) => TransportEvent::Error(format!("Unparseable frame: {e}")),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(frame = ?frame, "Close frame received");
                break if closed_by_client.load(Ordering::SeqCst) {
                    CloseReason::ClientInitiated
                } else {
                    CloseReason::ServerInitiated
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                if closed_by_client.load(Ordering::SeqCst) {
                    break CloseReason::ClientInitiated;
                }
                warn!(error = %e, "WebSocket read failed");
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                break CloseReason::NetworkError;
            }
            None => {
                break if closed_by_client.load(Ordering::SeqCst) {
                    CloseReason::ClientInitiated
                } else {
                    CloseReason::NetworkError
                };
            }
        }
    };

    let _ = events.send(TransportEvent::Closed(reason)).await;
}

/// Write half of a WebSocket connection.
struct WsSink {
    writer: Mutex<SplitSink<Socket, Message>>,
    closed_by_client: Arc<AtomicBool>,
}

impl fmt::Debug for WsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsSink")
            .field("closed_by_client", &self.closed_by_client.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl TransportSink for WsSink {
    async fn send(&self, event: &str, payload: serde_json::Value) -> AppResult<()> {
        if self.closed_by_client.load(Ordering::SeqCst) {
            return Err(AppError::transport("Socket already closed"));
        }
        let frame = WireFrame {
            event: event.to_string(),
            data: payload,
        };
        let text = serde_json::to_string(&frame)?;
        self.writer
            .lock()
            .await
            .send(Message::text(text))
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Transport, format!("Send of {event} failed"), e)
            })
    }

    async fn close(&self) {
        if self.closed_by_client.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.writer.lock().await.close().await {
            debug!(error = %e, "WebSocket close returned an error");
        }
    }
}
