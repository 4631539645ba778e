//! Media-bridge session over a WebSocket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::config::Config;
use parley_core::frame::Frame;
use parley_core::session::SessionParams;
use parley_core::types::{MembershipEventKind, Participant};
use parley_pipeline::{
    MembershipHandler, MembershipHub, SubscriptionId, Transport, TransportConnector, TransportError,
};

use crate::protocol::BridgeMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bridge endpoint for a meeting.
///
/// A bare host gets `wss://` (or `ws://` when `insecure`); `http(s)://` is
/// mapped onto `ws(s)://`.
pub fn bridge_url(callback_address: &str, meeting_id: &str, insecure: bool) -> String {
    let base = callback_address.trim().trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if base.contains("://") {
        base.to_string()
    } else if insecure {
        format!("ws://{base}")
    } else {
        format!("wss://{base}")
    };
    format!("{base}/meetings/{meeting_id}")
}

/// One meeting connection. Binary messages are audio, text messages are
/// [`BridgeMessage`] envelopes.
pub struct WsTransport {
    id: String,
    meeting_id: String,
    account_id: String,
    writer: Mutex<SplitSink<WsStream, Message>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Frame>>,
    hub: Arc<MembershipHub>,
    joined: AtomicBool,
    closed: CancellationToken,
}

impl WsTransport {
    /// Wrap an established socket and start its reader task.
    fn spawn(id: String, params: &SessionParams, stream: WsStream) -> Arc<Self> {
        let (writer, reader) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Arc::new(MembershipHub::new());
        let closed = CancellationToken::new();

        tokio::spawn(read_loop(
            id.clone(),
            reader,
            tx,
            hub.clone(),
            closed.clone(),
        ));

        Arc::new(Self {
            id,
            meeting_id: params.meeting_id.clone(),
            account_id: params.account_id.clone(),
            writer: Mutex::new(writer),
            inbound: Mutex::new(rx),
            hub,
            joined: AtomicBool::new(false),
            closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn write(&self, message: Message) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        match writer.send(message).await {
            Ok(()) => Ok(()),
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                self.closed.cancel();
                Err(TransportError::Closed)
            }
            Err(e) => Err(TransportError::Send(e.to_string())),
        }
    }

    async fn write_envelope(&self, message: &BridgeMessage) -> Result<(), TransportError> {
        let json =
            serde_json::to_string(message).map_err(|e| TransportError::Send(e.to_string()))?;
        self.write(Message::Text(json.into())).await
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn read_loop(
    id: String,
    mut reader: SplitStream<WsStream>,
    inbound: mpsc::UnboundedSender<Frame>,
    hub: Arc<MembershipHub>,
    closed: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = reader.next() => message,
        };

        match message {
            Some(Ok(Message::Binary(data))) => {
                if inbound.send(Frame::Audio(data)).is_err() {
                    break;
                }
            }
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<BridgeMessage>(text.as_str()) {
                    Ok(BridgeMessage::Text { text }) => {
                        if inbound.send(Frame::Text(text)).is_err() {
                            break;
                        }
                    }
                    Ok(other) => match other.membership() {
                        Some(event) => hub.publish(event),
                        None => debug!(transport = %id, "Ignoring control message from bridge"),
                    },
                    Err(e) => warn!(transport = %id, error = %e, "Invalid bridge message"),
                }
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(transport = %id, ?frame, "Bridge closed the session");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(transport = %id, error = %e, "Bridge socket error");
                break;
            }
            None => break,
        }
    }

    closed.cancel();
    debug!(transport = %id, "Bridge reader stopped");
}

#[async_trait]
impl Transport for WsTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn join(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.write_envelope(&BridgeMessage::Join {
            meeting_id: self.meeting_id.clone(),
            account_id: self.account_id.clone(),
        })
        .await
        .map_err(|e| match e {
            TransportError::Send(reason) => TransportError::Join(reason),
            other => other,
        })?;
        self.joined.store(true, Ordering::SeqCst);
        info!(transport = %self.id, meeting_id = %self.meeting_id, "Joined meeting");
        Ok(())
    }

    async fn leave(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Ok(());
        }
        if self.joined.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.write_envelope(&BridgeMessage::Leave).await {
                debug!(transport = %self.id, error = %e, "Leave message not delivered");
            }
        }
        let _ = self.write(Message::Close(None)).await;
        self.closed.cancel();
        info!(transport = %self.id, "Left meeting");
        Ok(())
    }

    fn subscribe(&self, kind: MembershipEventKind, handler: MembershipHandler) -> SubscriptionId {
        self.hub.subscribe(kind, handler)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.hub.unsubscribe(id);
    }

    fn participants(&self) -> Vec<Participant> {
        self.hub.participants()
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if !self.joined.load(Ordering::SeqCst) {
            return Err(TransportError::NotJoined);
        }
        match frame {
            Frame::Audio(data) => self.write(Message::Binary(data)).await,
            Frame::Text(text) => self.write_envelope(&BridgeMessage::Text { text }).await,
        }
    }

    async fn recv(&self) -> Option<Result<Frame, TransportError>> {
        // The reader drops its sender on exit, so buffered frames drain first.
        self.inbound.lock().await.recv().await.map(Ok)
    }
}

/// Dials the media bridge for each new session.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
    insecure: bool,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration, insecure: bool) -> Self {
        Self {
            connect_timeout,
            insecure,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.connect_timeout(), config.transport_insecure())
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    async fn connect(&self, params: &SessionParams) -> Result<Arc<dyn Transport>, TransportError> {
        let url = bridge_url(&params.callback_address, &params.meeting_id, self.insecure);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("invalid bridge URL {url}: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", params.auth_token.trim()))
            .map_err(|e| TransportError::Connect(format!("invalid auth token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        debug!(session_id = %params.session_id, %url, "Connecting to media bridge");
        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "timed out after {}ms connecting to {url}",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| TransportError::Connect(format!("{url}: {e}")))?;

        info!(session_id = %params.session_id, %url, "Connected to media bridge");
        let transport: Arc<dyn Transport> =
            WsTransport::spawn(format!("ws-{}", params.session_id), params, stream);
        Ok(transport)
    }
}
