// ============================
// crates/mesh-client/src/relay.rs
// ============================
//! WebSocket connection to the signaling relay, with reconnects.
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meetroom_common::{ClientMessage, ServerMessage};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::MeshError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// Maximum number of reconnection attempts
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
// Delay between reconnection attempts, multiplied by the attempt number
pub const RECONNECT_DELAY_MS: u64 = 1000;
const MAX_JITTER_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// e.g. `ws://127.0.0.1:3000/ws`
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub max_jitter: Duration,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        RelayConfig {
            url: url.into(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
            max_jitter: Duration::from_millis(MAX_JITTER_MS),
        }
    }

    /// Linear backoff plus random jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        self.reconnect_delay * attempt + jitter
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// A socket is up; `reconnect` is false only for the first one
    Connected { reconnect: bool },
    Message(ServerMessage),
    Failed,
}

/// Handle to the background relay task
#[derive(Debug)]
pub struct RelayClient {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    state: watch::Receiver<RelayState>,
    task: JoinHandle<()>,
}

impl RelayClient {
    /// Open the first connection and start pumping.
    ///
    /// The first connection must succeed; later drops are retried in the
    /// background.
    pub async fn connect(config: RelayConfig) -> Result<(Self, mpsc::UnboundedReceiver<RelayEvent>), MeshError> {
        let (state_tx, state) = watch::channel(RelayState::Connecting);
        let (ws, _) = connect_async(config.url.as_str()).await?;
        info!(url = %config.url, "connected to relay");
        state_tx.send_replace(RelayState::Connected);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let _ = events_tx.send(RelayEvent::Connected { reconnect: false });

        let task = tokio::spawn(run(config, ws, outbound_rx, events_tx, state_tx));
        Ok((RelayClient { outbound, state, task }, events))
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outbound.clone()
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), MeshError> {
        Ok(self.outbound.send(message)?)
    }

    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RelayState> {
        self.state.clone()
    }

    pub fn close(self) {
        self.task.abort();
    }
}

async fn run(
    config: RelayConfig,
    mut ws: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
    state_tx: watch::Sender<RelayState>,
) {
    loop {
        if pump(&mut ws, &mut outbound_rx, &events_tx).await == PumpExit::Shutdown {
            let _ = ws.close(None).await;
            debug!("relay pump stopped");
            return;
        }

        match reconnect(&config, &state_tx).await {
            Some(fresh) => {
                ws = fresh;
                // queued signals addressed the previous session
                let mut dropped = 0;
                while outbound_rx.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    debug!(dropped, "discarded stale outbound messages");
                }
                state_tx.send_replace(RelayState::Connected);
                if events_tx.send(RelayEvent::Connected { reconnect: true }).is_err() {
                    return;
                }
            },
            None => {
                error!(url = %config.url, "relay unreachable, giving up");
                state_tx.send_replace(RelayState::Failed);
                let _ = events_tx.send(RelayEvent::Failed);
                return;
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    /// The socket dropped
    Lost,
    /// The owner went away
    Shutdown,
}

async fn pump(
    ws: &mut WsStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events_tx: &mpsc::UnboundedSender<RelayEvent>,
) -> PumpExit {
    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(message) = outgoing else {
                    return PumpExit::Shutdown;
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "failed to serialize client message");
                        continue;
                    },
                };
                if let Err(e) = ws.send(Message::Text(text.into())).await {
                    warn!(error = %e, "relay write failed");
                    return PumpExit::Lost;
                }
            },
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => {
                        if events_tx.send(RelayEvent::Message(message)).is_err() {
                            return PumpExit::Shutdown;
                        }
                    },
                    Err(e) => warn!(error = %e, "unparseable relay frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("relay closed the connection");
                    return PumpExit::Lost;
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    warn!(error = %e, "relay read failed");
                    return PumpExit::Lost;
                },
            },
        }
    }
}

async fn reconnect(config: &RelayConfig, state_tx: &watch::Sender<RelayState>) -> Option<WsStream> {
    for attempt in 1..=config.max_reconnect_attempts {
        state_tx.send_replace(RelayState::Reconnecting { attempt });
        let delay = config.backoff(attempt);
        info!(attempt, max = config.max_reconnect_attempts, ?delay, "reconnecting to relay");
        time::sleep(delay).await;

        match connect_async(config.url.as_str()).await {
            Ok((ws, _)) => {
                info!(attempt, "reconnected to relay");
                return Some(ws);
            },
            Err(e) => warn!(attempt, error = %e, "reconnect failed"),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast(url: String) -> RelayConfig {
        RelayConfig {
            max_reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(10),
            max_jitter: Duration::from_millis(5),
            ..RelayConfig::new(url)
        }
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<RelayEvent>) -> RelayEvent {
        time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a relay event")
            .expect("relay event stream ended")
    }

    #[test]
    fn test_backoff_is_linear_with_bounded_jitter() {
        let config = RelayConfig::new("ws://unused");
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let delay = config.backoff(attempt);
            let floor = Duration::from_millis(RECONNECT_DELAY_MS * u64::from(attempt));
            assert!(delay >= floor);
            assert!(delay <= floor + Duration::from_millis(MAX_JITTER_MS));
        }
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            // first socket: read one frame, then drop it
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            drop(ws);

            // second socket: push a frame to the client
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"type":"pong"}"#.into())).await.unwrap();
            let _ = ws.next().await;
            first
        });

        let (client, mut events) = RelayClient::connect(fast(url)).await.unwrap();
        assert_eq!(next(&mut events).await, RelayEvent::Connected { reconnect: false });
        client.send(ClientMessage::Ping).unwrap();

        assert_eq!(next(&mut events).await, RelayEvent::Connected { reconnect: true });
        assert_eq!(next(&mut events).await, RelayEvent::Message(ServerMessage::Pong));
        assert_eq!(client.state(), RelayState::Connected);

        client.close();
        let first = server.await.unwrap();
        assert_eq!(first.into_text().unwrap().as_str(), r#"{"type":"ping"}"#);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // dropping the listener refuses every reconnect
            drop(listener);
            drop(ws);
        });

        let (client, mut events) = RelayClient::connect(fast(url)).await.unwrap();
        let mut state = client.watch_state();
        assert_eq!(next(&mut events).await, RelayEvent::Connected { reconnect: false });
        server.await.unwrap();

        assert_eq!(next(&mut events).await, RelayEvent::Failed);
        state.wait_for(|s| *s == RelayState::Failed).await.unwrap();
    }

    #[tokio::test]
    async fn test_first_connect_failure_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = RelayClient::connect(fast(url)).await.unwrap_err();
        assert!(matches!(err, MeshError::Relay(_)));
    }
}
