//! Persistent WebSocket channel
//!
//! One background task owns the socket. It connects, relays frames into an
//! event queue, writes outbound frames handed to it by [`ChannelSender`], and
//! on any drop waits out the backoff deadline before the next attempt.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::{Connection, ReconnectPolicy};
use super::{ChannelEvent, ConnectionState, Frame};
use crate::config::Config;
use crate::error::{ConnectError, SendError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the channel task
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket URL
    pub url: String,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    /// Keep-alive ping period
    pub ping_interval: Option<Duration>,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            ping_interval: Some(Duration::from_secs(15)),
        }
    }

    pub fn from_config(url: impl Into<String>, config: &Config) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy {
                base: config.reconnect_base_delay(),
                max: config.reconnect_max_delay(),
            },
            connect_timeout: config.connect_timeout(),
            send_timeout: config.send_timeout(),
            ping_interval: config.ping_interval(),
        }
    }
}

/// Open one WebSocket connection, bounded by `timeout`
pub async fn connect(url: &str, timeout: Duration) -> Result<WsStream, ConnectError> {
    debug!("Connecting to {}", url);
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Err(_) => Err(ConnectError::Timeout {
            url: url.to_string(),
            timeout,
        }),
        Ok(Err(e)) => Err(ConnectError::from_ws(e, url)),
        Ok(Ok((ws_stream, _response))) => Ok(ws_stream),
    }
}

/// Frame queued for the socket writer, with a slot for the outcome
struct Outbound {
    message: Message,
    ack: oneshot::Sender<Result<(), SendError>>,
}

/// Cloneable handle for sending frames to the server
#[derive(Clone)]
pub struct ChannelSender {
    outbound: mpsc::Sender<Outbound>,
    status: watch::Receiver<ConnectionState>,
    send_timeout: Duration,
}

impl ChannelSender {
    /// Send one frame; UTF-8 payloads go out as text, anything else as binary
    ///
    /// Fails immediately when not connected and never waits longer than the
    /// configured send timeout.
    pub async fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<(), SendError> {
        if *self.status.borrow() != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }

        let message = match String::from_utf8(bytes.into()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };

        let (ack, done) = oneshot::channel();
        let attempt = async {
            self.outbound
                .send(Outbound { message, ack })
                .await
                .map_err(|_| SendError::NotConnected)?;
            done.await.map_err(|_| SendError::NotConnected)?
        };

        tokio::time::timeout(self.send_timeout, attempt)
            .await
            .map_err(|_| SendError::Timeout(self.send_timeout))?
    }

    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }
}

/// Handle to the running channel task
pub struct TransportChannel {
    events: mpsc::Receiver<ChannelEvent>,
    sender: ChannelSender,
    status: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl TransportChannel {
    /// Next channel event; `None` once the channel has shut down
    pub async fn receive(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Next already-queued event, without waiting
    pub fn try_receive(&mut self) -> Option<ChannelEvent> {
        self.events.try_recv().ok()
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Wait for the task to finish (after the cancellation token fired)
    ///
    /// Unread events are discarded so a full queue cannot hold the task.
    pub async fn join(self) {
        let TransportChannel { events, task, .. } = self;
        drop(events);
        if let Err(e) = task.await {
            warn!("Channel task ended abnormally: {}", e);
        }
    }
}

/// Spawn the channel task
///
/// The task runs until `cancel` fires or the returned handle is dropped.
pub fn spawn_channel(config: ChannelConfig, cancel: CancellationToken) -> TransportChannel {
    let (event_tx, event_rx) = mpsc::channel(256);
    let (outbound_tx, outbound_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);

    let sender = ChannelSender {
        outbound: outbound_tx,
        status: status_rx.clone(),
        send_timeout: config.send_timeout,
    };

    let task = tokio::spawn(channel_loop(config, cancel, event_tx, outbound_rx, status_tx));

    TransportChannel {
        events: event_rx,
        sender,
        status: status_rx,
        task,
    }
}

/// How a single connection ended
enum ConnectionEnd {
    Shutdown,
    Dropped(String),
}

/// Main channel loop with reconnection
async fn channel_loop(
    config: ChannelConfig,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<ChannelEvent>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    status_tx: watch::Sender<ConnectionState>,
) {
    let mut connection = Connection::new(config.reconnect);
    let mut rng = StdRng::from_entropy();

    loop {
        reject_pending(&mut outbound_rx);
        connection.begin_attempt();
        let _ = status_tx.send(connection.state());

        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connect(&config.url, config.connect_timeout) => result,
        };

        match attempt {
            Ok(ws_stream) => {
                let reconnect = connection.connected();
                let _ = status_tx.send(connection.state());
                info!("Connected to {} (reconnect={})", config.url, reconnect);

                if !deliver(&event_tx, &cancel, ChannelEvent::Connected { reconnect }).await {
                    break;
                }

                let end =
                    run_connection(ws_stream, &config, &cancel, &event_tx, &mut outbound_rx).await;
                reject_pending(&mut outbound_rx);

                match end {
                    ConnectionEnd::Shutdown => break,
                    ConnectionEnd::Dropped(reason) => {
                        warn!("Connection to {} dropped: {}", config.url, reason);
                        connection.dropped(Instant::now(), &mut rng);
                        let _ = status_tx.send(connection.state());
                        if !deliver(&event_tx, &cancel, ChannelEvent::Closed { reason }).await {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                let deadline = connection.attempt_failed(Instant::now(), &mut rng);
                let _ = status_tx.send(connection.state());
                let retry_in = deadline.saturating_duration_since(Instant::now());
                if e.is_retryable() {
                    warn!(
                        "Connect attempt {} failed: {}",
                        connection.retry_count(),
                        e
                    );
                } else {
                    error!("Connect attempt {} failed: {}", connection.retry_count(), e);
                }
                let failed = ChannelEvent::ConnectFailed { error: e, retry_in };
                if !deliver(&event_tx, &cancel, failed).await {
                    break;
                }
            }
        }

        // Wait out the retry deadline, but stay responsive to shutdown
        let deadline = connection.next_retry_at().unwrap_or_else(Instant::now);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }

    connection.close();
    let _ = status_tx.send(connection.state());
    reject_pending(&mut outbound_rx);
    debug!("Channel task stopped");
}

/// Relay frames for one established connection until it ends
async fn run_connection(
    ws_stream: WsStream,
    config: &ChannelConfig,
    cancel: &CancellationToken,
    event_tx: &mpsc::Sender<ChannelEvent>,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
) -> ConnectionEnd {
    let (mut write, mut read) = ws_stream.split();
    let mut ping = config
        .ping_interval
        .map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let _ = tokio::time::timeout(config.send_timeout, write.send(Message::Close(None))).await;
                return ConnectionEnd::Shutdown;
            }

            msg = read.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => Frame::Text(text),
                    Some(Ok(Message::Binary(data))) => Frame::Binary(data),
                    Some(Ok(Message::Close(close))) => {
                        let reason = close
                            .map(|c| format!("closed by server ({}): {}", u16::from(c.code), c.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                        return ConnectionEnd::Dropped(reason);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return ConnectionEnd::Dropped(e.to_string()),
                    None => return ConnectionEnd::Dropped("stream ended".to_string()),
                };
                if !deliver(event_tx, cancel, ChannelEvent::Frame(frame)).await {
                    let _ = tokio::time::timeout(config.send_timeout, write.send(Message::Close(None))).await;
                    return ConnectionEnd::Shutdown;
                }
            }

            Some(out) = outbound_rx.recv() => {
                let result = match tokio::time::timeout(config.send_timeout, write.send(out.message)).await {
                    Err(_) => Err(SendError::Timeout(config.send_timeout)),
                    Ok(Err(e)) => Err(SendError::Transport(e.to_string())),
                    Ok(Ok(())) => Ok(()),
                };
                let broken = matches!(result, Err(SendError::Transport(_)));
                let reason = match &result {
                    Err(e) => e.to_string(),
                    Ok(()) => String::new(),
                };
                let _ = out.ack.send(result);
                if broken {
                    return ConnectionEnd::Dropped(reason);
                }
            }

            _ = next_tick(&mut ping) => {
                match tokio::time::timeout(config.send_timeout, write.send(Message::Ping(Vec::new()))).await {
                    Err(_) => return ConnectionEnd::Dropped("keep-alive ping timed out".to_string()),
                    Ok(Err(e)) => return ConnectionEnd::Dropped(format!("keep-alive ping failed: {}", e)),
                    Ok(Ok(())) => {}
                }
            }
        }
    }
}

/// Queue an event for the consumer
///
/// Returns false once shutdown fired or the consumer is gone.
async fn deliver(
    event_tx: &mpsc::Sender<ChannelEvent>,
    cancel: &CancellationToken,
    event: ChannelEvent,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = event_tx.send(event) => sent.is_ok(),
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Fail every queued outbound frame; the connection it was meant for is gone
fn reject_pending(outbound_rx: &mut mpsc::Receiver<Outbound>) {
    while let Ok(out) = outbound_rx.try_recv() {
        let _ = out.ack.send(Err(SendError::NotConnected));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Local server that pushes `frames` text frames at the first client and
    /// then keeps the socket open
    async fn flooding_server(frames: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for n in 0..frames {
                let frame = format!(r#"{{"type":"heartbeat","referenceTime":{}}}"#, n);
                if ws.send(Message::Text(frame)).await.is_err() {
                    return;
                }
            }
            while let Some(Ok(_)) = ws.next().await {}
        });

        url
    }

    async fn wait_connected(sender: &ChannelSender) {
        for _ in 0..100 {
            if sender.state() == ConnectionState::Connected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("channel never connected");
    }

    #[test]
    fn test_channel_config_from_config() {
        let config = Config {
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 8_000,
            ping_interval_ms: 0,
            ..Config::default()
        };
        let channel = ChannelConfig::from_config("ws://localhost:8000/ws", &config);
        assert_eq!(channel.reconnect.base, Duration::from_millis(250));
        assert_eq!(channel.reconnect.max, Duration::from_secs(8));
        assert!(channel.ping_interval.is_none());
        assert_eq!(channel.send_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_send_fails_when_not_connected() {
        let cancel = CancellationToken::new();
        // Nothing listens on port 9 of a reserved test address
        let mut config = ChannelConfig::new("ws://127.0.0.1:9/");
        config.connect_timeout = Duration::from_millis(200);
        let channel = spawn_channel(config, cancel.clone());

        let err = channel.sender().send(b"{}".to_vec()).await.unwrap_err();
        assert_eq!(err, SendError::NotConnected);

        cancel.cancel();
        channel.join().await;
    }

    #[tokio::test]
    async fn test_failed_connect_reported_and_retried() {
        let cancel = CancellationToken::new();
        let mut config = ChannelConfig::new("ws://127.0.0.1:9/");
        config.connect_timeout = Duration::from_millis(200);
        config.reconnect = ReconnectPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(20),
        };
        let mut channel = spawn_channel(config, cancel.clone());

        for _ in 0..2 {
            match channel.receive().await {
                Some(ChannelEvent::ConnectFailed { retry_in, .. }) => {
                    assert!(retry_in <= Duration::from_millis(20));
                }
                other => panic!("Expected ConnectFailed, got {:?}", other),
            }
        }

        cancel.cancel();
        channel.join().await;
    }

    #[tokio::test]
    async fn test_shutdown_with_full_event_queue() {
        let url = flooding_server(400).await;
        let cancel = CancellationToken::new();
        let mut config = ChannelConfig::new(url);
        config.ping_interval = None;
        let channel = spawn_channel(config, cancel.clone());

        // Nobody reads; the queue fills and the task blocks on it
        wait_connected(&channel.sender()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        cancel.cancel();
        let joined = tokio::time::timeout(Duration::from_secs(3), channel.join()).await;
        assert!(joined.is_ok(), "channel task did not stop after cancel");
    }

    #[tokio::test]
    async fn test_send_times_out_when_writer_stalls() {
        let url = flooding_server(400).await;
        let cancel = CancellationToken::new();
        let mut config = ChannelConfig::new(url);
        config.ping_interval = None;
        config.send_timeout = Duration::from_millis(100);
        let channel = spawn_channel(config, cancel.clone());
        let sender = channel.sender();

        wait_connected(&sender).await;
        // The task is stuck handing frames to a consumer that never reads,
        // so the outbound frame is never written
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = sender.send(b"{}".to_vec()).await.unwrap_err();
        assert_eq!(err, SendError::Timeout(Duration::from_millis(100)));

        cancel.cancel();
        channel.join().await;
    }
}
