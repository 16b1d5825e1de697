//! STOMP-over-WebSocket transport with automatic reconnection
//!
//! One background task owns the WebSocket. It connects, performs the STOMP
//! CONNECT exchange with the current connect headers, then pumps outbound
//! SUBSCRIBE/UNSUBSCRIBE commands and inbound frames until the session
//! drops. After a drop it waits a fixed delay and tries again, until the
//! transport is deactivated.

use crate::config::RealtimeConfig;
use crate::transport::traits::{
    Connector, SubscriptionHandle, Transport, TransportEvent, WsStream,
};
use crate::transport::websocket::TungsteniteConnector;
use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use rollcall_shared::codec::{self, Decoded, FrameDecoder};
use rollcall_shared::{timing, Command, Frame, HeartBeat};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};
use url::Url;

/// Placeholder period for disabled heart-beat timers (guarded off in select)
const IDLE_PERIOD: Duration = Duration::from_secs(3600);

/// Options for the STOMP transport
#[derive(Debug, Clone)]
pub struct StompOptions {
    /// Fixed delay between reconnection attempts
    pub reconnect_delay: Duration,
    /// Heart-beats the client offers (outgoing) and wants (incoming)
    pub heart_beat: HeartBeat,
    /// Timeout for WebSocket handshake plus CONNECT/CONNECTED
    pub connect_timeout: Duration,
}

impl Default for StompOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(timing::RECONNECT_DELAY_MS),
            heart_beat: HeartBeat::new(timing::HEARTBEAT_OUTGOING_MS, timing::HEARTBEAT_INCOMING_MS),
            connect_timeout: Duration::from_millis(timing::CONNECT_TIMEOUT_MS),
        }
    }
}

impl From<&RealtimeConfig> for StompOptions {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay,
            heart_beat: config.heart_beat(),
            connect_timeout: config.connect_timeout,
        }
    }
}

/// Commands from the public API to the connection task
#[derive(Debug)]
enum Outbound {
    Subscribe { id: String, destination: String },
    Unsubscribe { id: String },
}

/// Running connection task plus the channels that steer it
struct ActiveLink {
    generation: u64,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// How a live session ended
enum SessionEnd {
    Shutdown,
    Dropped(String),
}

/// STOMP transport over a single WebSocket
pub struct StompTransport<C: Connector = TungsteniteConnector> {
    options: StompOptions,
    connector: Arc<C>,
    connect_headers: Arc<RwLock<BTreeMap<String, String>>>,
    next_subscription_id: AtomicU64,
    generation: AtomicU64,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    link: Mutex<Option<ActiveLink>>,
}

impl StompTransport<TungsteniteConnector> {
    /// Create a transport using the default WebSocket connector.
    ///
    /// Returns the transport and the receiver its events are delivered on.
    pub fn new(options: StompOptions) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        Self::with_connector(options, TungsteniteConnector::new())
    }
}

impl<C: Connector> StompTransport<C> {
    /// Create a transport with a custom connector
    pub fn with_connector(
        options: StompOptions,
        connector: C,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = Self {
            options,
            connector: Arc::new(connector),
            connect_headers: Arc::new(RwLock::new(BTreeMap::new())),
            next_subscription_id: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            event_tx,
            link: Mutex::new(None),
        };
        (transport, event_rx)
    }

    fn link(&self) -> MutexGuard<'_, Option<ActiveLink>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_outbound(&self, command: Outbound) {
        match self.link().as_ref() {
            Some(link) => {
                if link.outbound_tx.send(command).is_err() {
                    debug!("Connection task gone, dropping outbound command");
                }
            }
            None => debug!(?command, "Transport inactive, dropping outbound command"),
        }
    }
}

impl<C: Connector> Transport for StompTransport<C> {
    fn activate(&self, url: &Url) -> u64 {
        let mut link = self.link();
        if let Some(active) = link.as_ref().filter(|l| !l.task.is_finished()) {
            debug!(generation = active.generation, "Transport already active");
            return active.generation;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("Cannot activate transport outside a tokio runtime");
            return generation;
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(url = %url, generation, connector = self.connector.name(), "Activating STOMP transport");
        let task = runtime.spawn(connection_loop(
            generation,
            url.clone(),
            self.connector.clone(),
            self.options.clone(),
            self.connect_headers.clone(),
            outbound_rx,
            self.event_tx.clone(),
            shutdown_rx,
        ));

        *link = Some(ActiveLink {
            generation,
            outbound_tx,
            shutdown_tx,
            task,
        });
        generation
    }

    fn deactivate(&self) {
        if let Some(link) = self.link().take() {
            info!("Deactivating STOMP transport");
            let _ = link.shutdown_tx.send(true);
        }
    }

    fn is_active(&self) -> bool {
        self.link().as_ref().is_some_and(|l| !l.task.is_finished())
    }

    fn set_connect_headers(&self, headers: BTreeMap<String, String>) {
        match self.connect_headers.write() {
            Ok(mut current) => *current = headers,
            Err(poisoned) => *poisoned.into_inner() = headers,
        }
    }

    fn subscribe(&self, destination: &str) -> SubscriptionHandle {
        let n = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let handle = SubscriptionHandle::new(format!("sub-{}", n));
        self.send_outbound(Outbound::Subscribe {
            id: handle.id().to_string(),
            destination: destination.to_string(),
        });
        handle
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.send_outbound(Outbound::Unsubscribe {
            id: handle.id().to_string(),
        });
    }
}

impl<C: Connector> Drop for StompTransport<C> {
    fn drop(&mut self) {
        // Best-effort shutdown signal.
        if let Some(link) = self.link().take() {
            let _ = link.shutdown_tx.send(true);
        }
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop<C: Connector>(
    generation: u64,
    url: Url,
    connector: Arc<C>,
    options: StompOptions,
    connect_headers: Arc<RwLock<BTreeMap<String, String>>>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        // Headers are re-read on every attempt so a refreshed token applies
        let headers = connect_headers
            .read()
            .map(|h| h.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());

        let opened = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            result = open_session(&url, connector.as_ref(), &options, &headers, &event_tx) => result,
        };

        match opened {
            Ok((ws, decoder, heart_beat)) => {
                attempt = 0;

                // Commands queued before this session refer to a dead one;
                // the listener registry re-subscribes on Connected.
                let mut stale = 0;
                while outbound_rx.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    debug!(stale, "Discarded commands queued for the previous session");
                }

                info!(url = %url, send_ms = heart_beat.outgoing_ms, expect_ms = heart_beat.incoming_ms, "STOMP session established");
                let _ = event_tx.send(TransportEvent::Connected { generation });

                let end = run_session(
                    generation,
                    ws,
                    decoder,
                    heart_beat,
                    &mut outbound_rx,
                    &event_tx,
                    &mut shutdown,
                )
                .await;
                match end {
                    SessionEnd::Shutdown => {
                        let _ = event_tx.send(TransportEvent::Disconnected {
                            generation,
                            reason: "deactivated".into(),
                        });
                        return;
                    }
                    SessionEnd::Dropped(reason) => {
                        warn!(reason = %reason, "STOMP session dropped");
                        let _ = event_tx.send(TransportEvent::Disconnected { generation, reason });
                    }
                }
            }
            Err(e) => {
                warn!(attempt, error = %e, "STOMP connection attempt failed");
            }
        }

        debug!(delay_ms = options.reconnect_delay.as_millis() as u64, "Waiting before reconnecting");
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = sleep(options.reconnect_delay) => {}
        }
    }

    info!("STOMP connection loop stopped");
}

/// Connect the WebSocket and complete the CONNECT/CONNECTED exchange
async fn open_session<C: Connector>(
    url: &Url,
    connector: &C,
    options: &StompOptions,
    headers: &BTreeMap<String, String>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> Result<(WsStream, FrameDecoder, HeartBeat)> {
    timeout(
        options.connect_timeout,
        handshake(url, connector, options, headers, event_tx),
    )
    .await
    .map_err(|_| anyhow!("STOMP handshake timed out after {:?}", options.connect_timeout))?
}

async fn handshake<C: Connector>(
    url: &Url,
    connector: &C,
    options: &StompOptions,
    headers: &BTreeMap<String, String>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> Result<(WsStream, FrameDecoder, HeartBeat)> {
    let request = url
        .as_str()
        .into_client_request()
        .context("Failed to build WebSocket request")?;
    let mut ws = connector.connect(request).await?;

    let host = url.host_str().unwrap_or_default();
    send_frame(&mut ws, &Frame::connect(host, options.heart_beat, headers)).await?;

    let mut decoder = FrameDecoder::new();
    loop {
        let msg = ws
            .next()
            .await
            .ok_or_else(|| anyhow!("Connection closed during STOMP handshake"))??;
        if !feed(&mut decoder, &msg) {
            if let Message::Close(_) = msg {
                bail!("Connection closed during STOMP handshake");
            }
            continue;
        }

        while let Some(decoded) = decoder.decode_next()? {
            let Decoded::Frame(frame) = decoded else {
                continue;
            };
            match frame.command {
                Command::Connected => {
                    let server = frame
                        .header("heart-beat")
                        .and_then(HeartBeat::parse)
                        .unwrap_or_default();
                    let negotiated = HeartBeat::negotiate(options.heart_beat, server);
                    return Ok((ws, decoder, negotiated));
                }
                Command::Error => {
                    let message = error_message(&frame);
                    error!(message = %message, "Broker rejected STOMP CONNECT");
                    let _ = event_tx.send(TransportEvent::ProtocolError {
                        message: message.clone(),
                    });
                    bail!("Broker rejected CONNECT: {}", message);
                }
                other => debug!(command = %other, "Ignoring frame before CONNECTED"),
            }
        }
    }
}

/// Handle an established session until it ends
async fn run_session(
    generation: u64,
    mut ws: WsStream,
    mut decoder: FrameDecoder,
    heart_beat: HeartBeat,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (send_every, expect_within) = heartbeat_periods(heart_beat);

    let period = send_every.unwrap_or(IDLE_PERIOD);
    let mut heartbeat_ticker = interval_at(Instant::now() + period, period);
    let mut last_inbound = Instant::now();

    // Anything that arrived in the same chunk as CONNECTED
    if let Some(message) = drain_frames(generation, &mut decoder, event_tx) {
        return SessionEnd::Dropped(format!("Broker error: {}", message));
    }

    loop {
        let watchdog = last_inbound + expect_within.unwrap_or(IDLE_PERIOD);

        tokio::select! {
            _ = stopped(shutdown) => {
                let goodbye = async {
                    let _ = send_frame(&mut ws, &Frame::disconnect()).await;
                    let _ = ws.close(None).await;
                };
                if timeout(Duration::from_millis(timing::SHUTDOWN_TIMEOUT_MS), goodbye).await.is_err() {
                    debug!("Broker did not finish the close handshake in time");
                }
                return SessionEnd::Shutdown;
            }

            // Send heart-beat
            _ = heartbeat_ticker.tick(), if send_every.is_some() => {
                if let Err(e) = ws.send(Message::text("\n")).await {
                    return SessionEnd::Dropped(format!("Heart-beat send failed: {}", e));
                }
            }

            _ = sleep_until(watchdog), if expect_within.is_some() => {
                return SessionEnd::Dropped("Broker heart-beats missed".into());
            }

            // Send outbound commands
            Some(command) = outbound_rx.recv() => {
                let frame = match &command {
                    Outbound::Subscribe { id, destination } => {
                        debug!(id = %id, destination = %destination, "SUBSCRIBE");
                        Frame::subscribe(id, destination)
                    }
                    Outbound::Unsubscribe { id } => {
                        debug!(id = %id, "UNSUBSCRIBE");
                        Frame::unsubscribe(id)
                    }
                };
                if let Err(e) = send_frame(&mut ws, &frame).await {
                    return SessionEnd::Dropped(format!("Send failed: {}", e));
                }
            }

            // Read incoming messages
            msg = ws.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        last_inbound = Instant::now();
                        if feed(&mut decoder, &msg) {
                            // The broker closes the connection after an ERROR frame
                            if let Some(message) = drain_frames(generation, &mut decoder, event_tx) {
                                return SessionEnd::Dropped(format!("Broker error: {}", message));
                            }
                        } else if let Message::Close(frame) = msg {
                            let reason = frame
                                .map(|f| f.reason.as_str().to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "Broker closed connection".into());
                            return SessionEnd::Dropped(reason);
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Dropped(format!("Read error: {}", e)),
                    None => return SessionEnd::Dropped("Stream ended".into()),
                }
            }
        }
    }
}

/// Outgoing heart-beat period and incoming silence limit, `None` when disabled
fn heartbeat_periods(heart_beat: HeartBeat) -> (Option<Duration>, Option<Duration>) {
    let send_every = (heart_beat.outgoing_ms > 0)
        .then(|| Duration::from_millis(heart_beat.outgoing_ms.min(timing::HEARTBEAT_MAX_MS)));
    let expect_within = (heart_beat.incoming_ms > 0).then(|| {
        let interval = heart_beat.incoming_ms.min(timing::HEARTBEAT_MAX_MS);
        Duration::from_millis(interval.saturating_mul(timing::HEARTBEAT_GRACE_FACTOR))
    });
    (send_every, expect_within)
}

/// Feed a WebSocket message into the decoder. Returns false for control messages.
fn feed(decoder: &mut FrameDecoder, msg: &Message) -> bool {
    match msg {
        Message::Text(text) => {
            decoder.extend(text.as_bytes());
            true
        }
        Message::Binary(data) => {
            decoder.extend(&data[..]);
            true
        }
        // Pings are answered by tungstenite itself
        _ => false,
    }
}

/// Turn every complete frame in the decoder into transport events.
///
/// Stops at the first ERROR frame and returns its message.
fn drain_frames(
    generation: u64,
    decoder: &mut FrameDecoder,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
) -> Option<String> {
    loop {
        let frame = match decoder.decode_next() {
            Ok(Some(Decoded::Frame(frame))) => frame,
            Ok(Some(Decoded::HeartBeat)) => continue,
            Ok(None) => return None,
            Err(e) => {
                // WebSocket messages carry whole frames, so the next message resyncs
                warn!(error = %e, "Discarding undecodable STOMP data");
                decoder.reset();
                return None;
            }
        };

        match frame.command {
            Command::Message => match frame.header("destination") {
                Some(destination) => {
                    let _ = event_tx.send(TransportEvent::Message {
                        generation,
                        destination: destination.to_string(),
                        body: frame.body.clone(),
                    });
                }
                None => warn!("MESSAGE frame without destination header"),
            },
            Command::Error => {
                let message = error_message(&frame);
                error!(message = %message, "Broker sent ERROR frame");
                let _ = event_tx.send(TransportEvent::ProtocolError {
                    message: message.clone(),
                });
                return Some(message);
            }
            Command::Receipt => debug!(receipt = ?frame.header("receipt-id"), "RECEIPT"),
            other => debug!(command = %other, "Ignoring unexpected frame"),
        }
    }
}

/// Resolves once deactivation is requested or the transport is dropped
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn error_message(frame: &Frame) -> String {
    match frame.header("message") {
        Some(message) => message.to_string(),
        None => frame.body_text(),
    }
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) -> Result<()> {
    let encoded = codec::encode(frame)?;
    let text = String::from_utf8_lossy(&encoded).into_owned();
    ws.send(Message::text(text)).await?;
    Ok(())
}
