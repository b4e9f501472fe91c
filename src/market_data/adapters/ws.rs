//! WebSocket session driver shared by the socket-based venues.
//!
//! Each venue supplies a [`WireProtocol`]: a sans-IO state machine that turns
//! inbound text frames into outbound frames, decoded updates and control
//! signals. The driver owns the socket and walks the common lifecycle:
//!
//! `Disconnected -> Authenticating -> ChannelNegotiation -> Streaming -> (Disconnected | Reconnecting)`
//!
//! One spawned task per session reads frames in arrival order, so per-venue
//! ordering is preserved. Reconnects always replay the full subscription set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{MarketUpdate, OpenInterestSource, SessionCore, SubscriptionSet, Venue, VenueSession};
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::market_data::backoff::{Backoff, ReconnectPolicy};
use crate::market_data::events::FeedEvent;
use crate::market_data::types::ConnectionStatus;
use crate::telemetry;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Control transitions a protocol can request from the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// Handshake finished (or the feed channel was re-opened); subscriptions may be sent.
    Ready,
    /// Server asked the client to renegotiate its session. Not an error.
    Renegotiate,
    /// Server revoked the connection, e.g. authorization lost after being authorized.
    Invalidated(String),
}

/// Result of feeding one frame to a protocol.
#[derive(Debug, Default)]
pub struct Step {
    pub outbound: Vec<String>,
    pub updates: Vec<MarketUpdate>,
    pub signal: Option<Signal>,
}

impl Step {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn send(frames: Vec<String>) -> Self {
        Self { outbound: frames, ..Default::default() }
    }

    pub fn updates(updates: Vec<MarketUpdate>) -> Self {
        Self { updates, ..Default::default() }
    }

    pub fn signal(signal: Signal) -> Self {
        Self { signal: Some(signal), ..Default::default() }
    }

    pub fn with_signal(mut self, signal: Signal) -> Self {
        self.signal = Some(signal);
        self
    }
}

pub enum UnsubscribePlan {
    Frames(Vec<String>),
    /// The venue cannot drop symbols from a live connection.
    Rebuild,
}

#[async_trait]
pub trait WireProtocol: Send + 'static {
    /// REST work before every socket open (session tokens, preferences).
    /// Returns the socket URL.
    async fn authenticate(&mut self, http: &reqwest::Client) -> FeedResult<String>;

    /// Frames to send as soon as the socket is open. `Signal::Ready` here means
    /// the venue has no in-band handshake.
    fn on_open(&mut self) -> Step;

    fn on_text(&mut self, text: &str, core: &SessionCore) -> FeedResult<Step>;

    fn subscribe_frames(&mut self, added: &SubscriptionSet, all: &SubscriptionSet, core: &SessionCore) -> Vec<String>;

    fn unsubscribe_plan(&mut self, removed: &SubscriptionSet, remaining: &SubscriptionSet, core: &SessionCore) -> UnsubscribePlan;

    async fn renegotiate(&mut self, _http: &reqwest::Client, _all: &SubscriptionSet, _core: &SessionCore) -> FeedResult<Vec<String>> {
        Err(FeedError::Protocol("renegotiation not supported".into()))
    }

    fn keepalive(&mut self) -> Option<String> {
        None
    }

    /// Sent before the close frame on a deliberate shutdown.
    fn close_frames(&mut self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
pub struct WsSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub keepalive: Duration,
    pub policy: ReconnectPolicy,
}

impl WsSettings {
    pub fn from_config(cfg: &FeedConfig) -> Self {
        Self {
            connect_timeout: cfg.connect_timeout(),
            handshake_timeout: cfg.handshake_timeout(),
            keepalive: cfg.keepalive(),
            policy: ReconnectPolicy::from(&cfg.reconnect),
        }
    }
}

pub type ProtocolFactory<P> = Arc<dyn Fn() -> P + Send + Sync>;

#[derive(Debug)]
enum Command {
    Subscribe(SubscriptionSet),
    Unsubscribe(SubscriptionSet),
    Shutdown,
}

enum Outcome {
    Shutdown,
    Rebuild,
    Dropped(FeedError),
}

struct Connection<P> {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    protocol: P,
}

struct Driver<P: WireProtocol> {
    core: SessionCore,
    factory: ProtocolFactory<P>,
    http: reqwest::Client,
    settings: WsSettings,
}

impl<P: WireProtocol> Clone for Driver<P> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            factory: Arc::clone(&self.factory),
            http: self.http.clone(),
            settings: self.settings.clone(),
        }
    }
}

/// Resets the status if a connect attempt exits early (error or cancellation).
struct ConnectGuard<'a> {
    core: &'a SessionCore,
    armed: bool,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.core.set_status(ConnectionStatus::Disconnected);
        }
    }
}

pub struct WsSession<P: WireProtocol> {
    driver: Driver<P>,
    oi_source: Arc<dyn OpenInterestSource>,
    task: Option<JoinHandle<()>>,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl<P: WireProtocol> WsSession<P> {
    pub fn new(
        core: SessionCore,
        factory: ProtocolFactory<P>,
        oi_source: Arc<dyn OpenInterestSource>,
        http: reqwest::Client,
        settings: WsSettings,
    ) -> Self {
        Self {
            driver: Driver { core, factory, http, settings },
            oi_source,
            task: None,
            commands: None,
        }
    }

    fn send_command(&self, command: Command) -> FeedResult<()> {
        match &self.commands {
            Some(tx) => tx
                .send(command)
                .map_err(|_| FeedError::Network("session task has stopped".into())),
            // Not connected yet: the set is replayed on connect
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<P: WireProtocol> VenueSession for WsSession<P> {
    fn venue(&self) -> Venue {
        self.driver.core.venue()
    }

    async fn connect(&mut self) -> FeedResult<()> {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!(venue = %self.venue(), "connect called on a live session");
            return Ok(());
        }
        let core = self.driver.core.clone();
        let mut guard = ConnectGuard { core: &core, armed: true };
        let conn = self.driver.establish().await?;
        guard.armed = false;

        let (tx, rx) = mpsc::unbounded_channel();
        self.driver.mark_connected();
        let driver = self.driver.clone();
        self.task = Some(tokio::spawn(driver.run(conn, rx)));
        self.commands = Some(tx);
        Ok(())
    }

    async fn disconnect(&mut self) {
        let core = &self.driver.core;
        let was_active = self.task.is_some() || core.status() != ConnectionStatus::Disconnected;
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(Command::Shutdown);
        }
        if let Some(mut task) = self.task.take() {
            if timeout(Duration::from_secs(2), &mut task).await.is_err() {
                warn!(venue = %core.venue(), "session task did not stop in time; aborting");
                task.abort();
            }
        }
        core.set_status(ConnectionStatus::Disconnected);
        core.clear();
        if was_active {
            info!(venue = %core.venue(), "disconnected");
            core.emit(FeedEvent::Disconnected { venue: core.venue(), reason: "client disconnect".into() });
        }
    }

    async fn subscribe(&mut self, tickers: &[String], options: &[String]) -> FeedResult<()> {
        let request = SessionCore::normalize_request(tickers, options)?;
        let added = self.driver.core.add_subscriptions(&request);
        if added.is_empty() {
            return Ok(());
        }
        debug!(venue = %self.venue(), tickers = added.tickers.len(), options = added.options.len(), "subscribe");
        self.send_command(Command::Subscribe(added))
    }

    async fn unsubscribe(&mut self, tickers: &[String], options: &[String]) -> FeedResult<()> {
        let request = SessionCore::normalize_request(tickers, options)?;
        let removed = self.driver.core.remove_subscriptions(&request);
        if removed.is_empty() {
            return Ok(());
        }
        self.send_command(Command::Unsubscribe(removed))
    }

    async fn fetch_open_interest(&self, options: &[String]) -> FeedResult<usize> {
        let request = SessionCore::normalize_request(&[], options)?;
        if request.options.is_empty() {
            return Ok(0);
        }
        let symbols: Vec<String> = request.options.into_iter().collect();
        let values = self.oi_source.fetch(&self.driver.http, &symbols).await?;
        Ok(self.driver.core.apply_base_open_interest(&values))
    }

    fn core(&self) -> &SessionCore {
        &self.driver.core
    }
}

impl<P: WireProtocol> Drop for WsSession<P> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<P: WireProtocol> Driver<P> {
    fn venue(&self) -> Venue {
        self.core.venue()
    }

    fn mark_connected(&self) {
        self.core.set_status(ConnectionStatus::Streaming);
        self.core.set_reconnect_attempts(0);
        info!(venue = %self.venue(), "streaming");
        self.core.emit(FeedEvent::Connected { venue: self.venue() });
    }

    /// Authenticate, open the socket, finish the handshake, replay subscriptions.
    async fn establish(&self) -> FeedResult<Connection<P>> {
        let core = &self.core;
        core.set_status(ConnectionStatus::Connecting);
        let mut protocol = (self.factory)();

        let url = protocol.authenticate(&self.http).await?;
        core.set_status(ConnectionStatus::Authenticated);
        debug!(venue = %self.venue(), %url, "opening websocket");

        let (ws, _response) = timeout(self.settings.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| FeedError::Timeout(format!("websocket connect to {}", url)))??;
        let (mut sink, mut stream) = ws.split();

        let opening = protocol.on_open();
        send_all(&mut sink, opening.outbound).await?;
        if opening.signal != Some(Signal::Ready) {
            timeout(self.settings.handshake_timeout, self.handshake(&mut sink, &mut stream, &mut protocol))
                .await
                .map_err(|_| FeedError::Timeout("handshake".into()))??;
        }

        let all = core.subscriptions();
        if !all.is_empty() {
            let frames = protocol.subscribe_frames(&all, &all, core);
            send_all(&mut sink, frames).await?;
            info!(venue = %self.venue(), symbols = all.len(), "replayed subscriptions");
        }
        Ok(Connection { sink, stream, protocol })
    }

    async fn handshake(
        &self,
        sink: &mut SplitSink<WsStream, Message>,
        stream: &mut SplitStream<WsStream>,
        protocol: &mut P,
    ) -> FeedResult<()> {
        while let Some(msg) = stream.next().await {
            match msg? {
                Message::Text(text) => {
                    let step = match protocol.on_text(&text, &self.core) {
                        Ok(step) => step,
                        Err(e @ FeedError::Auth(_)) => return Err(e),
                        Err(e) => {
                            warn!(venue = %self.venue(), error = %e, "ignoring frame during handshake");
                            continue;
                        }
                    };
                    send_all(sink, step.outbound).await?;
                    self.core.apply_all(step.updates);
                    match step.signal {
                        Some(Signal::Ready) => return Ok(()),
                        Some(Signal::Invalidated(reason)) => return Err(FeedError::Auth(reason)),
                        Some(Signal::Renegotiate) => {
                            let all = self.core.subscriptions();
                            let frames = protocol.renegotiate(&self.http, &all, &self.core).await?;
                            send_all(sink, frames).await?;
                        }
                        None => {}
                    }
                }
                Message::Ping(payload) => sink.send(Message::Pong(payload)).await?,
                Message::Close(frame) => {
                    return Err(FeedError::Network(format!("closed during handshake: {:?}", frame)));
                }
                _ => {}
            }
        }
        Err(FeedError::Network("stream ended during handshake".into()))
    }

    async fn run(self, mut conn: Connection<P>, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let outcome = self.pump(&mut conn, &mut commands).await;
            let retry_now = match outcome {
                Outcome::Shutdown => {
                    close(conn).await;
                    return;
                }
                Outcome::Rebuild => {
                    info!(venue = %self.venue(), "rebuilding connection with reduced symbol set");
                    close(conn).await;
                    true
                }
                Outcome::Dropped(e) => {
                    warn!(venue = %self.venue(), error = %e, "connection lost");
                    false
                }
            };
            self.core.set_status(ConnectionStatus::Reconnecting);
            self.core.emit(FeedEvent::Disconnected {
                venue: self.venue(),
                reason: if retry_now { "rebuild".into() } else { "connection lost".into() },
            });

            if retry_now {
                match self.establish().await {
                    Ok(next) => {
                        self.mark_connected();
                        conn = next;
                        continue;
                    }
                    Err(e) if !e.is_retryable() => {
                        self.terminate(e);
                        return;
                    }
                    Err(e) => warn!(venue = %self.venue(), error = %e, "rebuild failed; backing off"),
                }
            }

            match self.reconnect(&mut commands).await {
                Some(next) => conn = next,
                None => return,
            }
        }
    }

    /// Process frames, commands and keepalives until the connection ends.
    async fn pump(&self, conn: &mut Connection<P>, commands: &mut mpsc::UnboundedReceiver<Command>) -> Outcome {
        let venue = self.venue();
        let core = &self.core;
        let mut keepalive = tokio::time::interval(self.settings.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
        keepalive.tick().await;

        loop {
            tokio::select! {
                msg = conn.stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics::counter!(telemetry::FRAMES_TOTAL, "venue" => venue.as_str()).increment(1);
                        let step = match conn.protocol.on_text(&text, core) {
                            Ok(step) => step,
                            Err(e) => {
                                warn!(venue = %venue, error = %e, "dropping frame");
                                metrics::counter!(telemetry::DROPPED_FRAMES_TOTAL, "venue" => venue.as_str(), "reason" => "protocol")
                                    .increment(1);
                                continue;
                            }
                        };
                        if let Err(e) = send_all(&mut conn.sink, step.outbound).await {
                            return Outcome::Dropped(e);
                        }
                        core.apply_all(step.updates);
                        match step.signal {
                            None => {}
                            Some(Signal::Ready) => {
                                let all = core.subscriptions();
                                let frames = conn.protocol.subscribe_frames(&all, &all, core);
                                if let Err(e) = send_all(&mut conn.sink, frames).await {
                                    return Outcome::Dropped(e);
                                }
                            }
                            Some(Signal::Renegotiate) => {
                                info!(venue = %venue, "server requested renegotiation");
                                let all = core.subscriptions();
                                let frames = match conn.protocol.renegotiate(&self.http, &all, core).await {
                                    Ok(frames) => frames,
                                    Err(e) => return Outcome::Dropped(e),
                                };
                                if let Err(e) = send_all(&mut conn.sink, frames).await {
                                    return Outcome::Dropped(e);
                                }
                            }
                            Some(Signal::Invalidated(reason)) => {
                                return Outcome::Dropped(FeedError::Protocol(reason));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = conn.sink.send(Message::Pong(payload)).await {
                            return Outcome::Dropped(e.into());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Outcome::Dropped(FeedError::Network(format!("closed by server: {:?}", frame)));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Outcome::Dropped(e.into()),
                    None => return Outcome::Dropped(FeedError::Network("stream ended".into())),
                },
                cmd = commands.recv() => match cmd {
                    Some(Command::Subscribe(added)) => {
                        let all = core.subscriptions();
                        let frames = conn.protocol.subscribe_frames(&added, &all, core);
                        if let Err(e) = send_all(&mut conn.sink, frames).await {
                            return Outcome::Dropped(e);
                        }
                    }
                    Some(Command::Unsubscribe(removed)) => {
                        let remaining = core.subscriptions();
                        match conn.protocol.unsubscribe_plan(&removed, &remaining, core) {
                            UnsubscribePlan::Frames(frames) => {
                                if let Err(e) = send_all(&mut conn.sink, frames).await {
                                    return Outcome::Dropped(e);
                                }
                            }
                            UnsubscribePlan::Rebuild => return Outcome::Rebuild,
                        }
                    }
                    Some(Command::Shutdown) | None => return Outcome::Shutdown,
                },
                _ = keepalive.tick() => {
                    if let Some(frame) = conn.protocol.keepalive() {
                        if let Err(e) = send_all(&mut conn.sink, vec![frame]).await {
                            return Outcome::Dropped(e);
                        }
                    }
                }
            }
        }
    }

    /// Backoff loop. `None` means the session is finished (shutdown or terminal error).
    async fn reconnect(&self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Option<Connection<P>> {
        let mut backoff = Backoff::new(self.settings.policy);
        loop {
            let delay = match backoff.next_delay() {
                Ok(delay) => delay,
                Err(e) => {
                    self.terminate(e);
                    return None;
                }
            };
            self.core.set_reconnect_attempts(backoff.attempts());
            metrics::counter!(telemetry::RECONNECTS_TOTAL, "venue" => self.venue().as_str()).increment(1);
            info!(venue = %self.venue(), attempt = backoff.attempts(), ?delay, "reconnecting");

            if !wait_or_shutdown(delay, commands).await {
                return None;
            }
            match self.establish().await {
                Ok(conn) => {
                    self.mark_connected();
                    return Some(conn);
                }
                Err(e) if e.is_retryable() => {
                    warn!(venue = %self.venue(), attempt = backoff.attempts(), error = %e, "reconnect attempt failed");
                }
                Err(e) => {
                    self.terminate(e);
                    return None;
                }
            }
        }
    }

    fn terminate(&self, e: FeedError) {
        error!(venue = %self.venue(), error = %e, "giving up on session");
        self.core.set_status(ConnectionStatus::Disconnected);
        self.core.emit_error(e);
    }
}

/// Sleep for `delay` unless a shutdown arrives first. Other commands are
/// dropped: the subscription set they changed is replayed on reconnect.
async fn wait_or_shutdown(delay: Duration, commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = commands.recv() => match cmd {
                Some(Command::Shutdown) | None => return false,
                Some(other) => debug!(?other, "command deferred until reconnect"),
            },
        }
    }
}

async fn send_all(sink: &mut SplitSink<WsStream, Message>, frames: Vec<String>) -> FeedResult<()> {
    for frame in frames {
        debug!(frame = %frame, "send");
        sink.send(Message::Text(frame)).await?;
    }
    Ok(())
}

async fn close<P: WireProtocol>(mut conn: Connection<P>) {
    let frames = conn.protocol.close_frames();
    if let Err(e) = send_all(&mut conn.sink, frames).await {
        debug!(error = %e, "close frames not delivered");
    }
    if let Err(e) = conn.sink.send(Message::Close(None)).await {
        debug!(error = %e, "close frame not delivered");
    }
    let _ = conn.sink.close().await;
}
