//! WebSocket diff feed.
//!
//! This module provides:
//!
//! - [`FeedClient`] - one connection streaming [`FeedMessage`]s
//! - [`ReconnectingFeed`] - a wrapper that reconnects with backoff, replays
//!   subscriptions and reports every reconnect, since books built from the
//!   old connection can no longer be trusted
//!
//! # Example
//!
//! ```rust,no_run
//! use book_sync::client::{FeedEvent, ReconnectConfig, ReconnectingFeed};
//! use book_sync::config::FeedConfig;
//!
//! # async fn example() -> book_sync::Result<()> {
//! let feed = FeedConfig::new("https://api.example.com/v1/", "wss://stream.example.com/ws");
//! let mut ws = ReconnectingFeed::connect(&feed, ReconnectConfig::default()).await?;
//! ws.subscribe(&["BTC-USD"]).await?;
//!
//! while let Some(event) = ws.next().await {
//!     match event? {
//!         FeedEvent::Message(msg) => println!("{:?}", msg.symbol()),
//!         FeedEvent::Reconnected => println!("books must be rebuilt"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rustc_hash::FxHashSet;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::error::Error;
use crate::orderbook::BookManager;
use crate::types::{FeedCommand, FeedMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One WebSocket connection to the diff feed
///
/// Tracks the symbols confirmed by the server.
///
/// # Thread Safety
///
/// Needs `&mut self` for every call; share it between tasks through a channel
/// or an async mutex.
#[derive(Debug)]
pub struct FeedClient {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    message_id: u64,
    /// Symbols acknowledged by the server
    subscribed: FxHashSet<String>,
}

impl FeedClient {
    /// Connect to the feed
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the handshake fails.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        debug!(%url, "feed connected");

        Ok(Self {
            write,
            read,
            message_id: 1,
            subscribed: FxHashSet::default(),
        })
    }

    /// Send a command to the feed
    async fn send_command(&mut self, cmd: FeedCommand) -> Result<u64, Error> {
        let msg_id = self.message_id;
        let json = serde_json::to_string(&cmd)?;
        self.write.send(Message::Text(json)).await?;
        self.message_id += 1;
        Ok(msg_id)
    }

    /// ID the next command will carry
    pub fn next_message_id(&self) -> u64 {
        self.message_id
    }

    /// Symbols the server has confirmed
    pub fn subscribed(&self) -> &FxHashSet<String> {
        &self.subscribed
    }

    /// Start streaming diffs for `symbols`
    ///
    /// # Returns
    ///
    /// The message ID of the request (use to correlate with the response)
    pub async fn subscribe(&mut self, symbols: &[&str]) -> Result<u64, Error> {
        let cmd = FeedCommand::Subscribe {
            id: self.message_id,
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        };
        self.send_command(cmd).await
    }

    /// Stop streaming diffs for `symbols`
    pub async fn unsubscribe(&mut self, symbols: &[&str]) -> Result<u64, Error> {
        let cmd = FeedCommand::Unsubscribe {
            id: self.message_id,
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        };
        self.send_command(cmd).await
    }

    /// Receive the next message from the feed
    ///
    /// Pings are answered and acknowledgements update [`subscribed`](Self::subscribed).
    ///
    /// # Returns
    ///
    /// The next message, or `None` if the connection is closed.
    pub async fn next(&mut self) -> Option<Result<FeedMessage, Error>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => {
                    return match serde_json::from_str::<FeedMessage>(&text) {
                        Ok(msg) => {
                            self.track(&msg);
                            Some(Ok(msg))
                        }
                        Err(e) => Some(Err(Error::from(e))),
                    };
                }
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.write.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(_)) => {
                    return Some(Err(Error::ConnectionClosed));
                }
                Ok(_) => continue,
                Err(e) => {
                    return Some(Err(e.into()));
                }
            }
        }
    }

    fn track(&mut self, msg: &FeedMessage) {
        match msg {
            FeedMessage::Subscribed(ack) => {
                self.subscribed.extend(ack.symbols.iter().cloned());
            }
            FeedMessage::Unsubscribed(ack) => {
                for symbol in &ack.symbols {
                    self.subscribed.remove(symbol);
                }
            }
            _ => {}
        }
    }

    /// Send a close frame and shut the sink
    pub async fn close(&mut self) -> Result<(), Error> {
        self.write.close().await?;
        Ok(())
    }
}

/// Backoff schedule used by [`ReconnectingFeed`]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Attempts before giving up; 0 retries forever
    pub max_retries: u32,
    /// Delay before the first attempt
    pub initial_delay_ms: u64,
    /// Ceiling for the exponential delay
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Default schedule: 10 attempts from 100ms, doubling up to 30s
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the attempts (0 retries forever)
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Delay before the first attempt, in milliseconds
    #[must_use]
    pub fn initial_delay_ms(mut self, ms: u64) -> Self {
        self.initial_delay_ms = ms;
        self
    }

    /// Delay ceiling, in milliseconds
    #[must_use]
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    /// Growth factor between attempts
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Pause before attempt number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(scaled.min(self.max_delay_ms as f64) as u64)
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_retries == 0 || attempts < self.max_retries
    }
}

/// What a [`ReconnectingFeed`] yields
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A message from the current connection
    Message(FeedMessage),
    /// The connection was replaced; every book must be reset
    Reconnected,
}

/// Feed connection with automatic reconnection.
///
/// - Reconnects with exponential backoff
/// - Replays the wanted symbol set on the new connection
/// - Yields [`FeedEvent::Reconnected`] so books built from the old stream
///   are reset before new diffs arrive
pub struct ReconnectingFeed {
    /// The underlying connection
    client: Option<FeedClient>,
    url: String,
    reconnect_config: ReconnectConfig,
    /// Symbols to replay after reconnection
    symbols: Vec<String>,
    reconnect_attempt: u32,
    is_reconnecting: bool,
}

impl std::fmt::Debug for ReconnectingFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingFeed")
            .field("connected", &self.client.is_some())
            .field("reconnect_attempt", &self.reconnect_attempt)
            .field("is_reconnecting", &self.is_reconnecting)
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

impl ReconnectingFeed {
    /// Connect to the feed with reconnection support
    pub async fn connect(config: &FeedConfig, reconnect_config: ReconnectConfig) -> Result<Self, Error> {
        let url = config.websocket_url().to_string();
        let client = FeedClient::connect(&url).await?;

        Ok(Self {
            client: Some(client),
            url,
            reconnect_config,
            symbols: Vec::new(),
            reconnect_attempt: 0,
            is_reconnecting: false,
        })
    }

    /// Whether a live connection is held
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Whether a reconnection loop is running
    pub fn is_reconnecting(&self) -> bool {
        self.is_reconnecting
    }

    /// Failed attempts since the last good message
    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }

    /// Symbols replayed on reconnection
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Stream `symbols`, now and after every reconnection
    pub async fn subscribe(&mut self, symbols: &[&str]) -> Result<u64, Error> {
        for symbol in symbols {
            if !self.symbols.iter().any(|s| s == symbol) {
                self.symbols.push(symbol.to_string());
            }
        }

        match self.client.as_mut() {
            Some(client) => client.subscribe(symbols).await,
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Stop streaming `symbols`
    pub async fn unsubscribe(&mut self, symbols: &[&str]) -> Result<u64, Error> {
        self.symbols.retain(|s| !symbols.contains(&s.as_str()));

        match self.client.as_mut() {
            Some(client) => client.unsubscribe(symbols).await,
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Receive the next event, reconnecting if necessary
    ///
    /// After a successful reconnection the next event is always
    /// [`FeedEvent::Reconnected`].
    pub async fn next(&mut self) -> Option<Result<FeedEvent, Error>> {
        if let Some(client) = self.client.as_mut() {
            match client.next().await {
                Some(Ok(msg)) => {
                    self.reconnect_attempt = 0;
                    return Some(Ok(FeedEvent::Message(msg)));
                }
                Some(Err(Error::ConnectionClosed)) | None => {
                    warn!(url = %self.url, "feed connection lost");
                    self.client = None;
                }
                Some(Err(e)) => return Some(Err(e)),
            }
        }

        match self.attempt_reconnect().await {
            Ok(()) => Some(Ok(FeedEvent::Reconnected)),
            Err(e) => Some(Err(e)),
        }
    }

    /// Attempt to reconnect with exponential backoff
    async fn attempt_reconnect(&mut self) -> Result<(), Error> {
        self.is_reconnecting = true;

        loop {
            if !self.reconnect_config.allows(self.reconnect_attempt) {
                self.is_reconnecting = false;
                return Err(Error::ConnectionClosed);
            }

            let delay = self.reconnect_config.delay_for_attempt(self.reconnect_attempt);
            tokio::time::sleep(delay).await;
            self.reconnect_attempt += 1;

            match FeedClient::connect(&self.url).await {
                Ok(mut client) => {
                    if let Err(e) = self.replay_subscriptions(&mut client).await {
                        warn!(attempt = self.reconnect_attempt, error = %e, "subscription replay failed");
                        continue;
                    }

                    info!(attempt = self.reconnect_attempt, symbols = self.symbols.len(), "feed reconnected");
                    self.client = Some(client);
                    self.is_reconnecting = false;
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt = self.reconnect_attempt, error = %e, "reconnect failed");
                    continue;
                }
            }
        }
    }

    async fn replay_subscriptions(&self, client: &mut FeedClient) -> Result<(), Error> {
        if self.symbols.is_empty() {
            return Ok(());
        }
        let refs: Vec<&str> = self.symbols.iter().map(String::as_str).collect();
        client.subscribe(&refs).await?;
        Ok(())
    }

    /// Drop the current connection and reconnect now.
    ///
    /// Callers must reset their books afterwards, as
    /// [`drive`](Self::drive) does on [`FeedEvent::Reconnected`].
    pub async fn reconnect(&mut self) -> Result<(), Error> {
        if let Some(client) = self.client.as_mut() {
            let _ = client.close().await;
        }
        self.client = None;
        self.reconnect_attempt = 0;
        self.attempt_reconnect().await
    }

    /// Feed every event into `manager` until the feed gives up.
    ///
    /// Rejected messages are logged and skipped; a reconnection resets all
    /// books.
    ///
    /// # Errors
    ///
    /// The error that ended the stream, usually [`Error::ConnectionClosed`]
    /// after reconnection attempts ran out.
    pub async fn drive(&mut self, manager: &BookManager) -> Result<(), Error> {
        while let Some(event) = self.next().await {
            match event {
                Ok(FeedEvent::Message(msg)) => {
                    if let Err(e) = manager.process_message(&msg) {
                        warn!(symbol = ?msg.symbol(), error = %e, "feed message rejected");
                    }
                }
                Ok(FeedEvent::Reconnected) => manager.handle_reconnect(),
                Err(e @ Error::ConnectionClosed) => return Err(e),
                Err(e) => warn!(error = %e, "feed error"),
            }
        }
        Ok(())
    }

    /// Close the current connection, if any. A later [`next`](Self::next) reconnects.
    pub async fn close(&mut self) -> Result<(), Error> {
        if let Some(client) = self.client.as_mut() {
            client.close().await?;
        }
        self.client = None;
        Ok(())
    }
}
