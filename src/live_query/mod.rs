// src/live_query/mod.rs

//! Live queries: a persistent connection that streams create, enter, update,
//! leave and delete events for objects matching subscribed queries.
//!
//! A [`LiveQueryClient`] owns one background task holding the connection. The
//! task multiplexes subscription commands and server frames, reconciles every
//! event into the client's [`EntityCache`](crate::EntityCache), and reconnects
//! with exponential backoff when the transport fails.

pub mod connection;
pub mod protocol;
pub mod socket;
pub mod subscription;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

use crate::client::Parse;
use crate::error::ParseError;
use crate::query::ParseQuery;

pub use connection::{backoff_delay, ChannelState};
pub use socket::{LiveConnector, LiveSocket, WsConnector};
pub use subscription::{LiveError, LiveEvent, Subscription, SubscriptionState};

use connection::{Command, ConnectionTask};

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_reconnect_jitter() -> f64 {
    0.2
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// Connection settings for a [`LiveQueryClient`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveQueryOptions {
    /// Reconnect after transport failures.
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// First reconnect delay; doubles on every failed attempt.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// `None` retries forever.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,

    /// Fraction of each delay added or removed at random, in `0.0..=1.0`.
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,

    /// Buffered events per subscription. A subscription whose buffer is full
    /// when an event arrives is dropped and moves to the `Error` state.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for LiveQueryOptions {
    fn default() -> Self {
        LiveQueryOptions {
            auto_reconnect: default_auto_reconnect(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            max_reconnect_attempts: None,
            reconnect_jitter: default_reconnect_jitter(),
            event_channel_capacity: default_event_channel_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl LiveQueryOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Channel-level notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server accepted the connection.
    Open,
    Close,
    Error(String),
}

/// Handle to a live-query connection.
///
/// Created with [`Parse::live_query`] or [`Parse::live_query_with`]. Dropping
/// the handle closes the connection and every subscription made through it.
#[derive(Debug)]
pub struct LiveQueryClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ChannelState>,
    client_events: broadcast::Sender<ClientEvent>,
    next_request_id: AtomicU64,
    session_token: Option<String>,
    event_channel_capacity: usize,
}

impl LiveQueryClient {
    /// Spawns the connection task. Must be called inside a Tokio runtime.
    pub(crate) fn start(client: &Parse, connector: Arc<dyn LiveConnector>, options: LiveQueryOptions) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ChannelState::Connecting);
        let (client_events, _) = broadcast::channel(16);
        let event_channel_capacity = options.event_channel_capacity.max(1);

        let task = ConnectionTask::new(
            client,
            connector,
            options,
            command_rx,
            state_tx,
            client_events.clone(),
        );
        tokio::spawn(task.run());

        LiveQueryClient {
            commands,
            state,
            client_events,
            next_request_id: AtomicU64::new(0),
            session_token: client.session_token.clone(),
            event_channel_capacity,
        }
    }

    /// Subscribes to `query`, authenticated with the client's session token.
    ///
    /// Returns immediately. While the channel is still connecting, the
    /// subscription is queued and sent once the server accepts the connection.
    pub fn subscribe(&self, query: &ParseQuery) -> Result<Subscription, ParseError> {
        self.subscribe_with_token(query, self.session_token.as_deref())
    }

    pub fn subscribe_with_token(
        &self,
        query: &ParseQuery,
        session_token: Option<&str>,
    ) -> Result<Subscription, ParseError> {
        let compiled = query.compile()?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (event_tx, event_rx) = mpsc::channel(self.event_channel_capacity);
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Pending);
        let session_token = session_token.map(str::to_string);

        self.commands
            .send(Command::Subscribe {
                request_id,
                class_name: compiled.class_name.clone(),
                query: compiled.to_live_query(),
                session_token: session_token.clone(),
                events: event_tx,
                state: state_tx,
            })
            .map_err(|_| ParseError::ConnectionFailed("live query channel is closed".to_string()))?;

        Ok(Subscription::new(
            request_id,
            compiled,
            session_token,
            event_rx,
            state_rx,
            self.commands.clone(),
        ))
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Waits until the channel reaches `target`.
    pub async fn wait_for_state(&self, target: ChannelState) -> Result<(), ParseError> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| ParseError::ConnectionFailed("live query channel has stopped".to_string()))
    }

    /// Channel-level open, close and error notifications.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.client_events.subscribe()
    }

    /// Closes the connection. Every subscription receives [`LiveEvent::Closed`].
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl Drop for LiveQueryClient {
    fn drop(&mut self) {
        self.close();
    }
}
