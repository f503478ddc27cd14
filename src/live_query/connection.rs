// src/live_query/connection.rs

//! Background task owning the live-query connection.
//!
//! - One connection multiplexed across every subscription
//! - Subscribes issued before the server sends `connected` are queued
//! - Events are materialized and merged into the entity cache before delivery
//! - Delivery never waits: a subscription that stops reading is dropped once
//!   its buffer is full, without holding up the others
//! - Reconnection with exponential backoff; active subscriptions are re-sent
//!   and receive [`LiveEvent::Resumed`] once acknowledged again
//!
//! Reconnect policy: the delay before attempt `n` (0-based) is
//! `min(reconnect_delay_ms * 2^n, max_reconnect_delay_ms)`, randomly moved by
//! up to `reconnect_jitter` of itself and never above the maximum. The attempt
//! counter resets after a successful connection. With the defaults this gives
//! 1s, 2s, 4s ... capped at 30s, ±20%, retrying forever.

use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};

use crate::cache::EntityCache;
use crate::client::Parse;
use crate::error::ParseError;
use crate::live_query::protocol::{ClientMessage, EventFrame, EventKind, ServerMessage};
use crate::live_query::socket::{LiveConnector, LiveSocket};
use crate::live_query::subscription::{LiveError, LiveEvent, SubscriptionState};
use crate::live_query::{ClientEvent, LiveQueryOptions};
use crate::materializer::Materializer;

/// State of the connection as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    /// The transport failed; a reconnect may be pending.
    Error,
    Closed,
}

#[derive(Debug)]
pub(crate) enum Command {
    Subscribe {
        request_id: u64,
        class_name: String,
        query: Value,
        session_token: Option<String>,
        events: mpsc::Sender<LiveEvent>,
        state: watch::Sender<SubscriptionState>,
    },
    Unsubscribe {
        request_id: u64,
    },
    Close,
}

struct SubEntry {
    class_name: String,
    query: Value,
    session_token: Option<String>,
    events: mpsc::Sender<LiveEvent>,
    state: watch::Sender<SubscriptionState>,
    acknowledged: bool,
    resuming: bool,
    /// Subscribed with a `keys` projection, so event records are partial.
    projected: bool,
}

impl SubEntry {
    fn new(
        class_name: String,
        query: Value,
        session_token: Option<String>,
        events: mpsc::Sender<LiveEvent>,
        state: watch::Sender<SubscriptionState>,
    ) -> Self {
        let projected = query.get("keys").is_some();
        SubEntry {
            class_name,
            query,
            session_token,
            events,
            state,
            acknowledged: false,
            resuming: false,
            projected,
        }
    }

    fn subscribe_frame(&self, request_id: u64) -> ClientMessage {
        ClientMessage::Subscribe {
            request_id,
            query: self.query.clone(),
            session_token: self.session_token.clone(),
        }
    }
}

/// Delay before reconnect attempt `attempt` (0-based).
pub fn backoff_delay(options: &LiveQueryOptions, attempt: u32) -> Duration {
    let max = options.max_reconnect_delay_ms;
    let base = options
        .reconnect_delay_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(max);
    let jitter = options.reconnect_jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || base == 0 {
        return Duration::from_millis(base);
    }
    let spread = base as f64 * jitter;
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    let delay = (base as f64 + offset).clamp(0.0, max as f64);
    Duration::from_millis(delay.round() as u64)
}

/// Why a connection ended.
enum Exit {
    /// `close()` was called or every handle is gone.
    Closed,
    /// The transport failed; reconnect if allowed.
    Lost(ParseError),
    /// The server refused further reconnection.
    Fatal(LiveError),
}

enum Step {
    Command(Option<Command>),
    Frame(Result<Option<String>, ParseError>),
}

pub(crate) struct ConnectionTask {
    connector: Arc<dyn LiveConnector>,
    options: LiveQueryOptions,
    hello: ClientMessage,
    cache: Arc<EntityCache>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ChannelState>,
    client_events: broadcast::Sender<ClientEvent>,
    subs: HashMap<u64, SubEntry>,
    /// Subscriptions dropped for overflowing, still to be unsubscribed on the wire.
    overflowed: Vec<u64>,
}

async fn send_frame(socket: &mut Box<dyn LiveSocket>, frame: &ClientMessage) -> Result<(), ParseError> {
    let text = serde_json::to_string(frame)?;
    log::debug!("live query -> {}", text);
    socket.send_text(text).await
}

impl ConnectionTask {
    pub(crate) fn new(
        client: &Parse,
        connector: Arc<dyn LiveConnector>,
        options: LiveQueryOptions,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<ChannelState>,
        client_events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let hello = ClientMessage::Connect {
            application_id: client.app_id.clone(),
            session_token: client.session_token.clone(),
            master_key: client.master_key.clone(),
            javascript_key: client.javascript_key.clone(),
        };
        ConnectionTask {
            connector,
            options,
            hello,
            cache: Arc::clone(&client.cache),
            commands,
            state,
            client_events,
            subs: HashMap::new(),
            overflowed: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            self.state.send_replace(ChannelState::Connecting);
            let connect = tokio::time::timeout(self.options.connect_timeout(), self.connector.connect());
            let exit = match connect.await {
                Ok(Ok(socket)) => {
                    attempt = 0;
                    self.serve(socket).await
                }
                Ok(Err(e)) => Exit::Lost(e),
                Err(_) => Exit::Lost(ParseError::Timeout(self.options.connect_timeout())),
            };

            match exit {
                Exit::Closed => break,
                Exit::Fatal(error) => {
                    log::warn!("live query server closed the channel: {}", error.message);
                    self.broadcast_error(error);
                    break;
                }
                Exit::Lost(e) => {
                    log::warn!("live query connection lost: {}", e);
                    let reconnect = self.may_reconnect(attempt);
                    self.broadcast_error(LiveError {
                        code: e.code(),
                        message: e.to_string(),
                        reconnect,
                    });
                    if !reconnect {
                        break;
                    }
                }
            }

            let delay = backoff_delay(&self.options, attempt);
            attempt = attempt.saturating_add(1);
            log::info!(
                "live query reconnecting in {}ms (attempt {})",
                delay.as_millis(),
                attempt
            );
            if !self.wait_disconnected(delay).await {
                break;
            }
        }
        self.shutdown();
    }

    fn may_reconnect(&self, attempt: u32) -> bool {
        if !self.options.auto_reconnect {
            return false;
        }
        match self.options.max_reconnect_attempts {
            Some(max) if attempt >= max => {
                log::warn!("live query gave up after {} reconnection attempts", max);
                false
            }
            _ => true,
        }
    }

    /// Runs one connection until it ends.
    async fn serve(&mut self, mut socket: Box<dyn LiveSocket>) -> Exit {
        if let Err(e) = send_frame(&mut socket, &self.hello).await {
            return Exit::Lost(e);
        }
        let mut connected = false;
        self.overflowed.clear();

        loop {
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                frame = socket.recv_text() => Step::Frame(frame),
            };

            let result = match step {
                Step::Command(None) | Step::Command(Some(Command::Close)) => {
                    for request_id in self.subs.keys() {
                        let frame = ClientMessage::Unsubscribe {
                            request_id: *request_id,
                        };
                        if connected && send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    let _ = socket.close().await;
                    return Exit::Closed;
                }
                Step::Command(Some(command)) => self.handle_command(command, &mut socket, connected).await,
                Step::Frame(Ok(Some(text))) => self.handle_frame(&text, &mut socket, &mut connected).await,
                Step::Frame(Ok(None)) => Err(Exit::Lost(ParseError::ConnectionFailed(
                    "live query server closed the connection".to_string(),
                ))),
                Step::Frame(Err(e)) => Err(Exit::Lost(e)),
            };

            if let Err(exit) = result {
                return exit;
            }
            if connected {
                for request_id in std::mem::take(&mut self.overflowed) {
                    let frame = ClientMessage::Unsubscribe { request_id };
                    if let Err(e) = send_frame(&mut socket, &frame).await {
                        return Exit::Lost(e);
                    }
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: Command,
        socket: &mut Box<dyn LiveSocket>,
        connected: bool,
    ) -> Result<(), Exit> {
        match command {
            Command::Subscribe {
                request_id,
                class_name,
                query,
                session_token,
                events,
                state,
            } => {
                let entry = SubEntry::new(class_name, query, session_token, events, state);
                let frame = entry.subscribe_frame(request_id);
                self.subs.insert(request_id, entry);
                if connected {
                    send_frame(socket, &frame).await.map_err(Exit::Lost)?;
                } else {
                    log::debug!("subscription {} queued until connected", request_id);
                }
            }
            Command::Unsubscribe { request_id } => {
                if let Some(entry) = self.subs.remove(&request_id) {
                    entry.state.send_replace(SubscriptionState::Closed);
                    if connected {
                        let frame = ClientMessage::Unsubscribe { request_id };
                        send_frame(socket, &frame).await.map_err(Exit::Lost)?;
                    }
                }
            }
            Command::Close => return Err(Exit::Closed),
        }
        Ok(())
    }

    async fn handle_frame(
        &mut self,
        text: &str,
        socket: &mut Box<dyn LiveSocket>,
        connected: &mut bool,
    ) -> Result<(), Exit> {
        log::debug!("live query <- {}", text);
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("dropping unreadable live query frame: {}", e);
                return Ok(());
            }
        };

        let message = match message.into_event() {
            Ok(event) => {
                self.handle_event(event);
                return Ok(());
            }
            Err(other) => other,
        };

        match message {
            ServerMessage::Connected { client_id } => {
                log::info!("live query connected (client id {:?})", client_id);
                *connected = true;
                self.state.send_replace(ChannelState::Connected);
                let _ = self.client_events.send(ClientEvent::Open);

                let mut ids: Vec<u64> = self.subs.keys().copied().collect();
                ids.sort_unstable();
                for request_id in ids {
                    if let Some(entry) = self.subs.get(&request_id) {
                        let frame = entry.subscribe_frame(request_id);
                        send_frame(socket, &frame).await.map_err(Exit::Lost)?;
                    }
                }
            }
            ServerMessage::Subscribed { request_id } => {
                let Some(entry) = self.subs.get_mut(&request_id) else {
                    log::debug!("ack for unknown subscription {}", request_id);
                    return Ok(());
                };
                let event = if entry.resuming {
                    LiveEvent::Resumed
                } else {
                    LiveEvent::Open
                };
                entry.acknowledged = true;
                entry.resuming = false;
                entry.state.send_replace(SubscriptionState::Subscribed);
                self.deliver(request_id, event);
            }
            ServerMessage::Unsubscribed { request_id } => {
                log::debug!("subscription {} removed by server", request_id);
            }
            ServerMessage::Error {
                code,
                error,
                reconnect,
                request_id,
            } => {
                let error = LiveError {
                    code,
                    message: error.unwrap_or_else(|| "unknown live query error".to_string()),
                    reconnect,
                };
                match request_id {
                    Some(request_id) => {
                        log::warn!("subscription {} failed: {}", request_id, error.message);
                        if let Some(entry) = self.subs.remove(&request_id) {
                            entry.state.send_replace(SubscriptionState::Error);
                            let _ = entry.events.try_send(LiveEvent::Error(error));
                        }
                    }
                    None if !reconnect => return Err(Exit::Fatal(error)),
                    None => {
                        return Err(Exit::Lost(ParseError::ServerError {
                            code: code.unwrap_or_default(),
                            message: error.message,
                        }))
                    }
                }
            }
            other => log::debug!("ignoring live query frame {:?}", other),
        }
        Ok(())
    }

    fn handle_event(&mut self, frame: EventFrame) {
        let Some(entry) = self.subs.get(&frame.request_id) else {
            log::debug!(
                "dropping {:?} event for inactive subscription {}",
                frame.kind,
                frame.request_id
            );
            return;
        };
        let class_name = frame
            .object
            .get("className")
            .and_then(Value::as_str)
            .unwrap_or(&entry.class_name)
            .to_string();
        let projected = entry.projected;

        match self.reconcile(&class_name, &frame, projected) {
            Ok(event) => self.deliver(frame.request_id, event),
            Err(e) => log::warn!("dropping malformed {:?} event: {}", frame.kind, e),
        }
    }

    /// Materializes an event record and merges it into the entity cache.
    ///
    /// Records of unprojected subscriptions are complete and replace the
    /// cached state; projected ones only overlay the keys they carry.
    fn reconcile(&self, class_name: &str, frame: &EventFrame, projected: bool) -> Result<LiveEvent, ParseError> {
        let incoming = Materializer::default().materialize(class_name, &frame.object)?;
        let original = match &frame.original {
            Some(original) => Some(Materializer::default().materialize(class_name, original)?),
            None => None,
        };

        if frame.kind == EventKind::Delete {
            if let Some(object_id) = incoming.object_id() {
                self.cache.evict(class_name, object_id);
            }
            return Ok(LiveEvent::Delete(incoming));
        }

        let stored = if projected {
            self.cache.merge(&incoming)
        } else {
            self.cache.replace(&incoming)
        };
        let object = match stored {
            Some((_, winner)) => winner,
            None => incoming,
        };
        Ok(match frame.kind {
            EventKind::Create => LiveEvent::Create(object),
            EventKind::Enter => LiveEvent::Enter { object, original },
            EventKind::Update => LiveEvent::Update { object, original },
            EventKind::Leave => LiveEvent::Leave { object, original },
            EventKind::Delete => LiveEvent::Delete(object),
        })
    }

    /// Hands an event to one subscription without waiting.
    ///
    /// A subscription whose buffer is full is dropped: its state becomes
    /// `Error`, already queued events stay readable, and the stream then ends.
    fn deliver(&mut self, request_id: u64, event: LiveEvent) {
        let Some(entry) = self.subs.get(&request_id) else {
            return;
        };
        match entry.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!(
                    "subscription {} dropped: event buffer full ({} events)",
                    request_id,
                    entry.events.max_capacity()
                );
                if let Some(entry) = self.subs.remove(&request_id) {
                    entry.state.send_replace(SubscriptionState::Error);
                }
                self.overflowed.push(request_id);
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("subscription {} receiver dropped", request_id);
                self.subs.remove(&request_id);
            }
        }
    }

    fn broadcast_error(&mut self, error: LiveError) {
        self.state.send_replace(ChannelState::Error);
        let _ = self.client_events.send(ClientEvent::Error(error.message.clone()));

        let mut ids: Vec<u64> = self.subs.keys().copied().collect();
        ids.sort_unstable();
        for request_id in ids {
            if let Some(entry) = self.subs.get_mut(&request_id) {
                entry.resuming = entry.acknowledged;
                entry.state.send_replace(SubscriptionState::Error);
            }
            self.deliver(request_id, LiveEvent::Error(error.clone()));
        }
    }

    /// Sleeps out a backoff delay while still serving commands. Returns
    /// `false` when the channel was closed meanwhile.
    async fn wait_disconnected(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe { request_id, class_name, query, session_token, events, state }) => {
                        self.subs
                            .insert(request_id, SubEntry::new(class_name, query, session_token, events, state));
                    }
                    Some(Command::Unsubscribe { request_id }) => {
                        if let Some(entry) = self.subs.remove(&request_id) {
                            entry.state.send_replace(SubscriptionState::Closed);
                        }
                    }
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }

    fn shutdown(&mut self) {
        for (_, entry) in self.subs.drain() {
            entry.state.send_replace(SubscriptionState::Closed);
            let _ = entry.events.try_send(LiveEvent::Closed);
        }
        self.state.send_replace(ChannelState::Closed);
        let _ = self.client_events.send(ClientEvent::Close);
        log::info!("live query channel closed");
    }
}
