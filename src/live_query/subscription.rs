// src/live_query/subscription.rs

use futures_util::stream::{self, Stream};
use tokio::sync::{mpsc, watch};

use crate::live_query::connection::Command;
use crate::object::ParseObject;
use crate::query::CompiledQuery;

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for the server to acknowledge the subscribe frame.
    Pending,
    Subscribed,
    /// The connection failed; the subscription will be re-sent on reconnect.
    Error,
    Closed,
}

/// An error reported by the server or the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveError {
    pub code: Option<i64>,
    pub message: String,
    /// Whether the channel will try to recover.
    pub reconnect: bool,
}

/// Events delivered to one subscription, in server-send order.
///
/// Every object has already been merged into the client's entity cache; for
/// `Update` the object is the winning cached state, which is the cached copy
/// itself when the incoming record was older.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// The server acknowledged the subscription.
    Open,
    /// The subscription was re-established after a reconnect. Changes made
    /// while disconnected are not replayed.
    Resumed,
    Create(ParseObject),
    /// An existing object started matching the query.
    Enter {
        object: ParseObject,
        original: Option<ParseObject>,
    },
    Update {
        object: ParseObject,
        original: Option<ParseObject>,
    },
    /// An object stopped matching the query. It still exists.
    Leave {
        object: ParseObject,
        original: Option<ParseObject>,
    },
    Delete(ParseObject),
    Error(LiveError),
    /// The channel was closed; no further events follow.
    Closed,
}

/// A live subscription to the objects matching one query.
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    request_id: u64,
    query: CompiledQuery,
    session_token: Option<String>,
    events: mpsc::Receiver<LiveEvent>,
    state: watch::Receiver<SubscriptionState>,
    closed: bool,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub(crate) fn new(
        request_id: u64,
        query: CompiledQuery,
        session_token: Option<String>,
        events: mpsc::Receiver<LiveEvent>,
        state: watch::Receiver<SubscriptionState>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Subscription {
            request_id,
            query,
            session_token,
            events,
            state,
            closed: false,
            commands,
        }
    }

    /// The request id used on the wire.
    pub fn id(&self) -> u64 {
        self.request_id
    }

    pub fn query(&self) -> &CompiledQuery {
        &self.query
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn state(&self) -> SubscriptionState {
        if self.closed {
            SubscriptionState::Closed
        } else {
            *self.state.borrow()
        }
    }

    /// The next event; `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<LiveEvent> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    /// Closes the subscription immediately. Queued events are discarded and
    /// later frames for this request id are dropped by the channel.
    pub fn unsubscribe(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events.close();
        let _ = self.commands.send(Command::Unsubscribe {
            request_id: self.request_id,
        });
    }

    pub fn into_stream(self) -> impl Stream<Item = LiveEvent> {
        stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
