//! Cross-context relay protocol.
//!
//! The opener owns a [`MessageBus`], the analogue of a window's `message`
//! event target. The callback context reaches it through an [`OpenerHandle`]
//! and posts a [`RelayMessage`]; the opener's [`RelayListener`] decides
//! whether an incoming event is the result of its own attempt.
//!
//! Anything that does not come from the opener's own origin or does not have
//! the relay shape is dropped without error: unrelated parties post messages
//! to the same target all the time.

use crate::redirect::same_origin;
use stowage_types::{MessageEvent, Provider, RelayMessage};
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 16;

/// Message target of one opener context.
#[derive(Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<MessageEvent>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Install a listener. Dropping the receiver removes it.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MessageEvent> {
        self.tx.subscribe()
    }

    /// Deliver `event` to every installed listener.
    pub fn dispatch(&self, event: MessageEvent) {
        // no listeners is fine: the message simply goes nowhere
        let _ = self.tx.send(event);
    }

    /// Number of installed listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// What a callback context can do with the context that opened it.
pub trait OpenerHandle: Send + Sync {
    /// Whether the opener still exists and listens.
    fn is_reachable(&self) -> bool;

    /// Whether the opener is served from `origin`. A relay posted from a
    /// different origin would be dropped by the opener, so callers fall back
    /// to manual transfer instead of posting into the void.
    fn shares_origin(&self, origin: &str) -> bool;

    /// Post `message`, delivered only if the opener's origin equals
    /// `target_origin`. `sender_origin` becomes the event's transport origin.
    fn post_message(&self, message: &RelayMessage, target_origin: &str, sender_origin: &str);
}

/// An [`OpenerHandle`] onto an in-process [`MessageBus`].
#[derive(Clone)]
pub struct BusOpener {
    bus: MessageBus,
    opener_origin: String,
}

impl BusOpener {
    pub fn new(bus: MessageBus, opener_origin: impl Into<String>) -> Self {
        Self {
            bus,
            opener_origin: opener_origin.into(),
        }
    }
}

impl OpenerHandle for BusOpener {
    fn is_reachable(&self) -> bool {
        self.bus.listener_count() > 0
    }

    fn shares_origin(&self, origin: &str) -> bool {
        same_origin(&self.opener_origin, origin)
    }

    fn post_message(&self, message: &RelayMessage, target_origin: &str, sender_origin: &str) {
        if !same_origin(&self.opener_origin, target_origin) {
            tracing::debug!(target_origin, "relay target origin differs from opener, dropped");
            return;
        }
        self.bus.dispatch(MessageEvent {
            origin: sender_origin.to_string(),
            data: message.to_value(),
        });
    }
}

/// Opener-side filter for the relay of one attempt.
///
/// Accepts at most one message: once a terminal message has been taken, every
/// later delivery (including an identical duplicate) is ignored.
#[derive(Debug)]
pub struct RelayListener {
    own_origin: String,
    provider: Provider,
    settled: bool,
}

impl RelayListener {
    pub fn new(own_origin: impl Into<String>, provider: Provider) -> Self {
        Self {
            own_origin: own_origin.into(),
            provider,
            settled: false,
        }
    }

    /// Returns the relay message carried by `event` if it is the terminal
    /// result of this attempt.
    pub fn accept(&mut self, event: &MessageEvent) -> Option<RelayMessage> {
        if self.settled {
            return None;
        }
        if !same_origin(&event.origin, &self.own_origin) {
            tracing::trace!(origin = %event.origin, "ignoring message from foreign origin");
            return None;
        }
        let msg = RelayMessage::parse(&event.data)?;
        if msg.provider != self.provider {
            tracing::trace!(provider = %msg.provider, "ignoring relay for another provider");
            return None;
        }
        self.settled = true;
        Some(msg)
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled
    }
}
