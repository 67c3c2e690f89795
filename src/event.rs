//! Event plumbing between the server actor and the D-Bus surface.
//!
//! The actor reports server lifecycle changes and admitted clients here;
//! the daemon forwards them as D-Bus signals.

use std::sync::Arc;

use bluer::Address;

use crate::bnep::proto::SvcRole;

/// Events emitted by the PAN server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanEvent {
   ServerEnabled(SvcRole),
   ServerDisabled(SvcRole),
   ClientConnected { role: SvcRole, address: Address },
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: PanEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
