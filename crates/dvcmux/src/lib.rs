//! Session-scoped dynamic virtual channel multiplexer.
//!
//! One physical transport carries many independent, named logical channels,
//! each owned by a plugin-provided callback object. The [`ChannelManager`]
//! creates and destroys channels over the shared transport, routes inbound
//! events to the right per-channel callback and serializes outbound writes.
//!
//! Transport framing and encryption are out of scope: an external layer
//! implements [`Transport`] and feeds already-deframed channel-control and
//! channel-data events into the manager.

#[macro_use]
extern crate tracing;

#[macro_use]
mod macros;

mod as_any;
mod channel;
mod error;
mod event;
mod listener;
mod manager;
mod plugin;
mod transport;

pub use as_any::AsAny;
pub use channel::{ChannelCallback, ChannelHandle, ChannelId, ChannelState};
pub use error::{ChannelError, ChannelErrorExt, ChannelErrorKind, ChannelErrorReport, ChannelResult, ChannelResultExt};
pub use event::SessionEvent;
pub use listener::{ConnectionRequest, Listener, ListenerCallback, ListenerFlags};
pub use manager::{ChannelManager, SessionState};
pub use plugin::{Plugin, PluginState};
pub use transport::Transport;
