use core::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ChannelError, ChannelErrorExt as _, ChannelResult, ChannelResultExt as _};
use crate::manager::SessionShared;

/// Numeric channel identifier.
///
/// Unique within a session; assigned by the manager at creation and never
/// reused while the session lives, even after the channel is closed.
pub type ChannelId = u32;

/// Lifecycle of one logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Id reserved, callback not yet bound.
    Pending,
    /// Callback bound, data may flow in both directions.
    Open,
    /// Close initiated by either side; no new writes are accepted.
    Closing,
    /// Terminal; the id is retired.
    Closed,
}

/// Per-channel notification sink, implemented by the owning plugin.
///
/// Notifications for a given channel are delivered serially and never
/// concurrently: `on_open` first, then any number of `on_data_received`,
/// then exactly one `on_close`, and nothing afterwards. The callback
/// typically owns a clone of its [`ChannelHandle`] to issue writes.
pub trait ChannelCallback: Send {
    /// The channel transitioned to `Open`; I/O is now possible.
    fn on_open(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    /// A complete logical message arrived on the channel.
    fn on_data_received(&mut self, data: &[u8]) -> ChannelResult<()>;

    /// The channel closed; the handle is dead from this point on.
    fn on_close(&mut self) {}
}

assert_obj_safe!(ChannelCallback);

pub(crate) enum CloseOutcome {
    /// Another closer already owns the teardown; nothing to do.
    AlreadyClosed,
    /// First effective close; carries the callback owed its single
    /// `on_close` notification, if one was ever bound.
    Closed(Option<Box<dyn ChannelCallback>>),
}

/// Manager-internal channel record.
///
/// Two independent locks: `state` serializes outbound write/close against
/// each other (and is held across the transport hand-off), `callback`
/// serializes inbound delivery and the close notification. State-holders
/// never acquire the callback lock, so the two never deadlock.
pub(crate) struct ChannelEntry {
    id: ChannelId,
    name: String,
    state: Mutex<ChannelState>,
    callback: Mutex<Option<Box<dyn ChannelCallback>>>,
}

impl ChannelEntry {
    pub(crate) fn new(id: ChannelId, name: String) -> Self {
        Self {
            id,
            name,
            state: Mutex::new(ChannelState::Pending),
            callback: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.lock_state()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_callback(&self) -> MutexGuard<'_, Option<Box<dyn ChannelCallback>>> {
        match self.callback.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Binds the accepted callback and transitions `Pending` -> `Open`.
    pub(crate) fn bind(&self, callback: Box<dyn ChannelCallback>) {
        *self.lock_callback() = Some(callback);
        *self.lock_state() = ChannelState::Open;
    }

    /// Fires `on_open` on the bound callback.
    ///
    /// Must run before any data dispatch for this id.
    pub(crate) fn notify_open(&self) -> ChannelResult<()> {
        match self.lock_callback().as_mut() {
            Some(callback) => callback.on_open(),
            None => Ok(()),
        }
    }

    /// Delivers a payload to the bound callback iff the channel is `Open`.
    ///
    /// Returns `Ok(false)` when the payload was dropped because of the
    /// channel state; the caller decides how to report that.
    pub(crate) fn deliver(&self, data: &[u8]) -> ChannelResult<bool> {
        let mut callback = self.lock_callback();

        // The state is re-checked under the callback lock: a racing close
        // flips the state first and then waits on this lock, so once it
        // completes no further delivery can slip through.
        if self.state() != ChannelState::Open {
            return Ok(false);
        }

        match callback.as_mut() {
            Some(callback) => {
                callback.on_data_received(data)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Performs the first effective close, whichever side initiates it.
    ///
    /// Waits for any in-flight write (state lock) and delivery (callback
    /// lock) to drain, then retires the callback so `on_close` can be
    /// delivered exactly once by the caller.
    pub(crate) fn take_for_close(&self) -> CloseOutcome {
        {
            let mut state = self.lock_state();
            // `Closing` counts as closed here: a concurrent closer claimed
            // the teardown and nothing parks a channel at `Closing` across
            // calls, so a second closer must not signal the peer again.
            if matches!(*state, ChannelState::Closing | ChannelState::Closed) {
                return CloseOutcome::AlreadyClosed;
            }
            *state = ChannelState::Closing;
        }

        let callback = self.lock_callback().take();
        *self.lock_state() = ChannelState::Closed;

        CloseOutcome::Closed(callback)
    }
}

/// Plugin-facing handle to one logical channel.
///
/// Cheap to clone; all clones refer to the same channel. Outbound calls on
/// the same channel are serialized against each other and may be issued
/// concurrently with inbound delivery.
#[derive(Clone)]
pub struct ChannelHandle {
    entry: Arc<ChannelEntry>,
    shared: Arc<SessionShared>,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChannelHandle({}:{} {:?})",
            self.entry.id(),
            self.entry.name(),
            self.entry.state()
        )
    }
}

impl ChannelHandle {
    pub(crate) fn new(entry: Arc<ChannelEntry>, shared: Arc<SessionShared>) -> Self {
        Self { entry, shared }
    }

    /// The channel id. Pure lookup, never fails for a valid handle.
    pub fn id(&self) -> ChannelId {
        self.entry.id()
    }

    /// The logical channel name this channel was opened under.
    pub fn name(&self) -> &str {
        self.entry.name()
    }

    /// Snapshot of the current channel state.
    pub fn state(&self) -> ChannelState {
        self.entry.state()
    }

    /// Starts a write request on the channel.
    ///
    /// The payload is one logical message; the manager fragments it per the
    /// transport's [`max_chunk_len`](crate::Transport::max_chunk_len)
    /// before handing it off. Returns the number of bytes accepted for
    /// transmission, which does not imply the peer has received anything.
    ///
    /// Fails with `SessionNotReady` while the session is not connected and
    /// with `ChannelClosed` unless the channel is `Open`. A close racing
    /// this call yields either full acceptance or `ChannelClosed`, never a
    /// partial message.
    pub fn write(&self, data: &[u8]) -> ChannelResult<usize> {
        if !self.shared.is_connected() {
            return Err(ChannelError::session_not_ready("channel write"));
        }

        let state = self.entry.lock_state();
        if *state != ChannelState::Open {
            return Err(ChannelError::channel_closed("channel write"));
        }

        // The state lock is held across the hand-off: this is what
        // serializes concurrent writers and keeps a racing close from
        // interleaving with a partially submitted message.
        let transport = self.shared.transport();
        match transport.max_chunk_len() {
            Some(max_len) if max_len > 0 && data.len() > max_len => {
                for chunk in data.chunks(max_len) {
                    transport
                        .send_channel_data(self.entry.id(), chunk)
                        .with_context("channel write")?;
                }
            }
            _ => transport
                .send_channel_data(self.entry.id(), data)
                .with_context("channel write")?,
        }
        drop(state);

        Ok(data.len())
    }

    /// Closes the channel.
    ///
    /// Idempotent: closing an already-closing or closed channel is a no-op
    /// success. The first effective close signals the peer, retires the id
    /// and delivers exactly one `on_close` to the owning callback.
    pub fn close(&self) -> ChannelResult<()> {
        self.shared.close_channel(&self.entry, true);
        Ok(())
    }
}
