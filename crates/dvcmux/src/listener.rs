use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;

use crate::channel::{ChannelCallback, ChannelHandle};
use crate::error::{ChannelError, ChannelErrorExt as _, ChannelResult};

bitflags! {
    /// Listener creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListenerFlags: u32 {
        /// The listener admits exactly one channel over its lifetime.
        const STATIC = 0x0000_0001;
    }
}

/// An incoming channel-open request, as presented to admission control.
#[derive(Debug)]
pub struct ConnectionRequest<'a> {
    channel_name: &'a str,
    payload: &'a [u8],
}

impl<'a> ConnectionRequest<'a> {
    pub(crate) fn new(channel_name: &'a str, payload: &'a [u8]) -> Self {
        Self { channel_name, payload }
    }

    pub fn channel_name(&self) -> &str {
        self.channel_name
    }

    /// Opaque payload carried by the open request (e.g. a handshake blob).
    pub fn payload(&self) -> &[u8] {
        self.payload
    }
}

/// Admission control for one listener.
///
/// The sole extension point deciding whether an incoming channel-open
/// request is admitted, before any channel callback or resource is bound.
pub trait ListenerCallback: Send {
    /// Decides on an incoming request.
    ///
    /// Return `Some(callback)` to accept the channel and bind the callback,
    /// or `None` to refuse it; refusal is final for this request and the
    /// remote side is responsible for any retry. The provided handle is the
    /// channel the callback will own; it is still `Pending` while `accept`
    /// runs, so no I/O is possible yet.
    fn accept(
        &mut self,
        request: &ConnectionRequest<'_>,
        channel: ChannelHandle,
    ) -> ChannelResult<Option<Box<dyn ChannelCallback>>>;
}

assert_obj_safe!(ListenerCallback);

pub(crate) struct ListenerInner {
    name: String,
    flags: ListenerFlags,
    configuration: Option<Vec<u8>>,
    callback: Mutex<Box<dyn ListenerCallback>>,
    spawned: AtomicU32,
}

impl ListenerInner {
    pub(crate) fn new(
        name: String,
        flags: ListenerFlags,
        callback: Box<dyn ListenerCallback>,
        configuration: Option<Vec<u8>>,
    ) -> Self {
        Self {
            name,
            flags,
            configuration,
            callback: Mutex::new(callback),
            spawned: AtomicU32::new(0),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// A `STATIC` listener spawns exactly one channel over its lifetime.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.flags.contains(ListenerFlags::STATIC) && self.spawned.load(Ordering::Acquire) > 0
    }

    pub(crate) fn mark_spawned(&self) {
        self.spawned.fetch_add(1, Ordering::AcqRel);
    }

    /// Runs the plugin's accept decision.
    ///
    /// Serialized per listener; a slow decision stalls only new-channel
    /// admission for this name, never existing channel traffic.
    pub(crate) fn accept(
        &self,
        request: &ConnectionRequest<'_>,
        channel: ChannelHandle,
    ) -> ChannelResult<Option<Box<dyn ChannelCallback>>> {
        self.lock_callback().accept(request, channel)
    }

    fn lock_callback(&self) -> MutexGuard<'_, Box<dyn ListenerCallback>> {
        match self.callback.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Handle to a registered listener.
///
/// Remains valid until the listener is removed or the session terminates.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({:?}, {:?})", self.inner.name, self.inner.flags)
    }
}

impl Listener {
    pub(crate) fn new(inner: Arc<ListenerInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn flags(&self) -> ListenerFlags {
        self.inner.flags
    }

    /// Retrieves the listener-specific configuration blob supplied at
    /// creation, if any.
    pub fn configuration(&self) -> ChannelResult<Vec<u8>> {
        self.inner
            .configuration
            .clone()
            .ok_or_else(|| ChannelError::not_found("listener configuration"))
    }
}
