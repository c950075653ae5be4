use core::any::Any;
use core::fmt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::{ChannelCallback, ChannelEntry, ChannelHandle, ChannelId, ChannelState, CloseOutcome};
use crate::error::{ChannelError, ChannelErrorExt as _, ChannelResult};
use crate::event::SessionEvent;
use crate::listener::{ConnectionRequest, Listener, ListenerCallback, ListenerFlags, ListenerInner};
use crate::plugin::{Plugin, PluginRegistry, PluginState};
use crate::transport::Transport;

/// Session lifecycle as observed by the manager.
///
/// Strictly linear; the manager rejects any transition that does not move
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Initialized,
    Connected,
    Disconnected,
    Terminated,
}

/// State shared between the manager and every [`ChannelHandle`].
///
/// The channel table lock is only ever held for lookup, insert and remove;
/// callbacks are never invoked under it, so one channel's teardown cannot
/// stall unrelated channels.
pub(crate) struct SessionShared {
    transport: Box<dyn Transport>,
    session_state: Mutex<SessionState>,
    channels: Mutex<BTreeMap<ChannelId, Arc<ChannelEntry>>>,
    next_channel_id: AtomicU32,
}

impl SessionShared {
    fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            session_state: Mutex::new(SessionState::Initialized),
            channels: Mutex::new(BTreeMap::new()),
            next_channel_id: AtomicU32::new(1),
        }
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn session_state(&self) -> SessionState {
        *self.lock_session()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.session_state() == SessionState::Connected
    }

    fn advance_session(&self, to: SessionState) -> ChannelResult<()> {
        let mut state = self.lock_session();
        if to <= *state {
            return Err(ChannelError::general("session lifecycle must advance strictly forward"));
        }
        *state = to;
        Ok(())
    }

    /// Ids are allocated monotonically and never handed out twice, which is
    /// what retires a closed id for the rest of the session.
    fn allocate_channel_id(&self) -> ChannelId {
        self.next_channel_id.fetch_add(1, Ordering::Relaxed)
    }

    fn insert_channel(&self, entry: Arc<ChannelEntry>) {
        self.lock_channels().insert(entry.id(), entry);
    }

    fn find_channel(&self, id: ChannelId) -> Option<Arc<ChannelEntry>> {
        self.lock_channels().get(&id).map(Arc::clone)
    }

    fn retire_channel(&self, id: ChannelId) {
        self.lock_channels().remove(&id);
    }

    fn drain_channels(&self) -> Vec<Arc<ChannelEntry>> {
        let mut channels = self.lock_channels();
        core::mem::take(&mut *channels).into_values().collect()
    }

    fn channel_snapshot(&self) -> Vec<(ChannelId, String, ChannelState)> {
        self.lock_channels()
            .values()
            .map(|entry| (entry.id(), entry.name().to_owned(), entry.state()))
            .collect()
    }

    /// Performs the first effective close of a channel, whichever side
    /// initiated it: retires the id, signals the peer when asked to, and
    /// delivers the single `on_close` notification.
    pub(crate) fn close_channel(&self, entry: &Arc<ChannelEntry>, notify_peer: bool) {
        match entry.take_for_close() {
            CloseOutcome::AlreadyClosed => {}
            CloseOutcome::Closed(callback) => {
                self.retire_channel(entry.id());

                if notify_peer {
                    if let Err(e) = self.transport.send_channel_close(entry.id()) {
                        // In-flight data is abandoned on transport failure;
                        // the channel is closed either way.
                        warn!(
                            channel_id = entry.id(),
                            error = %e.report(),
                            "failed to signal channel close to the transport"
                        );
                    }
                }

                debug!(channel_id = entry.id(), channel_name = entry.name(), "channel closed");

                if let Some(mut callback) = callback {
                    callback.on_close();
                }
            }
        }
    }

    /// Retires a channel that never got past `Pending` (refused accept).
    /// No callback was bound, so there is nothing to notify.
    fn abort_pending(&self, entry: &Arc<ChannelEntry>) {
        let _ = entry.take_for_close();
        self.retire_channel(entry.id());
    }

    fn lock_session(&self) -> MutexGuard<'_, SessionState> {
        match self.session_state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_channels(&self) -> MutexGuard<'_, BTreeMap<ChannelId, Arc<ChannelEntry>>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The per-session channel manager.
///
/// Owns the set of active channels and listeners for one session,
/// demultiplexes inbound transport events to the right channel callback and
/// multiplexes outbound writes onto the transport. All state is
/// session-scoped and discarded at `Terminated`.
pub struct ChannelManager {
    shared: Arc<SessionShared>,
    listeners: Mutex<BTreeMap<String, Arc<ListenerInner>>>,
    registry: Mutex<PluginRegistry>,
    events: Mutex<VecDeque<SessionEvent>>,
    settings: Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelManager([")?;

        for (i, (id, name, state)) in self.shared.channel_snapshot().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}:{name} ({state:?})")?;
        }

        write!(f, "])")
    }
}

impl ChannelManager {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(SessionShared::new(transport)),
            listeners: Mutex::new(BTreeMap::new()),
            registry: Mutex::new(PluginRegistry::new()),
            events: Mutex::new(VecDeque::new()),
            settings: Arc::new(()),
        }
    }

    /// Attaches the opaque session settings handle exposed to plugins.
    #[must_use]
    pub fn with_session_settings(mut self, settings: Arc<dyn Any + Send + Sync>) -> Self {
        self.settings = settings;
        self
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.session_state()
    }

    /// Opaque settings handle for the session; pass-through for plugins.
    pub fn session_settings(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.settings)
    }

    /// Registers a plugin under a unique name and immediately initializes
    /// it: `initialize` is the first call ever made to a plugin and
    /// receives the manager handle. When the session is already connected,
    /// `connected` follows right away.
    pub fn register_plugin(
        self: &Arc<Self>,
        name: &str,
        plugin: Box<dyn Plugin>,
        static_data: Vec<String>,
    ) -> ChannelResult<()> {
        let session = self.shared.session_state();
        if session == SessionState::Terminated {
            return Err(ChannelError::general("cannot register a plugin after termination"));
        }

        self.lock_registry().register(name, plugin, static_data)?;
        debug!(plugin = name, "plugin registered");

        self.dispatch_plugin(name, PluginState::Initialized, |plugin| plugin.initialize(self))?;

        if session == SessionState::Connected {
            self.dispatch_plugin(name, PluginState::Connected, |plugin| plugin.connected())?;
        }

        Ok(())
    }

    /// Registry pass-through: the argv-like static data the plugin was
    /// registered with.
    pub fn plugin_static_data(&self, name: &str) -> ChannelResult<Vec<String>> {
        self.lock_registry().static_data(name)
    }

    pub fn plugin_state(&self, name: &str) -> ChannelResult<PluginState> {
        self.lock_registry().state(name)
    }

    /// Typed access to a registered plugin.
    pub fn with_plugin<P, R>(&self, name: &str, f: impl FnOnce(&P) -> R) -> ChannelResult<R>
    where
        P: Plugin,
    {
        self.lock_registry().with_plugin(name, f)
    }

    /// Registers a listener accepting channel-open requests for `name`.
    ///
    /// Fails with `DuplicateName` if a listener with that name already
    /// exists for this session. The listener is announced to the peer
    /// through the transport before it becomes visible.
    pub fn create_listener(
        &self,
        name: &str,
        flags: ListenerFlags,
        callback: Box<dyn ListenerCallback>,
        configuration: Option<Vec<u8>>,
    ) -> ChannelResult<Listener> {
        if self.shared.session_state() == SessionState::Terminated {
            return Err(ChannelError::general("cannot create a listener after termination"));
        }

        let mut listeners = self.lock_listeners();
        if listeners.contains_key(name) {
            return Err(ChannelError::duplicate_name("create listener"));
        }

        self.shared.transport().announce_listener(name, flags)?;

        let inner = Arc::new(ListenerInner::new(name.to_owned(), flags, callback, configuration));
        listeners.insert(name.to_owned(), Arc::clone(&inner));
        debug!(listener = name, ?flags, "listener registered");

        Ok(Listener::new(inner))
    }

    /// Removes a listener; channels it spawned are unaffected.
    pub fn remove_listener(&self, name: &str) -> ChannelResult<()> {
        self.lock_listeners()
            .remove(name)
            .map(|_| debug!(listener = name, "listener removed"))
            .ok_or_else(|| ChannelError::not_found("remove listener"))
    }

    /// Pure lookup; never fails for a valid handle.
    pub fn get_channel_id(&self, channel: &ChannelHandle) -> ChannelId {
        channel.id()
    }

    /// Looks up a live channel by id, as used by the inbound-dispatch path.
    pub fn find_channel_by_id(&self, id: ChannelId) -> ChannelResult<ChannelHandle> {
        self.shared
            .find_channel(id)
            .map(|entry| ChannelHandle::new(entry, Arc::clone(&self.shared)))
            .ok_or_else(|| ChannelError::not_found("find channel by id"))
    }

    /// Creates a manager-owned channel bound to no listener.
    ///
    /// The callback is bound and `on_open` fires before the handle is
    /// returned.
    pub fn create_static_channel(
        &self,
        name: &str,
        callback: Box<dyn ChannelCallback>,
    ) -> ChannelResult<ChannelHandle> {
        if !self.shared.is_connected() {
            return Err(ChannelError::session_not_ready("create static channel"));
        }

        let entry = Arc::new(ChannelEntry::new(
            self.shared.allocate_channel_id(),
            name.to_owned(),
        ));
        self.shared.insert_channel(Arc::clone(&entry));
        entry.bind(callback);
        debug!(channel_id = entry.id(), channel_name = name, "static channel created");

        let handle = ChannelHandle::new(Arc::clone(&entry), Arc::clone(&self.shared));

        if let Err(e) = entry.notify_open() {
            self.shared.close_channel(&entry, true);
            return Err(e);
        }

        Ok(handle)
    }

    /// Enqueues a session-scoped event for asynchronous delivery to every
    /// registered plugin.
    ///
    /// FIFO among events; delivery happens on [`pump_events`](Self::pump_events)
    /// and carries no ordering guarantee relative to channel data.
    pub fn push_event(&self, event: SessionEvent) {
        debug!(event_id = event.id(), "session event pushed");
        self.lock_events().push_back(event);
    }

    /// Drains the event queue, broadcasting each event to every plugin in
    /// registration order. Best effort: plugins cannot fail delivery.
    pub fn pump_events(&self) {
        loop {
            let event = self.lock_events().pop_front();
            let Some(event) = event else {
                break;
            };

            let names = self.lock_registry().names();
            for name in names {
                let plugin = self.lock_registry().check_out_for_event(&name);
                if let Some(mut plugin) = plugin {
                    plugin.on_event(&event);
                    self.lock_registry().check_in(&name, plugin);
                }
            }
        }
    }

    /// Handles a peer channel-open request for a named channel.
    ///
    /// Refusal (no listener, exhausted static listener, or the listener
    /// callback declining) is reported as `ChannelRefused` to the transport
    /// driver and is never session-fatal. On accept, a fresh id is
    /// allocated, the callback bound and `on_open` fired before this call
    /// returns, hence before any data dispatch for that id.
    pub fn on_channel_open_request(&self, channel_name: &str, payload: &[u8]) -> ChannelResult<ChannelHandle> {
        if !self.shared.is_connected() {
            return Err(ChannelError::session_not_ready("channel-open request"));
        }

        let listener = self.lock_listeners().get(channel_name).map(Arc::clone);
        let Some(listener) = listener else {
            warn!(channel_name, "channel-open request with no matching listener");
            return Err(ChannelError::channel_refused("no listener for channel name"));
        };

        if listener.is_exhausted() {
            warn!(channel_name, "static listener already spawned its channel");
            return Err(ChannelError::channel_refused("static listener exhausted"));
        }

        // The id is reserved and visible before the accept decision runs,
        // but the channel stays `Pending` so no data can flow yet. The
        // accept call itself runs outside every table lock.
        let entry = Arc::new(ChannelEntry::new(
            self.shared.allocate_channel_id(),
            channel_name.to_owned(),
        ));
        self.shared.insert_channel(Arc::clone(&entry));

        let handle = ChannelHandle::new(Arc::clone(&entry), Arc::clone(&self.shared));
        let request = ConnectionRequest::new(channel_name, payload);

        match listener.accept(&request, handle.clone()) {
            Ok(Some(callback)) => {
                listener.mark_spawned();
                entry.bind(callback);
                debug!(channel_id = entry.id(), channel_name, "channel open");

                if let Err(e) = entry.notify_open() {
                    self.shared.close_channel(&entry, true);
                    return Err(e);
                }

                Ok(handle)
            }
            Ok(None) => {
                self.shared.abort_pending(&entry);
                debug!(channel_id = entry.id(), channel_name, "channel refused by listener");
                Err(ChannelError::channel_refused("listener declined the request"))
            }
            Err(e) => {
                self.shared.abort_pending(&entry);
                Err(e)
            }
        }
    }

    /// Routes an inbound payload to the channel's callback.
    ///
    /// This is the per-message hot path. Data for an unknown id or a
    /// non-open channel is dropped and reported as `ProtocolAnomaly`;
    /// anomalies are diagnostic, never session-fatal.
    pub fn on_channel_data(&self, channel_id: ChannelId, data: &[u8]) -> ChannelResult<()> {
        let Some(entry) = self.shared.find_channel(channel_id) else {
            warn!(channel_id, "data for unknown channel id, dropping");
            return Err(ChannelError::protocol_anomaly("data for unknown channel id"));
        };

        if entry.deliver(data)? {
            Ok(())
        } else {
            warn!(channel_id, state = ?entry.state(), "data for non-open channel, dropping");
            Err(ChannelError::protocol_anomaly("data for non-open channel"))
        }
    }

    /// Handles a peer-initiated channel close.
    ///
    /// The owning callback receives exactly one `on_close`; a close for an
    /// already-retired id is a logged anomaly.
    pub fn on_channel_close(&self, channel_id: ChannelId) -> ChannelResult<()> {
        let Some(entry) = self.shared.find_channel(channel_id) else {
            warn!(channel_id, "close for unknown channel id");
            return Err(ChannelError::protocol_anomaly("close for unknown channel id"));
        };

        debug!(channel_id, "peer closed channel");
        self.shared.close_channel(&entry, true);
        Ok(())
    }

    /// The session handshake succeeded; notifies every plugin in
    /// registration order. Channel I/O becomes possible from this point.
    pub fn on_session_connected(&self) -> ChannelResult<()> {
        self.shared.advance_session(SessionState::Connected)?;
        debug!("session connected");
        self.for_each_plugin(PluginState::Connected, |plugin| plugin.connected())
    }

    /// The session disconnected with the given reason code.
    pub fn on_session_disconnected(&self, reason: u32) -> ChannelResult<()> {
        self.shared.advance_session(SessionState::Disconnected)?;
        debug!(reason, "session disconnected");
        self.for_each_plugin(PluginState::Disconnected, |plugin| plugin.disconnected(reason))
    }

    /// Final teardown.
    ///
    /// Deterministically force-closes every live channel (each bound
    /// callback receives its single `on_close`), drops all listeners and
    /// pending events, then calls `terminated` on every plugin and discards
    /// the registry. No callback is reachable once this returns.
    pub fn on_session_terminated(&self) -> ChannelResult<()> {
        self.shared.advance_session(SessionState::Terminated)?;
        debug!("session terminated, tearing down");

        for entry in self.shared.drain_channels() {
            self.shared.close_channel(&entry, false);
        }

        self.lock_listeners().clear();
        self.lock_events().clear();

        let result = self.for_each_plugin(PluginState::Terminated, |plugin| plugin.terminated());
        self.lock_registry().clear();
        result
    }

    /// Runs one lifecycle call with the plugin checked out of the registry,
    /// so the call may reenter the manager (create listeners, query its
    /// static data) without deadlocking.
    fn dispatch_plugin(
        &self,
        name: &str,
        to: PluginState,
        f: impl FnOnce(&mut dyn Plugin) -> ChannelResult<()>,
    ) -> ChannelResult<()> {
        let mut plugin = self.lock_registry().check_out(name, to)?;
        let result = f(plugin.as_mut());
        self.lock_registry().check_in(name, plugin);
        result
    }

    /// Lifecycle fan-out in registration order. A failing plugin does not
    /// block the others; the first error is reported once all ran.
    fn for_each_plugin(
        &self,
        to: PluginState,
        mut f: impl FnMut(&mut dyn Plugin) -> ChannelResult<()>,
    ) -> ChannelResult<()> {
        let mut first_error = None;

        let names = self.lock_registry().names();
        for name in names {
            if let Err(e) = self.dispatch_plugin(&name, to, &mut f) {
                warn!(plugin = %name, error = %e.report(), "plugin lifecycle call failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn lock_listeners(&self) -> MutexGuard<'_, BTreeMap<String, Arc<ListenerInner>>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, PluginRegistry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_events(&self) -> MutexGuard<'_, VecDeque<SessionEvent>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
