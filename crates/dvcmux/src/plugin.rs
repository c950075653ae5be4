use std::sync::Arc;

use crate::as_any::AsAny;
use crate::error::{ChannelError, ChannelErrorExt as _, ChannelResult};
use crate::event::SessionEvent;
use crate::manager::ChannelManager;

/// A channel plugin.
///
/// Lifecycle calls arrive in a strictly linear order, no state revisited:
/// `initialize` -> `connected` -> `disconnected` -> `terminated`.
pub trait Plugin: AsAny + Send {
    /// First call ever made to the plugin.
    ///
    /// The manager handle is the plugin's only avenue to create listeners.
    fn initialize(&mut self, manager: &Arc<ChannelManager>) -> ChannelResult<()>;

    /// The session handshake succeeded; channel I/O is possible from now on.
    fn connected(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    /// The session disconnected with the given reason code.
    fn disconnected(&mut self, reason: u32) -> ChannelResult<()> {
        let _ = reason;
        Ok(())
    }

    /// Final call; every channel and listener the plugin still owned has
    /// already been force-closed by the manager.
    fn terminated(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    /// Receives the best-effort session event stream
    /// (see [`ChannelManager::push_event`]).
    fn on_event(&mut self, event: &SessionEvent) {
        let _ = event;
    }
}

assert_obj_safe!(Plugin);

/// Plugin lifecycle state, advanced by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PluginState {
    Uninitialized,
    Initialized,
    Connected,
    Disconnected,
    Terminated,
}

pub(crate) struct PluginEntry {
    // `None` only while the plugin is checked out for a lifecycle call, so
    // those calls can reenter the registry (static data, typed lookup).
    plugin: Option<Box<dyn Plugin>>,
    state: PluginState,
    static_data: Vec<String>,
}

/// Session-scoped plugin registry.
///
/// Owned by the channel manager, constructed at session start and torn
/// down at `Terminated`; nothing here outlives the session.
pub(crate) struct PluginRegistry {
    // Registration order drives lifecycle fan-out order.
    entries: Vec<(String, PluginEntry)>,
}

impl PluginRegistry {
    pub(crate) fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub(crate) fn register(
        &mut self,
        name: &str,
        plugin: Box<dyn Plugin>,
        static_data: Vec<String>,
    ) -> ChannelResult<()> {
        if self.entries.iter().any(|(n, _)| n == name) {
            return Err(ChannelError::duplicate_name("register plugin"));
        }

        self.entries.push((
            name.to_owned(),
            PluginEntry {
                plugin: Some(plugin),
                state: PluginState::Uninitialized,
                static_data,
            },
        ));

        Ok(())
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub(crate) fn static_data(&self, name: &str) -> ChannelResult<Vec<String>> {
        self.entry(name)
            .map(|entry| entry.static_data.clone())
            .ok_or_else(|| ChannelError::not_found("plugin static data"))
    }

    pub(crate) fn state(&self, name: &str) -> ChannelResult<PluginState> {
        self.entry(name)
            .map(|entry| entry.state)
            .ok_or_else(|| ChannelError::not_found("plugin state"))
    }

    pub(crate) fn with_plugin<P, R>(&self, name: &str, f: impl FnOnce(&P) -> R) -> ChannelResult<R>
    where
        P: Plugin,
    {
        let plugin = self
            .entry(name)
            .and_then(|entry| entry.plugin.as_deref())
            .ok_or_else(|| ChannelError::not_found("plugin lookup"))?;

        let plugin = plugin
            .as_any()
            .downcast_ref::<P>()
            .ok_or_else(|| ChannelError::not_found("plugin type mismatch"))?;

        Ok(f(plugin))
    }

    /// Checks the plugin out for a lifecycle call, validating that the
    /// transition only ever moves forward.
    pub(crate) fn check_out(&mut self, name: &str, to: PluginState) -> ChannelResult<Box<dyn Plugin>> {
        let entry = self
            .entry_mut(name)
            .ok_or_else(|| ChannelError::not_found("plugin check-out"))?;

        if to <= entry.state {
            return Err(ChannelError::general("plugin lifecycle must advance strictly forward"));
        }

        let plugin = entry
            .plugin
            .take()
            .ok_or_else(|| ChannelError::general("plugin already checked out"))?;

        entry.state = to;
        Ok(plugin)
    }

    /// Checks the plugin out without a state change, for event delivery.
    pub(crate) fn check_out_for_event(&mut self, name: &str) -> Option<Box<dyn Plugin>> {
        self.entry_mut(name).and_then(|entry| entry.plugin.take())
    }

    pub(crate) fn check_in(&mut self, name: &str, plugin: Box<dyn Plugin>) {
        if let Some(entry) = self.entry_mut(name) {
            entry.plugin = Some(plugin);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    fn entry(&self, name: &str) -> Option<&PluginEntry> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, entry)| entry)
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut PluginEntry> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, entry)| entry)
    }
}
