//! Shared fixtures for the dvcmux integration tests: a transport that
//! records every outbound call, plus recording channel callbacks and
//! plugins.

use std::sync::{Arc, Mutex, MutexGuard};

use dvcmux::{
    impl_as_any, ChannelCallback, ChannelError, ChannelErrorExt as _, ChannelHandle, ChannelId, ChannelManager,
    ChannelResult, ConnectionRequest, ListenerCallback, ListenerFlags, Plugin, SessionEvent, Transport,
};

/// One outbound call recorded by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    Announce { name: String, flags: ListenerFlags },
    Data { channel_id: ChannelId, data: Vec<u8> },
    Close { channel_id: ChannelId },
}

/// In-memory transport recording every outbound call.
///
/// Clones share the same recording, so tests keep a clone around while the
/// manager owns the boxed original.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    ops: Arc<Mutex<Vec<TransportOp>>>,
    max_chunk_len: Option<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_chunk_len(mut self, len: usize) -> Self {
        self.max_chunk_len = Some(len);
        self
    }

    /// Snapshot of everything sent so far.
    pub fn ops(&self) -> Vec<TransportOp> {
        self.lock_ops().clone()
    }

    /// Drains the recording.
    pub fn take_ops(&self) -> Vec<TransportOp> {
        self.lock_ops().drain(..).collect()
    }

    fn push(&self, op: TransportOp) {
        self.lock_ops().push(op);
    }

    fn lock_ops(&self) -> MutexGuard<'_, Vec<TransportOp>> {
        match self.ops.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Transport for MockTransport {
    fn announce_listener(&self, name: &str, flags: ListenerFlags) -> ChannelResult<()> {
        self.push(TransportOp::Announce {
            name: name.to_owned(),
            flags,
        });
        Ok(())
    }

    fn send_channel_data(&self, channel_id: ChannelId, data: &[u8]) -> ChannelResult<()> {
        self.push(TransportOp::Data {
            channel_id,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn send_channel_close(&self, channel_id: ChannelId) -> ChannelResult<()> {
        self.push(TransportOp::Close { channel_id });
        Ok(())
    }

    fn max_chunk_len(&self) -> Option<usize> {
        self.max_chunk_len
    }
}

/// Transport whose data path always fails with an I/O source error, for
/// error propagation tests. Listener announcement and close still succeed.
#[derive(Debug, Clone, Default)]
pub struct FaultyTransport;

impl Transport for FaultyTransport {
    fn announce_listener(&self, _name: &str, _flags: ListenerFlags) -> ChannelResult<()> {
        Ok(())
    }

    fn send_channel_data(&self, _channel_id: ChannelId, _data: &[u8]) -> ChannelResult<()> {
        Err(ChannelError::custom(
            "mock transport",
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "wire down"),
        ))
    }

    fn send_channel_close(&self, _channel_id: ChannelId) -> ChannelResult<()> {
        Ok(())
    }
}

/// One notification observed by a [`RecordingCallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    Opened,
    Data(Vec<u8>),
    Closed,
}

/// Shared log of `(channel id, notification)` pairs.
#[derive(Debug, Clone, Default)]
pub struct CallbackLog {
    events: Arc<Mutex<Vec<(ChannelId, CallbackEvent)>>>,
}

impl CallbackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(ChannelId, CallbackEvent)> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Notifications recorded for one channel, in delivery order.
    pub fn events_for(&self, channel_id: ChannelId) -> Vec<CallbackEvent> {
        self.events()
            .into_iter()
            .filter(|(id, _)| *id == channel_id)
            .map(|(_, event)| event)
            .collect()
    }

    fn push(&self, channel_id: ChannelId, event: CallbackEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push((channel_id, event)),
            Err(poisoned) => poisoned.into_inner().push((channel_id, event)),
        }
    }
}

/// Channel callback pushing every notification into a [`CallbackLog`].
pub struct RecordingCallback {
    channel: ChannelHandle,
    log: CallbackLog,
}

impl RecordingCallback {
    pub fn new(channel: ChannelHandle, log: CallbackLog) -> Self {
        Self { channel, log }
    }
}

impl ChannelCallback for RecordingCallback {
    fn on_open(&mut self) -> ChannelResult<()> {
        self.log.push(self.channel.id(), CallbackEvent::Opened);
        Ok(())
    }

    fn on_data_received(&mut self, data: &[u8]) -> ChannelResult<()> {
        self.log.push(self.channel.id(), CallbackEvent::Data(data.to_vec()));
        Ok(())
    }

    fn on_close(&mut self) {
        self.log.push(self.channel.id(), CallbackEvent::Closed);
    }
}

/// Listener callback accepting every request with a [`RecordingCallback`].
pub struct AcceptAll {
    log: CallbackLog,
}

impl AcceptAll {
    pub fn new(log: CallbackLog) -> Self {
        Self { log }
    }
}

impl ListenerCallback for AcceptAll {
    fn accept(
        &mut self,
        _request: &ConnectionRequest<'_>,
        channel: ChannelHandle,
    ) -> ChannelResult<Option<Box<dyn ChannelCallback>>> {
        Ok(Some(Box::new(RecordingCallback::new(channel, self.log.clone()))))
    }
}

/// Listener callback refusing requests with an empty accept payload,
/// admitting the rest.
pub struct PayloadGate {
    log: CallbackLog,
}

impl PayloadGate {
    pub fn new(log: CallbackLog) -> Self {
        Self { log }
    }
}

impl ListenerCallback for PayloadGate {
    fn accept(
        &mut self,
        request: &ConnectionRequest<'_>,
        channel: ChannelHandle,
    ) -> ChannelResult<Option<Box<dyn ChannelCallback>>> {
        if request.payload().is_empty() {
            return Ok(None);
        }

        Ok(Some(Box::new(RecordingCallback::new(channel, self.log.clone()))))
    }
}

/// One lifecycle call observed by a [`RecordingPlugin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginCall {
    Initialize,
    Connected,
    Disconnected(u32),
    Terminated,
    Event(SessionEvent),
}

/// Shared log of `(plugin name, call)` pairs, so fan-out order across
/// plugins is observable.
#[derive(Debug, Clone, Default)]
pub struct PluginLog {
    calls: Arc<Mutex<Vec<(String, PluginCall)>>>,
}

impl PluginLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, PluginCall)> {
        match self.calls.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn calls_for(&self, plugin: &str) -> Vec<PluginCall> {
        self.calls()
            .into_iter()
            .filter(|(name, _)| name == plugin)
            .map(|(_, call)| call)
            .collect()
    }

    fn push(&self, plugin: &str, call: PluginCall) {
        match self.calls.lock() {
            Ok(mut guard) => guard.push((plugin.to_owned(), call)),
            Err(poisoned) => poisoned.into_inner().push((plugin.to_owned(), call)),
        }
    }
}

/// Plugin recording its lifecycle calls, optionally registering an
/// accept-all listener during `initialize`.
pub struct RecordingPlugin {
    name: String,
    plugin_log: PluginLog,
    listener: Option<(String, CallbackLog)>,
}

impl RecordingPlugin {
    pub fn new(name: &str, plugin_log: PluginLog) -> Self {
        Self {
            name: name.to_owned(),
            plugin_log,
            listener: None,
        }
    }

    #[must_use]
    pub fn with_listener(mut self, channel_name: &str, log: CallbackLog) -> Self {
        self.listener = Some((channel_name.to_owned(), log));
        self
    }
}

impl_as_any!(RecordingPlugin);

impl Plugin for RecordingPlugin {
    fn initialize(&mut self, manager: &Arc<ChannelManager>) -> ChannelResult<()> {
        self.plugin_log.push(&self.name, PluginCall::Initialize);

        if let Some((channel_name, log)) = &self.listener {
            manager.create_listener(
                channel_name,
                ListenerFlags::empty(),
                Box::new(AcceptAll::new(log.clone())),
                None,
            )?;
        }

        Ok(())
    }

    fn connected(&mut self) -> ChannelResult<()> {
        self.plugin_log.push(&self.name, PluginCall::Connected);
        Ok(())
    }

    fn disconnected(&mut self, reason: u32) -> ChannelResult<()> {
        self.plugin_log.push(&self.name, PluginCall::Disconnected(reason));
        Ok(())
    }

    fn terminated(&mut self) -> ChannelResult<()> {
        self.plugin_log.push(&self.name, PluginCall::Terminated);
        Ok(())
    }

    fn on_event(&mut self, event: &SessionEvent) {
        self.plugin_log.push(&self.name, PluginCall::Event(event.clone()));
    }
}

/// Builds a connected manager with one accept-all listener, the common
/// starting point of the channel tests.
pub fn connected_manager_with_listener(
    channel_name: &str,
) -> (Arc<ChannelManager>, MockTransport, CallbackLog) {
    let transport = MockTransport::new();
    let manager = Arc::new(ChannelManager::new(Box::new(transport.clone())));
    let log = CallbackLog::new();

    manager
        .create_listener(
            channel_name,
            ListenerFlags::empty(),
            Box::new(AcceptAll::new(log.clone())),
            None,
        )
        .expect("listener registration should succeed");
    manager.on_session_connected().expect("session should connect");

    (manager, transport, log)
}
