//! ECHO plugin for the `dvcmux` multiplexer.
//!
//! Registers a listener on the `"ECHO"` channel name and writes every
//! payload it receives straight back on the same channel. Doubles as the
//! reference implementation of the plugin API.

#[macro_use]
extern crate tracing;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dvcmux::{
    impl_as_any, ChannelCallback, ChannelHandle, ChannelManager, ChannelResult, ConnectionRequest, Listener,
    ListenerCallback, ListenerFlags, Plugin,
};

/// ECHO dynamic virtual channel name.
pub const CHANNEL_NAME: &str = "ECHO";

/// Running totals kept by the plugin, observable from outside the session.
#[derive(Debug, Default)]
pub struct EchoCounters {
    channels_opened: AtomicUsize,
    bytes_echoed: AtomicUsize,
}

impl EchoCounters {
    pub fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::Acquire)
    }

    pub fn bytes_echoed(&self) -> usize {
        self.bytes_echoed.load(Ordering::Acquire)
    }
}

/// Plugin registering the ECHO listener at initialization.
#[derive(Debug, Default)]
pub struct EchoPlugin {
    counters: Arc<EchoCounters>,
    listener: Option<Listener>,
}

impl EchoPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> Arc<EchoCounters> {
        Arc::clone(&self.counters)
    }
}

impl_as_any!(EchoPlugin);

impl Plugin for EchoPlugin {
    fn initialize(&mut self, manager: &Arc<ChannelManager>) -> ChannelResult<()> {
        let callback = EchoListenerCallback {
            counters: Arc::clone(&self.counters),
        };
        let listener = manager.create_listener(CHANNEL_NAME, ListenerFlags::empty(), Box::new(callback), None)?;
        self.listener = Some(listener);
        Ok(())
    }

    fn terminated(&mut self) -> ChannelResult<()> {
        self.listener = None;
        Ok(())
    }
}

struct EchoListenerCallback {
    counters: Arc<EchoCounters>,
}

impl ListenerCallback for EchoListenerCallback {
    fn accept(
        &mut self,
        request: &ConnectionRequest<'_>,
        channel: ChannelHandle,
    ) -> ChannelResult<Option<Box<dyn ChannelCallback>>> {
        debug!(channel_name = request.channel_name(), channel_id = channel.id(), "accepting echo channel");

        Ok(Some(Box::new(EchoChannelCallback {
            channel,
            counters: Arc::clone(&self.counters),
        })))
    }
}

struct EchoChannelCallback {
    channel: ChannelHandle,
    counters: Arc<EchoCounters>,
}

impl ChannelCallback for EchoChannelCallback {
    fn on_open(&mut self) -> ChannelResult<()> {
        self.counters.channels_opened.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn on_data_received(&mut self, data: &[u8]) -> ChannelResult<()> {
        let written = self.channel.write(data)?;
        self.counters.bytes_echoed.fetch_add(written, Ordering::AcqRel);
        Ok(())
    }

    fn on_close(&mut self) {
        debug!(channel_id = self.channel.id(), "echo channel closed");
    }
}
