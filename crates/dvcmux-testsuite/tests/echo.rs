use std::sync::Arc;

use dvcmux::{ChannelErrorKind, ChannelManager, ListenerFlags};
use dvcmux_echo::EchoPlugin;
use dvcmux_testsuite::{MockTransport, TransportOp};
use pretty_assertions::assert_eq;

fn echo_session() -> (Arc<ChannelManager>, MockTransport, Arc<dvcmux_echo::EchoCounters>) {
    let transport = MockTransport::new();
    let manager = Arc::new(ChannelManager::new(Box::new(transport.clone())));

    let plugin = EchoPlugin::new();
    let counters = plugin.counters();
    manager
        .register_plugin("echo", Box::new(plugin), vec!["echo".to_owned()])
        .expect("plugin registration should succeed");
    manager.on_session_connected().expect("session should connect");

    (manager, transport, counters)
}

#[test]
fn initialize_announces_the_echo_listener() {
    let (_manager, transport, _counters) = echo_session();

    assert_eq!(
        transport.ops(),
        vec![TransportOp::Announce {
            name: dvcmux_echo::CHANNEL_NAME.to_owned(),
            flags: ListenerFlags::empty()
        }]
    );
}

#[test]
fn inbound_payload_is_echoed_back_on_the_same_channel() {
    let (manager, transport, counters) = echo_session();

    let channel = manager
        .on_channel_open_request(dvcmux_echo::CHANNEL_NAME, b"")
        .expect("echo listener should accept");
    transport.take_ops();

    manager
        .on_channel_data(channel.id(), &[0x01, 0x02])
        .expect("data should reach the echo callback");

    assert_eq!(
        transport.ops(),
        vec![TransportOp::Data {
            channel_id: channel.id(),
            data: vec![0x01, 0x02]
        }]
    );
    assert_eq!(counters.channels_opened(), 1);
    assert_eq!(counters.bytes_echoed(), 2);
}

#[test]
fn echo_channels_are_independent() {
    let (manager, transport, counters) = echo_session();

    let first = manager
        .on_channel_open_request(dvcmux_echo::CHANNEL_NAME, b"")
        .expect("echo listener should accept");
    let second = manager
        .on_channel_open_request(dvcmux_echo::CHANNEL_NAME, b"")
        .expect("the echo listener is dynamic, not one-shot");
    assert_ne!(first.id(), second.id());
    transport.take_ops();

    manager
        .on_channel_data(second.id(), &[0xff; 3])
        .expect("data should reach the echo callback");

    assert_eq!(
        transport.ops(),
        vec![TransportOp::Data {
            channel_id: second.id(),
            data: vec![0xff; 3]
        }]
    );
    assert_eq!(counters.channels_opened(), 2);
    assert_eq!(counters.bytes_echoed(), 3);
}

#[test]
fn data_after_peer_close_is_dropped() {
    let (manager, transport, counters) = echo_session();

    let channel = manager
        .on_channel_open_request(dvcmux_echo::CHANNEL_NAME, b"")
        .expect("echo listener should accept");
    manager.on_channel_close(channel.id()).expect("peer close should be handled");
    transport.take_ops();

    let error = manager
        .on_channel_data(channel.id(), &[0x55])
        .expect_err("data for a retired id must be dropped");
    assert_eq!(error.kind(), ChannelErrorKind::ProtocolAnomaly);
    assert_eq!(transport.ops(), vec![]);
    assert_eq!(counters.bytes_echoed(), 0);
}

#[test]
fn typed_counter_access_through_the_registry() {
    let (manager, _transport, _counters) = echo_session();

    let channel = manager
        .on_channel_open_request(dvcmux_echo::CHANNEL_NAME, b"")
        .expect("echo listener should accept");
    manager
        .on_channel_data(channel.id(), &[0u8; 5])
        .expect("data should reach the echo callback");

    let echoed = manager
        .with_plugin::<EchoPlugin, _>("echo", |plugin| plugin.counters().bytes_echoed())
        .expect("the registered plugin is an EchoPlugin");
    assert_eq!(echoed, 5);
}
