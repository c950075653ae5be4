use std::sync::Arc;

use dvcmux::{ChannelErrorKind, ChannelManager, PluginState, SessionEvent, SessionState};
use dvcmux_echo::EchoPlugin;
use dvcmux_testsuite::{CallbackEvent, CallbackLog, MockTransport, PluginCall, PluginLog, RecordingPlugin, TransportOp};
use pretty_assertions::assert_eq;

fn manager_with_plugins(names: &[&str]) -> (Arc<ChannelManager>, MockTransport, PluginLog) {
    let transport = MockTransport::new();
    let manager = Arc::new(ChannelManager::new(Box::new(transport.clone())));
    let log = PluginLog::new();

    for name in names {
        manager
            .register_plugin(name, Box::new(RecordingPlugin::new(name, log.clone())), vec![(*name).to_owned()])
            .expect("plugin registration should succeed");
    }

    (manager, transport, log)
}

#[test]
fn initialize_is_the_first_call_and_can_create_listeners() {
    let transport = MockTransport::new();
    let manager = Arc::new(ChannelManager::new(Box::new(transport.clone())));
    let plugin_log = PluginLog::new();
    let callback_log = CallbackLog::new();

    let plugin = RecordingPlugin::new("probe", plugin_log.clone()).with_listener("PROBE", callback_log);
    manager
        .register_plugin("probe", Box::new(plugin), vec![])
        .expect("plugin registration should succeed");

    assert_eq!(plugin_log.calls_for("probe"), vec![PluginCall::Initialize]);
    assert_eq!(manager.plugin_state("probe").expect("plugin is registered"), PluginState::Initialized);
    assert_eq!(
        transport.ops(),
        vec![TransportOp::Announce {
            name: "PROBE".to_owned(),
            flags: dvcmux::ListenerFlags::empty()
        }]
    );
}

#[test]
fn lifecycle_fans_out_in_registration_order() {
    let (manager, _transport, log) = manager_with_plugins(&["a", "b"]);

    manager.on_session_connected().expect("session should connect");
    manager.on_session_disconnected(7).expect("disconnect should be handled");
    manager.on_session_terminated().expect("terminate should be handled");

    assert_eq!(
        log.calls(),
        vec![
            ("a".to_owned(), PluginCall::Initialize),
            ("b".to_owned(), PluginCall::Initialize),
            ("a".to_owned(), PluginCall::Connected),
            ("b".to_owned(), PluginCall::Connected),
            ("a".to_owned(), PluginCall::Disconnected(7)),
            ("b".to_owned(), PluginCall::Disconnected(7)),
            ("a".to_owned(), PluginCall::Terminated),
            ("b".to_owned(), PluginCall::Terminated),
        ]
    );
}

#[test]
fn registering_after_connected_catches_the_plugin_up() {
    let (manager, _transport, log) = manager_with_plugins(&["early"]);
    manager.on_session_connected().expect("session should connect");

    manager
        .register_plugin("late", Box::new(RecordingPlugin::new("late", log.clone())), vec![])
        .expect("late registration should succeed");

    assert_eq!(log.calls_for("late"), vec![PluginCall::Initialize, PluginCall::Connected]);
}

#[test]
fn terminate_force_closes_open_channels_exactly_once() {
    let transport = MockTransport::new();
    let manager = Arc::new(ChannelManager::new(Box::new(transport.clone())));
    let plugin_log = PluginLog::new();
    let callback_log = CallbackLog::new();

    let plugin = RecordingPlugin::new("p", plugin_log.clone()).with_listener("DATA", callback_log.clone());
    manager
        .register_plugin("p", Box::new(plugin), vec![])
        .expect("plugin registration should succeed");
    manager.on_session_connected().expect("session should connect");

    let first = manager
        .on_channel_open_request("DATA", b"")
        .expect("open request should be accepted");
    let second = manager
        .on_channel_open_request("DATA", b"")
        .expect("open request should be accepted");

    manager.on_session_terminated().expect("terminate should be handled");

    // Both channels got exactly one on_close, before the plugin's
    // terminated call, and nothing is reachable afterwards.
    assert_eq!(
        callback_log.events_for(first.id()).last(),
        Some(&CallbackEvent::Closed)
    );
    assert_eq!(
        callback_log.events_for(second.id()).last(),
        Some(&CallbackEvent::Closed)
    );
    assert_eq!(
        callback_log.events_for(first.id()).iter().filter(|e| **e == CallbackEvent::Closed).count(),
        1
    );
    assert_eq!(
        callback_log.events_for(second.id()).iter().filter(|e| **e == CallbackEvent::Closed).count(),
        1
    );
    assert!(manager.find_channel_by_id(first.id()).is_err());
    assert!(manager.find_channel_by_id(second.id()).is_err());
    assert_eq!(plugin_log.calls_for("p").last(), Some(&PluginCall::Terminated));
    assert_eq!(manager.session_state(), SessionState::Terminated);
}

#[test]
fn registration_after_terminate_is_rejected() {
    let (manager, _transport, log) = manager_with_plugins(&["a"]);
    manager.on_session_connected().expect("session should connect");
    manager.on_session_terminated().expect("terminate should be handled");

    let error = manager
        .register_plugin("b", Box::new(RecordingPlugin::new("b", log.clone())), vec![])
        .expect_err("the registry is gone after termination");
    assert_eq!(error.kind(), ChannelErrorKind::General);
}

#[test]
fn duplicate_plugin_name_is_rejected() {
    let (manager, _transport, log) = manager_with_plugins(&["a"]);

    let error = manager
        .register_plugin("a", Box::new(RecordingPlugin::new("a", log.clone())), vec![])
        .expect_err("plugin names are unique per session");
    assert_eq!(error.kind(), ChannelErrorKind::DuplicateName);
}

#[test]
fn session_lifecycle_only_moves_forward() {
    let (manager, _transport, _log) = manager_with_plugins(&["a"]);

    manager.on_session_connected().expect("session should connect");
    let error = manager
        .on_session_connected()
        .expect_err("connected must not be revisited");
    assert_eq!(error.kind(), ChannelErrorKind::General);
}

#[test]
fn plugin_static_data_is_a_registry_pass_through() {
    let transport = MockTransport::new();
    let manager = Arc::new(ChannelManager::new(Box::new(transport)));
    let log = PluginLog::new();

    manager
        .register_plugin(
            "args",
            Box::new(RecordingPlugin::new("args", log)),
            vec!["args".to_owned(), "--verbose".to_owned()],
        )
        .expect("plugin registration should succeed");

    assert_eq!(
        manager.plugin_static_data("args").expect("plugin is registered"),
        vec!["args".to_owned(), "--verbose".to_owned()]
    );

    let error = manager
        .plugin_static_data("nosuch")
        .expect_err("unknown plugin name");
    assert_eq!(error.kind(), ChannelErrorKind::NotFound);
}

#[test]
fn session_settings_handle_is_exposed_to_plugins() {
    let transport = MockTransport::new();
    let manager = ChannelManager::new(Box::new(transport)).with_session_settings(Arc::new(42u32));

    let settings = manager
        .session_settings()
        .downcast::<u32>()
        .expect("settings were attached as a u32");
    assert_eq!(*settings, 42);
}

#[test]
fn typed_plugin_access_goes_through_as_any() {
    let (manager, _transport, _log) = manager_with_plugins(&["a"]);

    manager
        .with_plugin::<RecordingPlugin, _>("a", |_plugin| ())
        .expect("downcast to the concrete type should succeed");

    let error = manager
        .with_plugin::<EchoPlugin, _>("a", |_plugin| ())
        .expect_err("downcast to the wrong type must miss");
    assert_eq!(error.kind(), ChannelErrorKind::NotFound);
}

#[test]
fn pushed_events_reach_every_plugin_in_fifo_order() {
    let (manager, _transport, log) = manager_with_plugins(&["a", "b"]);

    manager.push_event(SessionEvent::new(1, vec![0xaa]));
    manager.push_event(SessionEvent::new(2, vec![0xbb]));
    manager.pump_events();

    for name in ["a", "b"] {
        let events: Vec<PluginCall> = log
            .calls_for(name)
            .into_iter()
            .filter(|call| matches!(call, PluginCall::Event(_)))
            .collect();
        assert_eq!(
            events,
            vec![
                PluginCall::Event(SessionEvent::new(1, vec![0xaa])),
                PluginCall::Event(SessionEvent::new(2, vec![0xbb])),
            ]
        );
    }
}

#[test]
fn events_pushed_after_a_pump_are_delivered_on_the_next_one() {
    let (manager, _transport, log) = manager_with_plugins(&["a"]);

    manager.push_event(SessionEvent::new(1, vec![]));
    manager.pump_events();
    manager.push_event(SessionEvent::new(2, vec![]));

    assert_eq!(
        log.calls_for("a").iter().filter(|c| matches!(c, PluginCall::Event(_))).count(),
        1
    );

    manager.pump_events();
    assert_eq!(
        log.calls_for("a").iter().filter(|c| matches!(c, PluginCall::Event(_))).count(),
        2
    );
}
