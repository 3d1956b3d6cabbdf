//! Connection lifecycle, driven end to end through the registry and a
//! transport.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;

use netsim_tcp::config::SimConfig;
use netsim_tcp::device::Device;
use netsim_tcp::tcp::{ConnectionState, TcpEvent, TcpFlags, TcpManager};
use netsim_tcp::transport::{run_to_quiescence, ImmediateTransport, LatencyTransport};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn devices() -> (Device, Device) {
    (
        Device::new("pc-1", "Client PC"),
        Device::new("srv-1", "Web Server"),
    )
}

#[test]
fn three_way_handshake_establishes_both_sides() {
    init_logging();
    let mut manager = TcpManager::with_seed(SimConfig::default(), 11);
    let (client, server) = devices();

    let id = manager.create_connection(client, server, None, 80);
    manager.connect(&id);
    let mut wire = ImmediateTransport::new();
    run_to_quiescence(&mut manager, &mut wire);

    assert_eq!(
        manager.connection(&id).unwrap().state(),
        ConnectionState::Established
    );
    assert_eq!(
        manager.connection(&id.reversed()).unwrap().state(),
        ConnectionState::Established
    );
}

#[test]
fn handshake_segments_appear_in_order() {
    init_logging();
    let mut manager = TcpManager::with_seed(SimConfig::default(), 11);
    let (client, server) = devices();

    let flags = Rc::new(RefCell::new(Vec::new()));
    {
        let flags = Rc::clone(&flags);
        manager.subscribe(move |ev| {
            if let TcpEvent::SegmentSent { segment, .. } = ev {
                flags.borrow_mut().push(segment.flags());
            }
        });
    }

    let id = manager.create_connection(client, server, None, 80);
    manager.connect(&id);
    let mut wire = ImmediateTransport::new();
    run_to_quiescence(&mut manager, &mut wire);

    let flags = flags.borrow();
    assert_eq!(flags.len(), 3);
    assert_eq!(flags[0], TcpFlags::SYN);
    assert_eq!(flags[1], TcpFlags::SYN | TcpFlags::ACK);
    assert_eq!(flags[2], TcpFlags::ACK);
}

#[test]
fn handshake_works_over_a_delayed_wire() {
    init_logging();
    let mut manager = TcpManager::with_seed(SimConfig::default(), 11);
    let (client, server) = devices();

    let id = manager.create_connection(client, server, None, 80);
    manager.connect(&id);

    // 100ms each way: three legs land within 300ms, well inside the RTO.
    let mut wire = LatencyTransport::new(Duration::from_millis(100));
    for _ in 0..4 {
        run_to_quiescence(&mut manager, &mut wire);
        manager.advance(Duration::from_millis(100));
    }

    assert_eq!(
        manager.connection(&id).unwrap().state(),
        ConnectionState::Established
    );
}

#[test]
fn data_flows_after_establishment() {
    init_logging();
    let mut manager = TcpManager::with_seed(SimConfig::default(), 11);
    let (client, server) = devices();

    let received = Rc::new(RefCell::new(Vec::new()));
    {
        let received = Rc::clone(&received);
        manager.subscribe(move |ev| {
            if let TcpEvent::DataReceived { payload, .. } = ev {
                received.borrow_mut().push(payload.clone());
            }
        });
    }

    let id = manager.create_connection(client, server, None, 80);
    manager.connect(&id);
    let mut wire = ImmediateTransport::new();
    run_to_quiescence(&mut manager, &mut wire);

    assert!(manager.send(&id, Bytes::from_static(b"hello server")));
    run_to_quiescence(&mut manager, &mut wire);

    let received = received.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].as_ref(), b"hello server");
}

#[test]
fn close_walks_through_time_wait() {
    init_logging();
    let config = SimConfig::default();
    let time_wait = config.time_wait_timeout();
    let mut manager = TcpManager::with_seed(config, 11);
    let (client, server) = devices();

    let id = manager.create_connection(client, server, None, 80);
    let server_id = id.reversed();
    manager.connect(&id);
    let mut wire = ImmediateTransport::new();
    run_to_quiescence(&mut manager, &mut wire);

    // Active close from the client, passive close from the server.
    manager.close(&id);
    run_to_quiescence(&mut manager, &mut wire);
    assert_eq!(
        manager.connection(&server_id).unwrap().state(),
        ConnectionState::CloseWait
    );

    manager.close(&server_id);
    run_to_quiescence(&mut manager, &mut wire);
    assert_eq!(
        manager.connection(&id).unwrap().state(),
        ConnectionState::TimeWait
    );
    assert_eq!(
        manager.connection(&server_id).unwrap().state(),
        ConnectionState::Closed
    );

    manager.advance(time_wait);
    assert_eq!(
        manager.connection(&id).unwrap().state(),
        ConnectionState::Closed
    );
}

#[test]
fn send_before_connect_is_rejected() {
    init_logging();
    let mut manager = TcpManager::with_seed(SimConfig::default(), 11);
    let (client, server) = devices();

    let id = manager.create_connection(client, server, None, 80);
    assert!(!manager.send(&id, Bytes::from_static(b"nope")));
    assert!(!manager.has_outbound());
}

#[test]
fn ephemeral_ports_stay_unique_and_wrap() {
    init_logging();
    let config = SimConfig::default().with_ephemeral_port_start(65533);
    let mut manager = TcpManager::with_seed(config, 11);
    let (client, server) = devices();

    let a = manager.create_connection(client.clone(), server.clone(), None, 9000);
    let b = manager.create_connection(client.clone(), server.clone(), None, 9001);
    let c = manager.create_connection(client.clone(), server.clone(), None, 9002);
    assert_eq!(
        (a.local_port, b.local_port, c.local_port),
        (65533, 65534, 65535)
    );

    manager.remove_connection(&b);
    let d = manager.create_connection(client, server, None, 9003);
    assert_eq!(d.local_port, 65534);
}

#[test]
fn reset_tears_down_immediately() {
    init_logging();
    let mut manager = TcpManager::with_seed(SimConfig::default(), 11);
    let (client, server) = devices();

    let id = manager.create_connection(client, server, None, 80);
    manager.connect(&id);
    let mut wire = ImmediateTransport::new();
    run_to_quiescence(&mut manager, &mut wire);
    assert_eq!(manager.connection_count(), 2);

    manager.reset(&id);
    assert!(manager.connection(&id).is_none());
    assert!(manager
        .poll_events()
        .iter()
        .any(|ev| matches!(ev, TcpEvent::ConnectionReset { .. })));
}
