use super::*;
use crate::constants::{RELIABLE_CHANNEL, UNRELIABLE_CHANNEL};
use crate::network::context::{initialize, NetworkContext};
use crate::protocol::DeliveryType;

fn test_network() -> NetworkConfig {
    NetworkConfig {
        bind_address: "127.0.0.1".to_string(),
        retransmit_ms: 20,
        ping_interval_ms: 100,
        peer_timeout_ms: 400,
        ..Default::default()
    }
}

fn server_host(network: &NetworkConfig, slots: usize) -> Host {
    let mut config = HostConfig::server("127.0.0.1:0".parse().unwrap(), network);
    config.peer_limit = slots;
    Host::new(&config, network).unwrap()
}

fn client_host(network: &NetworkConfig) -> Host {
    Host::new(&HostConfig::client(network), network).unwrap()
}

/// Service every host with zero timeouts for `duration`, collecting events
fn pump(hosts: &mut [&mut Host], duration: Duration) -> Vec<Vec<HostEvent>> {
    let deadline = Instant::now() + duration;
    let mut events = vec![Vec::new(); hosts.len()];

    while Instant::now() < deadline {
        for (host, collected) in hosts.iter_mut().zip(events.iter_mut()) {
            while let Some(event) = host.service(Duration::ZERO).unwrap() {
                collected.push(event);
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    events
}

/// Pump until `done` holds or a second passes
fn pump_until(
    hosts: &mut [&mut Host],
    mut done: impl FnMut(&[Vec<HostEvent>]) -> bool,
) -> Vec<Vec<HostEvent>> {
    let deadline = Instant::now() + Duration::from_secs(1);
    let mut events = vec![Vec::new(); hosts.len()];

    while Instant::now() < deadline && !done(&events) {
        for (host, collected) in hosts.iter_mut().zip(events.iter_mut()) {
            while let Some(event) = host.service(Duration::ZERO).unwrap() {
                collected.push(event);
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    events
}

fn connects(events: &[HostEvent]) -> usize {
    events.iter().filter(|e| matches!(e, HostEvent::Connect { .. })).count()
}

fn disconnects(events: &[HostEvent]) -> usize {
    events.iter().filter(|e| matches!(e, HostEvent::Disconnect { .. })).count()
}

fn payloads(events: &[HostEvent], on_channel: u8) -> Vec<Bytes> {
    events
        .iter()
        .filter_map(|e| match e {
            HostEvent::Receive { channel, payload, .. } if *channel == on_channel => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

/// Connected (server, client, server-side id, client-side id)
fn connected_pair(network: &NetworkConfig) -> (NetworkContext, Host, Host, PeerId, PeerId) {
    let context = initialize();
    let mut server = server_host(network, 4);
    let mut client = client_host(network);

    let client_side = client
        .connect(server.local_addr().unwrap(), CHANNEL_COUNT)
        .unwrap();

    let events = pump_until(&mut [&mut server, &mut client], |events| {
        connects(&events[0]) == 1 && connects(&events[1]) == 1
    });
    assert_eq!(connects(&events[0]), 1);
    assert_eq!(connects(&events[1]), 1);

    let server_side = events[0][0].peer();
    (context, server, client, server_side, client_side)
}

#[test]
fn test_connect_handshake() {
    let network = test_network();
    let (_context, server, client, server_side, client_side) = connected_pair(&network);

    assert_eq!(server.connected_peers(), 1);
    assert_eq!(client.connected_peers(), 1);
    assert_eq!(server.peer_state(server_side), Some(PeerState::Connected));
    assert_eq!(client.peer_state(client_side), Some(PeerState::Connected));

    // The client learns which slot the server gave it
    assert_eq!(client.remote_peer_id(client_side), Some(server_side));
    assert_eq!(
        server.peer_address(server_side).map(|a| a.port()),
        client.local_addr().ok().map(|a| a.port())
    );
}

#[test]
fn test_reliable_delivery_in_order() {
    let network = test_network();
    let (_context, mut server, mut client, _, client_side) = connected_pair(&network);

    let delivery = DeliveryType::Reliable;
    for i in 0..20u8 {
        client
            .send(client_side, delivery.channel(), delivery.flags(), &[i])
            .unwrap();
    }
    client.flush().unwrap();

    let events = pump_until(&mut [&mut server, &mut client], |events| {
        payloads(&events[0], RELIABLE_CHANNEL).len() == 20
    });

    let received: Vec<u8> = payloads(&events[0], RELIABLE_CHANNEL)
        .iter()
        .map(|p| p[0])
        .collect();
    assert_eq!(received, (0..20u8).collect::<Vec<_>>());
}

#[test]
fn test_unsequenced_delivery() {
    let network = test_network();
    let (_context, mut server, mut client, server_side, _) = connected_pair(&network);

    let delivery = DeliveryType::Unreliable;
    server
        .send(server_side, delivery.channel(), delivery.flags(), b"1-2,3")
        .unwrap();
    server.flush().unwrap();

    let events = pump_until(&mut [&mut server, &mut client], |events| {
        !payloads(&events[1], UNRELIABLE_CHANNEL).is_empty()
    });
    assert_eq!(payloads(&events[1], UNRELIABLE_CHANNEL), vec![Bytes::from_static(b"1-2,3")]);
}

#[test]
fn test_broadcast_reaches_every_peer() {
    let network = test_network();
    let _context = initialize();
    let mut server = server_host(&network, 4);
    let mut first = client_host(&network);
    let mut second = client_host(&network);

    let address = server.local_addr().unwrap();
    first.connect(address, CHANNEL_COUNT).unwrap();
    second.connect(address, CHANNEL_COUNT).unwrap();

    pump_until(&mut [&mut server, &mut first, &mut second], |events| {
        connects(&events[0]) == 2
    });
    assert_eq!(server.connected_peers(), 2);

    let delivery = DeliveryType::Reliable;
    server
        .broadcast(delivery.channel(), delivery.flags(), b"0-3,4")
        .unwrap();
    server.flush().unwrap();

    let events = pump(&mut [&mut server, &mut first, &mut second], Duration::from_millis(100));
    assert_eq!(payloads(&events[1], RELIABLE_CHANNEL), vec![Bytes::from_static(b"0-3,4")]);
    assert_eq!(payloads(&events[2], RELIABLE_CHANNEL), vec![Bytes::from_static(b"0-3,4")]);
}

#[test]
fn test_graceful_disconnect() {
    let network = test_network();
    let (_context, mut server, mut client, server_side, client_side) = connected_pair(&network);

    client.disconnect(client_side);
    assert_eq!(client.peer_state(client_side), Some(PeerState::Disconnecting));

    let events = pump_until(&mut [&mut server, &mut client], |events| {
        disconnects(&events[0]) == 1 && disconnects(&events[1]) == 1
    });
    assert_eq!(events[0], vec![HostEvent::Disconnect { peer: server_side }]);
    assert_eq!(events[1], vec![HostEvent::Disconnect { peer: client_side }]);

    assert_eq!(server.connected_peers(), 0);
    assert_eq!(client.connected_peers(), 0);
    assert_eq!(client.peer_state(client_side), Some(PeerState::Disconnected));
    assert_eq!(server.peer_state(server_side), Some(PeerState::Disconnected));
}

#[test]
fn test_reset_is_silent() {
    let network = test_network();
    let (_context, mut server, mut client, _, client_side) = connected_pair(&network);

    client.reset(client_side);
    assert_eq!(client.peer_state(client_side), Some(PeerState::Disconnected));

    let events = pump(&mut [&mut server, &mut client], Duration::from_millis(50));
    assert!(events[1].is_empty());
    // The server only notices once its keepalives go unanswered.
    assert_eq!(server.connected_peers(), 1);
}

#[test]
fn test_dead_peer_times_out() {
    let network = test_network();
    let (_context, server, mut client, _, client_side) = connected_pair(&network);
    drop(server);

    let events = pump_until(&mut [&mut client], |events| disconnects(&events[0]) == 1);
    assert_eq!(events[0], vec![HostEvent::Disconnect { peer: client_side }]);
    assert_eq!(client.connected_peers(), 0);
}

#[test]
fn test_full_server_ignores_connect() {
    let network = test_network();
    let _context = initialize();
    let mut server = server_host(&network, 1);
    let mut first = client_host(&network);
    let mut second = client_host(&network);

    let address = server.local_addr().unwrap();
    first.connect(address, CHANNEL_COUNT).unwrap();
    pump_until(&mut [&mut server, &mut first], |events| connects(&events[0]) == 1);

    let refused = second.connect(address, CHANNEL_COUNT).unwrap();
    let events = pump_until(&mut [&mut server, &mut first, &mut second], |events| {
        disconnects(&events[2]) == 1
    });

    assert_eq!(connects(&events[0]), 0);
    assert_eq!(events[2], vec![HostEvent::Disconnect { peer: refused }]);
    assert_eq!(server.connected_peers(), 1);
}

#[test]
fn test_connect_to_closed_port_times_out() {
    let network = test_network();
    let _context = initialize();

    let closed = {
        let scratch = UdpSocket::bind("127.0.0.1:0").unwrap();
        scratch.local_addr().unwrap()
    };

    let mut client = client_host(&network);
    let peer = client.connect(closed, CHANNEL_COUNT).unwrap();

    let events = pump_until(&mut [&mut client], |events| disconnects(&events[0]) == 1);
    assert_eq!(events[0], vec![HostEvent::Disconnect { peer }]);
}

#[test]
fn test_client_host_allows_one_connection() {
    let network = test_network();
    let _context = initialize();
    let mut client = client_host(&network);
    let target = "127.0.0.1:9".parse().unwrap();

    client.connect(target, CHANNEL_COUNT).unwrap();
    assert!(matches!(
        client.connect(target, CHANNEL_COUNT),
        Err(NetworkError::PeerLimitReached)
    ));
    assert!(matches!(
        client.connect(target, 0),
        Err(NetworkError::InvalidChannel { .. })
    ));
}

#[test]
fn test_send_validation() {
    let network = test_network();
    let (_context, _server, mut client, _, client_side) = connected_pair(&network);
    let flags = DeliveryType::Reliable.flags();

    assert!(matches!(
        client.send(client_side + 1, RELIABLE_CHANNEL, flags, b"x"),
        Err(NetworkError::UnknownPeer(_))
    ));
    assert!(matches!(
        client.send(client_side, CHANNEL_COUNT, flags, b"x"),
        Err(NetworkError::InvalidChannel { .. })
    ));
    assert!(matches!(
        client.send(client_side, RELIABLE_CHANNEL, flags, &vec![0u8; MAX_PAYLOAD_SIZE + 1]),
        Err(NetworkError::PayloadTooLarge { .. })
    ));
}

#[test]
fn test_service_waits_for_timeout() {
    let network = test_network();
    let _context = initialize();
    let mut host = client_host(&network);

    let start = Instant::now();
    assert_eq!(host.service(Duration::from_millis(30)).unwrap(), None);
    assert!(start.elapsed() >= Duration::from_millis(30));

    assert_eq!(host.service(Duration::ZERO).unwrap(), None);
}

#[test]
fn test_reset_discards_queued_events() {
    let network = test_network();
    let (_context, mut server, mut client, server_side, client_side) = connected_pair(&network);

    let delivery = DeliveryType::Reliable;
    client
        .send(client_side, delivery.channel(), delivery.flags(), b"late")
        .unwrap();
    client.flush().unwrap();
    thread::sleep(Duration::from_millis(20));

    // Pull the datagram off the socket without dispatching its event.
    server.receive().unwrap();
    server.reset(server_side);
    assert_eq!(server.service(Duration::ZERO).unwrap(), None);
}

#[test]
fn test_stats_count_traffic() {
    let network = test_network();
    let (_context, server, client, _, _) = connected_pair(&network);

    assert!(client.stats().packets_sent >= 2);
    assert!(server.stats().packets_received >= 2);
    assert!(server.stats().bytes_received >= 2 * crate::protocol::HEADER_SIZE as u64);
}

/// Throw away everything `host` has queued for `peer`
fn drop_outgoing(host: &mut Host, peer: PeerId) -> usize {
    let mut dropped = 0;
    while host.peers[peer as usize].pop_outgoing().is_some() {
        dropped += 1;
    }
    dropped
}

#[test]
fn test_handshake_completes_without_retransmission() {
    let network = NetworkConfig {
        retransmit_ms: 1000,
        ping_interval_ms: 5000,
        peer_timeout_ms: 5000,
        ..test_network()
    };
    let _context = initialize();
    let mut server = server_host(&network, 2);
    let mut client = client_host(&network);
    client.connect(server.local_addr().unwrap(), CHANNEL_COUNT).unwrap();

    let events = pump(&mut [&mut server, &mut client], Duration::from_millis(300));
    assert_eq!(connects(&events[1]), 1);
    assert_eq!(connects(&events[0]), 1);
    assert_eq!(server.connected_peers(), 1);
}

#[test]
fn test_lost_datagram_behind_full_reorder_buffer() {
    let network = test_network();
    let (_context, mut server, mut client, _, client_side) = connected_pair(&network);

    let delivery = DeliveryType::Reliable;
    for i in 0..300u16 {
        client
            .send(client_side, delivery.channel(), delivery.flags(), &i.to_le_bytes())
            .unwrap();
    }
    // The first one never makes it onto the wire.
    assert!(client.peers[client_side as usize].pop_outgoing().is_some());
    client.flush().unwrap();

    let events = pump_until(&mut [&mut server, &mut client], |events| {
        payloads(&events[0], RELIABLE_CHANNEL).len() >= 300
    });

    let received: Vec<u16> = payloads(&events[0], RELIABLE_CHANNEL)
        .iter()
        .map(|p| u16::from_le_bytes([p[0], p[1]]))
        .collect();
    assert_eq!(received, (0..300u16).collect::<Vec<_>>());
    assert_eq!(server.connected_peers(), 1);
}

#[test]
fn test_lost_data_is_retransmitted_in_order() {
    let network = test_network();
    let (_context, mut server, mut client, _, client_side) = connected_pair(&network);
    let delivery = DeliveryType::Reliable;

    client.send(client_side, delivery.channel(), delivery.flags(), b"first").unwrap();
    assert_eq!(drop_outgoing(&mut client, client_side), 1);
    client.send(client_side, delivery.channel(), delivery.flags(), b"second").unwrap();
    client.flush().unwrap();

    let events = pump_until(&mut [&mut server, &mut client], |events| {
        payloads(&events[0], RELIABLE_CHANNEL).len() >= 2
    });
    assert_eq!(
        payloads(&events[0], RELIABLE_CHANNEL),
        vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
    );
}

#[test]
fn test_lost_ack_delivers_once() {
    let network = test_network();
    let (_context, mut server, mut client, server_side, client_side) = connected_pair(&network);
    let delivery = DeliveryType::Reliable;

    client.send(client_side, delivery.channel(), delivery.flags(), b"once").unwrap();
    client.flush().unwrap();
    thread::sleep(Duration::from_millis(10));

    // The server takes the data but its ack is lost.
    assert!(server.receive().unwrap() >= 1);
    assert!(drop_outgoing(&mut server, server_side) >= 1);

    let events = pump(&mut [&mut server, &mut client], Duration::from_millis(200));
    assert_eq!(payloads(&events[0], RELIABLE_CHANNEL), vec![Bytes::from_static(b"once")]);
    assert_eq!(server.connected_peers(), 1);
    assert_eq!(client.connected_peers(), 1);
}

#[test]
fn test_lost_verify_connect_ack_is_recovered() {
    let network = test_network();
    let _context = initialize();
    let mut server = server_host(&network, 2);
    let mut client = client_host(&network);

    let client_side = client.connect(server.local_addr().unwrap(), CHANNEL_COUNT).unwrap();
    client.flush().unwrap();
    thread::sleep(Duration::from_millis(10));

    // The server accepts and answers with VerifyConnect.
    assert_eq!(server.service(Duration::ZERO).unwrap(), None);
    thread::sleep(Duration::from_millis(10));

    // The client connects, but its ack never leaves.
    assert!(client.receive().unwrap() >= 1);
    assert_eq!(client.peer_state(client_side), Some(PeerState::Connected));
    assert!(drop_outgoing(&mut client, client_side) >= 1);

    let events = pump_until(&mut [&mut server, &mut client], |events| connects(&events[0]) == 1);
    assert_eq!(connects(&events[0]), 1);
    assert_eq!(connects(&events[1]), 1);
    assert_eq!(server.connected_peers(), 1);
}

#[test]
fn test_half_open_connect_expires_silently() {
    let network = test_network();
    let _context = initialize();
    let mut server = server_host(&network, 2);

    let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
    raw.send_to(&Packet::connect(0, CHANNEL_COUNT, 4242).serialize(), server.local_addr().unwrap())
        .unwrap();

    let events = pump(&mut [&mut server], Duration::from_millis(50));
    assert!(events[0].is_empty());
    assert_eq!(server.peer_state(0), Some(PeerState::AcknowledgingConnect));

    // Past the peer timeout the slot is simply released.
    let events = pump(&mut [&mut server], Duration::from_millis(600));
    assert!(events[0].is_empty());
    assert_eq!(server.peer_state(0), Some(PeerState::Disconnected));
}

#[test]
fn test_disconnect_before_connected_is_silent() {
    let network = test_network();
    let _context = initialize();
    let mut server = server_host(&network, 2);

    let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
    raw.send_to(&Packet::connect(0, CHANNEL_COUNT, 4243).serialize(), server.local_addr().unwrap())
        .unwrap();
    pump(&mut [&mut server], Duration::from_millis(30));
    assert_eq!(server.peer_state(0), Some(PeerState::AcknowledgingConnect));

    server.disconnect(0);
    assert_eq!(server.peer_state(0), Some(PeerState::Disconnected));
    assert_eq!(server.service(Duration::ZERO).unwrap(), None);

    let mut client = client_host(&network);
    let attempt = client.connect(server.local_addr().unwrap(), CHANNEL_COUNT).unwrap();
    client.disconnect(attempt);
    assert_eq!(client.peer_state(attempt), Some(PeerState::Disconnected));
    assert_eq!(client.service(Duration::ZERO).unwrap(), None);
}

#[test]
fn test_injected_receive_failure() {
    let network = test_network();
    let _context = initialize();
    let mut host = client_host(&network);

    host.fail_receive_after(1);
    assert_eq!(host.service(Duration::ZERO).unwrap(), None);
    assert!(matches!(
        host.service(Duration::ZERO),
        Err(NetworkError::ReceiveFailed(_))
    ));
    assert_eq!(host.service(Duration::ZERO).unwrap(), None);
}
