// Integration smoke test for the netplay service.
//
// Starts a `NetplayService` on localhost and talks to it with plain sockets
// using only the protocol crate's codecs: TCP registration, UDP input
// exchange between two players, desync reporting, and shutdown.

use std::io::{BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream, UdpSocket};
use std::sync::mpsc::Receiver;
use std::time::Duration;

use netplay_protocol::udp::CP0_BLOCK_LEN;
use netplay_protocol::{
    ClientDatagram, InputRecord, PlayerNumber, RegisterResponse, RegistrationId, ServerKeyInfo,
    TcpMessage,
};
use netplay_server::{NetplayEvent, NetplayService, ServerConfig, ServiceEvent};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn local_config() -> ServerConfig {
    ServerConfig {
        bind_address: LOCALHOST,
        ..ServerConfig::default()
    }
}

fn next_event(events: &Receiver<ServiceEvent>) -> ServiceEvent {
    events.recv_timeout(EVENT_TIMEOUT).unwrap()
}

/// Start a service and wait for it to report its port.
fn start() -> (NetplayService, Receiver<ServiceEvent>, u16) {
    let (service, events) = NetplayService::start(local_config()).unwrap();
    let port = match next_event(&events) {
        ServiceEvent::PortObtained(port) => port,
        other => panic!("expected PortObtained, got {other:?}"),
    };
    (service, events, port)
}

/// Drain events until `Finished`, returning what came before it.
fn drain_until_finished(events: &Receiver<ServiceEvent>) -> Vec<ServiceEvent> {
    let mut seen = Vec::new();
    loop {
        match next_event(events) {
            ServiceEvent::Finished => return seen,
            other => seen.push(other),
        }
    }
}

fn register(port: u16, player: PlayerNumber, registration: RegistrationId) -> TcpStream {
    let mut stream = TcpStream::connect((LOCALHOST, port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    TcpMessage::RegisterPlayer {
        player,
        plugin: 1,
        raw_mode: 0,
        registration,
    }
    .write_to(&mut stream)
    .unwrap();
    stream.flush().unwrap();
    let response = RegisterResponse::read_from(&mut BufReader::new(&stream)).unwrap();
    assert!(response.accepted);
    assert_eq!(response.buffer_target, 2);
    stream
}

fn udp_client() -> UdpSocket {
    let socket = UdpSocket::bind((LOCALHOST, 0)).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    socket
}

fn recv_run(socket: &UdpSocket) -> ServerKeyInfo {
    let mut buf = [0u8; 1024];
    let (len, _) = socket.recv_from(&mut buf).unwrap();
    ServerKeyInfo::decode(&buf[..len]).unwrap()
}

#[test]
fn two_players_exchange_inputs() {
    let (service, events, port) = start();
    assert_eq!(service.port(), Some(port));

    let p1 = PlayerNumber::new(0).unwrap();
    let p2 = PlayerNumber::new(1).unwrap();
    let _tcp1 = register(port, p1, RegistrationId(101));
    let _tcp2 = register(port, p2, RegistrationId(202));

    let udp1 = udp_client();
    let udp2 = udp_client();

    // Player 2 announces its endpoint with its first input.
    let key2 = ClientDatagram::KeyInfo {
        player: p2,
        count: 0,
        input: InputRecord::new(0, 1),
    };
    udp2.send_to(&key2.encode(), (LOCALHOST, port)).unwrap();
    // Wait until the server has seen it: player 1 polls player 2's inputs.
    let poll = ClientDatagram::RequestData {
        player: p2,
        registration: RegistrationId(101),
        count: 0,
        spectator: false,
        buffer_health: Some(2),
    };
    udp1.send_to(&poll.encode(), (LOCALHOST, port)).unwrap();
    let run = recv_run(&udp1);
    assert_eq!(run.player, p2);
    assert_eq!(run.inputs[0], (0, InputRecord::new(0, 1)));

    // Player 1's input is pushed to player 2 without a request.
    let key1 = ClientDatagram::KeyInfo {
        player: p1,
        count: 0,
        input: InputRecord::new(0x8000, 1),
    };
    udp1.send_to(&key1.encode(), (LOCALHOST, port)).unwrap();
    let run = recv_run(&udp2);
    assert_eq!(run.player, p1);
    assert_eq!(run.status, 0);
    assert_eq!(run.inputs[0], (0, InputRecord::new(0x8000, 1)));

    service.stop_servers();
    service.stop_servers();
    assert!(drain_until_finished(&events).is_empty());
}

#[test]
fn desync_is_reported_to_service_and_clients() {
    let (service, events, port) = start();
    let client = udp_client();

    for fill in [1u8, 2] {
        let cp0 = ClientDatagram::Cp0Data {
            vi_count: 60,
            block: Box::new([fill; CP0_BLOCK_LEN]),
        };
        client.send_to(&cp0.encode(), (LOCALHOST, port)).unwrap();
    }
    match next_event(&events) {
        ServiceEvent::Netplay(NetplayEvent::Desync { vi_count }) => assert_eq!(vi_count, 60),
        other => panic!("expected Desync, got {other:?}"),
    }

    let poll = ClientDatagram::RequestData {
        player: PlayerNumber::new(0).unwrap(),
        registration: RegistrationId(1),
        count: 0,
        spectator: false,
        buffer_health: Some(2),
    };
    client.send_to(&poll.encode(), (LOCALHOST, port)).unwrap();
    assert!(recv_run(&client).is_desynced());

    service.stop_servers();
    drain_until_finished(&events);
}

#[test]
fn disconnect_notice_is_reported() {
    let (service, events, port) = start();
    let player = PlayerNumber::new(2).unwrap();
    let mut tcp = register(port, player, RegistrationId(7));
    TcpMessage::DisconnectNotice {
        registration: RegistrationId(7),
    }
    .write_to(&mut tcp)
    .unwrap();
    tcp.flush().unwrap();

    match next_event(&events) {
        ServiceEvent::Netplay(NetplayEvent::PlayerDisconnected {
            player: left,
            registration,
        }) => {
            assert_eq!(left, player);
            assert_eq!(registration, RegistrationId(7));
        }
        other => panic!("expected PlayerDisconnected, got {other:?}"),
    }

    service.stop_servers();
    drain_until_finished(&events);
}

#[test]
fn start_fails_when_port_taken() {
    let taken = TcpListener::bind((LOCALHOST, 0)).unwrap();
    let config = ServerConfig {
        port: taken.local_addr().unwrap().port(),
        ..local_config()
    };
    let (_service, events) = NetplayService::start(config).unwrap();
    match next_event(&events) {
        ServiceEvent::StartFailed(reason) => assert!(reason.contains("TCP")),
        other => panic!("expected StartFailed, got {other:?}"),
    }
    assert_eq!(next_event(&events), ServiceEvent::Finished);
}

#[test]
fn stop_right_after_start_finishes() {
    let (service, events) = NetplayService::start(local_config()).unwrap();
    service.stop_servers();
    // The stop may land before or after binding; either way the service
    // finishes and never reports a failure.
    let seen = drain_until_finished(&events);
    assert!(
        seen.iter()
            .all(|event| matches!(event, ServiceEvent::PortObtained(_)))
    );
    service.shutdown();
}

#[test]
fn dropping_service_stops_it() {
    let (service, events, port) = start();
    drop(service);
    assert!(drain_until_finished(&events).is_empty());
    // Nothing listens any more.
    assert!(TcpStream::connect((LOCALHOST, port)).is_err());
}
