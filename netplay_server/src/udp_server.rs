// UDP input-exchange server.
//
// Architecture: two threads around one `SyncEngine` behind a mutex.
//
// - **Receive thread**: `recv_from` loop on the bound socket. Each datagram
//   is handed to the engine under the lock; the packets the engine returns
//   are sent after the lock is released.
// - **Tick thread**: calls `SyncEngine::on_tick` every `tick_interval`. It
//   sleeps on `recv_timeout` of a stop channel, so dropping the sender wakes
//   it immediately on shutdown. The engine ignores ticks until the first CP0
//   snapshot has arrived.
//
// TCP handlers reach the engine through `register_player` /
// `disconnect_player`, which take the same lock.
//
// Shutdown: `stop()` clears the `running` flag and drops the tick channel's
// sender. std offers no way to close a socket out from under a thread blocked
// in `recv_from`, so the short read timeout stands in for that: the receive
// loop notices the flag within one timeout and exits, dropping (closing) the
// socket. `wait()` joins both threads. Both are idempotent.
//
// Engine events are drained after every locked operation and forwarded to
// the `Sender<NetplayEvent>` given at construction.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use netplay_protocol::{PlayerNumber, RegistrationId};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::event::NetplayEvent;
use crate::sync::{OutgoingPacket, SyncEngine};

/// How long a blocked `recv_from` waits before re-checking `running`.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Largest datagram we read. Client datagrams are at most 133 bytes.
const RECV_BUFFER_LEN: usize = 1024;

pub struct UdpServer {
    engine: Arc<Mutex<SyncEngine>>,
    events: Sender<NetplayEvent>,
    tick_interval: Duration,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    port: Mutex<Option<u16>>,
    tick_stop: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpServer {
    pub fn new(config: &ServerConfig, events: Sender<NetplayEvent>) -> Self {
        Self {
            engine: Arc::new(Mutex::new(SyncEngine::new(config))),
            events,
            tick_interval: config.tick_interval(),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            port: Mutex::new(None),
            tick_stop: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Bind `address:port` and start the receive and tick threads. Returns
    /// the bound port.
    pub fn bind(&self, address: IpAddr, port: u16) -> Result<u16, ServerError> {
        let mut bound = self.port.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ServerError::Stopped);
        }
        if bound.is_some() {
            return Err(ServerError::AlreadyBound);
        }

        let addr = SocketAddr::new(address, port);
        let socket = UdpSocket::bind(addr).map_err(|source| ServerError::Bind {
            transport: "UDP",
            addr,
            source,
        })?;
        socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;
        let local = socket.local_addr()?;

        self.running.store(true, Ordering::SeqCst);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        *self.tick_stop.lock() = Some(stop_tx);

        let receiver = {
            let engine = self.engine.clone();
            let events = self.events.clone();
            let running = self.running.clone();
            thread::Builder::new()
                .name("netplay-udp-recv".into())
                .spawn(move || receive_loop(socket, engine, events, running))?
        };
        let ticker = {
            let engine = self.engine.clone();
            let events = self.events.clone();
            let interval = self.tick_interval;
            thread::Builder::new()
                .name("netplay-udp-tick".into())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let mut engine = engine.lock();
                            engine.on_tick();
                            forward_events(&mut engine, &events);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                })?
        };
        self.threads.lock().extend([receiver, ticker]);

        *bound = Some(local.port());
        info!(%local, "UDP server listening");
        Ok(local.port())
    }

    pub fn port(&self) -> Option<u16> {
        *self.port.lock()
    }

    pub fn register_player(&self, registration: RegistrationId, player: PlayerNumber, plugin: u8) {
        self.engine
            .lock()
            .register_player(registration, player, plugin);
    }

    pub fn disconnect_player(&self, registration: RegistrationId) -> bool {
        let mut engine = self.engine.lock();
        let found = engine.disconnect_player(registration);
        forward_events(&mut engine, &self.events);
        found
    }

    pub fn set_input_delay(&self, player: PlayerNumber, frames: Option<u32>) {
        self.engine.lock().set_input_delay(player, frames);
    }

    /// Run `f` against the engine under its lock.
    pub fn with_engine<R>(&self, f: impl FnOnce(&SyncEngine) -> R) -> R {
        f(&self.engine.lock())
    }

    /// Ask both threads to exit. Safe to call repeatedly, and before `bind`
    /// (a later `bind` then fails with `Stopped`).
    pub fn stop(&self) {
        let _bound = self.port.lock();
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        // Dropping the sender wakes the tick thread.
        self.tick_stop.lock().take();
        debug!("UDP server stopping");
    }

    /// Block until both threads have exited. Returns immediately if the
    /// server was never bound.
    pub fn wait(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                warn!("UDP server thread panicked");
            }
        }
    }
}

fn receive_loop(
    socket: UdpSocket,
    engine: Arc<Mutex<SyncEngine>>,
    events: Sender<NetplayEvent>,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; RECV_BUFFER_LEN];
    while running.load(Ordering::SeqCst) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                // ICMP port-unreachable from a departed client surfaces here
                // on some platforms; it does not affect other clients.
                debug!(error = %e, "UDP receive error");
                continue;
            }
        };

        let packets: Vec<OutgoingPacket> = {
            let mut engine = engine.lock();
            let packets = engine.handle_datagram(&buf[..len], from);
            forward_events(&mut engine, &events);
            packets
        };

        for packet in packets {
            if let Err(e) = socket.send_to(&packet.bytes, packet.dest) {
                trace!(dest = %packet.dest, error = %e, "UDP send failed");
            }
        }
    }
    info!("UDP server stopped");
}

fn forward_events(engine: &mut SyncEngine, events: &Sender<NetplayEvent>) {
    for event in engine.take_events() {
        // Nobody listening is fine; the engine state is authoritative.
        let _ = events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Instant;

    use netplay_protocol::udp::CP0_BLOCK_LEN;
    use netplay_protocol::{ClientDatagram, InputRecord, ServerKeyInfo};

    use super::*;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn fast_config() -> ServerConfig {
        ServerConfig {
            tick_interval_ms: 10,
            keepalive_threshold: 3,
            ..ServerConfig::default()
        }
    }

    fn client_socket() -> UdpSocket {
        let socket = UdpSocket::bind((LOCALHOST, 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn p(n: u8) -> PlayerNumber {
        PlayerNumber::new(n).unwrap()
    }

    #[test]
    fn answers_request_data_with_run() {
        let (tx, _rx) = mpsc::channel();
        let server = UdpServer::new(&ServerConfig::default(), tx);
        let port = server.bind(LOCALHOST, 0).unwrap();
        assert_eq!(server.port(), Some(port));
        server.register_player(RegistrationId(1), p(0), 1);

        let client = client_socket();
        let request = ClientDatagram::RequestData {
            player: p(0),
            registration: RegistrationId(1),
            count: 0,
            spectator: false,
            buffer_health: Some(2),
        };
        client.send_to(&request.encode(), (LOCALHOST, port)).unwrap();

        let mut buf = [0u8; 600];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        let run = ServerKeyInfo::decode(&buf[..len]).unwrap();
        assert_eq!(run.player, p(0));
        assert_eq!(run.inputs.len(), 3);
        assert_eq!(run.inputs[0], (0, InputRecord::new(0, 1)));

        server.stop();
        server.wait();
    }

    #[test]
    fn expired_keepalive_is_reported() {
        let (tx, rx) = mpsc::channel();
        let server = UdpServer::new(&fast_config(), tx);
        let port = server.bind(LOCALHOST, 0).unwrap();
        server.register_player(RegistrationId(9), p(1), 1);

        // Ticks only start once a CP0 snapshot has been seen.
        let client = client_socket();
        let cp0 = ClientDatagram::Cp0Data {
            vi_count: 0,
            block: Box::new([0u8; CP0_BLOCK_LEN]),
        };
        client.send_to(&cp0.encode(), (LOCALHOST, port)).unwrap();

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            event,
            NetplayEvent::PlayerDisconnected {
                player: p(1),
                registration: RegistrationId(9),
            }
        );

        server.stop();
        server.wait();
    }

    #[test]
    fn stop_is_prompt_and_idempotent() {
        let (tx, _rx) = mpsc::channel();
        let server = UdpServer::new(&ServerConfig::default(), tx);
        server.bind(LOCALHOST, 0).unwrap();

        let start = Instant::now();
        server.stop();
        server.stop();
        server.wait();
        server.wait();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn bind_after_stop_is_refused() {
        let (tx, _rx) = mpsc::channel();
        let server = UdpServer::new(&ServerConfig::default(), tx);
        server.stop();
        assert!(matches!(
            server.bind(LOCALHOST, 0),
            Err(ServerError::Stopped)
        ));
        server.wait();
    }

    #[test]
    fn second_bind_is_refused() {
        let (tx, _rx) = mpsc::channel();
        let server = UdpServer::new(&ServerConfig::default(), tx);
        server.bind(LOCALHOST, 0).unwrap();
        assert!(matches!(
            server.bind(LOCALHOST, 0),
            Err(ServerError::AlreadyBound)
        ));
        server.stop();
        server.wait();
    }

    #[test]
    fn port_in_use_is_bind_error() {
        let taken = UdpSocket::bind((LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let (tx, _rx) = mpsc::channel();
        let server = UdpServer::new(&ServerConfig::default(), tx);
        match server.bind(LOCALHOST, port) {
            Err(ServerError::Bind { transport, .. }) => assert_eq!(transport, "UDP"),
            other => panic!("expected Bind error, got {other:?}"),
        }
    }
}
