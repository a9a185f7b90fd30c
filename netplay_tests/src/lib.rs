// Test-only emulator client for netplay integration tests.
//
// Wraps the real `NetplayClient` (from `netplay_server::client`) with a tiny
// deterministic "emulator": each frame it sends its own controller input,
// waits until the server has delivered every participating player's input
// for that frame, and folds those inputs into a running state hash. Two
// emulators in lockstep must end with identical state, which is what the
// integration tests check.
//
// The only test-specific code here is the synchronous polling wrappers
// (blocking loops around `NetplayClient::poll()`) and the toy state hash.
// All networking uses the same code paths as a real client.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use netplay_protocol::udp::CP0_BLOCK_LEN;
use netplay_protocol::{InputRecord, NUM_PLAYERS, PlayerNumber, RegistrationId};
use netplay_server::client::NetplayClient;
use netplay_server::{NetplayService, ServerConfig, ServiceEvent};

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Plugin id every test emulator reports (a standard controller).
pub const TEST_PLUGIN: u8 = 1;

/// A running `NetplayService` on localhost plus its event stream.
pub struct TestServer {
    service: Option<NetplayService>,
    events: Receiver<ServiceEvent>,
    pub addr: SocketAddr,
}

impl TestServer {
    /// Start a service bound to localhost on an OS-chosen port and wait for
    /// it to report the port.
    pub fn start(config: ServerConfig) -> Self {
        let config = ServerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..config
        };
        let (service, events) = NetplayService::start(config).expect("service start failed");
        let port = match events.recv_timeout(POLL_TIMEOUT) {
            Ok(ServiceEvent::PortObtained(port)) => port,
            other => panic!("expected PortObtained, got {other:?}"),
        };
        Self {
            service: Some(service),
            events,
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        }
    }

    /// Block until an event matching `pred` arrives; earlier events are
    /// discarded.
    pub fn wait_for_event(&self, what: &str, mut pred: impl FnMut(&ServiceEvent) -> bool) -> ServiceEvent {
        let start = Instant::now();
        loop {
            let remaining = POLL_TIMEOUT
                .checked_sub(start.elapsed())
                .unwrap_or_else(|| panic!("timed out waiting for {what}"));
            match self.events.recv_timeout(remaining) {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("waiting for {what}: {e}"),
            }
        }
    }

    /// Stop the service and return every event up to `Finished`.
    pub fn stop(mut self) -> Vec<ServiceEvent> {
        if let Some(service) = self.service.take() {
            service.shutdown();
        }
        let mut seen = Vec::new();
        loop {
            match self.events.recv_timeout(POLL_TIMEOUT) {
                Ok(ServiceEvent::Finished) => return seen,
                Ok(event) => seen.push(event),
                Err(e) => panic!("service did not finish: {e}"),
            }
        }
    }
}

/// Deterministic controller input for `player` on `frame`.
pub fn scripted_keys(player: PlayerNumber, frame: u32) -> u32 {
    (u32::from(player.as_u8()) + 1).wrapping_mul(0x9E37_79B9) ^ frame.wrapping_mul(0x85EB_CA6B)
}

/// A test emulator wrapping a real `NetplayClient`.
pub struct TestEmulator {
    client: NetplayClient,
    /// `None` for spectators.
    pub player: Option<PlayerNumber>,
    pub registration: RegistrationId,
    frame: u32,
    received: [BTreeMap<u32, InputRecord>; NUM_PLAYERS],
    state: u64,
    last_status: u8,
}

impl TestEmulator {
    /// Connect and register `player` on the TCP channel.
    pub fn connect(addr: SocketAddr, player: PlayerNumber, registration: RegistrationId) -> Self {
        let mut emulator = Self::connect_unregistered(addr, registration);
        let response = emulator
            .client
            .register_player(player, TEST_PLUGIN, 0, registration)
            .expect("register_player failed");
        assert!(response.accepted, "registration for {player} refused");
        emulator.player = Some(player);
        emulator
    }

    /// Connect without claiming a port (host uploads, spectators).
    pub fn connect_unregistered(addr: SocketAddr, registration: RegistrationId) -> Self {
        let client = NetplayClient::connect(addr).expect("NetplayClient::connect failed");
        client
            .set_read_timeout(Some(POLL_TIMEOUT))
            .expect("set_read_timeout failed");
        Self {
            client,
            player: None,
            registration,
            frame: 0,
            received: Default::default(),
            state: 0xCBF2_9CE4_8422_2325,
            last_status: 0,
        }
    }

    pub fn client(&mut self) -> &mut NetplayClient {
        &mut self.client
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn state(&self) -> u64 {
        self.state
    }

    /// Status byte of the most recent run packet.
    pub fn last_status(&self) -> u8 {
        self.last_status
    }

    /// Every input received so far for `player`, by frame.
    pub fn inputs(&self, player: PlayerNumber) -> &BTreeMap<u32, InputRecord> {
        &self.received[player.index()]
    }

    /// Run one lockstep frame: send our scripted input (players only), then
    /// wait for every player in `players` to have an input for this frame
    /// and fold them into the state.
    pub fn step(&mut self, players: &[PlayerNumber]) {
        let frame = self.frame;
        if let Some(player) = self.player {
            self.client
                .send_key_info(player, frame, InputRecord::new(scripted_keys(player, frame), TEST_PLUGIN))
                .expect("send_key_info failed");
        }
        for &player in players {
            let input = self.poll_until_input(player, frame);
            self.state = (self.state ^ u64::from(input.keys) ^ (u64::from(input.plugin) << 32))
                .wrapping_mul(0x0000_0100_0000_01B3);
        }
        self.frame += 1;
    }

    /// Blocking poll until the server has delivered `player`'s input for
    /// `frame`. Re-sends the request every poll interval.
    pub fn poll_until_input(&mut self, player: PlayerNumber, frame: u32) -> InputRecord {
        let start = Instant::now();
        loop {
            self.absorb();
            if let Some(input) = self.received[player.index()].get(&frame) {
                return *input;
            }
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for {player} frame {frame}"
            );
            let health = self.player.map(|_| self.buffered_frames(player, frame));
            self.client
                .request_data(player, self.registration, frame, health)
                .expect("request_data failed");
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking poll until a run packet's status satisfies `pred`. Keeps
    /// re-requesting `player`'s last completed frame (as a spectator, so the
    /// player's lead count is untouched) to provoke packets; call after at
    /// least one `step`.
    pub fn poll_until_status(&mut self, player: PlayerNumber, mut pred: impl FnMut(u8) -> bool) -> u8 {
        let start = Instant::now();
        loop {
            self.absorb();
            if pred(self.last_status) {
                return self.last_status;
            }
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for status");
            self.client
                .request_data(player, self.registration, self.frame.saturating_sub(1), None)
                .expect("request_data failed");
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Report a CP0 snapshot derived from the current state.
    pub fn send_cp0(&self, vi_count: u32) {
        self.send_cp0_block(vi_count, cp0_block(self.state));
    }

    pub fn send_cp0_block(&self, vi_count: u32, block: [u8; CP0_BLOCK_LEN]) {
        self.client.send_cp0(vi_count, block).expect("send_cp0 failed");
    }

    /// Frames of `player` already held past `frame`, as reported buffer
    /// health.
    fn buffered_frames(&self, player: PlayerNumber, frame: u32) -> u8 {
        let ahead = self.received[player.index()].range(frame..).count();
        u8::try_from(ahead).unwrap_or(u8::MAX)
    }

    fn absorb(&mut self) {
        for packet in self.client.poll() {
            self.last_status = packet.status;
            let inputs = &mut self.received[packet.player.index()];
            for (count, input) in packet.inputs {
                let first = *inputs.entry(count).or_insert(input);
                assert_eq!(
                    first, input,
                    "server changed {} frame {count} after delivering it",
                    packet.player
                );
            }
        }
    }
}

/// A CP0 block filled from `state`.
pub fn cp0_block(state: u64) -> [u8; CP0_BLOCK_LEN] {
    let bytes = state.to_be_bytes();
    std::array::from_fn(|i| bytes[i % bytes.len()])
}
