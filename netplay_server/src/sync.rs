// Lockstep input-exchange state machine.
//
// `SyncEngine` is the socket-free core of the UDP server. It tracks, per
// controller port, the input history keyed by frame count, a FIFO of inputs
// that arrived before the frame they will fill, the client's endpoint, the
// lead count / buffer health it last reported, and the adaptive send-ahead
// depth. Across ports it tracks registration keepalives and the CP0 sync
// hashes used for desync detection. `udp_server.rs` owns the socket and
// threads and feeds datagrams in; the engine hands back the datagrams to
// send and queues `NetplayEvent`s for the application.
//
// Key responsibilities:
// - Input materialization (`check_if_exists`): when a frame is first
//   needed, fill it from the pending FIFO, else repeat the previous frame,
//   else a zeroed "no controller" record. Once a frame is materialized it
//   never changes until it ages out of the 5000-frame history, or until a
//   disconnected port is registered by a new player and starts over.
// - Input delay (`insert_input`): players with a configured delay have their
//   inputs placed `delay` frames ahead, with any gap below backfilled so runs
//   stay contiguous. Such players are never synthesized for; the engine waits
//   for real inputs.
// - Run sending (`send_input`): one datagram per request carrying a
//   contiguous run of frames. Caught-up non-spectators also receive up to
//   `buffer_size` frames ahead.
// - Adaptive buffering and liveness (`check_connections`): nudges each
//   player's send-ahead depth one frame per tick towards the configured
//   target, and ages keepalives, disconnecting registrations that have not
//   polled for more than `keepalive_threshold` ticks.
// - Desync detection (`handle_cp0`): the first client to report a VI stores
//   its snapshot hash; any later mismatch for the same VI sets the sticky
//   desync status bit.
//
// All mutation happens through `&mut self`; `UdpServer` serializes access
// with a single mutex shared by the receive loop, the tick thread, and the
// TCP handlers that register and disconnect players.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use netplay_protocol::udp::{CP0_BLOCK_LEN, STATUS_DESYNC, disconnect_bit};
use netplay_protocol::{
    ClientDatagram, InputRecord, NUM_PLAYERS, PlayerNumber, ProtocolError, RegistrationId,
    RunPacketBuilder,
};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::event::NetplayEvent;

/// Frames older than `count - INPUT_HISTORY` are evicted.
pub const INPUT_HISTORY: u32 = 5000;

/// The sync-hash table is cleared once it grows past this many VIs.
pub const SYNC_HASH_LIMIT: usize = 500;

/// Undelivered inputs held per player when no input delay is configured.
/// Extra inputs arriving while the queue is full are dropped so a client
/// running ahead cannot build up latency on the server.
pub const PENDING_INPUT_DEPTH: usize = 1;

/// A datagram the engine wants sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingPacket {
    pub dest: SocketAddr,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
struct KeepAlive {
    ticks: u32,
    player: PlayerNumber,
}

#[derive(Debug)]
struct PlayerSlot {
    /// Where fan-out packets for this player go. Set by its `KEY_INFO`.
    endpoint: Option<SocketAddr>,
    /// Plugin reported at registration; `None` until registered and after
    /// disconnect.
    registered_plugin: Option<u8>,
    inputs: HashMap<u32, InputRecord>,
    pending: VecDeque<InputRecord>,
    /// Frames below this were evicted and are never re-inserted.
    history_floor: u32,
    lead_count: u32,
    buffer_size: u32,
    buffer_health: Option<u8>,
    input_delay: Option<u32>,
}

impl PlayerSlot {
    fn new(buffer_size: u32, input_delay: Option<u32>) -> Self {
        Self {
            endpoint: None,
            registered_plugin: None,
            inputs: HashMap::new(),
            pending: VecDeque::with_capacity(PENDING_INPUT_DEPTH),
            history_floor: 0,
            lead_count: 0,
            buffer_size,
            buffer_health: None,
            input_delay,
        }
    }

    fn evict_expired(&mut self, count: u32) {
        if let Some(expired) = count.checked_sub(INPUT_HISTORY) {
            self.inputs.remove(&expired);
            self.history_floor = self.history_floor.max(expired + 1);
        }
    }
}

pub struct SyncEngine {
    players: [PlayerSlot; NUM_PLAYERS],
    keepalives: HashMap<RegistrationId, KeepAlive>,
    sync_hashes: HashMap<u32, i32>,
    status: u8,
    buffer_target: u32,
    initial_buffer_size: u32,
    keepalive_threshold: u32,
    connection_checks_started: bool,
    events: Vec<NetplayEvent>,
}

impl SyncEngine {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            players: std::array::from_fn(|i| {
                PlayerSlot::new(config.initial_buffer_size, config.input_delay[i])
            }),
            keepalives: HashMap::new(),
            sync_hashes: HashMap::new(),
            status: 0,
            buffer_target: u32::from(config.buffer_target),
            initial_buffer_size: config.initial_buffer_size,
            keepalive_threshold: config.keepalive_threshold,
            connection_checks_started: false,
            events: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Start tracking `registration` as the owner of `player`'s port. A port
    /// that was released by a disconnect starts over: its disconnect bit is
    /// cleared and the departed player's history is dropped.
    pub fn register_player(&mut self, registration: RegistrationId, player: PlayerNumber, plugin: u8) {
        self.keepalives
            .insert(registration, KeepAlive { ticks: 0, player });
        let bit = disconnect_bit(player);
        if self.status & bit != 0 {
            self.status &= !bit;
            let input_delay = self.players[player.index()].input_delay;
            self.players[player.index()] = PlayerSlot::new(self.initial_buffer_size, input_delay);
            debug!(%player, "port reused after disconnect, slot reset");
        }
        self.players[player.index()].registered_plugin = Some(plugin);
        info!(%player, registration = registration.0, plugin, "player registered");
    }

    /// Drop `registration`'s keepalive and flag its port as disconnected in
    /// the status byte. The port's input history is kept until the port is
    /// registered again, so peers that are still catching up keep receiving
    /// the same frames. Returns false if the registration was unknown.
    pub fn disconnect_player(&mut self, registration: RegistrationId) -> bool {
        let Some(keepalive) = self.keepalives.remove(&registration) else {
            return false;
        };
        let player = keepalive.player;
        self.status |= disconnect_bit(player);

        let slot = &mut self.players[player.index()];
        slot.registered_plugin = None;
        slot.endpoint = None;
        slot.pending.clear();

        info!(%player, registration = registration.0, "player disconnected");
        self.events.push(NetplayEvent::PlayerDisconnected {
            player,
            registration,
        });
        if self.keepalives.is_empty() {
            info!("no players left");
        }
        true
    }

    /// Place `player`'s inputs `frames` ahead of the frame they were sampled
    /// on. `None` restores immediate (queued) delivery.
    pub fn set_input_delay(&mut self, player: PlayerNumber, frames: Option<u32>) {
        self.players[player.index()].input_delay = frames;
    }

    // -----------------------------------------------------------------------
    // Inbound datagrams
    // -----------------------------------------------------------------------

    /// Decode and handle one datagram from `from`. Malformed or unknown
    /// datagrams are logged and ignored.
    pub fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) -> Vec<OutgoingPacket> {
        match ClientDatagram::decode(datagram) {
            Ok(ClientDatagram::KeyInfo {
                player,
                count,
                input,
            }) => self.handle_key_info(player, count, input, from),
            Ok(ClientDatagram::RequestData {
                player,
                registration,
                count,
                spectator,
                buffer_health,
            }) => self
                .handle_request_data(player, registration, count, spectator, buffer_health, from)
                .into_iter()
                .collect(),
            Ok(ClientDatagram::Cp0Data { vi_count, block }) => {
                self.handle_cp0(vi_count, &block);
                Vec::new()
            }
            Err(ProtocolError::UnknownMessageId(id)) => {
                warn!(id, %from, "received unknown message");
                Vec::new()
            }
            Err(e) => {
                warn!(%from, error = %e, "dropping malformed datagram");
                Vec::new()
            }
        }
    }

    /// A player's own controller state for `count`. Records the player's
    /// endpoint, stores the input, then pushes this player's run to every
    /// other registered player with a known endpoint.
    pub fn handle_key_info(
        &mut self,
        player: PlayerNumber,
        count: u32,
        input: InputRecord,
        from: SocketAddr,
    ) -> Vec<OutgoingPacket> {
        let slot = &mut self.players[player.index()];
        slot.endpoint = Some(from);

        if let Some(delay) = slot.input_delay {
            self.insert_input(player, count.saturating_add(delay), input);
        } else if slot.pending.len() < PENDING_INPUT_DEPTH {
            slot.pending.push_back(input);
        } else {
            trace!(%player, count, "pending input queue full, dropping input");
        }

        let peers: Vec<SocketAddr> = PlayerNumber::ALL
            .into_iter()
            .filter(|other| *other != player)
            .filter_map(|other| {
                let slot = &self.players[other.index()];
                slot.registered_plugin.and(slot.endpoint)
            })
            .collect();

        peers
            .into_iter()
            .filter_map(|dest| self.send_input(count, player, dest, false))
            .collect()
    }

    /// A poll for `player`'s inputs from `count` onwards. Doubles as the
    /// keepalive for `registration`; non-spectator polls also report the
    /// client's buffer health and advance the player's lead count.
    pub fn handle_request_data(
        &mut self,
        player: PlayerNumber,
        registration: RegistrationId,
        count: u32,
        spectator: bool,
        buffer_health: Option<u8>,
        from: SocketAddr,
    ) -> Option<OutgoingPacket> {
        if let Some(keepalive) = self.keepalives.get_mut(&registration) {
            keepalive.ticks = 0;
        }

        let slot = &mut self.players[player.index()];
        if !spectator && count >= slot.lead_count {
            slot.buffer_health = buffer_health;
            slot.lead_count = count;
        }

        self.send_input(count, player, from, spectator)
    }

    /// A client's execution-state snapshot for `vi_count`.
    pub fn handle_cp0(&mut self, vi_count: u32, block: &[u8; CP0_BLOCK_LEN]) {
        if !self.connection_checks_started {
            self.connection_checks_started = true;
            debug!("first CP0 snapshot received, starting connection checks");
        }

        if self.is_desynced() {
            return;
        }

        let hash = cp0_hash(block);
        match self.sync_hashes.get(&vi_count) {
            None => {
                if self.sync_hashes.len() > SYNC_HASH_LIMIT {
                    self.sync_hashes.clear();
                }
                self.sync_hashes.insert(vi_count, hash);
            }
            Some(previous) if *previous != hash => {
                self.status |= STATUS_DESYNC;
                warn!(vi_count, "clients have desynced");
                self.events.push(NetplayEvent::Desync { vi_count });
            }
            Some(_) => {}
        }
    }

    // -----------------------------------------------------------------------
    // Periodic maintenance
    // -----------------------------------------------------------------------

    /// Run `check_connections` if emulation has started (first CP0 seen).
    /// Before that, clients sit in the lobby and do not poll, so keepalives
    /// must not age.
    pub fn on_tick(&mut self) {
        if self.connection_checks_started {
            self.check_connections();
        }
    }

    /// Adjust every player's send-ahead depth one step towards the buffer
    /// target, then age keepalives and disconnect any registration past the
    /// threshold.
    pub fn check_connections(&mut self) {
        let target = self.buffer_target;
        for slot in &mut self.players {
            let Some(health) = slot.buffer_health else {
                continue;
            };
            let health = u32::from(health);
            if health > target && slot.buffer_size > 0 {
                slot.buffer_size -= 1;
            } else if health < target {
                slot.buffer_size += 1;
            }
        }

        let threshold = self.keepalive_threshold;
        let mut expired: Vec<RegistrationId> = self
            .keepalives
            .iter_mut()
            .filter_map(|(registration, keepalive)| {
                keepalive.ticks += 1;
                (keepalive.ticks > threshold).then_some(*registration)
            })
            .collect();
        expired.sort();
        for registration in expired {
            debug!(registration = registration.0, "keepalive expired");
            self.disconnect_player(registration);
        }
    }

    // -----------------------------------------------------------------------
    // Input history
    // -----------------------------------------------------------------------

    /// Make sure frame `count` of `player` is materialized if it can be.
    /// Evicts the frame `INPUT_HISTORY` behind `count` first.
    ///
    /// Without input delay a missing frame is synthesized (pending FIFO, then
    /// a repeat of the previous frame, then a zeroed record) and the result
    /// is always true. With input delay nothing is synthesized and the result
    /// says whether a real input is stored.
    pub fn check_if_exists(&mut self, player: PlayerNumber, count: u32) -> bool {
        let slot = &mut self.players[player.index()];
        let exists = slot.inputs.contains_key(&count);
        slot.evict_expired(count);

        if exists || slot.input_delay.is_some() || count < slot.history_floor {
            return exists;
        }

        let input = slot
            .pending
            .pop_front()
            .or_else(|| {
                count
                    .checked_sub(1)
                    .and_then(|previous| slot.inputs.get(&previous).copied())
            })
            .unwrap_or_else(|| {
                // Frame 0 carries the plugin reported at registration so
                // peers learn the controller type before the first input.
                let plugin = if count == 0 {
                    slot.registered_plugin.unwrap_or(0)
                } else {
                    0
                };
                InputRecord::new(0, plugin)
            });
        slot.inputs.insert(count, input);
        true
    }

    /// Store an input-delayed record at `count` and backfill every missing
    /// frame below it with the same record, stopping at frame 0, at the first
    /// frame already present, or at the history floor. Frames that are
    /// already present are never overwritten.
    pub fn insert_input(&mut self, player: PlayerNumber, count: u32, input: InputRecord) {
        let slot = &mut self.players[player.index()];
        slot.evict_expired(count);
        if count < slot.history_floor {
            trace!(%player, count, "input older than history, dropping");
            return;
        }

        slot.inputs.entry(count).or_insert(input);

        let floor = slot
            .history_floor
            .max(count.saturating_sub(INPUT_HISTORY - 1));
        let mut frame = count;
        while frame > floor {
            frame -= 1;
            if slot.inputs.contains_key(&frame) {
                break;
            }
            slot.inputs.insert(frame, input);
        }
    }

    /// Build the run packet of `player`'s inputs starting at `count` for
    /// `dest`. Returns `None` when the run is empty.
    pub fn send_input(
        &mut self,
        count: u32,
        player: PlayerNumber,
        dest: SocketAddr,
        spectator: bool,
    ) -> Option<OutgoingPacket> {
        let slot = &self.players[player.index()];
        let count_lag = i64::from(slot.lead_count) - i64::from(count);
        let window_end = u64::from(count) + u64::from(slot.buffer_size);
        let in_window = |frame: u32| !spectator && count_lag == 0 && u64::from(frame) < window_end;

        let lag_byte = u8::try_from(count_lag.clamp(0, i64::from(u8::MAX))).unwrap_or(u8::MAX);
        let mut builder = RunPacketBuilder::new(player, self.status, lag_byte);
        let mut frame = count;
        while builder.has_room() {
            let stored = self.players[player.index()].inputs.contains_key(&frame);
            if !(in_window(frame) || stored) || !self.check_if_exists(player, frame) {
                break;
            }
            let input = self.players[player.index()]
                .inputs
                .get(&frame)
                .copied()
                .unwrap_or_default();
            builder.push(frame, input);
            match frame.checked_add(1) {
                Some(next) => frame = next,
                None => break,
            }
        }

        let entries = builder.entries();
        let bytes = builder.finish()?;
        trace!(%player, count, entries, %dest, "sending input run");
        Some(OutgoingPacket { dest, bytes })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn input(&self, player: PlayerNumber, count: u32) -> Option<InputRecord> {
        self.players[player.index()].inputs.get(&count).copied()
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn is_desynced(&self) -> bool {
        self.status & STATUS_DESYNC != 0
    }

    pub fn buffer_size(&self, player: PlayerNumber) -> u32 {
        self.players[player.index()].buffer_size
    }

    pub fn buffer_health(&self, player: PlayerNumber) -> Option<u8> {
        self.players[player.index()].buffer_health
    }

    pub fn lead_count(&self, player: PlayerNumber) -> u32 {
        self.players[player.index()].lead_count
    }

    pub fn endpoint(&self, player: PlayerNumber) -> Option<SocketAddr> {
        self.players[player.index()].endpoint
    }

    /// Ticks since `registration` last polled, if it is still alive.
    pub fn keepalive_ticks(&self, registration: RegistrationId) -> Option<u32> {
        self.keepalives.get(&registration).map(|k| k.ticks)
    }

    pub fn connection_checks_started(&self) -> bool {
        self.connection_checks_started
    }

    pub fn sync_hash_count(&self) -> usize {
        self.sync_hashes.len()
    }

    /// Drain notifications queued since the last call.
    pub fn take_events(&mut self) -> Vec<NetplayEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Polynomial (×31) hash over the snapshot's bytes, read as signed.
pub fn cp0_hash(block: &[u8; CP0_BLOCK_LEN]) -> i32 {
    block.iter().fold(1i32, |hash, byte| {
        hash.wrapping_mul(31).wrapping_add(i32::from(*byte as i8))
    })
}
