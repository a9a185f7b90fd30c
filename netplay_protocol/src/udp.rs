// UDP datagram codec for the per-frame input exchange.
//
// Every datagram starts with a one-byte message id; all integers are
// big-endian. Clients send `KEY_INFO` (their own controller state for a
// frame), `REQUEST_DATA` (poll for another player's inputs, doubling as a
// keepalive), and `CP0_DATA` (a 128-byte execution-state snapshot used for
// desync detection). The server answers with `SERVER_KEY_INFO` packets, each
// carrying a contiguous run of one player's inputs.
//
// Server packets are assembled with `RunPacketBuilder`, which owns the
// "stay under ~500 bytes" rule and patches the run-length byte once the run
// is complete, so the sync engine only decides *which* frames go in.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;
use crate::types::{InputRecord, PlayerNumber, RegistrationId};

pub const KEY_INFO: u8 = 0;
pub const SERVER_KEY_INFO: u8 = 1;
pub const REQUEST_DATA: u8 = 2;
pub const CP0_DATA: u8 = 4;

/// Size of the opaque execution-state snapshot carried by `CP0_DATA`.
pub const CP0_BLOCK_LEN: usize = 128;

/// Runs stop growing once the packet reaches this many bytes.
pub const MAX_RUN_PACKET_LEN: usize = 500;

/// id, player, status, count lag, run length.
pub const RUN_HEADER_LEN: usize = 5;

/// count:u32, keys:u32, plugin:u8.
pub const RUN_ENTRY_LEN: usize = 9;

/// Status bit 0: the server has detected a desync.
pub const STATUS_DESYNC: u8 = 0x01;

/// Status bit set once `player` has been disconnected (bits 1..=4).
pub fn disconnect_bit(player: PlayerNumber) -> u8 {
    1 << (player.as_u8() + 1)
}

/// A datagram sent by an emulator client to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientDatagram {
    /// The sender's controller state for frame `count`.
    KeyInfo {
        player: PlayerNumber,
        count: u32,
        input: InputRecord,
    },
    /// Request `player`'s inputs starting at `count`. Refreshes the
    /// keepalive for `registration`.
    RequestData {
        player: PlayerNumber,
        registration: RegistrationId,
        count: u32,
        spectator: bool,
        /// Client-side input queue depth; only sent by non-spectators.
        buffer_health: Option<u8>,
    },
    /// Execution-state snapshot for VI `vi_count`.
    Cp0Data {
        vi_count: u32,
        block: Box<[u8; CP0_BLOCK_LEN]>,
    },
}

impl ClientDatagram {
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = datagram;
        if !buf.has_remaining() {
            return Err(ProtocolError::Empty);
        }
        match buf.get_u8() {
            KEY_INFO => {
                need(&buf, 10, "KEY_INFO")?;
                let player = PlayerNumber::new(buf.get_u8())?;
                let count = buf.get_u32();
                let keys = buf.get_u32();
                let plugin = buf.get_u8();
                Ok(Self::KeyInfo {
                    player,
                    count,
                    input: InputRecord::new(keys, plugin),
                })
            }
            REQUEST_DATA => {
                need(&buf, 10, "REQUEST_DATA")?;
                let player = PlayerNumber::new(buf.get_u8())?;
                let registration = RegistrationId(buf.get_u32());
                let count = buf.get_u32();
                let spectator = buf.get_u8() != 0;
                let buffer_health = if spectator {
                    None
                } else {
                    need(&buf, 1, "REQUEST_DATA buffer health")?;
                    Some(buf.get_u8())
                };
                Ok(Self::RequestData {
                    player,
                    registration,
                    count,
                    spectator,
                    buffer_health,
                })
            }
            CP0_DATA => {
                need(&buf, 4 + CP0_BLOCK_LEN, "CP0_DATA")?;
                let vi_count = buf.get_u32();
                let mut block = Box::new([0u8; CP0_BLOCK_LEN]);
                buf.copy_to_slice(&mut block[..]);
                Ok(Self::Cp0Data { vi_count, block })
            }
            other => Err(ProtocolError::UnknownMessageId(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + CP0_BLOCK_LEN + 1);
        match self {
            Self::KeyInfo {
                player,
                count,
                input,
            } => {
                out.put_u8(KEY_INFO);
                out.put_u8(player.as_u8());
                out.put_u32(*count);
                out.put_u32(input.keys);
                out.put_u8(input.plugin);
            }
            Self::RequestData {
                player,
                registration,
                count,
                spectator,
                buffer_health,
            } => {
                out.put_u8(REQUEST_DATA);
                out.put_u8(player.as_u8());
                out.put_u32(registration.0);
                out.put_u32(*count);
                out.put_u8(u8::from(*spectator));
                if !spectator {
                    out.put_u8(buffer_health.unwrap_or(0));
                }
            }
            Self::Cp0Data { vi_count, block } => {
                out.put_u8(CP0_DATA);
                out.put_u32(*vi_count);
                out.put_slice(&block[..]);
            }
        }
        out
    }
}

/// A decoded `SERVER_KEY_INFO` packet: a contiguous run of one player's
/// inputs plus the session status bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerKeyInfo {
    pub player: PlayerNumber,
    pub status: u8,
    pub count_lag: u8,
    pub inputs: Vec<(u32, InputRecord)>,
}

impl ServerKeyInfo {
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = datagram;
        need(&buf, RUN_HEADER_LEN, "SERVER_KEY_INFO header")?;
        let id = buf.get_u8();
        if id != SERVER_KEY_INFO {
            return Err(ProtocolError::UnknownMessageId(id));
        }
        let player = PlayerNumber::new(buf.get_u8())?;
        let status = buf.get_u8();
        let count_lag = buf.get_u8();
        let run_length = usize::from(buf.get_u8());
        need(&buf, run_length * RUN_ENTRY_LEN, "SERVER_KEY_INFO run")?;
        let inputs = (0..run_length)
            .map(|_| {
                let count = buf.get_u32();
                let keys = buf.get_u32();
                let plugin = buf.get_u8();
                (count, InputRecord::new(keys, plugin))
            })
            .collect();
        Ok(Self {
            player,
            status,
            count_lag,
            inputs,
        })
    }

    pub fn is_desynced(&self) -> bool {
        self.status & STATUS_DESYNC != 0
    }

    pub fn is_disconnected(&self, player: PlayerNumber) -> bool {
        self.status & disconnect_bit(player) != 0
    }
}

/// Incrementally builds one `SERVER_KEY_INFO` datagram.
pub struct RunPacketBuilder {
    buf: Vec<u8>,
    entries: u8,
}

impl RunPacketBuilder {
    pub fn new(player: PlayerNumber, status: u8, count_lag: u8) -> Self {
        let mut buf = Vec::with_capacity(MAX_RUN_PACKET_LEN + RUN_ENTRY_LEN);
        buf.put_u8(SERVER_KEY_INFO);
        buf.put_u8(player.as_u8());
        buf.put_u8(status);
        buf.put_u8(count_lag);
        // Run length, patched in `finish`.
        buf.put_u8(0);
        Self { buf, entries: 0 }
    }

    /// True while another entry may be appended.
    pub fn has_room(&self) -> bool {
        self.buf.len() < MAX_RUN_PACKET_LEN
    }

    pub fn push(&mut self, count: u32, input: InputRecord) {
        debug_assert!(self.has_room());
        self.buf.put_u32(count);
        self.buf.put_u32(input.keys);
        self.buf.put_u8(input.plugin);
        self.entries += 1;
    }

    pub fn entries(&self) -> usize {
        usize::from(self.entries)
    }

    /// Patch the run length and return the datagram, or `None` if no entry
    /// was appended (empty runs are never sent).
    pub fn finish(mut self) -> Option<Vec<u8>> {
        if self.entries == 0 {
            return None;
        }
        self.buf[4] = self.entries;
        Some(self.buf)
    }
}

fn need(buf: &[u8], len: usize, what: &'static str) -> Result<(), ProtocolError> {
    if buf.len() < len {
        Err(ProtocolError::Truncated {
            what,
            need: len,
            have: buf.len(),
        })
    } else {
        Ok(())
    }
}
