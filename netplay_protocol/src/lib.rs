// netplay_protocol — wire protocol for lockstep netplay.
//
// This crate defines the message types and byte layouts used by the netplay
// server (`netplay_server`) and emulator clients. It is shared between both
// sides and knows nothing about sockets or threads.
//
// Module overview:
// - `types.rs`:    Core value types — `PlayerNumber`, `RegistrationId`,
//                  `InputRecord`.
// - `udp.rs`:      Per-frame UDP datagrams: `ClientDatagram` (key info,
//                  data requests, CP0 snapshots), the server's run packet
//                  (`ServerKeyInfo` / `RunPacketBuilder`), and status bits.
// - `message.rs`:  TCP session-channel catalog (`TcpMessage`), core settings,
//                  registration records, and response encoders.
// - `framing.rs`:  Stream primitives for the TCP channel: big-endian
//                  integers, NUL-terminated names, length-prefixed blobs.
// - `error.rs`:    `ProtocolError`.
//
// Design decisions:
// - **Fixed binary layouts, big-endian.** Emulator cores implement the
//   client side natively; every byte position is part of the contract.
// - **Settings and files as opaque bytes.** The server never interprets the
//   video settings blob or file contents, it only caches and redistributes.
// - **No async runtime.** TCP parsing works on any `std::io::BufRead`, so the
//   same code serves blocking sockets and in-memory test cursors.

pub mod error;
pub mod framing;
pub mod message;
pub mod types;
pub mod udp;

pub use error::ProtocolError;
pub use message::{CoreSettings, PlayerData, RegisterResponse, RegistrationTable, TcpMessage};
pub use types::{InputRecord, NUM_PLAYERS, PlayerNumber, RegistrationId};
pub use udp::{ClientDatagram, RunPacketBuilder, ServerKeyInfo};
