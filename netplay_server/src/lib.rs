// netplay_server — lockstep netplay synchronization server.
//
// Emulator clients run in lockstep: every client must see the same
// controller inputs on the same frame. This crate is the server that makes
// that happen. It collects each player's per-frame input over UDP and
// redistributes it to the other clients ahead of time, adapting how far ahead
// to each client's reported buffer health. It also detects desyncs by
// comparing execution-state hashes clients report, and drops players whose
// keepalives stop. A TCP channel beside it distributes session setup (core
// settings, video settings, save files) and player registration.
//
// Module overview:
// - `sync.rs`:        `SyncEngine`, the socket-free input-exchange state
//                     machine (input history, run packets, adaptive buffer,
//                     keepalives, desync detection).
// - `udp_server.rs`:  UDP socket, receive thread, and periodic tick thread
//                     around the engine.
// - `session.rs`:     Shared TCP session state: settings, files, and the
//                     registration table, with blocking waits.
// - `handler.rs`:     Per-connection TCP reader/dispatcher.
// - `tcp_server.rs`:  TCP listener and handler lifecycle.
// - `service.rs`:     `NetplayService`, which starts both servers on one port
//                     on a background thread and reports lifecycle events.
// - `client.rs`:      `NetplayClient`, a client for both channels (tests and
//                     tools).
// - `config.rs`, `event.rs`, `error.rs`: configuration, notifications, errors.
//
// Concurrency: blocking `std::net` sockets and one OS thread per loop or
// connection. Shared state is guarded by `parking_lot` mutexes; nothing here
// needs an async runtime.
//
// The server can run as a standalone binary (`main.rs`) or be embedded via
// `NetplayService`.

pub mod client;
pub mod config;
pub mod error;
pub mod event;
mod handler;
pub mod service;
pub mod session;
pub mod sync;
pub mod tcp_server;
pub mod udp_server;

pub use config::ServerConfig;
pub use error::ServerError;
pub use event::{NetplayEvent, ServiceEvent};
pub use service::NetplayService;
