// Notifications surfaced to the embedding application.
//
// `NetplayEvent`s originate in the sync engine and are forwarded by the UDP
// server over an `mpsc` channel. `ServiceEvent` wraps them together with the
// service lifecycle (port obtained, start failure, finished) for consumers
// of `NetplayService`.

use netplay_protocol::{PlayerNumber, RegistrationId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetplayEvent {
    /// Two clients reported different CP0 snapshots for the same VI. Sent
    /// once per session; the desync bit stays set afterwards.
    Desync { vi_count: u32 },
    /// A registration was dropped, either by an explicit disconnect notice
    /// or because its keepalive expired.
    PlayerDisconnected {
        player: PlayerNumber,
        registration: RegistrationId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Both servers are bound and serving on this port (TCP and UDP).
    PortObtained(u16),
    Netplay(NetplayEvent),
    /// Binding failed; the service will not serve. Followed by `Finished`.
    StartFailed(String),
    /// Both servers have stopped. Always the last event.
    Finished,
}
