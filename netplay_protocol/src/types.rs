// Core value types for the netplay protocol.
//
// These are lightweight newtypes shared by the UDP datagram codec
// (`udp.rs`), the TCP message catalog (`message.rs`), and the server's
// per-player bookkeeping (`netplay_server::sync`). Player numbers are
// validated on construction so downstream code can index fixed
// `[_; NUM_PLAYERS]` arrays without further bounds checks.

use crate::error::ProtocolError;

/// Maximum number of controller ports in a session.
pub const NUM_PLAYERS: usize = 4;

/// A controller port, 0..=3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerNumber(u8);

impl PlayerNumber {
    /// All valid player numbers in port order.
    pub const ALL: [PlayerNumber; NUM_PLAYERS] = [
        PlayerNumber(0),
        PlayerNumber(1),
        PlayerNumber(2),
        PlayerNumber(3),
    ];

    pub fn new(raw: u8) -> Result<Self, ProtocolError> {
        if usize::from(raw) < NUM_PLAYERS {
            Ok(Self(raw))
        } else {
            Err(ProtocolError::InvalidPlayer(raw))
        }
    }

    /// Index into per-player arrays.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for PlayerNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Players are numbered from 1 in user-facing output.
        write!(f, "P{}", self.0 + 1)
    }
}

/// Client-chosen registration token that ties a TCP registration to the
/// UDP keepalive stream of the same client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub u32);

/// Controller state for one frame: a 32-bit button mask and the input
/// plugin that produced it. Plugin 0 means "controller not present".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InputRecord {
    pub keys: u32,
    pub plugin: u8,
}

impl InputRecord {
    pub const fn new(keys: u32, plugin: u8) -> Self {
        Self { keys, plugin }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_number_bounds() {
        assert!(PlayerNumber::new(0).is_ok());
        assert!(PlayerNumber::new(3).is_ok());
        assert!(matches!(
            PlayerNumber::new(4),
            Err(ProtocolError::InvalidPlayer(4))
        ));
    }

    #[test]
    fn player_number_display_is_one_based() {
        assert_eq!(PlayerNumber::ALL[0].to_string(), "P1");
        assert_eq!(PlayerNumber::ALL[3].to_string(), "P4");
    }
}
