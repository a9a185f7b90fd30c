// TCP session-channel messages.
//
// The TCP channel is used before and around emulation to converge every
// client on identical configuration: the host uploads core settings, the
// video-plugin settings blob, and save files; joining clients download them.
// Players also register their controller port here, which is what lets the
// UDP side accept their keepalives.
//
// Wire shape: a one-byte message id, then an id-specific body (see
// `framing.rs` for the primitives). `TcpMessage::read_body` is the message
// factory used by the server's per-connection reader; `write_to` is used by
// clients. Responses have their own small encoders below because they carry
// no id byte.

use std::io::{self, BufRead, Read, Write};

use crate::error::ProtocolError;
use crate::framing::{
    read_blob, read_i32, read_name, read_u8, read_u32, write_blob, write_name,
};
use crate::types::{NUM_PLAYERS, PlayerNumber, RegistrationId};

pub const SEND_FILE: u8 = 1;
pub const RECEIVE_FILE: u8 = 2;
pub const SEND_SETTINGS: u8 = 3;
pub const RECEIVE_SETTINGS: u8 = 4;
pub const REGISTER_PLAYER: u8 = 5;
pub const GET_REGISTRATION: u8 = 6;
pub const DISCONNECT_NOTICE: u8 = 7;
pub const SEND_VIDEO_SETTINGS: u8 = 8;
pub const RECEIVE_VIDEO_SETTINGS: u8 = 9;

/// Emulator-core tunables every client must agree on before starting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoreSettings {
    pub count_per_op: i32,
    pub count_per_op_denom_pot: i32,
    pub disable_extra_mem: i32,
    pub si_dma_duration: i32,
    pub emu_mode: i32,
}

impl CoreSettings {
    pub const WIRE_LEN: usize = 20;

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            count_per_op: read_i32(reader)?,
            count_per_op_denom_pot: read_i32(reader)?,
            disable_extra_mem: read_i32(reader)?,
            si_dma_duration: read_i32(reader)?,
            emu_mode: read_i32(reader)?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for value in [
            self.count_per_op,
            self.count_per_op_denom_pot,
            self.disable_extra_mem,
            self.si_dma_duration,
            self.emu_mode,
        ] {
            writer.write_all(&value.to_be_bytes())?;
        }
        Ok(())
    }
}

/// Registration record for one controller port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlayerData {
    pub registration: RegistrationId,
    pub plugin: u8,
    pub raw_mode: u8,
}

/// A client-to-server message on the TCP channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TcpMessage {
    /// Upload a named file into the server's cache.
    SendFile { name: String, data: Vec<u8> },
    /// Download a named file; the server answers once it is available.
    ReceiveFile { name: String },
    SendSettings(CoreSettings),
    /// Download core settings; answered once the host has uploaded them.
    ReceiveSettings,
    RegisterPlayer {
        player: PlayerNumber,
        plugin: u8,
        raw_mode: u8,
        registration: RegistrationId,
    },
    GetRegistration,
    /// The client is leaving; frees its port and stops its keepalive.
    DisconnectNotice { registration: RegistrationId },
    /// Upload the opaque video-plugin settings string.
    SendVideoSettings(String),
    ReceiveVideoSettings,
}

impl TcpMessage {
    pub fn id(&self) -> u8 {
        match self {
            Self::SendFile { .. } => SEND_FILE,
            Self::ReceiveFile { .. } => RECEIVE_FILE,
            Self::SendSettings(_) => SEND_SETTINGS,
            Self::ReceiveSettings => RECEIVE_SETTINGS,
            Self::RegisterPlayer { .. } => REGISTER_PLAYER,
            Self::GetRegistration => GET_REGISTRATION,
            Self::DisconnectNotice { .. } => DISCONNECT_NOTICE,
            Self::SendVideoSettings(_) => SEND_VIDEO_SETTINGS,
            Self::ReceiveVideoSettings => RECEIVE_VIDEO_SETTINGS,
        }
    }

    /// Parse the body of message `id`, which has already been consumed from
    /// the stream.
    pub fn read_body<R: BufRead>(id: u8, reader: &mut R) -> Result<Self, ProtocolError> {
        let msg = match id {
            SEND_FILE => {
                let name = read_name(reader)?;
                let data = read_blob(reader)?;
                Self::SendFile { name, data }
            }
            RECEIVE_FILE => Self::ReceiveFile {
                name: read_name(reader)?,
            },
            SEND_SETTINGS => Self::SendSettings(CoreSettings::read_from(reader)?),
            RECEIVE_SETTINGS => Self::ReceiveSettings,
            REGISTER_PLAYER => {
                let player = PlayerNumber::new(read_u8(reader)?)?;
                let plugin = read_u8(reader)?;
                let raw_mode = read_u8(reader)?;
                let registration = RegistrationId(read_u32(reader)?);
                Self::RegisterPlayer {
                    player,
                    plugin,
                    raw_mode,
                    registration,
                }
            }
            GET_REGISTRATION => Self::GetRegistration,
            DISCONNECT_NOTICE => Self::DisconnectNotice {
                registration: RegistrationId(read_u32(reader)?),
            },
            SEND_VIDEO_SETTINGS => Self::SendVideoSettings(String::from_utf8(read_blob(reader)?)?),
            RECEIVE_VIDEO_SETTINGS => Self::ReceiveVideoSettings,
            other => return Err(ProtocolError::UnknownMessageId(other)),
        };
        Ok(msg)
    }

    /// Write the id byte and body. Does not flush.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&[self.id()])?;
        match self {
            Self::SendFile { name, data } => {
                write_name(writer, name)?;
                write_blob(writer, data)
            }
            Self::ReceiveFile { name } => write_name(writer, name),
            Self::SendSettings(settings) => settings.write_to(writer),
            Self::RegisterPlayer {
                player,
                plugin,
                raw_mode,
                registration,
            } => {
                writer.write_all(&[player.as_u8(), *plugin, *raw_mode])?;
                writer.write_all(&registration.0.to_be_bytes())
            }
            Self::DisconnectNotice { registration } => {
                writer.write_all(&registration.0.to_be_bytes())
            }
            Self::SendVideoSettings(settings) => write_blob(writer, settings.as_bytes()),
            Self::ReceiveSettings | Self::GetRegistration | Self::ReceiveVideoSettings => Ok(()),
        }
    }
}

/// Reply to `REGISTER_PLAYER`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterResponse {
    pub accepted: bool,
    /// The server's configured buffer target, so clients size their local
    /// input queue to match the adaptive controller.
    pub buffer_target: u8,
}

impl RegisterResponse {
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let accepted = read_u8(reader)? == 1;
        let buffer_target = read_u8(reader)?;
        Ok(Self {
            accepted,
            buffer_target,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&[u8::from(self.accepted), self.buffer_target])
    }
}

/// Per-port registration table as answered to `GET_REGISTRATION`. Empty
/// ports are encoded as all zeroes.
pub type RegistrationTable = [Option<PlayerData>; NUM_PLAYERS];

pub fn write_registration_table<W: Write>(
    writer: &mut W,
    table: &RegistrationTable,
) -> io::Result<()> {
    for slot in table {
        let (registration, plugin, raw_mode) = match slot {
            Some(data) => (data.registration.0, data.plugin, data.raw_mode),
            None => (0, 0, 0),
        };
        writer.write_all(&registration.to_be_bytes())?;
        writer.write_all(&[plugin, raw_mode])?;
    }
    Ok(())
}

pub fn read_registration_table<R: Read>(reader: &mut R) -> io::Result<RegistrationTable> {
    let mut table = [None; NUM_PLAYERS];
    for slot in &mut table {
        let registration = read_u32(reader)?;
        let plugin = read_u8(reader)?;
        let raw_mode = read_u8(reader)?;
        if registration != 0 {
            *slot = Some(PlayerData {
                registration: RegistrationId(registration),
                plugin,
                raw_mode,
            });
        }
    }
    Ok(table)
}
