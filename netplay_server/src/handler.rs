// Per-connection TCP handler.
//
// Each accepted connection gets one thread running `reader_loop`: read a
// message id byte, parse the body through `TcpMessage::read_body`, execute
// it against the shared `SessionState` (and the UDP server for registration
// and disconnect), write any response, repeat. The handler thread is the
// only reader and the only writer of its stream.
//
// The loop ends on EOF, on a read/parse error, or when a blocking receive is
// released by the session closing. The TCP server keeps a cloned stream per
// handler so `shutdown()` can unblock a read from another thread.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use netplay_protocol::framing::{read_u8, write_blob};
use netplay_protocol::message::write_registration_table;
use netplay_protocol::{PlayerData, RegisterResponse, TcpMessage};
use tracing::{debug, info, trace, warn};

use crate::error::ServerError;
use crate::session::SessionState;
use crate::udp_server::UdpServer;

/// Everything a handler needs besides its own stream.
pub(crate) struct HandlerContext {
    pub session: Arc<SessionState>,
    pub udp: Arc<UdpServer>,
    pub buffer_target: u8,
}

pub(crate) struct TcpClientHandler {
    peer: SocketAddr,
    stream: TcpStream,
    thread: JoinHandle<()>,
}

impl TcpClientHandler {
    pub fn spawn(stream: TcpStream, context: Arc<HandlerContext>) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream.try_clone()?);
        let thread = thread::Builder::new()
            .name(format!("netplay-tcp-{peer}"))
            .spawn(move || reader_loop(reader, writer, peer, &context))?;
        Ok(Self {
            peer,
            stream,
            thread,
        })
    }

    /// Unblock the handler's pending read. The thread exits on its own.
    pub fn shutdown(&self) {
        // Already-closed sockets report NotConnected; nothing to do then.
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            warn!(peer = %self.peer, "TCP handler thread panicked");
        }
    }
}

fn reader_loop(
    mut reader: BufReader<TcpStream>,
    mut writer: BufWriter<TcpStream>,
    peer: SocketAddr,
    context: &HandlerContext,
) {
    debug!(%peer, "TCP client connected");
    loop {
        let id = match read_u8(&mut reader) {
            Ok(id) => id,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(%peer, "TCP client closed connection");
                break;
            }
            Err(e) => {
                debug!(%peer, error = %e, "TCP read failed");
                break;
            }
        };

        let message = match TcpMessage::read_body(id, &mut reader) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, id, error = %e, "malformed TCP message, closing connection");
                break;
            }
        };

        trace!(%peer, id, "TCP message");
        match execute(message, &mut writer, peer, context) {
            Ok(()) => {}
            Err(ServerError::SessionClosed) => {
                debug!(%peer, "session closed while client was waiting");
                break;
            }
            Err(e) => {
                debug!(%peer, error = %e, "TCP write failed");
                break;
            }
        }
    }
    // The server still holds a clone of the stream; close it explicitly so
    // the client sees EOF.
    let _ = writer.get_ref().shutdown(Shutdown::Both);
}

fn execute<W: Write>(
    message: TcpMessage,
    writer: &mut W,
    peer: SocketAddr,
    context: &HandlerContext,
) -> Result<(), ServerError> {
    let session = &context.session;
    match message {
        TcpMessage::SendFile { name, data } => {
            session.store_file(name, Bytes::from(data));
            Ok(())
        }
        TcpMessage::ReceiveFile { name } => {
            let data = session
                .wait_for_file(&name)
                .ok_or(ServerError::SessionClosed)?;
            write_blob(writer, &data)?;
            Ok(writer.flush()?)
        }
        TcpMessage::SendSettings(settings) => {
            debug!(%peer, ?settings, "core settings uploaded");
            session.set_core_settings(settings);
            Ok(())
        }
        TcpMessage::ReceiveSettings => {
            let settings = session
                .wait_for_core_settings()
                .ok_or(ServerError::SessionClosed)?;
            settings.write_to(writer)?;
            Ok(writer.flush()?)
        }
        TcpMessage::RegisterPlayer {
            player,
            plugin,
            raw_mode,
            registration,
        } => {
            let accepted = session.register(
                player,
                PlayerData {
                    registration,
                    plugin,
                    raw_mode,
                },
            );
            if accepted {
                context.udp.register_player(registration, player, plugin);
            } else {
                info!(%peer, %player, registration = registration.0, "port already taken, registration refused");
            }
            RegisterResponse {
                accepted,
                buffer_target: context.buffer_target,
            }
            .write_to(writer)?;
            Ok(writer.flush()?)
        }
        TcpMessage::GetRegistration => {
            write_registration_table(writer, &session.registrations())?;
            Ok(writer.flush()?)
        }
        TcpMessage::DisconnectNotice { registration } => {
            context.udp.disconnect_player(registration);
            if let Some(player) = session.unregister(registration) {
                info!(%peer, %player, registration = registration.0, "client left");
            }
            Ok(())
        }
        TcpMessage::SendVideoSettings(settings) => {
            session.set_video_settings(settings);
            Ok(())
        }
        TcpMessage::ReceiveVideoSettings => {
            let settings = session
                .wait_for_video_settings()
                .ok_or(ServerError::SessionClosed)?;
            write_blob(writer, settings.as_bytes())?;
            Ok(writer.flush()?)
        }
    }
}
