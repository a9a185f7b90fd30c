// Client side of the netplay protocol.
//
// `NetplayClient` speaks both channels to a running server:
// - TCP (request/response, on the calling thread): settings, files,
//   registration, disconnect. Blocking downloads (`receive_settings`,
//   `receive_file`, `receive_video_settings`) return once the host has
//   uploaded the data, or fail with the stream's read timeout if one is set.
// - UDP: `send_key_info` / `request_data` / `send_cp0` go out immediately.
//   A background reader thread decodes `SERVER_KEY_INFO` run packets into an
//   `mpsc` inbox that `poll()` drains without blocking.
//
// It lives in the server crate because it has no dependencies beyond std
// sockets and the protocol crate, which makes it usable from integration
// tests and tools alike. An emulator core implements the same wire format
// natively.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use netplay_protocol::framing::read_blob;
use netplay_protocol::message::read_registration_table;
use netplay_protocol::udp::CP0_BLOCK_LEN;
use netplay_protocol::{
    ClientDatagram, CoreSettings, InputRecord, PlayerNumber, RegisterResponse, RegistrationId,
    RegistrationTable, ServerKeyInfo, TcpMessage,
};
use tracing::trace;

use crate::error::ServerError;

const UDP_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct NetplayClient {
    writer: BufWriter<TcpStream>,
    reader: BufReader<TcpStream>,
    udp: Arc<UdpSocket>,
    server_udp: SocketAddr,
    inbox: Receiver<ServerKeyInfo>,
    running: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
}

impl NetplayClient {
    /// Connect the TCP channel to `server` and open a UDP socket aimed at the
    /// same address and port.
    pub fn connect(server: SocketAddr) -> Result<Self, ServerError> {
        let stream = TcpStream::connect(server)?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);

        let local_ip: IpAddr = match server.ip() {
            ip if ip.is_loopback() => ip,
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let udp = Arc::new(UdpSocket::bind((local_ip, 0))?);
        udp.set_read_timeout(Some(UDP_POLL_INTERVAL))?;

        let running = Arc::new(AtomicBool::new(true));
        let (tx, inbox) = mpsc::channel();
        let reader_thread = {
            let udp = udp.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("netplay-client-udp".into())
                .spawn(move || udp_reader_loop(&udp, &tx, &running))?
        };

        Ok(Self {
            writer,
            reader,
            udp,
            server_udp: server,
            inbox,
            running,
            reader_thread: Some(reader_thread),
        })
    }

    /// Bound how long TCP downloads may block. `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.reader.get_ref().set_read_timeout(timeout)
    }

    pub fn udp_local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    // -----------------------------------------------------------------------
    // TCP
    // -----------------------------------------------------------------------

    pub fn register_player(
        &mut self,
        player: PlayerNumber,
        plugin: u8,
        raw_mode: u8,
        registration: RegistrationId,
    ) -> Result<RegisterResponse, ServerError> {
        self.send(&TcpMessage::RegisterPlayer {
            player,
            plugin,
            raw_mode,
            registration,
        })?;
        Ok(RegisterResponse::read_from(&mut self.reader)?)
    }

    pub fn registrations(&mut self) -> Result<RegistrationTable, ServerError> {
        self.send(&TcpMessage::GetRegistration)?;
        Ok(read_registration_table(&mut self.reader)?)
    }

    pub fn send_settings(&mut self, settings: CoreSettings) -> Result<(), ServerError> {
        self.send(&TcpMessage::SendSettings(settings))
    }

    pub fn receive_settings(&mut self) -> Result<CoreSettings, ServerError> {
        self.send(&TcpMessage::ReceiveSettings)?;
        Ok(CoreSettings::read_from(&mut self.reader)?)
    }

    pub fn send_video_settings(&mut self, settings: &str) -> Result<(), ServerError> {
        self.send(&TcpMessage::SendVideoSettings(settings.to_owned()))
    }

    pub fn receive_video_settings(&mut self) -> Result<String, ServerError> {
        self.send(&TcpMessage::ReceiveVideoSettings)?;
        let raw = read_blob(&mut self.reader)?;
        String::from_utf8(raw).map_err(|e| ServerError::Protocol(e.into()))
    }

    pub fn send_file(&mut self, name: &str, data: &[u8]) -> Result<(), ServerError> {
        self.send(&TcpMessage::SendFile {
            name: name.to_owned(),
            data: data.to_vec(),
        })
    }

    pub fn receive_file(&mut self, name: &str) -> Result<Vec<u8>, ServerError> {
        self.send(&TcpMessage::ReceiveFile {
            name: name.to_owned(),
        })?;
        Ok(read_blob(&mut self.reader)?)
    }

    /// Tell the server this registration is leaving.
    pub fn disconnect(&mut self, registration: RegistrationId) -> Result<(), ServerError> {
        self.send(&TcpMessage::DisconnectNotice { registration })
    }

    fn send(&mut self, message: &TcpMessage) -> Result<(), ServerError> {
        message.write_to(&mut self.writer)?;
        self.writer.flush()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // UDP
    // -----------------------------------------------------------------------

    pub fn send_key_info(
        &self,
        player: PlayerNumber,
        count: u32,
        input: InputRecord,
    ) -> io::Result<()> {
        self.send_datagram(&ClientDatagram::KeyInfo {
            player,
            count,
            input,
        })
    }

    /// Poll `player`'s inputs from `count`. Spectators send no buffer
    /// health.
    pub fn request_data(
        &self,
        player: PlayerNumber,
        registration: RegistrationId,
        count: u32,
        buffer_health: Option<u8>,
    ) -> io::Result<()> {
        self.send_datagram(&ClientDatagram::RequestData {
            player,
            registration,
            count,
            spectator: buffer_health.is_none(),
            buffer_health,
        })
    }

    pub fn send_cp0(&self, vi_count: u32, block: [u8; CP0_BLOCK_LEN]) -> io::Result<()> {
        self.send_datagram(&ClientDatagram::Cp0Data {
            vi_count,
            block: Box::new(block),
        })
    }

    fn send_datagram(&self, datagram: &ClientDatagram) -> io::Result<()> {
        self.udp.send_to(&datagram.encode(), self.server_udp)?;
        Ok(())
    }

    /// Drain all received run packets (non-blocking).
    pub fn poll(&self) -> Vec<ServerKeyInfo> {
        self.inbox.try_iter().collect()
    }

    /// Wait up to `timeout` for the next run packet.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ServerKeyInfo> {
        self.inbox.recv_timeout(timeout).ok()
    }
}

impl Drop for NetplayClient {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

fn udp_reader_loop(udp: &UdpSocket, tx: &Sender<ServerKeyInfo>, running: &AtomicBool) {
    let mut buf = [0u8; 1024];
    while running.load(Ordering::SeqCst) {
        let len = match udp.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(_) => continue,
        };
        match ServerKeyInfo::decode(&buf[..len]) {
            Ok(packet) => {
                if tx.send(packet).is_err() {
                    break;
                }
            }
            Err(e) => trace!(error = %e, "ignoring undecodable datagram"),
        }
    }
}
