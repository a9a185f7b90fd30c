// TCP session-channel server.
//
// Architecture: thread-per-connection around a shared `SessionState`.
//
// - **Accept thread**: polls a non-blocking `TcpListener` every 50ms,
//   checking the `running` flag between polls. Each accepted stream is put
//   back into blocking mode and handed to a `TcpClientHandler` thread.
// - **Handler threads** (one per client, see `handler.rs`): parse and
//   execute messages against the session and the UDP server.
//
// Shutdown: `stop()` clears `running`, closes the session (waking handlers
// blocked on downloads), and shuts down every client stream (waking handlers
// blocked on reads). The accept thread exits on its next poll and drops the
// listener. `wait()` joins the accept thread, then every handler.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::handler::{HandlerContext, TcpClientHandler};
use crate::session::SessionState;
use crate::udp_server::UdpServer;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct TcpServer {
    context: Arc<HandlerContext>,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    port: Mutex<Option<u16>>,
    clients: Arc<Mutex<Vec<TcpClientHandler>>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    /// `buffer_target` is echoed to clients in registration responses.
    pub fn new(buffer_target: u8, udp: Arc<UdpServer>) -> Self {
        Self {
            context: Arc::new(HandlerContext {
                session: Arc::new(SessionState::new()),
                udp,
                buffer_target,
            }),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            port: Mutex::new(None),
            clients: Arc::new(Mutex::new(Vec::new())),
            accept_thread: Mutex::new(None),
        }
    }

    /// Bind `address:port` (0 picks a free port) and start accepting.
    /// Returns the bound port.
    pub fn bind(&self, address: IpAddr, port: u16) -> Result<u16, ServerError> {
        let mut bound = self.port.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ServerError::Stopped);
        }
        if bound.is_some() {
            return Err(ServerError::AlreadyBound);
        }

        let addr = SocketAddr::new(address, port);
        let listener = TcpListener::bind(addr).map_err(|source| ServerError::Bind {
            transport: "TCP",
            addr,
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);
        let context = self.context.clone();
        let running = self.running.clone();
        let clients = self.clients.clone();
        let handle = thread::Builder::new()
            .name("netplay-tcp-accept".into())
            .spawn(move || accept_loop(listener, context, running, clients))?;
        *self.accept_thread.lock() = Some(handle);

        *bound = Some(local.port());
        info!(%local, "TCP server listening");
        Ok(local.port())
    }

    pub fn port(&self) -> Option<u16> {
        *self.port.lock()
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.context.session
    }

    /// Stop accepting and release every connected client. Safe to call
    /// repeatedly, and before `bind`.
    pub fn stop(&self) {
        let _bound = self.port.lock();
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        self.context.session.close();
        for client in self.clients.lock().iter() {
            client.shutdown();
        }
        debug!("TCP server stopping");
    }

    /// Block until the accept thread and every handler have exited.
    pub fn wait(&self) {
        let accept = self.accept_thread.lock().take();
        if accept.is_some_and(|handle| handle.join().is_err()) {
            warn!("TCP accept thread panicked");
        }
        let clients = std::mem::take(&mut *self.clients.lock());
        for client in clients {
            client.join();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    context: Arc<HandlerContext>,
    running: Arc<AtomicBool>,
    clients: Arc<Mutex<Vec<TcpClientHandler>>>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, error = %e, "failed to configure client stream");
                    continue;
                }
                let handler = match TcpClientHandler::spawn(stream, context.clone()) {
                    Ok(handler) => handler,
                    Err(e) => {
                        warn!(%peer, error = %e, "failed to start client handler");
                        continue;
                    }
                };

                let mut clients = clients.lock();
                // `stop()` flips `running` before taking this lock, so a
                // client accepted during shutdown is released here.
                if !running.load(Ordering::SeqCst) {
                    handler.shutdown();
                }
                clients.retain(|client| !client.is_finished());
                clients.push(handler);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!(error = %e, "TCP accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    info!("TCP server stopped");
}
