// Netplay service host.
//
// `NetplayService::start` runs the whole server on a background thread:
// create the UDP and TCP servers, bind TCP (port 0 lets the OS choose),
// bind UDP on the same port number, report `PortObtained`, then wait for
// both servers to stop and report `Finished`. Engine events are forwarded
// to the application as `ServiceEvent::Netplay` while the servers run.
//
// `stop_servers()` may be called at any point, from any thread, any number
// of times. A stop that lands before the servers exist is remembered and
// the background thread exits without binding; one that lands between
// creation and binding makes the pending bind fail with `Stopped`, which is
// treated as a clean stop rather than a start failure.
//
// The service also ties the two servers together on disconnect: when the
// engine drops a player (notice or keepalive expiry), the forwarder frees
// that player's port in the TCP session before passing the event on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::event::{NetplayEvent, ServiceEvent};
use crate::session::SessionState;
use crate::tcp_server::TcpServer;
use crate::udp_server::UdpServer;

const FORWARD_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct ServiceState {
    udp: Option<Arc<UdpServer>>,
    tcp: Option<Arc<TcpServer>>,
    stop_requested: bool,
}

pub struct NetplayService {
    state: Arc<Mutex<ServiceState>>,
    thread: Option<JoinHandle<()>>,
}

impl NetplayService {
    /// Start serving on a background thread. The receiver yields lifecycle
    /// and engine events; `ServiceEvent::Finished` is always last.
    pub fn start(config: ServerConfig) -> Result<(Self, Receiver<ServiceEvent>), ServerError> {
        let state = Arc::new(Mutex::new(ServiceState::default()));
        let (tx, rx) = mpsc::channel();
        let thread = {
            let state = state.clone();
            thread::Builder::new()
                .name("netplay-service".into())
                .spawn(move || {
                    run_service(&config, &state, &tx);
                    let mut state = state.lock();
                    state.udp = None;
                    state.tcp = None;
                    drop(state);
                    let _ = tx.send(ServiceEvent::Finished);
                })?
        };
        Ok((
            Self {
                state,
                thread: Some(thread),
            },
            rx,
        ))
    }

    /// Ask both servers to stop. Idempotent; safe before the servers exist.
    pub fn stop_servers(&self) {
        let mut state = self.state.lock();
        if !state.stop_requested {
            info!("stopping netplay servers");
        }
        state.stop_requested = true;
        if let Some(tcp) = &state.tcp {
            tcp.stop();
        }
        if let Some(udp) = &state.udp {
            udp.stop();
        }
    }

    /// The TCP/UDP port, once both servers are bound.
    pub fn port(&self) -> Option<u16> {
        let state = self.state.lock();
        let udp = state.udp.as_ref()?.port()?;
        let tcp = state.tcp.as_ref()?.port()?;
        (udp == tcp).then_some(tcp)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the servers and wait for the background thread to exit.
    pub fn shutdown(mut self) {
        self.stop_servers();
        self.join_thread();
    }

    fn join_thread(&mut self) {
        let handle = self.thread.take();
        if handle.is_some_and(|handle| handle.join().is_err()) {
            warn!("netplay service thread panicked");
        }
    }
}

impl Drop for NetplayService {
    fn drop(&mut self) {
        self.stop_servers();
        self.join_thread();
    }
}

fn run_service(config: &ServerConfig, state: &Mutex<ServiceState>, tx: &Sender<ServiceEvent>) {
    let (netplay_tx, netplay_rx) = mpsc::channel();
    let udp = Arc::new(UdpServer::new(config, netplay_tx));
    let tcp = Arc::new(TcpServer::new(config.buffer_target, udp.clone()));
    {
        let mut state = state.lock();
        if state.stop_requested {
            info!("netplay service stopped before start");
            return;
        }
        state.udp = Some(udp.clone());
        state.tcp = Some(tcp.clone());
    }

    let port = match tcp
        .bind(config.bind_address, config.port)
        .and_then(|port| udp.bind(config.bind_address, port))
    {
        Ok(port) => port,
        Err(ServerError::Stopped) => {
            tcp.stop();
            udp.stop();
            tcp.wait();
            udp.wait();
            info!("netplay service stopped during start");
            return;
        }
        Err(e) => {
            error!(error = %e, "netplay service failed to start");
            tcp.stop();
            udp.stop();
            tcp.wait();
            udp.wait();
            let _ = tx.send(ServiceEvent::StartFailed(e.to_string()));
            return;
        }
    };

    info!(port, "netplay service running");
    let _ = tx.send(ServiceEvent::PortObtained(port));

    let servers_done = Arc::new(AtomicBool::new(false));
    let forwarder = {
        let servers_done = servers_done.clone();
        let session = tcp.session().clone();
        let tx = tx.clone();
        thread::spawn(move || forward_events(&netplay_rx, &tx, &servers_done, &session))
    };

    udp.wait();
    tcp.wait();
    servers_done.store(true, Ordering::SeqCst);
    if forwarder.join().is_err() {
        warn!("event forwarder panicked");
    }
    info!("netplay service finished");
}

fn forward_events(
    netplay_rx: &Receiver<NetplayEvent>,
    tx: &Sender<ServiceEvent>,
    servers_done: &AtomicBool,
    session: &SessionState,
) {
    loop {
        match netplay_rx.recv_timeout(FORWARD_POLL_INTERVAL) {
            Ok(event) => forward_event(event, tx, session),
            Err(RecvTimeoutError::Timeout) if !servers_done.load(Ordering::SeqCst) => {}
            Err(_) => break,
        }
    }
    // Events queued between the last poll and shutdown.
    while let Ok(event) = netplay_rx.try_recv() {
        forward_event(event, tx, session);
    }
}

/// Pass `event` on to the application. A disconnect also frees the player's
/// port in the TCP session, so keepalive expiry and `DISCONNECT_NOTICE`
/// leave the registration table in the same state. The port is freed before
/// the event is sent.
fn forward_event(event: NetplayEvent, tx: &Sender<ServiceEvent>, session: &SessionState) {
    let released = match event {
        NetplayEvent::PlayerDisconnected { registration, .. } => session.unregister(registration),
        NetplayEvent::Desync { .. } => None,
    };
    if let Some(player) = released {
        info!(%player, "port released");
    }
    let _ = tx.send(ServiceEvent::Netplay(event));
}
