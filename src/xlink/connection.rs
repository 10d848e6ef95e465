//! UDP connection to an XLink Kai instance
//!
//! Handles discovery (broadcast handshake, first reply fixes the endpoint),
//! the login handshake, keepalives and the bidirectional Ethernet frame
//! relay. One receiver thread per connection; `close` joins it and sends an
//! orderly disconnect first when the handshake had completed.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::capture::Connector;

use super::{
    chat_message, connect_message, ethernet_message, parse_message, XLinkMessage, TAG_DISCONNECT,
    TAG_KEEPALIVE,
};

/// Handshake must complete within this window
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive send cadence while connected
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);

/// The session fails after this long without any inbound traffic
pub const KEEPALIVE_WINDOW: Duration = Duration::from_secs(15);

/// Socket read timeout; bounds the join latency of `close`
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Discovering,
    Connecting,
    Connected,
    Failed,
}

/// XLink connection errors
#[derive(Debug, Error)]
pub enum XLinkError {
    #[error("xlink unavailable: {0}")]
    Unavailable(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("not connected")]
    NotConnected,

    #[error("receiver thread already running")]
    ReceiverAlreadyRunning,

    #[error("fatal: {0}")]
    Fatal(String),
}

/// UDP client for the XLink Kai e-info protocol.
pub struct XLinkKaiConnection {
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    socket: RwLock<Option<UdpSocket>>,
    remote: RwLock<Option<SocketAddr>>,
    state: RwLock<ConnectionState>,
    running: AtomicBool,
    device: RwLock<Option<Weak<dyn Connector>>>,
    timing: Mutex<Timing>,
    handshake_timeout: RwLock<Duration>,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

struct Timing {
    opened_at: Instant,
    last_keepalive_sent: Instant,
    last_inbound: Instant,
}

impl XLinkKaiConnection {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            shared: Arc::new(Shared {
                socket: RwLock::new(None),
                remote: RwLock::new(None),
                state: RwLock::new(ConnectionState::Disconnected),
                running: AtomicBool::new(false),
                device: RwLock::new(None),
                timing: Mutex::new(Timing {
                    opened_at: now,
                    last_keepalive_sent: now,
                    last_inbound: now,
                }),
                handshake_timeout: RwLock::new(HANDSHAKE_TIMEOUT),
                frames_sent: AtomicU64::new(0),
                frames_received: AtomicU64::new(0),
            }),
            receiver: Mutex::new(None),
        }
    }

    /// Shrink the handshake window; the production default is
    /// [`HANDSHAKE_TIMEOUT`].
    pub fn set_handshake_timeout(&self, timeout: Duration) {
        *self.shared.handshake_timeout.write() = timeout;
    }

    /// Attach the capture device receiving downstream frames.
    pub fn set_device(&self, device: Weak<dyn Connector>) {
        *self.shared.device.write() = Some(device);
    }

    /// Open the connection. An empty `host` starts discovery: the handshake
    /// is broadcast on the discovery port and the first `connected;` reply
    /// fixes the remote endpoint. Otherwise the handshake goes straight to
    /// `host:port`.
    pub fn open(&self, host: &str, port: u16) -> Result<(), XLinkError> {
        if self.shared.socket.read().is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .map_err(|e| XLinkError::Unavailable(format!("bind failed: {}", e)))?;
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| XLinkError::Unavailable(e.to_string()))?;

        let handshake = connect_message();
        if host.is_empty() {
            socket
                .set_broadcast(true)
                .map_err(|e| XLinkError::Unavailable(e.to_string()))?;
            // "loopback/LAN": probe both; whoever answers first wins
            let _ = socket.send_to(&handshake, (Ipv4Addr::BROADCAST, port));
            socket
                .send_to(&handshake, (Ipv4Addr::LOCALHOST, port))
                .map_err(|e| XLinkError::Unavailable(format!("discovery send failed: {}", e)))?;
            *self.shared.remote.write() = None;
            *self.shared.state.write() = ConnectionState::Discovering;
            info!(port, "searching for an XLink Kai instance");
        } else {
            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .map_err(|_| XLinkError::InvalidAddress(format!("{}:{}", host, port)))?;
            socket
                .send_to(&handshake, addr)
                .map_err(|e| XLinkError::Unavailable(format!("handshake send failed: {}", e)))?;
            *self.shared.remote.write() = Some(addr);
            *self.shared.state.write() = ConnectionState::Connecting;
            info!(%addr, "connecting to XLink Kai");
        }

        let now = Instant::now();
        *self.shared.timing.lock() = Timing {
            opened_at: now,
            last_keepalive_sent: now,
            last_inbound: now,
        };
        *self.shared.socket.write() = Some(socket);
        Ok(())
    }

    /// Send the orderly disconnect (when connected), stop and join the
    /// receiver, release the socket. Safe to call in any state.
    pub fn close(&self) {
        if *self.shared.state.read() == ConnectionState::Connected {
            if let Err(e) = self.shared.send_raw(TAG_DISCONNECT) {
                debug!(error = %e, "disconnect message not sent");
            }
        }

        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.receiver.lock().take() {
            let _ = handle.join();
        }
        *self.shared.socket.write() = None;
        *self.shared.remote.write() = None;
        *self.shared.state.write() = ConnectionState::Disconnected;
    }

    /// Spawn the receive loop. May be called once per open.
    pub fn start_receiver(&self) -> Result<(), XLinkError> {
        if self.shared.socket.read().is_none() {
            return Err(XLinkError::NotConnected);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(XLinkError::ReceiverAlreadyRunning);
        }

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("xlink-rx".into())
            .spawn(move || shared.receive_loop())
            .map_err(|e| {
                self.shared.running.store(false, Ordering::Release);
                XLinkError::Fatal(e.to_string())
            })?;
        *self.receiver.lock() = Some(handle);
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Send a chat line to the connected instance.
    pub fn send_chat(&self, msg: &str) -> Result<(), XLinkError> {
        if *self.shared.state.read() != ConnectionState::Connected {
            return Err(XLinkError::NotConnected);
        }
        self.shared.send_raw(&chat_message(msg))
    }

    /// Frames relayed in each direction so far.
    pub fn frame_counts(&self) -> (u64, u64) {
        (
            self.shared.frames_sent.load(Ordering::Relaxed),
            self.shared.frames_received.load(Ordering::Relaxed),
        )
    }
}

impl Default for XLinkKaiConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn send_raw(&self, message: &[u8]) -> Result<(), XLinkError> {
        let remote = (*self.remote.read()).ok_or(XLinkError::NotConnected)?;
        let guard = self.socket.read();
        let socket = guard.as_ref().ok_or(XLinkError::NotConnected)?;
        socket
            .send_to(message, remote)
            .map_err(|e| XLinkError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn receive_loop(self: Arc<Self>) {
        debug!("xlink receiver started");
        let mut buffer = vec![0u8; 65536];

        while self.running.load(Ordering::Acquire) {
            self.run_timers();

            let result = {
                let guard = self.socket.read();
                let Some(socket) = guard.as_ref() else { break };
                socket.recv_from(&mut buffer)
            };

            match result {
                Ok((size, source)) => self.dispatch(&buffer[..size], source),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        error!(error = %e, "xlink receive failed");
                        *self.state.write() = ConnectionState::Failed;
                    }
                    break;
                }
            }
        }
        debug!("xlink receiver stopped");
    }

    /// Handshake deadline, keepalive cadence and the missed-keepalive
    /// window.
    fn run_timers(&self) {
        let state = *self.state.read();
        let now = Instant::now();
        let mut timing = self.timing.lock();

        match state {
            ConnectionState::Discovering | ConnectionState::Connecting => {
                if now.duration_since(timing.opened_at) > *self.handshake_timeout.read() {
                    drop(timing);
                    error!("XLink Kai handshake timed out");
                    *self.state.write() = ConnectionState::Failed;
                }
            }
            ConnectionState::Connected => {
                if now.duration_since(timing.last_inbound) > KEEPALIVE_WINDOW {
                    drop(timing);
                    error!("XLink Kai stopped answering keepalives");
                    *self.state.write() = ConnectionState::Failed;
                    return;
                }
                if now.duration_since(timing.last_keepalive_sent) >= KEEPALIVE_INTERVAL {
                    timing.last_keepalive_sent = now;
                    drop(timing);
                    if let Err(e) = self.send_raw(TAG_KEEPALIVE) {
                        warn!(error = %e, "keepalive not sent");
                    }
                }
            }
            _ => {}
        }
    }

    fn dispatch(&self, data: &[u8], source: SocketAddr) {
        // After the endpoint is fixed, ignore strays from elsewhere
        if let Some(remote) = *self.remote.read() {
            if source != remote {
                return;
            }
        }

        self.timing.lock().last_inbound = Instant::now();

        match parse_message(data) {
            XLinkMessage::Connected => {
                let mut state = self.state.write();
                if matches!(
                    *state,
                    ConnectionState::Discovering | ConnectionState::Connecting
                ) {
                    *state = ConnectionState::Connected;
                    drop(state);
                    self.remote.write().get_or_insert(source);
                    info!(%source, "connected to XLink Kai");
                }
            }
            XLinkMessage::Keepalive => {
                if let Err(e) = self.send_raw(TAG_KEEPALIVE) {
                    warn!(error = %e, "keepalive reply not sent");
                }
            }
            XLinkMessage::Ethernet(payload) => {
                self.frames_received.fetch_add(1, Ordering::Relaxed);
                if let Some(device) = self.device.read().as_ref().and_then(Weak::upgrade) {
                    if let Err(e) = device.send_frame(payload) {
                        debug!(error = %e, "downstream frame not injected");
                    }
                }
            }
            XLinkMessage::Chat(msg) => {
                info!(chat = %String::from_utf8_lossy(msg), "XLink Kai chat");
            }
            XLinkMessage::Disconnect => {
                warn!("XLink Kai requested disconnect");
                *self.state.write() = ConnectionState::Failed;
            }
            XLinkMessage::Unknown(raw) => {
                warn!(
                    tag = %String::from_utf8_lossy(&raw[..raw.len().min(24)]),
                    "unknown XLink Kai message"
                );
            }
        }
    }
}

impl Connector for XLinkKaiConnection {
    /// Encapsulate an upstream Ethernet frame as a single `e;e;` datagram.
    fn send_frame(&self, data: &[u8]) -> anyhow::Result<()> {
        if *self.shared.state.read() != ConnectionState::Connected {
            anyhow::bail!("xlink session not connected");
        }
        self.shared.send_raw(&ethernet_message(data))?;
        self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DummyDevice;

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    struct FakeKai {
        socket: UdpSocket,
    }

    impl FakeKai {
        fn start() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            Self { socket }
        }

        fn port(&self) -> u16 {
            self.socket.local_addr().unwrap().port()
        }

        fn recv(&self) -> (Vec<u8>, SocketAddr) {
            let mut buf = vec![0u8; 65536];
            let (size, source) = self.socket.recv_from(&mut buf).unwrap();
            buf.truncate(size);
            (buf, source)
        }

        fn accept_handshake(&self) -> SocketAddr {
            let (msg, source) = self.recv();
            assert!(msg.starts_with(b"connect;"));
            self.socket
                .send_to(b"connected;kai;7.4.18;", source)
                .unwrap();
            source
        }
    }

    fn open_connected(kai: &FakeKai) -> XLinkKaiConnection {
        let connection = XLinkKaiConnection::new();
        connection.open("127.0.0.1", kai.port()).unwrap();
        connection.start_receiver().unwrap();
        kai.accept_handshake();
        assert!(wait_for(
            || connection.state() == ConnectionState::Connected,
            Duration::from_secs(2)
        ));
        connection
    }

    #[test]
    fn test_handshake_fixes_state() {
        let kai = FakeKai::start();
        let connection = open_connected(&kai);
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_discovery_finds_instance() {
        let kai = FakeKai::start();
        let connection = XLinkKaiConnection::new();
        connection.open("", kai.port()).unwrap();
        assert_eq!(connection.state(), ConnectionState::Discovering);
        connection.start_receiver().unwrap();

        // Broadcast and loopback probes may both arrive; answer the first
        kai.accept_handshake();
        assert!(wait_for(
            || connection.state() == ConnectionState::Connected,
            Duration::from_secs(2)
        ));
        connection.close();
    }

    #[test]
    fn test_sent_frame_is_single_tagged_datagram() {
        let kai = FakeKai::start();
        let connection = open_connected(&kai);

        let payload = vec![0xde, 0xad, 0xbe, 0xef, 0x3b, 0x00];
        connection.send_frame(&payload).unwrap();

        let (datagram, _) = kai.recv();
        let mut expected = b"e;e;".to_vec();
        expected.extend_from_slice(&payload);
        assert_eq!(datagram, expected);
        assert_eq!(connection.frame_counts().0, 1);

        connection.send_chat("room for one more?").unwrap();
        let chat = {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                let (msg, _) = kai.recv();
                if msg.starts_with(b"e;chat;") {
                    break msg;
                }
                assert!(Instant::now() < deadline, "no chat message");
            }
        };
        assert_eq!(chat, b"e;chat;room for one more?;".to_vec());
        connection.close();
    }

    #[test]
    fn test_send_requires_connected() {
        let connection = XLinkKaiConnection::new();
        assert!(connection.send_frame(&[1, 2, 3]).is_err());
        assert!(matches!(
            connection.send_chat("hi"),
            Err(XLinkError::NotConnected)
        ));
    }

    #[test]
    fn test_downstream_frame_reaches_device() {
        let kai = FakeKai::start();
        let connection = open_connected(&kai);

        let device = Arc::new(DummyDevice::default());
        connection.set_device(Arc::downgrade(
            &(device.clone() as Arc<dyn Connector>),
        ));

        let client = connection.shared.socket.read().as_ref().unwrap().local_addr().unwrap();
        let mut datagram = b"e;e;".to_vec();
        datagram.extend_from_slice(&[9, 8, 7]);
        kai.socket.send_to(&datagram, client).unwrap();

        assert!(wait_for(
            || device.sent_frames() == vec![vec![9, 8, 7]],
            Duration::from_secs(2)
        ));
        connection.close();
    }

    #[test]
    fn test_keepalive_probe_answered_in_kind() {
        let kai = FakeKai::start();
        let connection = open_connected(&kai);

        let client = connection.shared.socket.read().as_ref().unwrap().local_addr().unwrap();
        kai.socket.send_to(b"keepalive;", client).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let (msg, _) = kai.recv();
            if msg == b"e;keepalive;" {
                break;
            }
            assert!(Instant::now() < deadline, "no keepalive reply");
        }
        connection.close();
    }

    #[test]
    fn test_handshake_timeout_fails_session() {
        // Nobody listens on this port
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();

        let connection = XLinkKaiConnection::new();
        connection.set_handshake_timeout(Duration::from_millis(100));
        connection.open("127.0.0.1", port).unwrap();
        connection.start_receiver().unwrap();

        assert!(wait_for(
            || connection.state() == ConnectionState::Failed,
            Duration::from_secs(2)
        ));
        connection.close();
    }

    #[test]
    fn test_close_sends_disconnect() {
        let kai = FakeKai::start();
        let connection = open_connected(&kai);
        connection.close();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let (msg, _) = kai.recv();
            if msg == b"disconnect;disconnect;" {
                break;
            }
            assert!(Instant::now() < deadline, "no disconnect message");
        }
    }

    #[test]
    fn test_incoming_disconnect_fails_session() {
        let kai = FakeKai::start();
        let connection = open_connected(&kai);

        let client = connection.shared.socket.read().as_ref().unwrap().local_addr().unwrap();
        kai.socket.send_to(b"disconnect;bye;", client).unwrap();

        assert!(wait_for(
            || connection.state() == ConnectionState::Failed,
            Duration::from_secs(2)
        ));
        connection.close();
    }
}
