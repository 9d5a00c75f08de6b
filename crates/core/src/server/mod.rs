//! Minimal WebSocket broadcast server.
//!
//! Two OS threads run per server: one accepts connections and completes the
//! upgrade handshake, the other periodically pushes the latest payload to
//! every open client. The client registry is the only state they share and
//! its lock is never held across network I/O.

pub mod frame;
pub mod handshake;

use std::{
    io::Write,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{config::BroadcastConfig, Result, SpectrumError};

pub use frame::encode_text_frame;
pub use handshake::{accept_key, WEBSOCKET_GUID};

/// Produces the text payload for one fan-out tick.
pub type PayloadProvider = Arc<dyn Fn() -> String + Send + Sync>;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of a single connection. Transitions only move forward:
/// `Connecting -> Open -> Closed` or `Connecting -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// One accepted TCP connection.
#[derive(Debug)]
pub struct Client {
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    state: AtomicU8,
    // Held for a whole frame so concurrent senders never interleave bytes.
    writer: Mutex<()>,
}

impl Client {
    fn new(id: u64, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            stream,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            writer: Mutex::new(()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Reads the upgrade request and answers it. On success the client is
    /// `Open`; on any failure it is closed.
    fn handshake(&self, timeout: Option<Duration>) -> Result<()> {
        let result = self.try_handshake(timeout);
        if result.is_ok() {
            let _ = self.state.compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        } else {
            self.close();
        }
        result
    }

    fn try_handshake(&self, timeout: Option<Duration>) -> Result<()> {
        let handshake_err = |err: std::io::Error| SpectrumError::Handshake(err.to_string());

        // Accepted sockets may inherit non-blocking mode from the listener.
        self.stream.set_nonblocking(false).map_err(handshake_err)?;
        self.stream.set_read_timeout(timeout).map_err(handshake_err)?;

        let request = handshake::read_request(&mut &self.stream).map_err(|err| match err {
            SpectrumError::Io(io) => handshake_err(io),
            other => other,
        })?;
        let key = handshake::client_key(&request)?;

        (&self.stream)
            .write_all(handshake::upgrade_response(key).as_bytes())
            .map_err(handshake_err)?;
        self.stream.set_read_timeout(None).map_err(handshake_err)?;
        Ok(())
    }

    /// Writes one complete frame.
    fn send(&self, frame: &[u8]) -> std::io::Result<()> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stream = &self.stream;
        stream.write_all(frame)?;
        stream.flush()
    }

    /// Shuts the socket down. Returns `false` if it was already closed.
    fn close(&self) -> bool {
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous == ConnectionState::Closed as u8 {
            return false;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        true
    }
}

#[derive(Debug, Default)]
struct Shared {
    running: AtomicBool,
    next_id: AtomicU64,
    clients: Mutex<Vec<Arc<Client>>>,
}

impl Shared {
    fn clients(&self) -> MutexGuard<'_, Vec<Arc<Client>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr, timeout: Option<Duration>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(Client::new(id, stream, peer));

        if let Err(err) = client.handshake(timeout) {
            tracing::debug!(%peer, %err, "dropping connection");
            return;
        }

        let count = {
            let mut clients = self.clients();
            clients.push(Arc::clone(&client));
            clients.len()
        };
        tracing::info!(%peer, id, clients = count, "client connected");
    }

    /// Sends one frame to every open client and prunes those that failed.
    /// Returns the number of clients that received the frame.
    fn broadcast(&self, frame: &[u8]) -> usize {
        let snapshot: Vec<Arc<Client>> = self.clients().clone();
        if snapshot.is_empty() {
            return 0;
        }

        let mut dead = Vec::new();
        for client in &snapshot {
            if let Err(err) = client.send(frame) {
                tracing::debug!(peer = %client.peer, %err, "send failed");
                dead.push(client.id);
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients();
            clients.retain(|client| {
                if dead.contains(&client.id) {
                    client.close();
                    tracing::info!(peer = %client.peer, id = client.id, "client pruned");
                    false
                } else {
                    true
                }
            });
        }

        snapshot.len() - dead.len()
    }

    fn close_all(&self) {
        let clients: Vec<Arc<Client>> = self.clients().drain(..).collect();
        for client in clients {
            client.close();
        }
    }
}

/// Pushes a text payload to every connected WebSocket client on a fixed
/// interval.
pub struct BroadcastServer {
    config: BroadcastConfig,
    shared: Arc<Shared>,
    local_addr: Mutex<Option<SocketAddr>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl BroadcastServer {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            local_addr: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    /// Binds the listener and spawns the accept and fan-out loops.
    ///
    /// Returns the bound address. Calling `start` on a running server is a
    /// no-op that returns the existing address.
    pub fn start(&self, provider: PayloadProvider) -> Result<SocketAddr> {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shared.running.load(Ordering::Acquire) {
            return self
                .local_addr()
                .ok_or_else(|| SpectrumError::msg("server is running without an address"));
        }

        let listener =
            TcpListener::bind((self.config.bind_address.as_str(), self.config.port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);

        self.shared.running.store(true, Ordering::Release);

        let accept = {
            let shared = Arc::clone(&self.shared);
            let timeout = self.config.handshake_timeout();
            thread::Builder::new()
                .name("ws-accept".into())
                .spawn(move || accept_loop(listener, shared, timeout))
        };
        let accept = match accept {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(err.into());
            }
        };
        threads.push(accept);

        let fan_out = {
            let shared = Arc::clone(&self.shared);
            let interval = self.config.interval();
            thread::Builder::new()
                .name("ws-fanout".into())
                .spawn(move || fan_out_loop(shared, provider, interval))
        };
        match fan_out {
            Ok(handle) => threads.push(handle),
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                for handle in threads.drain(..) {
                    let _ = handle.join();
                }
                return Err(err.into());
            }
        }

        tracing::info!(
            %addr,
            interval_ms = self.config.interval().as_millis() as u64,
            "broadcast server listening"
        );
        Ok(addr)
    }

    /// Stops both loops, waits for them to exit and closes every remaining
    /// client. Safe to call repeatedly and before [`BroadcastServer::start`].
    pub fn stop(&self) {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        for handle in threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("broadcast thread panicked");
            }
        }
        self.shared.close_all();
        tracing::info!("broadcast server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of clients currently in the registry.
    pub fn client_count(&self) -> usize {
        self.shared.clients().len()
    }

    /// Sends `payload` to every client immediately, outside the regular
    /// cadence. Returns how many clients received it.
    pub fn broadcast(&self, payload: &str) -> usize {
        self.shared.broadcast(&encode_text_frame(payload))
    }
}

impl Drop for BroadcastServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for BroadcastServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastServer")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("clients", &self.client_count())
            .finish()
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, timeout: Option<Duration>) {
    while shared.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => shared.admit(stream, peer, timeout),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                tracing::debug!(%err, "accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    // Dropping the listener closes the socket.
}

fn fan_out_loop(shared: Arc<Shared>, provider: PayloadProvider, interval: Duration) {
    while shared.running.load(Ordering::Acquire) {
        let payload = provider();
        let frame = encode_text_frame(&payload);
        shared.broadcast(&frame);
        sleep_while_running(&shared, interval);
    }
}

/// Sleeps for `duration` in short slices so a stop request is noticed
/// within [`ACCEPT_POLL_INTERVAL`].
fn sleep_while_running(shared: &Shared, duration: Duration) {
    let deadline = Instant::now() + duration;
    while shared.running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(ACCEPT_POLL_INTERVAL));
    }
}

#[cfg(test)]
mod tests {
    use std::io::{ErrorKind, Read};

    use super::*;

    const CLIENT_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn test_config(interval_ms: u64) -> BroadcastConfig {
        BroadcastConfig {
            bind_address: "127.0.0.1".into(),
            port: 0,
            interval_ms,
            handshake_timeout_ms: 2000,
        }
    }

    fn constant(payload: &'static str) -> PayloadProvider {
        Arc::new(move || payload.to_string())
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn connect(addr: SocketAddr) -> (TcpStream, String) {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write!(
            stream,
            "GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: {CLIENT_KEY}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        )
        .unwrap();

        let mut response = Vec::new();
        let mut byte = [0_u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            response.push(byte[0]);
        }
        (stream, String::from_utf8(response).unwrap())
    }

    fn read_frame(stream: &mut TcpStream) -> String {
        let mut header = [0_u8; 2];
        stream.read_exact(&mut header).unwrap();
        assert_eq!(header[0], 0x81);
        assert_eq!(header[1] & 0x80, 0, "server frames must not be masked");

        let len = match header[1] {
            126 => {
                let mut ext = [0_u8; 2];
                stream.read_exact(&mut ext).unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0_u8; 8];
                stream.read_exact(&mut ext).unwrap();
                u64::from_be_bytes(ext) as usize
            }
            short => short as usize,
        };

        let mut payload = vec![0_u8; len];
        stream.read_exact(&mut payload).unwrap();
        String::from_utf8(payload).unwrap()
    }

    fn reaches_eof(stream: &mut TcpStream) -> bool {
        let mut buf = [0_u8; 256];
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::ConnectionReset => return true,
                Err(_) => return false,
            }
        }
        false
    }

    #[test]
    fn client_closes_exactly_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _remote = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();

        let client = Client::new(7, stream, peer);
        assert_eq!(client.state(), ConnectionState::Connecting);
        assert!(client.close());
        assert!(!client.close());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(client.send(b"late").is_err());
    }

    #[test]
    fn handshake_returns_accept_token_and_frames() {
        let server = BroadcastServer::new(test_config(10));
        let addr = server.start(constant("hello")).unwrap();

        let (mut stream, response) = connect(addr);
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert_eq!(read_frame(&mut stream), "hello");
        assert_eq!(read_frame(&mut stream), "hello");

        server.stop();
    }

    #[test]
    fn request_without_key_is_dropped_silently() {
        let server = BroadcastServer::new(test_config(10));
        let addr = server.start(constant("x")).unwrap();

        let mut bad = TcpStream::connect(addr).unwrap();
        bad.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        bad.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        assert!(reaches_eof(&mut bad));
        assert_eq!(server.client_count(), 0);

        // The accept loop keeps serving after a failed handshake.
        let (mut good, _) = connect(addr);
        assert_eq!(read_frame(&mut good), "x");
        assert!(server.is_running());
    }

    #[test]
    fn disconnected_client_is_pruned_without_affecting_others() {
        let server = BroadcastServer::new(test_config(10));
        let addr = server.start(constant("tick")).unwrap();

        let (mut leaving, _) = connect(addr);
        let (mut staying, _) = connect(addr);
        assert!(wait_until(|| server.client_count() == 2));
        assert_eq!(read_frame(&mut leaving), "tick");

        drop(leaving);
        assert!(wait_until(|| server.client_count() == 1));

        for _ in 0..3 {
            assert_eq!(read_frame(&mut staying), "tick");
        }
        server.stop();
    }

    #[test]
    fn stop_is_idempotent_and_closes_clients() {
        let server = BroadcastServer::new(test_config(10));
        server.stop();
        assert!(!server.is_running());

        let addr = server.start(constant("bye")).unwrap();
        assert_eq!(server.start(constant("ignored")).unwrap(), addr);

        let (mut stream, _) = connect(addr);
        assert!(wait_until(|| server.client_count() == 1));

        server.stop();
        server.stop();
        assert!(!server.is_running());
        assert_eq!(server.client_count(), 0);
        assert!(reaches_eof(&mut stream));
    }

    #[test]
    fn manual_broadcast_reaches_clients() {
        let server = BroadcastServer::new(test_config(60_000));
        let addr = server.start(constant("scheduled")).unwrap();

        let (mut stream, _) = connect(addr);
        assert!(wait_until(|| server.client_count() == 1));
        let long = "z".repeat(300);
        assert_eq!(server.broadcast(&long), 1);

        let mut frames = vec![read_frame(&mut stream)];
        if frames[0] == "scheduled" {
            frames.push(read_frame(&mut stream));
        }
        assert_eq!(frames.last().unwrap(), &long);
    }

    #[test]
    fn concurrent_senders_never_interleave_frames() {
        const LARGE: usize = 1 << 20;
        const MANUAL_FRAMES: usize = 3;

        let server = Arc::new(BroadcastServer::new(test_config(10)));
        let scheduled: PayloadProvider = Arc::new(|| "A".repeat(LARGE));
        let addr = server.start(scheduled).unwrap();

        let (mut stream, _) = connect(addr);
        assert!(wait_until(|| server.client_count() == 1));

        let sender = {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                let manual = "B".repeat(LARGE);
                for _ in 0..MANUAL_FRAMES {
                    server.broadcast(&manual);
                }
            })
        };

        let mut manual_seen = 0;
        for index in 0..200 {
            let payload = read_frame(&mut stream);
            assert_eq!(payload.len(), LARGE, "frame {index}");
            let first = payload.as_bytes()[0];
            assert!(
                payload.bytes().all(|byte| byte == first),
                "frame {index} mixes payloads"
            );
            if first == b'B' {
                manual_seen += 1;
                if manual_seen == MANUAL_FRAMES {
                    break;
                }
            }
        }
        assert_eq!(manual_seen, MANUAL_FRAMES);

        drop(stream);
        sender.join().unwrap();
        server.stop();
    }
}
