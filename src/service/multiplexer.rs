//! Non-blocking connection set driven by zero-timeout `poll(2)`.
//!
//! The multiplexer exclusively owns every accepted connection. A connection
//! leaves the set in exactly one place ([`Multiplexer::close`]), either when
//! polling reports an error or hangup, or when a failed read or write has
//! marked it for removal and the server retires it.

use std::collections::BTreeMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use tracing::{debug, info};

/// Identifier assigned to each accepted connection.
pub type ConnectionId = u64;

/// Decoded `revents` flags of one descriptor.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub priority: bool,
    pub error: bool,
    pub hangup: bool,
    pub invalid: bool,
}

impl Readiness {
    /// Decode raw `poll(2)` result flags.
    pub fn from_revents(revents: libc::c_short) -> Self {
        Self {
            readable: revents & libc::POLLIN != 0,
            writable: revents & libc::POLLOUT != 0,
            priority: revents & libc::POLLPRI != 0,
            error: revents & libc::POLLERR != 0,
            hangup: revents & libc::POLLHUP != 0,
            invalid: revents & libc::POLLNVAL != 0,
        }
    }
}

/// What the server should do with a polled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollClass {
    /// Data can be read.
    Readable,
    /// The connection is broken and must be closed.
    Failed,
    /// Nothing to do this cycle.
    Idle,
}

/// Classify readiness flags; failure flags take precedence over input.
pub fn classify(readiness: Readiness) -> PollClass {
    if readiness.error || readiness.hangup || readiness.invalid {
        PollClass::Failed
    } else if readiness.readable || readiness.priority {
        PollClass::Readable
    } else {
        PollClass::Idle
    }
}

/// Result of reading from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Bytes received.
    Data(Vec<u8>),
    /// No data available right now.
    WouldBlock,
    /// Orderly EOF or I/O failure; the connection awaits retirement.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Active,
    PendingRemoval,
}

struct Connection {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    state: ConnectionState,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    /// Connections accepted.
    pub accepted: u64,
    /// Connections closed.
    pub closed: u64,
}

/// Owner of the listening socket and the live connection set.
pub struct Multiplexer {
    listener: TcpListener,
    connections: BTreeMap<ConnectionId, Connection>,
    next_id: ConnectionId,
    stats: MultiplexerStats,
}

impl Multiplexer {
    /// Take ownership of a bound listener and switch it to non-blocking mode.
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            connections: BTreeMap::new(),
            next_id: 1,
            stats: MultiplexerStats::default(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of connections in the set, including ones awaiting retirement.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are open.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Whether `id` is still in the set.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Lifetime counters.
    pub fn stats(&self) -> MultiplexerStats {
        self.stats
    }

    /// Accept at most one pending connection without blocking.
    pub fn accept_if_ready(&mut self) -> io::Result<Option<ConnectionId>> {
        let ready = poll_fds(&mut [pollfd(self.listener.as_raw_fd())])?;
        if ready == 0 {
            return Ok(None);
        }
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        stream.set_nonblocking(true)?;
        let id = self.next_id;
        self.next_id += 1;
        self.connections.insert(
            id,
            Connection {
                stream,
                peer: Some(peer),
                state: ConnectionState::Active,
            },
        );
        self.stats.accepted += 1;
        info!(connection = id, %peer, "accepted connection");
        Ok(Some(id))
    }

    /// Poll active connections once, closing broken ones and returning the
    /// ids that have input.
    pub fn poll_readable(&mut self) -> io::Result<Vec<ConnectionId>> {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.state == ConnectionState::Active)
            .map(|(id, _)| *id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut fds: Vec<libc::pollfd> = ids
            .iter()
            .filter_map(|id| self.connections.get(id))
            .map(|connection| pollfd(connection.stream.as_raw_fd()))
            .collect();
        if poll_fds(&mut fds)? == 0 {
            return Ok(Vec::new());
        }

        let mut readable = Vec::new();
        for (id, fd) in ids.into_iter().zip(&fds) {
            match classify(Readiness::from_revents(fd.revents)) {
                PollClass::Readable => readable.push(id),
                PollClass::Failed => {
                    debug!(connection = id, revents = fd.revents, "connection failed during poll");
                    self.close(id);
                }
                PollClass::Idle => {}
            }
        }
        Ok(readable)
    }

    /// Read up to `max` bytes from a connection.
    pub fn recv(&mut self, id: ConnectionId, max: usize) -> RecvOutcome {
        let Some(connection) = self.connections.get_mut(&id) else {
            return RecvOutcome::Closed;
        };
        let mut buffer = vec![0u8; max];
        match connection.stream.read(&mut buffer) {
            Ok(0) => {
                debug!(connection = id, "peer closed connection");
                connection.state = ConnectionState::PendingRemoval;
                RecvOutcome::Closed
            }
            Ok(n) => {
                buffer.truncate(n);
                RecvOutcome::Data(buffer)
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                RecvOutcome::WouldBlock
            }
            Err(err) => {
                debug!(connection = id, error = %err, "read failed");
                connection.state = ConnectionState::PendingRemoval;
                RecvOutcome::Closed
            }
        }
    }

    /// Write all of `bytes` to a connection.
    ///
    /// The socket is blocking for the duration of the write so large
    /// responses are delivered whole.
    pub fn send(&mut self, id: ConnectionId, bytes: &[u8]) -> io::Result<()> {
        let Some(connection) = self.connections.get_mut(&id) else {
            return Err(io::Error::new(ErrorKind::NotConnected, "unknown connection"));
        };
        let written = write_blocking(&mut connection.stream, bytes);
        if let Err(err) = &written {
            debug!(connection = id, error = %err, "write failed");
            connection.state = ConnectionState::PendingRemoval;
        }
        written
    }

    /// Close a connection previously marked for removal by `recv` or `send`.
    pub fn retire(&mut self, id: ConnectionId) -> bool {
        match self.connections.get(&id) {
            Some(connection) if connection.state == ConnectionState::PendingRemoval => {
                self.close(id);
                true
            }
            _ => false,
        }
    }

    /// Close every connection.
    pub fn close_all(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
    }

    fn close(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.remove(&id) {
            let _ = connection.stream.shutdown(Shutdown::Both);
            self.stats.closed += 1;
            debug!(connection = id, peer = ?connection.peer, "closed connection");
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn write_blocking(stream: &mut TcpStream, bytes: &[u8]) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let written = stream.write_all(bytes).and_then(|()| stream.flush());
    stream.set_nonblocking(true)?;
    written
}

fn pollfd(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN | libc::POLLPRI,
        revents: 0,
    }
}

/// Zero-timeout poll; an interrupted call counts as nothing ready.
fn poll_fds(fds: &mut [libc::pollfd]) -> io::Result<usize> {
    // SAFETY: `fds` is a valid, exclusively borrowed slice of `pollfd` for the
    // duration of the call, and its length is passed alongside.
    let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0) };
    if ready < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(ready as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn multiplexer() -> Multiplexer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        Multiplexer::new(listener).expect("multiplexer")
    }

    fn accept_within(mux: &mut Multiplexer, timeout: Duration) -> ConnectionId {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(id) = mux.accept_if_ready().expect("accept") {
                return id;
            }
            assert!(Instant::now() < deadline, "no connection accepted");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn readable_within(mux: &mut Multiplexer, timeout: Duration) -> Vec<ConnectionId> {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = mux.poll_readable().expect("poll");
            if !ready.is_empty() || Instant::now() >= deadline {
                return ready;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn classify_prefers_failure_flags() {
        let hangup = Readiness {
            readable: true,
            hangup: true,
            ..Readiness::default()
        };
        assert_eq!(classify(hangup), PollClass::Failed);
        assert_eq!(
            classify(Readiness::from_revents(libc::POLLNVAL)),
            PollClass::Failed
        );
        assert_eq!(
            classify(Readiness::from_revents(libc::POLLIN)),
            PollClass::Readable
        );
        assert_eq!(
            classify(Readiness::from_revents(libc::POLLOUT)),
            PollClass::Idle
        );
    }

    #[test]
    fn empty_set_polls_nothing() {
        let mut mux = multiplexer();
        assert!(mux.poll_readable().expect("poll").is_empty());
        assert_eq!(mux.accept_if_ready().expect("accept"), None);
    }

    #[test]
    fn reads_data_from_accepted_connection() {
        let mut mux = multiplexer();
        let mut client = TcpStream::connect(mux.local_addr().expect("addr")).expect("connect");
        let id = accept_within(&mut mux, Duration::from_secs(2));
        client.write_all(b"5:1:return 1\n").expect("write");

        assert_eq!(readable_within(&mut mux, Duration::from_secs(2)), vec![id]);
        assert_eq!(mux.recv(id, 1024), RecvOutcome::Data(b"5:1:return 1\n".to_vec()));
        mux.send(id, b"ok\n").expect("send");

        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).expect("read reply");
        assert_eq!(&reply, b"ok\n");
    }

    #[test]
    fn hangup_closes_connection_exactly_once() {
        let mut mux = multiplexer();
        let client = TcpStream::connect(mux.local_addr().expect("addr")).expect("connect");
        let id = accept_within(&mut mux, Duration::from_secs(2));
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(2);
        while mux.contains(id) && Instant::now() < deadline {
            for ready in mux.poll_readable().expect("poll") {
                if mux.recv(ready, 64) == RecvOutcome::Closed {
                    assert!(mux.retire(ready));
                }
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert!(!mux.contains(id));
        assert_eq!(mux.stats().closed, 1);
        assert!(mux.poll_readable().expect("poll").is_empty());
        assert!(!mux.retire(id));
        assert_eq!(mux.stats().closed, 1);
    }

    /// Make closing `stream` send a reset instead of an orderly FIN.
    fn reset_on_close(stream: &TcpStream) {
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        // SAFETY: `linger` outlives the call and its size is passed alongside.
        let rc = unsafe {
            libc::setsockopt(
                stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                (&linger as *const libc::linger).cast(),
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0, "setsockopt(SO_LINGER)");
    }

    #[test]
    fn reset_peer_is_closed_during_poll() {
        let mut mux = multiplexer();
        let client = TcpStream::connect(mux.local_addr().expect("addr")).expect("connect");
        let id = accept_within(&mut mux, Duration::from_secs(2));
        reset_on_close(&client);
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(2);
        while mux.contains(id) && Instant::now() < deadline {
            let ready = mux.poll_readable().expect("poll");
            assert!(!ready.contains(&id), "reset connection surfaced as readable");
            thread::sleep(Duration::from_millis(5));
        }

        assert!(!mux.contains(id));
        assert_eq!(mux.stats().closed, 1);
        for _ in 0..3 {
            assert!(mux.poll_readable().expect("poll").is_empty());
        }
        assert!(!mux.retire(id));
        assert_eq!(mux.stats().closed, 1);
    }

    #[test]
    fn retire_ignores_active_connections() {
        let mut mux = multiplexer();
        let _client = TcpStream::connect(mux.local_addr().expect("addr")).expect("connect");
        let id = accept_within(&mut mux, Duration::from_secs(2));
        assert!(!mux.retire(id));
        assert!(mux.contains(id));
        mux.close_all();
        assert!(mux.is_empty());
        assert_eq!(mux.stats(), MultiplexerStats { accepted: 1, closed: 1 });
    }
}
