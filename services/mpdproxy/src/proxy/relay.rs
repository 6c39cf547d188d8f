//! Relay pairs: the per-connection copy workers and their teardown.
//!
//! Each proxied connection runs two workers, one per direction:
//!
//! ```text
//!            client worker (reads client)
//! client  ---------------------------------->  upstream
//!         <----------------------------------
//!            upstream worker (reads upstream)
//! ```
//!
//! A worker copies until its read side reports EOF or an error, a write
//! fails, the optional idle timeout fires, or it is cancelled. It then runs
//! the teardown:
//!
//! 1. shut down the socket it reads from,
//! 2. record its side in the connection's hang-up flag with a single
//!    compare-and-swap,
//! 3. if it won the swap, cancel the peer, wait for the peer to stop and
//!    release the connection,
//! 4. if it lost, the peer is already doing step 3, so nothing else,
//! 5. leave the worker registry.
//!
//! The compare-and-swap makes "who releases" a single atomic decision, so
//! the connection is released exactly once even when both directions end at
//! the same moment.

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::DropGuard;
use tracing::{debug, error, info_span, Instrument};

use super::registry::{WorkerHandle, WorkerId, WorkerRegistry};

/// Default read chunk size.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Relay tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Maximum bytes moved per read.
    pub buffer_size: usize,
    /// Stop a worker whose read has waited this long. None disables.
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
        }
    }
}

/// One end of a proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Upstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Upstream => write!(f, "upstream"),
        }
    }
}

/// Copy direction of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    /// The side this direction reads from; its worker owns closing it.
    pub fn source(&self) -> Side {
        match self {
            Direction::ClientToUpstream => Side::Client,
            Direction::UpstreamToClient => Side::Upstream,
        }
    }

    pub fn reverse(&self) -> Direction {
        match self {
            Direction::ClientToUpstream => Direction::UpstreamToClient,
            Direction::UpstreamToClient => Direction::ClientToUpstream,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => write!(f, "client->upstream"),
            Direction::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Which side of a connection hung up first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangUp {
    /// Both workers are still copying.
    Running,
    /// The client worker finished first.
    Client,
    /// The upstream worker finished first.
    Upstream,
}

/// Tri-state hang-up flag shared by the two workers of one connection.
#[derive(Debug)]
pub struct HangUpFlag(AtomicU8);

impl HangUpFlag {
    const RUNNING: u8 = 0;
    const CLIENT: u8 = 1;
    const UPSTREAM: u8 = 2;

    pub fn new() -> Self {
        Self(AtomicU8::new(Self::RUNNING))
    }

    pub fn get(&self) -> HangUp {
        Self::decode(self.0.load(Ordering::Acquire))
    }

    /// Record that `side` has finished.
    ///
    /// Returns `Ok(())` for the first caller. Every later caller gets
    /// `Err` with whatever was recorded first.
    pub fn claim(&self, side: Side) -> Result<(), HangUp> {
        let mine = match side {
            Side::Client => Self::CLIENT,
            Side::Upstream => Self::UPSTREAM,
        };
        self.0
            .compare_exchange(Self::RUNNING, mine, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Self::decode)
    }

    fn decode(raw: u8) -> HangUp {
        match raw {
            Self::CLIENT => HangUp::Client,
            Self::UPSTREAM => HangUp::Upstream,
            _ => HangUp::Running,
        }
    }
}

impl Default for HangUpFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a worker's copy loop ended.
#[derive(Debug)]
pub enum StopReason {
    /// The read side returned 0 bytes.
    Eof,
    ReadError(io::Error),
    WriteError(io::Error),
    IdleTimeout,
    /// The peer's teardown or the shutdown sweep cancelled the worker.
    Cancelled,
}

impl StopReason {
    pub fn kind(&self) -> StopKind {
        match self {
            StopReason::Eof => StopKind::Eof,
            StopReason::ReadError(_) => StopKind::ReadError,
            StopReason::WriteError(_) => StopKind::WriteError,
            StopReason::IdleTimeout => StopKind::IdleTimeout,
            StopReason::Cancelled => StopKind::Cancelled,
        }
    }

    pub fn errno(&self) -> Option<i32> {
        match self {
            StopReason::ReadError(e) | StopReason::WriteError(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Data-free form of [`StopReason`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Eof,
    ReadError,
    WriteError,
    IdleTimeout,
    Cancelled,
}

impl fmt::Display for StopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopKind::Eof => "eof",
            StopKind::ReadError => "read_error",
            StopKind::WriteError => "write_error",
            StopKind::IdleTimeout => "idle_timeout",
            StopKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a worker's teardown ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// First to finish: cancelled and joined the peer, released the connection.
    ReleasedConnection,
    /// Second to finish: the peer had already taken over the release.
    PeerReleased,
}

/// Final report of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub worker: WorkerId,
    pub direction: Direction,
    pub stop: StopKind,
    pub teardown: Teardown,
    /// Bytes this worker forwarded.
    pub bytes: u64,
}

/// Counters shared by every relay pair of a proxy.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Relay pairs spawned.
    pub pairs_started: AtomicU64,
    /// Relay pairs whose connection has not been released yet.
    pub pairs_active: AtomicU64,
    /// Connections released by a teardown.
    pub pairs_released: AtomicU64,
    /// Bytes forwarded client -> upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes forwarded upstream -> client.
    pub bytes_to_client: AtomicU64,
}

/// Process-unique identity of a proxied connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c-{}", self.0)
    }
}

/// State shared by the two workers of one connection.
///
/// The sockets themselves are not in here: each worker owns the read half of
/// its source socket and the write half of the other one.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    client_addr: SocketAddr,
    upstream_addr: SocketAddr,
    client_worker: WorkerHandle,
    upstream_worker: WorkerHandle,
    hang_up: HangUpFlag,
    released: AtomicBool,
    bytes_to_upstream: AtomicU64,
    bytes_to_client: AtomicU64,
    stats: Arc<RelayStats>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream_addr
    }

    /// Which side finished first, if any.
    pub fn hang_up(&self) -> HangUp {
        self.hang_up.get()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Bytes forwarded in `direction` so far.
    pub fn bytes(&self, direction: Direction) -> u64 {
        match direction {
            Direction::ClientToUpstream => self.bytes_to_upstream.load(Ordering::Relaxed),
            Direction::UpstreamToClient => self.bytes_to_client.load(Ordering::Relaxed),
        }
    }

    fn worker(&self, direction: Direction) -> &WorkerHandle {
        match direction {
            Direction::ClientToUpstream => &self.client_worker,
            Direction::UpstreamToClient => &self.upstream_worker,
        }
    }

    fn record(&self, direction: Direction, n: usize) {
        let n = n as u64;
        match direction {
            Direction::ClientToUpstream => {
                self.bytes_to_upstream.fetch_add(n, Ordering::Relaxed);
                self.stats.bytes_to_upstream.fetch_add(n, Ordering::Relaxed);
            }
            Direction::UpstreamToClient => {
                self.bytes_to_client.fetch_add(n, Ordering::Relaxed);
                self.stats.bytes_to_client.fetch_add(n, Ordering::Relaxed);
            }
        }
    }

    /// Release the connection. Only the teardown that won the hang-up swap
    /// calls this.
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            error!(
                component = "relay",
                conn = %self.id,
                "Connection released twice"
            );
            return;
        }

        self.stats.pairs_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.pairs_released.fetch_add(1, Ordering::Relaxed);

        debug!(
            conn = %self.id,
            client_addr = %self.client_addr,
            upstream_addr = %self.upstream_addr,
            bytes_to_upstream = self.bytes(Direction::ClientToUpstream),
            bytes_to_client = self.bytes(Direction::UpstreamToClient),
            "Connection closed"
        );
    }
}

/// A spawned relay pair.
#[derive(Debug)]
pub struct RelayPair {
    connection: Arc<Connection>,
    client_task: JoinHandle<WorkerOutcome>,
    upstream_task: JoinHandle<WorkerOutcome>,
}

impl RelayPair {
    /// Start both workers for an accepted client and its upstream leg.
    ///
    /// Must be called from within a tokio runtime. Fails only if either
    /// socket has already lost its peer address.
    pub fn spawn(
        client: TcpStream,
        upstream: TcpStream,
        registry: Arc<WorkerRegistry>,
        stats: Arc<RelayStats>,
        config: RelayConfig,
    ) -> io::Result<Self> {
        let client_addr = client.peer_addr()?;
        let upstream_addr = upstream.peer_addr()?;

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();

        let connection = Arc::new(Connection {
            id: ConnectionId::next(),
            client_addr,
            upstream_addr,
            client_worker: WorkerHandle::new(),
            upstream_worker: WorkerHandle::new(),
            hang_up: HangUpFlag::new(),
            released: AtomicBool::new(false),
            bytes_to_upstream: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            stats: Arc::clone(&stats),
        });

        stats.pairs_started.fetch_add(1, Ordering::Relaxed);
        stats.pairs_active.fetch_add(1, Ordering::Relaxed);

        let span = info_span!(
            "relay",
            conn = %connection.id,
            client = %client_addr,
            upstream = %upstream_addr
        );

        let client_worker = Worker {
            direction: Direction::ClientToUpstream,
            reader: client_read,
            writer: upstream_write,
            connection: Arc::clone(&connection),
            registry: Arc::clone(&registry),
            config: config.clone(),
        };
        let upstream_worker = Worker {
            direction: Direction::UpstreamToClient,
            reader: upstream_read,
            writer: client_write,
            connection: Arc::clone(&connection),
            registry,
            config,
        };

        let client_stopped = connection.client_worker.stop_guard();
        let upstream_stopped = connection.upstream_worker.stop_guard();
        let client_task =
            tokio::spawn(client_worker.run(client_stopped).instrument(span.clone()));
        let upstream_task = tokio::spawn(upstream_worker.run(upstream_stopped).instrument(span));

        Ok(Self {
            connection,
            client_task,
            upstream_task,
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Handle of the worker reading from the client.
    pub fn client_worker(&self) -> &WorkerHandle {
        &self.connection.client_worker
    }

    /// Handle of the worker reading from the upstream.
    pub fn upstream_worker(&self) -> &WorkerHandle {
        &self.connection.upstream_worker
    }

    /// Wait for both workers and return their outcomes, client worker first.
    pub async fn join(self) -> Result<[WorkerOutcome; 2], JoinError> {
        let client = self.client_task.await?;
        let upstream = self.upstream_task.await?;
        Ok([client, upstream])
    }
}

/// One direction of a relay pair.
struct Worker {
    direction: Direction,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    connection: Arc<Connection>,
    registry: Arc<WorkerRegistry>,
    config: RelayConfig,
}

impl Worker {
    fn handle(&self) -> &WorkerHandle {
        self.connection.worker(self.direction)
    }

    fn peer(&self) -> &WorkerHandle {
        self.connection.worker(self.direction.reverse())
    }

    /// `_stopped` is created before the spawn so that dropping the future,
    /// polled or not, marks the worker stopped.
    async fn run(mut self, _stopped: DropGuard) -> WorkerOutcome {
        let handle = self.handle().clone();
        let direction = self.direction;

        if self.registry.register(&handle).is_err() {
            debug!(worker = %handle.id(), "Registry closed, worker cancelled before start");
            handle.cancel();
        }

        let (reason, bytes) = self.copy(&handle).await;
        self.log_stop(&handle, &reason);

        let teardown = self.teardown(&handle).await;

        WorkerOutcome {
            worker: handle.id(),
            direction,
            stop: reason.kind(),
            teardown,
            bytes,
        }
    }

    async fn copy(&mut self, handle: &WorkerHandle) -> (StopReason, u64) {
        let mut buf = vec![0u8; self.config.buffer_size.max(1)];
        let mut total = 0u64;

        loop {
            let read = tokio::select! {
                biased;
                _ = handle.cancelled() => return (StopReason::Cancelled, total),
                r = self.reader.read(&mut buf) => r,
                _ = idle(self.config.idle_timeout) => return (StopReason::IdleTimeout, total),
            };

            let n = match read {
                Ok(0) => return (StopReason::Eof, total),
                Ok(n) => n,
                Err(e) => return (StopReason::ReadError(e), total),
            };

            let write = tokio::select! {
                biased;
                _ = handle.cancelled() => return (StopReason::Cancelled, total),
                r = self.writer.write_all(&buf[..n]) => r,
            };
            if let Err(e) = write {
                return (StopReason::WriteError(e), total);
            }

            total += n as u64;
            self.connection.record(self.direction, n);
        }
    }

    fn log_stop(&self, handle: &WorkerHandle, reason: &StopReason) {
        let worker = handle.id();
        let direction = self.direction;
        match reason {
            StopReason::Eof => {
                debug!(%worker, %direction, "Peer closed the connection")
            }
            StopReason::ReadError(e) => debug!(
                component = "relay",
                %worker,
                %direction,
                errno = reason.errno(),
                error = %e,
                "Read failed"
            ),
            StopReason::WriteError(e) => debug!(
                component = "relay",
                %worker,
                %direction,
                errno = reason.errno(),
                error = %e,
                "Write failed"
            ),
            StopReason::IdleTimeout => debug!(%worker, %direction, "Idle timeout"),
            StopReason::Cancelled => debug!(%worker, %direction, "Worker cancelled"),
        }
    }

    async fn teardown(self, handle: &WorkerHandle) -> Teardown {
        shutdown_socket(self.reader.as_ref());

        let teardown = match self.connection.hang_up.claim(self.direction.source()) {
            Ok(()) => {
                let peer = self.peer();
                peer.cancel();
                peer.join().await;
                self.connection.release();
                Teardown::ReleasedConnection
            }
            Err(first) => {
                debug!(worker = %handle.id(), first = ?first, "Peer already tearing down");
                Teardown::PeerReleased
            }
        };

        self.registry.unregister(handle.id());
        debug!(worker = %handle.id(), teardown = ?teardown, "Worker stopped");
        teardown
    }
}

/// Resolves after `timeout`, or never when there is none.
async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

/// Shut down both directions of a socket. Already-closed sockets are fine.
fn shutdown_socket(stream: &TcpStream) {
    if let Err(e) = SockRef::from(stream).shutdown(Shutdown::Both) {
        if e.kind() != io::ErrorKind::NotConnected {
            debug!(
                component = "relay",
                errno = e.raw_os_error(),
                error = %e,
                "Socket shutdown failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use tokio::net::TcpListener;

    /// Returns (remote end, proxy end) of a loopback connection.
    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    struct Fixture {
        client: TcpStream,
        upstream: TcpStream,
        pair: RelayPair,
        registry: Arc<WorkerRegistry>,
        stats: Arc<RelayStats>,
    }

    async fn fixture(config: RelayConfig) -> Fixture {
        let (client, proxy_client) = loopback_pair().await;
        let (proxy_upstream, upstream) = loopback_pair().await;
        let registry = Arc::new(WorkerRegistry::new());
        let stats = Arc::new(RelayStats::default());
        let pair = RelayPair::spawn(
            proxy_client,
            proxy_upstream,
            Arc::clone(&registry),
            Arc::clone(&stats),
            config,
        )
        .unwrap();
        Fixture {
            client,
            upstream,
            pair,
            registry,
            stats,
        }
    }

    #[test]
    fn test_hang_up_flag_first_claim_wins() {
        let flag = HangUpFlag::new();
        assert_eq!(flag.get(), HangUp::Running);
        assert_eq!(flag.claim(Side::Upstream), Ok(()));
        assert_eq!(flag.claim(Side::Client), Err(HangUp::Upstream));
        assert_eq!(flag.claim(Side::Upstream), Err(HangUp::Upstream));
        assert_eq!(flag.get(), HangUp::Upstream);
    }

    #[test]
    fn test_hang_up_flag_race_has_one_winner() {
        for _ in 0..200 {
            let flag = Arc::new(HangUpFlag::new());
            let barrier = Arc::new(Barrier::new(2));
            let threads: Vec<_> = [Side::Client, Side::Upstream]
                .into_iter()
                .map(|side| {
                    let flag = Arc::clone(&flag);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        flag.claim(side).is_ok()
                    })
                })
                .collect();
            let winners = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
        }
    }

    #[test]
    fn test_direction_source() {
        assert_eq!(Direction::ClientToUpstream.source(), Side::Client);
        assert_eq!(Direction::UpstreamToClient.source(), Side::Upstream);
        assert_eq!(
            Direction::ClientToUpstream.reverse(),
            Direction::UpstreamToClient
        );
    }

    #[tokio::test]
    async fn test_client_eof_tears_down_pair() {
        let mut f = fixture(RelayConfig::default()).await;

        f.client.write_all(b"status\n").await.unwrap();
        let mut buf = [0u8; 7];
        f.upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"status\n");

        drop(f.client);

        let [client, upstream] = tokio::time::timeout(Duration::from_secs(2), f.pair.join())
            .await
            .expect("pair should stop")
            .unwrap();

        assert_eq!(client.stop, StopKind::Eof);
        assert_eq!(client.teardown, Teardown::ReleasedConnection);
        assert_eq!(client.bytes, 7);
        assert_eq!(upstream.stop, StopKind::Cancelled);
        assert_eq!(upstream.teardown, Teardown::PeerReleased);

        assert!(f.registry.is_empty());
        assert_eq!(f.stats.pairs_released.load(Ordering::Relaxed), 1);
        assert_eq!(f.stats.pairs_active.load(Ordering::Relaxed), 0);

        // The upstream end sees the proxy close its leg.
        let n = tokio::time::timeout(Duration::from_secs(2), f.upstream.read(&mut buf))
            .await
            .expect("upstream should observe close")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_upstream_eof_tears_down_pair() {
        let mut f = fixture(RelayConfig::default()).await;

        f.upstream.write_all(b"OK MPD 0.1\n").await.unwrap();
        let mut buf = [0u8; 11];
        f.client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OK MPD 0.1\n");

        let connection = Arc::clone(f.pair.connection());
        drop(f.upstream);

        let [client, upstream] = tokio::time::timeout(Duration::from_secs(2), f.pair.join())
            .await
            .expect("pair should stop")
            .unwrap();

        assert_eq!(upstream.stop, StopKind::Eof);
        assert_eq!(upstream.teardown, Teardown::ReleasedConnection);
        assert_eq!(client.stop, StopKind::Cancelled);
        assert_eq!(client.teardown, Teardown::PeerReleased);
        assert_eq!(connection.hang_up(), HangUp::Upstream);
        assert!(connection.is_released());
        assert_eq!(connection.bytes(Direction::UpstreamToClient), 11);
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_simultaneous_cancel_releases_once() {
        for _ in 0..25 {
            let f = fixture(RelayConfig::default()).await;

            f.pair.client_worker().cancel();
            f.pair.upstream_worker().cancel();

            let outcomes = tokio::time::timeout(Duration::from_secs(2), f.pair.join())
                .await
                .expect("pair should stop")
                .unwrap();

            let released = outcomes
                .iter()
                .filter(|o| o.teardown == Teardown::ReleasedConnection)
                .count();
            assert_eq!(released, 1);
            assert!(outcomes.iter().all(|o| o.stop == StopKind::Cancelled));
            assert_eq!(f.stats.pairs_released.load(Ordering::Relaxed), 1);
            assert!(f.registry.is_empty());
        }
    }

    #[tokio::test]
    async fn test_idle_timeout_stops_pair() {
        let config = RelayConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..RelayConfig::default()
        };
        let f = fixture(config).await;

        let outcomes = tokio::time::timeout(Duration::from_secs(2), f.pair.join())
            .await
            .expect("idle pair should stop")
            .unwrap();

        assert!(outcomes.iter().any(|o| o.stop == StopKind::IdleTimeout));
        assert_eq!(f.stats.pairs_released.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_workers_register_while_running() {
        let f = fixture(RelayConfig::default()).await;
        let client_id = f.pair.client_worker().id();
        let upstream_id = f.pair.upstream_worker().id();

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.registry.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("both workers should register");

        assert!(f.registry.contains(client_id));
        assert!(f.registry.contains(upstream_id));

        assert_eq!(f.registry.cancel_all().await, 2);
        assert!(f.registry.is_empty());
        assert!(f.pair.connection().is_released());
    }

    #[tokio::test]
    async fn test_aborted_before_first_poll_still_joins() {
        let f = fixture(RelayConfig::default()).await;

        // Current-thread runtime: neither worker has run yet.
        f.pair.client_task.abort();
        f.pair.upstream_task.abort();

        tokio::time::timeout(Duration::from_secs(1), async {
            f.pair.client_worker().join().await;
            f.pair.upstream_worker().join().await;
        })
        .await
        .expect("join should complete for workers aborted before they ran");

        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_pair_spawned_after_sweep_cancels_itself() {
        let registry = Arc::new(WorkerRegistry::new());
        let stats = Arc::new(RelayStats::default());
        assert_eq!(registry.cancel_all().await, 0);

        let (_client, proxy_client) = loopback_pair().await;
        let (proxy_upstream, _upstream) = loopback_pair().await;
        let pair = RelayPair::spawn(
            proxy_client,
            proxy_upstream,
            Arc::clone(&registry),
            Arc::clone(&stats),
            RelayConfig::default(),
        )
        .unwrap();

        let outcomes = tokio::time::timeout(Duration::from_secs(2), pair.join())
            .await
            .expect("late pair should stop on its own")
            .unwrap();

        assert!(outcomes.iter().all(|o| o.stop == StopKind::Cancelled));
        let released = outcomes
            .iter()
            .filter(|o| o.teardown == Teardown::ReleasedConnection)
            .count();
        assert_eq!(released, 1);
        assert_eq!(stats.pairs_released.load(Ordering::Relaxed), 1);
        assert!(registry.is_empty());
    }
}
