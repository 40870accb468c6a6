use crate::connection::{Connection, ConnectionState};
use bytes::{Bytes, BytesMut};
use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};
use tokio::{
    io::{split, AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf},
    select,
    sync::{mpsc, Notify},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// One end of a bridged pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Connection accepted from the client.
    Inbound,
    /// Connection opened towards the upstream service.
    Upstream,
}

impl Side {
    pub fn peer(self) -> Self {
        match self {
            Side::Inbound => Side::Upstream,
            Side::Upstream => Side::Inbound,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Inbound => write!(f, "inbound"),
            Side::Upstream => write!(f, "upstream"),
        }
    }
}

/// Why a session ended. This is the expected end of life of a bridge, not
/// a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Closed(Side),
    Error(Side, io::ErrorKind),
    Timeout,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub buffer_size: usize,
    /// Ends the session when no data moved in either direction for this long.
    pub idle_timeout: Option<Duration>,
    /// How long teardown waits for data already read to reach the other side
    /// before both connections are released anyway.
    pub close_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// Shared state of a bridged pair, used by both directions.
///
/// Each direction is a reader that never stops draining its source and a
/// writer fed through an unbounded queue. A peer that stops reading therefore
/// never hides a close or an error on the other side.
#[derive(Debug)]
pub struct BridgeSession<A, B> {
    inbound: Connection<WriteHalf<A>>,
    upstream: Connection<WriteHalf<B>>,
    torn_down: AtomicBool,
    event: OnceLock<TerminalEvent>,
    reading: CancellationToken,
    writing: CancellationToken,
    activity: Notify,
    /// Chunks read but not yet written, across both directions.
    queued: AtomicUsize,
    flushed: Notify,
    close_grace: Duration,
}

impl<A, B> BridgeSession<A, B>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    fn new(inbound: WriteHalf<A>, upstream: WriteHalf<B>, close_grace: Duration) -> Self {
        Self {
            inbound: Connection::new(inbound),
            upstream: Connection::new(upstream),
            torn_down: AtomicBool::new(false),
            event: OnceLock::new(),
            reading: CancellationToken::new(),
            writing: CancellationToken::new(),
            activity: Notify::new(),
            queued: AtomicUsize::new(0),
            flushed: Notify::new(),
            close_grace,
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// The event that triggered teardown, if any.
    pub fn terminal_event(&self) -> Option<TerminalEvent> {
        self.event.get().cloned()
    }

    pub fn connection_state(&self, side: Side) -> ConnectionState {
        match side {
            Side::Inbound => self.inbound.state(),
            Side::Upstream => self.upstream.state(),
        }
    }

    /// Stops both directions and closes both connections.
    ///
    /// Only the first call tears the pair down and records `event`; it
    /// returns `true`. Every later call is a no-op returning `false`.
    ///
    /// Reading stops at once. Chunks already read get up to the close grace
    /// to be written out, then both connections are shut down and released
    /// whether or not they were.
    pub async fn teardown(&self, event: TerminalEvent) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            trace!(?event, "bridge already torn down");
            return false;
        }

        debug!(?event, "tearing down bridge");

        let _ = self.event.set(event);

        self.reading.cancel();

        if time::timeout(self.close_grace, self.flush()).await.is_err() {
            trace!(
                queued = self.queued.load(Ordering::Acquire),
                "dropping unflushed chunks"
            );
        }

        // Writers must drop their pending writes before the closes can take
        // the write halves.
        self.writing.cancel();

        futures::future::join(self.inbound.close(), self.upstream.close()).await;

        true
    }

    async fn flush(&self) {
        while self.queued.load(Ordering::Acquire) > 0 {
            self.flushed.notified().await;
        }
    }

    fn settle(&self, chunks: usize) {
        if chunks > 0 && self.queued.fetch_sub(chunks, Ordering::AcqRel) == chunks {
            self.flushed.notify_one();
        }
    }

    async fn forward(&self, to: Side, chunk: &[u8]) -> io::Result<()> {
        match to {
            Side::Inbound => self.inbound.write(chunk).await,
            Side::Upstream => self.upstream.write(chunk).await,
        }
    }

    async fn read_from<R>(
        &self,
        mut read: ReadHalf<R>,
        from: Side,
        queue: mpsc::UnboundedSender<Bytes>,
        buffer_size: usize,
    ) where
        R: AsyncRead,
    {
        let buffer_size = buffer_size.max(1);
        let mut buf = BytesMut::with_capacity(buffer_size);

        loop {
            buf.reserve(buffer_size);

            let received = select! {
                biased;
                _ = self.reading.cancelled() => return,
                received = read.read_buf(&mut buf) => received,
            };

            match received {
                Ok(0) => {
                    self.teardown(TerminalEvent::Closed(from)).await;
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    self.teardown(TerminalEvent::Error(from, err.kind())).await;
                    return;
                }
            }

            self.activity.notify_one();

            #[cfg(debug_assertions)]
            trace!("{from} --> {} {} bytes", from.peer(), buf.len());

            self.queued.fetch_add(1, Ordering::AcqRel);

            if queue.send(buf.split().freeze()).is_err() {
                // The writer gave up on a broken destination
                self.settle(1);
                return;
            }
        }
    }

    async fn write_to(&self, mut queue: mpsc::UnboundedReceiver<Bytes>, to: Side) {
        loop {
            let chunk = select! {
                biased;
                _ = self.writing.cancelled() => return,
                chunk = queue.recv() => chunk,
            };

            let Some(chunk) = chunk else {
                return;
            };

            let written = select! {
                biased;
                _ = self.writing.cancelled() => return,
                written = self.forward(to, &chunk) => written,
            };

            self.settle(1);

            if let Err(err) = written {
                queue.close();

                let mut discarded = 0;
                while queue.try_recv().is_ok() {
                    discarded += 1;
                }
                self.settle(discarded);

                self.teardown(TerminalEvent::Error(to, err.kind())).await;
                return;
            }
        }
    }

    async fn watch_idle(&self, idle_timeout: Duration) {
        loop {
            select! {
                _ = self.reading.cancelled() => return,
                active = time::timeout(idle_timeout, self.activity.notified()) => {
                    if active.is_err() {
                        self.teardown(TerminalEvent::Timeout).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Relays bytes between an inbound connection and its upstream connection.
pub struct Bridge<A, B> {
    session: Arc<BridgeSession<A, B>>,
    inbound: ReadHalf<A>,
    upstream: ReadHalf<B>,
    config: BridgeConfig,
}

impl<A, B> Bridge<A, B>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    pub fn new(inbound: A, upstream: B) -> Self {
        Self::with_config(inbound, upstream, BridgeConfig::default())
    }

    pub fn with_config(inbound: A, upstream: B, config: BridgeConfig) -> Self {
        let (inbound_read, inbound_write) = split(inbound);
        let (upstream_read, upstream_write) = split(upstream);

        Self {
            session: Arc::new(BridgeSession::new(
                inbound_write,
                upstream_write,
                config.close_grace,
            )),
            inbound: inbound_read,
            upstream: upstream_read,
            config,
        }
    }

    pub fn session(&self) -> Arc<BridgeSession<A, B>> {
        Arc::clone(&self.session)
    }

    /// Relays in both directions until either side terminates, then returns
    /// the event that ended the session. Both connections are released by
    /// the time this returns.
    pub async fn run(self) -> TerminalEvent {
        let Self {
            session,
            inbound,
            upstream,
            config,
        } = self;

        let (to_upstream, for_upstream) = mpsc::unbounded_channel();
        let (to_inbound, for_inbound) = mpsc::unbounded_channel();

        let idle = async {
            if let Some(idle_timeout) = config.idle_timeout {
                session.watch_idle(idle_timeout).await;
            }
        };

        tokio::join!(
            session.read_from(inbound, Side::Inbound, to_upstream, config.buffer_size),
            session.write_to(for_upstream, Side::Upstream),
            session.read_from(upstream, Side::Upstream, to_inbound, config.buffer_size),
            session.write_to(for_inbound, Side::Inbound),
            idle,
        );

        // Readers only stop once teardown has recorded an event
        session
            .terminal_event()
            .unwrap_or(TerminalEvent::Closed(Side::Inbound))
    }
}
