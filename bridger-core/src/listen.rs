use crate::{
    bridge::{Bridge, BridgeConfig},
    restart::RestartPolicy,
};
use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    select,
    sync::{watch, Notify},
    task::JoinHandle,
    time,
};
use tokio_stream::{wrappers::TcpListenerStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Fixed destination every inbound connection is relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Makes exactly one connection attempt.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<TcpStream, ConnectError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));

        let stream = match timeout {
            Some(timeout) => time::timeout(timeout, connect)
                .await
                .map_err(|_| ConnectError::Timeout(timeout))??,
            None => connect.await?,
        };

        Ok(stream)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub listen_host: IpAddr,
    pub listen_port: u16,
    pub upstream: Upstream,
    pub restart: RestartPolicy,
    pub bridge: BridgeConfig,
    pub connect_timeout: Option<Duration>,
}

impl ListenerConfig {
    pub fn new(listen_port: u16, upstream_host: impl Into<String>, upstream_port: u16) -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port,
            upstream: Upstream::new(upstream_host, upstream_port),
            restart: RestartPolicy::default(),
            bridge: BridgeConfig::default(),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }

    pub fn listen_host(mut self, listen_host: IpAddr) -> Self {
        self.listen_host = listen_host;
        self
    }

    pub fn restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_host, self.listen_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Listening { local_addr: SocketAddr },
    Closing,
}

impl ListenerState {
    pub fn is_listening(&self) -> bool {
        matches!(self, ListenerState::Listening { .. })
    }
}

#[derive(Debug)]
struct Shared {
    config: ListenerConfig,
    state: watch::Sender<ListenerState>,
    reset: Notify,
}

#[derive(Debug)]
struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Keeps one listening socket alive on the configured port and bridges every
/// accepted connection to the upstream.
///
/// Whenever the socket fails or is closed, a new one is bound after the
/// configured [`RestartPolicy`]. This goes on until [`Listener::stop`] is
/// called or the listener is dropped.
#[derive(Debug)]
pub struct Listener {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl Listener {
    pub fn new(config: ListenerConfig) -> Self {
        let (state, _) = watch::channel(ListenerState::Stopped);

        Self {
            shared: Arc::new(Shared {
                config,
                state,
                reset: Notify::new(),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ListenerState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.shared.state.subscribe()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.state() {
            ListenerState::Listening { local_addr } => Some(local_addr),
            _ => None,
        }
    }

    /// Starts listening in the background. Does nothing if already started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(running) = supervisor.as_ref() {
            if !running.task.is_finished() {
                trace!("listener already started");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self.shared).supervise(cancel.clone()));

        *supervisor = Some(Supervisor { cancel, task });
    }

    /// Closes the socket and stops restarting it. Connections already bridged
    /// keep running.
    pub async fn stop(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Supervisor { cancel, task }) = supervisor {
            cancel.cancel();
            let _ = task.await;
        }

        self.shared.set_state(ListenerState::Stopped);
    }

    /// Closes the current socket as a listener error would. The listener then
    /// goes through its usual restart.
    ///
    /// Only a socket that is currently listening can be reset. While the
    /// listener is stopped, starting or closing there is nothing to close and
    /// the request is ignored; `false` is returned in that case.
    pub fn reset(&self) -> bool {
        if !self.state().is_listening() {
            trace!(state = ?self.state(), "nothing to reset");
            return false;
        }

        self.shared.reset.notify_waiters();
        true
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let supervisor = self
            .supervisor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
        }
    }
}

impl Shared {
    fn set_state(&self, state: ListenerState) {
        self.state.send_replace(state);
    }

    async fn supervise(self: Arc<Self>, cancel: CancellationToken) {
        let mut failures: u32 = 0;

        loop {
            self.set_state(ListenerState::Starting);

            let served = select! {
                _ = cancel.cancelled() => break,
                served = self.serve(&mut failures) => served,
            };

            match served {
                Ok(()) => debug!("listener closed, restarting"),
                Err(err) => {
                    failures = failures.saturating_add(1);

                    if failures == 1 {
                        warn!("{err}, restarting");
                    } else {
                        debug!(failures, "{err}, restarting");
                    }
                }
            }

            self.set_state(ListenerState::Stopped);

            select! {
                _ = cancel.cancelled() => break,
                _ = self.config.restart.pause(failures) => {}
            }
        }

        self.set_state(ListenerState::Stopped);
    }

    /// Binds and accepts until the socket fails or a reset is requested.
    async fn serve(&self, failures: &mut u32) -> Result<(), ListenError> {
        let addr = self.config.listen_addr();

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenError::Bind { addr, source })?;

        // Registered before going live so no reset can slip past
        let reset = self.reset.notified();
        tokio::pin!(reset);

        *failures = 0;
        self.set_state(ListenerState::Listening { local_addr });

        info!(
            "bridger is now accepting connections on port {}",
            local_addr.port()
        );

        let mut incoming = TcpListenerStream::new(listener);

        let result = loop {
            let stream = select! {
                _ = &mut reset => break Ok(()),
                stream = incoming.next() => stream,
            };

            match stream {
                Some(Ok(stream)) => self.accept(stream),
                Some(Err(err)) => break Err(ListenError::Accept(err)),
                None => break Ok(()),
            }
        };

        self.set_state(ListenerState::Closing);
        drop(incoming);

        result
    }

    fn accept(&self, inbound: TcpStream) {
        let peer = inbound.peer_addr().ok();

        set_nodelay(&inbound, peer);

        let upstream = self.config.upstream.clone();
        let connect_timeout = self.config.connect_timeout;
        let bridge = self.config.bridge.clone();

        tokio::spawn(async move {
            let outbound = match upstream.connect(connect_timeout).await {
                Ok(outbound) => outbound,
                Err(err) => {
                    trace!(?peer, %upstream, "upstream connect failed: {err}");
                    close(inbound).await;
                    return;
                }
            };

            set_nodelay(&outbound, peer);

            debug!(?peer, %upstream, "bridging");

            let event = Bridge::with_config(inbound, outbound, bridge).run().await;

            debug!(?peer, ?event, "bridge ended");
        });
    }
}

fn set_nodelay(stream: &TcpStream, peer: Option<SocketAddr>) {
    if let Err(err) = stream.set_nodelay(true) {
        trace!(?peer, "could not set nodelay: {err}");
    }
}

/// Ends then releases a connection that never got bridged.
async fn close(mut stream: TcpStream) {
    let _ = stream.shutdown().await;
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ListenerConfig::new(5432, "127.0.0.1", 5433);

        assert_eq!(config.listen_addr(), "0.0.0.0:5432".parse::<SocketAddr>().unwrap());
        assert_eq!(config.upstream.to_string(), "127.0.0.1:5433");
        assert_eq!(config.restart, RestartPolicy::Immediate);
        assert_eq!(config.connect_timeout, Some(DEFAULT_CONNECT_TIMEOUT));
        assert_eq!(config.bridge.idle_timeout, None);
    }

    #[test]
    fn test_new_listener_is_stopped() {
        let listener = Listener::new(ListenerConfig::new(0, "127.0.0.1", 1));

        assert_eq!(listener.state(), ListenerState::Stopped);
        assert_eq!(listener.local_addr(), None);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let port = {
            let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };

        let result = Upstream::new("127.0.0.1", port)
            .connect(Some(Duration::from_secs(1)))
            .await;

        assert!(matches!(result, Err(ConnectError::Io(_))));
    }

    #[tokio::test]
    async fn test_reset_before_start_is_ignored() {
        let listener = Listener::new(ListenerConfig::new(0, "127.0.0.1", 1).listen_host(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        ));

        assert!(!listener.reset());

        listener.start();

        let mut states = listener.subscribe();
        let state = *time::timeout(
            Duration::from_secs(5),
            states.wait_for(ListenerState::is_listening),
        )
        .await
        .unwrap()
        .unwrap();

        // The ignored request must not close the first socket
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.state(), state);

        assert!(listener.reset());

        listener.stop().await;
        assert!(!listener.reset());
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let listener = Listener::new(ListenerConfig::new(0, "127.0.0.1", 1));

        listener.stop().await;

        assert_eq!(listener.state(), ListenerState::Stopped);
    }
}
