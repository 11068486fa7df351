//! Connection acceptor and lifecycle
//!
//! ```text
//! Stopped --run--> Listening --shutdown / accept error--> Draining --last session ends--> Stopped
//! ```
//!
//! Shutdown closes the listener only. Sessions already accepted run to
//! their natural end and are never cancelled; there is no upper bound on
//! how long draining takes.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::session::{log_outcome, SessionHandler};
use super::stats::{ConnectionStats, StatsSnapshot};
use crate::config::ListenConfig;
use crate::error::ConnectionError;

/// Acceptor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not accepting and no sessions running
    Stopped,
    /// Accepting connections
    Listening,
    /// Listener closed, sessions still running
    Draining,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Listening => write!(f, "listening"),
            Self::Draining => write!(f, "draining"),
        }
    }
}

/// State shared between the accept loop and its handles
#[derive(Debug)]
struct Shared {
    shutdown: watch::Sender<bool>,
    state: watch::Sender<ServerState>,
    /// Set once the accept loop has exited and every session ended
    drained: watch::Sender<bool>,
    stats: Arc<ConnectionStats>,
}

/// Bound, not yet running server
pub struct ProxyServer {
    listener: TcpListener,
    handler: Arc<SessionHandler>,
    shared: Arc<Shared>,
}

impl ProxyServer {
    /// Bind the listening socket described by `config`.
    ///
    /// IPv6 wildcard addresses accept IPv4 clients too. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::BindError` if the socket cannot be bound.
    pub fn bind(config: &ListenConfig, handler: SessionHandler) -> Result<Self, ConnectionError> {
        let listener = bind_listener(config)?;
        Ok(Self::from_listener(listener, handler))
    }

    /// Wrap an already bound listener
    #[must_use]
    pub fn from_listener(listener: TcpListener, handler: SessionHandler) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (state, _) = watch::channel(ServerState::Stopped);
        let (drained, _) = watch::channel(false);
        Self {
            listener,
            handler: Arc::new(handler),
            shared: Arc::new(Shared {
                shutdown,
                state,
                drained,
                stats: Arc::new(ConnectionStats::new()),
            }),
        }
    }

    /// Address the listener is bound to
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::IoError` if the OS cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr, ConnectionError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for shutdown and observation
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the accept loop on a new task
    #[must_use]
    pub fn spawn(self) -> RunningServer {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        RunningServer { handle, task }
    }

    /// Accept connections until shutdown is requested or accept fails.
    ///
    /// Returns once the loop has exited and the listener is closed; sessions
    /// may still be running.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::AcceptError` if accepting failed.
    pub async fn run(self) -> Result<(), ConnectionError> {
        let Self {
            listener,
            handler,
            shared,
        } = self;

        let mut shutdown_rx = shared.shutdown.subscribe();
        shared.state.send_replace(ServerState::Listening);
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Accepting connections");
        }

        let result = loop {
            if *shutdown_rx.borrow_and_update() {
                info!("Shutdown requested, closing listener");
                break Ok(());
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => spawn_session(&handler, &shared.stats, stream, peer),
                    Err(e) => {
                        error!(error = %e, "Accept failed, stopping accept loop");
                        break Err(ConnectionError::AcceptError(e.to_string()));
                    }
                },
            }
        };

        drop(listener);
        shared.state.send_replace(ServerState::Draining);

        let active = shared.stats.active();
        if active > 0 {
            info!(active, "Draining in-flight sessions");
        }

        // Stopped is reached once the last session ends
        let drain = Arc::clone(&shared);
        tokio::spawn(async move {
            drain.stats.wait_idle().await;
            drain.state.send_replace(ServerState::Stopped);
            drain.drained.send_replace(true);
            debug!("All sessions drained");
        });

        result
    }
}

impl fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyServer")
            .field("listener", &self.listener.local_addr().ok())
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

fn spawn_session(
    handler: &Arc<SessionHandler>,
    stats: &Arc<ConnectionStats>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let ticket = stats.begin();
    let handler = Arc::clone(handler);

    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
    }
    debug!(%peer, "Connection accepted");

    tokio::spawn(async move {
        let outcome = handler.handle(stream, peer).await;
        log_outcome(peer, &outcome);
        match outcome {
            Ok(result) => ticket.complete(result.client_to_upstream, result.upstream_to_client),
            Err(_) => ticket.fail(),
        }
    });
}

/// Cloneable handle to a server
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Ask the accept loop to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    /// Whether shutdown has been requested
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.shared.state.borrow()
    }

    /// Connection counters
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Number of sessions still running
    #[must_use]
    pub fn active_sessions(&self) -> u64 {
        self.shared.stats.active()
    }

    /// Wait until the accept loop has exited and the last session ended.
    ///
    /// Does not return for a server that was never run.
    pub async fn stopped(&self) {
        let mut rx = self.shared.drained.subscribe();
        // The sender lives in `shared`, so the channel cannot close here
        let _ = rx.wait_for(|drained| *drained).await;
    }
}

/// Accept loop running on its own task
#[derive(Debug)]
pub struct RunningServer {
    handle: ServerHandle,
    task: JoinHandle<Result<(), ConnectionError>>,
}

impl RunningServer {
    /// Handle for shutdown and observation
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Block until the accept loop has exited.
    ///
    /// # Errors
    ///
    /// Returns the accept loop's error, or `ConnectionError::InvalidState`
    /// if its task panicked.
    pub async fn wait(self) -> Result<(), ConnectionError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ConnectionError::InvalidState(format!(
                "accept loop task failed: {e}"
            ))),
        }
    }
}

/// Create the listening socket
fn bind_listener(config: &ListenConfig) -> Result<TcpListener, ConnectionError> {
    let addr = config.address;
    let bind_err = |e: std::io::Error| ConnectionError::bind(addr, e.to_string());

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false).map_err(bind_err)?;
    }
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;

    let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
    socket.listen(backlog).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(bind_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityAllocator, Ipv6Prefix};
    use crate::nat::{MemoryNatController, NatController};
    use crate::outbound::{MarkedDialer, Network};
    use std::time::Duration;

    fn handler() -> SessionHandler {
        let nat: Arc<dyn NatController> = Arc::new(MemoryNatController::new());
        let allocator = Arc::new(IdentityAllocator::new(
            Ipv6Prefix::parse("2001:db8::").unwrap(),
            nat,
        ));
        SessionHandler::socks5(
            allocator,
            Arc::new(MarkedDialer::new(Network::Tcp6, Duration::from_secs(1))),
            &crate::config::ConnectionConfig::default(),
        )
    }

    fn loopback() -> ListenConfig {
        ListenConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            ..ListenConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_reports_address() {
        let server = ProxyServer::bind(&loopback(), handler()).unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.handle().state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = ProxyServer::bind(&loopback(), handler()).unwrap();
        let taken = ListenConfig {
            address: first.local_addr().unwrap(),
            ..ListenConfig::default()
        };
        // SO_REUSEADDR does not allow two listeners on one port
        let result = ProxyServer::bind(&taken, handler());
        assert!(matches!(result, Err(ConnectionError::BindError { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_lifecycle() {
        let server = ProxyServer::bind(&loopback(), handler()).unwrap();
        let addr = server.local_addr().unwrap();
        let running = server.spawn();
        let handle = running.handle();

        // Wait for the loop to come up
        let mut state = handle.shared.state.subscribe();
        state
            .wait_for(|s| *s == ServerState::Listening)
            .await
            .unwrap();

        handle.shutdown();
        assert!(handle.is_shutting_down());
        tokio::time::timeout(Duration::from_secs(5), running.wait())
            .await
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.stopped())
            .await
            .unwrap();
        assert_eq!(handle.state(), ServerState::Stopped);

        // Listener is closed
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_accept_error_stops_loop() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        // Same socket, used to break it underneath the accept loop
        let twin = Socket::from(std_listener.try_clone().unwrap());
        let listener = TcpListener::from_std(std_listener).unwrap();

        let running = ProxyServer::from_listener(listener, handler()).spawn();
        let handle = running.handle();
        let mut state = handle.shared.state.subscribe();
        state
            .wait_for(|s| *s == ServerState::Listening)
            .await
            .unwrap();

        // Linux fails a pending accept with EINVAL once the listener is shut down
        twin.shutdown(std::net::Shutdown::Both).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), running.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(ConnectionError::AcceptError(_))));
        assert!(!handle.is_shutting_down());

        tokio::time::timeout(Duration::from_secs(5), handle.stopped())
            .await
            .unwrap();
        assert_eq!(handle.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_before_run() {
        let server = ProxyServer::bind(&loopback(), handler()).unwrap();
        let handle = server.handle();
        handle.shutdown();
        handle.shutdown();

        tokio::time::timeout(Duration::from_secs(5), server.run())
            .await
            .unwrap()
            .unwrap();
    }
}
