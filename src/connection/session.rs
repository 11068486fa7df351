//! Per-connection session pipeline
//!
//! negotiation -> allocation -> relay. Every failure stays inside the
//! session; the acceptor only sees a log line.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info_span, warn, Instrument};

use super::relay::RelayEngine;
use crate::config::ConnectionConfig;
use crate::error::{NegotiationError, SessionError};
use crate::identity::IdentityAllocator;
use crate::io::{CopyResult, ProxyStream};
use crate::outbound::Dial;
use crate::socks5::protocol::REPLY_GENERAL_FAILURE;
use crate::socks5::{Negotiator, Request, Socks5Negotiator};

/// Shared state every session task runs against
#[derive(Clone)]
pub struct SessionHandler {
    allocator: Arc<IdentityAllocator>,
    negotiator: Arc<dyn Negotiator>,
    relay: RelayEngine,
    handshake_timeout: Option<Duration>,
}

impl SessionHandler {
    /// Create a handler from its parts
    pub fn new(
        allocator: Arc<IdentityAllocator>,
        negotiator: Arc<dyn Negotiator>,
        relay: RelayEngine,
        handshake_timeout: Option<Duration>,
    ) -> Self {
        Self {
            allocator,
            negotiator,
            relay,
            handshake_timeout,
        }
    }

    /// SOCKS5 handler configured from the connection config
    pub fn socks5(
        allocator: Arc<IdentityAllocator>,
        dialer: Arc<dyn Dial>,
        config: &ConnectionConfig,
    ) -> Self {
        Self::new(
            allocator,
            Arc::new(Socks5Negotiator::new()),
            RelayEngine::from_config(dialer, config),
            config.handshake_timeout(),
        )
    }

    /// Identity allocator shared by all sessions
    #[must_use]
    pub fn allocator(&self) -> &Arc<IdentityAllocator> {
        &self.allocator
    }

    /// Run one session to completion.
    ///
    /// `client` is dropped (closed) before this returns.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` naming the stage that failed.
    pub async fn handle<S: ProxyStream>(
        &self,
        mut client: S,
        peer: SocketAddr,
    ) -> Result<CopyResult, SessionError> {
        let span = info_span!("session", %peer);
        async move {
            let (username, request) = self.negotiate(&mut client).await?;
            let user = String::from_utf8_lossy(&username).into_owned();

            let mark = match self.allocator.get_or_create_mark(&username).await {
                Ok(mark) => mark,
                Err(e) => {
                    if let Err(reply_err) = self
                        .negotiator
                        .send_reply(&mut client, REPLY_GENERAL_FAILURE, None)
                        .await
                    {
                        debug!(error = %reply_err, "Failed to send failure reply");
                    }
                    return Err(e.into());
                }
            };

            debug!(%user, %mark, dest = %request.target, "Session authorised");

            let result = self
                .relay
                .relay(&mut client, &request, mark, self.negotiator.as_ref())
                .await?;
            Ok(result)
        }
        .instrument(span)
        .await
    }

    async fn negotiate<S: ProxyStream>(
        &self,
        client: &mut S,
    ) -> Result<(Vec<u8>, Request), NegotiationError> {
        let exchange = async {
            let username = self.negotiator.authenticate(&mut *client).await?;
            let request = self.negotiator.read_request(&mut *client).await?;
            Ok::<_, NegotiationError>((username, request))
        };

        match self.handshake_timeout {
            Some(limit) => timeout(limit, exchange)
                .await
                .map_err(|_| NegotiationError::Timeout(limit.as_secs()))?,
            None => exchange.await,
        }
    }
}

impl std::fmt::Debug for SessionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandler")
            .field("allocator", &self.allocator)
            .field("relay", &self.relay)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

/// Log a finished session at the level its outcome deserves
pub(crate) fn log_outcome(peer: SocketAddr, outcome: &Result<CopyResult, SessionError>) {
    match outcome {
        Ok(result) => debug!(
            %peer,
            sent = result.client_to_upstream,
            recv = result.upstream_to_client,
            "Session completed"
        ),
        Err(SessionError::Allocation(e)) => {
            warn!(%peer, error = %e, "Session aborted: identity allocation failed");
        }
        Err(e) => debug!(%peer, stage = e.stage(), error = %e, "Session aborted"),
    }
}
