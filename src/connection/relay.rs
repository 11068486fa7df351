//! Relay engine
//!
//! Takes an authenticated client and its mark, dials the requested target
//! through a [`Dial`] implementation, reports the outcome to the client, and
//! copies bytes until the first direction finishes. The upstream connection
//! is owned here and closed on every return path; the client stream is
//! closed when the caller drops it.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::ConnectionConfig;
use crate::error::RelayError;
use crate::identity::Mark;
use crate::io::{relay_streams, CopyResult, ProxyStream, DEFAULT_BUFFER_SIZE};
use crate::outbound::Dial;
use crate::socks5::protocol::REPLY_SUCCEEDED;
use crate::socks5::{reply_for_dial_error, reply_message, Negotiator, Request};

/// Dials marked upstream connections and relays session traffic
#[derive(Clone)]
pub struct RelayEngine {
    dialer: Arc<dyn Dial>,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
}

impl RelayEngine {
    /// Create an engine with the default buffer size and no idle timeout
    pub fn new(dialer: Arc<dyn Dial>) -> Self {
        Self {
            dialer,
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
        }
    }

    /// Create an engine tuned by the connection config
    pub fn from_config(dialer: Arc<dyn Dial>, config: &ConnectionConfig) -> Self {
        Self {
            dialer,
            buffer_size: config.buffer_size,
            idle_timeout: config.idle_timeout(),
        }
    }

    /// Set the per-direction buffer size
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// End relays after `timeout` without traffic
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Serve one CONNECT request.
    ///
    /// Relay I/O errors are a normal way for a session to end and are not
    /// returned.
    ///
    /// # Errors
    ///
    /// - `RelayError::UnsupportedCommand` if `request` is not CONNECT
    /// - `RelayError::Dial` if the upstream could not be reached; the
    ///   client has been sent a failure reply and no bytes were copied
    /// - `RelayError::Reply` if the success reply could not be written
    pub async fn relay<S: ProxyStream>(
        &self,
        client: &mut S,
        request: &Request,
        mark: Mark,
        negotiator: &dyn Negotiator,
    ) -> Result<CopyResult, RelayError> {
        if !request.is_connect() {
            return Err(RelayError::UnsupportedCommand(request.command));
        }

        let mut upstream = match self.dialer.dial(&request.target, mark).await {
            Ok(stream) => stream,
            Err(e) => {
                let code = reply_for_dial_error(&e);
                if let Err(reply_err) = negotiator.send_reply(&mut *client, code, None).await {
                    debug!(error = %reply_err, "Failed to send failure reply");
                }
                debug!(
                    dest = %request.target,
                    %mark,
                    reply = reply_message(code),
                    error = %e,
                    "Dial failed"
                );
                return Err(e.into());
            }
        };

        let bound = upstream.local_addr().ok();
        negotiator
            .send_reply(&mut *client, REPLY_SUCCEEDED, bound)
            .await?;

        debug!(dest = %request.target, %mark, bound = ?bound, "Relay started");

        let result = relay_streams(client, &mut upstream, self.buffer_size, self.idle_timeout).await;

        debug!(
            dest = %request.target,
            sent = result.client_to_upstream,
            recv = result.upstream_to_client,
            end = ?result.end,
            "Relay finished"
        );
        Ok(result)
    }
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("buffer_size", &self.buffer_size)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}
