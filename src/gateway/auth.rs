//! Connection authentication
//!
//! Credentials are checked once per connection during `connect`. The rate
//! limiter is consulted before the credential is even looked at, so a
//! blocked identity gets `RATE_LIMITED` whether or not its token is well
//! formed.

use std::net::SocketAddr;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use super::protocol::ConnectAuth;
use super::rate_limit::RateLimiter;
use crate::config::{AuthConfig, AuthMode};
use crate::error::{Error, Result};

/// Verifies handshake credentials against the configured auth mode
pub struct Authenticator {
    mode: AuthMode,
    token: Option<SecretString>,
    password: Option<SecretString>,
    limiter: Arc<RateLimiter>,
}

impl Authenticator {
    pub fn new(config: &AuthConfig, limiter: Arc<RateLimiter>) -> Self {
        Authenticator {
            mode: config.mode,
            token: config.token.clone(),
            password: config.password.clone(),
            limiter,
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Authorize a connection. `identity` is the rate-limit key, normally
    /// the peer IP.
    pub fn authorize(
        &self,
        identity: &str,
        remote_addr: Option<SocketAddr>,
        credentials: Option<&ConnectAuth>,
    ) -> Result<()> {
        if let Some(retry_after_ms) = self.limiter.retry_after_ms(identity) {
            debug!(identity = %identity, retry_after_ms, "auth attempt while blocked");
            return Err(Error::RateLimited { retry_after_ms });
        }

        let outcome = match self.mode {
            AuthMode::None => {
                if remote_addr.map(|a| a.ip().is_loopback()).unwrap_or(false) {
                    Ok(())
                } else {
                    Err("unauthenticated access is limited to loopback peers")
                }
            }
            AuthMode::Token => verify(
                self.token.as_ref(),
                credentials.and_then(|c| c.token.as_deref()),
            ),
            AuthMode::Password => verify(
                self.password.as_ref(),
                credentials.and_then(|c| c.password.as_deref()),
            ),
        };

        match outcome {
            Ok(()) => {
                self.limiter.record_success(identity);
                Ok(())
            }
            Err(reason) => {
                warn!(identity = %identity, mode = ?self.mode, reason, "authentication failed");
                self.limiter.record_failure(identity);
                Err(Error::Unauthorized(reason.to_string()))
            }
        }
    }
}

fn verify(expected: Option<&SecretString>, presented: Option<&str>) -> std::result::Result<(), &'static str> {
    let Some(expected) = expected else {
        return Err("no credential configured");
    };
    let Some(presented) = presented else {
        return Err("missing credential");
    };
    if timing_safe_equal(expected.expose_secret().as_bytes(), presented.as_bytes()) {
        Ok(())
    } else {
        Err("credential mismatch")
    }
}

fn timing_safe_equal(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut diff = 0u8;
    for (lhs, rhs) in left.iter().zip(right) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}
