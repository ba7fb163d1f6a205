//! Admission decisions for identified callers.
//!
//! This is the layer between a transport and the engine: it turns caller
//! metadata into a bucket key, charges the configured cost and reports one of
//! three outcomes. Store failures are never reported as admissions.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bucket::TokenBucket;
use crate::clock::{Clock, SystemClock};
use crate::error::TollgateError;
use crate::store::Store;

/// How a caller key is derived from request metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// `api:<key>` when an API key is present, else `ip:<host>`
    #[default]
    ApiKeyOrAddr,
    /// Always `ip:<host>`
    Addr,
}

impl KeyStrategy {
    /// The bucket key for `caller`, if it carries enough identity.
    pub fn derive(&self, caller: &Caller) -> Option<String> {
        if *self == KeyStrategy::ApiKeyOrAddr {
            if let Some(api_key) = caller.api_key.as_deref().filter(|k| !k.is_empty()) {
                return Some(format!("api:{}", api_key));
            }
        }
        caller
            .addr
            .as_deref()
            .filter(|a| !a.is_empty())
            .map(|a| format!("ip:{}", host_of(a)))
    }
}

/// Strip a port from `addr` when it has one.
fn host_of(addr: &str) -> String {
    if let Ok(socket) = addr.parse::<std::net::SocketAddr>() {
        return socket.ip().to_string();
    }
    if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
        return ip.to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host.to_string(),
        _ => addr.to_string(),
    }
}

/// Identity of whoever is asking to be admitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    /// API credential, if presented
    pub api_key: Option<String>,
    /// Client address, with or without a port
    pub addr: Option<String>,
}

impl Caller {
    /// Create a caller from optional identity parts.
    pub fn new(api_key: Option<String>, addr: Option<String>) -> Self {
        Self { api_key, addr }
    }

    /// Identity of the peer of a gRPC request: the `header` metadata value and
    /// the remote socket address.
    pub fn from_request<T>(request: &tonic::Request<T>, header: &str) -> Self {
        let api_key = request
            .metadata()
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let addr = request.remote_addr().map(|a| a.to_string());
        Self { api_key, addr }
    }

    /// Fill missing parts from `fallback`.
    pub fn or(self, fallback: Caller) -> Caller {
        let present = |v: Option<String>| v.filter(|s| !s.is_empty());
        Caller {
            api_key: present(self.api_key).or(fallback.api_key),
            addr: present(self.addr).or(fallback.addr),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug)]
pub enum Verdict {
    /// Go ahead.
    Proceed {
        /// Tokens left for this caller
        remaining: i64,
    },
    /// Rate limited.
    Limited {
        /// Tokens left for this caller
        remaining: i64,
        /// When the same cost could succeed; `None` if it never will
        retry_after: Option<Duration>,
    },
    /// No decision could be made. Treat as a rejection.
    Failed(TollgateError),
}

impl Verdict {
    /// Only [`Verdict::Proceed`] admits.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Proceed { .. })
    }
}

/// Charges callers against a shared [`TokenBucket`].
#[derive(Debug)]
pub struct Admission<S, C = SystemClock> {
    limiter: Arc<TokenBucket<S, C>>,
    strategy: KeyStrategy,
    cost: i64,
}

impl<S: Store, C: Clock> Admission<S, C> {
    /// Create an admission layer charging `cost` per request by default.
    pub fn new(limiter: Arc<TokenBucket<S, C>>, strategy: KeyStrategy, cost: i64) -> Self {
        Self {
            limiter,
            strategy,
            cost,
        }
    }

    /// The engine behind this layer.
    pub fn limiter(&self) -> &Arc<TokenBucket<S, C>> {
        &self.limiter
    }

    /// Decide whether `caller` may proceed, charging `cost` or the default.
    pub async fn check(&self, caller: &Caller, cost: Option<i64>) -> Verdict {
        let Some(key) = self.strategy.derive(caller) else {
            return Verdict::Failed(TollgateError::InvalidArgument(
                "caller has neither an API key nor an address".to_string(),
            ));
        };
        let cost = cost.unwrap_or(self.cost);

        match self.limiter.take(&key, cost).await {
            Ok(decision) if decision.admitted => Verdict::Proceed {
                remaining: decision.remaining(),
            },
            Ok(decision) => {
                let retry_after = self.limiter.policy().retry_after(cost, decision.remaining());
                debug!(key = %key, cost, retry_after = ?retry_after, "Caller rate limited");
                Verdict::Limited {
                    remaining: decision.remaining(),
                    retry_after,
                }
            }
            Err(e) => {
                if e.is_store_failure() {
                    warn!(key = %key, error = %e, "Limiter unavailable, rejecting caller");
                }
                Verdict::Failed(e)
            }
        }
    }
}
