//! State store contract and the backends that satisfy it.
//!
//! # Correctness precondition
//!
//! A store that only offers independent [`Store::get`] and [`Store::set`]
//! calls is [`Atomicity::ProcessLocal`]. The engine serializes get/set pairs
//! for it with an in-process [`KeyGuard`](crate::bucket::KeyGuard), which is
//! enough while one engine instance owns the store. It is NOT safe to share
//! such a store between instances: two of them can read the same state, both
//! admit, and both write, over-admitting by up to the number of racing
//! instances.
//!
//! Stores meant to be shared must be [`Atomicity::ServerSide`] and implement
//! [`Store::take`] as one fetch-refill-conditionally-decrement-store operation
//! executed by the backend.

mod memory;
mod remote;

pub use memory::MemoryStore;
pub use remote::RemoteStore;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::bucket::{BucketState, Decision, Policy};
use crate::config::{StoreConfig, StoreKind};
use crate::error::{Result, TollgateError};

/// What a store guarantees about concurrent updates to one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atomicity {
    /// Independent get and set; the caller must serialize them.
    ProcessLocal,
    /// The store applies a whole take atomically on its side.
    ServerSide,
}

/// Everything a store needs to apply a take on its side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeRequest {
    /// Tokens to deduct
    pub cost: i64,
    /// Caller's clock reading, nanoseconds since the Unix epoch
    pub now: i64,
    /// Refill rate and capacity to apply
    pub policy: Policy,
}

/// Persistence of per-key bucket state.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read the state for `key`. A missing record is a vacant state
    /// (`last_refill == 0`), not an error.
    async fn get(&self, key: &str) -> Result<BucketState>;

    /// Overwrite the state for `key`.
    async fn set(&self, key: &str, state: BucketState) -> Result<()>;

    /// Concurrency guarantee of this store.
    fn atomicity(&self) -> Atomicity {
        Atomicity::ProcessLocal
    }

    /// Atomically refill, conditionally deduct and persist.
    ///
    /// Only [`Atomicity::ServerSide`] stores implement this.
    async fn take(&self, key: &str, request: TakeRequest) -> Result<Decision> {
        let _ = request;
        Err(TollgateError::StoreUnavailable(format!(
            "store has no atomic take (key {})",
            key
        )))
    }
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn get(&self, key: &str) -> Result<BucketState> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, state: BucketState) -> Result<()> {
        (**self).set(key, state).await
    }

    fn atomicity(&self) -> Atomicity {
        (**self).atomicity()
    }

    async fn take(&self, key: &str, request: TakeRequest) -> Result<Decision> {
        (**self).take(key, request).await
    }
}

/// The backend an engine runs on, chosen once at startup.
#[derive(Debug)]
pub enum Backend {
    /// Process-owned table
    Memory(MemoryStore),
    /// Shared bucket-store server
    Remote(RemoteStore),
}

impl Backend {
    /// Build the backend described by the configuration.
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        match config.kind {
            StoreKind::Memory => {
                info!("Using in-memory bucket store");
                Ok(Backend::Memory(MemoryStore::new()))
            }
            StoreKind::Remote => {
                let addr = config.remote_addr.as_deref().ok_or_else(|| {
                    TollgateError::Config("store.remote_addr is required for a remote store".into())
                })?;
                info!(addr = %addr, "Using remote bucket store");
                Ok(Backend::Remote(RemoteStore::connect(addr).await?))
            }
        }
    }
}

#[async_trait]
impl Store for Backend {
    async fn get(&self, key: &str) -> Result<BucketState> {
        match self {
            Backend::Memory(store) => store.get(key).await,
            Backend::Remote(store) => store.get(key).await,
        }
    }

    async fn set(&self, key: &str, state: BucketState) -> Result<()> {
        match self {
            Backend::Memory(store) => store.set(key, state).await,
            Backend::Remote(store) => store.set(key, state).await,
        }
    }

    fn atomicity(&self) -> Atomicity {
        match self {
            Backend::Memory(store) => store.atomicity(),
            Backend::Remote(store) => store.atomicity(),
        }
    }

    async fn take(&self, key: &str, request: TakeRequest) -> Result<Decision> {
        match self {
            Backend::Memory(store) => store.take(key, request).await,
            Backend::Remote(store) => store.take(key, request).await,
        }
    }
}
