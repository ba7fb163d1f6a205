//! Shared bucket-store service.
//!
//! Engines on several hosts point at one instance of this service. `Take`
//! runs the whole refill/consume transition here under a per-key lock, which
//! is what makes sharing safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tonic::{Request, Response, Status};
use tracing::{debug, instrument, warn};

use super::bucket_store_server::BucketStore;
use super::proto::{
    GetRequest, GetResponse, SetRequest, SetResponse, TakeRequest, TakeResponse,
};
use super::status_from_error;
use crate::bucket::{take_from, BucketState, KeyGuard, Policy};
use crate::store::{self, MemoryStore, Store};

/// Implementation of the `tollgate.v1.BucketStore` gRPC interface.
#[derive(Debug)]
pub struct BucketStoreService {
    store: Arc<MemoryStore>,
    guard: KeyGuard,
}

impl BucketStoreService {
    /// Serve `store` with the default number of lock shards.
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            guard: KeyGuard::default(),
        }
    }

    /// Change the number of lock shards.
    pub fn with_guard_shards(mut self, shards: usize) -> Self {
        self.guard = KeyGuard::new(shards);
        self
    }

    /// The table behind this service.
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Periodically drop keys no take has touched for longer than `ttl`.
    pub fn spawn_eviction(&self, ttl: Duration) -> JoinHandle<()> {
        let store = self.store.clone();
        let period = ttl.min(Duration::from_secs(60)).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                store.evict_idle(ttl);
            }
        })
    }
}

fn require_key(key: &str) -> Result<(), Status> {
    if key.is_empty() {
        warn!("Received bucket store request with empty key");
        return Err(Status::invalid_argument("key is required"));
    }
    Ok(())
}

#[tonic::async_trait]
impl BucketStore for BucketStoreService {
    #[instrument(skip(self, request), fields(key = %request.get_ref().key))]
    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;

        let state = self
            .store
            .get(&req.key)
            .await
            .map_err(|e| status_from_error(&e))?;

        Ok(Response::new(GetResponse {
            tokens: state.tokens,
            last_refill: state.last_refill,
        }))
    }

    #[instrument(skip(self, request), fields(key = %request.get_ref().key))]
    async fn set(&self, request: Request<SetRequest>) -> Result<Response<SetResponse>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;
        if req.tokens < 0 || req.last_refill < 0 {
            return Err(Status::invalid_argument(
                "tokens and last_refill must be non-negative",
            ));
        }

        let _lock = self.guard.lock(&req.key).await;
        self.store
            .set(&req.key, BucketState::new(req.tokens, req.last_refill))
            .await
            .map_err(|e| status_from_error(&e))?;

        Ok(Response::new(SetResponse {}))
    }

    #[instrument(
        skip(self, request),
        fields(key = %request.get_ref().key, cost = request.get_ref().cost)
    )]
    async fn take(&self, request: Request<TakeRequest>) -> Result<Response<TakeResponse>, Status> {
        let req = request.into_inner();
        require_key(&req.key)?;

        let policy = Policy::new(req.rate, req.capacity).map_err(|e| status_from_error(&e))?;
        policy.check_cost(req.cost).map_err(|e| status_from_error(&e))?;

        let take = store::TakeRequest {
            cost: req.cost,
            now: req.now,
            policy,
        };
        let decision = {
            let _lock = self.guard.lock(&req.key).await;
            take_from(self.store.as_ref(), &req.key, take)
                .await
                .map_err(|e| status_from_error(&e))?
        };

        debug!(
            key = %req.key,
            admitted = decision.admitted,
            tokens = decision.state.tokens,
            "Applied take"
        );

        Ok(Response::new(TakeResponse {
            admitted: decision.admitted,
            tokens: decision.state.tokens,
            last_refill: decision.state.last_refill,
        }))
    }
}
