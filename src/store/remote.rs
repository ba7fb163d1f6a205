//! Client of a shared bucket-store server.

use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use super::{Atomicity, Store, TakeRequest};
use crate::bucket::{BucketState, Decision};
use crate::error::{Result, TollgateError};
use crate::grpc::proto;
use crate::grpc::{error_from_status, BucketStoreClient};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bucket state held by a `tollgate store` server shared between instances.
///
/// Takes run on the server under its per-key lock, so engines on different
/// hosts never over-admit against each other. Clock skew between those hosts
/// still shifts refill timing by the skew.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: BucketStoreClient<Channel>,
}

impl RemoteStore {
    /// Connect to the bucket store at `addr` (`host:port` or a full URI).
    pub async fn connect(addr: &str) -> Result<Self> {
        let uri = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };

        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| TollgateError::Config(format!("invalid store address {}: {}", uri, e)))?
            .connect_timeout(CONNECT_TIMEOUT);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| TollgateError::StoreUnavailable(format!("{}: {}", uri, e)))?;

        info!(addr = %uri, "Connected to bucket store");
        Ok(Self::from_channel(channel))
    }

    /// Use an existing channel.
    pub fn from_channel(channel: Channel) -> Self {
        Self {
            client: BucketStoreClient::new(channel),
        }
    }
}

#[async_trait]
impl Store for RemoteStore {
    async fn get(&self, key: &str) -> Result<BucketState> {
        let response = self
            .client
            .clone()
            .get(proto::GetRequest { key: key.to_string() })
            .await
            .map_err(|s| error_from_status(s, key, 0))?
            .into_inner();
        Ok(BucketState::new(response.tokens, response.last_refill))
    }

    async fn set(&self, key: &str, state: BucketState) -> Result<()> {
        self.client
            .clone()
            .set(proto::SetRequest {
                key: key.to_string(),
                tokens: state.tokens,
                last_refill: state.last_refill,
            })
            .await
            .map_err(|s| error_from_status(s, key, 0))?;
        Ok(())
    }

    fn atomicity(&self) -> Atomicity {
        Atomicity::ServerSide
    }

    async fn take(&self, key: &str, request: TakeRequest) -> Result<Decision> {
        let capacity = request.policy.capacity();
        let response = self
            .client
            .clone()
            .take(proto::TakeRequest {
                key: key.to_string(),
                cost: request.cost,
                now: request.now,
                rate: request.policy.rate(),
                capacity,
            })
            .await
            .map_err(|s| error_from_status(s, key, capacity))?
            .into_inner();

        debug!(key = %key, admitted = response.admitted, tokens = response.tokens, "Remote take");

        Ok(Decision {
            admitted: response.admitted,
            state: BucketState::new(response.tokens, response.last_refill),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{Policy, TokenBucket};
    use crate::clock::ManualClock;
    use crate::grpc::{BucketStoreServer, BucketStoreService};
    use crate::store::MemoryStore;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_stream::wrappers::TcpListenerStream;

    struct TestServer {
        addr: SocketAddr,
        table: Arc<MemoryStore>,
        shutdown: Option<oneshot::Sender<()>>,
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
        }
    }

    async fn start_server() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let table = Arc::new(MemoryStore::new());
        let service = BucketStoreService::new(table.clone());
        let (tx, rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(BucketStoreServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        TestServer {
            addr,
            table,
            shutdown: Some(tx),
        }
    }

    #[tokio::test]
    async fn test_remote_get_set() {
        let server = start_server().await;
        let store = RemoteStore::connect(&server.addr.to_string()).await.unwrap();

        assert!(store.get("k").await.unwrap().is_vacant());

        store.set("k", BucketState::new(3, 99)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), BucketState::new(3, 99));
        assert_eq!(server.table.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_engine_scenario() {
        let server = start_server().await;
        let store = RemoteStore::connect(&server.addr.to_string()).await.unwrap();
        let clock = ManualClock::default();
        let limiter = TokenBucket::with_clock(Policy::new(1.0, 5).unwrap(), store, clock.clone());

        assert!(limiter.allow("user:1", 1).await.unwrap());
        assert!(!limiter.allow("user:1", 5).await.unwrap());
        clock.advance(Duration::from_secs(10));
        assert!(limiter.allow("user:1", 3).await.unwrap());

        let state = server.table.get("user:1").await.unwrap();
        assert_eq!(state.tokens, 2);
    }

    #[tokio::test]
    async fn test_remote_invalid_state() {
        let server = start_server().await;
        server.table.set("k", BucketState::new(100, 5)).await.unwrap();

        let store = RemoteStore::connect(&server.addr.to_string()).await.unwrap();
        let limiter = TokenBucket::new(Policy::new(1.0, 10).unwrap(), store);

        match limiter.allow("k", 1).await {
            Err(TollgateError::InvalidState { tokens, capacity, .. }) => {
                assert_eq!(tokens, 100);
                assert_eq!(capacity, 10);
            }
            other => panic!("expected invalid state, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_store_unavailable() {
        // Bind and drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let err = RemoteStore::connect(&addr.to_string()).await.unwrap_err();
        assert!(matches!(err, TollgateError::StoreUnavailable(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_instances_sharing_store_never_over_admit() {
        let server = start_server().await;
        let clock = ManualClock::default();
        let policy = Policy::new(10.0, 20).unwrap();

        // Three independent engines, each with its own connection
        let mut limiters = Vec::new();
        for _ in 0..3 {
            let store = RemoteStore::connect(&server.addr.to_string()).await.unwrap();
            limiters.push(Arc::new(TokenBucket::with_clock(policy, store, clock.clone())));
        }

        let handles: Vec<_> = (0..30)
            .map(|i| {
                let limiter = limiters[i % limiters.len()].clone();
                tokio::spawn(async move { limiter.allow("shared", 1).await.unwrap() })
            })
            .collect();

        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(admitted, 20);
        assert_eq!(server.table.get("shared").await.unwrap().tokens, 0);
    }
}
