//! gRPC server implementation.

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use super::gate::GateService;
use super::store_service::BucketStoreService;
use super::{BucketStoreServer, GateServer};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::store::{Backend, Store};

/// The service a server hosts.
enum Hosted<S, C> {
    Gate(GateService<S, C>),
    BucketStore(BucketStoreService),
}

/// gRPC server for one of the Tollgate services.
pub struct GrpcServer<S = Backend, C = SystemClock> {
    /// Address to bind to
    addr: SocketAddr,
    hosted: Hosted<S, C>,
}

impl<S, C> GrpcServer<S, C>
where
    S: Store + 'static,
    C: Clock + 'static,
{
    /// Create a server answering admission checks.
    pub fn gate(addr: SocketAddr, service: GateService<S, C>) -> Self {
        Self {
            addr,
            hosted: Hosted::Gate(service),
        }
    }
}

impl GrpcServer {
    /// Create a server hosting the shared bucket store.
    pub fn bucket_store(addr: SocketAddr, service: BucketStoreService) -> Self {
        Self {
            addr,
            hosted: Hosted::BucketStore(service),
        }
    }
}

impl<S, C> GrpcServer<S, C>
where
    S: Store + 'static,
    C: Clock + 'static,
{
    /// The configured bind address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local_addr = listener.local_addr()?;
        let incoming = TcpListenerStream::new(listener);
        let mut builder = Server::builder();

        let served = match self.hosted {
            Hosted::Gate(service) => {
                info!(addr = %local_addr, "Starting gRPC server for Gate");
                builder
                    .add_service(GateServer::new(service))
                    .serve_with_incoming_shutdown(incoming, signal)
                    .await
            }
            Hosted::BucketStore(service) => {
                info!(addr = %local_addr, "Starting gRPC server for BucketStore");
                builder
                    .add_service(BucketStoreServer::new(service))
                    .serve_with_incoming_shutdown(incoming, signal)
                    .await
            }
        };

        served.map_err(|e| {
            error!(error = %e, "gRPC server failed");
            TollgateError::Transport(e)
        })
    }
}
