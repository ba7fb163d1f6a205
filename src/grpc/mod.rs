//! gRPC services: the shared bucket store and the admission gate.

mod gate;
pub mod proto;
mod server;
mod store_service;

pub use gate::GateService;
pub use server::GrpcServer;
pub use store_service::BucketStoreService;

use tonic::{Code, Status};

use crate::error::TollgateError;

// Service stubs generated by build.rs
include!(concat!(env!("OUT_DIR"), "/tollgate.v1.BucketStore.rs"));
include!(concat!(env!("OUT_DIR"), "/tollgate.v1.Gate.rs"));

pub use bucket_store_client::BucketStoreClient;
pub use bucket_store_server::BucketStoreServer;
pub use gate_client::GateClient;
pub use gate_server::GateServer;

/// Metadata key carrying the offending token count of an invalid bucket.
pub(crate) const TOKENS_METADATA: &str = "tollgate-tokens";

/// Map an error onto the status returned to a gRPC caller.
pub(crate) fn status_from_error(err: &TollgateError) -> Status {
    match err {
        TollgateError::InvalidArgument(msg) => Status::invalid_argument(msg.clone()),
        TollgateError::StoreTimeout(msg) => Status::deadline_exceeded(msg.clone()),
        TollgateError::StoreUnavailable(msg) => Status::unavailable(msg.clone()),
        TollgateError::InvalidState { tokens, .. } => {
            let mut status = Status::failed_precondition(err.to_string());
            status.metadata_mut().insert(TOKENS_METADATA, (*tokens).into());
            status
        }
        other => Status::internal(other.to_string()),
    }
}

/// Map a status received from the bucket store back onto an error.
pub(crate) fn error_from_status(status: Status, key: &str, capacity: i64) -> TollgateError {
    match status.code() {
        Code::InvalidArgument => TollgateError::InvalidArgument(status.message().to_string()),
        Code::DeadlineExceeded => TollgateError::StoreTimeout(status.message().to_string()),
        Code::FailedPrecondition => {
            let tokens = status
                .metadata()
                .get(TOKENS_METADATA)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1);
            TollgateError::InvalidState {
                key: key.to_string(),
                tokens,
                capacity,
            }
        }
        code => TollgateError::StoreUnavailable(format!("{:?}: {}", code, status.message())),
    }
}
