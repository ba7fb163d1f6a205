//! Admission gate service implementation.

use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{debug, instrument};

use super::gate_server::Gate;
use super::proto::{CheckRequest, CheckResponse};
use super::status_from_error;
use crate::admission::{Admission, Caller, Verdict};
use crate::clock::{Clock, SystemClock};
use crate::store::Store;

/// Implementation of the `tollgate.v1.Gate` gRPC interface.
pub struct GateService<S, C = SystemClock> {
    admission: Arc<Admission<S, C>>,
    api_key_header: String,
}

impl<S, C> GateService<S, C> {
    /// Create a gate answering with `admission`.
    ///
    /// `api_key_header` names the metadata entry read when a check carries no
    /// API key of its own.
    pub fn new(admission: Arc<Admission<S, C>>, api_key_header: impl Into<String>) -> Self {
        Self {
            admission,
            api_key_header: api_key_header.into(),
        }
    }
}

/// Wire form of a retry hint, saturating hints too long for protobuf.
fn retry_hint(wait: Duration) -> prost_types::Duration {
    prost_types::Duration::try_from(wait).unwrap_or(prost_types::Duration {
        seconds: i64::MAX,
        nanos: 999_999_999,
    })
}

#[tonic::async_trait]
impl<S, C> Gate for GateService<S, C>
where
    S: Store + 'static,
    C: Clock + 'static,
{
    /// Decide whether the described caller may proceed.
    ///
    /// A rate-limited caller gets an OK status with `admitted == false`.
    /// Limiter failures are returned as error statuses so that callers
    /// cannot mistake them for either answer.
    #[instrument(
        skip(self, request),
        fields(cost = request.get_ref().cost)
    )]
    async fn check(&self, request: Request<CheckRequest>) -> Result<Response<CheckResponse>, Status> {
        let peer = Caller::from_request(&request, &self.api_key_header);
        let req = request.into_inner();

        let caller = Caller::new(Some(req.api_key), Some(req.client_addr)).or(peer);
        let cost = (req.cost != 0).then_some(req.cost);

        debug!(caller = ?caller, cost = ?cost, "Processing admission check");

        let response = match self.admission.check(&caller, cost).await {
            Verdict::Proceed { remaining } => CheckResponse {
                admitted: true,
                remaining,
                retry_after: None,
            },
            Verdict::Limited {
                remaining,
                retry_after,
            } => CheckResponse {
                admitted: false,
                remaining,
                retry_after: retry_after.map(retry_hint),
            },
            Verdict::Failed(e) => return Err(status_from_error(&e)),
        };

        debug!(admitted = response.admitted, remaining = response.remaining, "Admission decision made");

        Ok(Response::new(response))
    }
}
