//! Messages of the `tollgate.v1` gRPC package.

/// Read one bucket.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetRequest {
    #[prost(string, tag = "1")]
    pub key: String,
}

/// A bucket record; `last_refill == 0` when the key is unknown.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetResponse {
    #[prost(int64, tag = "1")]
    pub tokens: i64,
    #[prost(int64, tag = "2")]
    pub last_refill: i64,
}

/// Overwrite one bucket.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SetRequest {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(int64, tag = "2")]
    pub tokens: i64,
    #[prost(int64, tag = "3")]
    pub last_refill: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SetResponse {}

/// Refill and conditionally deduct on the store side.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TakeRequest {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(int64, tag = "2")]
    pub cost: i64,
    /// Caller clock, nanoseconds since the Unix epoch
    #[prost(int64, tag = "3")]
    pub now: i64,
    #[prost(double, tag = "4")]
    pub rate: f64,
    #[prost(int64, tag = "5")]
    pub capacity: i64,
}

/// The decision and the state persisted with it.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TakeResponse {
    #[prost(bool, tag = "1")]
    pub admitted: bool,
    #[prost(int64, tag = "2")]
    pub tokens: i64,
    #[prost(int64, tag = "3")]
    pub last_refill: i64,
}

/// Ask whether a caller may proceed.
///
/// Empty identity fields fall back to the API key header and peer address of
/// the RPC itself. A zero cost means the configured per-request cost.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckRequest {
    #[prost(string, tag = "1")]
    pub api_key: String,
    #[prost(string, tag = "2")]
    pub client_addr: String,
    #[prost(int64, tag = "3")]
    pub cost: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CheckResponse {
    #[prost(bool, tag = "1")]
    pub admitted: bool,
    #[prost(int64, tag = "2")]
    pub remaining: i64,
    /// Unset when admitted or when waiting cannot help
    #[prost(message, optional, tag = "3")]
    pub retry_after: Option<prost_types::Duration>,
}
