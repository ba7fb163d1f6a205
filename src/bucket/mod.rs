//! Token-bucket algorithm, concurrency guard and engine.

mod engine;
mod guard;
mod policy;

pub use engine::TokenBucket;
pub(crate) use engine::take_from;
pub use guard::{KeyGuard, DEFAULT_SHARDS};
pub use policy::{BucketState, Decision, Policy};
