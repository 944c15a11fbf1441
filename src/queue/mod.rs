//! Durable queue of mutating requests that failed at the network layer,
//! replayed when connectivity returns.

mod store;
mod types;

pub use store::RequestQueue;
pub use types::{QueuedBody, QueuedRequest, ReplayReport};
