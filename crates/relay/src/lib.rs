pub mod broker;
pub mod rules;

mod pool;
mod tunnel;

use std::time::Duration;

pub use crate::{
    broker::Broker,
    rules::RuleTable,
    tunnel::{FaultSide, TransportError},
};

/// Size of one socket read. It doubles as the request boundary: a read
/// that returns fewer bytes than this ends the client to backend pump.
pub const CHUNK_SIZE: usize = 1024;

/// Quiet period on the backend side that ends one response.
pub const RESPONSE_END: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The broker cannot start without at least one forwarding rule.
    #[error("rule table is empty")]
    EmptyRuleTable,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
