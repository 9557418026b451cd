//! holiday-bus - cross-replica change notifications
//!
//! Every replica of the holiday service publishes holiday-association
//! changes to a shared fanout exchange and consumes them back through its
//! own per-domain queues, so that each replica learns about writes made
//! anywhere in the fleet.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod replica;
pub mod utils;

#[cfg(all(test, feature = "memory"))]
pub(crate) mod test_utils;
