pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod messaging;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

pub use error::{GridError, Result};
pub use node::{GridNode, NodeContext, PendingJob};
