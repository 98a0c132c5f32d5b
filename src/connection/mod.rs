//! Connection management.

mod attempt;
mod backoff;
mod manager;
mod queue;
mod state;

pub use attempt::{AttemptFailedState, ConnectionAttempt};
pub use manager::{Connection, ConnectionManager};
pub use queue::{MessageQueue, PendingAcks, QueuedMessage};
pub use state::{ConnectionState, ConnectionStateChange};
