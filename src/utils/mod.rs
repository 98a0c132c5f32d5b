//! Small shared utilities.

pub mod timers;

pub use timers::CancellableTimer;
