//! Event handling infrastructure.
//!
//! A [`HandlerRegistry`] stores listeners under string keys with stable
//! numeric ids; an [`EventDispatcher`] wraps one and emits events to global
//! listeners first, then keyed ones. Both are generic over the event payload,
//! so the same machinery backs connection state changes, channel state
//! changes, message subscriptions and presence subscriptions.

pub mod dispatcher;
pub mod registry;

pub use dispatcher::EventDispatcher;
pub use registry::{Handler, HandlerFn, HandlerRegistry};
