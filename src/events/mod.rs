//! # Event System
//!
//! Typed, in-process event streams exposed by each component.

pub mod publisher;

pub use publisher::{EventBus, DEFAULT_EVENT_CAPACITY};
