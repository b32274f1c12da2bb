//! # Corral Engine
//!
//! Stampede-resistant read-through coordination over an abstract cache
//! backend: a keyed lock pool guarantees at-most-one in-flight recomputation
//! per key, while the engine layers stale-while-revalidate, early refresh,
//! expiration jitter, and bounded-wait fallbacks on top.

mod bulk;
mod engine;
mod lock_pool;
mod planner;

pub use engine::Corral;
pub use lock_pool::{KeyedLockPool, RentedLock};
