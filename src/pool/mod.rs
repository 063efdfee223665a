//! Memory recycling primitives.
//!
//! Everything in this module is single-threaded by construction: each worker
//! owns its own buffer pool, object pool, and the arenas of the connections
//! it runs. Nothing here takes a lock.

pub mod arena;
pub mod buffer;
pub mod object;

pub use arena::Arena;
pub use buffer::{Bucket, Buffer, BufferPool};
pub use object::ObjectPool;
