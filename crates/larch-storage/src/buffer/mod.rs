//! The buffer pool.
//!
//! Pages are cached in a fixed array of frames. Consumers fix a page in
//! shared, update, or exclusive latch mode and receive a [`FixHandle`]
//! that releases the latch and the pin on every exit path. Before a
//! dirty page is written back, the log is flushed up to the page's LSN.

pub mod frame;
pub mod latch;
pub mod pool;

pub use latch::{FixHandle, LatchMode};
pub use pool::{BufferPool, BufferPoolConfig};
