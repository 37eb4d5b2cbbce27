/// Physical-memory discovery and pooling.
pub mod pool;
pub mod providers;
pub mod range;

#[cfg(test)]
mod tests;

pub use pool::PhysMemPool;
pub use range::{MemoryRange, RangeFlags, ONE_MB, PAGE_SIZE, SIXTEEN_MB};
