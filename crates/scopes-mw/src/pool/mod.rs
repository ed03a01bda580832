//! Worker pools for inbound dispatch and outgoing invocations

mod thread_pool;

pub use thread_pool::{TaskHandle, ThreadPool};
