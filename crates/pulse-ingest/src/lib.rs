pub mod batch_writer;
pub mod coalescer;
pub mod consumer;
pub mod context;
pub mod detached;
pub mod error;
pub mod pipeline;
pub mod producer;
pub mod retry;
pub mod worker_pool;
