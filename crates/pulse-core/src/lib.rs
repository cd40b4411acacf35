pub mod config;
pub mod conversion;
pub mod error;
pub mod event;
pub mod funnel;
pub mod goal;
pub mod matcher;
pub mod queue;
pub mod session;
pub mod shard;
pub mod store;
