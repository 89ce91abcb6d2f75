pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod queue;
pub mod server;
pub mod upstream;
