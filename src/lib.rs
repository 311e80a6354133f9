pub mod actor;
pub mod config;
pub mod fleet;
pub mod server;
pub mod shutdown;
pub mod stats;
