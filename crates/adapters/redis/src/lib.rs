//! tiergate-adapter-redis - Redis 共享缓存层（L2）

mod config;
mod connection;
mod tier;

pub use config::*;
pub use connection::*;
pub use tier::*;
