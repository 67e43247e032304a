//! tiergate-adapter-postgres - PostgreSQL 持久缓存层（L3）

mod connection;
mod schema;
mod tier;

pub use connection::*;
pub use schema::*;
pub use tier::*;
