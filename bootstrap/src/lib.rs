//! tiergate-bootstrap - 可靠性层组装
//!
//! 从配置建立各缓存层、断路器与重试执行器，并提供带缓存的生成入口

mod generator;
mod infrastructure;
mod layer;
mod metrics;
mod runtime;

pub use generator::*;
pub use infrastructure::*;
pub use layer::*;
pub use metrics::*;
pub use runtime::*;
