//! ports - 抽象 trait 层
//!
//! 定义缓存层依赖的外部存储与上游生成器接口

mod cache;
mod generator;

pub use cache::*;
pub use generator::*;
