//! 测试工具
//!
//! 提供仓储接口的内存实现和测试数据构建器，单元测试不需要真实数据库。

pub mod builders;
pub mod mocks;

pub use builders::*;
pub use mocks::*;
